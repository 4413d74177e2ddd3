//! Document arena: structure, mutation, topology queries.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::node::{AttributeValue, ComponentId, ComponentNode, NewComponent, Placement};
use crate::error::{EngineError, Result};

/// The live component tree.
///
/// Components live in generational slots. Composites expose their
/// replacements in place of themselves to every "expanded" query
/// ([`expanded_children`](Self::expanded_children),
/// [`preorder`](Self::preorder), ...). Attribute components hang off their
/// owner but are never children.
#[derive(Debug, Default)]
pub struct Document {
    slots: Vec<Option<ComponentNode>>,
    generations: Vec<u32>,
    free_list: Vec<usize>,
    names: HashMap<Arc<str>, ComponentId>,
    roots: Vec<ComponentId>,
    auto_names: u64,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentNode> {
        self.slots
            .get(id.slot())
            .and_then(|s| s.as_ref())
            .filter(|n| n.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ComponentId) -> Option<&mut ComponentNode> {
        self.slots
            .get_mut(id.slot())
            .and_then(|s| s.as_mut())
            .filter(|n| n.id == id)
    }

    pub(crate) fn node(&self, id: ComponentId) -> Result<&ComponentNode> {
        self.get(id).ok_or(EngineError::UnknownComponent(id))
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.get(id).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<ComponentId> {
        self.names.get(name).copied()
    }

    pub fn roots(&self) -> &[ComponentId] {
        &self.roots
    }

    /// Insert a component. The caller has already checked the type exists.
    pub(crate) fn insert(&mut self, spec: NewComponent) -> Result<ComponentId> {
        let name = match spec.name {
            Some(name) => {
                if self.names.contains_key(&name) {
                    return Err(EngineError::DuplicateName(name.to_string()));
                }
                name
            }
            None => self.generate_name(&spec.component_type),
        };

        match &spec.placement {
            Placement::Root => {}
            Placement::Child(owner) | Placement::Replacement(owner) | Placement::Attribute(owner, _) => {
                self.node(*owner)?;
            }
        }

        let slot = match self.free_list.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        let id = ComponentId::new(slot as u32, self.generations[slot]);

        let (parent, attribute_of) = match &spec.placement {
            Placement::Root => (None, None),
            Placement::Child(p) | Placement::Replacement(p) => (Some(*p), None),
            Placement::Attribute(owner, attr) => (Some(*owner), Some((*owner, attr.clone()))),
        };

        self.slots[slot] = Some(ComponentNode {
            id,
            component_type: spec.component_type,
            name: name.clone(),
            parent,
            children: Vec::new(),
            replacements: None,
            attributes: spec.attributes,
            attribute_of,
            copy_source: spec.copy_source,
        });
        self.names.insert(name, id);

        match spec.placement {
            Placement::Root => self.roots.push(id),
            Placement::Child(p) => {
                if let Some(parent) = self.get_mut(p) {
                    parent.children.push(id);
                }
            }
            Placement::Replacement(p) => {
                if let Some(parent) = self.get_mut(p) {
                    parent.replacements.get_or_insert_with(Vec::new).push(id);
                }
            }
            Placement::Attribute(owner, attr) => {
                if let Some(owner) = self.get_mut(owner) {
                    owner.attributes.insert(attr, AttributeValue::Component(id));
                }
            }
        }

        Ok(id)
    }

    fn generate_name(&mut self, component_type: &str) -> Arc<str> {
        loop {
            self.auto_names += 1;
            let candidate: Arc<str> = format!("__{component_type}{}", self.auto_names).into();
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Remove a component and everything it owns (children, replacements,
    /// attribute components). Returns the removed nodes, root first.
    pub(crate) fn remove(&mut self, id: ComponentId) -> Result<Vec<ComponentNode>> {
        let node = self.node(id)?;
        let parent = node.parent;
        let attribute_of = node.attribute_of.clone();

        if let Some(parent_id) = parent {
            if let Some(parent) = self.get_mut(parent_id) {
                parent.children.retain(|c| *c != id);
                if let Some(replacements) = parent.replacements.as_mut() {
                    replacements.retain(|c| *c != id);
                }
                if let Some((_, attr)) = &attribute_of {
                    if parent.attributes.get(attr) == Some(&AttributeValue::Component(id)) {
                        parent.attributes.shift_remove(attr);
                    }
                }
            }
        } else {
            self.roots.retain(|r| *r != id);
        }

        let mut removed = Vec::new();
        for victim in self.owned_subtree(id) {
            let slot = victim.slot();
            if let Some(node) = self.slots[slot].take() {
                self.names.remove(&node.name);
                self.generations[slot] = self.generations[slot].wrapping_add(1);
                self.free_list.push(slot);
                removed.push(node);
            }
        }
        Ok(removed)
    }

    pub(crate) fn set_attribute(
        &mut self,
        id: ComponentId,
        name: Arc<str>,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>> {
        let node = self.get_mut(id).ok_or(EngineError::UnknownComponent(id))?;
        Ok(node.attributes.insert(name, value))
    }

    /// Replace the replacement list of a composite. Every listed component
    /// must already be owned by the composite. Returns replacements that
    /// were dropped from the list.
    pub(crate) fn set_replacements(
        &mut self,
        composite: ComponentId,
        replacements: Vec<ComponentId>,
    ) -> Result<Vec<ComponentId>> {
        for r in &replacements {
            let node = self.node(*r)?;
            if node.parent != Some(composite) {
                return Err(EngineError::UnknownComponent(*r));
            }
        }
        let node = self
            .get_mut(composite)
            .ok_or(EngineError::UnknownComponent(composite))?;
        let previous = node.replacements.replace(replacements.clone()).unwrap_or_default();
        Ok(previous
            .into_iter()
            .filter(|p| !replacements.contains(p))
            .collect())
    }

    /// Every component owned by `id`, including itself, in preorder.
    /// Follows children, replacements and attribute components.
    pub fn owned_subtree(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            out.push(current);
            let mut owned: Vec<ComponentId> = node.children.clone();
            if let Some(replacements) = &node.replacements {
                owned.extend(replacements.iter().copied());
            }
            owned.extend(node.attributes.values().filter_map(|a| match a {
                AttributeValue::Component(c) => Some(*c),
                _ => None,
            }));
            stack.extend(owned.into_iter().rev());
        }
        out
    }

    /// Children of `id` with composites replaced by their replacements.
    ///
    /// A composite whose replacements have not been created yet is listed
    /// as itself.
    pub fn expanded_children(&self, id: ComponentId) -> Vec<ComponentId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for child in &node.children {
            self.expand_into(*child, &mut out);
        }
        out
    }

    fn expand_into(&self, id: ComponentId, out: &mut Vec<ComponentId>) {
        match self.get(id).and_then(|n| n.replacements.as_ref()) {
            Some(replacements) => {
                for r in replacements {
                    self.expand_into(*r, out);
                }
            }
            None => out.push(id),
        }
    }

    /// The list `id` counts as a member of: its composite's replacements if
    /// it is a replacement, else its parent's expanded children, else the
    /// expanded roots.
    pub fn siblings(&self, id: ComponentId) -> Vec<ComponentId> {
        let Some(node) = self.get(id) else {
            return Vec::new();
        };
        match node.parent.and_then(|p| self.get(p)) {
            Some(parent) if node.is_replacement_of(parent) => {
                let mut out = Vec::new();
                for r in parent.replacements.iter().flatten() {
                    self.expand_into(*r, &mut out);
                }
                out
            }
            Some(parent) => self.expanded_children(parent.id),
            None => {
                let mut out = Vec::new();
                for r in &self.roots {
                    self.expand_into(*r, &mut out);
                }
                out
            }
        }
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: ComponentId) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent);
        while let Some(p) = current {
            out.push(p);
            current = self.get(p).and_then(|n| n.parent);
        }
        out
    }

    /// Expanded descendants of `id` in preorder, excluding `id`.
    ///
    /// With `skip_copies`, copies and everything below them are left out.
    pub fn descendants(&self, id: ComponentId, skip_copies: bool) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut stack: Vec<ComponentId> = self.expanded_children(id).into_iter().rev().collect();
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            if skip_copies && node.is_copy() {
                continue;
            }
            out.push(current);
            stack.extend(self.expanded_children(current).into_iter().rev());
        }
        out
    }

    /// Whole-document expanded preorder.
    pub fn preorder(&self) -> Vec<ComponentId> {
        let mut out = Vec::new();
        let mut roots = Vec::new();
        for r in &self.roots {
            self.expand_into(*r, &mut roots);
        }
        for root in roots {
            out.push(root);
            out.extend(self.descendants(root, false));
        }
        out
    }

    /// Names of all live components with their ids, in slot order.
    pub fn names(&self) -> IndexMap<Arc<str>, ComponentId> {
        self.slots
            .iter()
            .flatten()
            .map(|n| (n.name.clone(), n.id))
            .collect()
    }
}
