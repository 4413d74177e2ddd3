//! Component Nodes
//!
//! This module defines the identity and per-instance data of a component in
//! the document arena.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::value::Value;

/// Stable identifier for a component instance.
///
/// A slot index plus the generation of that slot. A slot freed by removing
/// a component and later reused yields a different `ComponentId`, so stale
/// identifiers held by records or callers never alias a new component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    slot: u32,
    generation: u32,
}

impl ComponentId {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.slot, self.generation)
    }
}

/// How an attribute was specified on a component.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// A literal such as `fixed="true"`.
    Primitive(Value),
    /// The attribute was authored as a component, e.g. a math expression.
    Component(ComponentId),
    /// Names of other components the attribute refers to.
    References(Vec<String>),
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        Self::Primitive(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Primitive(Value::Bool(b))
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        Self::Primitive(Value::Number(n))
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Primitive(Value::String(s.to_string()))
    }
}

/// Where a new component hangs in the document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Placement {
    Root,
    Child(ComponentId),
    Replacement(ComponentId),
    Attribute(ComponentId, Arc<str>),
}

/// Description of a component to add to a document.
///
/// # Example
///
/// ```rust,ignore
/// let m = engine.add_component(
///     NewComponent::new("math").named("m1").child_of(section).attribute("fixed", true),
/// )?;
/// ```
#[derive(Debug, Clone)]
pub struct NewComponent {
    pub(crate) component_type: Arc<str>,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) placement: Placement,
    pub(crate) attributes: IndexMap<Arc<str>, AttributeValue>,
    pub(crate) copy_source: Option<ComponentId>,
}

impl NewComponent {
    pub fn new(component_type: impl Into<Arc<str>>) -> Self {
        Self {
            component_type: component_type.into(),
            name: None,
            placement: Placement::Root,
            attributes: IndexMap::new(),
            copy_source: None,
        }
    }

    /// Give the component a document-unique name. Unnamed components get a
    /// generated one.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append as the last child of `parent`.
    pub fn child_of(mut self, parent: ComponentId) -> Self {
        self.placement = Placement::Child(parent);
        self
    }

    /// Append to the replacement list of the composite `composite`.
    pub fn replacement_of(mut self, composite: ComponentId) -> Self {
        self.placement = Placement::Replacement(composite);
        self
    }

    /// Install as the component-valued attribute `attribute` of `owner`.
    pub fn attribute_of(mut self, owner: ComponentId, attribute: impl Into<Arc<str>>) -> Self {
        self.placement = Placement::Attribute(owner, attribute.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<Arc<str>>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Mark the component as a copy produced from `source`.
    pub fn copy_of(mut self, source: ComponentId) -> Self {
        self.copy_source = Some(source);
        self
    }
}

/// A live component instance in the document arena.
#[derive(Debug, Clone)]
pub struct ComponentNode {
    pub(crate) id: ComponentId,
    pub(crate) component_type: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) parent: Option<ComponentId>,
    pub(crate) children: Vec<ComponentId>,
    /// `Some` for composites once their replacements have been created.
    pub(crate) replacements: Option<Vec<ComponentId>>,
    pub(crate) attributes: IndexMap<Arc<str>, AttributeValue>,
    /// Set on attribute components: the owner and attribute name.
    pub(crate) attribute_of: Option<(ComponentId, Arc<str>)>,
    pub(crate) copy_source: Option<ComponentId>,
}

impl ComponentNode {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn component_type(&self) -> &Arc<str> {
        &self.component_type
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn parent(&self) -> Option<ComponentId> {
        self.parent
    }

    pub fn children(&self) -> &[ComponentId] {
        &self.children
    }

    pub fn replacements(&self) -> Option<&[ComponentId]> {
        self.replacements.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &IndexMap<Arc<str>, AttributeValue> {
        &self.attributes
    }

    pub fn copy_source(&self) -> Option<ComponentId> {
        self.copy_source
    }

    pub fn is_copy(&self) -> bool {
        self.copy_source.is_some()
    }

    pub(crate) fn is_replacement_of(&self, composite: &ComponentNode) -> bool {
        composite
            .replacements
            .as_ref()
            .is_some_and(|r| r.contains(&self.id))
    }
}
