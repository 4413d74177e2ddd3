//! Dependency Descriptor Resolver
//!
//! Turns the declarative [`Dependencies`] of one state variable into
//! concrete (component, variable) references against the current document.
//!
//! # How Resolution Works
//!
//! Each [`DependencySpec`] is resolved independently:
//!
//! - `stateVariable` looks up its target component (itself, by name, or by
//!   id) and canonicalizes the variable name through the target's aliases.
//! - Structural kinds (`child`, `parent`, `ancestor`, `descendant`,
//!   `replacements`, attribute components and references) walk the
//!   document's expanded topology and pick the requested variables of each
//!   matched component.
//! - `value`, `counter`, `countAmongSiblings` and `attributePrimitive`
//!   resolve to literals; their value is fixed by the topology alone.
//!
//! While walking, the resolver records what it looked at as [`Watch`]es.
//! A later structural change that touches a watched component or name
//! throws the cached resolution away.
//!
//! Resolution is read-only and deterministic: the same dependencies
//! against an unchanged document give an identical [`Resolution`].

use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::component::{ComponentClass, ComponentInfo, Dependencies, DependencySpec, MatchOptions, Registry, Target};
use crate::document::{AttributeValue, ComponentId, ComponentNode, Document};
use crate::store::VarKey;
use crate::value::Value;

/// A piece of document topology a resolution observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Watch {
    /// Structure at, above or below this component.
    Component(ComponentId),
    /// Which component (if any) carries this name.
    Name(Arc<str>),
    /// Anything anywhere in the document.
    Document,
}

/// One matched component and the keys of its requested variables, under
/// the names the dependency asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedComponent {
    pub info: ComponentInfo,
    pub variables: Vec<(Arc<str>, VarKey)>,
}

/// What a single dependency resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Variable(VarKey),
    Literal(Value),
    /// An optional dependency that matched nothing.
    Missing,
    Component(Option<MatchedComponent>),
    Components(Vec<MatchedComponent>),
}

/// The resolved dependencies of one state variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    entries: IndexMap<Arc<str>, Resolved>,
    watches: Vec<Watch>,
    unresolved: Option<String>,
}

impl Resolution {
    pub fn get(&self, name: &str) -> Option<&Resolved> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Resolved)> {
        self.entries.iter()
    }

    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    /// Why a required dependency could not be matched, if one could not.
    pub fn unresolved(&self) -> Option<&str> {
        self.unresolved.as_deref()
    }

    /// Every referenced variable, deduplicated, in declaration order.
    pub fn keys(&self) -> SmallVec<[VarKey; 4]> {
        let mut out: SmallVec<[VarKey; 4]> = SmallVec::new();
        let mut push = |key: &VarKey| {
            if !out.contains(key) {
                out.push(key.clone());
            }
        };
        for resolved in self.entries.values() {
            match resolved {
                Resolved::Variable(key) => push(key),
                Resolved::Component(Some(matched)) => matched.variables.iter().for_each(|(_, k)| push(k)),
                Resolved::Components(list) => list
                    .iter()
                    .flat_map(|m| m.variables.iter())
                    .for_each(|(_, k)| push(k)),
                Resolved::Literal(_) | Resolved::Missing | Resolved::Component(None) => {}
            }
        }
        out
    }
}

/// Resolve `dependencies` declared by `component`.
///
/// Never fails outright: a required dependency that cannot be matched is
/// reported through [`Resolution::unresolved`], and the watches gathered
/// so far are still returned so the caller can retry once the document
/// changes.
pub fn resolve(
    document: &Document,
    registry: &Registry,
    component: ComponentId,
    dependencies: &Dependencies,
) -> Resolution {
    let mut resolver = Resolver {
        document,
        registry,
        component,
        watches: Vec::new(),
    };
    let mut entries = IndexMap::new();
    let mut unresolved = None;
    for (name, spec) in dependencies.iter() {
        match resolver.resolve_one(spec) {
            Ok(resolved) => {
                entries.insert(name.clone(), resolved);
            }
            Err(reason) => {
                unresolved.get_or_insert_with(|| format!("dependency `{name}`: {reason}"));
            }
        }
    }
    Resolution {
        entries,
        watches: resolver.watches,
        unresolved,
    }
}

/// Identity of a live component as definitions see it.
pub(crate) fn component_info(node: &ComponentNode) -> ComponentInfo {
    ComponentInfo {
        id: node.id(),
        name: node.name().clone(),
        component_type: node.component_type().clone(),
    }
}

struct Resolver<'a> {
    document: &'a Document,
    registry: &'a Registry,
    component: ComponentId,
    watches: Vec<Watch>,
}

impl<'a> Resolver<'a> {
    fn watch(&mut self, watch: Watch) {
        if !self.watches.contains(&watch) {
            self.watches.push(watch);
        }
    }

    fn node(&self, id: ComponentId) -> Result<&'a ComponentNode, String> {
        self.document
            .get(id)
            .ok_or_else(|| format!("component {id} does not exist"))
    }

    fn class(&self, id: ComponentId) -> Result<&'a Arc<ComponentClass>, String> {
        let node = self.node(id)?;
        self.registry
            .get(node.component_type())
            .ok_or_else(|| format!("unknown component type `{}`", node.component_type()))
    }

    fn type_matches(&self, id: ComponentId, wanted: &[Arc<str>], options: MatchOptions) -> bool {
        if wanted.is_empty() {
            return true;
        }
        let Some(node) = self.document.get(id) else {
            return false;
        };
        wanted.iter().any(|t| {
            self.registry
                .matches_type(node.component_type(), t, options.include_inherited_component_types)
        })
    }

    fn match_variables(
        &self,
        id: ComponentId,
        variables: &[Arc<str>],
        options: MatchOptions,
    ) -> Result<MatchedComponent, String> {
        let node = self.node(id)?;
        let class = self.class(id)?;
        let mut matched = Vec::with_capacity(variables.len());
        for variable in variables {
            match class.canonical(variable) {
                Some(canonical) => matched.push((variable.clone(), VarKey(id, canonical))),
                None if options.variables_optional => {}
                None => return Err(format!("`{}` has no state variable `{variable}`", node.name())),
            }
        }
        Ok(MatchedComponent {
            info: component_info(node),
            variables: matched,
        })
    }

    fn variable_of(&self, id: ComponentId, variable: &str, optional: bool) -> Result<Resolved, String> {
        match self.class(id)?.canonical(variable) {
            Some(canonical) => Ok(Resolved::Variable(VarKey(id, canonical))),
            None if optional => Ok(Resolved::Missing),
            None => Err(format!(
                "`{}` has no state variable `{variable}`",
                self.node(id)?.name()
            )),
        }
    }

    fn resolve_one(&mut self, spec: &DependencySpec) -> Result<Resolved, String> {
        let this = self.component;
        let node = self.node(this)?;

        match spec {
            DependencySpec::Value(value) => Ok(Resolved::Literal(value.clone())),

            DependencySpec::StateVariable {
                target,
                variable,
                optional,
            } => {
                let target = match target {
                    Target::This => this,
                    Target::Id(id) => {
                        if !self.document.contains(*id) {
                            return if *optional {
                                Ok(Resolved::Missing)
                            } else {
                                Err(format!("component {id} does not exist"))
                            };
                        }
                        *id
                    }
                    Target::Named(name) => {
                        self.watch(Watch::Name(name.clone()));
                        match self.document.lookup(name) {
                            Some(id) => id,
                            None if *optional => return Ok(Resolved::Missing),
                            None => return Err(format!("no component named `{name}`")),
                        }
                    }
                };
                self.variable_of(target, variable, *optional)
            }

            DependencySpec::Child {
                child_groups,
                variables,
                options,
            } => {
                self.watch(Watch::Component(this));
                let mut allowed: Vec<Arc<str>> = Vec::new();
                if !child_groups.is_empty() {
                    let class = self.class(this)?;
                    for group in child_groups {
                        let group = class
                            .child_group(group)
                            .ok_or_else(|| format!("`{}` has no child group `{group}`", class.name()))?;
                        allowed.extend(group.component_types.iter().cloned());
                    }
                    // Named groups that accept nothing match nothing.
                    if allowed.is_empty() {
                        return Ok(Resolved::Components(Vec::new()));
                    }
                }
                let mut matched = Vec::new();
                for child in self.document.expanded_children(this) {
                    if self.type_matches(child, &allowed, *options) {
                        matched.push(self.match_variables(child, variables, *options)?);
                    }
                }
                Ok(Resolved::Components(matched))
            }

            DependencySpec::Parent { variables, options } => {
                self.watch(Watch::Component(this));
                match node.parent() {
                    Some(parent) => Ok(Resolved::Component(Some(
                        self.match_variables(parent, variables, *options)?,
                    ))),
                    None => Ok(Resolved::Component(None)),
                }
            }

            DependencySpec::Ancestor {
                component_type,
                variables,
                options,
            } => {
                self.watch(Watch::Component(this));
                let wanted: Vec<Arc<str>> = component_type.iter().cloned().collect();
                let found = self
                    .document
                    .ancestors(this)
                    .into_iter()
                    .find(|a| self.type_matches(*a, &wanted, *options));
                match found {
                    Some(ancestor) => Ok(Resolved::Component(Some(
                        self.match_variables(ancestor, variables, *options)?,
                    ))),
                    None => Ok(Resolved::Component(None)),
                }
            }

            DependencySpec::Descendant {
                component_types,
                variables,
                options,
            } => {
                self.watch(Watch::Component(this));
                let mut matched = Vec::new();
                for id in self.document.descendants(this, options.skip_copies) {
                    if self.type_matches(id, component_types, *options) {
                        matched.push(self.match_variables(id, variables, *options)?);
                    }
                }
                Ok(Resolved::Components(matched))
            }

            DependencySpec::AttributeComponent {
                attribute,
                variables,
                options,
            } => {
                self.watch(Watch::Component(this));
                match node.attribute(attribute) {
                    Some(AttributeValue::Component(id)) => Ok(Resolved::Component(Some(
                        self.match_variables(*id, variables, *options)?,
                    ))),
                    _ => Ok(Resolved::Component(None)),
                }
            }

            DependencySpec::AttributePrimitive { attribute } => {
                self.watch(Watch::Component(this));
                match node.attribute(attribute) {
                    Some(AttributeValue::Primitive(value)) => Ok(Resolved::Literal(value.clone())),
                    _ => Ok(Resolved::Missing),
                }
            }

            DependencySpec::AttributeRefResolutions {
                attribute,
                variables,
                options,
            } => {
                self.watch(Watch::Component(this));
                let Some(AttributeValue::References(names)) = node.attribute(attribute) else {
                    return Ok(Resolved::Components(Vec::new()));
                };
                let mut matched = Vec::new();
                for name in names {
                    let name: Arc<str> = Arc::from(name.as_str());
                    self.watch(Watch::Name(name.clone()));
                    match self.document.lookup(&name) {
                        Some(id) => matched.push(self.match_variables(id, variables, *options)?),
                        None if options.variables_optional => {}
                        None => return Err(format!("reference `{name}` does not resolve")),
                    }
                }
                Ok(Resolved::Components(matched))
            }

            DependencySpec::Replacements { variables, options } => {
                self.watch(Watch::Component(this));
                let mut matched = Vec::new();
                for id in node.replacements().unwrap_or_default() {
                    matched.push(self.match_variables(*id, variables, *options)?);
                }
                Ok(Resolved::Components(matched))
            }

            DependencySpec::Counter {
                component_type,
                options,
            } => {
                self.watch(Watch::Document);
                let wanted = [component_type.clone()];
                let mut count = 0usize;
                for id in self.document.preorder() {
                    if self.type_matches(id, &wanted, *options) {
                        count += 1;
                    }
                    if id == this {
                        break;
                    }
                }
                Ok(Resolved::Literal(Value::Number(count as f64)))
            }

            DependencySpec::CountAmongSiblings {
                component_type,
                options,
            } => {
                match node.parent() {
                    Some(parent) => self.watch(Watch::Component(parent)),
                    None => self.watch(Watch::Document),
                }
                let wanted: Vec<Arc<str>> = component_type.iter().cloned().collect();
                let mut count = 0usize;
                for id in self.document.siblings(this) {
                    if self.type_matches(id, &wanted, *options) {
                        count += 1;
                    }
                    if id == this {
                        break;
                    }
                }
                Ok(Resolved::Literal(Value::Number(count as f64)))
            }

            DependencySpec::SourceCompositeStateVariable { variable, options } => {
                self.watch(Watch::Component(this));
                match node.copy_source().filter(|s| self.document.contains(*s)) {
                    Some(source) => self.variable_of(source, variable, options.variables_optional),
                    None if options.variables_optional => Ok(Resolved::Missing),
                    None => Err(format!("`{}` is not a copy of a live component", node.name())),
                }
            }
        }
    }
}
