//! Dependency specifications and the values they resolve to.
//!
//! A state variable declares what it needs as a map from a local name to a
//! [`DependencySpec`]. The resolver turns each spec into concrete
//! (component, variable) references, the forward evaluator fetches their
//! values, and the definition receives them as a [`DependencyValues`]
//! record keyed by the same local names.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::document::ComponentId;
use crate::error::DefinitionError;
use crate::value::Value;

/// Identity of a component as seen by definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: Arc<str>,
    pub component_type: Arc<str>,
}

/// Which component a `stateVariable` dependency reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The component declaring the dependency.
    This,
    /// A component looked up by its document name.
    Named(Arc<str>),
    /// A specific component instance.
    Id(ComponentId),
}

/// Policy knobs shared by the structural dependency kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// Matched components lacking a requested variable are kept, with that
    /// variable left out, instead of making the dependency unresolved.
    pub variables_optional: bool,
    /// Leave out copies (and their subtrees) when matching descendants.
    pub skip_copies: bool,
    /// Component-type filters also accept types that inherit from the
    /// named type.
    pub include_inherited_component_types: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            variables_optional: false,
            skip_copies: false,
            include_inherited_component_types: true,
        }
    }
}

/// A declarative description of one dependency.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencySpec {
    StateVariable {
        target: Target,
        variable: Arc<str>,
        optional: bool,
    },
    Child {
        child_groups: Vec<Arc<str>>,
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    Parent {
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    Ancestor {
        component_type: Option<Arc<str>>,
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    Descendant {
        component_types: Vec<Arc<str>>,
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    AttributeComponent {
        attribute: Arc<str>,
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    /// The literal value of an attribute, when it was not authored as a
    /// component.
    AttributePrimitive { attribute: Arc<str> },
    AttributeRefResolutions {
        attribute: Arc<str>,
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    /// The replacements of a composite.
    Replacements {
        variables: Vec<Arc<str>>,
        options: MatchOptions,
    },
    /// A closed-over literal.
    Value(Value),
    /// 1-based position of this component among all components of a type,
    /// in document order.
    Counter {
        component_type: Arc<str>,
        options: MatchOptions,
    },
    /// 1-based position among siblings, optionally only counting one type.
    CountAmongSiblings {
        component_type: Option<Arc<str>>,
        options: MatchOptions,
    },
    /// A variable of the component this one was copied from.
    SourceCompositeStateVariable {
        variable: Arc<str>,
        options: MatchOptions,
    },
}

fn names<I, S>(items: I) -> Vec<Arc<str>>
where
    I: IntoIterator<Item = S>,
    S: Into<Arc<str>>,
{
    items.into_iter().map(Into::into).collect()
}

impl DependencySpec {
    /// A variable of the declaring component.
    pub fn state_variable(variable: impl Into<Arc<str>>) -> Self {
        Self::StateVariable {
            target: Target::This,
            variable: variable.into(),
            optional: false,
        }
    }

    /// A variable of the component named `component`.
    pub fn of(component: impl Into<Arc<str>>, variable: impl Into<Arc<str>>) -> Self {
        Self::StateVariable {
            target: Target::Named(component.into()),
            variable: variable.into(),
            optional: false,
        }
    }

    pub fn of_id(component: ComponentId, variable: impl Into<Arc<str>>) -> Self {
        Self::StateVariable {
            target: Target::Id(component),
            variable: variable.into(),
            optional: false,
        }
    }

    pub fn child<G, V, S, T>(child_groups: G, variables: V) -> Self
    where
        G: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::Child {
            child_groups: names(child_groups),
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn parent<V, T>(variables: V) -> Self
    where
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::Parent {
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn ancestor<V, T>(component_type: Option<&str>, variables: V) -> Self
    where
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::Ancestor {
            component_type: component_type.map(Into::into),
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn descendant<C, S, V, T>(component_types: C, variables: V) -> Self
    where
        C: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::Descendant {
            component_types: names(component_types),
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn attribute_component<V, T>(attribute: impl Into<Arc<str>>, variables: V) -> Self
    where
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::AttributeComponent {
            attribute: attribute.into(),
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn attribute_primitive(attribute: impl Into<Arc<str>>) -> Self {
        Self::AttributePrimitive {
            attribute: attribute.into(),
        }
    }

    pub fn attribute_refs<V, T>(attribute: impl Into<Arc<str>>, variables: V) -> Self
    where
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::AttributeRefResolutions {
            attribute: attribute.into(),
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn replacements<V, T>(variables: V) -> Self
    where
        V: IntoIterator<Item = T>,
        T: Into<Arc<str>>,
    {
        Self::Replacements {
            variables: names(variables),
            options: MatchOptions::default(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn counter(component_type: impl Into<Arc<str>>) -> Self {
        Self::Counter {
            component_type: component_type.into(),
            options: MatchOptions::default(),
        }
    }

    pub fn count_among_siblings(component_type: Option<&str>) -> Self {
        Self::CountAmongSiblings {
            component_type: component_type.map(Into::into),
            options: MatchOptions::default(),
        }
    }

    pub fn source_composite(variable: impl Into<Arc<str>>) -> Self {
        Self::SourceCompositeStateVariable {
            variable: variable.into(),
            options: MatchOptions::default(),
        }
    }

    fn options_mut(&mut self) -> Option<&mut MatchOptions> {
        match self {
            Self::Child { options, .. }
            | Self::Parent { options, .. }
            | Self::Ancestor { options, .. }
            | Self::Descendant { options, .. }
            | Self::AttributeComponent { options, .. }
            | Self::AttributeRefResolutions { options, .. }
            | Self::Replacements { options, .. }
            | Self::Counter { options, .. }
            | Self::CountAmongSiblings { options, .. }
            | Self::SourceCompositeStateVariable { options, .. } => Some(options),
            Self::StateVariable { .. } | Self::AttributePrimitive { .. } | Self::Value(_) => None,
        }
    }

    /// Missing targets or variables yield an absent value instead of an
    /// unresolved variable.
    pub fn optional(mut self) -> Self {
        if let Self::StateVariable { optional, .. } = &mut self {
            *optional = true;
        }
        if let Some(options) = self.options_mut() {
            options.variables_optional = true;
        }
        self
    }

    pub fn skip_copies(mut self) -> Self {
        if let Some(options) = self.options_mut() {
            options.skip_copies = true;
        }
        self
    }

    /// Match component types exactly, ignoring inheritance.
    pub fn exact_types(mut self) -> Self {
        if let Some(options) = self.options_mut() {
            options.include_inherited_component_types = false;
        }
        self
    }

    /// Whether the resolution reads document topology (and so must be
    /// redone when the structure changes).
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::Value(_)
                | Self::StateVariable {
                    target: Target::This | Target::Id(_),
                    ..
                }
        )
    }
}

/// Declared dependencies of one state variable, keyed by local name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies(IndexMap<Arc<str>, DependencySpec>);

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<Arc<str>>, spec: DependencySpec) -> Self {
        self.0.insert(name.into(), spec);
        self
    }

    pub fn insert(&mut self, name: impl Into<Arc<str>>, spec: DependencySpec) {
        self.0.insert(name.into(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&DependencySpec> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &DependencySpec)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Values of the requested variables of one matched component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentValues {
    pub info: ComponentInfo,
    pub values: IndexMap<Arc<str>, Value>,
}

impl ComponentValues {
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.values.get(variable)
    }

    pub fn value(&self, variable: &str) -> Result<&Value, DefinitionError> {
        self.values
            .get(variable)
            .ok_or_else(|| DefinitionError::MissingDependency(format!("{}.{variable}", self.info.name)))
    }
}

/// A resolved dependency as delivered to a definition.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyValue {
    /// A single value: a state variable, literal, counter or attribute
    /// primitive. `used_default` is set when the producing variable fell
    /// back to its default.
    Value { value: Value, used_default: bool },
    /// An optional dependency that matched nothing.
    Missing,
    /// Single-component kinds: parent, ancestor, attribute component.
    Component(Option<ComponentValues>),
    /// Multi-component kinds: children, descendants, references,
    /// replacements.
    Components(Vec<ComponentValues>),
}

/// The typed record of dependency values a definition receives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyValues {
    entries: IndexMap<Arc<str>, DependencyValue>,
}

impl DependencyValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: Arc<str>, value: DependencyValue) {
        self.entries.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&DependencyValue> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &DependencyValue)> {
        self.entries.iter()
    }

    fn entry(&self, name: &str) -> Result<&DependencyValue, DefinitionError> {
        self.entries
            .get(name)
            .ok_or_else(|| DefinitionError::MissingDependency(name.to_string()))
    }

    /// A single value. Fails for component-shaped or missing dependencies.
    pub fn value(&self, name: &str) -> Result<&Value, DefinitionError> {
        match self.entry(name)? {
            DependencyValue::Value { value, .. } => Ok(value),
            DependencyValue::Missing => Err(DefinitionError::MissingDependency(name.to_string())),
            _ => Err(DefinitionError::WrongKind {
                name: name.to_string(),
                expected: "a single value",
            }),
        }
    }

    /// A single value that may legitimately be absent.
    pub fn optional_value(&self, name: &str) -> Result<Option<&Value>, DefinitionError> {
        match self.entry(name)? {
            DependencyValue::Value { value, .. } => Ok(Some(value)),
            DependencyValue::Missing => Ok(None),
            _ => Err(DefinitionError::WrongKind {
                name: name.to_string(),
                expected: "a single value",
            }),
        }
    }

    pub fn used_default(&self, name: &str) -> bool {
        matches!(
            self.entries.get(name),
            Some(DependencyValue::Value {
                used_default: true,
                ..
            })
        )
    }

    pub fn component(&self, name: &str) -> Result<Option<&ComponentValues>, DefinitionError> {
        match self.entry(name)? {
            DependencyValue::Component(c) => Ok(c.as_ref()),
            DependencyValue::Missing => Ok(None),
            _ => Err(DefinitionError::WrongKind {
                name: name.to_string(),
                expected: "a component",
            }),
        }
    }

    pub fn components(&self, name: &str) -> Result<&[ComponentValues], DefinitionError> {
        match self.entry(name)? {
            DependencyValue::Components(list) => Ok(list),
            DependencyValue::Missing => Ok(&[]),
            _ => Err(DefinitionError::WrongKind {
                name: name.to_string(),
                expected: "a component list",
            }),
        }
    }

    /// Names whose values differ from `previous`. Entries that are new or
    /// removed count as changed.
    pub(crate) fn changed_since(&self, previous: &DependencyValues) -> Vec<Arc<str>> {
        let mut changed: Vec<Arc<str>> = self
            .entries
            .iter()
            .filter(|(name, value)| previous.entries.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            previous
                .entries
                .keys()
                .filter(|name| !self.entries.contains_key(*name))
                .cloned(),
        );
        changed
    }
}
