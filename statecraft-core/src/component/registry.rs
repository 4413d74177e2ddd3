//! Component Type Registry
//!
//! Component types are registered once, up front, and resolved into
//! immutable [`ComponentClass`]es. Resolution flattens inheritance (base
//! definitions first, overrides after), folds in capability mixins, and
//! synthesizes state variables requested by attribute specs. After
//! [`RegistryBuilder::build`] nothing about a type can change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

use super::definition::{
    DefinitionResult, InverseInstruction, InverseResult, StateVariableDefinition,
};
use super::dependency::{Dependencies, DependencySpec};
use crate::error::RegistryError;
use crate::value::Value;

/// A named slot for children of particular types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildGroup {
    pub name: Arc<str>,
    pub component_types: Vec<Arc<str>>,
}

impl ChildGroup {
    pub fn new<I, S>(name: impl Into<Arc<str>>, component_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            name: name.into(),
            component_types: component_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// How one attribute of a component type behaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeSpec {
    /// Component type to build when the attribute is authored as a
    /// component.
    pub create_component_of_type: Option<Arc<str>>,
    /// State variable to synthesize from the attribute.
    pub create_state_variable: Option<Arc<str>>,
    pub default_value: Value,
    pub public: bool,
}

impl AttributeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component_of_type(mut self, component_type: impl Into<Arc<str>>) -> Self {
        self.create_component_of_type = Some(component_type.into());
        self
    }

    pub fn state_variable(mut self, name: impl Into<Arc<str>>) -> Self {
        self.create_state_variable = Some(name.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = value.into();
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

pub type AttributesObject = IndexMap<Arc<str>, AttributeSpec>;
pub type StateVariableDefinitions = IndexMap<Arc<str>, StateVariableDefinition>;

/// The interface every component type satisfies.
pub trait ComponentType: Send + Sync {
    fn name(&self) -> &str;

    /// Base type whose attributes, child groups and state variables this
    /// type starts from.
    fn inherits(&self) -> Option<&str> {
        None
    }

    fn create_attributes_object(&self) -> AttributesObject {
        AttributesObject::new()
    }

    fn child_groups(&self) -> Vec<ChildGroup> {
        Vec::new()
    }

    fn return_state_variable_definitions(&self) -> StateVariableDefinitions;
}

/// A reusable bundle of attributes and state variables that several
/// component types share.
pub trait Capability: Send + Sync {
    fn attributes(&self, _attributes: &mut AttributesObject) {}

    fn state_variables(&self, definitions: &mut StateVariableDefinitions);
}

/// A component type assembled from capabilities plus its own additions.
///
/// ```rust,ignore
/// let section = ComposedType::new("section")
///     .inherits("sectioningComponent")
///     .with(NumberWithSiblings)
///     .state_variable("title", StateVariableDefinition::essential("Untitled"));
/// ```
#[derive(Clone, Default)]
pub struct ComposedType {
    name: String,
    inherits: Option<String>,
    capabilities: Vec<Arc<dyn Capability>>,
    attributes: AttributesObject,
    child_groups: Vec<ChildGroup>,
    definitions: StateVariableDefinitions,
}

impl ComposedType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn inherits(mut self, base: impl Into<String>) -> Self {
        self.inherits = Some(base.into());
        self
    }

    /// Mix in a capability. Later capabilities and own definitions win.
    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.capabilities.push(Arc::new(capability));
        self
    }

    pub fn attribute(mut self, name: impl Into<Arc<str>>, spec: AttributeSpec) -> Self {
        self.attributes.insert(name.into(), spec);
        self
    }

    pub fn child_group(mut self, group: ChildGroup) -> Self {
        self.child_groups.push(group);
        self
    }

    pub fn state_variable(mut self, name: impl Into<Arc<str>>, definition: StateVariableDefinition) -> Self {
        self.definitions.insert(name.into(), definition);
        self
    }
}

impl ComponentType for ComposedType {
    fn name(&self) -> &str {
        &self.name
    }

    fn inherits(&self) -> Option<&str> {
        self.inherits.as_deref()
    }

    fn create_attributes_object(&self) -> AttributesObject {
        let mut attributes = AttributesObject::new();
        for capability in &self.capabilities {
            capability.attributes(&mut attributes);
        }
        attributes.extend(self.attributes.clone());
        attributes
    }

    fn child_groups(&self) -> Vec<ChildGroup> {
        self.child_groups.clone()
    }

    fn return_state_variable_definitions(&self) -> StateVariableDefinitions {
        let mut definitions = StateVariableDefinitions::new();
        for capability in &self.capabilities {
            capability.state_variables(&mut definitions);
        }
        definitions.extend(self.definitions.clone());
        definitions
    }
}

/// How a variable name maps onto a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VariableEntry {
    Primary,
    CoDefined { primary: Arc<str> },
    Alias { target: Arc<str> },
}

/// A fully resolved component type.
#[derive(Debug)]
pub struct ComponentClass {
    name: Arc<str>,
    /// This type first, then each base.
    ancestry: Vec<Arc<str>>,
    attributes: AttributesObject,
    child_groups: Vec<ChildGroup>,
    definitions: IndexMap<Arc<str>, Arc<StateVariableDefinition>>,
    variables: IndexMap<Arc<str>, VariableEntry>,
}

impl ComponentClass {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Whether this type is `component_type` or inherits from it.
    pub fn is_a(&self, component_type: &str) -> bool {
        self.ancestry.iter().any(|t| &**t == component_type)
    }

    pub fn attributes(&self) -> &AttributesObject {
        &self.attributes
    }

    pub fn child_groups(&self) -> &[ChildGroup] {
        &self.child_groups
    }

    pub fn child_group(&self, name: &str) -> Option<&ChildGroup> {
        self.child_groups.iter().find(|g| &*g.name == name)
    }

    pub fn has_variable(&self, variable: &str) -> bool {
        self.variables.contains_key(variable)
    }

    /// Every state variable name, primaries, co-defined and aliases.
    pub fn variable_names(&self) -> impl Iterator<Item = &Arc<str>> {
        self.variables.keys()
    }

    /// Follow aliases to the variable that actually has storage.
    pub fn canonical(&self, variable: &str) -> Option<Arc<str>> {
        let mut current: Arc<str> = self.variables.get_key_value(variable)?.0.clone();
        for _ in 0..=self.variables.len() {
            match self.variables.get(&current)? {
                VariableEntry::Alias { target } => current = target.clone(),
                _ => return Some(current),
            }
        }
        None
    }

    /// Primary variable whose definition produces `variable` (after alias
    /// resolution).
    pub fn primary_of(&self, variable: &str) -> Option<Arc<str>> {
        let canonical = self.canonical(variable)?;
        match self.variables.get(&canonical)? {
            VariableEntry::Primary => Some(canonical),
            VariableEntry::CoDefined { primary } => Some(primary.clone()),
            VariableEntry::Alias { .. } => None,
        }
    }

    /// Definition by primary name.
    pub fn definition(&self, primary: &str) -> Option<&Arc<StateVariableDefinition>> {
        self.definitions.get(primary)
    }

    /// Definition that produces `variable`, with its primary name.
    pub fn definition_for(&self, variable: &str) -> Option<(Arc<str>, &Arc<StateVariableDefinition>)> {
        let primary = self.primary_of(variable)?;
        let def = self.definitions.get(&primary)?;
        Some((primary, def))
    }

    /// The primary plus its co-defined variables.
    pub fn batch(&self, primary: &str) -> Vec<Arc<str>> {
        let Some((name, def)) = self.definitions.get_key_value(primary) else {
            return Vec::new();
        };
        let mut out = vec![name.clone()];
        out.extend(def.additional_state_variables_defined.iter().cloned());
        out
    }

    pub fn has_essential(&self, variable: &str) -> bool {
        self.definition_for(variable)
            .is_some_and(|(_, def)| def.has_essential)
    }
}

/// Immutable set of resolved component types.
#[derive(Debug, Default)]
pub struct Registry {
    classes: HashMap<Arc<str>, Arc<ComponentClass>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, component_type: &str) -> Option<&Arc<ComponentClass>> {
        self.classes.get(component_type)
    }

    /// Whether `component_type` is `base` or inherits from it. Unknown
    /// types only match themselves.
    pub fn is_a(&self, component_type: &str, base: &str) -> bool {
        match self.classes.get(component_type) {
            Some(class) => class.is_a(base),
            None => component_type == base,
        }
    }

    /// Type filter honoring the inheritance policy of a dependency.
    pub fn matches_type(&self, component_type: &str, wanted: &str, include_inherited: bool) -> bool {
        if include_inherited {
            self.is_a(component_type, wanted)
        } else {
            component_type == wanted
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Collects component types and resolves them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    types: IndexMap<String, Arc<dyn ComponentType>>,
    duplicates: Vec<String>,
}

impl RegistryBuilder {
    pub fn register(mut self, component_type: impl ComponentType + 'static) -> Self {
        let name = component_type.name().to_string();
        if self.types.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.types.insert(name, Arc::new(component_type));
        }
        self
    }

    pub fn build(self) -> Result<Arc<Registry>, RegistryError> {
        if let Some(dup) = self.duplicates.into_iter().next() {
            return Err(RegistryError::DuplicateType(dup));
        }

        let mut classes = HashMap::new();
        for name in self.types.keys() {
            let class = resolve_class(&self.types, name)?;
            classes.insert(class.name.clone(), Arc::new(class));
        }
        Ok(Arc::new(Registry { classes }))
    }
}

fn resolve_class(
    types: &IndexMap<String, Arc<dyn ComponentType>>,
    name: &str,
) -> Result<ComponentClass, RegistryError> {
    // Walk to the root of the inheritance chain.
    let mut chain: Vec<&Arc<dyn ComponentType>> = Vec::new();
    let mut seen = HashSet::new();
    let mut current = name.to_string();
    loop {
        if !seen.insert(current.clone()) {
            return Err(RegistryError::InheritanceCycle(current));
        }
        let ty = types.get(&current).ok_or_else(|| RegistryError::UnknownBase {
            component_type: chain
                .last()
                .map_or_else(|| name.to_string(), |t| t.name().to_string()),
            base: current.clone(),
        })?;
        chain.push(ty);
        match ty.inherits() {
            Some(base) => current = base.to_string(),
            None => break,
        }
    }

    let ancestry: Vec<Arc<str>> = chain.iter().map(|t| Arc::from(t.name())).collect();

    let mut attributes = AttributesObject::new();
    let mut child_groups: Vec<ChildGroup> = Vec::new();
    let mut definitions = StateVariableDefinitions::new();
    for ty in chain.iter().rev() {
        attributes.extend(ty.create_attributes_object());
        for group in ty.child_groups() {
            match child_groups.iter_mut().find(|g| g.name == group.name) {
                Some(existing) => *existing = group,
                None => child_groups.push(group),
            }
        }
        definitions.extend(ty.return_state_variable_definitions());
    }

    for (attribute, spec) in &attributes {
        if let Some(variable) = &spec.create_state_variable {
            if !definitions.contains_key(variable) {
                definitions.insert(variable.clone(), attribute_state_variable(attribute.clone(), spec));
            }
        }
    }

    let class_name: Arc<str> = Arc::from(name);
    let mut variables: IndexMap<Arc<str>, VariableEntry> = IndexMap::new();
    for (variable, def) in &definitions {
        let entry = match &def.alias_of {
            Some(target) => VariableEntry::Alias {
                target: target.clone(),
            },
            None => VariableEntry::Primary,
        };
        variables.insert(variable.clone(), entry);
    }
    for (variable, def) in &definitions {
        if def.alias_of.is_some() {
            continue;
        }
        for extra in &def.additional_state_variables_defined {
            if variables.contains_key(extra) {
                return Err(RegistryError::DuplicateVariable {
                    component_type: name.to_string(),
                    variable: extra.to_string(),
                });
            }
            variables.insert(
                extra.clone(),
                VariableEntry::CoDefined {
                    primary: variable.clone(),
                },
            );
        }
    }
    for (variable, def) in &definitions {
        if let Some(target) = &def.alias_of {
            if !variables.contains_key(target) {
                return Err(RegistryError::UnknownAliasTarget {
                    component_type: name.to_string(),
                    variable: variable.to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    let definitions = definitions
        .into_iter()
        .filter(|(_, def)| def.alias_of.is_none())
        .map(|(k, v)| (k, Arc::new(v)))
        .collect();

    let class = ComponentClass {
        name: class_name,
        ancestry,
        attributes,
        child_groups,
        definitions,
        variables,
    };

    // An alias chain that loops never reaches storage.
    for (variable, entry) in &class.variables {
        if let VariableEntry::Alias { target } = entry {
            if class.canonical(variable).is_none() {
                return Err(RegistryError::UnknownAliasTarget {
                    component_type: name.to_string(),
                    variable: variable.to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    Ok(class)
}

/// Definition synthesized for an attribute with `create_state_variable`.
///
/// Reads the attribute component's `value` if the attribute was authored
/// as a component, else the literal, else essential-or-default. Only the
/// component form and the absent form can be changed through the inverse.
fn attribute_state_variable(attribute: Arc<str>, spec: &AttributeSpec) -> StateVariableDefinition {
    let deps_attribute = attribute.clone();
    let mut def = StateVariableDefinition::new(
        move |_| {
            Dependencies::new()
                .with(
                    "attributeComponent",
                    DependencySpec::attribute_component(deps_attribute.clone(), ["value"]).optional(),
                )
                .with(
                    "attributePrimitive",
                    DependencySpec::attribute_primitive(deps_attribute.clone()),
                )
        },
        |ctx| {
            let values = &ctx.dependency_values;
            if let Some(component) = values.component("attributeComponent")? {
                if let Some(value) = component.get("value") {
                    return Ok(DefinitionResult::value(value.clone()));
                }
            }
            match values.optional_value("attributePrimitive")? {
                Some(value) => Ok(DefinitionResult::value(value.clone())),
                None => Ok(DefinitionResult::use_essential_or_default()),
            }
        },
    )
    .with_essential()
    .with_default(spec.default_value.clone())
    .with_inverse(move |ctx| {
        let values = &ctx.dependency_values;
        if values.component("attributeComponent")?.is_some() {
            return Ok(InverseResult::success(vec![InverseInstruction::set_dependency(
                "attributeComponent",
                ctx.desired_value.clone(),
            )]));
        }
        if values.optional_value("attributePrimitive")?.is_some() {
            return Ok(InverseResult::success(vec![InverseInstruction::fail(format!(
                "attribute `{attribute}` was given as a literal"
            ))]));
        }
        Ok(InverseResult::success(vec![InverseInstruction::set_essential(
            ctx.variable.clone(),
            ctx.desired_value.clone(),
        )]))
    });
    if spec.public {
        def = def.public();
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(&'static str, Option<&'static str>);

    impl ComponentType for Plain {
        fn name(&self) -> &str {
            self.0
        }

        fn inherits(&self) -> Option<&str> {
            self.1
        }

        fn return_state_variable_definitions(&self) -> StateVariableDefinitions {
            let mut defs = StateVariableDefinitions::new();
            defs.insert(format!("{}Only", self.0).into(), StateVariableDefinition::essential(0.0));
            defs.insert("shared".into(), StateVariableDefinition::essential(self.0));
            defs
        }
    }

    struct Titled;

    impl Capability for Titled {
        fn attributes(&self, attributes: &mut AttributesObject) {
            attributes.insert("title".into(), AttributeSpec::new().state_variable("title").default_value(""));
        }

        fn state_variables(&self, definitions: &mut StateVariableDefinitions) {
            definitions.insert("titleLength".into(), StateVariableDefinition::essential(0.0));
        }
    }

    #[test]
    fn inheritance_flattens_with_overrides() {
        let registry = Registry::builder()
            .register(Plain("base", None))
            .register(Plain("derived", Some("base")))
            .build()
            .unwrap();

        let derived = registry.get("derived").unwrap();
        assert!(derived.is_a("base"));
        assert!(derived.has_variable("baseOnly"));
        assert!(derived.has_variable("derivedOnly"));
        assert_eq!(
            derived.definition("shared").unwrap().default_value,
            Some(Value::from("derived"))
        );
        assert!(registry.is_a("derived", "base"));
        assert!(!registry.is_a("base", "derived"));
        assert!(!registry.matches_type("derived", "base", false));
    }

    #[test]
    fn unknown_base_and_cycles_are_rejected() {
        let missing = Registry::builder().register(Plain("a", Some("ghost"))).build();
        assert!(matches!(missing, Err(RegistryError::UnknownBase { .. })));

        let cyclic = Registry::builder()
            .register(Plain("a", Some("b")))
            .register(Plain("b", Some("a")))
            .build();
        assert!(matches!(cyclic, Err(RegistryError::InheritanceCycle(_))));

        let dup = Registry::builder()
            .register(Plain("a", None))
            .register(Plain("a", None))
            .build();
        assert_eq!(dup.unwrap_err(), RegistryError::DuplicateType("a".into()));
    }

    #[test]
    fn capabilities_and_attribute_variables_compose() {
        let section = ComposedType::new("section")
            .with(Titled)
            .state_variable("value", StateVariableDefinition::essential(1.0));
        let registry = Registry::builder().register(section).build().unwrap();
        let class = registry.get("section").unwrap();

        assert!(class.has_variable("titleLength"));
        assert!(class.has_variable("title"));
        assert!(class.has_essential("title"));
        assert!(class.definition("title").unwrap().has_inverse());
    }

    #[test]
    fn aliases_and_batches_resolve_to_primaries() {
        let ty = ComposedType::new("math")
            .state_variable(
                "canBeModified",
                StateVariableDefinition::new(|_| Dependencies::new(), |_| {
                    Ok(DefinitionResult::value(true).set("template", "x"))
                })
                .with_additional(["template"]),
            )
            .state_variable("modifiable", StateVariableDefinition::alias("canBeModified"))
            .state_variable("viaTemplate", StateVariableDefinition::alias("template"));
        let registry = Registry::builder().register(ty).build().unwrap();
        let class = registry.get("math").unwrap();

        assert_eq!(class.canonical("modifiable").as_deref(), Some("canBeModified"));
        assert_eq!(class.primary_of("viaTemplate").as_deref(), Some("canBeModified"));
        assert_eq!(
            class.batch("canBeModified"),
            vec![Arc::<str>::from("canBeModified"), Arc::<str>::from("template")]
        );
        assert!(class.definition("modifiable").is_none());
    }

    #[test]
    fn dangling_and_looping_aliases_fail() {
        let dangling = ComposedType::new("t").state_variable("a", StateVariableDefinition::alias("nothing"));
        assert!(matches!(
            Registry::builder().register(dangling).build(),
            Err(RegistryError::UnknownAliasTarget { .. })
        ));

        let looping = ComposedType::new("t")
            .state_variable("a", StateVariableDefinition::alias("b"))
            .state_variable("b", StateVariableDefinition::alias("a"));
        assert!(matches!(
            Registry::builder().register(looping).build(),
            Err(RegistryError::UnknownAliasTarget { .. })
        ));
    }
}
