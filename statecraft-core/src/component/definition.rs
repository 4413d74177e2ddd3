//! State Variable Definitions
//!
//! The static, per-component-type contract for one state variable:
//!
//! - `return_dependencies` declares what the variable needs,
//! - `definition` computes its value from resolved dependency values,
//! - `inverse_definition` (optional) turns a desired value into
//!   instructions for the variable's dependencies or essential storage.
//!
//! Callbacks come in synchronous and asynchronous flavors. Asynchronous
//! ones return a boxed future; the engine awaits it without holding any
//! lock.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::dependency::{ComponentInfo, Dependencies, DependencyValues};
use crate::document::AttributeValue;
use crate::error::DefinitionError;
use crate::value::Value;

/// What `return_dependencies` gets to look at.
///
/// Only static context: the component's identity, its attributes, and the
/// values of the variables listed in
/// [`determined_by`](StateVariableDefinition::determined_by).
#[derive(Debug, Clone, Copy)]
pub struct DependencyContext<'a> {
    pub component: &'a ComponentInfo,
    pub attributes: &'a IndexMap<Arc<str>, AttributeValue>,
    pub state_values: &'a IndexMap<Arc<str>, Value>,
}

impl DependencyContext<'_> {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn state_value(&self, name: &str) -> Option<&Value> {
        self.state_values.get(name)
    }
}

/// Input to a forward definition.
#[derive(Debug, Clone)]
pub struct DefinitionContext {
    pub component: ComponentInfo,
    /// The primary variable of the definition.
    pub variable: Arc<str>,
    pub dependency_values: DependencyValues,
    /// Dependencies whose values differ from the previous computation.
    pub changed: Vec<Arc<str>>,
    pub first_computation: bool,
}

impl DefinitionContext {
    pub fn changed(&self, dependency: &str) -> bool {
        self.first_computation || self.changed.iter().any(|c| &**c == dependency)
    }
}

/// How a definition settles one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Set(Value),
    /// Take the essential value if one was ever written, else the default.
    UseEssentialOrDefault,
    /// Keep the cached value.
    NoChanges,
}

/// Result of a forward definition: one outcome for the primary variable and
/// one per co-defined variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionResult {
    pub(crate) primary: Option<Outcome>,
    pub(crate) named: IndexMap<Arc<str>, Outcome>,
}

impl DefinitionResult {
    /// Set the primary variable.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            primary: Some(Outcome::Set(value.into())),
            named: IndexMap::new(),
        }
    }

    pub fn use_essential_or_default() -> Self {
        Self {
            primary: Some(Outcome::UseEssentialOrDefault),
            named: IndexMap::new(),
        }
    }

    pub fn no_changes() -> Self {
        Self {
            primary: Some(Outcome::NoChanges),
            named: IndexMap::new(),
        }
    }

    /// Start from nothing and name every variable explicitly.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Settle a variable by name (primary or co-defined).
    pub fn with(mut self, variable: impl Into<Arc<str>>, outcome: Outcome) -> Self {
        self.named.insert(variable.into(), outcome);
        self
    }

    pub fn set(self, variable: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.with(variable, Outcome::Set(value.into()))
    }

    pub(crate) fn outcome_for(&self, variable: &str, primary: &str) -> Option<&Outcome> {
        match self.named.get(variable) {
            Some(outcome) => Some(outcome),
            None if variable == primary => self.primary.as_ref(),
            None => None,
        }
    }
}

/// Scratch space shared by the inverse invocations of one variable within
/// one update transaction.
///
/// Only inverse definitions see it. Forward definitions stay pure: what an
/// inverse needs from the forward side arrives as the
/// [`InverseContext::current_value`] and `dependency_values` evaluated for
/// that same request. The workspace is dropped when the transaction ends.
#[derive(Debug, Clone, Default)]
pub struct Workspace(Arc<Mutex<IndexMap<Arc<str>, Value>>>);

impl Workspace {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<Arc<str>>, value: impl Into<Value>) {
        self.0.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().shift_remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Input to an inverse definition.
#[derive(Debug, Clone)]
pub struct InverseContext {
    pub component: ComponentInfo,
    /// The variable being asked to change. For batched definitions this may
    /// be a co-defined variable rather than the primary.
    pub variable: Arc<str>,
    pub desired_value: Value,
    pub current_value: Option<Value>,
    pub dependency_values: DependencyValues,
    pub workspace: Workspace,
}

/// One step of an inverse result. Applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseInstruction {
    /// Write an essential value of this component.
    SetEssentialValue { variable: Arc<str>, value: Value },
    /// Ask a dependency to take a value, recursing into its inverse.
    /// Component-shaped dependencies pick the `component_index`-th match and
    /// its `variable_index`-th requested variable.
    SetDependency {
        dependency: Arc<str>,
        desired_value: Value,
        component_index: usize,
        variable_index: usize,
    },
    Fail { reason: String },
}

impl InverseInstruction {
    pub fn set_essential(variable: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        Self::SetEssentialValue {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn set_dependency(dependency: impl Into<Arc<str>>, desired_value: impl Into<Value>) -> Self {
        Self::SetDependency {
            dependency: dependency.into(),
            desired_value: desired_value.into(),
            component_index: 0,
            variable_index: 0,
        }
    }

    pub fn set_dependency_at(
        dependency: impl Into<Arc<str>>,
        component_index: usize,
        variable_index: usize,
        desired_value: impl Into<Value>,
    ) -> Self {
        Self::SetDependency {
            dependency: dependency.into(),
            desired_value: desired_value.into(),
            component_index,
            variable_index,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }
}

/// Result of an inverse definition.
#[derive(Debug, Clone, PartialEq)]
pub struct InverseResult {
    pub success: bool,
    pub instructions: Vec<InverseInstruction>,
}

impl InverseResult {
    pub fn success(instructions: Vec<InverseInstruction>) -> Self {
        Self {
            success: true,
            instructions,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            instructions: Vec::new(),
        }
    }
}

pub type ReturnDependenciesFn = dyn Fn(&DependencyContext<'_>) -> Dependencies + Send + Sync;
pub type SyncDefinitionFn = dyn Fn(&DefinitionContext) -> Result<DefinitionResult, DefinitionError> + Send + Sync;
pub type AsyncDefinitionFn =
    dyn Fn(DefinitionContext) -> BoxFuture<'static, Result<DefinitionResult, DefinitionError>> + Send + Sync;
pub type SyncInverseFn = dyn Fn(&InverseContext) -> Result<InverseResult, DefinitionError> + Send + Sync;
pub type AsyncInverseFn =
    dyn Fn(InverseContext) -> BoxFuture<'static, Result<InverseResult, DefinitionError>> + Send + Sync;

/// Forward computation.
#[derive(Clone)]
pub enum Definition {
    Sync(Arc<SyncDefinitionFn>),
    Async(Arc<AsyncDefinitionFn>),
}

/// Backward computation.
#[derive(Clone)]
pub enum InverseDefinition {
    Sync(Arc<SyncInverseFn>),
    Async(Arc<AsyncInverseFn>),
}

/// The full contract of one state variable (or batch of co-defined ones).
#[derive(Clone)]
pub struct StateVariableDefinition {
    pub(crate) return_dependencies: Arc<ReturnDependenciesFn>,
    pub(crate) definition: Option<Definition>,
    pub(crate) inverse_definition: Option<InverseDefinition>,
    pub(crate) has_essential: bool,
    pub(crate) default_value: Option<Value>,
    pub(crate) additional_defaults: IndexMap<Arc<str>, Value>,
    pub(crate) alias_of: Option<Arc<str>>,
    pub(crate) additional_state_variables_defined: Vec<Arc<str>>,
    pub(crate) state_variables_determining_dependencies: Vec<Arc<str>>,
    pub(crate) public: bool,
    pub(crate) for_renderer: bool,
    pub(crate) locked_by: Vec<Arc<str>>,
}

impl StateVariableDefinition {
    fn blank(return_dependencies: Arc<ReturnDependenciesFn>, definition: Option<Definition>) -> Self {
        Self {
            return_dependencies,
            definition,
            inverse_definition: None,
            has_essential: false,
            default_value: None,
            additional_defaults: IndexMap::new(),
            alias_of: None,
            additional_state_variables_defined: Vec::new(),
            state_variables_determining_dependencies: Vec::new(),
            public: false,
            for_renderer: false,
            locked_by: Vec::new(),
        }
    }

    /// A variable computed synchronously from its dependencies.
    pub fn new<D, F>(return_dependencies: D, definition: F) -> Self
    where
        D: Fn(&DependencyContext<'_>) -> Dependencies + Send + Sync + 'static,
        F: Fn(&DefinitionContext) -> Result<DefinitionResult, DefinitionError> + Send + Sync + 'static,
    {
        Self::blank(
            Arc::new(return_dependencies),
            Some(Definition::Sync(Arc::new(definition))),
        )
    }

    /// A variable whose definition has to await something.
    pub fn new_async<D, F>(return_dependencies: D, definition: F) -> Self
    where
        D: Fn(&DependencyContext<'_>) -> Dependencies + Send + Sync + 'static,
        F: Fn(DefinitionContext) -> BoxFuture<'static, Result<DefinitionResult, DefinitionError>>
            + Send
            + Sync
            + 'static,
    {
        Self::blank(
            Arc::new(return_dependencies),
            Some(Definition::Async(Arc::new(definition))),
        )
    }

    /// A purely stateful variable: essential value or `default`, settable
    /// through its own inverse.
    pub fn essential(default: impl Into<Value>) -> Self {
        Self::new(|_| Dependencies::new(), |_| Ok(DefinitionResult::use_essential_or_default()))
            .with_essential()
            .with_default(default)
            .with_inverse(|ctx| {
                Ok(InverseResult::success(vec![InverseInstruction::set_essential(
                    ctx.variable.clone(),
                    ctx.desired_value.clone(),
                )]))
            })
    }

    /// Another name for `target` on the same component. Has no storage.
    pub fn alias(target: impl Into<Arc<str>>) -> Self {
        let mut def = Self::blank(Arc::new(|_| Dependencies::new()), None);
        def.alias_of = Some(target.into());
        def
    }

    pub fn with_inverse<F>(mut self, inverse: F) -> Self
    where
        F: Fn(&InverseContext) -> Result<InverseResult, DefinitionError> + Send + Sync + 'static,
    {
        self.inverse_definition = Some(InverseDefinition::Sync(Arc::new(inverse)));
        self
    }

    pub fn with_async_inverse<F>(mut self, inverse: F) -> Self
    where
        F: Fn(InverseContext) -> BoxFuture<'static, Result<InverseResult, DefinitionError>>
            + Send
            + Sync
            + 'static,
    {
        self.inverse_definition = Some(InverseDefinition::Async(Arc::new(inverse)));
        self
    }

    /// Back the variable (and every co-defined one) with essential storage.
    pub fn with_essential(mut self) -> Self {
        self.has_essential = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Declare variables this definition produces alongside the primary.
    pub fn with_additional<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.additional_state_variables_defined
            .extend(variables.into_iter().map(Into::into));
        self
    }

    pub fn with_additional_default(mut self, variable: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.additional_defaults.insert(variable.into(), value.into());
        self
    }

    /// Variables whose values `return_dependencies` reads. They are
    /// evaluated first and the dependency list is re-derived when they
    /// change.
    pub fn determined_by<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.state_variables_determining_dependencies
            .extend(variables.into_iter().map(Into::into));
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn for_renderer(mut self) -> Self {
        self.for_renderer = true;
        self
    }

    /// A boolean variable of the same component that, when true, blocks
    /// inverse modification of this one.
    pub fn locked_by(mut self, variable: impl Into<Arc<str>>) -> Self {
        self.locked_by.push(variable.into());
        self
    }

    pub fn has_essential(&self) -> bool {
        self.has_essential
    }

    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_for_renderer(&self) -> bool {
        self.for_renderer
    }

    pub fn has_inverse(&self) -> bool {
        self.inverse_definition.is_some()
    }

    pub fn additional_state_variables_defined(&self) -> &[Arc<str>] {
        &self.additional_state_variables_defined
    }

    pub fn state_variables_determining_dependencies(&self) -> &[Arc<str>] {
        &self.state_variables_determining_dependencies
    }

    /// Default for `variable`, which is `primary` or one of the co-defined
    /// variables.
    pub fn default_for(&self, variable: &str, primary: &str) -> Option<&Value> {
        if variable == primary {
            self.default_value.as_ref()
        } else {
            self.additional_defaults.get(variable)
        }
    }
}

impl fmt::Debug for StateVariableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateVariableDefinition")
            .field("has_essential", &self.has_essential)
            .field("default_value", &self.default_value)
            .field("alias_of", &self.alias_of)
            .field("additional", &self.additional_state_variables_defined)
            .field("determined_by", &self.state_variables_determining_dependencies)
            .field("has_inverse", &self.has_inverse())
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_lookup_prefers_named_entries() {
        let result = DefinitionResult::value(1.0).set("extra", 2.0);
        assert_eq!(result.outcome_for("x", "x"), Some(&Outcome::Set(Value::Number(1.0))));
        assert_eq!(
            result.outcome_for("extra", "x"),
            Some(&Outcome::Set(Value::Number(2.0)))
        );
        assert_eq!(result.outcome_for("other", "x"), None);

        let explicit = DefinitionResult::value(1.0).set("x", 5.0);
        assert_eq!(explicit.outcome_for("x", "x"), Some(&Outcome::Set(Value::Number(5.0))));
    }

    #[test]
    fn workspace_clones_share_storage() {
        let ws = Workspace::default();
        let other = ws.clone();
        ws.set("component", 2.0);
        assert_eq!(other.get("component"), Some(Value::Number(2.0)));
        assert_eq!(other.remove("component"), Some(Value::Number(2.0)));
        assert!(ws.is_empty());
    }

    #[test]
    fn essential_builder_sets_flags() {
        let def = StateVariableDefinition::essential(0.0).public();
        assert!(def.has_essential());
        assert!(def.has_inverse());
        assert!(def.is_public());
        assert_eq!(def.default_for("x", "x"), Some(&Value::Number(0.0)));
        assert_eq!(def.default_for("y", "x"), None);
    }

    #[test]
    fn alias_has_no_definition() {
        let def = StateVariableDefinition::alias("value");
        assert!(def.is_alias());
        assert!(def.definition.is_none());
    }
}
