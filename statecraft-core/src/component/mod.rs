//! Component Model
//!
//! Everything static about component types: the dependency vocabulary,
//! state variable definitions and the registry that resolves types into
//! [`ComponentClass`]es.
//!
//! # How a Type Is Described
//!
//! A component type returns a map from state variable name to
//! [`StateVariableDefinition`]. Each definition declares its dependencies
//! by local name ([`Dependencies`]), computes a value from the resolved
//! [`DependencyValues`], and optionally knows how to push a desired value
//! back through its inverse.
//!
//! Types can inherit from one base and mix in any number of
//! [`Capability`]s. The registry flattens both at build time.

mod definition;
mod dependency;
mod registry;

pub use definition::{
    Definition, DefinitionContext, DefinitionResult, DependencyContext, InverseContext, InverseDefinition,
    InverseInstruction, InverseResult, Outcome, StateVariableDefinition, Workspace,
};
pub use dependency::{
    ComponentInfo, ComponentValues, Dependencies, DependencySpec, DependencyValue, DependencyValues,
    MatchOptions, Target,
};
pub use registry::{
    AttributeSpec, AttributesObject, Capability, ChildGroup, ComponentClass, ComponentType, ComposedType,
    Registry, RegistryBuilder, StateVariableDefinitions,
};
