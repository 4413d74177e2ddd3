//! Statecraft Core
//!
//! This crate provides the state-variable engine behind interactive
//! documents built from components. It implements:
//!
//! - Lazy, memoized evaluation of state variables over declared
//!   dependencies
//! - Inverse evaluation that turns a desired value into essential writes
//! - Invalidation that marks dependents stale without recomputing them
//! - Persistence of essential values (JSON and MessagePack)
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `component`: component types, state variable definitions, dependency
//!   specs and the type registry
//! - `document`: the live component tree
//! - `resolver`: turns dependency specs into concrete variable references
//! - `store`: per-instance records, consumer edges and invalidation
//! - `essential`: authoritative stateful values and their persistence
//! - `engine`: forward and inverse evaluation behind the [`Engine`] handle
//!
//! # Example
//!
//! ```rust,ignore
//! use statecraft_core::{ComposedType, Engine, EngineConfig, NewComponent, Registry, StateVariableDefinition};
//!
//! let registry = Registry::builder()
//!     .register(ComposedType::new("number").state_variable(
//!         "value",
//!         StateVariableDefinition::essential(0.0).public(),
//!     ))
//!     .build()?;
//!
//! let engine = Engine::new(registry, EngineConfig::default());
//! let n = engine.add_component(NewComponent::new("number").named("n"))?;
//!
//! engine.set_essential_value(n, "value", 5.0)?;
//! assert_eq!(engine.evaluate(n, "value").await?, 5.0.into());
//! ```

pub mod component;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod essential;
pub mod resolver;
pub mod store;
pub mod value;

pub use component::{
    AttributeSpec, Capability, ChildGroup, ComponentType, ComposedType, DefinitionContext, DefinitionResult,
    DependencySpec, Dependencies, InverseContext, InverseInstruction, InverseResult, Registry,
    StateVariableDefinition,
};
pub use config::{EngineConfig, RollbackPolicy};
pub use document::{AttributeValue, ComponentId, NewComponent};
pub use engine::{Engine, InverseReport, UpdateInstruction, UpdateReport};
pub use error::{DefinitionError, EngineError, Result};
pub use essential::SavedState;
pub use store::{Freshness, InvalidationReport};
pub use value::{MathTree, Value};
