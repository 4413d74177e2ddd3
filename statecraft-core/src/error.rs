//! Error Types
//!
//! The engine distinguishes four failure families:
//!
//! - Resolution failures: a required dependency cannot be matched against
//!   the current document topology. The owning variable becomes unresolved.
//! - Cycles: detected through the in-progress tracking. Normally recovered
//!   by the fixed-point loop and only surfaced when a caller asks for it.
//! - Definition failures: a `definition`/`inverseDefinition` callback
//!   returned an error or panicked. Forward reads fall back to defaults.
//! - Rejected modifications: an inverse request targeted a variable that
//!   may not change.
//!
//! `EngineError` is `Clone` because one in-flight evaluation result can be
//! delivered to several concurrent awaiters.

use thiserror::Error;

use crate::document::ComponentId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("unknown component {0}")]
    UnknownComponent(ComponentId),

    #[error("no component named `{0}`")]
    UnknownComponentName(String),

    #[error("unknown component type `{0}`")]
    UnknownComponentType(String),

    #[error("component `{component}` has no state variable `{variable}`")]
    UnknownVariable { component: String, variable: String },

    #[error("component name `{0}` is already in use")]
    DuplicateName(String),

    #[error("`{component}.{variable}` is unresolved: {reason}")]
    Unresolved {
        component: String,
        variable: String,
        reason: String,
    },

    #[error("`{component}.{variable}` did not stabilize after {passes} passes")]
    Cycle {
        component: String,
        variable: String,
        passes: usize,
    },

    #[error("definition of `{component}.{variable}` failed: {message}")]
    Definition {
        component: String,
        variable: String,
        message: String,
    },

    #[error("cannot modify `{component}.{variable}`: {reason}")]
    ModificationRejected {
        component: String,
        variable: String,
        reason: String,
    },

    #[error("inverse of `{component}.{variable}` failed: {reason}")]
    InverseFailed {
        component: String,
        variable: String,
        reason: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl From<PersistenceError> for EngineError {
    fn from(err: PersistenceError) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Errors returned by `definition` and `inverseDefinition` callbacks.
///
/// The typed accessors on [`DependencyValues`](crate::component::DependencyValues)
/// produce the shape variants, so a definition that reads a dependency
/// with the wrong kind fails at the boundary instead of misbehaving.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("dependency `{0}` was not declared")]
    MissingDependency(String),

    #[error("dependency `{name}` is not {expected}")]
    WrongKind { name: String, expected: &'static str },

    #[error("expected {expected}, found {found}")]
    WrongValue {
        expected: &'static str,
        found: String,
    },

    #[error("{0}")]
    Message(String),

    #[error("timed out after {0} ms")]
    TimedOut(u64),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl DefinitionError {
    /// Convenience constructor for free-form failures.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Problems detected while building a [`Registry`](crate::component::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("component type `{0}` registered twice")]
    DuplicateType(String),

    #[error("component type `{component_type}` inherits from unknown type `{base}`")]
    UnknownBase {
        component_type: String,
        base: String,
    },

    #[error("inheritance cycle through `{0}`")]
    InheritanceCycle(String),

    #[error("`{component_type}.{variable}` aliases unknown variable `{target}`")]
    UnknownAliasTarget {
        component_type: String,
        variable: String,
        target: String,
    },

    #[error("`{component_type}.{variable}` is defined more than once")]
    DuplicateVariable {
        component_type: String,
        variable: String,
    },
}

/// Failures while saving or loading essential state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("unsupported saved-state version {found} (newest understood: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}
