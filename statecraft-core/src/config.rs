//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with earlier writes when an instruction in an inverse
/// transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackPolicy {
    /// Stop at the first failure and restore every essential value the
    /// transaction wrote.
    #[default]
    Rollback,
    /// Keep successful writes, carry on with the remaining instructions
    /// and report the transaction as unsuccessful.
    PartialApply,
}

/// Tunables for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Upper bound on re-evaluation passes for cyclic definitions.
    /// A cycle still moving after this many passes freezes at its last value.
    pub max_fixed_point_passes: usize,

    /// Upper bound on nested `setDependency` hops in one request.
    pub max_inverse_depth: usize,

    /// Partial-failure behavior of inverse transactions.
    pub rollback_policy: RollbackPolicy,

    /// Boolean state variable that, when true on a component, blocks every
    /// inverse modification of that component.
    pub fixed_variable: String,

    /// Deadline for asynchronous definitions. Needs a tokio runtime with
    /// timers enabled when set.
    pub definition_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fixed_point_passes: 10,
            max_inverse_depth: 64,
            rollback_policy: RollbackPolicy::Rollback,
            fixed_variable: "fixed".to_string(),
            definition_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_max_fixed_point_passes(mut self, passes: usize) -> Self {
        self.max_fixed_point_passes = passes.max(1);
        self
    }

    pub fn with_max_inverse_depth(mut self, depth: usize) -> Self {
        self.max_inverse_depth = depth;
        self
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.rollback_policy = policy;
        self
    }

    pub fn with_fixed_variable(mut self, name: impl Into<String>) -> Self {
        self.fixed_variable = name.into();
        self
    }

    pub fn with_definition_timeout(mut self, timeout: Duration) -> Self {
        self.definition_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub(crate) fn definition_timeout(&self) -> Option<Duration> {
        self.definition_timeout_ms.map(Duration::from_millis)
    }
}
