//! Inverse Evaluator
//!
//! Turns "make this variable equal X" into writes of essential values.
//!
//! # How a Request Is Handled
//!
//! 1. The target must be modifiable: its component's `fixed` variable is
//!    not true, none of its `locked_by` variables is true, and it has an
//!    inverse definition.
//!
//! 2. The inverse definition runs against the variable's current
//!    dependency values and a per-variable [`Workspace`] that lives for the
//!    whole transaction.
//!
//! 3. Its instructions are applied in order. `SetEssentialValue` writes
//!    (and journals) an essential value, `SetDependency` recurses into the
//!    dependency's own inverse, `Fail` fails the request.
//!
//! # Partial Failure
//!
//! Under [`RollbackPolicy::Rollback`] the first failure stops the
//! transaction and every journaled write is restored in reverse order.
//! Under [`RollbackPolicy::PartialApply`] failures are collected, the
//! remaining instructions still run, and the report says the transaction
//! did not fully succeed.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::forward::{evaluate_settled, panic_message, run_guarded};
use super::EngineInner;
use crate::component::{
    ComponentClass, InverseContext, InverseDefinition, InverseInstruction, StateVariableDefinition, Workspace,
};
use crate::config::RollbackPolicy;
use crate::document::ComponentId;
use crate::error::{DefinitionError, EngineError, Result};
use crate::resolver::{component_info, Resolution, Resolved};
use crate::store::{invalidate, InvalidationReport, VarKey};
use crate::value::Value;

/// One requested change in a [`perform_update`](crate::engine::Engine::perform_update) call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInstruction {
    pub component: ComponentId,
    pub variable: Arc<str>,
    pub value: Value,
}

impl UpdateInstruction {
    pub fn new(component: ComponentId, variable: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        Self {
            component,
            variable: variable.into(),
            value: value.into(),
        }
    }
}

/// An essential value written by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWrite {
    pub component: ComponentId,
    pub variable: Arc<str>,
    pub value: Value,
}

/// Outcome of an update transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    /// Every instruction was carried out.
    pub success: bool,
    /// The journal was replayed backwards after a failure.
    pub rolled_back: bool,
    /// Writes still in effect.
    pub applied: Vec<AppliedWrite>,
    pub failures: Vec<EngineError>,
    /// Records marked stale by the writes (and by their rollback).
    pub invalidated: InvalidationReport,
}

/// Outcome of a single-variable request.
#[derive(Debug, Clone, PartialEq)]
pub struct InverseReport {
    pub success: bool,
    /// The variable's value after the request, read back through the
    /// forward evaluator.
    pub actual_value: Option<Value>,
    pub failures: Vec<EngineError>,
}

struct JournalEntry {
    key: VarKey,
    component_name: Arc<str>,
    previous: Option<Value>,
}

struct Transaction {
    inner: Arc<EngineInner>,
    policy: RollbackPolicy,
    journal: Vec<JournalEntry>,
    applied: Vec<AppliedWrite>,
    workspaces: HashMap<VarKey, Workspace>,
    in_progress: Vec<VarKey>,
    failures: Vec<EngineError>,
    invalidated: InvalidationReport,
}

/// Resolved identity of a request target.
struct Target {
    key: VarKey,
    primary: VarKey,
    name: Arc<str>,
    class: Arc<ComponentClass>,
    definition: Arc<StateVariableDefinition>,
}

impl Transaction {
    fn new(inner: Arc<EngineInner>) -> Self {
        let policy = inner.config.rollback_policy;
        Self {
            inner,
            policy,
            journal: Vec::new(),
            applied: Vec::new(),
            workspaces: HashMap::new(),
            in_progress: Vec::new(),
            failures: Vec::new(),
            invalidated: InvalidationReport::default(),
        }
    }

    fn request(&mut self, key: VarKey, desired: Value, depth: usize) -> BoxFuture<'_, Result<()>> {
        async move {
            let target = {
                let state = self.inner.state.lock();
                let class = state.class_of(&self.inner.registry, key.0)?;
                let Some((primary, definition)) = class.definition_for(&key.1) else {
                    return Err(state.unknown_variable(key.0, &key.1));
                };
                Target {
                    primary: VarKey(key.0, primary),
                    definition: definition.clone(),
                    name: state.document.node(key.0)?.name().clone(),
                    class: class.clone(),
                    key,
                }
            };

            if depth > self.inner.config.max_inverse_depth {
                return Err(inverse_failed(&target, "inverse requests nested too deeply"));
            }
            if self.in_progress.contains(&target.primary) {
                return Err(inverse_failed(&target, "cyclic inverse request"));
            }
            self.check_modifiable(&target).await?;

            self.in_progress.push(target.primary.clone());
            let outcome = self.invert(&target, desired, depth).await;
            self.in_progress.retain(|k| *k != target.primary);
            outcome
        }
        .boxed()
    }

    async fn check_modifiable(&self, target: &Target) -> Result<()> {
        let fixed = &self.inner.config.fixed_variable;
        if let Some(fixed_variable) = target.class.canonical(fixed).filter(|v| *v != target.key.1) {
            if is_true(&self.inner, VarKey(target.key.0, fixed_variable)).await? {
                return Err(rejected(target, format!("`{fixed}` is true")));
            }
        }
        for lock in &target.definition.locked_by {
            let Some(variable) = target.class.canonical(lock) else {
                continue;
            };
            if is_true(&self.inner, VarKey(target.key.0, variable)).await? {
                return Err(rejected(target, format!("locked by `{lock}`")));
            }
        }
        if !target.definition.has_inverse() {
            return Err(rejected(target, "has no inverse definition"));
        }
        Ok(())
    }

    async fn invert(&mut self, target: &Target, desired: Value, depth: usize) -> Result<()> {
        let (current, _) = evaluate_settled(&self.inner, target.key.clone()).await?;

        let (info, dependency_values, resolution) = {
            let state = self.inner.state.lock();
            let node = state.document.node(target.key.0)?;
            let record = state.store.get(&target.primary);
            (
                component_info(node),
                record.and_then(|r| r.previous.clone()).unwrap_or_default(),
                record.and_then(|r| r.resolution.clone()),
            )
        };

        let context = InverseContext {
            component: info,
            variable: target.key.1.clone(),
            desired_value: desired,
            current_value: Some(current.value),
            dependency_values,
            workspace: self.workspaces.entry(target.primary.clone()).or_default().clone(),
        };

        let result = match &target.definition.inverse_definition {
            Some(InverseDefinition::Sync(f)) => catch_unwind(AssertUnwindSafe(|| f(&context)))
                .unwrap_or_else(|payload| Err(DefinitionError::Panicked(panic_message(&*payload)))),
            Some(InverseDefinition::Async(f)) => match catch_unwind(AssertUnwindSafe(|| f(context))) {
                Ok(future) => run_guarded(future, self.inner.config.definition_timeout()).await,
                Err(payload) => Err(DefinitionError::Panicked(panic_message(&*payload))),
            },
            None => return Err(rejected(target, "has no inverse definition")),
        };
        let result = result.map_err(|err| EngineError::Definition {
            component: target.name.to_string(),
            variable: target.key.1.to_string(),
            message: err.to_string(),
        })?;
        if !result.success {
            return Err(inverse_failed(target, "inverse definition reported failure"));
        }

        debug!(
            component = %target.name,
            variable = %target.key.1,
            instructions = result.instructions.len(),
            depth,
            "applying inverse"
        );
        for instruction in result.instructions {
            if let Err(err) = self.apply(target, resolution.as_deref(), instruction, depth).await {
                match self.policy {
                    RollbackPolicy::Rollback => return Err(err),
                    RollbackPolicy::PartialApply => {
                        warn!(component = %target.name, variable = %target.key.1, error = %err, "instruction failed, continuing");
                        self.failures.push(err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply(
        &mut self,
        target: &Target,
        resolution: Option<&Resolution>,
        instruction: InverseInstruction,
        depth: usize,
    ) -> Result<()> {
        match instruction {
            InverseInstruction::SetEssentialValue { variable, value } => self.write_essential(target, &variable, value),
            InverseInstruction::SetDependency {
                dependency,
                desired_value,
                component_index,
                variable_index,
            } => {
                let key = resolution
                    .and_then(|r| r.get(&dependency))
                    .and_then(|resolved| match resolved {
                        Resolved::Variable(key) if component_index == 0 && variable_index == 0 => Some(key.clone()),
                        Resolved::Component(Some(matched)) if component_index == 0 => {
                            matched.variables.get(variable_index).map(|(_, k)| k.clone())
                        }
                        Resolved::Components(list) => list
                            .get(component_index)
                            .and_then(|m| m.variables.get(variable_index))
                            .map(|(_, k)| k.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| inverse_failed(target, format!("dependency `{dependency}` has no variable to modify")))?;
                self.request(key, desired_value, depth + 1).await
            }
            InverseInstruction::Fail { reason } => Err(inverse_failed(target, reason)),
        }
    }

    fn write_essential(&mut self, target: &Target, variable: &str, value: Value) -> Result<()> {
        let variable = target
            .class
            .canonical(variable)
            .filter(|v| target.class.has_essential(v))
            .ok_or_else(|| inverse_failed(target, format!("`{variable}` has no essential value")))?;
        let key = VarKey(target.key.0, variable.clone());

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let previous = state.essentials.set(target.name.clone(), variable.clone(), value.clone());
        self.journal.push(JournalEntry {
            key: key.clone(),
            component_name: target.name.clone(),
            previous,
        });
        self.applied.push(AppliedWrite {
            component: target.key.0,
            variable,
            value,
        });
        self.invalidated.merge(invalidate(&mut state.store, [key]));
        Ok(())
    }

    /// Undo every journaled write, newest first.
    fn rollback(&mut self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        for entry in self.journal.drain(..).rev() {
            state
                .essentials
                .restore(entry.component_name, entry.key.1.clone(), entry.previous);
            self.invalidated.merge(invalidate(&mut state.store, [entry.key]));
        }
        self.applied.clear();
    }
}

async fn is_true(inner: &Arc<EngineInner>, key: VarKey) -> Result<bool> {
    let (evaluated, _) = evaluate_settled(inner, key).await?;
    Ok(evaluated.value.as_bool().unwrap_or(false))
}

fn inverse_failed(target: &Target, reason: impl Into<String>) -> EngineError {
    EngineError::InverseFailed {
        component: target.name.to_string(),
        variable: target.key.1.to_string(),
        reason: reason.into(),
    }
}

fn rejected(target: &Target, reason: impl Into<String>) -> EngineError {
    EngineError::ModificationRejected {
        component: target.name.to_string(),
        variable: target.key.1.to_string(),
        reason: reason.into(),
    }
}

/// Run one update transaction.
pub(crate) async fn perform_update(inner: &Arc<EngineInner>, instructions: Vec<UpdateInstruction>) -> UpdateReport {
    let mut transaction = Transaction::new(inner.clone());
    let mut failures = Vec::new();

    for instruction in instructions {
        let key = {
            let state = inner.state.lock();
            state.canonical_key(&inner.registry, instruction.component, &instruction.variable)
        };
        let outcome = match key {
            Ok(key) => transaction.request(key, instruction.value, 0).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(
                component = %instruction.component,
                variable = %instruction.variable,
                error = %err,
                "update instruction failed"
            );
            failures.push(err);
            if transaction.policy == RollbackPolicy::Rollback {
                break;
            }
        }
    }
    failures.append(&mut transaction.failures);

    let rolled_back = !failures.is_empty() && transaction.policy == RollbackPolicy::Rollback;
    if rolled_back {
        warn!(writes = transaction.journal.len(), "rolling back update");
        transaction.rollback();
    }
    debug!(
        applied = transaction.applied.len(),
        failures = failures.len(),
        marked = transaction.invalidated.len(),
        "update finished"
    );

    UpdateReport {
        success: failures.is_empty(),
        rolled_back,
        applied: transaction.applied,
        failures,
        invalidated: transaction.invalidated,
    }
}

/// Ask one variable to take a value, then read back what it became.
pub(crate) async fn request_value(inner: &Arc<EngineInner>, key: VarKey, value: Value) -> InverseReport {
    let instruction = UpdateInstruction {
        component: key.0,
        variable: key.1.clone(),
        value,
    };
    let report = perform_update(inner, vec![instruction]).await;
    let actual_value = evaluate_settled(inner, key).await.ok().map(|(e, _)| e.value);
    InverseReport {
        success: report.success,
        actual_value,
        failures: report.failures,
    }
}
