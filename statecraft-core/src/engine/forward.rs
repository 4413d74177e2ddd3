//! Forward Evaluator
//!
//! Lazily brings a state variable up to date and returns its value.
//!
//! # How Evaluation Works
//!
//! 1. A fresh record is returned from the cache.
//!
//! 2. Otherwise the batch (the variable plus everything its definition
//!    co-defines) is computed once, however many readers ask at the same
//!    time. Readers join the in-flight computation.
//!
//! 3. The computation evaluates the variables that determine its
//!    dependency list, resolves the dependencies (reusing the previous
//!    resolution when nothing structural or determining changed), registers
//!    the edges, evaluates every dependency, and calls the definition.
//!
//! 4. Outcomes are settled under the state lock. A record is only marked
//!    fresh if no invalidation reached it while the computation ran.
//!
//! # Cycles
//!
//! Asking for a batch that is (transitively) waiting on the asker is a
//! cycle. The asker receives a *provisional* fallback (the last value,
//! else the essential value, else the default) and everything computed
//! from it is provisional too. [`evaluate_settled`] re-runs provisional
//! records until two consecutive passes agree, or freezes them after
//! `max_fixed_point_passes`.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::tracking::{BatchOutput, Evaluated, Join};
use super::{EngineInner, EngineState};
use crate::component::{
    ComponentValues, Definition, DefinitionContext, DefinitionResult, DependencyContext,
    DependencyValue, DependencyValues, Outcome, StateVariableDefinition,
};
use crate::error::{DefinitionError, EngineError, Result};
use crate::resolver::{self, component_info, MatchedComponent, Resolved, Watch};
use crate::store::{Freshness, VarKey};
use crate::value::Value;

/// Evaluate one variable. `requester` is the primary key of the
/// computation asking, `None` for top-level reads.
pub(crate) fn evaluate_key(
    inner: Arc<EngineInner>,
    key: VarKey,
    requester: Option<VarKey>,
) -> BoxFuture<'static, Result<Evaluated>> {
    async move {
        let future = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let class = state.class_of(&inner.registry, key.0)?;
            let Some((primary, definition)) = class.definition_for(&key.1) else {
                return Err(state.unknown_variable(key.0, &key.1));
            };
            let primary = VarKey(key.0, primary);
            let definition = definition.clone();

            if let Some(record) = state.store.get(&key) {
                match record.freshness {
                    Freshness::Fresh => {
                        trace!(component = %key.0, variable = %key.1, "cache hit");
                        return Ok(Evaluated::from_record(record));
                    }
                    Freshness::Unresolved => {
                        return Err(EngineError::Unresolved {
                            component: state.name_of(key.0),
                            variable: key.1.to_string(),
                            reason: record.unresolved.clone().unwrap_or_default(),
                        });
                    }
                    Freshness::Stale => {}
                }
            }

            let batch: Arc<[Arc<str>]> = class.batch(&primary.1).into();
            state.store.ensure_batch(key.0, &batch);

            let start = {
                let inner = inner.clone();
                let primary = primary.clone();
                let definition = definition.clone();
                move || compute(inner, primary, definition)
            };
            match inner.tracker.join_or_start(requester.as_ref(), &primary, start) {
                Join::Wait(future) => future,
                Join::Cycle => {
                    debug!(component = %key.0, variable = %key.1, "cycle detected, using fallback");
                    return Ok(cycle_fallback(state, &key, &primary, &definition));
                }
            }
        };

        let _waiting = requester.map(|requester| inner.tracker.waiting(requester));
        let output = future.await;
        output?.get(&key.1).cloned().ok_or_else(|| EngineError::UnknownVariable {
            component: key.0.to_string(),
            variable: key.1.to_string(),
        })
    }
    .boxed()
}

/// Evaluate a variable and drive any cycle it touches to a fixed point.
///
/// Returns the value and whether the fixed point had to be frozen.
pub(crate) async fn evaluate_settled(inner: &Arc<EngineInner>, key: VarKey) -> Result<(Evaluated, bool)> {
    let max_passes = inner.config.max_fixed_point_passes.max(1);
    let mut previous: Option<BTreeMap<VarKey, Option<Value>>> = None;
    let mut pass = 0;
    loop {
        pass += 1;
        let evaluated = evaluate_key(inner.clone(), key.clone(), None).await?;
        if !evaluated.provisional {
            return Ok((evaluated, false));
        }

        let finished = {
            let mut state = inner.state.lock();
            let snapshot = state.store.provisional_snapshot();
            if previous.as_ref() == Some(&snapshot) {
                debug!(component = %key.0, variable = %key.1, passes = pass, "fixed point reached");
                state.store.settle(snapshot.into_keys(), false);
                Some(false)
            } else if pass >= max_passes {
                warn!(
                    component = %key.0,
                    variable = %key.1,
                    passes = pass,
                    "fixed point did not converge, freezing last values"
                );
                state.store.settle(snapshot.into_keys(), true);
                Some(true)
            } else {
                trace!(passes = pass, records = snapshot.len(), "re-running provisional records");
                state.store.restale(snapshot.keys().cloned());
                previous = Some(snapshot);
                None
            }
        };

        if let Some(frozen) = finished {
            return Ok((
                Evaluated {
                    provisional: false,
                    ..evaluated
                },
                frozen,
            ));
        }
    }
}

fn compute(
    inner: Arc<EngineInner>,
    primary: VarKey,
    definition: Arc<StateVariableDefinition>,
) -> BoxFuture<'static, Result<BatchOutput>> {
    async move {
        let generation = {
            let mut state = inner.state.lock();
            for key in state.store.batch_keys(&primary) {
                if let Some(record) = state.store.get_mut(&key) {
                    record.computing = true;
                }
            }
            state.store.get(&primary).map_or(0, |r| r.generation)
        };
        debug!(component = %primary.0, variable = %primary.1, "computing");

        let ran = run(&inner, &primary, &definition).await;

        let mut state = inner.state.lock();
        let output = commit(&mut state, &primary, &definition, generation, ran);
        inner.tracker.finish(&primary);
        output
    }
    .boxed()
}

/// Everything a definition call produced, before it is settled.
struct Ran {
    result: std::result::Result<DefinitionResult, DefinitionError>,
    dependency_values: DependencyValues,
    provisional: bool,
}

async fn run(inner: &Arc<EngineInner>, primary: &VarKey, definition: &StateVariableDefinition) -> Result<Ran> {
    let component = primary.0;
    let mut provisional = false;

    let (component_name, determining_keys) = {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        let class = state.class_of(&inner.registry, component)?;
        let name = state.document.node(component)?.name().clone();
        let mut keys: SmallVec<[VarKey; 4]> = SmallVec::new();
        for variable in definition.state_variables_determining_dependencies() {
            let canonical = class
                .canonical(variable)
                .ok_or_else(|| state.unknown_variable(component, variable))?;
            keys.push(VarKey(component, canonical));
        }
        if !keys.is_empty() {
            state.store.set_dependencies(primary, keys.clone(), Vec::new());
        }
        (name, keys)
    };

    let mut determining = IndexMap::new();
    let names = definition.state_variables_determining_dependencies();
    for (name, key) in names.iter().zip(&determining_keys) {
        let evaluated = evaluate_key(inner.clone(), key.clone(), Some(primary.clone()))
            .await
            .map_err(|err| dependency_failure(&component_name, primary, name, err))?;
        provisional |= evaluated.provisional;
        determining.insert(name.clone(), evaluated.value);
    }

    let (info, resolution, previous) = {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        let node = state.document.node(component)?;
        let info = component_info(node);

        let cached = state.store.get(primary).and_then(|r| match (&r.resolution, &r.determining) {
            (Some(resolution), Some(values)) if *values == determining => Some(resolution.clone()),
            _ => None,
        });
        let resolution = match cached {
            Some(resolution) => {
                trace!(component = %component, variable = %primary.1, "reusing resolution");
                resolution
            }
            None => {
                let context = DependencyContext {
                    component: &info,
                    attributes: node.attributes(),
                    state_values: &determining,
                };
                let dependencies = match catch_unwind(AssertUnwindSafe(|| (definition.return_dependencies)(&context))) {
                    Ok(dependencies) => dependencies,
                    Err(payload) => {
                        state
                            .store
                            .set_dependencies(primary, determining_keys, vec![Watch::Component(component)]);
                        return Ok(Ran {
                            result: Err(DefinitionError::Panicked(panic_message(&*payload))),
                            dependency_values: DependencyValues::new(),
                            provisional,
                        });
                    }
                };
                let resolution = Arc::new(resolver::resolve(
                    &state.document,
                    &inner.registry,
                    component,
                    &dependencies,
                ));
                if let Some(record) = state.store.get_mut(primary) {
                    record.resolution = Some(resolution.clone());
                    record.determining = Some(determining.clone());
                }
                resolution
            }
        };

        let mut edges = determining_keys;
        for key in resolution.keys() {
            if !edges.contains(&key) {
                edges.push(key);
            }
        }
        state.store.set_dependencies(primary, edges, resolution.watches().to_vec());

        if let Some(reason) = resolution.unresolved() {
            return Err(EngineError::Unresolved {
                component: component_name.to_string(),
                variable: primary.1.to_string(),
                reason: reason.to_string(),
            });
        }
        let previous = state.store.get(primary).and_then(|r| r.previous.clone());
        (info, resolution, previous)
    };

    let mut dependency_values = DependencyValues::new();
    for (name, resolved) in resolution.iter() {
        let value = match resolved {
            Resolved::Literal(value) => DependencyValue::Value {
                value: value.clone(),
                used_default: false,
            },
            Resolved::Missing => DependencyValue::Missing,
            Resolved::Variable(key) => {
                let evaluated = evaluate_key(inner.clone(), key.clone(), Some(primary.clone()))
                    .await
                    .map_err(|err| dependency_failure(&component_name, primary, name, err))?;
                provisional |= evaluated.provisional;
                DependencyValue::Value {
                    value: evaluated.value,
                    used_default: evaluated.used_default,
                }
            }
            Resolved::Component(None) => DependencyValue::Component(None),
            Resolved::Component(Some(matched)) => {
                let (values, was_provisional) = read_component(inner, primary, matched)
                    .await
                    .map_err(|err| dependency_failure(&component_name, primary, name, err))?;
                provisional |= was_provisional;
                DependencyValue::Component(Some(values))
            }
            Resolved::Components(list) => {
                let mut all = Vec::with_capacity(list.len());
                for matched in list {
                    let (values, was_provisional) = read_component(inner, primary, matched)
                        .await
                        .map_err(|err| dependency_failure(&component_name, primary, name, err))?;
                    provisional |= was_provisional;
                    all.push(values);
                }
                DependencyValue::Components(all)
            }
        };
        dependency_values.insert(name.clone(), value);
    }

    let changed = previous
        .as_ref()
        .map(|p| dependency_values.changed_since(p))
        .unwrap_or_default();
    let context = DefinitionContext {
        component: info,
        variable: primary.1.clone(),
        dependency_values: dependency_values.clone(),
        changed,
        first_computation: previous.is_none(),
    };

    let result = match &definition.definition {
        None => Ok(DefinitionResult::use_essential_or_default()),
        Some(Definition::Sync(f)) => catch_unwind(AssertUnwindSafe(|| f(&context)))
            .unwrap_or_else(|payload| Err(DefinitionError::Panicked(panic_message(&*payload)))),
        Some(Definition::Async(f)) => match catch_unwind(AssertUnwindSafe(|| f(context))) {
            Ok(future) => run_guarded(future, inner.config.definition_timeout()).await,
            Err(payload) => Err(DefinitionError::Panicked(panic_message(&*payload))),
        },
    };

    Ok(Ran {
        result,
        dependency_values,
        provisional,
    })
}

async fn read_component(
    inner: &Arc<EngineInner>,
    primary: &VarKey,
    matched: &MatchedComponent,
) -> Result<(ComponentValues, bool)> {
    let mut provisional = false;
    let mut values = IndexMap::with_capacity(matched.variables.len());
    for (name, key) in &matched.variables {
        let evaluated = evaluate_key(inner.clone(), key.clone(), Some(primary.clone())).await?;
        provisional |= evaluated.provisional;
        values.insert(name.clone(), evaluated.value);
    }
    Ok((
        ComponentValues {
            info: matched.info.clone(),
            values,
        },
        provisional,
    ))
}

/// Wrap an unresolved dependency as this variable being unresolved.
fn dependency_failure(component: &str, primary: &VarKey, dependency: &str, err: EngineError) -> EngineError {
    if matches!(err, EngineError::Unresolved { .. }) {
        EngineError::Unresolved {
            component: component.to_string(),
            variable: primary.1.to_string(),
            reason: format!("dependency `{dependency}`: {err}"),
        }
    } else {
        err
    }
}

fn commit(
    state: &mut EngineState,
    primary: &VarKey,
    definition: &StateVariableDefinition,
    generation: u64,
    ran: Result<Ran>,
) -> Result<BatchOutput> {
    let members = state.store.batch_keys(primary);
    let current = state.store.get(primary).is_some_and(|r| r.generation == generation);

    let ran = match ran {
        Ok(ran) => ran,
        Err(err) => {
            for key in &members {
                if let Some(record) = state.store.get_mut(key) {
                    record.computing = false;
                    if let (true, EngineError::Unresolved { reason, .. }) = (current, &err) {
                        record.mark_unresolved(reason.clone());
                    }
                }
            }
            debug!(component = %primary.0, variable = %primary.1, error = %err, "evaluation failed");
            return Err(err);
        }
    };

    let settled = settle_outcomes(state, primary, definition, &members, &ran.result);
    let mut output = IndexMap::with_capacity(members.len());
    for (key, (value, used_default)) in members.iter().zip(settled) {
        if let Some(record) = state.store.get_mut(key) {
            record.computing = false;
            record.store(value.clone(), used_default, ran.provisional, current);
        }
        output.insert(
            key.1.clone(),
            Evaluated {
                value,
                provisional: ran.provisional,
                used_default,
            },
        );
    }
    if let Some(record) = state.store.get_mut(primary) {
        record.previous = Some(ran.dependency_values);
    }
    if !current {
        trace!(component = %primary.0, variable = %primary.1, "invalidated while computing, left stale");
    }
    Ok(Arc::new(output))
}

/// Turn a definition result into one value per batch member. A failed
/// definition, or one that leaves a member unsettled, puts the whole batch
/// on its defaults.
fn settle_outcomes(
    state: &EngineState,
    primary: &VarKey,
    definition: &StateVariableDefinition,
    members: &[VarKey],
    result: &std::result::Result<DefinitionResult, DefinitionError>,
) -> Vec<(Value, bool)> {
    let settled: std::result::Result<Vec<(Value, bool)>, DefinitionError> = match result {
        Err(err) => Err(err.clone()),
        Ok(result) => members
            .iter()
            .map(|key| match result.outcome_for(&key.1, &primary.1) {
                Some(Outcome::Set(value)) => Ok((value.clone(), false)),
                Some(Outcome::UseEssentialOrDefault) => Ok(essential_or_default(state, key, primary, definition)),
                Some(Outcome::NoChanges) => Ok(match state.store.get(key) {
                    Some(record) if record.value.is_some() => {
                        (record.value.clone().unwrap_or_default(), record.used_default)
                    }
                    _ => essential_or_default(state, key, primary, definition),
                }),
                None => Err(DefinitionError::message(format!("no value for `{}`", key.1))),
            })
            .collect(),
    };

    match settled {
        Ok(values) => values,
        Err(err) => {
            warn!(
                component = %primary.0,
                variable = %primary.1,
                error = %err,
                "definition failed, falling back to defaults"
            );
            members
                .iter()
                .map(|key| {
                    let value = definition.default_for(&key.1, &primary.1).cloned().unwrap_or_default();
                    (value, true)
                })
                .collect()
        }
    }
}

fn essential_or_default(
    state: &EngineState,
    key: &VarKey,
    primary: &VarKey,
    definition: &StateVariableDefinition,
) -> (Value, bool) {
    if definition.has_essential() {
        let stored = state
            .document
            .get(key.0)
            .and_then(|node| state.essentials.get(node.name(), &key.1));
        if let Some(value) = stored {
            return (value.clone(), false);
        }
    }
    let default = definition.default_for(&key.1, &primary.1).cloned().unwrap_or_default();
    (default, true)
}

fn cycle_fallback(
    state: &EngineState,
    key: &VarKey,
    primary: &VarKey,
    definition: &StateVariableDefinition,
) -> Evaluated {
    let last = state.store.get(key).and_then(|r| r.value.clone());
    let (value, used_default) = match last {
        Some(value) => (value, false),
        None => essential_or_default(state, key, primary, definition),
    };
    Evaluated {
        value,
        provisional: true,
        used_default,
    }
}

/// Await a callback future, turning panics and deadline overruns into
/// definition errors.
pub(super) async fn run_guarded<T>(
    future: BoxFuture<'static, std::result::Result<T, DefinitionError>>,
    timeout: Option<Duration>,
) -> std::result::Result<T, DefinitionError> {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(DefinitionError::TimedOut(limit.as_millis() as u64)),
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|payload| Err(DefinitionError::Panicked(panic_message(&*payload))))
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
