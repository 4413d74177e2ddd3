//! Engine
//!
//! The [`Engine`] ties the document, the state variable store and the
//! essential values together and is the only way in for the authoring
//! layer.
//!
//! # How It Works
//!
//! 1. Reads (`evaluate`) are lazy. A stale variable is recomputed on
//!    demand, recursing through its dependencies (see [`forward`]).
//!
//! 2. Writes go through inverse definitions (`request_value`,
//!    `perform_update`) or directly to essential storage
//!    (`set_essential_value`). Either way the written records and
//!    everything downstream are marked stale, nothing is recomputed.
//!
//! 3. Structural mutations (adding or removing components, changing
//!    attributes or a composite's replacements) find the records whose
//!    cached resolution observed the changed topology, drop those
//!    resolutions and invalidate the records.
//!
//! # Thread Safety
//!
//! `Engine` is a cheap, cloneable handle. All mutable state sits behind a
//! single mutex that is never held across an `.await`, so callbacks are
//! free to be asynchronous and concurrent readers share in-flight work.

mod forward;
mod inverse;
mod tracking;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::component::{ComponentClass, Registry};
use crate::config::EngineConfig;
use crate::document::{AttributeValue, ComponentId, ComponentNode, Document, NewComponent};
use crate::error::{EngineError, Result};
use crate::essential::{EssentialStore, SavedState};
use crate::resolver::Watch;
use crate::store::{invalidate, take_watchers, Freshness, InvalidationReport, StateStore, VarKey};
use crate::value::Value;

pub use inverse::{AppliedWrite, InverseReport, UpdateInstruction, UpdateReport};

use tracking::Tracker;

pub(crate) struct EngineState {
    pub(crate) document: Document,
    pub(crate) store: StateStore,
    pub(crate) essentials: EssentialStore,
}

impl EngineState {
    pub(crate) fn class_of(&self, registry: &Registry, id: ComponentId) -> Result<Arc<ComponentClass>> {
        let node = self.document.node(id)?;
        registry
            .get(node.component_type())
            .cloned()
            .ok_or_else(|| EngineError::UnknownComponentType(node.component_type().to_string()))
    }

    /// Display name of a component for error messages.
    pub(crate) fn name_of(&self, id: ComponentId) -> String {
        self.document
            .get(id)
            .map_or_else(|| id.to_string(), |n| n.name().to_string())
    }

    pub(crate) fn unknown_variable(&self, id: ComponentId, variable: &str) -> EngineError {
        EngineError::UnknownVariable {
            component: self.name_of(id),
            variable: variable.to_string(),
        }
    }

    /// Key of a variable with aliases followed.
    pub(crate) fn canonical_key(&self, registry: &Registry, id: ComponentId, variable: &str) -> Result<VarKey> {
        let class = self.class_of(registry, id)?;
        match class.canonical(variable) {
            Some(canonical) => Ok(VarKey(id, canonical)),
            None => Err(self.unknown_variable(id, variable)),
        }
    }

    /// Invalidate whatever observed `watches`, plus `extra` roots.
    fn structural_change(&mut self, watches: &[Watch], extra: Vec<VarKey>) -> InvalidationReport {
        let mut roots = take_watchers(&mut self.store, watches);
        for key in extra {
            self.store.clear_resolution(&key);
            if !roots.contains(&key) {
                roots.push(key);
            }
        }
        invalidate(&mut self.store, roots)
    }

    /// Topology observed by anything that could see `id` come or go.
    fn watches_around(&self, id: ComponentId) -> Vec<Watch> {
        let mut watches = vec![Watch::Document];
        for owned in self.document.owned_subtree(id) {
            watches.push(Watch::Component(owned));
            if let Some(node) = self.document.get(owned) {
                watches.push(Watch::Name(node.name().clone()));
            }
        }
        watches.extend(self.document.ancestors(id).into_iter().map(Watch::Component));
        watches
    }

    /// Remove a component subtree with the records and essential values of
    /// every removed node. Returns the surviving records that read any of them.
    fn remove_subtree(&mut self, id: ComponentId) -> Result<Vec<VarKey>> {
        let removed = self.document.remove(id)?;
        let mut orphans = Vec::new();
        for node in &removed {
            orphans.extend(self.store.remove_component(node.id()));
            let dropped = self.essentials.remove_component(node.name());
            if dropped > 0 {
                trace!(component = %node.name(), dropped, "essential values dropped");
            }
        }
        orphans.retain(|k| self.document.contains(k.0));
        Ok(orphans)
    }
}

pub(crate) struct EngineInner {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) tracker: Tracker,
}

/// Handle to one document's state-variable engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::new(registry, EngineConfig::default());
/// let m = engine.add_component(NewComponent::new("math").named("m"))?;
/// let report = engine.request_value(m, "value", Value::Number(3.0)).await?;
/// assert_eq!(engine.evaluate(m, "value").await?, Value::Number(3.0));
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("component_types", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                config,
                state: Mutex::new(EngineState {
                    document: Document::new(),
                    store: StateStore::new(),
                    essentials: EssentialStore::new(),
                }),
                tracker: Tracker::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// Add a component. Anything whose resolution could now match it is
    /// invalidated.
    pub fn add_component(&self, component: NewComponent) -> Result<ComponentId> {
        if self.inner.registry.get(&component.component_type).is_none() {
            return Err(EngineError::UnknownComponentType(component.component_type.to_string()));
        }
        let mut state = self.inner.state.lock();
        let id = state.document.insert(component)?;
        let watches = state.watches_around(id);
        let report = state.structural_change(&watches, Vec::new());
        debug!(component = %id, marked = report.len(), "component added");
        Ok(id)
    }

    /// Remove a component and everything it owns.
    pub fn remove_component(&self, id: ComponentId) -> Result<InvalidationReport> {
        let mut state = self.inner.state.lock();
        state.document.node(id)?;
        let watches = state.watches_around(id);
        let orphans = state.remove_subtree(id)?;
        let report = state.structural_change(&watches, orphans);
        debug!(component = %id, marked = report.len(), "component removed");
        Ok(report)
    }

    pub fn set_attribute(
        &self,
        id: ComponentId,
        name: impl Into<Arc<str>>,
        value: impl Into<AttributeValue>,
    ) -> Result<InvalidationReport> {
        let mut state = self.inner.state.lock();
        state.document.set_attribute(id, name.into(), value.into())?;
        let report = state.structural_change(&[Watch::Component(id)], Vec::new());
        debug!(component = %id, marked = report.len(), "attribute changed");
        Ok(report)
    }

    /// Replace the replacement list of a composite. Replacements no longer
    /// listed are removed from the document.
    pub fn set_replacements(&self, composite: ComponentId, replacements: Vec<ComponentId>) -> Result<InvalidationReport> {
        let mut state = self.inner.state.lock();
        let mut watches = state.watches_around(composite);
        let dropped = state.document.set_replacements(composite, replacements)?;
        let mut orphans = Vec::new();
        for id in dropped {
            watches.extend(state.watches_around(id));
            orphans.extend(state.remove_subtree(id)?);
        }
        let report = state.structural_change(&watches, orphans);
        debug!(component = %composite, marked = report.len(), "replacements changed");
        Ok(report)
    }

    pub fn component_id(&self, name: &str) -> Option<ComponentId> {
        self.inner.state.lock().document.lookup(name)
    }

    /// Snapshot of one component's node.
    pub fn component(&self, id: ComponentId) -> Option<ComponentNode> {
        self.inner.state.lock().document.get(id).cloned()
    }

    /// Run `f` with read access to the document.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.inner.state.lock().document)
    }

    // =========================================================================
    // Forward evaluation
    // =========================================================================

    /// Current value of a state variable, recomputing whatever is stale.
    ///
    /// A cycle that does not settle within `max_fixed_point_passes` keeps
    /// its last values; use [`evaluate_converged`](Self::evaluate_converged)
    /// to treat that as an error.
    pub async fn evaluate(&self, id: ComponentId, variable: &str) -> Result<Value> {
        let key = self.key(id, variable)?;
        let (evaluated, _) = forward::evaluate_settled(&self.inner, key).await?;
        Ok(evaluated.value)
    }

    pub async fn evaluate_named(&self, component: &str, variable: &str) -> Result<Value> {
        let id = self
            .component_id(component)
            .ok_or_else(|| EngineError::UnknownComponentName(component.to_string()))?;
        self.evaluate(id, variable).await
    }

    /// Like [`evaluate`](Self::evaluate), but a cycle that had to be frozen
    /// is a [`EngineError::Cycle`].
    pub async fn evaluate_converged(&self, id: ComponentId, variable: &str) -> Result<Value> {
        let key = self.key(id, variable)?;
        let (evaluated, frozen) = forward::evaluate_settled(&self.inner, key.clone()).await?;
        let state = self.inner.state.lock();
        if frozen || state.store.get(&key).is_some_and(|r| r.frozen) {
            return Err(EngineError::Cycle {
                component: state.name_of(id),
                variable: key.1.to_string(),
                passes: self.inner.config.max_fixed_point_passes,
            });
        }
        Ok(evaluated.value)
    }

    /// Cached value, if fresh. Never computes.
    pub fn peek(&self, id: ComponentId, variable: &str) -> Option<Value> {
        let key = self.key(id, variable).ok()?;
        let state = self.inner.state.lock();
        state
            .store
            .get(&key)
            .filter(|r| r.is_fresh() && !r.provisional)
            .and_then(|r| r.value.clone())
    }

    pub fn status(&self, id: ComponentId, variable: &str) -> Result<Freshness> {
        let key = self.key(id, variable)?;
        Ok(self.inner.state.lock().store.freshness(&key))
    }

    /// Every state variable of a component (aliases included) that can be
    /// evaluated. Unresolved variables are left out.
    pub async fn return_all_state_variables(&self, id: ComponentId) -> Result<IndexMap<Arc<str>, Value>> {
        let names: Vec<Arc<str>> = {
            let state = self.inner.state.lock();
            state.class_of(&self.inner.registry, id)?.variable_names().cloned().collect()
        };
        self.evaluate_all(id, names).await
    }

    /// The public and renderer-facing state variables of a component.
    pub async fn return_public_state_variables(&self, id: ComponentId) -> Result<IndexMap<Arc<str>, Value>> {
        let names: Vec<Arc<str>> = {
            let state = self.inner.state.lock();
            let class = state.class_of(&self.inner.registry, id)?;
            class
                .variable_names()
                .filter(|name| {
                    class
                        .definition_for(name)
                        .is_some_and(|(_, def)| def.is_public() || def.is_for_renderer())
                })
                .cloned()
                .collect()
        };
        self.evaluate_all(id, names).await
    }

    async fn evaluate_all(&self, id: ComponentId, names: Vec<Arc<str>>) -> Result<IndexMap<Arc<str>, Value>> {
        let mut values = IndexMap::with_capacity(names.len());
        for name in names {
            match self.evaluate(id, &name).await {
                Ok(value) => {
                    values.insert(name, value);
                }
                Err(EngineError::Unresolved { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(values)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Ask a variable to take `value` through its inverse definition and
    /// report what it actually became.
    pub async fn request_value(
        &self,
        id: ComponentId,
        variable: &str,
        value: impl Into<Value>,
    ) -> Result<InverseReport> {
        let key = self.key(id, variable)?;
        Ok(inverse::request_value(&self.inner, key, value.into()).await)
    }

    /// Apply several requests as one transaction.
    pub async fn perform_update(&self, instructions: Vec<UpdateInstruction>) -> UpdateReport {
        inverse::perform_update(&self.inner, instructions).await
    }

    /// Write an essential value directly, bypassing inverse definitions.
    pub fn set_essential_value(
        &self,
        id: ComponentId,
        variable: &str,
        value: impl Into<Value>,
    ) -> Result<InvalidationReport> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let key = state.canonical_key(&self.inner.registry, id, variable)?;
        let class = state.class_of(&self.inner.registry, id)?;
        if !class.has_essential(&key.1) {
            return Err(EngineError::ModificationRejected {
                component: state.name_of(id),
                variable: key.1.to_string(),
                reason: "has no essential value".to_string(),
            });
        }
        let name = state.document.node(id)?.name().clone();
        state.essentials.set(name, key.1.clone(), value.into());
        let report = invalidate(&mut state.store, [key]);
        debug!(component = %id, variable = variable, marked = report.len(), "essential value set");
        Ok(report)
    }

    pub fn essential_value(&self, id: ComponentId, variable: &str) -> Option<Value> {
        let state = self.inner.state.lock();
        let key = state.canonical_key(&self.inner.registry, id, variable).ok()?;
        let node = state.document.get(id)?;
        state.essentials.get(node.name(), &key.1).cloned()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn save_state(&self) -> SavedState {
        self.inner.state.lock().essentials.save()
    }

    /// Replace every essential value with a saved state. Values for
    /// components that do not exist yet are kept until they do.
    pub fn restore_state(&self, saved: &SavedState) -> Result<InvalidationReport> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.essentials.load(saved)?;

        let mut roots = Vec::new();
        for id in state.document.names().into_values() {
            let Ok(class) = state.class_of(&self.inner.registry, id) else {
                continue;
            };
            for variable in class.variable_names().filter(|v| class.has_essential(v)) {
                if let Some(canonical) = class.canonical(variable) {
                    let key = VarKey(id, canonical);
                    if !roots.contains(&key) {
                        roots.push(key);
                    }
                }
            }
        }
        let report = invalidate(&mut state.store, roots);
        debug!(marked = report.len(), "state restored");
        Ok(report)
    }

    fn key(&self, id: ComponentId, variable: &str) -> Result<VarKey> {
        self.inner
            .state
            .lock()
            .canonical_key(&self.inner.registry, id, variable)
    }
}
