//! Record Graph
//!
//! The store owns every [`Record`] plus the two reverse indexes that the
//! propagator walks: which records consume a given variable, and which
//! records watch a given piece of topology.
//!
//! Edges point from a dependency to the primary record of the consuming
//! batch. They may name variables that have no record yet; the record is
//! created the first time anything evaluates it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::record::{Freshness, Record, VarKey};
use crate::document::ComponentId;
use crate::resolver::Watch;
use crate::value::Value;

#[derive(Debug, Default)]
pub(crate) struct StateStore {
    records: HashMap<VarKey, Record>,
    /// dependency -> primary keys of consuming batches
    consumers: HashMap<VarKey, IndexSet<VarKey>>,
    watchers: HashMap<Watch, IndexSet<VarKey>>,
}

impl StateStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &VarKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &VarKey) -> Option<&mut Record> {
        self.records.get_mut(key)
    }

    pub(crate) fn freshness(&self, key: &VarKey) -> Freshness {
        self.records.get(key).map_or(Freshness::Stale, |r| r.freshness)
    }

    /// Create records for every member of a batch that lacks one.
    pub(crate) fn ensure_batch(&mut self, component: ComponentId, batch: &Arc<[Arc<str>]>) {
        for variable in batch.iter() {
            self.records
                .entry(VarKey(component, variable.clone()))
                .or_insert_with(|| Record::new(batch.clone()));
        }
    }

    /// Keys of every member of the batch `key` belongs to. A key without a
    /// record is its own batch.
    pub(crate) fn batch_keys(&self, key: &VarKey) -> SmallVec<[VarKey; 4]> {
        match self.records.get(key) {
            Some(record) => record
                .batch
                .iter()
                .map(|v| VarKey(key.0, v.clone()))
                .collect(),
            None => smallvec::smallvec![key.clone()],
        }
    }

    /// Replace the outgoing edges and watches of the batch whose primary is
    /// `consumer`.
    pub(crate) fn set_dependencies(
        &mut self,
        consumer: &VarKey,
        dependencies: SmallVec<[VarKey; 4]>,
        watches: Vec<Watch>,
    ) {
        let Some(record) = self.records.get_mut(consumer) else {
            return;
        };
        let old_dependencies = std::mem::replace(&mut record.dependencies, dependencies.clone());
        let old_watches = std::mem::replace(&mut record.watches, watches.clone());

        for dependency in old_dependencies {
            if let Some(set) = self.consumers.get_mut(&dependency) {
                set.shift_remove(consumer);
                if set.is_empty() {
                    self.consumers.remove(&dependency);
                }
            }
        }
        for watch in old_watches {
            if let Some(set) = self.watchers.get_mut(&watch) {
                set.shift_remove(consumer);
                if set.is_empty() {
                    self.watchers.remove(&watch);
                }
            }
        }

        for dependency in dependencies {
            self.consumers.entry(dependency).or_default().insert(consumer.clone());
        }
        for watch in watches {
            self.watchers.entry(watch).or_default().insert(consumer.clone());
        }
    }

    pub(crate) fn consumers_of(&self, key: &VarKey) -> impl Iterator<Item = &VarKey> {
        self.consumers.get(key).into_iter().flatten()
    }

    pub(crate) fn watchers_of(&self, watch: &Watch) -> impl Iterator<Item = &VarKey> {
        self.watchers.get(watch).into_iter().flatten()
    }

    /// Drop the cached resolution of a batch so the next evaluation
    /// re-resolves against the current document.
    pub(crate) fn clear_resolution(&mut self, primary: &VarKey) {
        if let Some(record) = self.records.get_mut(primary) {
            record.resolution = None;
            record.determining = None;
        }
    }

    /// Remove every record of a component. Returns the surviving consumers
    /// of the removed records.
    pub(crate) fn remove_component(&mut self, component: ComponentId) -> Vec<VarKey> {
        let removed: Vec<VarKey> = self
            .records
            .keys()
            .filter(|k| k.0 == component)
            .cloned()
            .collect();

        for key in &removed {
            self.set_dependencies(key, SmallVec::new(), Vec::new());
        }

        let mut orphans = IndexSet::new();
        for key in &removed {
            self.records.remove(key);
            if let Some(consumers) = self.consumers.remove(key) {
                orphans.extend(consumers.into_iter().filter(|c| c.0 != component));
            }
        }
        orphans.into_iter().collect()
    }

    /// Every provisional record with its current value.
    pub(crate) fn provisional_snapshot(&self) -> BTreeMap<VarKey, Option<Value>> {
        self.records
            .iter()
            .filter(|(_, r)| r.provisional)
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Accept the current values of these records as the fixed point.
    pub(crate) fn settle(&mut self, keys: impl IntoIterator<Item = VarKey>, frozen: bool) {
        for key in keys {
            if let Some(record) = self.records.get_mut(&key) {
                record.provisional = false;
                record.frozen = frozen;
            }
        }
    }

    /// Mark these records stale for another fixed-point pass. Values are
    /// kept as the starting point of the next pass.
    pub(crate) fn restale(&mut self, keys: impl IntoIterator<Item = VarKey>) {
        for key in keys {
            if let Some(record) = self.records.get_mut(&key) {
                record.mark_stale();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub(crate) fn mark_fresh(&mut self, key: &VarKey, value: Value) {
        if let Some(record) = self.records.get_mut(key) {
            record.store(value, false, false, true);
        }
    }
}
