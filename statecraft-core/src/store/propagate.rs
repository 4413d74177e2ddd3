//! Invalidation Propagator
//!
//! When an essential value is written or the document structure changes,
//! everything that (transitively) read the old value must stop trusting
//! its cache. Propagation only marks records stale; recomputation happens
//! lazily on the next read.
//!
//! # Algorithm
//!
//! Breadth-first walk over consumer edges, starting from the changed
//! variables:
//!
//! 1. A root is always marked stale and always expands to its consumers.
//! 2. Every node is handled as a batch: co-defined variables go stale
//!    together.
//! 3. A batch that was already stale and idle stops the walk. Its
//!    consumers were marked when it went stale, since a fresh record
//!    never reads a stale one.
//! 4. A visited set guarantees each batch is handled at most once, so
//!    cyclic graphs terminate.
//!
//! Every visited record gets a new generation even if it was already
//! stale. An evaluation that started before the invalidation can then tell
//! that its result is outdated.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use super::graph::StateStore;
use super::record::VarKey;
use crate::document::ComponentId;
use crate::resolver::Watch;

/// The records an invalidation marked stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    marked: Vec<VarKey>,
}

impl InvalidationReport {
    /// Marked keys, in the order they were reached.
    pub fn marked(&self) -> &[VarKey] {
        &self.marked
    }

    pub fn contains(&self, component: ComponentId, variable: &str) -> bool {
        self.marked
            .iter()
            .any(|k| k.0 == component && &*k.1 == variable)
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    pub(crate) fn merge(&mut self, other: InvalidationReport) {
        for key in other.marked {
            if !self.marked.contains(&key) {
                self.marked.push(key);
            }
        }
    }
}

/// Mark `roots` and everything downstream of them stale.
pub(crate) fn invalidate(store: &mut StateStore, roots: impl IntoIterator<Item = VarKey>) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    let mut visited: HashSet<VarKey> = HashSet::new();
    let mut queue: VecDeque<(VarKey, bool)> = roots.into_iter().map(|k| (k, true)).collect();

    while let Some((key, is_root)) = queue.pop_front() {
        let members = store.batch_keys(&key);
        let primary = members.first().cloned().unwrap_or_else(|| key.clone());
        if !visited.insert(primary) {
            continue;
        }

        let mut live = false;
        for member in &members {
            if let Some(record) = store.get_mut(member) {
                if record.mark_stale() {
                    live = true;
                    report.marked.push(member.clone());
                    trace!(component = %member.0, variable = %member.1, "marked stale");
                }
            }
        }

        if !(live || is_root) {
            continue;
        }
        for member in &members {
            for consumer in store.consumers_of(member) {
                queue.push_back((consumer.clone(), false));
            }
        }
    }

    report
}

/// Batches whose resolution observed any of `watches`, with their cached
/// resolutions dropped.
pub(crate) fn take_watchers<'w>(
    store: &mut StateStore,
    watches: impl IntoIterator<Item = &'w Watch>,
) -> Vec<VarKey> {
    let mut hit: Vec<VarKey> = Vec::new();
    for watch in watches {
        for key in store.watchers_of(watch) {
            if !hit.contains(key) {
                hit.push(key.clone());
            }
        }
    }
    for key in &hit {
        store.clear_resolution(key);
    }
    hit
}
