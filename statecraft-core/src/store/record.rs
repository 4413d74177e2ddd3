//! State Variable Records
//!
//! A record is the mutable, per-instance half of a state variable: the
//! cached value, its freshness, and the bookkeeping the evaluator needs to
//! decide whether the cache can be trusted.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::component::DependencyValues;
use crate::document::ComponentId;
use crate::resolver::{Resolution, Watch};
use crate::value::Value;

/// Identity of one state variable instance.
///
/// Always refers to a canonical (non-alias) variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarKey(pub ComponentId, pub Arc<str>);

impl VarKey {
    pub fn new(component: ComponentId, variable: impl Into<Arc<str>>) -> Self {
        Self(component, variable.into())
    }

    pub fn component(&self) -> ComponentId {
        self.0
    }

    pub fn variable(&self) -> &Arc<str> {
        &self.1
    }
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Freshness of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// The value reflects the current dependency values.
    Fresh,

    /// Something this value depends on changed, or it was never computed.
    #[default]
    Stale,

    /// A required dependency could not be resolved against the current
    /// document. Becomes stale again when the topology it observed changes.
    Unresolved,
}

/// The cached state of one variable instance.
#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) value: Option<Value>,
    pub(crate) freshness: Freshness,

    /// The value came from a declared default (or null) rather than a
    /// definition or an essential value.
    pub(crate) used_default: bool,

    /// Computed from a cycle fallback and not yet confirmed by the
    /// fixed-point loop.
    pub(crate) provisional: bool,

    /// The fixed-point loop gave up and pinned this value.
    pub(crate) frozen: bool,

    /// A computation of this batch is running.
    pub(crate) computing: bool,

    /// Bumped on every invalidation. A computation only marks the record
    /// fresh if the generation it started with is still current.
    pub(crate) generation: u64,

    /// Every variable produced by the same definition, primary first.
    pub(crate) batch: Arc<[Arc<str>]>,

    pub(crate) unresolved: Option<String>,

    // The remaining fields are only maintained on the primary record.
    pub(crate) resolution: Option<Arc<Resolution>>,
    /// Values of the determining variables the resolution was derived from.
    pub(crate) determining: Option<IndexMap<Arc<str>, Value>>,
    /// Dependency values handed to the last definition call.
    pub(crate) previous: Option<DependencyValues>,
    pub(crate) dependencies: SmallVec<[VarKey; 4]>,
    pub(crate) watches: Vec<Watch>,
}

impl Record {
    pub(crate) fn new(batch: Arc<[Arc<str>]>) -> Self {
        Self {
            value: None,
            freshness: Freshness::Stale,
            used_default: false,
            provisional: false,
            frozen: false,
            computing: false,
            generation: 0,
            batch,
            unresolved: None,
            resolution: None,
            determining: None,
            previous: None,
            dependencies: SmallVec::new(),
            watches: Vec::new(),
        }
    }

    pub(crate) fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }

    /// Mark stale and start a new generation. Returns whether anything
    /// beyond the generation changed.
    pub(crate) fn mark_stale(&mut self) -> bool {
        self.generation += 1;
        let was_live = self.freshness != Freshness::Stale || self.computing;
        self.freshness = Freshness::Stale;
        self.unresolved = None;
        was_live
    }

    pub(crate) fn store(&mut self, value: Value, used_default: bool, provisional: bool, fresh: bool) {
        self.value = Some(value);
        self.used_default = used_default;
        self.provisional = provisional;
        self.frozen = false;
        if fresh {
            self.freshness = Freshness::Fresh;
        }
    }

    pub(crate) fn mark_unresolved(&mut self, reason: String) {
        self.freshness = Freshness::Unresolved;
        self.unresolved = Some(reason);
        self.provisional = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(names: &[&str]) -> Arc<[Arc<str>]> {
        names.iter().map(|n| Arc::<str>::from(*n)).collect()
    }

    #[test]
    fn new_records_are_stale() {
        let record = Record::new(batch(&["value"]));
        assert_eq!(record.freshness, Freshness::Stale);
        assert!(record.value.is_none());
        assert_eq!(record.batch.first().map(|p| &**p), Some("value"));
    }

    #[test]
    fn stale_marking_bumps_generation() {
        let mut record = Record::new(batch(&["value"]));
        record.store(Value::Number(1.0), false, false, true);
        assert!(record.is_fresh());

        assert!(record.mark_stale());
        assert_eq!(record.generation, 1);
        assert_eq!(record.value, Some(Value::Number(1.0)));

        // Already stale and idle: only the generation moves.
        assert!(!record.mark_stale());
        assert_eq!(record.generation, 2);
    }

    #[test]
    fn unresolved_records_report_their_reason() {
        let mut record = Record::new(batch(&["value"]));
        record.mark_unresolved("no component named `p`".into());
        assert_eq!(record.freshness, Freshness::Unresolved);
        assert!(record.mark_stale());
        assert!(record.unresolved.is_none());
    }

    #[test]
    fn var_keys_order_by_component_then_name() {
        let a = VarKey::new(ComponentId::new(0, 0), "b");
        let b = VarKey::new(ComponentId::new(1, 0), "a");
        assert!(a < b);
        assert_eq!(a.to_string(), "#0v0.b");
    }
}
