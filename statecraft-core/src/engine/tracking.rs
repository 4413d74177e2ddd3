//! In-Flight Tracking
//!
//! Two pieces of bookkeeping keep concurrent evaluation correct:
//!
//! - **Single flight.** At most one computation per batch runs at a time.
//!   Every reader of a stale batch awaits the same shared future.
//! - **Waits-for.** A computation records which batch it is currently
//!   awaiting. Before a computation awaits another one, the chain of
//!   waits starting at the target is followed. If it leads back to the
//!   requester, awaiting would deadlock: that is a cycle, and the caller
//!   falls back to a provisional value instead.
//!
//! Each computation awaits its dependencies one at a time, so every
//! computing batch waits on at most one other. The waits-for relation is
//! therefore a map, and following it is a walk, not a search.
//!
//! Joins happen while the engine's state lock is held, which makes "check
//! for a cycle, then register the wait" atomic.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::store::{Record, VarKey};
use crate::value::Value;

/// A value handed out by the forward evaluator.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Evaluated {
    pub(crate) value: Value,
    /// Derived (directly or not) from a cycle fallback.
    pub(crate) provisional: bool,
    pub(crate) used_default: bool,
}

impl Evaluated {
    pub(crate) fn from_record(record: &Record) -> Self {
        Self {
            value: record.value.clone().unwrap_or_default(),
            provisional: record.provisional,
            used_default: record.used_default,
        }
    }
}

/// Values of every member of a batch, by variable name.
pub(crate) type BatchOutput = Arc<IndexMap<Arc<str>, Evaluated>>;
pub(crate) type BatchFuture = Shared<BoxFuture<'static, Result<BatchOutput>>>;

pub(crate) enum Join {
    /// Awaiting the target would close a cycle.
    Cycle,
    Wait(BatchFuture),
}

#[derive(Default)]
pub(crate) struct Tracker {
    in_flight: DashMap<VarKey, BatchFuture>,
    waits_for: Mutex<HashMap<VarKey, VarKey>>,
}

impl Tracker {
    /// Join the computation of `target`, starting it if none is running.
    ///
    /// `requester` is the primary key of the computation asking, or `None`
    /// for a top-level read.
    pub(crate) fn join_or_start<F>(&self, requester: Option<&VarKey>, target: &VarKey, start: F) -> Join
    where
        F: FnOnce() -> BoxFuture<'static, Result<BatchOutput>>,
    {
        let mut waits = self.waits_for.lock();
        if let Some(requester) = requester {
            if self.in_flight.contains_key(target) && closes_cycle(&waits, requester, target) {
                return Join::Cycle;
            }
        }
        let future = self
            .in_flight
            .entry(target.clone())
            .or_insert_with(|| start().shared())
            .clone();
        if let Some(requester) = requester {
            waits.insert(requester.clone(), target.clone());
        }
        Join::Wait(future)
    }

    /// Hold the wait `requester` registered in its last join until the
    /// returned guard drops. A cancelled await drops it too.
    pub(crate) fn waiting(&self, requester: VarKey) -> Waiting<'_> {
        Waiting {
            tracker: self,
            requester,
        }
    }

    /// The computation of `key` has stored its results.
    pub(crate) fn finish(&self, key: &VarKey) {
        self.in_flight.remove(key);
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// An outstanding entry in the waits-for map.
pub(crate) struct Waiting<'a> {
    tracker: &'a Tracker,
    requester: VarKey,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.tracker.waits_for.lock().remove(&self.requester);
    }
}

fn closes_cycle(waits: &HashMap<VarKey, VarKey>, requester: &VarKey, target: &VarKey) -> bool {
    let mut current = target;
    // A chain longer than the map has to repeat without reaching us.
    for _ in 0..=waits.len() {
        if current == requester {
            return true;
        }
        match waits.get(current) {
            Some(next) => current = next,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ComponentId;

    fn key(slot: u32, name: &str) -> VarKey {
        VarKey::new(ComponentId::new(slot, 0), name)
    }

    fn idle() -> BoxFuture<'static, Result<BatchOutput>> {
        async { Ok(BatchOutput::default()) }.boxed()
    }

    #[test]
    fn direct_and_transitive_cycles_are_found() {
        let mut waits = HashMap::new();
        let (a, b, c) = (key(0, "x"), key(1, "x"), key(2, "x"));
        assert!(closes_cycle(&waits, &a, &a));

        waits.insert(b.clone(), c.clone());
        waits.insert(c.clone(), a.clone());
        assert!(closes_cycle(&waits, &a, &b));
        assert!(!closes_cycle(&waits, &b, &a));
    }

    #[test]
    fn looping_chains_terminate() {
        let mut waits = HashMap::new();
        let (a, b, c) = (key(0, "x"), key(1, "x"), key(2, "x"));
        waits.insert(b.clone(), c.clone());
        waits.insert(c.clone(), b.clone());
        assert!(!closes_cycle(&waits, &a, &b));
    }

    #[test]
    fn joins_share_one_future() {
        let tracker = Tracker::default();
        let target = key(0, "value");
        let mut starts = 0;
        for _ in 0..3 {
            let join = tracker.join_or_start(None, &target, || {
                starts += 1;
                idle()
            });
            assert!(matches!(join, Join::Wait(_)));
        }
        assert_eq!(starts, 1);
        assert_eq!(tracker.in_flight(), 1);

        tracker.finish(&target);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn waiting_on_a_waiter_is_a_cycle() {
        let tracker = Tracker::default();
        let (a, b) = (key(0, "x"), key(1, "x"));

        // a is computing and waits on b.
        tracker.join_or_start(None, &a, idle);
        assert!(matches!(tracker.join_or_start(Some(&a), &b, idle), Join::Wait(_)));
        let waiting = tracker.waiting(a.clone());

        // b now asks for a.
        assert!(matches!(tracker.join_or_start(Some(&b), &a, idle), Join::Cycle));

        drop(waiting);
        assert!(matches!(tracker.join_or_start(Some(&b), &a, idle), Join::Wait(_)));
    }

    #[tokio::test]
    async fn abandoned_waits_are_cleared() {
        let tracker = Tracker::default();
        let (a, b) = (key(0, "x"), key(1, "x"));
        tracker.join_or_start(None, &a, idle);

        let Join::Wait(b_done) = tracker.join_or_start(Some(&a), &b, || futures_util::future::pending().boxed())
        else {
            panic!("b is not waiting on anything");
        };
        let awaiting = async {
            let _waiting = tracker.waiting(a.clone());
            b_done.await
        };
        // Poll once so the await is underway, then give up on it.
        let mut awaiting = Box::pin(awaiting);
        assert!(futures_util::poll!(awaiting.as_mut()).is_pending());
        drop(awaiting);

        assert!(matches!(tracker.join_or_start(Some(&b), &a, idle), Join::Wait(_)));
    }
}
