//! State Variable Store
//!
//! Per-instance records of every evaluated state variable, the consumer
//! edges between them, and the invalidation walk over those edges.
//!
//! # How Records Relate
//!
//! ```text
//! p1.value ──consumed by──> sum.value ──consumed by──> report.text
//!     ^                          |
//!     └──── watches(Name "p1") ──┘
//! ```
//!
//! A record lists the variables it read (its dependencies). The store
//! keeps the reverse direction (consumers) so invalidation can walk
//! downstream without scanning. Structural resolutions additionally
//! register [`Watch`](crate::resolver::Watch)es that let topology changes
//! find the records that observed the old shape.

mod graph;
mod propagate;
mod record;

pub(crate) use graph::StateStore;
pub(crate) use propagate::{invalidate, take_watchers};
pub use propagate::InvalidationReport;
pub(crate) use record::Record;
pub use record::{Freshness, VarKey};
