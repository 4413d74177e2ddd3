//! Document Topology
//!
//! The document is the arena of component instances the engine evaluates
//! over. It owns identity (stable, generational [`ComponentId`]s), the
//! parent/child topology, attribute values, composite replacement lists
//! and copy provenance.
//!
//! The engine only reads it during dependency resolution. Mutations come
//! from the authoring layer through the [`Engine`](crate::engine::Engine)
//! so the engine can invalidate whatever observed the old structure.

mod node;
mod tree;

pub use node::{AttributeValue, ComponentId, ComponentNode, NewComponent};
pub use tree::Document;
