//! Essential-Value Persistence
//!
//! Essential values are the authoritative, non-derivable state of a
//! document: what a learner typed, which answer was submitted, how much
//! credit was awarded. Everything else is recomputed from them.
//!
//! # Storage
//!
//! Values are keyed by component *name* rather than
//! [`ComponentId`](crate::document::ComponentId). Names survive a reload of
//! the document, ids do not. A saved state can therefore be restored before the
//! components it mentions exist; the values are picked up when a component
//! with that name is created and first evaluated.
//!
//! # Formats
//!
//! [`SavedState`] serializes to JSON (`serde_json`) and MessagePack
//! (`rmp-serde`). Both carry a version number that is checked on load.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::value::Value;

/// Authoritative stateful values, by component name then variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EssentialStore {
    values: IndexMap<Arc<str>, IndexMap<Arc<str>, Value>>,
}

impl EssentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, component: &str, variable: &str) -> Option<&Value> {
        self.values.get(component)?.get(variable)
    }

    /// Write a value. Returns the previous one.
    pub fn set(&mut self, component: Arc<str>, variable: Arc<str>, value: Value) -> Option<Value> {
        self.values.entry(component).or_default().insert(variable, value)
    }

    pub fn remove(&mut self, component: &str, variable: &str) -> Option<Value> {
        let entries = self.values.get_mut(component)?;
        let previous = entries.shift_remove(variable);
        if entries.is_empty() {
            self.values.shift_remove(component);
        }
        previous
    }

    /// Forget everything stored for a component. Returns how many values
    /// went.
    pub fn remove_component(&mut self, component: &str) -> usize {
        self.values.shift_remove(component).map_or(0, |vars| vars.len())
    }

    /// Put back what a journal recorded: the previous value, or nothing.
    pub(crate) fn restore(&mut self, component: Arc<str>, variable: Arc<str>, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.set(component, variable, value);
            }
            None => {
                self.remove(&component, &variable);
            }
        }
    }

    /// Every stored variable of one component.
    pub fn component(&self, component: &str) -> impl Iterator<Item = (&Arc<str>, &Value)> {
        self.values.get(component).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.values.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn save(&self) -> SavedState {
        SavedState {
            version: SavedState::CURRENT_VERSION,
            components: self
                .values
                .iter()
                .map(|(c, vars)| {
                    let vars = vars.iter().map(|(v, value)| (v.to_string(), value.clone())).collect();
                    (c.to_string(), vars)
                })
                .collect(),
        }
    }

    /// Replace the contents with a saved state.
    pub fn load(&mut self, state: &SavedState) -> Result<(), PersistenceError> {
        state.check_version()?;
        self.values = state
            .components
            .iter()
            .map(|(c, vars)| {
                let vars = vars
                    .iter()
                    .map(|(v, value)| (Arc::from(v.as_str()), value.clone()))
                    .collect();
                (Arc::from(c.as_str()), vars)
            })
            .collect();
        Ok(())
    }
}

/// Serializable snapshot of every essential value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SavedState {
    pub version: u32,
    pub components: IndexMap<String, IndexMap<String, Value>>,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            components: IndexMap::new(),
        }
    }
}

impl SavedState {
    pub const CURRENT_VERSION: u32 = 1;

    fn check_version(&self) -> Result<(), PersistenceError> {
        if self.version == 0 || self.version > Self::CURRENT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: self.version,
                supported: Self::CURRENT_VERSION,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let state: Self = serde_json::from_str(json)?;
        state.check_version()?;
        Ok(state)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let state: Self = rmp_serde::from_slice(bytes)?;
        state.check_version()?;
        Ok(state)
    }

    pub fn get(&self, component: &str, variable: &str) -> Option<&Value> {
        self.components.get(component)?.get(variable)
    }
}
