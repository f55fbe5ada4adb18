//! Thread-safe key/value state store with immutable reads (spec §4.1).
//!
//! Keys are flat dotted paths (`"_gxo.tasks.task_a.status"`,
//! `"produced_data"`). [`StateStore::get_all`] materializes the flat
//! keyspace into a nested mapping by splitting each key on `.`, which is
//! what the template renderer's data argument is built from.
//!
//! Values are [`serde_json::Value`], an owned tree — unlike the reference
//! system's dynamic-typed values, it cannot contain reference cycles, so the
//! identity-keyed cycle guard called for in the design is structurally
//! unreachable here; `clone()` on a `Value` is already a safe, total deep
//! copy. We still route every read through an explicit `deep_copy` step
//! rather than relying on `Clone` implicitly, so the copy boundary stays a
//! visible, single place to reason about (and to extend if a future value
//! representation reintroduces sharing).

use crate::error::{GxoError, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Reserved state key prefix for task status.
pub const STATUS_PREFIX: &str = "_gxo.tasks.";
pub const STATUS_SUFFIX: &str = ".status";

/// Build the reserved status key for a task.
pub fn status_key(task_name: &str) -> String {
    format!("{STATUS_PREFIX}{task_name}{STATUS_SUFFIX}")
}

/// Deep-copy a value. See the module docs for why this is a plain recursive
/// clone rather than an identity-tracking graph walk.
pub fn deep_copy(value: &Value) -> Value {
    value.clone()
}

/// Concurrency-safe key/value store. Reads return deep copies; writes store
/// the given value directly.
#[derive(Default)]
pub struct StateStore {
    data: RwLock<HashMap<String, Value>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a deep copy of the value at `key`, and whether it existed.
    pub fn get(&self, key: &str) -> (Value, bool) {
        let data = self.data.read();
        match data.get(key) {
            Some(v) => (deep_copy(v), true),
            None => (Value::Null, false),
        }
    }

    /// Materialize the entire flat keyspace as a nested mapping, splitting
    /// each key on `.`. Leaves are deep copies. When two keys collide (one a
    /// prefix of the other), the later-applied write wins; callers must not
    /// depend on which of two colliding writers wins, only that the result
    /// does not panic and stabilizes.
    pub fn get_all(&self) -> Value {
        let data = self.data.read();
        let mut root = Map::new();
        for (key, value) in data.iter() {
            insert_nested(&mut root, key, deep_copy(value));
        }
        Value::Object(root)
    }

    /// Store `value` under `key`. The store takes ownership; later reads of
    /// this key always yield fresh deep copies.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    /// Remove `key`. Errors with [`GxoError::KeyNotFound`] if absent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.write();
        if data.remove(key).is_none() {
            return Err(GxoError::KeyNotFound(key.to_string()));
        }
        Ok(())
    }

    /// Replace the entire store contents with a shallow clone of `map`.
    pub fn load(&self, map: HashMap<String, Value>) {
        *self.data.write() = map;
    }

    /// True if `key` is present, without copying its value.
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }
}

fn insert_nested(root: &mut Map<String, Value>, dotted_key: &str, value: Value) {
    let segments: Vec<&str> = dotted_key.split('.').collect();
    insert_path(root, &segments, value);
}

fn insert_path(root: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        root.insert((*head).to_string(), value);
        return;
    }
    // If a prior write left a non-object (or nothing) at `head`, overwrite
    // it with a fresh object so the deeper path can be materialized —
    // collisions resolve to whichever write is applied last, per contract.
    let entry = root
        .entry((*head).to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(map) = entry {
        insert_path(map, rest, value);
    }
}
