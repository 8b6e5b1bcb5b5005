// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`CrdtMap`] — keyed last-writer-wins register with local tombstones.
//!
//! Each entry carries `(value, timestamp, writer node id)`. Merge keeps, per
//! key, the entry with the greater `(timestamp, node_id)` — the writer id
//! breaks timestamp ties lexicographically so both sides of an exchange make
//! the same choice. `remove` is a local tombstone: the key is dropped here
//! and the removal propagates only by the key being absent from our next
//! state exchange (a concurrent remote write will resurrect it; that is the
//! documented LWW trade-off).
//!
//! Remote values that are not `{value, timestamp, node_id}` envelopes are
//! rejected: stamping a bare scalar with a fresh local timestamp would let
//! replayed stale state win the merge.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall-clock seconds since the Unix epoch, fractional.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One LWW register: a value stamped with its writer and write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtEntry {
    pub value: Value,
    pub timestamp: f64,
    pub node_id: String,
}

impl CrdtEntry {
    /// True when `self` wins against `other` under the LWW total order.
    fn wins_over(&self, other: &CrdtEntry) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        self.node_id > other.node_id
    }
}

/// Keyed last-writer-wins map.
#[derive(Debug, Clone, Default)]
pub struct CrdtMap {
    node_id: String,
    entries: HashMap<String, CrdtEntry>,
}

impl CrdtMap {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            entries: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set a value, stamping it with `(now, self.node_id)`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.entries.insert(
            key,
            CrdtEntry {
                value,
                timestamp: unix_now(),
                node_id: self.node_id.clone(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    /// Remove a key locally (tombstone by absence).
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn items(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Flattened `key → value` view.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Raw `key → entry` state for synchronization, as a JSON object.
    pub fn get_state(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), serde_json::to_value(e).unwrap_or(Value::Null)))
            .collect();
        Value::Object(map)
    }

    /// Merge a remote state (the JSON object produced by [`get_state`]).
    ///
    /// Returns the flattened merged view. Non-envelope values are skipped.
    ///
    /// [`get_state`]: CrdtMap::get_state
    pub fn merge(&mut self, other_state: &Value) -> HashMap<String, Value> {
        let Some(obj) = other_state.as_object() else {
            tracing::debug!("CRDT merge: state is not an object, ignoring");
            return self.get_all();
        };

        for (key, entry_data) in obj {
            let other: CrdtEntry = match serde_json::from_value(entry_data.clone()) {
                Ok(e) => e,
                Err(_) => {
                    tracing::debug!(%key, "CRDT merge: rejecting non-envelope value");
                    continue;
                }
            };

            match self.entries.get(key) {
                Some(ours) if !other.wins_over(ours) => {}
                _ => {
                    self.entries.insert(key.clone(), other);
                }
            }
        }

        self.get_all()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
