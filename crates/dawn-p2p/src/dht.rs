// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Kademlia-style DHT: k-buckets, iterative lookups, and a TTL'd value
//! store.
//!
//! Identifier space is 256-bit (node ids are 32-byte hex). Distance is XOR,
//! compared as a big-endian integer; bucket index is `bit_length(dist) − 1`
//! with distance 0 mapping to bucket 0. Buckets hold up to `K` contacts,
//! most-recently-seen first, and drop the tail when full.
//!
//! Iterative lookups query `ALPHA` candidates per round through the
//! [`DhtRpc`] trait the router implements; partial failures are tolerated
//! and the shortlist is re-sorted and truncated to `K` after every round.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use dawn_crdt::unix_now;

use crate::error::P2pError;

pub const K: usize = 20;
pub const ALPHA: usize = 3;
pub const ID_BITS: usize = 256;
const MAX_ROUNDS: usize = 10;
pub const DEFAULT_TTL: f64 = 3600.0;

/// How the DHT reaches other nodes: the router provides the transport.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// Send `method(params)` to `node_id` (dialing `address` if necessary)
    /// and return the JSON-RPC `result` value.
    async fn call(
        &self,
        node_id: &str,
        address: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, P2pError>;
}

/// One DHT contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DhtNodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "unix_now")]
    pub last_seen: f64,
}

impl DhtNodeInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            last_seen: unix_now(),
        }
    }
}

/// XOR distance between two 256-bit hex ids, as a big-endian byte array.
/// `None` when either id is not 32 bytes of hex.
pub fn xor_distance(a: &str, b: &str) -> Option<[u8; 32]> {
    let a = hex::decode(a).ok()?;
    let b = hex::decode(b).ok()?;
    if a.len() != 32 || b.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    Some(out)
}

/// Index of the highest set bit (0-based from the least significant end);
/// distance 0 maps to bucket 0.
pub fn bucket_index(distance: &[u8; 32]) -> usize {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let bit_length = (32 - i) * 8 - byte.leading_zeros() as usize;
            return bit_length - 1;
        }
    }
    0
}

/// Up to `k` contacts, most recently seen first.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    nodes: Vec<DhtNodeInfo>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            nodes: Vec::new(),
        }
    }

    /// Insert at the head (most recent). When the bucket overflows the
    /// oldest (tail) entry is dropped and `false` is returned.
    pub fn add_node(&mut self, node: DhtNodeInfo) -> bool {
        self.nodes.retain(|n| n.node_id != node.node_id);
        self.nodes.insert(0, node);
        if self.nodes.len() > self.k {
            let dropped = self.nodes.pop();
            if let Some(dropped) = dropped {
                tracing::debug!(
                    node = %&dropped.node_id[..dropped.node_id.len().min(16)],
                    "k-bucket full, dropped oldest"
                );
            }
            return false;
        }
        true
    }

    pub fn remove_node(&mut self, node_id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.node_id != node_id);
        self.nodes.len() < before
    }

    /// Refresh a contact's `last_seen` and move it to the head.
    pub fn touch(&mut self, node_id: &str) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node_id) {
            let mut node = self.nodes.remove(pos);
            node.last_seen = unix_now();
            self.nodes.insert(0, node);
            return true;
        }
        false
    }

    pub fn nodes(&self) -> &[DhtNodeInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: f64,
}

/// The routing table and value store of one node.
#[derive(Debug)]
pub struct Dht {
    node_id: String,
    k: usize,
    alpha: usize,
    buckets: HashMap<usize, KBucket>,
    storage: HashMap<String, StoredValue>,
}

impl Dht {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            k: K,
            alpha: ALPHA,
            buckets: HashMap::new(),
            storage: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn add_node(&mut self, node_id: &str, address: &str) {
        if node_id == self.node_id {
            return;
        }
        let Some(distance) = xor_distance(&self.node_id, node_id) else {
            tracing::debug!("ignoring DHT node with malformed id");
            return;
        };
        let idx = bucket_index(&distance);
        self.buckets
            .entry(idx)
            .or_insert_with(|| KBucket::new(self.k))
            .add_node(DhtNodeInfo::new(node_id, address));
    }

    pub fn remove_node(&mut self, node_id: &str) {
        let Some(distance) = xor_distance(&self.node_id, node_id) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&bucket_index(&distance)) {
            bucket.remove_node(node_id);
        }
    }

    pub fn touch_node(&mut self, node_id: &str) {
        let Some(distance) = xor_distance(&self.node_id, node_id) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&bucket_index(&distance)) {
            bucket.touch(node_id);
        }
    }

    /// The `count` known contacts closest to `target`, by XOR distance.
    pub fn closest_nodes(&self, target: &str, count: usize) -> Vec<DhtNodeInfo> {
        let mut all: Vec<(DhtNodeInfo, [u8; 32])> = self
            .buckets
            .values()
            .flat_map(|b| b.nodes().iter().cloned())
            .filter_map(|n| xor_distance(target, &n.node_id).map(|d| (n, d)))
            .collect();
        all.sort_by(|a, b| a.1.cmp(&b.1));
        all.into_iter().take(count).map(|(n, _)| n).collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.values().map(KBucket::len).sum()
    }

    pub fn stored_value_count(&self) -> usize {
        self.storage.len()
    }

    // ── Incoming RPC handlers ─────────────────────────────────────────────────

    /// `dht_find_node {target_id}` → the K closest contacts.
    pub fn handle_find_node(&self, target_id: &str) -> Value {
        let nodes: Vec<Value> = self
            .closest_nodes(target_id, self.k)
            .into_iter()
            .map(|n| json!({ "node_id": n.node_id, "address": n.address }))
            .collect();
        json!({ "nodes": nodes })
    }

    /// `dht_find_value {key}` → the unexpired value, or the closest contacts.
    pub fn handle_find_value(&mut self, key: &str) -> Value {
        if let Some(stored) = self.storage.get(key) {
            if unix_now() < stored.expires_at {
                return json!({ "value": stored.value });
            }
            self.storage.remove(key);
        }
        self.handle_find_node(&hash_key(key))
    }

    /// `dht_store {key, value, ttl}` → store locally.
    pub fn handle_store(&mut self, key: &str, value: Value, ttl: f64) -> Value {
        self.storage.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: unix_now() + ttl,
            },
        );
        json!({ "success": true })
    }

    /// Read the local store (lazy expiry applies).
    pub fn get_local(&mut self, key: &str) -> Option<Value> {
        match self.storage.get(key) {
            Some(stored) if unix_now() < stored.expires_at => Some(stored.value.clone()),
            Some(_) => {
                self.storage.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn remove_local(&mut self, key: &str) {
        self.storage.remove(key);
    }

    /// Reclaim expired entries; called from the maintenance task.
    pub fn sweep_expired(&mut self) -> usize {
        let now = unix_now();
        let before = self.storage.len();
        self.storage.retain(|_, v| now < v.expires_at);
        before - self.storage.len()
    }
}

/// SHA-256 of a storage key, hex-encoded, placing it in the id space.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

// ── Iterative operations ──────────────────────────────────────────────────────
//
// These lock the table only between rounds so that queries (which suspend on
// the network) never hold it.

/// Iterative FIND_NODE: up to [`MAX_ROUNDS`] rounds of `alpha` parallel
/// queries, returning the `K` closest contacts discovered.
pub async fn iterative_find_node(
    dht: &std::sync::Mutex<Dht>,
    rpc: &dyn DhtRpc,
    target: &str,
) -> Vec<DhtNodeInfo> {
    let (self_id, alpha, k) = {
        let dht = dht.lock().unwrap();
        (dht.node_id.clone(), dht.alpha, dht.k)
    };

    let mut shortlist = dht.lock().unwrap().closest_nodes(target, alpha);
    let mut seen: HashSet<String> = HashSet::from([self_id]);

    for _ in 0..MAX_ROUNDS {
        let to_query: Vec<DhtNodeInfo> = shortlist
            .iter()
            .filter(|n| !seen.contains(&n.node_id))
            .take(alpha)
            .cloned()
            .collect();
        if to_query.is_empty() {
            break;
        }
        for node in &to_query {
            seen.insert(node.node_id.clone());
        }

        let queries = to_query.iter().map(|node| {
            rpc.call(
                &node.node_id,
                &node.address,
                "dht_find_node",
                json!({ "target_id": target }),
            )
        });
        let results = join_all(queries).await;

        // All returned contacts enter the shortlist; `seen` only gates
        // queries, not membership.
        for result in results {
            let Ok(result) = result else { continue };
            for node in parse_nodes(&result) {
                if !shortlist.iter().any(|n| n.node_id == node.node_id) {
                    shortlist.push(node);
                }
            }
        }

        sort_by_distance(&mut shortlist, target);
        shortlist.truncate(k);
    }

    shortlist.truncate(k);
    shortlist
}

/// Iterative FIND_VALUE: like FIND_NODE, but stops as soon as any queried
/// node returns the value.
pub async fn iterative_find_value(
    dht: &std::sync::Mutex<Dht>,
    rpc: &dyn DhtRpc,
    key: &str,
) -> Option<Value> {
    if let Some(value) = dht.lock().unwrap().get_local(key) {
        return Some(value);
    }

    let key_hash = hash_key(key);
    let (self_id, alpha, k) = {
        let dht = dht.lock().unwrap();
        (dht.node_id.clone(), dht.alpha, dht.k)
    };
    let mut shortlist = dht.lock().unwrap().closest_nodes(&key_hash, alpha);
    let mut seen: HashSet<String> = HashSet::from([self_id]);

    for _ in 0..MAX_ROUNDS {
        let to_query: Vec<DhtNodeInfo> = shortlist
            .iter()
            .filter(|n| !seen.contains(&n.node_id))
            .take(alpha)
            .cloned()
            .collect();
        if to_query.is_empty() {
            break;
        }
        for node in &to_query {
            seen.insert(node.node_id.clone());
        }

        let queries = to_query.iter().map(|node| {
            rpc.call(
                &node.node_id,
                &node.address,
                "dht_find_value",
                json!({ "key": key }),
            )
        });
        let results = join_all(queries).await;

        for result in &results {
            if let Ok(result) = result {
                if let Some(value) = result.get("value") {
                    return Some(value.clone());
                }
            }
        }
        for result in results {
            let Ok(result) = result else { continue };
            for node in parse_nodes(&result) {
                if !shortlist.iter().any(|n| n.node_id == node.node_id) {
                    shortlist.push(node);
                }
            }
        }

        sort_by_distance(&mut shortlist, &key_hash);
        shortlist.truncate(k);
    }

    None
}

/// STORE: locate the K closest nodes to `SHA-256(key)` and send `dht_store`
/// to each; the local store is always written. `true` iff at least one
/// remote node acknowledged.
pub async fn iterative_store(
    dht: &std::sync::Mutex<Dht>,
    rpc: &dyn DhtRpc,
    key: &str,
    value: Value,
    ttl: f64,
) -> bool {
    let key_hash = hash_key(key);
    let targets = iterative_find_node(dht, rpc, &key_hash).await;

    let stores = targets.iter().map(|node| {
        rpc.call(
            &node.node_id,
            &node.address,
            "dht_store",
            json!({ "key": key, "value": value.clone(), "ttl": ttl }),
        )
    });
    let acks = join_all(stores)
        .await
        .into_iter()
        .filter(|r| {
            r.as_ref()
                .map(|v| v.get("success").and_then(Value::as_bool).unwrap_or(false))
                .unwrap_or(false)
        })
        .count();

    dht.lock().unwrap().handle_store(key, value, ttl);
    tracing::debug!(key, acks, "dht store complete");
    acks > 0
}

fn parse_nodes(result: &Value) -> Vec<DhtNodeInfo> {
    result
        .get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| {
                    Some(DhtNodeInfo::new(
                        n.get("node_id")?.as_str()?,
                        n.get("address").and_then(Value::as_str).unwrap_or(""),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn sort_by_distance(nodes: &mut [DhtNodeInfo], target: &str) {
    nodes.sort_by_key(|n| xor_distance(target, &n.node_id).unwrap_or([0xff; 32]));
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn id(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn xor_metric_properties() {
        let (x, y, z) = (id(0x11), id(0x47), id(0xe0));
        assert_eq!(xor_distance(&x, &x), Some([0u8; 32]));
        assert_eq!(xor_distance(&x, &y), xor_distance(&y, &x));
        // Ultrametric: d(x,z) ≤ max(d(x,y), d(y,z)).
        let dxz = xor_distance(&x, &z).unwrap();
        let dxy = xor_distance(&x, &y).unwrap();
        let dyz = xor_distance(&y, &z).unwrap();
        assert!(dxz <= std::cmp::max(dxy, dyz));
    }

    #[test]
    fn malformed_ids_yield_no_distance() {
        assert!(xor_distance("zz", &id(1)).is_none());
        assert!(xor_distance(&hex::encode([0u8; 16]), &id(1)).is_none());
    }

    #[test]
    fn bucket_index_is_bit_length_minus_one() {
        let mut d = [0u8; 32];
        assert_eq!(bucket_index(&d), 0);
        d[31] = 0x01;
        assert_eq!(bucket_index(&d), 0);
        d[31] = 0x80;
        assert_eq!(bucket_index(&d), 7);
        d = [0u8; 32];
        d[0] = 0x80;
        assert_eq!(bucket_index(&d), 255);
    }

    #[test]
    fn kbucket_never_exceeds_k() {
        let mut bucket = KBucket::new(3);
        for i in 0..10u8 {
            bucket.add_node(DhtNodeInfo::new(id(i), ""));
        }
        assert_eq!(bucket.len(), 3);
        // Most recent at the head.
        assert_eq!(bucket.nodes()[0].node_id, id(9));
    }

    #[test]
    fn kbucket_touch_moves_to_head() {
        let mut bucket = KBucket::new(5);
        for i in 0..3u8 {
            bucket.add_node(DhtNodeInfo::new(id(i), ""));
        }
        assert!(bucket.touch(&id(0)));
        assert_eq!(bucket.nodes()[0].node_id, id(0));
        assert!(!bucket.touch(&id(9)));
    }

    #[test]
    fn re_adding_a_node_does_not_duplicate() {
        let mut bucket = KBucket::new(5);
        bucket.add_node(DhtNodeInfo::new(id(1), "a"));
        bucket.add_node(DhtNodeInfo::new(id(1), "b"));
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.nodes()[0].address, "b");
    }

    #[test]
    fn dht_ignores_self_and_malformed_ids() {
        let mut dht = Dht::new(id(0));
        dht.add_node(&id(0), "");
        dht.add_node("not-hex", "");
        assert_eq!(dht.node_count(), 0);
    }

    #[test]
    fn closest_nodes_sorted_by_distance() {
        let mut dht = Dht::new(id(0));
        for i in 1..=8u8 {
            dht.add_node(&id(i), "");
        }
        let closest = dht.closest_nodes(&id(1), 3);
        assert_eq!(closest[0].node_id, id(1));
        assert_eq!(closest.len(), 3);
    }

    #[test]
    fn store_and_find_value_locally() {
        let mut dht = Dht::new(id(0));
        dht.handle_store("k", serde_json::json!("v"), 3600.0);
        assert_eq!(
            dht.handle_find_value("k")["value"],
            serde_json::json!("v")
        );
    }

    #[test]
    fn expired_values_fall_back_to_nodes() {
        let mut dht = Dht::new(id(0));
        dht.add_node(&id(1), "ws://x");
        dht.handle_store("k", serde_json::json!("v"), -1.0);
        let resp = dht.handle_find_value("k");
        assert!(resp.get("value").is_none());
        assert!(resp["nodes"].is_array());
        // The lazy read also reclaimed the entry.
        assert_eq!(dht.stored_value_count(), 0);
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let mut dht = Dht::new(id(0));
        dht.handle_store("dead", serde_json::json!(1), -1.0);
        dht.handle_store("live", serde_json::json!(2), 3600.0);
        assert_eq!(dht.sweep_expired(), 1);
        assert_eq!(dht.stored_value_count(), 1);
    }

    // In-memory RPC fabric connecting several Dht instances directly.
    struct Fabric {
        nodes: HashMap<String, Mutex<Dht>>,
    }

    #[async_trait]
    impl DhtRpc for Fabric {
        async fn call(
            &self,
            node_id: &str,
            _address: &str,
            method: &str,
            params: Value,
        ) -> Result<Value, P2pError> {
            let dht = self
                .nodes
                .get(node_id)
                .ok_or_else(|| P2pError::PeerNotFound(node_id.into()))?;
            let mut dht = dht.lock().unwrap();
            Ok(match method {
                "dht_find_node" => {
                    dht.handle_find_node(params["target_id"].as_str().unwrap_or(""))
                }
                "dht_find_value" => dht.handle_find_value(params["key"].as_str().unwrap_or("")),
                "dht_store" => dht.handle_store(
                    params["key"].as_str().unwrap_or(""),
                    params["value"].clone(),
                    params["ttl"].as_f64().unwrap_or(DEFAULT_TTL),
                ),
                _ => return Err(P2pError::Transport("unknown method".into())),
            })
        }
    }

    fn fabric(count: u8) -> (Vec<String>, Fabric) {
        let ids: Vec<String> = (1..=count).map(id).collect();
        let mut nodes = HashMap::new();
        for i in &ids {
            let mut dht = Dht::new(i.clone());
            // Everyone knows everyone, as after a round of discovery.
            for j in &ids {
                dht.add_node(j, "");
            }
            nodes.insert(i.clone(), Mutex::new(dht));
        }
        (ids, Fabric { nodes })
    }

    #[tokio::test]
    async fn iterative_store_then_find_value_across_nodes() {
        let (ids, fabric) = fabric(4);
        let local = Mutex::new({
            let mut d = Dht::new(id(0x99));
            for i in &ids {
                d.add_node(i, "");
            }
            d
        });

        let stored = iterative_store(&local, &fabric, "k", serde_json::json!("v"), 3600.0).await;
        assert!(stored);
        // Local write always applied.
        assert_eq!(local.lock().unwrap().get_local("k"), Some(serde_json::json!("v")));

        // A different node that did not store resolves the value remotely.
        let reader = Mutex::new({
            let mut d = Dht::new(id(0x77));
            d.add_node(&ids[0], "");
            d
        });
        let found = iterative_find_value(&reader, &fabric, "k").await;
        assert_eq!(found, Some(serde_json::json!("v")));
    }

    #[tokio::test]
    async fn find_value_returns_none_when_absent() {
        let (ids, fabric) = fabric(3);
        let reader = Mutex::new({
            let mut d = Dht::new(id(0x77));
            for i in &ids {
                d.add_node(i, "");
            }
            d
        });
        assert_eq!(iterative_find_value(&reader, &fabric, "missing").await, None);
    }

    #[tokio::test]
    async fn find_node_tolerates_unreachable_peers() {
        let (ids, fabric) = fabric(3);
        let local = Mutex::new({
            let mut d = Dht::new(id(0x55));
            for i in &ids {
                d.add_node(i, "");
            }
            // A contact the fabric cannot reach.
            d.add_node(&id(0xee), "");
            d
        });
        let found = iterative_find_node(&local, &fabric, &id(2)).await;
        assert!(found.iter().any(|n| n.node_id == id(2)));
    }
}
