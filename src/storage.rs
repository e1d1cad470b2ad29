//! In-memory keyspace.
//!
//! Owns every key-value entry in a `RehashingMap`. Keys are binary strings
//! hashed with a FNV-style rolling hash; the hash selects the bucket and
//! serves as a cheap pre-check before the full key comparison.
//!
//! The keyspace is not synchronized. It is owned by the event loop thread
//! and handed to the command engine by value; sharing it across threads
//! would need a lock or per-thread shards.

use crate::hashtable::{MapStats, RehashingMap};
use bytes::Bytes;
use tracing::{debug, trace};

/// A single stored key-value pair
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

/// FNV-style hash over raw key bytes.
pub fn key_hash(data: &[u8]) -> u64 {
    let mut h: u32 = 0x811C_9DC5;
    for &b in data {
        h = h.wrapping_add(b as u32).wrapping_mul(0x0100_0193);
    }
    h as u64
}

/// Single-threaded key-value storage
pub struct Keyspace {
    map: RehashingMap<Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        debug!("Initializing keyspace");
        Self {
            map: RehashingMap::new(),
        }
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.map
            .get(key_hash(key), |entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    /// Store `value` under `key`, replacing any previous value in place.
    pub fn set(&mut self, key: Bytes, value: Bytes) {
        let hcode = key_hash(&key);
        match self.map.get_mut(hcode, |entry| entry.key == key) {
            Some(entry) => {
                trace!(key_len = key.len(), "Value replaced");
                entry.value = value;
            }
            None => {
                trace!(key_len = key.len(), "Entry inserted");
                self.map.insert(hcode, Entry { key, value });
            }
        }
    }

    /// Remove `key`. Returns whether an entry was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.map
            .remove(key_hash(key), |entry| entry.key == key)
            .is_some()
    }

    /// All live keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.map.iter().map(|entry| &entry.key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> MapStats {
        self.map.stats()
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}
