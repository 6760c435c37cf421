//! In-memory keyspace.
//!
//! Maps binary-safe keys to reference-counted objects. The store is owned by
//! the event loop and only ever touched from that thread, so it needs no
//! locking.

use crate::object::{self, ObjectRef};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{info, trace};

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageResult {
    /// Key was not present; the caller's key buffer now lives in the store
    Added,
    /// Key was present; the stored key is kept and the previous object released
    Replaced,
}

/// The keyspace
pub struct Storage {
    data: HashMap<Bytes, ObjectRef>,
}

impl Storage {
    /// Create an empty keyspace
    pub fn new() -> Self {
        info!("Initializing keyspace");
        Self {
            data: HashMap::new(),
        }
    }

    /// Map `key` to `value`, replacing any existing mapping.
    ///
    /// On replace the redundant `key` passed in is dropped and the key already
    /// in the table stays.
    pub fn insert_or_replace(&mut self, key: Bytes, value: ObjectRef) -> StorageResult {
        trace!(key = %String::from_utf8_lossy(&key), kind = %value.kind(), "Storing object");
        match self.data.insert(key, value) {
            Some(previous) => {
                object::release(previous);
                StorageResult::Replaced
            }
            None => StorageResult::Added,
        }
    }

    /// Borrow the object mapped to `key`
    pub fn lookup(&self, key: &[u8]) -> Option<&ObjectRef> {
        self.data.get(key)
    }

    /// Remove `key`, releasing its object. Returns whether the key existed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.data.remove(key) {
            Some(previous) => {
                trace!(key = %String::from_utf8_lossy(key), "Removed key");
                object::release(previous);
                true
            }
            None => false,
        }
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
