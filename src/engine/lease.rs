//! Per-key acquire-or-skip guards.
//!
//! Shared by the progress persister (one in-flight persist per run) and the
//! resumption controller (one resumption attempt per run per engine
//! lifetime). A concurrent caller is skipped, never queued.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Keyed lease set. `acquire` returns a guard that releases the key on drop;
/// `claim` marks a key permanently.
#[derive(Debug, Default)]
pub(crate) struct KeyedLease<K: Eq + Hash + Clone> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> KeyedLease<K> {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Acquire the key, or return `None` if it is already held.
    pub fn acquire(&self, key: K) -> Option<LeaseGuard<K>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(LeaseGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    /// Permanently claim the key. Returns false if it was already claimed or
    /// is currently leased.
    pub fn claim(&self, key: K) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(key)
    }
}

/// Releases its key when dropped.
pub(crate) struct LeaseGuard<K: Eq + Hash + Clone> {
    held: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for LeaseGuard<K> {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}
