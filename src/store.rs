//! Expiring association stores for both sides of the protocol.
//!
//! One TTL-map abstraction backs both stores: every access sweeps expired
//! entries first, so no entry outlives its TTL by more than one access and
//! memory stays bounded without a background timer. All operations run under
//! a single lock per store instance; a concurrent load never observes a
//! partially swept state, a swept-away handle is simply not found.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::assoc_type::AssociationType;
use crate::association::Association;

/// Lock-guarded map whose entries carry an expiry instant.
///
/// `insert`, `get`, `remove` and the query helpers all sweep before
/// operating. Values are cloned out; the lock is never held across caller
/// code.
pub struct ExpiringMap<K, V> {
    entries: Mutex<HashMap<K, (V, DateTime<Utc>)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(entries: &mut HashMap<K, (V, DateTime<Utc>)>) {
        let now = Utc::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }

    pub fn insert(&self, key: K, value: V, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.insert(key, (value, expires_at));
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.remove(key).map(|(v, _)| v)
    }

    /// Live values whose key satisfies the predicate
    pub fn matching(&self, pred: impl Fn(&K) -> bool) -> Vec<V> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(_, (v, _))| v.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.contains_key(key)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// RP-side store: associations indexed by `(provider endpoint, handle)`
pub struct ConsumerAssociationStore {
    entries: ExpiringMap<(String, String), Association>,
}

impl ConsumerAssociationStore {
    pub fn new() -> Self {
        Self {
            entries: ExpiringMap::new(),
        }
    }

    pub fn save(&self, op_endpoint: &str, association: Association) {
        let expires_at = association.expires_at();
        self.entries.insert(
            (op_endpoint.to_string(), association.handle().to_string()),
            association,
            expires_at,
        );
    }

    pub fn load(&self, op_endpoint: &str, handle: &str) -> Option<Association> {
        self.entries
            .get(&(op_endpoint.to_string(), handle.to_string()))
    }

    /// Best currently valid association for a provider: the one with the
    /// furthest expiry among live entries
    pub fn load_best(&self, op_endpoint: &str) -> Option<Association> {
        self.entries
            .matching(|(endpoint, _)| endpoint == op_endpoint)
            .into_iter()
            .max_by_key(|a| a.expires_at())
    }

    pub fn remove(&self, op_endpoint: &str, handle: &str) -> Option<Association> {
        self.entries
            .remove(&(op_endpoint.to_string(), handle.to_string()))
    }
}

impl Default for ConsumerAssociationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// OP-side store: associations indexed by handle, with handle generation.
///
/// Handles are `<UTC second>-<counter>`; the counter resets only when the
/// formatted timestamp changes, so handles stay unique under rapid
/// concurrent generation.
pub struct ServerAssociationStore {
    entries: ExpiringMap<String, Association>,
    handle_state: Mutex<HandleState>,
}

struct HandleState {
    timestamp: String,
    counter: u64,
}

impl ServerAssociationStore {
    pub fn new() -> Self {
        Self {
            entries: ExpiringMap::new(),
            handle_state: Mutex::new(HandleState {
                timestamp: String::new(),
                counter: 0,
            }),
        }
    }

    fn next_handle(&self) -> String {
        let mut state = self.handle_state.lock().unwrap();
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        if now == state.timestamp {
            state.counter += 1;
        } else {
            state.timestamp = now;
            state.counter = 0;
        }
        format!("{}-{}", state.timestamp, state.counter)
    }

    /// Generate and persist a fresh association
    pub fn create(&self, assoc_type: AssociationType, expires_in_secs: i64) -> Association {
        let association = Association::generate(assoc_type, self.next_handle(), expires_in_secs);
        let expires_at = association.expires_at();
        self.entries
            .insert(association.handle().to_string(), association.clone(), expires_at);
        association
    }

    pub fn load(&self, handle: &str) -> Option<Association> {
        self.entries.get(&handle.to_string())
    }

    pub fn remove(&self, handle: &str) -> Option<Association> {
        self.entries.remove(&handle.to_string())
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.entries.contains_key(&handle.to_string())
    }
}

impl Default for ServerAssociationStore {
    fn default() -> Self {
        Self::new()
    }
}
