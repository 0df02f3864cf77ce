//! Keyed, typed, TTL-bearing shared state
//!
//! Entries are versioned on every write and become invisible the instant
//! their TTL elapses. Reclamation is lazy (a reader that observes an
//! expired entry discards it in place) plus a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often the background sweeper reclaims expired entries
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Category tag attached to every state entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    /// Workflow execution state
    Workflow,
    /// Agent registration metadata
    Agent,
    /// Per-session scratch data
    Session,
    /// Cached derived values
    Cache,
}

/// A single keyed state record with lifecycle metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    /// Storage key
    pub key: String,
    /// Stored value
    pub value: Value,
    /// Category tag
    pub category: StateCategory,
    /// Creation time
    pub created_at: SystemTime,
    /// Last write time
    pub updated_at: SystemTime,
    /// Absolute expiry, if any
    pub expires_at: Option<SystemTime>,
    /// Monotonically increasing write counter
    pub version: u64,
}

impl StateEntry {
    fn new(key: &str, value: Value, category: StateCategory, ttl: Option<Duration>) -> Self {
        let now = SystemTime::now();
        Self {
            key: key.to_owned(),
            value,
            category,
            created_at: now,
            updated_at: now,
            expires_at: ttl.map(|t| now + t),
            version: 1,
        }
    }

    /// Whether the entry's TTL has elapsed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => SystemTime::now() > deadline,
            None => false,
        }
    }
}

/// Shared state contract used by the communication manager
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Starts background maintenance, if any
    async fn connect(&self) {}

    /// Stops background maintenance, if any
    async fn disconnect(&self) {}

    /// Writes a value, bumping the version counter on overwrite.
    ///
    /// Returns whether the write was accepted.
    async fn set(
        &self,
        key: &str,
        value: Value,
        category: StateCategory,
        ttl: Option<Duration>,
    ) -> bool;

    /// Reads a value; expired entries are never returned
    async fn get(&self, key: &str) -> Option<Value>;

    /// Deletes a key; returns whether it existed
    async fn delete(&self, key: &str) -> bool;

    /// Whether a live (non-expired) entry exists for `key`
    async fn exists(&self, key: &str) -> bool;

    /// Returns all live entries whose key matches the glob `pattern`
    async fn get_all(&self, pattern: &str) -> HashMap<String, Value>;

    /// Atomically adds `delta` to a counter, creating it at zero if absent.
    ///
    /// Returns the new value.
    async fn increment(&self, key: &str, delta: i64) -> i64;
}

/// In-process state store backed by a sharded concurrent map
pub struct InMemoryStateStore {
    states: Arc<DashMap<String, StateEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Duration,
}

impl InMemoryStateStore {
    /// Creates a store with the default one-minute sweep interval
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    /// Creates a store with a custom sweep interval
    #[must_use]
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
            sweep_interval,
        }
    }

    /// Starts the background task reclaiming expired entries
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let states = Arc::clone(&self.states);
        let interval = self.sweep_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = states.len();
                states.retain(|_, entry| !entry.is_expired());
                let removed = before - states.len();
                if removed > 0 {
                    debug!(count = removed, "swept expired state entries");
                }
            }
        }));
    }

    /// Stops the background sweeper, if running
    pub fn stop_sweeper(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// Number of entries currently held, expired ones included
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.states.len()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryStateStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn connect(&self) {
        self.start_sweeper();
    }

    async fn disconnect(&self) {
        self.stop_sweeper();
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        category: StateCategory,
        ttl: Option<Duration>,
    ) -> bool {
        let now = SystemTime::now();
        match self.states.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value = value;
                entry.updated_at = now;
                entry.expires_at = ttl.map(|t| now + t);
                entry.version += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StateEntry::new(key, value, category, ttl));
            }
        }
        debug!(key, "state set");
        true
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.states.get(key) {
            None => return None,
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.value.clone()),
        };
        if expired {
            // Discard in place; re-check under the shard lock so a racing
            // writer refreshing the entry is not clobbered.
            self.states.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }

    async fn delete(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn get_all(&self, pattern: &str) -> HashMap<String, Value> {
        let matcher = match globset::Glob::new(pattern) {
            Ok(glob) => glob.compile_matcher(),
            Err(err) => {
                warn!(pattern, error = %err, "invalid state pattern");
                return HashMap::new();
            }
        };

        let mut result = HashMap::new();
        let mut expired = Vec::new();
        for entry in self.states.iter() {
            if !matcher.is_match(entry.key()) {
                continue;
            }
            if entry.is_expired() {
                expired.push(entry.key().clone());
            } else {
                result.insert(entry.key().clone(), entry.value.clone());
            }
        }
        for key in expired {
            self.states.remove_if(&key, |_, entry| entry.is_expired());
        }
        result
    }

    async fn increment(&self, key: &str, delta: i64) -> i64 {
        // The entry guard holds the shard lock, so the read-modify-write
        // below is atomic against concurrent writers.
        let mut entry = self
            .states
            .entry(key.to_owned())
            .or_insert_with(|| StateEntry::new(key, Value::from(0), StateCategory::Workflow, None));
        if entry.is_expired() {
            *entry = StateEntry::new(key, Value::from(0), StateCategory::Workflow, None);
        }
        let current = entry.value.as_i64().unwrap_or(0);
        let next = current + delta;
        let now = SystemTime::now();
        entry.value = Value::from(next);
        entry.updated_at = now;
        entry.version += 1;
        next
    }
}
