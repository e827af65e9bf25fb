//! Key-value store behind coordination, with an in-memory implementation.

use crate::error::ConsumerResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Strongly consistent key-value primitives used for offsets, membership and
/// leader election.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> ConsumerResult<Option<String>>;

    /// Durable write, acknowledged only once stored.
    async fn put(&self, key: &str, value: &str) -> ConsumerResult<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> ConsumerResult<bool>;

    /// Write that disappears after `ttl` unless refreshed.
    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<()>;

    /// Set `key` only if absent. `true` when this call created it.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool>;

    /// Extend the TTL of `key` if it still holds `value`.
    async fn refresh_if_owner(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool>;

    /// Remove `key` if it still holds `value`.
    async fn delete_if_owner(&self, key: &str, value: &str) -> ConsumerResult<bool>;

    /// Every live `(key, value)` whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> ConsumerResult<Vec<(String, String)>>;

    async fn ping(&self) -> ConsumerResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store with TTL semantics matching the Redis store.
///
/// Lets several coordinators in one process behave like peers sharing a
/// coordination service.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> ConsumerResult<Option<String>> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn put(&self, key: &str, value: &str) -> ConsumerResult<()> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConsumerResult<bool> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<()> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool> {
        Ok(self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        }))
    }

    async fn refresh_if_owner(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool> {
        Ok(self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) if entry.value == value => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }))
    }

    async fn delete_if_owner(&self, key: &str, value: &str) -> ConsumerResult<bool> {
        Ok(self.with_entries(|entries, _| {
            if entries.get(key).is_some_and(|entry| entry.value == value) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn list(&self, prefix: &str) -> ConsumerResult<Vec<(String, String)>> {
        Ok(self.with_entries(|entries, _| {
            let mut found: Vec<(String, String)> = entries
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect();
            found.sort();
            found
        }))
    }

    async fn ping(&self) -> ConsumerResult<()> {
        Ok(())
    }
}
