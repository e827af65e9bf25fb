use crate::error::{ConsumerError, ConsumerResult};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Keyed registrations with check-and-set semantics.
///
/// Registering a key twice is a programming error and fails; removing a key
/// that is not registered only logs.
pub struct CallbackRegistry<K, V> {
    kind: &'static str,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> CallbackRegistry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, V>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, key: K, value: V) -> ConsumerResult<()> {
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(ConsumerError::registration(format!(
                "{} already registered for {}",
                self.kind, key
            )));
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn unregister(&self, key: &K) -> Option<V> {
        let removed = self.entries().remove(key);
        if removed.is_none() {
            warn!(kind = self.kind, key = %key, "Nothing registered to remove");
        }
        removed
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
