//! Locks created on demand for each key, such as a page or a document.

use std::{
    collections::HashMap,
    hash::Hash,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A map from keys to locks of type `L`. Entries only exist while some
/// [`KeyedLock`] for them is alive.
pub struct KeyedLocks<K, L> {
    locks: Mutex<HashMap<K, Arc<L>>>,
}

impl<K: Eq + Hash + Clone, L: Default> KeyedLocks<K, L> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get the lock for `key`, creating it if needed. The caller still has to
    /// acquire it.
    pub fn get(&self, key: K) -> KeyedLock<'_, K, L> {
        let lock = self.map().entry(key.clone()).or_default().clone();
        KeyedLock {
            locks: self,
            key,
            lock,
        }
    }

    /// Are there no locks in use?
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<K, Arc<L>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Eq + Hash + Clone, L: Default> Default for KeyedLocks<K, L> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to one lock in a [`KeyedLocks`]. Dropping the last reference
/// removes the entry, even if the future using it was cancelled.
pub struct KeyedLock<'a, K: Eq + Hash, L> {
    locks: &'a KeyedLocks<K, L>,
    key: K,
    lock: Arc<L>,
}

impl<K: Eq + Hash, L> Deref for KeyedLock<'_, K, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.lock
    }
}

impl<K: Eq + Hash, L> Drop for KeyedLock<'_, K, L> {
    fn drop(&mut self) {
        // Clones are only made while holding the map, so if the map and
        // `self.lock` are the only references left, nobody else is waiting.
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{Mutex, RwLock};

    use super::*;

    #[tokio::test]
    async fn entries_are_removed_after_last_use() {
        let locks = KeyedLocks::<u32, Mutex<()>>::new();
        let first = locks.get(1);
        let second = locks.get(1);
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        drop(first);
        assert!(!locks.is_empty());
        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiters_do_not_leak_entries() {
        let locks = KeyedLocks::<&str, RwLock<()>>::new();
        let holder = locks.get("doc");
        let writing = holder.write().await;

        let waiter = async {
            let lock = locks.get("doc");
            let _reading = lock.read().await;
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(20), waiter)
                .await
                .is_err()
        );

        drop(writing);
        drop(holder);
        assert!(locks.is_empty());
    }
}
