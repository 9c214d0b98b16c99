//! Identity-keyed map that does not keep its keys alive.
//!
//! Entries are keyed by the address of an `Arc` allocation and hold only a
//! `Weak` to it. Holding the `Weak` keeps the allocation (not the value)
//! reserved, so an address cannot be reused while its entry exists. Entries
//! whose key has been dropped are treated as absent and removed by
//! [`WeakKeyMap::prune`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct Entry<K: ?Sized, V> {
    key: Weak<K>,
    value: V,
}

impl<K: ?Sized, V> Entry<K, V> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

/// Map from `Arc` identity to `V`.
pub struct WeakKeyMap<K: ?Sized, V> {
    entries: HashMap<usize, Entry<K, V>>,
}

fn address<K: ?Sized>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as *const () as usize
}

impl<K: ?Sized, V> WeakKeyMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &Arc<K>) -> Option<&V> {
        self.entries
            .get(&address(key))
            .filter(|e| e.is_live())
            .map(|e| &e.value)
    }

    pub fn insert(&mut self, key: &Arc<K>, value: V) -> Option<V> {
        let previous = self.entries.insert(
            address(key),
            Entry {
                key: Arc::downgrade(key),
                value,
            },
        );
        previous.filter(|e| e.is_live()).map(|e| e.value)
    }

    /// Value for `key`, inserting `init()` when missing or stale.
    pub fn get_or_insert_with(&mut self, key: &Arc<K>, init: impl FnOnce() -> V) -> &mut V {
        let slot = self.entries.entry(address(key)).or_insert_with(|| Entry {
            key: Arc::downgrade(key),
            value: init(),
        });
        // A stale slot here would mean a reused address, which the held Weak rules out.
        debug_assert!(slot.is_live());
        &mut slot.value
    }

    pub fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        self.entries
            .remove(&address(key))
            .filter(|e| e.is_live())
            .map(|e| e.value)
    }

    /// Drop entries whose key is gone.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live());
        before - self.entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: ?Sized, V> Default for WeakKeyMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
