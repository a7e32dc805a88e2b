//! # Process-Wide Registries
//!
//! `spec.md` §9 ("Global mutable state") asks for a single `Registry<K,V>`
//! shape with internal synchronization and a clear `shutdown()` lifecycle
//! method, owned explicitly by the supervisor rather than hidden behind
//! static initialization. [`Registry`] is that shape; [`metrics`],
//! [`actions`], [`aitools`], and [`plugin`] build the specific registries
//! the daemon needs on top of it.

pub mod actions;
pub mod aitools;
pub mod metrics;
pub mod plugin;

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A concurrent, process-wide `K -> V` map, backed by [`DashMap`] (the
/// same concurrent map the teacher uses for its agent/session/connection
/// registries).
pub struct Registry<K, V> {
    inner: DashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Registry<K, V> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|r| r.value().clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.iter().map(|r| r.value().clone()).collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|r| r.key().clone()).collect()
    }

    pub fn retain(&self, mut f: impl FnMut(&K, &mut V) -> bool) {
        self.inner.retain(|k, v| f(k, v));
    }

    /// Releases every entry. Called by the supervisor during shutdown, in
    /// the reverse order registries were started in.
    pub fn shutdown(&self) {
        self.inner.clear();
    }
}

pub type SharedRegistry<K, V> = Arc<Registry<K, V>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trips() {
        let registry: Registry<String, u32> = Registry::new();
        registry.insert("a".into(), 1);
        assert_eq!(registry.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn shutdown_clears_all_entries() {
        let registry: Registry<u32, u32> = Registry::new();
        registry.insert(1, 1);
        registry.insert(2, 2);
        registry.shutdown();
        assert!(registry.is_empty());
    }
}
