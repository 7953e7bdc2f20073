//! Client-side cache with optimistic updates.
//!
//! Every key holds a confirmed value, and optionally an optimistic value together with the
//! confirmed value it shadows. Reads prefer the optimistic value. An optimistic update is
//! eventually confirmed, reverted to the shadowed value, or superseded by a server emission
//! through [`OptimisticCache::reconcile`].
//!
//! Caches are meant to be scoped to a single client session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::trace;

/// The state kept for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    /// The last value confirmed by the server.
    pub confirmed: Option<T>,
    /// A value applied ahead of server confirmation.
    pub optimistic: Option<T>,
    /// The confirmed value at the time the first pending optimistic update was applied.
    ///
    /// `Some(None)` records that there was no confirmed value to restore.
    pub shadow_original: Option<Option<T>>,
}

impl<T> Default for CacheEntry<T> {
    fn default() -> Self {
        Self {
            confirmed: None,
            optimistic: None,
            shadow_original: None,
        }
    }
}

impl<T: Clone> CacheEntry<T> {
    fn current(&self) -> Option<T> {
        self.optimistic.clone().or_else(|| self.confirmed.clone())
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.optimistic.is_none() && self.shadow_original.is_none()
    }
}

/// Optimistic key-value cache.
///
/// This is a cheaply cloneable handle; clones share the same entries. Every operation runs
/// under one lock, so the confirmed/optimistic/shadow triad of a key is never observed
/// half-updated.
#[derive(Debug, Clone)]
pub struct OptimisticCache<T> {
    entries: Arc<Mutex<HashMap<String, CacheEntry<T>>>>,
}

impl<T> Default for OptimisticCache<T> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}

impl<T: Clone> OptimisticCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of `key`, preferring a pending optimistic value.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .expect("poisoned")
            .get(key)
            .and_then(CacheEntry::current)
    }

    /// Returns the confirmed value of `key`, ignoring pending optimistic state.
    pub fn get_confirmed(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .expect("poisoned")
            .get(key)
            .and_then(|entry| entry.confirmed.clone())
    }

    /// Returns a copy of the full entry of `key`.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries.lock().expect("poisoned").get(key).cloned()
    }

    /// Sets the confirmed value of `key`.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let mut entries = self.entries.lock().expect("poisoned");
        entries.entry(key.into()).or_default().confirmed = Some(value);
    }

    /// Removes `key` along with any pending optimistic state.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().expect("poisoned").remove(key).is_some()
    }

    /// Applies `value` ahead of server confirmation.
    ///
    /// The confirmed value is shadowed only by the first of several stacked updates, so a
    /// revert always restores the value from before the first pending update.
    pub fn optimistic_update(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        trace!(%key, "optimistic update");
        let mut entries = self.entries.lock().expect("poisoned");
        let entry = entries.entry(key).or_default();
        if entry.shadow_original.is_none() {
            entry.shadow_original = Some(entry.confirmed.clone());
        }
        entry.optimistic = Some(value);
    }

    /// Promotes the pending optimistic value of `key` to confirmed.
    ///
    /// Does nothing if no optimistic value is pending.
    pub fn confirm_optimistic(&self, key: &str) {
        let mut entries = self.entries.lock().expect("poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if let Some(value) = entry.optimistic.take() {
            entry.confirmed = Some(value);
        }
        entry.shadow_original = None;
    }

    /// Restores the confirmed value of `key` from before its pending optimistic updates.
    ///
    /// Does nothing if no optimistic value is pending.
    pub fn revert_optimistic(&self, key: &str) {
        let mut entries = self.entries.lock().expect("poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.optimistic = None;
        if let Some(original) = entry.shadow_original.take() {
            entry.confirmed = original;
        }
        if entry.is_empty() {
            entries.remove(key);
        }
    }

    /// Applies a value emitted by the server.
    ///
    /// The emission becomes the confirmed value and any pending optimistic state for `key` is
    /// dropped: the last event wins.
    pub fn reconcile(&self, key: impl Into<String>, value: T) {
        let mut entries = self.entries.lock().expect("poisoned");
        let entry = entries.entry(key.into()).or_default();
        entry.confirmed = Some(value);
        entry.optimistic = None;
        entry.shadow_original = None;
    }

    /// Returns true if `key` has an unconfirmed optimistic value.
    pub fn has_pending(&self, key: &str) -> bool {
        self.entries
            .lock()
            .expect("poisoned")
            .get(key)
            .is_some_and(|entry| entry.optimistic.is_some())
    }

    /// Returns the keys present in the cache, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().expect("poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn reads_prefer_optimistic() {
        let cache = OptimisticCache::new();
        cache.set("k", json!({ "title": "old" }));
        cache.optimistic_update("k", json!({ "title": "new" }));
        assert_eq!(cache.get("k"), Some(json!({ "title": "new" })));
        assert_eq!(cache.get_confirmed("k"), Some(json!({ "title": "old" })));
        assert!(cache.has_pending("k"));
    }

    #[test]
    fn failed_mutation_restores_previous_value() {
        let cache = OptimisticCache::new();
        cache.set("K", json!({ "title": "before" }));
        cache.optimistic_update("K", json!({ "title": "A" }));
        cache.revert_optimistic("K");
        assert_eq!(cache.get("K"), Some(json!({ "title": "before" })));
        assert!(!cache.has_pending("K"));
    }

    #[test]
    fn revert_without_previous_value_removes_the_key() {
        let cache: OptimisticCache<Value> = OptimisticCache::new();
        cache.optimistic_update("K", json!({ "title": "A" }));
        cache.revert_optimistic("K");
        assert_eq!(cache.get("K"), None);
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn stacked_updates_revert_to_first_shadow() {
        let cache = OptimisticCache::new();
        cache.set("k", 1);
        cache.optimistic_update("k", 2);
        cache.optimistic_update("k", 3);
        assert_eq!(cache.get("k"), Some(3));
        cache.revert_optimistic("k");
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn confirm_and_revert_are_idempotent() {
        let cache = OptimisticCache::new();
        cache.set("k", 1);
        cache.optimistic_update("k", 2);
        cache.confirm_optimistic("k");
        let after_first = cache.entry("k");
        cache.confirm_optimistic("k");
        assert_eq!(cache.entry("k"), after_first);
        assert_eq!(
            after_first,
            Some(CacheEntry {
                confirmed: Some(2),
                optimistic: None,
                shadow_original: None,
            })
        );

        cache.optimistic_update("k", 5);
        cache.revert_optimistic("k");
        let after_first = cache.entry("k");
        cache.revert_optimistic("k");
        assert_eq!(cache.entry("k"), after_first);
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn reconcile_drops_pending_state() {
        let cache = OptimisticCache::new();
        cache.set("k", "confirmed".to_string());
        cache.optimistic_update("k", "optimistic".to_string());
        cache.reconcile("k", "server".to_string());
        assert!(!cache.has_pending("k"));
        cache.revert_optimistic("k");
        assert_eq!(cache.get("k").as_deref(), Some("server"));
    }

    #[test]
    fn delete_and_keys() {
        let cache = OptimisticCache::new();
        cache.set("b", 1);
        cache.set("a", 2);
        assert_eq!(cache.keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.keys().is_empty());
    }
}
