//! Set of lines that already triggered playback.
//! Grows for the whole daemon run unless an LRU capacity is configured.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::normalize::canonical;

enum Store {
    Unbounded(HashSet<String>),
    Capped(LruCache<String, ()>),
}

/// Normalized texts (reference lines or realtime lines) that were played.
pub struct PlayedSet {
    store: Store,
}

impl PlayedSet {
    /// Unbounded set: memory is bounded only by process lifetime.
    pub fn new() -> Self {
        Self {
            store: Store::Unbounded(HashSet::new()),
        }
    }

    /// Set that forgets the least recently played line past `capacity`.
    /// `None` or zero falls back to unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => Self {
                store: Store::Capped(LruCache::new(cap)),
            },
            None => Self::new(),
        }
    }

    /// Canonical key for a line: letters and digits, lower-cased.
    pub fn key(text: &str) -> String {
        canonical(text)
    }

    /// Whether `text` (raw or normalized) was played.
    pub fn contains(&self, text: &str) -> bool {
        let key = Self::key(text);
        match &self.store {
            Store::Unbounded(set) => set.contains(&key),
            Store::Capped(cache) => cache.contains(&key),
        }
    }

    /// Record `text` as played. Returns false if it was already present.
    pub fn insert(&mut self, text: &str) -> bool {
        let key = Self::key(text);
        match &mut self.store {
            Store::Unbounded(set) => set.insert(key),
            Store::Capped(cache) => cache.put(key, ()).is_none(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.store {
            Store::Unbounded(set) => set.len(),
            Store::Capped(cache) => cache.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PlayedSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains_normalized() {
        let mut played = PlayedSet::new();
        assert!(played.insert("I will protect this city"));
        assert!(played.contains("i will protect this city!"));
        assert!(played.contains("iwillprotectthiscity"));
        assert!(!played.insert("I WILL protect this city"));
        assert_eq!(played.len(), 1);
    }

    #[test]
    fn test_uid_inside_words_keeps_lines_distinct() {
        let mut played = PlayedSet::new();
        played.insert("Let me guide you to the harbor");
        assert!(!played.contains("Let me guide you back to town"));
        played.insert("You idiot, stop");
        assert!(!played.contains("You idiot, run"));
        assert_eq!(PlayedSet::key("fluid squid"), "fluidsquid");
    }

    #[test]
    fn test_capped_set_evicts_oldest() {
        let mut played = PlayedSet::with_capacity(Some(2));
        played.insert("one");
        played.insert("two");
        played.insert("three");
        assert!(!played.contains("one"));
        assert!(played.contains("two"));
        assert!(played.contains("three"));
        assert_eq!(played.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let mut played = PlayedSet::with_capacity(Some(0));
        for i in 0..100 {
            played.insert(&format!("line {i}"));
        }
        assert_eq!(played.len(), 100);
    }
}
