//! Ordered key set used for scans.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Tracks which keys exist, in key order.
#[derive(Debug, Default)]
pub struct Index {
    keys: RwLock<BTreeSet<String>>,
}

impl Index {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key. Returns true if it was new.
    pub fn insert(&self, key: &str) -> bool {
        self.keys.write().insert(key.to_string())
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.keys.write().remove(key)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.read().contains(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns true if no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Removes every key.
    pub fn clear(&self) {
        self.keys.write().clear();
    }

    /// Up to `count` keys strictly after `cursor`; a zero count reads one.
    ///
    /// Returns the keys and the cursor for the next call, or `None` once the
    /// end is reached.
    #[must_use]
    pub fn scan(&self, cursor: Option<&str>, count: usize) -> (Vec<String>, Option<String>) {
        let keys = self.keys.read();
        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Unbounded,
        };
        let mut range = keys.range((lower, Bound::Unbounded));
        let page: Vec<String> = range.by_ref().take(count.max(1)).cloned().collect();
        let next = if range.next().is_some() {
            page.last().cloned()
        } else {
            None
        };
        (page, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_pages_through_keys() {
        let index = Index::new();
        for key in ["d", "a", "c", "b", "e"] {
            index.insert(key);
        }

        let (page, next) = index.scan(None, 2);
        assert_eq!(page, vec!["a", "b"]);
        let (page, next) = index.scan(next.as_deref(), 2);
        assert_eq!(page, vec!["c", "d"]);
        let (page, next) = index.scan(next.as_deref(), 2);
        assert_eq!(page, vec!["e"]);
        assert!(next.is_none());
    }

    #[test]
    fn exact_page_has_no_next_cursor() {
        let index = Index::new();
        index.insert("a");
        index.insert("b");
        assert_eq!(index.scan(None, 2).1, None);
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn zero_count_still_advances() {
        let index = Index::new();
        for key in ["a", "b", "c"] {
            index.insert(key);
        }
        let (page, next) = index.scan(None, 0);
        assert_eq!(page, vec!["a"]);
        assert_eq!(next.as_deref(), Some("a"));
        let (page, next) = index.scan(Some("b"), 0);
        assert_eq!(page, vec!["c"]);
        assert!(next.is_none());
    }
}
