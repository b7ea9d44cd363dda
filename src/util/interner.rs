//! String interning for recurring node and task IDs
//!
//! Ensures each unique identifier is stored only once in memory.
//! Uses DashMap for lock-free concurrent access; cloning an interned
//! id is an O(1) Arc clone.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

/// Global string interner (thread-safe, lock-free)
static INTERNER: OnceLock<Interner> = OnceLock::new();

/// Intern a string through the global interner
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.get_or_init(Interner::new).intern(s)
}

/// Thread-safe string interner using DashMap
pub struct Interner {
    strings: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
        }
    }

    /// Intern a string, returning a shared Arc<str>
    ///
    /// If the string was already interned, returns the existing Arc.
    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing.key());
        }

        let key: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&key), ());
        key
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_deduplicates() {
        let interner = Interner::new();
        let a = interner.intern("node_a");
        let b = interner.intern("node_a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn intern_distinct_strings() {
        let interner = Interner::new();
        let a = interner.intern("alpha");
        let b = interner.intern("beta");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn global_intern_is_stable() {
        let a = intern("stable_id");
        let b = intern("stable_id");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
