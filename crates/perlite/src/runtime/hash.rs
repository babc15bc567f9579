//! The hash container.
//!
//! Backed by an insertion-ordered map so `keys`/`values` expose a stable
//! iteration order per invocation, which the call interface guarantees.
//! Like arrays, hashes store scalar cells so element aliasing works.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::runtime::scalar::{cell, Scalar, ScalarCell};

/// Shared handle to a hash container.
pub type HashRef = Rc<RefCell<Hash>>;

/// Wraps a hash in a fresh shared handle.
#[inline]
#[must_use]
pub fn hash_ref(hash: Hash) -> HashRef {
    Rc::new(RefCell::new(hash))
}

type Entries = IndexMap<Rc<str>, ScalarCell, ahash::RandomState>;

/// A string-keyed hash of scalar cells with stable insertion order.
#[derive(Debug, Default)]
pub struct Hash {
    entries: Entries,
    /// Package this container was blessed into, if any.
    blessed: Option<Rc<str>>,
}

impl Hash {
    /// Creates an empty hash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a hash from a flat key/value cell list. A trailing key with no
    /// value maps to undef. Later duplicates overwrite earlier keys in place.
    #[must_use]
    pub fn from_flat_list(cells: &[ScalarCell]) -> Self {
        let mut hash = Self::new();
        let mut it = cells.iter();
        while let Some(key) = it.next() {
            let key: Rc<str> = Rc::from(key.borrow().to_text().as_str());
            let value = it.next().map_or(Scalar::Undef, |c| c.borrow().clone());
            hash.set(&key, value);
        }
        hash
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rvalue lookup: the cell for `key`, or a fresh unlinked undef cell.
    #[must_use]
    pub fn get(&self, key: &str) -> ScalarCell {
        self.entries.get(key).map_or_else(|| cell(Scalar::Undef), Rc::clone)
    }

    /// Lvalue lookup: inserts an undef cell for missing keys and returns the
    /// entry's cell.
    pub fn lvalue(&mut self, key: &str) -> ScalarCell {
        if let Some(existing) = self.entries.get(key) {
            return Rc::clone(existing);
        }
        let fresh = cell(Scalar::Undef);
        self.entries.insert(Rc::from(key), Rc::clone(&fresh));
        fresh
    }

    /// Stores a value under `key`, writing through the existing cell when
    /// the key is present so aliases observe the update.
    pub fn set(&mut self, key: &str, value: Scalar) {
        let slot = self.lvalue(key);
        *slot.borrow_mut() = value;
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Removes an entry, returning its cell.
    pub fn delete(&mut self, key: &str) -> Option<ScalarCell> {
        // shift_remove preserves the order of the remaining entries.
        self.entries.shift_remove(key)
    }

    /// The keys as fresh string cells, in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<ScalarCell> {
        self.entries.keys().map(|k| cell(Scalar::Str(Rc::clone(k)))).collect()
    }

    /// The value cells, in insertion order.
    #[must_use]
    pub fn values(&self) -> Vec<ScalarCell> {
        self.entries.values().map(Rc::clone).collect()
    }

    /// Replaces the whole contents from a flat key/value list.
    pub fn assign(&mut self, cells: &[ScalarCell]) {
        self.entries.clear();
        let mut it = cells.iter();
        while let Some(key) = it.next() {
            let key: Rc<str> = Rc::from(key.borrow().to_text().as_str());
            let value = it.next().map_or(Scalar::Undef, |c| c.borrow().clone());
            self.set(&key, value);
        }
    }

    /// Slice read: value cells for each key (fresh undef for missing keys).
    #[must_use]
    pub fn slice(&self, keys: &[String]) -> Vec<ScalarCell> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Slice write: stores each value under the matching key.
    pub fn slice_set(&mut self, keys: &[String], values: &[ScalarCell]) {
        for (n, key) in keys.iter().enumerate() {
            let value = values.get(n).map_or(Scalar::Undef, |c| c.borrow().clone());
            self.set(key, value);
        }
    }

    /// Slice delete: removes each key, returning the deleted cells.
    pub fn slice_delete(&mut self, keys: &[String]) -> Vec<ScalarCell> {
        keys.iter()
            .map(|k| self.delete(k).unwrap_or_else(|| cell(Scalar::Undef)))
            .collect()
    }

    /// Bless this container into a package.
    pub fn bless(&mut self, package: Rc<str>) {
        self.blessed = Some(package);
    }

    /// The package this container is blessed into, if any.
    #[must_use]
    pub fn blessed(&self) -> Option<Rc<str>> {
        self.blessed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_stable() {
        let mut h = Hash::new();
        h.set("b", Scalar::Int(1));
        h.set("a", Scalar::Int(2));
        h.set("c", Scalar::Int(3));
        let keys: Vec<String> = h.keys().iter().map(|c| c.borrow().to_text()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut h = Hash::new();
        h.set("x", Scalar::Int(1));
        h.set("y", Scalar::Int(2));
        h.set("x", Scalar::Int(9));
        let keys: Vec<String> = h.keys().iter().map(|c| c.borrow().to_text()).collect();
        assert_eq!(keys, vec!["x", "y"]);
        assert_eq!(h.get("x").borrow().to_int(), 9);
    }

    #[test]
    fn test_lvalue_cell_aliases() {
        let mut h = Hash::new();
        let slot = h.lvalue("k");
        *slot.borrow_mut() = Scalar::Int(7);
        assert_eq!(h.get("k").borrow().to_int(), 7);
        assert!(h.exists("k"));
    }

    #[test]
    fn test_from_flat_list_odd_length() {
        let cells = vec![cell(Scalar::str("a")), cell(Scalar::Int(1)), cell(Scalar::str("b"))];
        let h = Hash::from_flat_list(&cells);
        assert_eq!(h.get("a").borrow().to_int(), 1);
        assert!(h.exists("b"));
        assert!(!h.get("b").borrow().defined());
    }

    #[test]
    fn test_delete_preserves_remaining_order() {
        let mut h = Hash::new();
        h.set("a", Scalar::Int(1));
        h.set("b", Scalar::Int(2));
        h.set("c", Scalar::Int(3));
        h.delete("b");
        let keys: Vec<String> = h.keys().iter().map(|c| c.borrow().to_text()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
