//! Persistent variables captured during compile-phase blocks.
//!
//! A `BEGIN`-style block runs at compile time; lexicals it closed over must
//! survive into runtime invocations. The host registers those values here,
//! keyed by (variable name, phase id), and the slow-op handler retrieves
//! them.

use ahash::AHashMap;

use crate::runtime::array::ArrayRef;
use crate::runtime::hash::HashRef;
use crate::runtime::scalar::ScalarCell;

/// Key for one persistent variable: name plus the phase block's id.
type Key = (String, u32);

/// Store of phase-block-captured variables.
#[derive(Debug, Default)]
pub struct PhaseStore {
    scalars: AHashMap<Key, ScalarCell>,
    arrays: AHashMap<Key, ArrayRef>,
    hashes: AHashMap<Key, HashRef>,
}

impl PhaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scalar(&mut self, name: &str, phase: u32, value: ScalarCell) {
        self.scalars.insert((name.to_owned(), phase), value);
    }

    pub fn register_array(&mut self, name: &str, phase: u32, value: ArrayRef) {
        self.arrays.insert((name.to_owned(), phase), value);
    }

    pub fn register_hash(&mut self, name: &str, phase: u32, value: HashRef) {
        self.hashes.insert((name.to_owned(), phase), value);
    }

    #[must_use]
    pub fn scalar(&self, name: &str, phase: u32) -> Option<ScalarCell> {
        self.scalars.get(&(name.to_owned(), phase)).cloned()
    }

    #[must_use]
    pub fn array(&self, name: &str, phase: u32) -> Option<ArrayRef> {
        self.arrays.get(&(name.to_owned(), phase)).cloned()
    }

    #[must_use]
    pub fn hash(&self, name: &str, phase: u32) -> Option<HashRef> {
        self.hashes.get(&(name.to_owned(), phase)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scalar::{cell, Scalar};

    #[test]
    fn test_scalar_round_trip_by_phase() {
        let mut store = PhaseStore::new();
        store.register_scalar("$counter", 0, cell(Scalar::Int(1)));
        store.register_scalar("$counter", 1, cell(Scalar::Int(2)));
        assert_eq!(store.scalar("$counter", 0).unwrap().borrow().to_int(), 1);
        assert_eq!(store.scalar("$counter", 1).unwrap().borrow().to_int(), 2);
        assert!(store.scalar("$counter", 2).is_none());
    }
}
