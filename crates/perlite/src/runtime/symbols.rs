//! The global symbol table.
//!
//! One flat table per engine, keyed by fully-qualified names
//! (`main::x`, `Foo::Bar::count`). Lookups hand out stable live handles:
//! a scalar fetched twice is the same cell, so `STORE_GLOBAL` writes are
//! visible through every previously-fetched handle. Missing entries
//! autovivify, matching the source language's global namespace.
//!
//! Method resolution walks the package's `@ISA` array depth-first, which is
//! how both execution engines dispatch methods, so replacing a native sub
//! with an interpreted one under the same name changes nothing for callers.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::code::CodeValue;
use crate::runtime::array::{array_ref, Array, ArrayRef};
use crate::runtime::hash::{hash_ref, Hash, HashRef};
use crate::runtime::scalar::{cell, Scalar, ScalarCell};

/// Global symbol storage for scalars, arrays, hashes and code.
#[derive(Debug, Default)]
pub struct SymbolTable {
    scalars: AHashMap<String, ScalarCell>,
    arrays: AHashMap<String, ArrayRef>,
    hashes: AHashMap<String, HashRef>,
    code: AHashMap<String, CodeValue>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The live cell for a global scalar, autovivifying undef.
    pub fn get_scalar(&mut self, name: &str) -> ScalarCell {
        if let Some(existing) = self.scalars.get(name) {
            return Rc::clone(existing);
        }
        let fresh = cell(Scalar::Undef);
        self.scalars.insert(name.to_owned(), Rc::clone(&fresh));
        fresh
    }

    /// Sets a global scalar in place through its live cell.
    pub fn set_scalar(&mut self, name: &str, value: Scalar) {
        let slot = self.get_scalar(name);
        *slot.borrow_mut() = value;
    }

    /// The live handle for a global array, autovivifying empty.
    pub fn get_array(&mut self, name: &str) -> ArrayRef {
        if let Some(existing) = self.arrays.get(name) {
            return Rc::clone(existing);
        }
        let fresh = array_ref(Array::new());
        self.arrays.insert(name.to_owned(), Rc::clone(&fresh));
        fresh
    }

    /// The live handle for a global hash, autovivifying empty.
    pub fn get_hash(&mut self, name: &str) -> HashRef {
        if let Some(existing) = self.hashes.get(name) {
            return Rc::clone(existing);
        }
        let fresh = hash_ref(Hash::new());
        self.hashes.insert(name.to_owned(), Rc::clone(&fresh));
        fresh
    }

    /// Looks up a global subroutine. No autovivification: an undefined sub
    /// is a call-time error, not an empty one.
    #[must_use]
    pub fn get_code(&self, name: &str) -> Option<CodeValue> {
        self.code.get(name).cloned()
    }

    /// Installs (or replaces) a global subroutine.
    pub fn set_code(&mut self, name: &str, code: CodeValue) {
        self.code.insert(name.to_owned(), code);
    }

    /// True if a subroutine is installed under the name.
    #[must_use]
    pub fn has_code(&self, name: &str) -> bool {
        self.code.contains_key(name)
    }

    /// Resolves `package->method` through the package and its `@ISA`
    /// chain, depth-first, cycles tolerated.
    pub fn resolve_method(&mut self, package: &str, method: &str) -> Option<CodeValue> {
        let mut visited = AHashSet::new();
        self.resolve_method_in(package, method, &mut visited)
    }

    fn resolve_method_in(
        &mut self,
        package: &str,
        method: &str,
        visited: &mut AHashSet<String>,
    ) -> Option<CodeValue> {
        if !visited.insert(package.to_owned()) {
            return None;
        }
        if let Some(found) = self.get_code(&format!("{package}::{method}")) {
            return Some(found);
        }
        let parents: Vec<String> = {
            let isa = self.get_array(&format!("{package}::ISA"));
            let isa = isa.borrow();
            isa.cells().iter().map(|c| c.borrow().to_text()).collect()
        };
        for parent in parents {
            if let Some(found) = self.resolve_method_in(&parent, method, visited) {
                return Some(found);
            }
        }
        None
    }

    /// True if `package` is or inherits from `ancestor` (the `isa` check).
    pub fn package_isa(&mut self, package: &str, ancestor: &str) -> bool {
        let mut visited = AHashSet::new();
        self.package_isa_in(package, ancestor, &mut visited)
    }

    fn package_isa_in(&mut self, package: &str, ancestor: &str, visited: &mut AHashSet<String>) -> bool {
        if package == ancestor {
            return true;
        }
        if !visited.insert(package.to_owned()) {
            return false;
        }
        let parents: Vec<String> = {
            let isa = self.get_array(&format!("{package}::ISA"));
            let isa = isa.borrow();
            isa.cells().iter().map(|c| c.borrow().to_text()).collect()
        };
        parents.iter().any(|p| self.package_isa_in(p, ancestor, visited))
    }
}
