//! The array container.
//!
//! Arrays hold scalar cells, not plain scalars: element access hands out the
//! cell itself, so `foreach` aliasing and `\$a[0]` references see in-place
//! mutation. Negative indices count from the end, as in the source language.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::scalar::{cell, Scalar, ScalarCell};

/// Shared handle to an array container.
pub type ArrayRef = Rc<RefCell<Array>>;

/// Wraps an array in a fresh shared handle.
#[inline]
#[must_use]
pub fn array_ref(array: Array) -> ArrayRef {
    Rc::new(RefCell::new(array))
}

/// A dynamic array of scalar cells.
#[derive(Debug, Default)]
pub struct Array {
    elems: Vec<ScalarCell>,
    /// Package this container was blessed into, if any.
    blessed: Option<Rc<str>>,
}

impl Array {
    /// Creates an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an array owning the given cells (no copies).
    #[must_use]
    pub fn from_cells(elems: Vec<ScalarCell>) -> Self {
        Self { elems, blessed: None }
    }

    /// Creates an array of fresh cells holding the given scalars.
    #[must_use]
    pub fn from_scalars(values: impl IntoIterator<Item = Scalar>) -> Self {
        Self::from_cells(values.into_iter().map(cell).collect())
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// The element cells, in order.
    #[inline]
    #[must_use]
    pub fn cells(&self) -> &[ScalarCell] {
        &self.elems
    }

    /// Resolves a possibly-negative index to a vector position.
    ///
    /// Returns `None` when a negative index reaches before the start.
    fn position(&self, index: i64) -> Option<usize> {
        if index >= 0 {
            Some(index as usize)
        } else {
            let back = index.unsigned_abs() as usize;
            self.elems.len().checked_sub(back)
        }
    }

    /// Rvalue element access: returns the cell at `index`, or a fresh undef
    /// cell (not linked into the array) when out of range.
    #[must_use]
    pub fn get(&self, index: i64) -> ScalarCell {
        self.position(index)
            .and_then(|i| self.elems.get(i))
            .map_or_else(|| cell(Scalar::Undef), Rc::clone)
    }

    /// Lvalue element access: extends the array with undef cells as needed
    /// and returns the cell at `index`. Out-of-range negative indices clamp
    /// to the first element.
    pub fn lvalue(&mut self, index: i64) -> ScalarCell {
        let pos = self.position(index).unwrap_or(0);
        if pos >= self.elems.len() {
            self.elems.resize_with(pos + 1, || cell(Scalar::Undef));
        }
        Rc::clone(&self.elems[pos])
    }

    /// Stores a scalar at `index`, extending the array as needed. The write
    /// goes through the existing cell so aliases observe it.
    pub fn set(&mut self, index: i64, value: Scalar) {
        let slot = self.lvalue(index);
        *slot.borrow_mut() = value;
    }

    /// Appends cells, returning the new length.
    pub fn push(&mut self, cells: impl IntoIterator<Item = ScalarCell>) -> usize {
        self.elems.extend(cells);
        self.elems.len()
    }

    /// Removes and returns the last cell.
    pub fn pop(&mut self) -> Option<ScalarCell> {
        self.elems.pop()
    }

    /// Removes and returns the first cell.
    pub fn shift(&mut self) -> Option<ScalarCell> {
        if self.elems.is_empty() {
            None
        } else {
            Some(self.elems.remove(0))
        }
    }

    /// Prepends cells, returning the new length.
    pub fn unshift(&mut self, cells: Vec<ScalarCell>) -> usize {
        self.elems.splice(0..0, cells);
        self.elems.len()
    }

    /// Replaces the whole contents. Existing cells are dropped, not reused:
    /// aliases keep the old values, matching whole-array assignment.
    pub fn assign(&mut self, cells: Vec<ScalarCell>) {
        self.elems = cells;
    }

    /// Slice read: the cells at each index (fresh undef for out-of-range).
    #[must_use]
    pub fn slice(&self, indices: &[i64]) -> Vec<ScalarCell> {
        indices.iter().map(|&i| self.get(i)).collect()
    }

    /// Slice write: stores each value at the matching index; missing values
    /// store undef.
    pub fn slice_set(&mut self, indices: &[i64], values: &[ScalarCell]) {
        for (n, &index) in indices.iter().enumerate() {
            let value = values.get(n).map_or(Scalar::Undef, |c| c.borrow().clone());
            self.set(index, value);
        }
    }

    /// Removes `len` cells starting at `offset` and inserts `replacement`
    /// there, returning the removed cells. Offsets follow the usual
    /// negative-index rules; out-of-range requests clamp.
    pub fn splice(&mut self, offset: i64, len: Option<i64>, replacement: Vec<ScalarCell>) -> Vec<ScalarCell> {
        let start = self.position(offset).unwrap_or(0).min(self.elems.len());
        let count = match len {
            None => self.elems.len() - start,
            Some(n) if n >= 0 => (n as usize).min(self.elems.len() - start),
            // Negative length: leave -len elements at the end.
            Some(n) => {
                let keep = n.unsigned_abs() as usize;
                self.elems.len().saturating_sub(start + keep)
            }
        };
        self.elems.splice(start..start + count, replacement).collect()
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

    fn ints(values: &[i64]) -> Array {
        Array::from_scalars(values.iter().map(|&i| Scalar::Int(i)))
    }

    fn to_ints(cells: &[ScalarCell]) -> Vec<i64> {
        cells.iter().map(|c| c.borrow().to_int()).collect()
    }

    #[test]
    fn test_negative_indexing() {
        let a = ints(&[1, 2, 3]);
        assert_eq!(a.get(-1).borrow().to_int(), 3);
        assert_eq!(a.get(-3).borrow().to_int(), 1);
        assert!(!a.get(-4).borrow().defined());
    }

    #[test]
    fn test_lvalue_extends() {
        let mut a = ints(&[1]);
        a.set(3, Scalar::Int(9));
        assert_eq!(a.len(), 4);
        assert!(!a.get(1).borrow().defined());
        assert_eq!(a.get(3).borrow().to_int(), 9);
    }

    #[test]
    fn test_element_cells_alias() {
        let mut a = ints(&[5]);
        let elem = a.lvalue(0);
        *elem.borrow_mut() = Scalar::Int(6);
        assert_eq!(a.get(0).borrow().to_int(), 6);
    }

    #[test]
    fn test_splice_middle() {
        let mut a = ints(&[1, 2, 3, 4]);
        let removed = a.splice(1, Some(2), vec![cell(Scalar::Int(9))]);
        assert_eq!(to_ints(&removed), vec![2, 3]);
        assert_eq!(to_ints(a.cells()), vec![1, 9, 4]);
    }

    #[test]
    fn test_splice_negative_len() {
        let mut a = ints(&[1, 2, 3, 4]);
        // Remove from offset 1, keeping one trailing element.
        let removed = a.splice(1, Some(-1), vec![]);
        assert_eq!(to_ints(&removed), vec![2, 3]);
        assert_eq!(to_ints(a.cells()), vec![1, 4]);
    }

    #[test]
    fn test_shift_unshift() {
        let mut a = ints(&[2, 3]);
        let n = a.unshift(vec![cell(Scalar::Int(1))]);
        assert_eq!(n, 3);
        assert_eq!(a.shift().unwrap().borrow().to_int(), 1);
    }
}
