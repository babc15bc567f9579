//! The register-slot value type.
//!
//! A register holds either a scalar cell or one of the aggregate kinds the
//! instruction set manipulates directly: arrays (which double as value
//! lists), hashes, code objects, file handles, iterators, and control-flow
//! markers. Every aggregate is a shared handle; copying a `Value` between
//! registers never copies data.

use std::rc::Rc;

use crate::code::CodeValue;
use crate::runtime::array::{array_ref, Array, ArrayRef};
use crate::runtime::control::ControlFlow;
use crate::runtime::error::RunError;
use crate::runtime::hash::HashRef;
use crate::runtime::io::HandleRef;
use crate::runtime::iter::IterRef;
use crate::runtime::scalar::{cell, Scalar, ScalarCell};

/// One register slot.
#[derive(Debug, Clone)]
pub enum Value {
    /// A scalar cell (the common case).
    Scalar(ScalarCell),
    /// An array container; also the representation of flattened value lists.
    Array(ArrayRef),
    /// A hash container.
    Hash(HashRef),
    /// A code object.
    Code(CodeValue),
    /// A file handle.
    Handle(HandleRef),
    /// A list iterator.
    Iter(IterRef),
    /// A non-local control-flow marker.
    Control(Rc<ControlFlow>),
}

impl Value {
    /// A fresh undef scalar cell.
    #[must_use]
    pub fn undef() -> Self {
        Value::Scalar(cell(Scalar::Undef))
    }

    /// Wraps a scalar in a fresh cell.
    #[must_use]
    pub fn scalar(s: Scalar) -> Self {
        Value::Scalar(cell(s))
    }

    #[must_use]
    pub fn int(i: i64) -> Self {
        Value::scalar(Scalar::Int(i))
    }

    #[must_use]
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::scalar(Scalar::str(s))
    }

    /// A fresh list value owning the given cells.
    #[must_use]
    pub fn list(cells: Vec<ScalarCell>) -> Self {
        Value::Array(array_ref(Array::from_cells(cells)))
    }

    /// An empty list value.
    #[must_use]
    pub fn empty_list() -> Self {
        Value::list(Vec::new())
    }

    /// True if this slot holds a control-flow marker.
    #[inline]
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Value::Control(_))
    }

    /// The marker, if this slot holds one.
    #[must_use]
    pub fn as_control(&self) -> Option<&Rc<ControlFlow>> {
        match self {
            Value::Control(cf) => Some(cf),
            _ => None,
        }
    }

    /// Scalar-context coercion as a plain scalar: aggregates yield their
    /// count, code and handles their reference scalars. Markers coerce to
    /// undef but should never reach here; callers check `is_control` first.
    #[must_use]
    pub fn scalarize(&self) -> Scalar {
        match self {
            Value::Scalar(c) => c.borrow().clone(),
            Value::Array(a) => Scalar::Int(a.borrow().len() as i64),
            Value::Hash(h) => Scalar::Int(h.borrow().len() as i64),
            Value::Code(c) => Scalar::Code(c.clone()),
            Value::Handle(h) => Scalar::Glob(Rc::clone(h)),
            Value::Iter(_) | Value::Control(_) => Scalar::Undef,
        }
    }

    /// Scalar-context coercion as a cell. Scalar slots hand out their own
    /// cell (preserving aliasing); aggregates wrap [`Value::scalarize`] in a
    /// fresh one.
    #[must_use]
    pub fn scalar_cell(&self) -> ScalarCell {
        match self {
            Value::Scalar(c) => Rc::clone(c),
            other => cell(other.scalarize()),
        }
    }

    /// Truthiness in boolean context.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Scalar(c) => c.borrow().truthy(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Hash(h) => !h.borrow().is_empty(),
            Value::Code(_) | Value::Handle(_) | Value::Iter(_) => true,
            Value::Control(_) => false,
        }
    }

    /// Definedness (for `defined` and the `//` operator).
    #[must_use]
    pub fn defined(&self) -> bool {
        match self {
            Value::Scalar(c) => c.borrow().defined(),
            Value::Control(_) => false,
            _ => true,
        }
    }

    /// Appends this value's cells to a flat list, aliasing rather than
    /// copying: scalars contribute their own cell, arrays and hashes their
    /// element cells, the way list flattening aliases in the source
    /// language.
    pub fn flatten_into(&self, out: &mut Vec<ScalarCell>) {
        match self {
            Value::Scalar(c) => out.push(Rc::clone(c)),
            Value::Array(a) => out.extend(a.borrow().cells().iter().map(Rc::clone)),
            Value::Hash(h) => {
                let h = h.borrow();
                for (key, value) in h.keys().into_iter().zip(h.values()) {
                    out.push(key);
                    out.push(value);
                }
            }
            other => out.push(cell(other.scalarize())),
        }
    }

    /// This value as a flat cell list.
    #[must_use]
    pub fn flatten(&self) -> Vec<ScalarCell> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    /// The number of elements this value contributes in list context.
    #[must_use]
    pub fn list_len(&self) -> usize {
        match self {
            Value::Array(a) => a.borrow().len(),
            Value::Hash(h) => h.borrow().len() * 2,
            _ => 1,
        }
    }

    /// The code object behind this value: a code slot directly, or a scalar
    /// holding a code reference.
    pub fn as_code(&self) -> Result<CodeValue, RunError> {
        match self {
            Value::Code(c) => Ok(c.clone()),
            Value::Scalar(c) => c
                .borrow()
                .as_code()
                .ok_or_else(|| RunError::msg("Not a CODE reference")),
            _ => Err(RunError::msg("Not a CODE reference")),
        }
    }

    /// The array behind this value: an array slot directly, or a scalar
    /// holding an array reference.
    pub fn as_array(&self) -> Result<ArrayRef, RunError> {
        match self {
            Value::Array(a) => Ok(Rc::clone(a)),
            Value::Scalar(c) => match &*c.borrow() {
                Scalar::ArrayRef(a) => Ok(Rc::clone(a)),
                _ => Err(RunError::msg("Not an ARRAY reference")),
            },
            _ => Err(RunError::msg("Not an ARRAY reference")),
        }
    }

    /// The hash behind this value: a hash slot directly, or a scalar
    /// holding a hash reference.
    pub fn as_hash(&self) -> Result<HashRef, RunError> {
        match self {
            Value::Hash(h) => Ok(Rc::clone(h)),
            Value::Scalar(c) => match &*c.borrow() {
                Scalar::HashRef(h) => Ok(Rc::clone(h)),
                _ => Err(RunError::msg("Not a HASH reference")),
            },
            _ => Err(RunError::msg("Not a HASH reference")),
        }
    }

    /// The file handle behind this value, if any.
    pub fn as_handle(&self) -> Result<HandleRef, RunError> {
        match self {
            Value::Handle(h) => Ok(Rc::clone(h)),
            Value::Scalar(c) => match &*c.borrow() {
                Scalar::Glob(h) => Ok(Rc::clone(h)),
                _ => Err(RunError::msg("Not a GLOB reference")),
            },
            _ => Err(RunError::msg("Not a GLOB reference")),
        }
    }

    /// The internal kind name, for `GET_TYPE` and diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
            Value::Code(_) => "code",
            Value::Handle(_) => "glob",
            Value::Iter(_) => "iterator",
            Value::Control(_) => "control",
        }
    }

    /// Shapes this value for a caller's context: lists flatten to a fresh
    /// list value, scalar context scalarizes, void context keeps nothing.
    #[must_use]
    pub fn for_context(&self, ctx: crate::context::Context) -> Value {
        use crate::context::Context;
        if self.is_control() {
            return self.clone();
        }
        match ctx {
            Context::List | Context::Runtime => match self {
                Value::Array(_) | Value::Hash(_) => self.clone(),
                other => Value::list(other.flatten()),
            },
            Context::Scalar => Value::Scalar(self.scalar_cell()),
            Context::Void => Value::undef(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_aliases_scalar_cells() {
        let v = Value::int(5);
        let cells = v.flatten();
        *cells[0].borrow_mut() = Scalar::Int(6);
        assert_eq!(v.scalarize().to_int(), 6);
    }

    #[test]
    fn test_array_scalarizes_to_count() {
        let v = Value::list(vec![cell(Scalar::Int(1)), cell(Scalar::Int(2))]);
        assert_eq!(v.scalarize().to_int(), 2);
    }

    #[test]
    fn test_nested_flatten() {
        let inner = Value::list(vec![cell(Scalar::Int(1)), cell(Scalar::Int(2))]);
        let mut out = Vec::new();
        inner.flatten_into(&mut out);
        Value::int(3).flatten_into(&mut out);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_as_array_through_reference() {
        let arr = array_ref(Array::from_scalars([Scalar::Int(1)]));
        let v = Value::scalar(Scalar::ArrayRef(Rc::clone(&arr)));
        let resolved = v.as_array().unwrap();
        assert!(Rc::ptr_eq(&arr, &resolved));
    }
}
