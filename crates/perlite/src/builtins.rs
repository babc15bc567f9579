//! The `CALL_BUILTIN` table.
//!
//! Operator-library functions that are too uncommon for dedicated opcodes
//! but too common for the slow-op table. Each entry takes the flattened
//! argument cells and produces a value; `wantarray` additionally sees the
//! current frame's effective context.

use crate::context::Context;
use crate::runtime::error::RunError;
use crate::runtime::ops;
use crate::runtime::scalar::{Scalar, ScalarCell};
use crate::runtime::value::Value;

/// Builtin ids encoded in `CALL_BUILTIN`'s operand unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum Builtin {
    Abs = 0,
    Int,
    Sqrt,
    Uc,
    Lc,
    Ucfirst,
    Lcfirst,
    Chr,
    Ord,
    Hex,
    Oct,
    Sprintf,
    Index,
    Rindex,
    Chomp,
    Chop,
    Split,
    Wantarray,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
}

impl Builtin {
    /// Decodes a builtin id unit. `None` means corrupted bytecode.
    #[inline]
    #[must_use]
    pub fn from_unit(unit: u16) -> Option<Self> {
        Self::from_repr(unit)
    }

    /// The source-level name, for disassembly and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Argument cell at position `n`, undef when absent.
fn arg(args: &[ScalarCell], n: usize) -> Scalar {
    args.get(n).map_or(Scalar::Undef, |c| c.borrow().clone())
}

/// Dispatches one builtin call.
///
/// `frame_ctx` is the context the *current frame* was invoked with, which
/// is what `wantarray` reports.
pub fn call(builtin: Builtin, args: &[ScalarCell], frame_ctx: Context) -> Result<Value, RunError> {
    let result = match builtin {
        Builtin::Abs => Value::scalar(ops::abs_value(&arg(args, 0))),
        Builtin::Int => Value::scalar(ops::int_value(&arg(args, 0))),
        Builtin::Sqrt => {
            let n = arg(args, 0).to_num();
            if n < 0.0 {
                return Err(RunError::msg(format!("Can't take sqrt of {n}")));
            }
            Value::scalar(Scalar::Num(n.sqrt()))
        }
        Builtin::Uc => Value::scalar(ops::uppercase(&arg(args, 0))),
        Builtin::Lc => Value::scalar(ops::lowercase(&arg(args, 0))),
        Builtin::Ucfirst => Value::scalar(ops::ucfirst(&arg(args, 0))),
        Builtin::Lcfirst => Value::scalar(ops::lcfirst(&arg(args, 0))),
        Builtin::Chr => Value::scalar(ops::chr_of(&arg(args, 0))),
        Builtin::Ord => Value::scalar(ops::ord_of(&arg(args, 0))),
        Builtin::Hex => Value::scalar(ops::hex_of(&arg(args, 0))),
        Builtin::Oct => Value::scalar(ops::oct_of(&arg(args, 0))),
        Builtin::Sprintf => Value::scalar(ops::sprintf(&arg(args, 0), args.get(1..).unwrap_or(&[]))?),
        Builtin::Index => {
            let from = args.get(2).map(|c| c.borrow().clone());
            Value::scalar(ops::index_of(&arg(args, 0), &arg(args, 1), from.as_ref()))
        }
        Builtin::Rindex => {
            let from = args.get(2).map(|c| c.borrow().clone());
            Value::scalar(ops::rindex_of(&arg(args, 0), &arg(args, 1), from.as_ref()))
        }
        Builtin::Chomp => {
            // Mutates the first argument cell in place, returns the number
            // of characters removed.
            let Some(target) = args.first() else {
                return Ok(Value::int(0));
            };
            let text = target.borrow().to_text();
            if let Some(stripped) = text.strip_suffix('\n') {
                *target.borrow_mut() = Scalar::str(stripped);
                Value::int(1)
            } else {
                Value::int(0)
            }
        }
        Builtin::Chop => {
            let Some(target) = args.first() else {
                return Ok(Value::str(""));
            };
            let mut text = target.borrow().to_text();
            let removed = text.pop().map_or_else(String::new, |c| c.to_string());
            *target.borrow_mut() = Scalar::str(text);
            Value::str(removed)
        }
        Builtin::Split => {
            let limit = args.get(2).map(|c| c.borrow().to_int());
            let fields = ops::split(&arg(args, 0), &arg(args, 1), limit);
            Value::list(fields.into_iter().map(crate::runtime::scalar::cell).collect())
        }
        Builtin::Wantarray => Value::scalar(match frame_ctx {
            Context::List => Scalar::Int(1),
            Context::Scalar => Scalar::Int(0),
            Context::Void | Context::Runtime => Scalar::Undef,
        }),
        Builtin::BitAnd => Value::scalar(ops::bit_and(&arg(args, 0), &arg(args, 1))),
        Builtin::BitOr => Value::scalar(ops::bit_or(&arg(args, 0), &arg(args, 1))),
        Builtin::BitXor => Value::scalar(ops::bit_xor(&arg(args, 0), &arg(args, 1))),
        Builtin::BitNot => Value::scalar(ops::bit_not(&arg(args, 0))),
        Builtin::Shl => Value::scalar(ops::shift_left(&arg(args, 0), &arg(args, 1))),
        Builtin::Shr => Value::scalar(ops::shift_right(&arg(args, 0), &arg(args, 1))),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scalar::cell;

    #[test]
    fn test_chomp_mutates_in_place() {
        let target = cell(Scalar::str("line\n"));
        let removed = call(Builtin::Chomp, &[target.clone()], Context::Scalar).unwrap();
        assert_eq!(removed.scalarize().to_int(), 1);
        assert_eq!(target.borrow().to_text(), "line");

        let removed = call(Builtin::Chomp, &[target.clone()], Context::Scalar).unwrap();
        assert_eq!(removed.scalarize().to_int(), 0);
    }

    #[test]
    fn test_wantarray_reports_frame_context() {
        let v = call(Builtin::Wantarray, &[], Context::List).unwrap();
        assert_eq!(v.scalarize().to_int(), 1);
        let v = call(Builtin::Wantarray, &[], Context::Scalar).unwrap();
        assert_eq!(v.scalarize().to_int(), 0);
        let v = call(Builtin::Wantarray, &[], Context::Void).unwrap();
        assert!(!v.scalarize().defined());
    }

    #[test]
    fn test_split_returns_list() {
        let args = vec![cell(Scalar::str(",")), cell(Scalar::str("a,b"))];
        let v = call(Builtin::Split, &args, Context::List).unwrap();
        assert_eq!(v.list_len(), 2);
    }

    #[test]
    fn test_sqrt_negative_dies() {
        assert!(call(Builtin::Sqrt, &[cell(Scalar::Int(-1))], Context::Scalar).is_err());
    }

    #[test]
    fn test_id_round_trip() {
        assert_eq!(Builtin::from_unit(Builtin::Shr as u16), Some(Builtin::Shr));
        assert_eq!(Builtin::from_unit(999), None);
    }
}
