//! Calling-context tags.
//!
//! Every call carries a context tag so operators and subroutines produce the
//! shape the caller expects: a single scalar, a flattened list, or nothing.
//! `Runtime` defers the decision to the caller's own context, which every
//! frame keeps in register 2.

/// The calling context passed to every subroutine and operator call.
///
/// Encoded as a single code unit in call instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::FromRepr, serde::Serialize, serde::Deserialize)]
#[repr(u16)]
pub enum Context {
    /// Result is discarded.
    Void = 0,
    /// Caller expects a single scalar.
    Scalar = 1,
    /// Caller expects a flattened list.
    #[default]
    List = 2,
    /// Propagate the caller's own context (resolved at the call site).
    Runtime = 3,
}

impl Context {
    /// Decodes a context tag from a code unit.
    ///
    /// Returns `None` for out-of-range values, which indicates corrupted
    /// bytecode rather than a user error.
    #[inline]
    #[must_use]
    pub fn from_unit(unit: u16) -> Option<Self> {
        Self::from_repr(unit)
    }

    /// Returns the tag as a code unit for emission.
    #[inline]
    #[must_use]
    pub fn as_unit(self) -> u16 {
        self as u16
    }

    /// Resolves `Runtime` against the caller's effective context.
    #[inline]
    #[must_use]
    pub fn resolve(self, caller: Context) -> Context {
        if self == Context::Runtime {
            caller
        } else {
            self
        }
    }

    /// Returns true if the caller expects a flattened list.
    #[inline]
    #[must_use]
    pub fn wants_list(self) -> bool {
        matches!(self, Context::List)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_round_trip() {
        for ctx in [Context::Void, Context::Scalar, Context::List, Context::Runtime] {
            assert_eq!(Context::from_unit(ctx.as_unit()), Some(ctx));
        }
        assert_eq!(Context::from_unit(4), None);
    }

    #[test]
    fn test_runtime_resolution() {
        assert_eq!(Context::Runtime.resolve(Context::Scalar), Context::Scalar);
        assert_eq!(Context::List.resolve(Context::Scalar), Context::List);
    }
}
