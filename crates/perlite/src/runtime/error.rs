//! Runtime errors and the die/warn emitters.
//!
//! A [`RunError`] carries the thrown value (`die` can throw references, not
//! just strings) plus the source coordinates it was raised at. String
//! messages without a trailing newline get the " at NAME line N." suffix at
//! the raise site, so the value seen in the error variable after a catch
//! matches what the source language produces.

use std::fmt;
use std::rc::Rc;

use crate::runtime::scalar::{Scalar, ScalarCell};

/// Source coordinates attached to a raised error.
#[derive(Debug, Clone)]
pub struct DieLocation {
    /// Qualified name of the running subroutine.
    pub sub_name: Rc<str>,
    /// Source (file) name of the code object.
    pub source: Rc<str>,
    /// Source line of the faulting instruction.
    pub line: u32,
    /// Instruction offset, when raised from the dispatch loop.
    pub pc: Option<usize>,
}

impl fmt::Display for DieLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {} line {}", self.source, self.line)?;
        if let Some(pc) = self.pc {
            write!(f, " (pc {pc})")?;
        }
        Ok(())
    }
}

/// An error propagating out of the interpreter or an operator.
///
/// Caught by the nearest enclosing `eval` block; uncaught errors surface to
/// the host with their coordinates.
#[derive(Debug, Clone)]
pub struct RunError {
    value: Scalar,
    location: Option<DieLocation>,
}

impl RunError {
    /// Creates an error from a plain message. Coordinates are attached
    /// later by the dispatch loop via [`RunError::ensure_located`].
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            value: Scalar::str(message.into()),
            location: None,
        }
    }

    /// Creates an error carrying an arbitrary thrown value.
    #[must_use]
    pub fn from_value(value: Scalar) -> Self {
        Self { value, location: None }
    }

    /// The `die` emitter: joins the argument cells into the thrown value.
    ///
    /// A single reference argument is thrown as-is (object exceptions);
    /// string messages lacking a trailing newline are suffixed with the
    /// raise coordinates; an empty message becomes "Died".
    #[must_use]
    pub fn die(args: &[ScalarCell], location: DieLocation) -> Self {
        if let [only] = args {
            let value = only.borrow().clone();
            if !value.ref_type().is_empty() {
                return Self {
                    value,
                    location: Some(location),
                };
            }
        }
        let mut message: String = args.iter().map(|c| c.borrow().to_text()).collect();
        if message.is_empty() {
            message.push_str("Died");
        }
        if !message.ends_with('\n') {
            message.push_str(&format!(" at {} line {}.\n", location.source, location.line));
        }
        Self {
            value: Scalar::str(message),
            location: Some(location),
        }
    }

    /// The `warn` emitter: the message the warning handler should print,
    /// decorated the same way `die` decorates.
    #[must_use]
    pub fn warn_text(args: &[ScalarCell], location: &DieLocation) -> String {
        let mut message: String = args.iter().map(|c| c.borrow().to_text()).collect();
        if message.is_empty() {
            message.push_str("Warning: something's wrong");
        }
        if !message.ends_with('\n') {
            message.push_str(&format!(" at {} line {}.\n", location.source, location.line));
        }
        message
    }

    /// Attaches coordinates if none were recorded yet, decorating plain
    /// string messages the way `die` does. Errors that already carry a
    /// location pass through unchanged, so the innermost raise site wins.
    #[must_use]
    pub fn ensure_located(mut self, location: DieLocation) -> Self {
        if self.location.is_some() {
            return self;
        }
        if let Scalar::Str(s) = &self.value {
            if !s.ends_with('\n') {
                let decorated = format!("{s} at {} line {}.\n", location.source, location.line);
                self.value = Scalar::str(decorated);
            }
        }
        self.location = Some(location);
        self
    }

    /// Computes the error-variable contents after a catch.
    #[must_use]
    pub fn catch_value(&self) -> Scalar {
        self.value.clone()
    }

    /// The thrown value.
    #[must_use]
    pub fn value(&self) -> &Scalar {
        &self.value
    }

    /// The raise coordinates, if attached.
    #[must_use]
    pub fn location(&self) -> Option<&DieLocation> {
        self.location.as_ref()
    }

    /// The message as text, for host display and tests.
    #[must_use]
    pub fn message(&self) -> String {
        self.value.to_text()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.message();
        f.write_str(text.trim_end_matches('\n'))?;
        // String messages already carry their coordinates; other thrown
        // values get them appended for the host.
        if !matches!(self.value, Scalar::Str(_)) {
            if let Some(loc) = &self.location {
                write!(f, " {loc}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scalar::cell;

    fn loc() -> DieLocation {
        DieLocation {
            sub_name: Rc::from("main::f"),
            source: Rc::from("test.pl"),
            line: 3,
            pc: None,
        }
    }

    #[test]
    fn test_die_appends_location_without_newline() {
        let err = RunError::die(&[cell(Scalar::str("boom"))], loc());
        assert_eq!(err.message(), "boom at test.pl line 3.\n");
    }

    #[test]
    fn test_die_keeps_trailing_newline_message() {
        let err = RunError::die(&[cell(Scalar::str("boom\n"))], loc());
        assert_eq!(err.message(), "boom\n");
    }

    #[test]
    fn test_die_empty_message() {
        let err = RunError::die(&[], loc());
        assert!(err.message().starts_with("Died at "));
    }

    #[test]
    fn test_ensure_located_is_idempotent() {
        let err = RunError::msg("oops").ensure_located(loc());
        let message = err.message();
        let again = err.ensure_located(DieLocation {
            line: 99,
            ..loc()
        });
        assert_eq!(again.message(), message);
    }
}
