//! Runtime control-flow markers.
//!
//! Loop controls (`last`/`next`/`redo`), `goto` and tail calls are not
//! exceptions: they travel as a distinguished value kind returned in place
//! of a normal result. Call sites recognize markers polymorphically and
//! either consume them (the compiler emits explicit handling around loops)
//! or re-return them so an enclosing frame can.

use std::rc::Rc;

use crate::code::CodeValue;
use crate::runtime::array::ArrayRef;

/// The kind of non-local transfer a marker requests.
///
/// The numeric values are exposed to bytecode through
/// `GET_CONTROL_FLOW_TYPE`, so they are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr, serde::Serialize, serde::Deserialize)]
#[repr(u16)]
pub enum ControlKind {
    /// Exit the targeted loop.
    Last = 0,
    /// Start the targeted loop's next iteration.
    Next = 1,
    /// Restart the current iteration without re-evaluating the condition.
    Redo = 2,
    /// Transfer to a label or another subroutine (`goto &sub`).
    Goto = 3,
    /// Replace the current call with a call to another subroutine.
    TailCall = 4,
}

/// A non-local control-flow marker.
///
/// Returned in place of a value list; immutable once created.
#[derive(Debug)]
pub struct ControlFlow {
    /// What transfer is requested.
    pub kind: ControlKind,
    /// Loop label or goto label, if the construct was labelled.
    pub label: Option<Rc<str>>,
    /// Target subroutine for `goto &sub` and tail calls.
    pub target: Option<CodeValue>,
    /// Arguments for the target; `None` reuses the current frame's.
    pub args: Option<ArrayRef>,
    /// Source line the marker was created on, for diagnostics.
    pub line: u32,
}

impl ControlFlow {
    /// Creates a loop-control marker (`last`/`next`/`redo`).
    #[must_use]
    pub fn loop_control(kind: ControlKind, label: Option<Rc<str>>, line: u32) -> Rc<Self> {
        Rc::new(Self {
            kind,
            label,
            target: None,
            args: None,
            line,
        })
    }

    /// Creates a `goto &sub` / tail-call marker.
    #[must_use]
    pub fn transfer(kind: ControlKind, target: CodeValue, args: Option<ArrayRef>, line: u32) -> Rc<Self> {
        Rc::new(Self {
            kind,
            label: None,
            target: Some(target),
            args,
            line,
        })
    }

    /// True if this marker targets the given loop: it is unlabelled, or its
    /// label matches the loop's.
    #[must_use]
    pub fn targets_label(&self, loop_label: Option<&str>) -> bool {
        match (&self.label, loop_label) {
            (None, _) => true,
            (Some(l), Some(name)) => &**l == name,
            (Some(_), None) => false,
        }
    }

    /// The keyword a user would have written, for error messages.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self.kind {
            ControlKind::Last => "last",
            ControlKind::Next => "next",
            ControlKind::Redo => "redo",
            ControlKind::Goto | ControlKind::TailCall => "goto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_repr_round_trip() {
        for kind in [
            ControlKind::Last,
            ControlKind::Next,
            ControlKind::Redo,
            ControlKind::Goto,
            ControlKind::TailCall,
        ] {
            assert_eq!(ControlKind::from_repr(kind as u16), Some(kind));
        }
    }

    #[test]
    fn test_label_targeting() {
        let unlabelled = ControlFlow::loop_control(ControlKind::Last, None, 1);
        assert!(unlabelled.targets_label(Some("OUTER")));
        assert!(unlabelled.targets_label(None));

        let labelled = ControlFlow::loop_control(ControlKind::Next, Some(Rc::from("OUTER")), 1);
        assert!(labelled.targets_label(Some("OUTER")));
        assert!(!labelled.targets_label(Some("INNER")));
        assert!(!labelled.targets_label(None));
    }
}
