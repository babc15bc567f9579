//! Code objects: the immutable artifact the compiler produces.
//!
//! A [`Code`] is a thin instance over a shared [`CodeBody`]: the body owns
//! the instruction stream, pools and metadata; the instance owns the
//! captured-variable vector and the set-once global-name binding. Closures
//! minted from one template therefore share streams and pools by reference
//! and differ only in their captured vectors.

use std::cell::OnceCell;
use std::rc::Rc;

use crate::runtime::value::Value;

/// A constant-pool entry.
///
/// Strings share their `Rc`; code entries are closure templates referenced
/// by `CREATE_CLOSURE` (and plain anonymous subs via `LOAD_CONST`).
#[derive(Debug, Clone)]
pub enum Const {
    Undef,
    Int(i64),
    Num(f64),
    Str(Rc<str>),
    Code(Rc<Code>),
}

/// Maps an instruction offset to the source line in effect from there on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineEntry {
    /// First instruction offset this entry applies to.
    pub offset: u32,
    /// Source line number.
    pub line: u32,
}

/// The shared, immutable innards of a code object.
#[derive(Debug)]
pub struct CodeBody {
    /// The instruction stream: 16-bit code units, no padding.
    units: Vec<u16>,
    /// Constant pool referenced by `LOAD_CONST` / `CREATE_CLOSURE`.
    consts: Vec<Const>,
    /// Deduplicated string pool: names, literals, labels. Index equality
    /// is string equality.
    strings: Vec<Rc<str>>,
    /// High-water mark of register allocation, including the reserved
    /// slots 0-2 and any capture slots.
    register_count: u16,
    /// Number of capture slots (registers 3..3+capture_count).
    capture_count: u16,
    /// Source (file) name for diagnostics.
    source: Rc<str>,
    /// Line the unit started on.
    start_line: u32,
    /// Offset → source-line table, ordered by offset.
    lines: Vec<LineEntry>,
    /// Package the sub was compiled in.
    package: Rc<str>,
    /// Sub name for stack traces; `__ANON__` until bound.
    sub_name: Rc<str>,
}

impl CodeBody {
    /// Assembles a body. Called by `CodeBuilder::build`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub(crate) fn new(
        units: Vec<u16>,
        consts: Vec<Const>,
        strings: Vec<Rc<str>>,
        register_count: u16,
        capture_count: u16,
        source: Rc<str>,
        start_line: u32,
        lines: Vec<LineEntry>,
        package: Rc<str>,
        sub_name: Rc<str>,
    ) -> Self {
        Self {
            units,
            consts,
            strings,
            register_count,
            capture_count,
            source,
            start_line,
            lines,
            package,
            sub_name,
        }
    }
}

/// An invokable code object (one closure instance, named sub, or unit).
#[derive(Debug)]
pub struct Code {
    body: Rc<CodeBody>,
    /// Captured values for a closure instance; empty for templates and
    /// plain subs.
    captured: Vec<Value>,
    /// Qualified global name, set once when installed into the symbol
    /// table.
    bound_name: OnceCell<Rc<str>>,
}

impl Code {
    /// Wraps a freshly-built body into a template/plain code object.
    #[must_use]
    pub fn new(body: CodeBody) -> Rc<Self> {
        Rc::new(Self {
            body: Rc::new(body),
            captured: Vec::new(),
            bound_name: OnceCell::new(),
        })
    }

    /// Mints a closure instance from a template: shares the body, owns the
    /// captured vector.
    #[must_use]
    pub fn bind_captures(template: &Rc<Code>, captured: Vec<Value>) -> Rc<Self> {
        Rc::new(Self {
            body: Rc::clone(&template.body),
            captured,
            bound_name: OnceCell::new(),
        })
    }

    /// True if both instances were minted from the same template (share
    /// streams and pools by reference).
    #[must_use]
    pub fn shares_template(&self, other: &Code) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }

    #[inline]
    #[must_use]
    pub fn units(&self) -> &[u16] {
        &self.body.units
    }

    #[must_use]
    pub fn const_at(&self, index: u16) -> Option<&Const> {
        self.body.consts.get(index as usize)
    }

    #[must_use]
    pub fn string_at(&self, index: u16) -> Option<&Rc<str>> {
        self.body.strings.get(index as usize)
    }

    #[inline]
    #[must_use]
    pub fn register_count(&self) -> u16 {
        self.body.register_count
    }

    #[inline]
    #[must_use]
    pub fn capture_count(&self) -> u16 {
        self.body.capture_count
    }

    #[must_use]
    pub fn captured(&self) -> &[Value] {
        &self.captured
    }

    #[must_use]
    pub fn source(&self) -> Rc<str> {
        Rc::clone(&self.body.source)
    }

    #[must_use]
    pub fn start_line(&self) -> u32 {
        self.body.start_line
    }

    #[must_use]
    pub fn package(&self) -> Rc<str> {
        Rc::clone(&self.body.package)
    }

    /// The source line in effect at an instruction offset: the last line
    /// entry at or before it.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let offset = offset as u32;
        self.body
            .lines
            .iter()
            .rev()
            .find(|entry| entry.offset <= offset)
            .map_or(self.body.start_line, |entry| entry.line)
    }

    /// Binds the global name this code was installed under. First caller
    /// wins; later installs under aliases keep the original trace name.
    pub fn bind_name(&self, qualified: &str) {
        let _ = self.bound_name.set(Rc::from(qualified));
    }

    /// The qualified name for stack traces: the bound name if installed,
    /// otherwise `package::sub_name`.
    #[must_use]
    pub fn qualified_name(&self) -> Rc<str> {
        if let Some(bound) = self.bound_name.get() {
            return Rc::clone(bound);
        }
        Rc::from(format!("{}::{}", self.body.package, self.body.sub_name))
    }
}

impl Const {
    /// Materializes the constant as a runtime value in a fresh cell.
    ///
    /// Fresh per load so bytecode like `LOAD_CONST; INC_REG` cannot mutate
    /// the pool.
    #[must_use]
    pub fn to_value(&self) -> Value {
        use crate::code::CodeValue;
        use crate::runtime::scalar::Scalar;
        match self {
            Const::Undef => Value::undef(),
            Const::Int(i) => Value::scalar(Scalar::Int(*i)),
            Const::Num(n) => Value::scalar(Scalar::Num(*n)),
            Const::Str(s) => Value::scalar(Scalar::Str(Rc::clone(s))),
            Const::Code(c) => Value::Code(CodeValue::Interpreted(Rc::clone(c))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_body() -> CodeBody {
        CodeBody::new(
            vec![crate::bytecode::op::Opcode::Nop as u16],
            vec![],
            vec![],
            3,
            0,
            Rc::from("test.pl"),
            1,
            vec![LineEntry { offset: 0, line: 4 }],
            Rc::from("main"),
            Rc::from("__ANON__"),
        )
    }

    #[test]
    fn test_template_sharing() {
        let template = Code::new(tiny_body());
        let a = Code::bind_captures(&template, vec![Value::int(1)]);
        let b = Code::bind_captures(&template, vec![Value::int(2)]);
        assert!(a.shares_template(&b));
        assert!(a.shares_template(&template));
        assert_eq!(a.captured().len(), 1);
    }

    #[test]
    fn test_line_lookup() {
        let code = Code::new(tiny_body());
        assert_eq!(code.line_for_offset(0), 4);
        assert_eq!(code.line_for_offset(100), 4);
    }

    #[test]
    fn test_bound_name_is_set_once() {
        let code = Code::new(tiny_body());
        assert_eq!(&*code.qualified_name(), "main::__ANON__");
        code.bind_name("main::first");
        code.bind_name("main::alias");
        assert_eq!(&*code.qualified_name(), "main::first");
    }
}
