//! Builder for emitting code units during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into the 16-bit unit stream,
//! manages forward jumps that need patching, interns strings and constants
//! into the pools, and tracks source lines for error coordinates.

use std::rc::Rc;

use ahash::AHashMap;

use super::code::{CodeBody, Const, LineEntry};
use super::op::Opcode;

/// Builder for one code object's unit stream and pools.
///
/// # Usage
///
/// ```ignore
/// let mut b = CodeBuilder::new();
/// b.set_line(3);
/// b.emit2(Opcode::LoadUndef, rd);
/// let jump = b.emit_jump(Opcode::Goto);
/// // ... emit more code ...
/// b.patch_jump(jump);
/// let body = b.build(register_count, 0, source, 1, package, name);
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    /// The unit stream being built.
    units: Vec<u16>,

    /// Constants collected during compilation. Not deduplicated.
    consts: Vec<Const>,

    /// String pool. Deduplicated so index equality is string equality.
    strings: Vec<Rc<str>>,

    /// Reverse map for string-pool deduplication.
    string_map: AHashMap<Rc<str>, u16>,

    /// Offset → line entries, pushed when the line changes.
    lines: Vec<LineEntry>,

    /// Source line for subsequently emitted instructions.
    current_line: u32,

    /// Last line recorded into the table, to avoid duplicate entries.
    recorded_line: Option<u32>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// The line most recently set, for nodes that reuse their parent's.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.current_line
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.record_line();
        self.units.push(op as u16);
    }

    /// Emits an instruction with one operand unit.
    pub fn emit1(&mut self, op: Opcode, a: u16) {
        self.emit(op);
        self.units.push(a);
    }

    /// Emits an instruction with two operand units.
    pub fn emit2(&mut self, op: Opcode, a: u16, b: u16) {
        self.emit(op);
        self.units.extend([a, b]);
    }

    /// Emits an instruction with three operand units.
    pub fn emit3(&mut self, op: Opcode, a: u16, b: u16, c: u16) {
        self.emit(op);
        self.units.extend([a, b, c]);
    }

    /// Emits an instruction with four operand units.
    pub fn emit4(&mut self, op: Opcode, a: u16, b: u16, c: u16, d: u16) {
        self.emit(op);
        self.units.extend([a, b, c, d]);
    }

    /// Emits an instruction with five operand units.
    pub fn emit5(&mut self, op: Opcode, a: u16, b: u16, c: u16, d: u16, e: u16) {
        self.emit(op);
        self.units.extend([a, b, c, d, e]);
    }

    /// Appends a raw operand unit to the instruction being emitted.
    /// Used for register lists.
    pub fn push_unit(&mut self, unit: u16) {
        self.units.push(unit);
    }

    /// Appends a 32-bit immediate, big-endian (high unit first).
    pub fn push_imm32(&mut self, value: i32) {
        let bits = value as u32;
        self.units.push((bits >> 16) as u16);
        self.units.push((bits & 0xffff) as u16);
    }

    /// Emits a forward jump, returning a label to patch once the target is
    /// known. The target operand is a placeholder until patched.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.emit(op);
        let label = JumpLabel(self.units.len());
        self.units.push(u16::MAX);
        label
    }

    /// Emits a conditional forward jump on a register.
    #[must_use]
    pub fn emit_branch(&mut self, op: Opcode, reg: u16) -> JumpLabel {
        self.emit1(op, reg);
        let label = JumpLabel(self.units.len());
        self.units.push(u16::MAX);
        label
    }

    /// Patches a forward jump to the current offset. Targets are absolute
    /// instruction-stream offsets.
    ///
    /// # Panics
    ///
    /// Panics if the stream outgrew the 16-bit offset space, which is a
    /// compile-time limit violation rather than silent truncation.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = u16::try_from(self.units.len()).expect("instruction stream exceeds u16 offsets; sub too large");
        self.units[label.0] = target;
    }

    /// Emits a jump to an already-known absolute target (backward jumps).
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        let target = u16::try_from(target).expect("instruction stream exceeds u16 offsets; sub too large");
        self.emit1(op, target);
    }

    /// Emits a conditional jump on a register to a known absolute target.
    pub fn emit_branch_to(&mut self, op: Opcode, reg: u16, target: usize) {
        let target = u16::try_from(target).expect("instruction stream exceeds u16 offsets; sub too large");
        self.emit2(op, reg, target);
    }

    /// Emits `FOREACH_NEXT_OR_EXIT` with a placeholder exit target.
    #[must_use]
    pub fn emit_foreach_next(&mut self, rvar: u16, rit: u16) -> JumpLabel {
        self.emit2(Opcode::ForeachNextOrExit, rvar, rit);
        let label = JumpLabel(self.units.len());
        self.units.push(u16::MAX);
        label
    }

    /// Emits the `SLOW_OP` prefix and sub-id; the caller pushes the
    /// sub-op's operand units.
    pub fn emit_slow(&mut self, sub: super::op::SlowOp) {
        self.emit1(Opcode::SlowOp, sub as u16);
    }

    /// Emits `EVAL_TRY` with a placeholder relative offset.
    #[must_use]
    pub fn emit_eval_try(&mut self) -> JumpLabel {
        self.emit(Opcode::EvalTry);
        let label = JumpLabel(self.units.len());
        self.units.push(0);
        label
    }

    /// Patches an `EVAL_TRY` to point at the current offset (the matching
    /// `EVAL_CATCH`). The operand is signed and relative to the
    /// instruction after the operand.
    ///
    /// # Panics
    ///
    /// Panics if the catch lies outside the i16 relative range.
    pub fn patch_eval_try(&mut self, label: JumpLabel) {
        let raw = self.units.len() as i64 - (label.0 as i64 + 1);
        let rel = i16::try_from(raw).expect("eval body exceeds i16 relative range; block too large");
        self.units[label.0] = rel as u16;
    }

    /// The current instruction offset. Use to record loop starts for
    /// backward jumps.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.units.len()
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// # Panics
    ///
    /// Panics past 65535 entries (too many constants in one sub).
    #[must_use]
    pub fn add_const(&mut self, value: Const) -> u16 {
        let idx = u16::try_from(self.consts.len()).expect("constant pool exceeds u16 range; too many constants");
        self.consts.push(value);
        idx
    }

    /// Interns a string into the pool, returning its index. Repeated
    /// interning of equal strings returns the same index.
    ///
    /// # Panics
    ///
    /// Panics past 65535 distinct strings.
    #[must_use]
    pub fn intern_string(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.string_map.get(s) {
            return idx;
        }
        let idx = u16::try_from(self.strings.len()).expect("string pool exceeds u16 range; too many strings");
        let shared: Rc<str> = Rc::from(s);
        self.strings.push(Rc::clone(&shared));
        self.string_map.insert(shared, idx);
        idx
    }

    /// Builds the final body, consuming the builder.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn build(
        self,
        register_count: u16,
        capture_count: u16,
        source: Rc<str>,
        start_line: u32,
        package: Rc<str>,
        sub_name: Rc<str>,
    ) -> CodeBody {
        CodeBody::new(
            self.units,
            self.consts,
            self.strings,
            register_count,
            capture_count,
            source,
            start_line,
            self.lines,
            package,
            sub_name,
        )
    }

    /// Records a line entry at the current offset when the line changed.
    fn record_line(&mut self) {
        if self.recorded_line != Some(self.current_line) {
            self.lines.push(LineEntry {
                offset: self.units.len() as u32,
                line: self.current_line,
            });
            self.recorded_line = Some(self.current_line);
        }
    }
}

/// Label for a forward jump awaiting its target, holding the offset of the
/// target operand unit.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_basic() {
        let mut b = CodeBuilder::new();
        b.emit(Opcode::Nop);
        b.emit1(Opcode::Return, 3);
        assert_eq!(
            b.units,
            vec![Opcode::Nop as u16, Opcode::Return as u16, 3]
        );
    }

    #[test]
    fn test_imm32_is_big_endian() {
        let mut b = CodeBuilder::new();
        b.emit1(Opcode::LoadInt, 3);
        b.push_imm32(0x0001_0002);
        assert_eq!(b.units, vec![Opcode::LoadInt as u16, 3, 0x0001, 0x0002]);

        let mut b = CodeBuilder::new();
        b.emit1(Opcode::LoadInt, 3);
        b.push_imm32(-1);
        assert_eq!(&b.units[2..], &[0xffff, 0xffff]);
    }

    #[test]
    fn test_forward_jump_patches_absolute() {
        let mut b = CodeBuilder::new();
        let jump = b.emit_jump(Opcode::Goto);
        b.emit(Opcode::Nop);
        b.patch_jump(jump);
        b.emit1(Opcode::Return, 3);
        // GOTO at 0, operand at 1, NOP at 2, target = 3.
        assert_eq!(b.units[1], 3);
    }

    #[test]
    fn test_branch_to_known_target() {
        let mut b = CodeBuilder::new();
        let start = b.current_offset();
        b.emit(Opcode::Nop);
        b.emit_branch_to(Opcode::GotoIfTrue, 4, start);
        assert_eq!(b.units, vec![Opcode::Nop as u16, Opcode::GotoIfTrue as u16, 4, 0]);
    }

    #[test]
    fn test_eval_try_relative_patch() {
        let mut b = CodeBuilder::new();
        let label = b.emit_eval_try();
        b.emit(Opcode::Nop);
        b.emit(Opcode::EvalEnd);
        b.patch_eval_try(label);
        // Operand at offset 1; next instruction at 2; catch at 4 → rel 2.
        assert_eq!(b.units[1], 2);
    }

    #[test]
    fn test_string_interning_dedups() {
        let mut b = CodeBuilder::new();
        let a = b.intern_string("x");
        let bb = b.intern_string("y");
        let c = b.intern_string("x");
        assert_eq!(a, c);
        assert_ne!(a, bb);
        assert_eq!(b.strings.len(), 2);
    }

    #[test]
    fn test_line_table_dedups_consecutive() {
        let mut b = CodeBuilder::new();
        b.set_line(1);
        b.emit(Opcode::Nop);
        b.emit(Opcode::Nop);
        b.set_line(2);
        b.emit(Opcode::Nop);
        assert_eq!(
            b.lines,
            vec![LineEntry { offset: 0, line: 1 }, LineEntry { offset: 2, line: 2 }]
        );
    }
}
