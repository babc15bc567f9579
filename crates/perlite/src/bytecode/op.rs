//! Opcode definitions for the register machine.
//!
//! Bytecode is a stream of 16-bit code units. Each instruction is one
//! opcode unit followed by its fixed operand layout; there is no alignment
//! padding. Opcodes are numbered densely within functional groups (each
//! group head carries an explicit discriminant, the rest follow
//! sequentially) so the dispatch `match` lowers to a jump table.
//!
//! # Operand encoding
//!
//! - `Reg` — one unit, a register index
//! - `ConstIdx` / `StrIdx` — one unit, a constant/string pool index
//! - `Imm32` — two units, a 32-bit immediate, big-endian (high unit first)
//! - `Target` — one unit, an absolute instruction-stream offset
//! - `RelTarget` — one unit, a signed 16-bit offset relative to the next
//!   instruction (only `EVAL_TRY` uses this)
//! - `Ctx` — one unit, a calling-context tag
//! - `UImm` — one unit, an unsigned literal
//! - `RegList` — one count unit followed by that many register units
//! - `SlowId` — one unit selecting a [`SlowOp`], whose own operands follow
//!
//! Rarely-executed operations go through the secondary [`SlowOp`] table to
//! keep the dispatch loop's instruction-cache footprint small.

/// Operand shapes, used by the disassembler and the encoding tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg,
    ConstIdx,
    StrIdx,
    Imm32,
    Target,
    RelTarget,
    Ctx,
    UImm,
    BuiltinId,
    RegList,
    SlowId,
}

use OperandKind as K;

/// The instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum Opcode {
    // === Control flow ===
    /// No operation.
    Nop = 0,
    /// Return the value in a register from the current invocation. Operand: reg.
    Return,
    /// Unconditional jump. Operand: absolute target.
    Goto,
    /// Jump if a register is falsy. Operands: reg, target.
    GotoIfFalse,
    /// Jump if a register is truthy. Operands: reg, target.
    GotoIfTrue,

    // === Register ops ===
    /// Copy a register slot (the handle, not the value). Operands: rd, rs.
    Move = 5,
    /// Load a constant-pool entry into a fresh cell. Operands: rd, const idx.
    LoadConst,
    /// Load a 32-bit integer immediate into a fresh mutable cell.
    /// Operands: rd, imm32. Always allocates so in-place mutation is safe.
    LoadInt,
    /// Load a string-pool entry. Operands: rd, string idx.
    LoadString,
    /// Load a fresh undef cell. Operand: rd.
    LoadUndef,

    // === Global access ===
    /// Load the live cell of a global scalar. Operands: rd, name idx.
    LoadGlobal = 10,
    /// Store into a global scalar, in place. Operands: name idx, rs.
    StoreGlobal,
    /// Load the live handle of a global array. Operands: rd, name idx.
    LoadGlobalArray,
    /// Replace a global array's contents from a list. Operands: name idx, rs.
    StoreGlobalArray,
    /// Load the live handle of a global hash. Operands: rd, name idx.
    LoadGlobalHash,
    /// Replace a global hash's contents from a flat list. Operands: name idx, rs.
    StoreGlobalHash,
    /// Load a global code object; dies if the sub is undefined.
    /// Operands: rd, name idx.
    LoadGlobalCode,

    // === Arithmetic ===
    /// rd = ra + rb.
    Add = 17,
    /// rd = ra - rb.
    Sub,
    /// rd = ra * rb.
    Mul,
    /// rd = ra / rb.
    Div,
    /// rd = ra % rb.
    Mod,
    /// rd = ra ** rb.
    Pow,
    /// rd = -ra. Operands: rd, ra.
    Neg,
    /// rd = ra + imm32 (fast path). Operands: rd, ra, imm32.
    AddInt,
    /// rd = ra - imm32. Operands: rd, ra, imm32.
    SubInt,
    /// rd = ra * imm32. Operands: rd, ra, imm32.
    MulInt,

    // === String ===
    /// rd = ra . rb.
    Concat = 27,
    /// rd = ra x rb (string repetition; list repetition when ra is a list).
    Repeat,
    /// rd = substr(rs, roff, rlen); an undef rlen register means "to end".
    /// Operands: rd, rs, roff, rlen.
    Substr,
    /// rd = length(ra). Operands: rd, ra.
    Length,
    /// rd = join(rsep, rlist). Operands: rd, rsep, rlist.
    Join,

    // === Compare ===
    /// rd = (ra == rb), numeric.
    NumEq = 32,
    NumNe,
    NumLt,
    NumGt,
    NumLe,
    NumGe,
    /// rd = ra <=> rb (-1/0/1).
    NumCmp,
    /// rd = (ra eq rb), string.
    StrEq,
    StrNe,
    StrLt,
    StrGt,
    StrLe,
    StrGe,
    /// rd = ra cmp rb (-1/0/1).
    StrCmp,

    // === Logical ===
    /// rd = !ra. Operands: rd, ra. (`&&`/`||`/`//` compile to branches.)
    Not = 46,

    // === Array ops ===
    /// rd = element cell at index (rvalue, no autovivification).
    /// Operands: rd, ra, ridx.
    ArrayGet = 47,
    /// Store through the element cell, extending as needed.
    /// Operands: ra, ridx, rv.
    ArraySet,
    /// rd = new length after appending the flattened values.
    /// Operands: rd, ra, rvals.
    ArrayPush,
    /// rd = popped element (undef when empty). Operands: rd, ra.
    ArrayPop,
    /// rd = shifted element (undef when empty). Operands: rd, ra.
    ArrayShift,
    /// rd = new length after prepending. Operands: rd, ra, rvals.
    ArrayUnshift,
    /// rd = element count. Operands: rd, ra.
    ArraySize,
    /// rd = a fresh empty array. Operand: rd.
    ArrayCreate,
    /// rd = list of element cells for the index list. Operands: rd, ra, ridxs.
    ArraySlice,
    /// Store a value list at an index list. Operands: ra, ridxs, rvals.
    ArraySliceSet,
    /// rd = removed elements; an undef rlen means "to the end", an undef
    /// rrepl means "no replacement". Operands: rd, ra, roff, rlen, rrepl.
    ArraySplice,
    /// rd = reversed list. Operands: rd, rlist.
    ArrayReverse,

    // === Hash ops ===
    /// rd = value cell for key (rvalue). Operands: rd, rh, rkey.
    HashGet = 59,
    /// Store through the entry cell. Operands: rh, rkey, rv.
    HashSet,
    /// rd = whether the key exists. Operands: rd, rh, rkey.
    HashExists,
    /// rd = deleted value (undef when absent). Operands: rd, rh, rkey.
    HashDelete,
    /// rd = key list in insertion order. Operands: rd, rh.
    HashKeys,
    /// rd = value list in insertion order. Operands: rd, rh.
    HashValues,
    /// rd = a fresh empty hash. Operand: rd.
    HashCreate,
    /// rd = value list for a key list. Operands: rd, rh, rkeys.
    HashSlice,
    /// Store a value list at a key list. Operands: rh, rkeys, rvals.
    HashSliceSet,
    /// rd = deleted values for a key list. Operands: rd, rh, rkeys.
    HashSliceDelete,

    // === Calls ===
    /// rd = call the code object in rf with the list in rargs.
    /// Operands: rd, rf, rargs, ctx.
    CallSub = 69,
    /// rd = method call: resolve rmeth on rinv's package (via @ISA), then
    /// call with rargs (invocant already prepended by the compiler).
    /// Operands: rd, rinv, rmeth, rargs, ctx.
    CallMethod,
    /// rd = call an operator-library builtin. Operands: rd, builtin id,
    /// rargs, ctx.
    CallBuiltin,

    // === Control-flow markers ===
    /// rd = a `last` marker. Operands: rd, label idx ("" = unlabelled).
    CreateLast = 72,
    /// rd = a `next` marker. Operands: rd, label idx.
    CreateNext,
    /// rd = a `redo` marker. Operands: rd, label idx.
    CreateRedo,
    /// rd = a `goto` marker: either a label transfer or `goto &sub` with
    /// the target code in rtarget (undef register for label form).
    /// Operands: rd, rtarget, label idx.
    CreateGoto,
    /// rd = whether rs holds a control-flow marker. Operands: rd, rs.
    IsControlFlow,
    /// rd = the marker's numeric kind (undef for non-markers).
    /// Operands: rd, rs.
    GetControlFlowType,

    // === References ===
    /// rd = a reference to rs (scalar cell, array, hash or code).
    /// Operands: rd, rs.
    CreateRef = 78,
    /// rd = the scalar cell behind a SCALAR reference (aliasing).
    /// Operands: rd, rs.
    Deref,
    /// rd = the array behind an ARRAY reference, autovivifying through
    /// undef cells. Operands: rd, rs.
    DerefArray,
    /// rd = the hash behind a HASH reference, autovivifying.
    /// Operands: rd, rs.
    DerefHash,
    /// rd = the internal kind name of rs. Operands: rd, rs.
    GetType,

    // === I/O ===
    /// rd = print the list to a handle (undef rfh = selected handle).
    /// Operands: rd, rfh, rargs.
    Print = 83,
    /// Like PRINT with a trailing newline. Operands: rd, rfh, rargs.
    Say,
    /// rd = previously selected handle; selects rfh unless undef.
    /// Operands: rd, rfh.
    Select,
    /// rd = success flag; stores the opened handle into the scalar cell in
    /// rfhvar. Operands: rd, rfhvar, rmode, rpath.
    Open,
    /// rd = one line (scalar context) or all remaining lines (list).
    /// Operands: rd, rfh, ctx.
    Readline,

    // === Misc ===
    /// Raise the list in rargs as an exception. Operand: rargs.
    Die = 88,
    /// rd = 1 after writing the warning to the warning handler.
    /// Operands: rd, rargs.
    Warn,
    /// rd = require the module or version in rs. Operands: rd, rs.
    Require,
    /// rd = inclusive integer range list. Operands: rd, rlo, rhi.
    Range,
    /// rd = uniform random number in [0, ra) (ra undef = 1).
    /// Operands: rd, ra.
    Rand,
    /// rd = map the code in rf over rlist. Operands: rd, rf, rlist.
    Map,
    /// rd = elements of rlist where rf returns true. Operands: rd, rf, rlist.
    Grep,
    /// rd = rlist sorted by the comparator in rf (undef rf = string sort).
    /// Operands: rd, rf, rlist.
    Sort,
    /// rd = definedness of rs. Operands: rd, rs.
    Defined,
    /// rd = ref(rs): "" for non-references, else kind or blessed package.
    /// Operands: rd, rs.
    Ref,
    /// rd = the reference in rs after blessing its container into the
    /// package named in rpkg. Operands: rd, rs, rpkg.
    Bless,
    /// rd = whether rs isa the package in rpkg (via @ISA).
    /// Operands: rd, rs, rpkg.
    Isa,

    // === Superinstructions ===
    /// ++ in place through the cell. Operand: reg.
    IncReg = 100,
    /// -- in place. Operand: reg.
    DecReg,
    /// rd += rs in place. Operands: rd, rs.
    AddAssign,
    /// rd += imm32 in place. Operands: rd, imm32.
    AddAssignInt,
    /// rd = fresh cell with rs's value after incrementing rs.
    /// Operands: rd, rs.
    PreInc,
    /// rd = fresh cell with rs's value before incrementing rs.
    /// Operands: rd, rs.
    PostInc,
    /// Pre-decrement. Operands: rd, rs.
    PreDec,
    /// Post-decrement. Operands: rd, rs.
    PostDec,
    /// rd .= rs in place. Operands: rd, rs.
    ConcatAssign,
    /// rd -= rs. Operands: rd, rs.
    SubAssign,
    /// rd *= rs. Operands: rd, rs.
    MulAssign,
    /// rd /= rs. Operands: rd, rs.
    DivAssign,
    /// rd %= rs. Operands: rd, rs.
    ModAssign,
    /// rd &= rs. Operands: rd, rs.
    BitAndAssign,
    /// rd |= rs. Operands: rd, rs.
    BitOrAssign,
    /// rd ^= rs. Operands: rd, rs.
    BitXorAssign,

    // === Eval ===
    /// Push an exception handler. Operand: signed 16-bit offset, relative
    /// to the next instruction, of the matching EVAL_CATCH.
    EvalTry = 116,
    /// Exception landing site: stores undef into the eval's result
    /// register. Reached only via the interpreter's exception path.
    /// Operand: rd.
    EvalCatch,
    /// Pop the handler pushed by the matching EVAL_TRY and clear the error
    /// variable.
    EvalEnd,

    // === List / iterator ===
    /// rd = a fresh list flattening the operand registers.
    /// Operands: rd, count, regs...
    CreateList = 119,
    /// rd = the last element of a list (comma-operator semantics).
    /// Operands: rd, rs.
    ListToScalar,
    /// rd = rs as a one-element list (identity for lists).
    /// Operands: rd, rs.
    ScalarToList,
    /// rd = a fresh iterator over the flattened rs. Operands: rd, rs.
    IterCreate,
    /// rd = whether the iterator has more elements. Operands: rd, rit.
    IterHasNext,
    /// rd = the next element cell, undef when exhausted. Operands: rd, rit.
    IterNext,
    /// Bind the next element cell into rvar (aliasing) or jump to the exit
    /// target when exhausted. Operands: rvar, rit, target.
    ForeachNextOrExit,

    // === Closures ===
    /// rd = a closure instance minted from a template: shares the
    /// template's streams and pools, owns a fresh captured vector built
    /// from the operand registers. Operands: rd, template const idx,
    /// count, regs...
    CreateClosure = 126,
    /// Install the code object in rs under a global name.
    /// Operands: name idx, rs.
    StoreGlobalCode,
    /// Write rs's scalar value through rd's cell (in-place assignment,
    /// preserving cell identity for captures and aliases).
    /// Operands: rd, rs.
    SetScalar,

    // === Slow dispatch ===
    /// Secondary dispatch. Operands: sub-id, then the sub-op's operands.
    SlowOp = 129,
}

impl Opcode {
    /// Decodes a code unit. `None` means corrupted bytecode.
    #[inline]
    #[must_use]
    pub fn from_unit(unit: u16) -> Option<Self> {
        Self::from_repr(unit)
    }

    /// The mnemonic used in disassembly.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The operand layout for this opcode.
    #[must_use]
    pub fn operands(self) -> &'static [OperandKind] {
        match self {
            Opcode::Nop | Opcode::EvalEnd => &[],
            Opcode::Return | Opcode::LoadUndef | Opcode::ArrayCreate | Opcode::HashCreate | Opcode::Die
            | Opcode::IncReg | Opcode::DecReg | Opcode::EvalCatch => &[K::Reg],
            Opcode::Goto => &[K::Target],
            Opcode::GotoIfFalse | Opcode::GotoIfTrue => &[K::Reg, K::Target],
            Opcode::EvalTry => &[K::RelTarget],

            Opcode::Move
            | Opcode::Neg
            | Opcode::Length
            | Opcode::Not
            | Opcode::ArrayPop
            | Opcode::ArrayShift
            | Opcode::ArraySize
            | Opcode::ArrayReverse
            | Opcode::HashKeys
            | Opcode::HashValues
            | Opcode::IsControlFlow
            | Opcode::GetControlFlowType
            | Opcode::CreateRef
            | Opcode::Deref
            | Opcode::DerefArray
            | Opcode::DerefHash
            | Opcode::GetType
            | Opcode::Select
            | Opcode::Warn
            | Opcode::Require
            | Opcode::Rand
            | Opcode::Defined
            | Opcode::Ref
            | Opcode::PreInc
            | Opcode::PostInc
            | Opcode::PreDec
            | Opcode::PostDec
            | Opcode::AddAssign
            | Opcode::ConcatAssign
            | Opcode::SubAssign
            | Opcode::MulAssign
            | Opcode::DivAssign
            | Opcode::ModAssign
            | Opcode::BitAndAssign
            | Opcode::BitOrAssign
            | Opcode::BitXorAssign
            | Opcode::ListToScalar
            | Opcode::ScalarToList
            | Opcode::IterCreate
            | Opcode::IterHasNext
            | Opcode::IterNext
            | Opcode::SetScalar => &[K::Reg, K::Reg],

            Opcode::LoadConst => &[K::Reg, K::ConstIdx],
            Opcode::LoadInt => &[K::Reg, K::Imm32],
            Opcode::LoadString => &[K::Reg, K::StrIdx],
            Opcode::LoadGlobal | Opcode::LoadGlobalArray | Opcode::LoadGlobalHash | Opcode::LoadGlobalCode => {
                &[K::Reg, K::StrIdx]
            }
            Opcode::StoreGlobal | Opcode::StoreGlobalArray | Opcode::StoreGlobalHash | Opcode::StoreGlobalCode => {
                &[K::StrIdx, K::Reg]
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Concat
            | Opcode::Repeat
            | Opcode::Join
            | Opcode::NumEq
            | Opcode::NumNe
            | Opcode::NumLt
            | Opcode::NumGt
            | Opcode::NumLe
            | Opcode::NumGe
            | Opcode::NumCmp
            | Opcode::StrEq
            | Opcode::StrNe
            | Opcode::StrLt
            | Opcode::StrGt
            | Opcode::StrLe
            | Opcode::StrGe
            | Opcode::StrCmp
            | Opcode::ArrayGet
            | Opcode::ArraySet
            | Opcode::ArrayPush
            | Opcode::ArrayUnshift
            | Opcode::ArraySlice
            | Opcode::ArraySliceSet
            | Opcode::HashGet
            | Opcode::HashSet
            | Opcode::HashExists
            | Opcode::HashDelete
            | Opcode::HashSlice
            | Opcode::HashSliceSet
            | Opcode::HashSliceDelete
            | Opcode::Print
            | Opcode::Say
            | Opcode::Range
            | Opcode::Map
            | Opcode::Grep
            | Opcode::Sort
            | Opcode::Bless
            | Opcode::Isa => &[K::Reg, K::Reg, K::Reg],

            Opcode::AddInt | Opcode::SubInt | Opcode::MulInt => &[K::Reg, K::Reg, K::Imm32],
            Opcode::AddAssignInt => &[K::Reg, K::Imm32],

            Opcode::Substr | Opcode::Open => &[K::Reg, K::Reg, K::Reg, K::Reg],
            Opcode::ArraySplice => &[K::Reg, K::Reg, K::Reg, K::Reg, K::Reg],

            Opcode::CallSub => &[K::Reg, K::Reg, K::Reg, K::Ctx],
            Opcode::CallMethod => &[K::Reg, K::Reg, K::Reg, K::Reg, K::Ctx],
            Opcode::CallBuiltin => &[K::Reg, K::BuiltinId, K::Reg, K::Ctx],
            Opcode::Readline => &[K::Reg, K::Reg, K::Ctx],

            Opcode::CreateLast | Opcode::CreateNext | Opcode::CreateRedo => &[K::Reg, K::StrIdx],
            Opcode::CreateGoto => &[K::Reg, K::Reg, K::StrIdx],

            Opcode::ForeachNextOrExit => &[K::Reg, K::Reg, K::Target],

            Opcode::CreateList => &[K::Reg, K::RegList],
            Opcode::CreateClosure => &[K::Reg, K::ConstIdx, K::RegList],

            Opcode::SlowOp => &[K::SlowId],
        }
    }
}

/// Sub-operations behind the `SLOW_OP` opcode.
///
/// Low-frequency primitives live here so the main loop stays small. The
/// table is append-only: promoting an entry to a top-level opcode retires
/// its id rather than renumbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum SlowOp {
    /// Dynamic eval of a code string through the host frontend.
    /// Operands: rd, rsrc, ctx.
    EvalString = 0,
    /// Retrieve a phase-captured scalar. Operands: rd, name idx, phase id.
    PhaseScalar,
    /// Retrieve a phase-captured array. Operands: rd, name idx, phase id.
    PhaseArray,
    /// Retrieve a phase-captured hash. Operands: rd, name idx, phase id.
    PhaseHash,
    /// Save a global scalar's value and set it to undef (`local`).
    /// Operand: name idx.
    LocalSave,
    /// Restore the most recent saves. Operand: count.
    LocalRestore,
    /// Replace an array's contents from a list. Operands: ra, rlist.
    ArrayAssign,
    /// Replace a hash's contents from a flat list. Operands: rh, rlist.
    HashAssign,
    /// rd = list of the iterator's remaining elements. Operands: rd, rit.
    IterRest,
    /// Process shims; unsupported hosts raise a catchable error and set
    /// the errno variable. Operand: rd.
    Fork,
    /// Operand: rd.
    Waitpid,
    /// Operand: rd.
    Getppid,
    /// Operand: rd.
    Getpriority,
    /// Operand: rd.
    Setpriority,
}

impl SlowOp {
    /// Decodes a sub-id unit.
    #[inline]
    #[must_use]
    pub fn from_unit(unit: u16) -> Option<Self> {
        Self::from_repr(unit)
    }

    /// The mnemonic used in disassembly.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The operand layout following the sub-id unit.
    #[must_use]
    pub fn operands(self) -> &'static [OperandKind] {
        match self {
            SlowOp::EvalString => &[K::Reg, K::Reg, K::Ctx],
            SlowOp::PhaseScalar | SlowOp::PhaseArray | SlowOp::PhaseHash => &[K::Reg, K::StrIdx, K::UImm],
            SlowOp::LocalSave => &[K::StrIdx],
            SlowOp::LocalRestore => &[K::UImm],
            SlowOp::ArrayAssign | SlowOp::HashAssign | SlowOp::IterRest => &[K::Reg, K::Reg],
            SlowOp::Fork | SlowOp::Waitpid | SlowOp::Getppid | SlowOp::Getpriority | SlowOp::Setpriority => &[K::Reg],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Groups must be dense: every unit between the first and last opcode
    /// decodes, so the dispatch match covers a gapless range.
    #[test]
    fn test_opcode_numbering_is_dense() {
        let last = Opcode::SlowOp as u16;
        for unit in 0..=last {
            assert!(Opcode::from_unit(unit).is_some(), "gap at opcode {unit}");
        }
        assert!(Opcode::from_unit(last + 1).is_none());
    }

    #[test]
    fn test_group_heads_are_stable() {
        assert_eq!(Opcode::Nop as u16, 0);
        assert_eq!(Opcode::Move as u16, 5);
        assert_eq!(Opcode::LoadGlobal as u16, 10);
        assert_eq!(Opcode::Add as u16, 17);
        assert_eq!(Opcode::Concat as u16, 27);
        assert_eq!(Opcode::NumEq as u16, 32);
        assert_eq!(Opcode::Not as u16, 46);
        assert_eq!(Opcode::ArrayGet as u16, 47);
        assert_eq!(Opcode::HashGet as u16, 59);
        assert_eq!(Opcode::CallSub as u16, 69);
        assert_eq!(Opcode::CreateLast as u16, 72);
        assert_eq!(Opcode::CreateRef as u16, 78);
        assert_eq!(Opcode::Print as u16, 83);
        assert_eq!(Opcode::Die as u16, 88);
        assert_eq!(Opcode::IncReg as u16, 100);
        assert_eq!(Opcode::EvalTry as u16, 116);
        assert_eq!(Opcode::CreateList as u16, 119);
        assert_eq!(Opcode::CreateClosure as u16, 126);
        assert_eq!(Opcode::SlowOp as u16, 129);
    }

    #[test]
    fn test_slow_op_numbering_is_dense() {
        let last = SlowOp::Setpriority as u16;
        for unit in 0..=last {
            assert!(SlowOp::from_unit(unit).is_some(), "gap at slow op {unit}");
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(Opcode::ForeachNextOrExit.name(), "FOREACH_NEXT_OR_EXIT");
        assert_eq!(SlowOp::EvalString.name(), "EVAL_STRING");
    }
}
