//! The register-machine dispatch loop.
//!
//! One invocation is one [`Frame`]: a program counter, a register file and
//! an eval-catch stack. A single `match` over the dense opcode space reads
//! operands inline and mutates registers; there is no operand stack, which
//! is what keeps registers valid across `goto` and loop-control jumps.
//!
//! Two things leave a frame early: host-level errors (routed to the
//! nearest handler on the eval-catch stack, or re-thrown with source
//! coordinates) and control-flow markers (returned in place of a value for
//! callers to consume). The [`Flow`] type keeps the two channels apart so
//! a marker can never be caught by `eval`.

mod call;
mod slow;

use std::rc::Rc;

use crate::bytecode::code::{Code, Const};
use crate::bytecode::op::Opcode;
use crate::code::CodeValue;
use crate::context::Context;
use crate::interp::Interp;
use crate::runtime::array::ArrayRef;
use crate::runtime::control::{ControlFlow, ControlKind};
use crate::runtime::error::{DieLocation, RunError};
use crate::runtime::hash::HashRef;
use crate::runtime::io::handle_ref;
use crate::runtime::iter::ListIter;
use crate::runtime::ops;
use crate::runtime::scalar::{cell, Scalar, ScalarCell};
use crate::runtime::value::Value;

/// Why an opcode wants out of the normal instruction flow.
pub(crate) enum Flow {
    /// A host-level error: goes to the eval-catch stack.
    Error(RunError),
    /// A control-flow marker observed where a value was expected: returned
    /// immediately, never caught by `eval`.
    Marker(Value),
}

impl From<RunError> for Flow {
    fn from(e: RunError) -> Self {
        Flow::Error(e)
    }
}

/// Outcome of one dispatched instruction.
enum Step {
    Continue,
    Return(Value),
}

/// Executes a code object with an argument list and context tag.
///
/// This is the interpreter half of the `apply` contract; the glue layer in
/// [`crate::code`] makes it indistinguishable from the native path.
pub(crate) fn run(interp: &mut Interp, code: &Rc<Code>, args: Value, ctx: Context) -> Result<Value, RunError> {
    interp.enter_call()?;
    let local_mark = interp.local_mark();
    let result = run_frame(interp, code, args, ctx);
    // Dynamic-scope saves unwind on every exit, including exceptional ones.
    interp.local_unwind_to(local_mark);
    interp.leave_call();
    result
}

fn run_frame(interp: &mut Interp, code: &Rc<Code>, args: Value, ctx: Context) -> Result<Value, RunError> {
    let mut frame = Frame::new(code, args, ctx);
    loop {
        frame.op_pc = frame.pc;
        let unit = match frame.fetch() {
            Ok(unit) => unit,
            Err(flow) => match frame.handle_flow(interp, flow) {
                Ok(()) => continue,
                Err(e) => return Err(e),
            },
        };
        let Some(op) = Opcode::from_unit(unit) else {
            return Err(frame.bug(format!("unknown opcode {unit}")));
        };
        match frame.step(interp, op) {
            Ok(Step::Continue) => {}
            Ok(Step::Return(value)) => return Ok(value),
            Err(Flow::Marker(marker)) => return Ok(marker),
            Err(Flow::Error(error)) => match frame.catch_or_raise(interp, error) {
                Ok(()) => {}
                Err(e) => return Err(e),
            },
        }
    }
}

/// Per-invocation state.
pub(crate) struct Frame<'c> {
    code: &'c Rc<Code>,
    /// Offset of the next unit to fetch.
    pc: usize,
    /// Offset of the opcode currently executing, for error coordinates.
    op_pc: usize,
    regs: Vec<Value>,
    /// LIFO of `EVAL_CATCH` offsets pushed by `EVAL_TRY`.
    catch_stack: Vec<usize>,
    /// The effective calling context of this invocation.
    ctx: Context,
}

impl<'c> Frame<'c> {
    fn new(code: &'c Rc<Code>, args: Value, ctx: Context) -> Self {
        let count = code.register_count().max(3) as usize;
        let mut regs = Vec::with_capacity(count);
        regs.push(Value::Code(CodeValue::Interpreted(Rc::clone(code))));
        let args = match args {
            list @ Value::Array(_) => list,
            other => Value::list(other.flatten()),
        };
        regs.push(args);
        regs.push(Value::scalar(Scalar::Int(ctx as i64)));
        regs.extend(code.captured().iter().cloned());
        while regs.len() < count {
            regs.push(Value::undef());
        }
        Self {
            code,
            pc: 0,
            op_pc: 0,
            regs,
            catch_stack: Vec::new(),
            ctx,
        }
    }

    // ========================================================================
    // Error plumbing
    // ========================================================================

    /// Source coordinates of the executing instruction.
    fn location(&self) -> DieLocation {
        DieLocation {
            sub_name: self.code.qualified_name(),
            source: self.code.source(),
            line: self.code.line_for_offset(self.op_pc),
            pc: Some(self.op_pc),
        }
    }

    /// The source line of the executing instruction.
    fn line(&self) -> u32 {
        self.code.line_for_offset(self.op_pc)
    }

    /// An interpreter-detected inconsistency: corrupted bytecode or a
    /// compiler bug. Terminates the invocation with full coordinates.
    fn bug(&self, message: String) -> RunError {
        RunError::msg(format!("bytecode error: {message}")).ensure_located(self.location())
    }

    /// Routes an error to the nearest eval handler, or re-raises it with
    /// coordinates attached.
    fn catch_or_raise(&mut self, interp: &mut Interp, error: RunError) -> Result<(), RunError> {
        let located = error.ensure_located(self.location());
        match self.catch_stack.pop() {
            Some(catch_pc) => {
                interp.set_error(located.catch_value());
                self.pc = catch_pc;
                Ok(())
            }
            None => Err(located),
        }
    }

    fn handle_flow(&mut self, interp: &mut Interp, flow: Flow) -> Result<(), RunError> {
        match flow {
            Flow::Error(error) => self.catch_or_raise(interp, error),
            Flow::Marker(_) => Err(self.bug("marker escaped through operand fetch".to_owned())),
        }
    }

    // ========================================================================
    // Operand and register access
    // ========================================================================

    /// Fetches the next code unit.
    fn fetch(&mut self) -> Result<u16, Flow> {
        let unit = self
            .code
            .units()
            .get(self.pc)
            .copied()
            .ok_or_else(|| Flow::Error(self.bug_at("truncated instruction stream")))?;
        self.pc += 1;
        Ok(unit)
    }

    fn bug_at(&self, message: &str) -> RunError {
        RunError::msg(format!("bytecode error: {message}")).ensure_located(self.location())
    }

    /// Fetches a big-endian 32-bit immediate (two units, high first).
    fn fetch_imm32(&mut self) -> Result<i64, Flow> {
        let hi = self.fetch()? as u32;
        let lo = self.fetch()? as u32;
        Ok(((hi << 16) | lo) as i32 as i64)
    }

    /// Fetches and resolves a context-tag operand.
    fn fetch_ctx(&mut self) -> Result<Context, Flow> {
        let unit = self.fetch()?;
        let ctx = Context::from_unit(unit).ok_or_else(|| Flow::Error(self.bug_at("bad context tag")))?;
        Ok(ctx.resolve(self.ctx))
    }

    /// A register slot, bounds-checked.
    fn reg(&self, r: u16) -> Result<&Value, Flow> {
        self.regs
            .get(r as usize)
            .ok_or_else(|| Flow::Error(self.bug_at("register index out of range")))
    }

    fn set_reg(&mut self, r: u16, value: Value) -> Result<(), Flow> {
        if r as usize >= self.regs.len() {
            return Err(Flow::Error(self.bug_at("register index out of range")));
        }
        self.regs[r as usize] = value;
        Ok(())
    }

    /// A register's value where a *normal* value is required: observing a
    /// marker here propagates it out of the invocation.
    fn value(&self, r: u16) -> Result<&Value, Flow> {
        let value = self.reg(r)?;
        if value.is_control() {
            return Err(Flow::Marker(value.clone()));
        }
        Ok(value)
    }

    /// Scalar-context copy of a register's value.
    fn scalar_val(&self, r: u16) -> Result<Scalar, Flow> {
        Ok(self.value(r)?.scalarize())
    }

    /// The live scalar cell in a register slot. Compiler-emitted in-place
    /// ops rely on the slot actually holding a scalar.
    fn cell_of(&self, r: u16) -> Result<ScalarCell, Flow> {
        match self.value(r)? {
            Value::Scalar(c) => Ok(Rc::clone(c)),
            other => Err(Flow::Error(
                self.bug_at(&format!("expected a scalar slot, found {}", other.kind_name())),
            )),
        }
    }

    /// The array behind a register, for reads.
    fn array_arg(&self, r: u16) -> Result<ArrayRef, Flow> {
        self.value(r)?.as_array().map_err(Flow::Error)
    }

    /// The array behind a register for writes, autovivifying an undef
    /// scalar into a fresh array reference.
    fn array_lvalue(&self, r: u16) -> Result<ArrayRef, Flow> {
        if let Value::Scalar(c) = self.value(r)? {
            let is_undef = !c.borrow().defined();
            if is_undef {
                let fresh = crate::runtime::array::array_ref(crate::runtime::array::Array::new());
                *c.borrow_mut() = Scalar::ArrayRef(Rc::clone(&fresh));
                return Ok(fresh);
            }
        }
        self.array_arg(r)
    }

    fn hash_arg(&self, r: u16) -> Result<HashRef, Flow> {
        self.value(r)?.as_hash().map_err(Flow::Error)
    }

    fn hash_lvalue(&self, r: u16) -> Result<HashRef, Flow> {
        if let Value::Scalar(c) = self.value(r)? {
            let is_undef = !c.borrow().defined();
            if is_undef {
                let fresh = crate::runtime::hash::hash_ref(crate::runtime::hash::Hash::new());
                *c.borrow_mut() = Scalar::HashRef(Rc::clone(&fresh));
                return Ok(fresh);
            }
        }
        self.hash_arg(r)
    }

    /// Flattened cell list of a register (aliasing).
    fn list_arg(&self, r: u16) -> Result<Vec<ScalarCell>, Flow> {
        Ok(self.value(r)?.flatten())
    }

    /// Flattened *copies* of a register's list, for assignment forms that
    /// must not alias their source.
    fn list_copy(&self, r: u16) -> Result<Vec<ScalarCell>, Flow> {
        Ok(self
            .list_arg(r)?
            .iter()
            .map(|c| cell(c.borrow().clone()))
            .collect())
    }

    fn string_operand(&mut self) -> Result<Rc<str>, Flow> {
        let idx = self.fetch()?;
        self.code
            .string_at(idx)
            .cloned()
            .ok_or_else(|| Flow::Error(self.bug_at("string index out of range")))
    }

    fn const_operand(&mut self) -> Result<&Const, Flow> {
        let idx = self.fetch()?;
        match self.code.const_at(idx) {
            Some(constant) => Ok(constant),
            None => Err(Flow::Error(
                RunError::msg("bytecode error: constant index out of range").ensure_located(self.location()),
            )),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, interp: &mut Interp, op: Opcode) -> Result<Step, Flow> {
        match op {
            Opcode::Nop => {}

            Opcode::Return => {
                let r = self.fetch()?;
                // Markers return as-is; they are the point of RETURN-based
                // unwinding.
                return Ok(Step::Return(self.reg(r)?.clone()));
            }

            Opcode::Goto => {
                let target = self.fetch()?;
                self.pc = target as usize;
            }

            Opcode::GotoIfFalse => {
                let r = self.fetch()?;
                let target = self.fetch()?;
                if !self.value(r)?.truthy() {
                    self.pc = target as usize;
                }
            }

            Opcode::GotoIfTrue => {
                let r = self.fetch()?;
                let target = self.fetch()?;
                if self.value(r)?.truthy() {
                    self.pc = target as usize;
                }
            }

            Opcode::Move => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let value = self.reg(rs)?.clone();
                self.set_reg(rd, value)?;
            }

            Opcode::LoadConst => {
                let rd = self.fetch()?;
                let value = self.const_operand()?.to_value();
                self.set_reg(rd, value)?;
            }

            Opcode::LoadInt => {
                let rd = self.fetch()?;
                let imm = self.fetch_imm32()?;
                // Always a fresh cell: the consumer may mutate in place.
                self.set_reg(rd, Value::int(imm))?;
            }

            Opcode::LoadString => {
                let rd = self.fetch()?;
                let s = self.string_operand()?;
                self.set_reg(rd, Value::scalar(Scalar::Str(s)))?;
            }

            Opcode::LoadUndef => {
                let rd = self.fetch()?;
                self.set_reg(rd, Value::undef())?;
            }

            Opcode::LoadGlobal => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let cell = interp.symbols_mut().get_scalar(&name);
                self.set_reg(rd, Value::Scalar(cell))?;
            }

            Opcode::StoreGlobal => {
                let name = self.string_operand()?;
                let rs = self.fetch()?;
                let value = self.scalar_val(rs)?;
                interp.symbols_mut().set_scalar(&name, value);
            }

            Opcode::LoadGlobalArray => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let array = interp.symbols_mut().get_array(&name);
                self.set_reg(rd, Value::Array(array))?;
            }

            Opcode::StoreGlobalArray => {
                let name = self.string_operand()?;
                let rs = self.fetch()?;
                let cells = self.list_copy(rs)?;
                interp.symbols_mut().get_array(&name).borrow_mut().assign(cells);
            }

            Opcode::LoadGlobalHash => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let hash = interp.symbols_mut().get_hash(&name);
                self.set_reg(rd, Value::Hash(hash))?;
            }

            Opcode::StoreGlobalHash => {
                let name = self.string_operand()?;
                let rs = self.fetch()?;
                let cells = self.list_arg(rs)?;
                interp.symbols_mut().get_hash(&name).borrow_mut().assign(&cells);
            }

            Opcode::LoadGlobalCode => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let code = interp
                    .symbols()
                    .get_code(&name)
                    .ok_or_else(|| RunError::msg(format!("Undefined subroutine &{name} called")))?;
                self.set_reg(rd, Value::Code(code))?;
            }

            // === Arithmetic ===
            Opcode::Add => self.binary_op(ops::add)?,
            Opcode::Sub => self.binary_op(ops::subtract)?,
            Opcode::Mul => self.binary_op(ops::multiply)?,
            Opcode::Div => self.binary_op_fallible(ops::divide)?,
            Opcode::Mod => self.binary_op_fallible(ops::modulo)?,
            Opcode::Pow => self.binary_op(ops::power)?,

            Opcode::Neg => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let a = self.scalar_val(ra)?;
                self.set_reg(rd, Value::scalar(ops::negate(&a)))?;
            }

            Opcode::AddInt => self.binary_imm_op(ops::add)?,
            Opcode::SubInt => self.binary_imm_op(ops::subtract)?,
            Opcode::MulInt => self.binary_imm_op(ops::multiply)?,

            // === String ===
            Opcode::Concat => self.binary_op(ops::concat)?,

            Opcode::Repeat => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let rb = self.fetch()?;
                let count = self.scalar_val(rb)?;
                // List repetition when the left side is a list.
                let list = match self.value(ra)? {
                    Value::Array(list) => Some(Rc::clone(list)),
                    _ => None,
                };
                if let Some(list) = list {
                    let n = count.to_int().max(0) as usize;
                    let source: Vec<ScalarCell> = list.borrow().cells().to_vec();
                    let mut out = Vec::with_capacity(source.len() * n);
                    for _ in 0..n {
                        out.extend(source.iter().map(|c| cell(c.borrow().clone())));
                    }
                    self.set_reg(rd, Value::list(out))?;
                } else {
                    let a = self.scalar_val(ra)?;
                    self.set_reg(rd, Value::scalar(ops::repeat(&a, &count)))?;
                }
            }

            Opcode::Substr => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let roff = self.fetch()?;
                let rlen = self.fetch()?;
                let s = self.scalar_val(rs)?;
                let off = self.scalar_val(roff)?;
                let len = self.scalar_val(rlen)?;
                let len = if len.defined() { Some(len) } else { None };
                self.set_reg(rd, Value::scalar(ops::substr(&s, &off, len.as_ref())))?;
            }

            Opcode::Length => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let a = self.scalar_val(ra)?;
                self.set_reg(rd, Value::scalar(ops::length(&a)))?;
            }

            Opcode::Join => {
                let rd = self.fetch()?;
                let rsep = self.fetch()?;
                let rlist = self.fetch()?;
                let sep = self.scalar_val(rsep)?;
                let items = self.list_arg(rlist)?;
                self.set_reg(rd, Value::scalar(ops::join(&sep, &items)))?;
            }

            // === Compare ===
            Opcode::NumEq => self.binary_op(ops::num_eq)?,
            Opcode::NumNe => self.binary_op(ops::num_ne)?,
            Opcode::NumLt => self.binary_op(ops::num_lt)?,
            Opcode::NumGt => self.binary_op(ops::num_gt)?,
            Opcode::NumLe => self.binary_op(ops::num_le)?,
            Opcode::NumGe => self.binary_op(ops::num_ge)?,
            Opcode::NumCmp => self.binary_op(ops::num_three_way)?,
            Opcode::StrEq => self.binary_op(ops::str_eq)?,
            Opcode::StrNe => self.binary_op(ops::str_ne)?,
            Opcode::StrLt => self.binary_op(ops::str_lt)?,
            Opcode::StrGt => self.binary_op(ops::str_gt)?,
            Opcode::StrLe => self.binary_op(ops::str_le)?,
            Opcode::StrGe => self.binary_op(ops::str_ge)?,
            Opcode::StrCmp => self.binary_op(ops::str_three_way)?,

            Opcode::Not => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let truthy = self.value(ra)?.truthy();
                self.set_reg(rd, Value::scalar(ops::bool_scalar(!truthy)))?;
            }

            // === Array ops ===
            Opcode::ArrayGet => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let ridx = self.fetch()?;
                let array = self.array_arg(ra)?;
                let index = self.scalar_val(ridx)?.to_int();
                let elem = array.borrow().get(index);
                self.set_reg(rd, Value::Scalar(elem))?;
            }

            Opcode::ArraySet => {
                let ra = self.fetch()?;
                let ridx = self.fetch()?;
                let rv = self.fetch()?;
                let array = self.array_lvalue(ra)?;
                let index = self.scalar_val(ridx)?.to_int();
                let value = self.scalar_val(rv)?;
                array.borrow_mut().set(index, value);
            }

            Opcode::ArrayPush => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let rvals = self.fetch()?;
                let array = self.array_lvalue(ra)?;
                let values = self.list_copy(rvals)?;
                let len = array.borrow_mut().push(values);
                self.set_reg(rd, Value::int(len as i64))?;
            }

            Opcode::ArrayPop => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let array = self.array_arg(ra)?;
                let popped = array.borrow_mut().pop();
                self.set_reg(rd, popped.map_or_else(Value::undef, Value::Scalar))?;
            }

            Opcode::ArrayShift => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let array = self.array_arg(ra)?;
                let shifted = array.borrow_mut().shift();
                self.set_reg(rd, shifted.map_or_else(Value::undef, Value::Scalar))?;
            }

            Opcode::ArrayUnshift => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let rvals = self.fetch()?;
                let array = self.array_lvalue(ra)?;
                let values = self.list_copy(rvals)?;
                let len = array.borrow_mut().unshift(values);
                self.set_reg(rd, Value::int(len as i64))?;
            }

            Opcode::ArraySize => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let len = self.array_arg(ra)?.borrow().len();
                self.set_reg(rd, Value::int(len as i64))?;
            }

            Opcode::ArrayCreate => {
                let rd = self.fetch()?;
                self.set_reg(rd, Value::list(Vec::new()))?;
            }

            Opcode::ArraySlice => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let ridxs = self.fetch()?;
                let array = self.array_arg(ra)?;
                let indices: Vec<i64> = self.list_arg(ridxs)?.iter().map(|c| c.borrow().to_int()).collect();
                let cells = array.borrow().slice(&indices);
                self.set_reg(rd, Value::list(cells))?;
            }

            Opcode::ArraySliceSet => {
                let ra = self.fetch()?;
                let ridxs = self.fetch()?;
                let rvals = self.fetch()?;
                let array = self.array_lvalue(ra)?;
                let indices: Vec<i64> = self.list_arg(ridxs)?.iter().map(|c| c.borrow().to_int()).collect();
                let values = self.list_arg(rvals)?;
                array.borrow_mut().slice_set(&indices, &values);
            }

            Opcode::ArraySplice => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let roff = self.fetch()?;
                let rlen = self.fetch()?;
                let rrepl = self.fetch()?;
                let array = self.array_lvalue(ra)?;
                let offset = self.scalar_val(roff)?.to_int();
                let len = self.scalar_val(rlen)?;
                let len = if len.defined() { Some(len.to_int()) } else { None };
                let replacement = match self.value(rrepl)? {
                    Value::Scalar(c) if !c.borrow().defined() => Vec::new(),
                    _ => self.list_copy(rrepl)?,
                };
                let removed = array.borrow_mut().splice(offset, len, replacement);
                self.set_reg(rd, Value::list(removed))?;
            }

            Opcode::ArrayReverse => {
                let rd = self.fetch()?;
                let rlist = self.fetch()?;
                let mut cells = self.list_arg(rlist)?;
                cells.reverse();
                self.set_reg(rd, Value::list(cells))?;
            }

            // === Hash ops ===
            Opcode::HashGet => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let rk = self.fetch()?;
                let hash = self.hash_arg(rh)?;
                let key = self.scalar_val(rk)?.to_text();
                let value = hash.borrow().get(&key);
                self.set_reg(rd, Value::Scalar(value))?;
            }

            Opcode::HashSet => {
                let rh = self.fetch()?;
                let rk = self.fetch()?;
                let rv = self.fetch()?;
                let hash = self.hash_lvalue(rh)?;
                let key = self.scalar_val(rk)?.to_text();
                let value = self.scalar_val(rv)?;
                hash.borrow_mut().set(&key, value);
            }

            Opcode::HashExists => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let rk = self.fetch()?;
                let hash = self.hash_arg(rh)?;
                let key = self.scalar_val(rk)?.to_text();
                let exists = hash.borrow().exists(&key);
                self.set_reg(rd, Value::scalar(ops::bool_scalar(exists)))?;
            }

            Opcode::HashDelete => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let rk = self.fetch()?;
                let hash = self.hash_arg(rh)?;
                let key = self.scalar_val(rk)?.to_text();
                let deleted = hash.borrow_mut().delete(&key);
                self.set_reg(rd, deleted.map_or_else(Value::undef, Value::Scalar))?;
            }

            Opcode::HashKeys => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let keys = self.hash_arg(rh)?.borrow().keys();
                self.set_reg(rd, Value::list(keys))?;
            }

            Opcode::HashValues => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let values = self.hash_arg(rh)?.borrow().values();
                self.set_reg(rd, Value::list(values))?;
            }

            Opcode::HashCreate => {
                let rd = self.fetch()?;
                self.set_reg(
                    rd,
                    Value::Hash(crate::runtime::hash::hash_ref(crate::runtime::hash::Hash::new())),
                )?;
            }

            Opcode::HashSlice => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let rks = self.fetch()?;
                let hash = self.hash_arg(rh)?;
                let keys: Vec<String> = self.list_arg(rks)?.iter().map(|c| c.borrow().to_text()).collect();
                let cells = hash.borrow().slice(&keys);
                self.set_reg(rd, Value::list(cells))?;
            }

            Opcode::HashSliceSet => {
                let rh = self.fetch()?;
                let rks = self.fetch()?;
                let rvals = self.fetch()?;
                let hash = self.hash_lvalue(rh)?;
                let keys: Vec<String> = self.list_arg(rks)?.iter().map(|c| c.borrow().to_text()).collect();
                let values = self.list_arg(rvals)?;
                hash.borrow_mut().slice_set(&keys, &values);
            }

            Opcode::HashSliceDelete => {
                let rd = self.fetch()?;
                let rh = self.fetch()?;
                let rks = self.fetch()?;
                let hash = self.hash_arg(rh)?;
                let keys: Vec<String> = self.list_arg(rks)?.iter().map(|c| c.borrow().to_text()).collect();
                let deleted = hash.borrow_mut().slice_delete(&keys);
                self.set_reg(rd, Value::list(deleted))?;
            }

            // === Calls ===
            Opcode::CallSub => self.call_sub(interp)?,
            Opcode::CallMethod => self.call_method(interp)?,
            Opcode::CallBuiltin => self.call_builtin()?,

            // === Control-flow markers ===
            Opcode::CreateLast => self.create_loop_marker(ControlKind::Last)?,
            Opcode::CreateNext => self.create_loop_marker(ControlKind::Next)?,
            Opcode::CreateRedo => self.create_loop_marker(ControlKind::Redo)?,

            Opcode::CreateGoto => {
                let rd = self.fetch()?;
                let rtarget = self.fetch()?;
                let label = self.string_operand()?;
                let label = if label.is_empty() { None } else { Some(label) };
                let line = self.line();
                let target = self.reg(rtarget)?.as_code().ok();
                let marker = match target {
                    Some(code) => ControlFlow::transfer(ControlKind::Goto, code, None, line),
                    None => ControlFlow::loop_control(ControlKind::Goto, label, line),
                };
                self.set_reg(rd, Value::Control(marker))?;
            }

            Opcode::IsControlFlow => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let is_marker = self.reg(rs)?.is_control();
                self.set_reg(rd, Value::scalar(ops::bool_scalar(is_marker)))?;
            }

            Opcode::GetControlFlowType => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let kind = self.reg(rs)?.as_control().map(|cf| cf.kind);
                let value = kind.map_or_else(Value::undef, |k| Value::int(k as i64));
                self.set_reg(rd, value)?;
            }

            // === References ===
            Opcode::CreateRef => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let reference = match self.value(rs)? {
                    Value::Scalar(c) => Scalar::ScalarRef(Rc::clone(c)),
                    Value::Array(a) => Scalar::ArrayRef(Rc::clone(a)),
                    Value::Hash(h) => Scalar::HashRef(Rc::clone(h)),
                    Value::Code(c) => Scalar::Code(c.clone()),
                    Value::Handle(h) => Scalar::Glob(Rc::clone(h)),
                    other => {
                        return Err(Flow::Error(RunError::msg(format!(
                            "Can't take a reference to a {}",
                            other.kind_name()
                        ))));
                    }
                };
                self.set_reg(rd, Value::scalar(reference))?;
            }

            Opcode::Deref => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let source = self.cell_of(rs)?;
                let current = source.borrow().clone();
                let target = match current {
                    Scalar::ScalarRef(inner) => inner,
                    Scalar::Undef => {
                        // Autovivification through an undef lvalue.
                        let fresh = cell(Scalar::Undef);
                        *source.borrow_mut() = Scalar::ScalarRef(Rc::clone(&fresh));
                        fresh
                    }
                    _ => return Err(Flow::Error(RunError::msg("Not a SCALAR reference"))),
                };
                self.set_reg(rd, Value::Scalar(target))?;
            }

            Opcode::DerefArray => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let array = self.array_lvalue(rs)?;
                self.set_reg(rd, Value::Array(array))?;
            }

            Opcode::DerefHash => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let hash = self.hash_lvalue(rs)?;
                self.set_reg(rd, Value::Hash(hash))?;
            }

            Opcode::GetType => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let kind = self.reg(rs)?.kind_name();
                self.set_reg(rd, Value::str(kind))?;
            }

            // === I/O ===
            Opcode::Print | Opcode::Say => {
                let rd = self.fetch()?;
                let rfh = self.fetch()?;
                let rargs = self.fetch()?;
                let handle = match self.value(rfh)? {
                    Value::Scalar(c) if !c.borrow().defined() => interp.selected_handle(),
                    other => other.as_handle().map_err(Flow::Error)?,
                };
                let mut text: String = self
                    .list_arg(rargs)?
                    .iter()
                    .map(|c| c.borrow().to_text())
                    .collect();
                if op == Opcode::Say {
                    text.push('\n');
                }
                handle.borrow_mut().write_str(&text)?;
                self.set_reg(rd, Value::int(1))?;
            }

            Opcode::Select => {
                let rd = self.fetch()?;
                let rfh = self.fetch()?;
                let previous = interp.selected_handle();
                let selects = match self.value(rfh)? {
                    Value::Scalar(c) if !c.borrow().defined() => None,
                    other => Some(other.as_handle().map_err(Flow::Error)?),
                };
                if let Some(handle) = selects {
                    interp.select_handle(handle);
                }
                self.set_reg(rd, Value::Handle(previous))?;
            }

            Opcode::Open => {
                let rd = self.fetch()?;
                let rfhvar = self.fetch()?;
                let rmode = self.fetch()?;
                let rpath = self.fetch()?;
                let slot = self.cell_of(rfhvar)?;
                let mode = self.scalar_val(rmode)?.to_text();
                let path = self.scalar_val(rpath)?.to_text();
                match crate::runtime::io::open(&mode, &path) {
                    Ok(handle) => {
                        *slot.borrow_mut() = Scalar::Glob(handle_ref(handle));
                        self.set_reg(rd, Value::int(1))?;
                    }
                    Err(error) => {
                        interp.set_errno(Scalar::str(error.message()));
                        self.set_reg(rd, Value::scalar(ops::bool_scalar(false)))?;
                    }
                }
            }

            Opcode::Readline => {
                let rd = self.fetch()?;
                let rfh = self.fetch()?;
                let ctx = self.fetch_ctx()?;
                let handle = self.value(rfh)?.as_handle().map_err(Flow::Error)?;
                if ctx.wants_list() {
                    let lines = handle.borrow_mut().read_all_lines()?;
                    let cells = lines.into_iter().map(|l| cell(Scalar::str(l))).collect();
                    self.set_reg(rd, Value::list(cells))?;
                } else {
                    let line = handle.borrow_mut().read_line()?;
                    let value = line.map_or_else(Value::undef, Value::str);
                    self.set_reg(rd, value)?;
                }
            }

            // === Misc ===
            Opcode::Die => {
                let rargs = self.fetch()?;
                let cells = self.list_arg(rargs)?;
                return Err(Flow::Error(RunError::die(&cells, self.location())));
            }

            Opcode::Warn => {
                let rd = self.fetch()?;
                let rargs = self.fetch()?;
                let cells = self.list_arg(rargs)?;
                let text = RunError::warn_text(&cells, &self.location());
                interp.emit_warning(&text);
                self.set_reg(rd, Value::int(1))?;
            }

            Opcode::Require => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let value = self.scalar_val(rs)?;
                match &value {
                    // Version checks always pass in-core; the enclosing
                    // runtime owns versioning.
                    Scalar::Int(_) | Scalar::Num(_) => {}
                    other => {
                        let module = other.to_text();
                        let loaded = {
                            let inc = interp.symbols_mut().get_hash("main::INC");
                            let inc = inc.borrow();
                            inc.exists(&module)
                        };
                        if !loaded {
                            return Err(Flow::Error(RunError::msg(format!(
                                "Can't locate {module} in @INC"
                            ))));
                        }
                    }
                }
                self.set_reg(rd, Value::int(1))?;
            }

            Opcode::Range => {
                let rd = self.fetch()?;
                let rlo = self.fetch()?;
                let rhi = self.fetch()?;
                let lo = self.scalar_val(rlo)?.to_int();
                let hi = self.scalar_val(rhi)?.to_int();
                let cells = (lo..=hi).map(|i| cell(Scalar::Int(i))).collect();
                self.set_reg(rd, Value::list(cells))?;
            }

            Opcode::Rand => {
                let rd = self.fetch()?;
                let ra = self.fetch()?;
                let max = self.scalar_val(ra)?;
                let max = if max.defined() {
                    let m = max.to_num();
                    if m == 0.0 {
                        1.0
                    } else {
                        m
                    }
                } else {
                    1.0
                };
                let value = interp.rand(max);
                self.set_reg(rd, Value::scalar(Scalar::Num(value)))?;
            }

            Opcode::Map => self.call_map(interp)?,
            Opcode::Grep => self.call_grep(interp)?,
            Opcode::Sort => self.call_sort(interp)?,

            Opcode::Defined => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let defined = self.reg(rs)?.defined();
                self.set_reg(rd, Value::scalar(ops::bool_scalar(defined)))?;
            }

            Opcode::Ref => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let text = match self.value(rs)? {
                    Value::Scalar(c) => c.borrow().ref_type(),
                    Value::Code(_) => Rc::from("CODE"),
                    _ => Rc::from(""),
                };
                self.set_reg(rd, Value::scalar(Scalar::Str(text)))?;
            }

            Opcode::Bless => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let rpkg = self.fetch()?;
                let package: Rc<str> = Rc::from(self.scalar_val(rpkg)?.to_text().as_str());
                let reference = self.scalar_val(rs)?;
                match &reference {
                    Scalar::ArrayRef(a) => a.borrow_mut().bless(package),
                    Scalar::HashRef(h) => h.borrow_mut().bless(package),
                    _ => {
                        return Err(Flow::Error(RunError::msg("Can't bless non-reference value")));
                    }
                }
                self.set_reg(rd, Value::scalar(reference))?;
            }

            Opcode::Isa => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let rpkg = self.fetch()?;
                let target = self.scalar_val(rpkg)?.to_text();
                let object = self.scalar_val(rs)?;
                let package = object
                    .blessed_package()
                    .map_or_else(|| object.to_text(), |p| p.to_string());
                let result = interp.symbols_mut().package_isa(&package, &target);
                self.set_reg(rd, Value::scalar(ops::bool_scalar(result)))?;
            }

            // === Superinstructions ===
            Opcode::IncReg => {
                let r = self.fetch()?;
                let slot = self.cell_of(r)?;
                let current = slot.borrow().clone();
                *slot.borrow_mut() = ops::add(&current, &Scalar::Int(1));
            }

            Opcode::DecReg => {
                let r = self.fetch()?;
                let slot = self.cell_of(r)?;
                let current = slot.borrow().clone();
                *slot.borrow_mut() = ops::subtract(&current, &Scalar::Int(1));
            }

            Opcode::AddAssign => self.assign_op(|a, b| Ok(ops::add(a, b)))?,
            Opcode::SubAssign => self.assign_op(|a, b| Ok(ops::subtract(a, b)))?,
            Opcode::MulAssign => self.assign_op(|a, b| Ok(ops::multiply(a, b)))?,
            Opcode::DivAssign => self.assign_op(ops::divide)?,
            Opcode::ModAssign => self.assign_op(ops::modulo)?,
            Opcode::ConcatAssign => self.assign_op(|a, b| Ok(ops::concat(a, b)))?,
            Opcode::BitAndAssign => self.assign_op(|a, b| Ok(ops::bit_and(a, b)))?,
            Opcode::BitOrAssign => self.assign_op(|a, b| Ok(ops::bit_or(a, b)))?,
            Opcode::BitXorAssign => self.assign_op(|a, b| Ok(ops::bit_xor(a, b)))?,

            Opcode::AddAssignInt => {
                let rd = self.fetch()?;
                let imm = self.fetch_imm32()?;
                let slot = self.cell_of(rd)?;
                let current = slot.borrow().clone();
                *slot.borrow_mut() = ops::add(&current, &Scalar::Int(imm));
            }

            Opcode::PreInc | Opcode::PreDec | Opcode::PostInc | Opcode::PostDec => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let slot = self.cell_of(rs)?;
                let old = slot.borrow().clone();
                let delta = if matches!(op, Opcode::PreInc | Opcode::PostInc) { 1 } else { -1 };
                let new = ops::add(&old, &Scalar::Int(delta));
                *slot.borrow_mut() = new.clone();
                let result = if matches!(op, Opcode::PostInc | Opcode::PostDec) { old } else { new };
                self.set_reg(rd, Value::scalar(result))?;
            }

            // === Eval ===
            Opcode::EvalTry => {
                let rel = self.fetch()? as i16;
                let catch_pc = self.pc as i64 + rel as i64;
                if catch_pc < 0 || catch_pc as usize > self.code.units().len() {
                    return Err(Flow::Error(self.bug_at("eval catch offset out of range")));
                }
                self.catch_stack.push(catch_pc as usize);
            }

            Opcode::EvalCatch => {
                let rd = self.fetch()?;
                // Reached only through the exception path, which already
                // set the error variable.
                self.set_reg(rd, Value::undef())?;
            }

            Opcode::EvalEnd => {
                if self.catch_stack.pop().is_none() {
                    return Err(Flow::Error(self.bug_at("EVAL_END without a handler")));
                }
                interp.clear_error();
            }

            // === List / iterator ===
            Opcode::CreateList => {
                let rd = self.fetch()?;
                let count = self.fetch()?;
                let mut cells = Vec::new();
                for _ in 0..count {
                    let r = self.fetch()?;
                    self.value(r)?.flatten_into(&mut cells);
                }
                self.set_reg(rd, Value::list(cells))?;
            }

            Opcode::ListToScalar => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let value = match self.value(rs)? {
                    Value::Array(list) => {
                        // Comma-operator semantics: the last element.
                        list.borrow().cells().last().map_or_else(Value::undef, |c| Value::Scalar(Rc::clone(c)))
                    }
                    other => Value::Scalar(other.scalar_cell()),
                };
                self.set_reg(rd, value)?;
            }

            Opcode::ScalarToList => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let cells = self.list_arg(rs)?;
                self.set_reg(rd, Value::list(cells))?;
            }

            Opcode::IterCreate => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let items = self.list_arg(rs)?;
                self.set_reg(rd, Value::Iter(ListIter::new(items)))?;
            }

            Opcode::IterHasNext => {
                let rd = self.fetch()?;
                let rit = self.fetch()?;
                let has_next = match self.reg(rit)? {
                    Value::Iter(it) => it.borrow().has_next(),
                    _ => return Err(Flow::Error(self.bug_at("expected an iterator register"))),
                };
                self.set_reg(rd, Value::scalar(ops::bool_scalar(has_next)))?;
            }

            Opcode::IterNext => {
                let rd = self.fetch()?;
                let rit = self.fetch()?;
                let next = match self.reg(rit)? {
                    Value::Iter(it) => it.borrow_mut().next_cell(),
                    _ => return Err(Flow::Error(self.bug_at("expected an iterator register"))),
                };
                self.set_reg(rd, next.map_or_else(Value::undef, Value::Scalar))?;
            }

            Opcode::ForeachNextOrExit => {
                let rvar = self.fetch()?;
                let rit = self.fetch()?;
                let target = self.fetch()?;
                let next = match self.reg(rit)? {
                    Value::Iter(it) => it.borrow_mut().next_cell(),
                    _ => return Err(Flow::Error(self.bug_at("expected an iterator register"))),
                };
                match next {
                    // The loop variable aliases the element cell.
                    Some(elem) => self.set_reg(rvar, Value::Scalar(elem))?,
                    None => self.pc = target as usize,
                }
            }

            // === Closures ===
            Opcode::CreateClosure => {
                let rd = self.fetch()?;
                let template = match self.const_operand()? {
                    Const::Code(template) => Some(Rc::clone(template)),
                    _ => None,
                };
                let Some(template) = template else {
                    return Err(Flow::Error(self.bug_at("closure template must be a code constant")));
                };
                let count = self.fetch()?;
                let mut captured = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let r = self.fetch()?;
                    captured.push(self.reg(r)?.clone());
                }
                let instance = Code::bind_captures(&template, captured);
                self.set_reg(rd, Value::Code(CodeValue::Interpreted(instance)))?;
            }

            Opcode::StoreGlobalCode => {
                let name = self.string_operand()?;
                let rs = self.fetch()?;
                let code = self.value(rs)?.as_code().map_err(Flow::Error)?;
                code.register_as_named_sub(interp, &name);
            }

            Opcode::SetScalar => {
                let rd = self.fetch()?;
                let rs = self.fetch()?;
                let value = self.scalar_val(rs)?;
                let slot = self.cell_of(rd)?;
                *slot.borrow_mut() = value;
            }

            Opcode::SlowOp => {
                let sub_id = self.fetch()?;
                self.slow_op(interp, sub_id)?;
            }
        }
        Ok(Step::Continue)
    }

    // ========================================================================
    // Shared op shapes
    // ========================================================================

    /// rd = f(ra, rb) over scalars.
    fn binary_op(&mut self, f: impl Fn(&Scalar, &Scalar) -> Scalar) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let ra = self.fetch()?;
        let rb = self.fetch()?;
        let a = self.scalar_val(ra)?;
        let b = self.scalar_val(rb)?;
        self.set_reg(rd, Value::scalar(f(&a, &b)))
    }

    fn binary_op_fallible(&mut self, f: impl Fn(&Scalar, &Scalar) -> Result<Scalar, RunError>) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let ra = self.fetch()?;
        let rb = self.fetch()?;
        let a = self.scalar_val(ra)?;
        let b = self.scalar_val(rb)?;
        self.set_reg(rd, Value::scalar(f(&a, &b)?))
    }

    /// rd = f(ra, imm32).
    fn binary_imm_op(&mut self, f: impl Fn(&Scalar, &Scalar) -> Scalar) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let ra = self.fetch()?;
        let imm = self.fetch_imm32()?;
        let a = self.scalar_val(ra)?;
        self.set_reg(rd, Value::scalar(f(&a, &Scalar::Int(imm))))
    }

    /// rd op= rs, writing through rd's live cell.
    fn assign_op(&mut self, f: impl Fn(&Scalar, &Scalar) -> Result<Scalar, RunError>) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rs = self.fetch()?;
        let b = self.scalar_val(rs)?;
        let slot = self.cell_of(rd)?;
        let a = slot.borrow().clone();
        *slot.borrow_mut() = f(&a, &b)?;
        Ok(())
    }

    fn create_loop_marker(&mut self, kind: ControlKind) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let label = self.string_operand()?;
        let label = if label.is_empty() { None } else { Some(label) };
        let line = self.line();
        self.set_reg(rd, Value::Control(ControlFlow::loop_control(kind, label, line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::CodeBuilder;

    /// Hand-assembles a tiny program and runs it.
    fn run_units(build: impl FnOnce(&mut CodeBuilder), registers: u16) -> Result<Value, RunError> {
        let mut b = CodeBuilder::new();
        build(&mut b);
        let body = b.build(
            registers,
            0,
            Rc::from("asm.pl"),
            1,
            Rc::from("main"),
            Rc::from("asm"),
        );
        let code = Code::new(body);
        let mut interp = Interp::new();
        run(&mut interp, &code, Value::empty_list(), Context::Scalar)
    }

    #[test]
    fn test_load_int_and_return() {
        let result = run_units(
            |b| {
                b.emit1(Opcode::LoadInt, 3);
                b.push_imm32(42);
                b.emit1(Opcode::Return, 3);
            },
            4,
        )
        .unwrap();
        assert_eq!(result.scalarize().to_int(), 42);
    }

    #[test]
    fn test_registers_survive_jumps() {
        let result = run_units(
            |b| {
                b.emit1(Opcode::LoadInt, 3);
                b.push_imm32(7);
                let jump = b.emit_jump(Opcode::Goto);
                // Dead code that would clobber r3 if ever reached.
                b.emit1(Opcode::LoadInt, 3);
                b.push_imm32(0);
                b.patch_jump(jump);
                b.emit1(Opcode::Return, 3);
            },
            4,
        )
        .unwrap();
        assert_eq!(result.scalarize().to_int(), 7);
    }

    #[test]
    fn test_unknown_opcode_reports_coordinates() {
        let mut b = CodeBuilder::new();
        b.push_unit(0xfffe);
        let body = b.build(3, 0, Rc::from("bad.pl"), 9, Rc::from("main"), Rc::from("bad"));
        let code = Code::new(body);
        let mut interp = Interp::new();
        let err = run(&mut interp, &code, Value::empty_list(), Context::Void).unwrap_err();
        assert!(err.message().contains("unknown opcode"));
    }

    #[test]
    fn test_load_int_allocates_fresh_cells() {
        // LOAD_INT twice into different registers, increment one.
        let result = run_units(
            |b| {
                b.emit1(Opcode::LoadInt, 3);
                b.push_imm32(5);
                b.emit1(Opcode::LoadInt, 4);
                b.push_imm32(5);
                b.emit1(Opcode::IncReg, 3);
                b.emit1(Opcode::Return, 4);
            },
            5,
        )
        .unwrap();
        assert_eq!(result.scalarize().to_int(), 5, "the second load must be unaffected");
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = run_units(
            |b| {
                b.emit1(Opcode::LoadInt, 3);
                b.push_imm32(1);
                b.emit1(Opcode::LoadInt, 4);
                b.push_imm32(0);
                b.emit3(Opcode::Div, 5, 3, 4);
                b.emit1(Opcode::Return, 5);
            },
            6,
        )
        .unwrap_err();
        assert!(err.message().contains("Illegal division by zero"));
    }
}
