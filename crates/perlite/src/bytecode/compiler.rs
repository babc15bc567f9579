//! The bytecode compiler: AST to code objects.
//!
//! A recursive traversal that, for each node, emits instructions and hands
//! its parent the register holding the result. That convention yields
//! 3-address code with no expression-stack abstraction: short-circuit
//! operators, loop control and `goto` are all plain branches over
//! registers, which stay valid across any jump.
//!
//! Closures are compiled as templates: a free-variable pre-scan of the sub
//! body decides the ordered capture list, the body compiles against
//! capture registers 3..3+N, and the enclosing site emits
//! `CREATE_CLOSURE` with the outer registers to capture.

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use ahash::AHashSet;

use super::builder::{CodeBuilder, JumpLabel};
use super::code::{Code, Const};
use super::op::{Opcode, SlowOp};
use super::scope::{ScopeStack, FIRST_FREE_REGISTER};
use crate::ast::{AccessKind, BinOp, Block, Expr, Func, GotoTarget, LogicalOp, Method, Sigil, Stmt, StmtKind, UnOp};
use crate::builtins::Builtin;
use crate::context::Context;
use crate::runtime::control::ControlKind;

/// Compiler entry points.
pub struct Compiler;

impl Compiler {
    /// Compiles a top-level unit (the whole program or an eval string).
    pub fn compile_unit(unit: &Block, source_name: &str, line: u32) -> Result<Rc<Code>, CompileError> {
        let code = SubCompiler::compile(unit, &[], "main", "<unit>", source_name, line)?;
        log::debug!(
            "compiled unit {source_name}:{line}: {} units, {} registers",
            code.units().len(),
            code.register_count()
        );
        Ok(code)
    }

    /// Compiles a sub body with an explicit capture list. Used by tests
    /// and hosts that assemble subs directly; `compile_unit` is the usual
    /// door.
    pub fn compile_sub(
        body: &Block,
        captures: &[String],
        package: &str,
        sub_name: &str,
        source_name: &str,
        line: u32,
    ) -> Result<Rc<Code>, CompileError> {
        SubCompiler::compile(body, captures, package, sub_name, source_name, line)
    }
}

/// State of one statement label within a sub.
enum LabelState {
    /// Label already emitted at this offset.
    Defined(usize),
    /// Forward `goto`s awaiting the label.
    Pending(Vec<JumpLabel>),
}

/// Per-loop compilation state for `last`/`next`/`redo`.
struct LoopCtx {
    label: Option<String>,
    /// Jump target for `redo`: the top of the body.
    redo_target: usize,
    /// Jump target for `next` when already known (while/foreach).
    continue_target: Option<usize>,
    /// `next` jumps patched later (C-style for, bare blocks).
    next_jumps: Vec<JumpLabel>,
    /// `last` jumps patched at loop end.
    last_jumps: Vec<JumpLabel>,
}

/// Compiles one sub body into a code object.
struct SubCompiler {
    b: CodeBuilder,
    scopes: ScopeStack,
    loops: Vec<LoopCtx>,
    labels: ahash::AHashMap<String, LabelState>,
    /// Labels defined anywhere in this sub (pre-scanned), so `goto` can
    /// choose between a direct jump and the marker form.
    known_labels: AHashSet<String>,
    package: String,
    source: Rc<str>,
    start_line: u32,
}

impl SubCompiler {
    fn compile(
        body: &Block,
        captures: &[String],
        package: &str,
        sub_name: &str,
        source_name: &str,
        line: u32,
    ) -> Result<Rc<Code>, CompileError> {
        let capture_count = u16::try_from(captures.len())
            .map_err(|_| CompileError::new("too many closure captures", line))?;
        let mut scopes = ScopeStack::new(FIRST_FREE_REGISTER + capture_count);
        for (n, name) in captures.iter().enumerate() {
            scopes.bind(name, FIRST_FREE_REGISTER + n as u16);
        }

        let mut c = SubCompiler {
            b: CodeBuilder::new(),
            scopes,
            loops: Vec::new(),
            labels: ahash::AHashMap::new(),
            known_labels: collect_labels(body),
            package: package.to_owned(),
            source: Rc::from(source_name),
            start_line: line,
        };
        c.b.set_line(line);

        let result = c.block(body)?;
        let result = match result {
            Some(reg) => reg,
            None => {
                let reg = c.scopes.alloc();
                c.b.emit1(Opcode::LoadUndef, reg);
                reg
            }
        };
        c.b.emit1(Opcode::Return, result);

        for (name, state) in &c.labels {
            if matches!(state, LabelState::Pending(_)) {
                return Err(CompileError::new(format!("label {name} not found"), line));
            }
        }

        let register_count = c.scopes.register_count();
        let body = c.b.build(
            register_count,
            capture_count,
            c.source,
            c.start_line,
            Rc::from(package),
            Rc::from(sub_name),
        );
        Ok(Code::new(body))
    }

    // ========================================================================
    // Statement compilation
    // ========================================================================

    /// Compiles a block in its own scope; returns the last expression
    /// statement's register, if any.
    fn block(&mut self, block: &Block) -> Result<Option<u16>, CompileError> {
        self.scopes.enter();
        let mut local_count = 0usize;
        let mut last = None;
        for stmt in &block.stmts {
            last = self.stmt(stmt, &mut local_count)?;
        }
        if local_count > 0 {
            self.b.emit_slow(SlowOp::LocalRestore);
            self.b.push_unit(local_count as u16);
        }
        self.scopes.exit();
        Ok(last)
    }

    /// Compiles one statement, returning its value register when it has
    /// one. `local_count` tracks `local` saves for restoration at the end
    /// of the enclosing block.
    fn stmt(&mut self, stmt: &Stmt, local_count: &mut usize) -> Result<Option<u16>, CompileError> {
        self.b.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                // Statement-position increments on cell targets collapse
                // to the in-place superinstructions.
                match expr {
                    Expr::PostIncr(target) | Expr::PreIncr(target) if is_cell_lvalue(target) => {
                        let reg = self.lvalue_cell(target)?;
                        self.b.emit1(Opcode::IncReg, reg);
                        return Ok(Some(reg));
                    }
                    Expr::PostDecr(target) | Expr::PreDecr(target) if is_cell_lvalue(target) => {
                        let reg = self.lvalue_cell(target)?;
                        self.b.emit1(Opcode::DecReg, reg);
                        return Ok(Some(reg));
                    }
                    _ => {}
                }
                let reg = self.expr(expr)?;
                if expr_can_return_marker(expr) {
                    self.emit_marker_check(reg, stmt.line);
                }
                Ok(Some(reg))
            }

            StmtKind::My { names, init } => self.compile_my(names, init.as_ref(), stmt.line).map(Some),

            StmtKind::Local { name } => {
                let qualified = self.qualify_scalar(name, stmt.line)?;
                let idx = self.b.intern_string(&qualified);
                self.b.emit_slow(SlowOp::LocalSave);
                self.b.push_unit(idx);
                *local_count += 1;
                Ok(None)
            }

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.compile_if(cond, then_block, else_block.as_ref())?;
                Ok(None)
            }

            StmtKind::While {
                label,
                cond,
                body,
                negate,
            } => {
                self.compile_while(label.clone(), cond, body, *negate)?;
                Ok(None)
            }

            StmtKind::For {
                label,
                init,
                cond,
                step,
                body,
            } => {
                self.compile_for(label.clone(), init.as_ref(), cond.as_ref(), step.as_ref(), body)?;
                Ok(None)
            }

            StmtKind::Foreach { label, var, list, body } => {
                self.compile_foreach(label.clone(), var.as_deref(), list, body)?;
                Ok(None)
            }

            StmtKind::Block { label, body } => {
                self.compile_bare_block(label.clone(), body)?;
                Ok(None)
            }

            StmtKind::Last { label } => {
                self.compile_loop_control(ControlKind::Last, label.as_deref(), stmt.line);
                Ok(None)
            }
            StmtKind::Next { label } => {
                self.compile_loop_control(ControlKind::Next, label.as_deref(), stmt.line);
                Ok(None)
            }
            StmtKind::Redo { label } => {
                self.compile_loop_control(ControlKind::Redo, label.as_deref(), stmt.line);
                Ok(None)
            }

            StmtKind::Return(expr) => {
                let reg = match expr {
                    Some(e) => self.expr(e)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                self.b.emit1(Opcode::Return, reg);
                Ok(None)
            }

            StmtKind::SubDef { name, body } => {
                // Named subs do not capture; they are package-level.
                let qualified = if name.contains("::") {
                    name.clone()
                } else {
                    format!("{}::{}", self.package, name)
                };
                let short = qualified.rsplit("::").next().unwrap_or(name).to_owned();
                let code = SubCompiler::compile(body, &[], &self.package, &short, &self.source, stmt.line)?;
                let cidx = self.b.add_const(Const::Code(code));
                let tmp = self.scopes.alloc();
                self.b.emit2(Opcode::LoadConst, tmp, cidx);
                let nidx = self.b.intern_string(&qualified);
                self.b.emit2(Opcode::StoreGlobalCode, nidx, tmp);
                Ok(None)
            }

            StmtKind::Package { name } => {
                self.package = name.clone();
                Ok(None)
            }

            StmtKind::Goto(target) => {
                self.compile_goto(target, stmt.line)?;
                Ok(None)
            }

            StmtKind::Labeled { label, stmt: inner } => {
                // Loop statements own their label; push it down so
                // `last LABEL` resolves to the loop itself.
                let mut inner = (**inner).clone();
                match &mut inner.kind {
                    StmtKind::While { label: l, .. }
                    | StmtKind::For { label: l, .. }
                    | StmtKind::Foreach { label: l, .. }
                    | StmtKind::Block { label: l, .. }
                        if l.is_none() =>
                    {
                        *l = Some(label.clone());
                        return self.stmt(&inner, local_count);
                    }
                    _ => {}
                }
                self.define_label(label, stmt.line)?;
                self.stmt(&inner, local_count)
            }
        }
    }

    /// `my` declarations. Evaluation order matters: the initializer sees
    /// the outer binding of a redeclared name.
    fn compile_my(&mut self, names: &[String], init: Option<&Expr>, line: u32) -> Result<u16, CompileError> {
        let init_reg = init.map(|e| self.expr(e)).transpose()?;

        if let [name] = names {
            let reg = self.declare_var(name, line)?;
            if let Some(src) = init_reg {
                self.assign_to_declared(name, reg, src, line)?;
            }
            return Ok(reg);
        }

        // List declaration: iterate the initializer across the targets.
        let iter = self.scopes.alloc();
        match init_reg {
            Some(src) => self.b.emit2(Opcode::IterCreate, iter, src),
            None => {
                let empty = self.scopes.alloc();
                self.b.emit1(Opcode::LoadUndef, empty);
                self.b.emit2(Opcode::IterCreate, iter, empty);
            }
        }
        let mut first = None;
        for name in names {
            let reg = self.declare_var(name, line)?;
            first.get_or_insert(reg);
            if name.starts_with('@') || name.starts_with('%') {
                let rest = self.scopes.alloc();
                self.b.emit_slow(SlowOp::IterRest);
                self.b.push_unit(rest);
                self.b.push_unit(iter);
                self.assign_to_declared(name, reg, rest, line)?;
            } else {
                let item = self.scopes.alloc();
                self.b.emit2(Opcode::IterNext, item, iter);
                self.b.emit2(Opcode::SetScalar, reg, item);
            }
        }
        Ok(first.unwrap_or(iter))
    }

    /// Declares a `my` variable, emitting its fresh container.
    fn declare_var(&mut self, name: &str, line: u32) -> Result<u16, CompileError> {
        let reg = self.scopes.declare(name);
        match name.as_bytes().first() {
            Some(b'$') => self.b.emit1(Opcode::LoadUndef, reg),
            Some(b'@') => self.b.emit1(Opcode::ArrayCreate, reg),
            Some(b'%') => self.b.emit1(Opcode::HashCreate, reg),
            _ => return Err(CompileError::new(format!("bad variable name: {name}"), line)),
        }
        Ok(reg)
    }

    /// Assigns an initializer register into a just-declared variable.
    fn assign_to_declared(&mut self, name: &str, reg: u16, src: u16, line: u32) -> Result<(), CompileError> {
        match name.as_bytes().first() {
            Some(b'$') => self.b.emit2(Opcode::SetScalar, reg, src),
            Some(b'@') => {
                self.b.emit_slow(SlowOp::ArrayAssign);
                self.b.push_unit(reg);
                self.b.push_unit(src);
            }
            Some(b'%') => {
                self.b.emit_slow(SlowOp::HashAssign);
                self.b.push_unit(reg);
                self.b.push_unit(src);
            }
            _ => return Err(CompileError::new(format!("bad variable name: {name}"), line)),
        }
        Ok(())
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn compile_if(&mut self, cond: &Expr, then_block: &Block, else_block: Option<&Block>) -> Result<(), CompileError> {
        let cond_reg = self.expr(cond)?;
        if let Some(else_block) = else_block {
            let to_else = self.b.emit_branch(Opcode::GotoIfFalse, cond_reg);
            self.block(then_block)?;
            let to_end = self.b.emit_jump(Opcode::Goto);
            self.b.patch_jump(to_else);
            self.block(else_block)?;
            self.b.patch_jump(to_end);
        } else {
            let to_end = self.b.emit_branch(Opcode::GotoIfFalse, cond_reg);
            self.block(then_block)?;
            self.b.patch_jump(to_end);
        }
        Ok(())
    }

    fn compile_while(
        &mut self,
        label: Option<String>,
        cond: &Expr,
        body: &Block,
        negate: bool,
    ) -> Result<(), CompileError> {
        let start = self.b.current_offset();
        let cond_reg = self.expr(cond)?;
        let exit_op = if negate { Opcode::GotoIfTrue } else { Opcode::GotoIfFalse };
        let to_end = self.b.emit_branch(exit_op, cond_reg);

        self.loops.push(LoopCtx {
            label,
            redo_target: self.b.current_offset(),
            continue_target: Some(start),
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
        });
        self.block(body)?;
        self.b.emit_jump_to(Opcode::Goto, start);

        self.b.patch_jump(to_end);
        self.finish_loop();
        Ok(())
    }

    fn compile_for(
        &mut self,
        label: Option<String>,
        init: Option<&Expr>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Block,
    ) -> Result<(), CompileError> {
        // The init expression's `my` bindings scope over the whole loop.
        self.scopes.enter();
        if let Some(init) = init {
            self.expr(init)?;
        }

        let start = self.b.current_offset();
        let to_end = match cond {
            Some(cond) => {
                let cond_reg = self.expr(cond)?;
                Some(self.b.emit_branch(Opcode::GotoIfFalse, cond_reg))
            }
            None => None,
        };

        self.loops.push(LoopCtx {
            label,
            redo_target: self.b.current_offset(),
            continue_target: None,
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
        });
        self.block(body)?;

        // `next` lands on the step expression.
        let step_offset = self.b.current_offset();
        let ctx = self.loops.last_mut().expect("loop context pushed above");
        ctx.continue_target = Some(step_offset);
        for jump in ctx.next_jumps.drain(..) {
            self.b.patch_jump(jump);
        }
        if let Some(step) = step {
            self.expr(step)?;
        }
        self.b.emit_jump_to(Opcode::Goto, start);

        if let Some(to_end) = to_end {
            self.b.patch_jump(to_end);
        }
        self.finish_loop();
        self.scopes.exit();
        Ok(())
    }

    fn compile_foreach(
        &mut self,
        label: Option<String>,
        var: Option<&str>,
        list: &Expr,
        body: &Block,
    ) -> Result<(), CompileError> {
        let list_reg = self.expr(list)?;
        let iter = self.scopes.alloc();
        self.b.emit2(Opcode::IterCreate, iter, list_reg);

        // The loop variable scopes over the body; without one, iterate a
        // hidden register and mirror it into the global `$_`.
        self.scopes.enter();
        let var_reg = match var {
            Some(name) => self.scopes.declare(name),
            None => self.scopes.alloc(),
        };

        let iterate = self.b.current_offset();
        let to_end = self.b.emit_foreach_next(var_reg, iter);
        self.loops.push(LoopCtx {
            label,
            redo_target: self.b.current_offset(),
            continue_target: Some(iterate),
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
        });
        if var.is_none() {
            let idx = self.b.intern_string("main::_");
            self.b.emit2(Opcode::StoreGlobal, idx, var_reg);
        }
        self.block(body)?;
        self.b.emit_jump_to(Opcode::Goto, iterate);

        self.b.patch_jump(to_end);
        self.finish_loop();
        self.scopes.exit();
        Ok(())
    }

    /// A bare (labelled) block is a loop that runs once: `last` exits,
    /// `next` exits, `redo` restarts.
    fn compile_bare_block(&mut self, label: Option<String>, body: &Block) -> Result<(), CompileError> {
        self.loops.push(LoopCtx {
            label,
            redo_target: self.b.current_offset(),
            continue_target: None,
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
        });
        self.block(body)?;
        let end = self.b.current_offset();
        let ctx = self.loops.last_mut().expect("loop context pushed above");
        ctx.continue_target = Some(end);
        for jump in ctx.next_jumps.drain(..) {
            self.b.patch_jump(jump);
        }
        self.finish_loop();
        Ok(())
    }

    /// Pops the loop context and patches its pending exits.
    fn finish_loop(&mut self) {
        let ctx = self.loops.pop().expect("finish_loop without a loop");
        for jump in ctx.last_jumps {
            self.b.patch_jump(jump);
        }
        debug_assert!(ctx.next_jumps.is_empty(), "next jumps must be patched by the loop body");
    }

    /// `last`/`next`/`redo`: a direct jump when the target loop is
    /// statically local, the marker form otherwise.
    fn compile_loop_control(&mut self, kind: ControlKind, label: Option<&str>, line: u32) {
        let found = self
            .loops
            .iter()
            .rposition(|ctx| label.is_none() || ctx.label.as_deref() == label);

        let Some(idx) = found else {
            // Not statically local: emit the marker and let callers unwind.
            let reg = self.scopes.alloc();
            let label_idx = self.b.intern_string(label.unwrap_or(""));
            let op = match kind {
                ControlKind::Last => Opcode::CreateLast,
                ControlKind::Next => Opcode::CreateNext,
                _ => Opcode::CreateRedo,
            };
            self.b.set_line(line);
            self.b.emit2(op, reg, label_idx);
            self.b.emit1(Opcode::Return, reg);
            return;
        };

        match kind {
            ControlKind::Last => {
                let jump = self.b.emit_jump(Opcode::Goto);
                self.loops[idx].last_jumps.push(jump);
            }
            ControlKind::Next => {
                if let Some(target) = self.loops[idx].continue_target {
                    self.b.emit_jump_to(Opcode::Goto, target);
                } else {
                    let jump = self.b.emit_jump(Opcode::Goto);
                    self.loops[idx].next_jumps.push(jump);
                }
            }
            _ => {
                let target = self.loops[idx].redo_target;
                self.b.emit_jump_to(Opcode::Goto, target);
            }
        }
    }

    fn compile_goto(&mut self, target: &GotoTarget, line: u32) -> Result<(), CompileError> {
        match target {
            GotoTarget::Label(name) => {
                if self.known_labels.contains(name) {
                    match self.labels.get_mut(name) {
                        Some(LabelState::Defined(offset)) => {
                            let offset = *offset;
                            self.b.emit_jump_to(Opcode::Goto, offset);
                        }
                        Some(LabelState::Pending(jumps)) => {
                            let jump = self.b.emit_jump(Opcode::Goto);
                            jumps.push(jump);
                        }
                        None => {
                            let jump = self.b.emit_jump(Opcode::Goto);
                            self.labels.insert(name.clone(), LabelState::Pending(vec![jump]));
                        }
                    }
                } else {
                    // Target outside this compilation unit: marker form.
                    let reg = self.scopes.alloc();
                    let undef = self.scopes.alloc();
                    self.b.emit1(Opcode::LoadUndef, undef);
                    let label_idx = self.b.intern_string(name);
                    self.b.emit3(Opcode::CreateGoto, reg, undef, label_idx);
                    self.b.emit1(Opcode::Return, reg);
                }
                Ok(())
            }
            GotoTarget::Sub(expr) => {
                let target_reg = self.expr(expr)?;
                let reg = self.scopes.alloc();
                let label_idx = self.b.intern_string("");
                self.b.set_line(line);
                self.b.emit3(Opcode::CreateGoto, reg, target_reg, label_idx);
                self.b.emit1(Opcode::Return, reg);
                Ok(())
            }
        }
    }

    /// Defines a statement label at the current offset, patching forward
    /// `goto`s.
    fn define_label(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        let offset = self.b.current_offset();
        match self.labels.insert(name.to_owned(), LabelState::Defined(offset)) {
            None => Ok(()),
            Some(LabelState::Pending(jumps)) => {
                for jump in jumps {
                    self.b.patch_jump(jump);
                }
                Ok(())
            }
            Some(LabelState::Defined(_)) => Err(CompileError::new(format!("duplicate label {name}"), line)),
        }
    }

    /// After a statement-position call, route a returned marker: loop
    /// controls aimed at the innermost loop are consumed here; everything
    /// else re-returns so an enclosing frame can handle it.
    fn emit_marker_check(&mut self, result: u16, line: u32) {
        let is_marker = self.scopes.alloc();
        self.b.emit2(Opcode::IsControlFlow, is_marker, result);
        let skip = self.b.emit_branch(Opcode::GotoIfFalse, is_marker);

        if let Some(idx) = self.loops.len().checked_sub(1) {
            let kind = self.scopes.alloc();
            self.b.emit2(Opcode::GetControlFlowType, kind, result);
            let expected = self.scopes.alloc();
            let matched = self.scopes.alloc();

            self.b.emit1(Opcode::LoadInt, expected);
            self.b.push_imm32(ControlKind::Last as i32);
            self.b.emit3(Opcode::NumEq, matched, kind, expected);
            let to_last = self.b.emit_branch(Opcode::GotoIfTrue, matched);
            self.loops[idx].last_jumps.push(to_last);

            self.b.emit1(Opcode::LoadInt, expected);
            self.b.push_imm32(ControlKind::Next as i32);
            self.b.emit3(Opcode::NumEq, matched, kind, expected);
            if let Some(target) = self.loops[idx].continue_target {
                self.b.emit_branch_to(Opcode::GotoIfTrue, matched, target);
            } else {
                let to_next = self.b.emit_branch(Opcode::GotoIfTrue, matched);
                self.loops[idx].next_jumps.push(to_next);
            }

            self.b.emit1(Opcode::LoadInt, expected);
            self.b.push_imm32(ControlKind::Redo as i32);
            self.b.emit3(Opcode::NumEq, matched, kind, expected);
            let redo_target = self.loops[idx].redo_target;
            self.b.emit_branch_to(Opcode::GotoIfTrue, matched, redo_target);
        }

        self.b.set_line(line);
        self.b.emit1(Opcode::Return, result);
        self.b.patch_jump(skip);
    }

    // ========================================================================
    // Expression compilation
    // ========================================================================

    /// Compiles an expression, returning the register holding its result.
    fn expr(&mut self, expr: &Expr) -> Result<u16, CompileError> {
        match expr {
            Expr::Undef => {
                let reg = self.scopes.alloc();
                self.b.emit1(Opcode::LoadUndef, reg);
                Ok(reg)
            }

            Expr::Int(value) => {
                let reg = self.scopes.alloc();
                if let Ok(imm) = i32::try_from(*value) {
                    self.b.emit1(Opcode::LoadInt, reg);
                    self.b.push_imm32(imm);
                } else {
                    let idx = self.b.add_const(Const::Int(*value));
                    self.b.emit2(Opcode::LoadConst, reg, idx);
                }
                Ok(reg)
            }

            Expr::Num(value) => {
                let reg = self.scopes.alloc();
                let idx = self.b.add_const(Const::Num(*value));
                self.b.emit2(Opcode::LoadConst, reg, idx);
                Ok(reg)
            }

            Expr::Str(value) => {
                let reg = self.scopes.alloc();
                let idx = self.b.intern_string(value);
                self.b.emit2(Opcode::LoadString, reg, idx);
                Ok(reg)
            }

            Expr::Var(name) => self.load_var(name),
            Expr::Global(name) => self.load_global(name),

            Expr::Elem { container, index, kind } => {
                let container_reg = self.expr(container)?;
                let index_reg = self.expr(index)?;
                let reg = self.scopes.alloc();
                let op = match kind {
                    AccessKind::Array => Opcode::ArrayGet,
                    AccessKind::Hash => Opcode::HashGet,
                };
                self.b.emit3(op, reg, container_reg, index_reg);
                Ok(reg)
            }

            Expr::Slice {
                container,
                indices,
                kind,
            } => {
                let container_reg = self.expr(container)?;
                let indices_reg = self.expr(indices)?;
                let reg = self.scopes.alloc();
                let op = match kind {
                    AccessKind::Array => Opcode::ArraySlice,
                    AccessKind::Hash => Opcode::HashSlice,
                };
                self.b.emit3(op, reg, container_reg, indices_reg);
                Ok(reg)
            }

            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs),
            Expr::Logical { op, lhs, rhs } => self.compile_logical(*op, lhs, rhs),

            Expr::Unary { op, operand } => {
                let operand_reg = self.expr(operand)?;
                let reg = self.scopes.alloc();
                let op = match op {
                    UnOp::Not => Opcode::Not,
                    UnOp::Neg => Opcode::Neg,
                };
                self.b.emit2(op, reg, operand_reg);
                Ok(reg)
            }

            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let reg = self.scopes.alloc();
                let cond_reg = self.expr(cond)?;
                let to_else = self.b.emit_branch(Opcode::GotoIfFalse, cond_reg);
                let then_reg = self.expr(then_expr)?;
                self.b.emit2(Opcode::Move, reg, then_reg);
                let to_end = self.b.emit_jump(Opcode::Goto);
                self.b.patch_jump(to_else);
                let else_reg = self.expr(else_expr)?;
                self.b.emit2(Opcode::Move, reg, else_reg);
                self.b.patch_jump(to_end);
                Ok(reg)
            }

            Expr::Assign { target, value } => {
                let value_reg = self.expr(value)?;
                self.assign_into(target, value_reg)?;
                Ok(value_reg)
            }

            Expr::CompoundAssign { op, target, value } => self.compile_compound_assign(*op, target, value),

            Expr::PreIncr(target) => self.compile_incdec(target, Opcode::PreInc, 1),
            Expr::PostIncr(target) => self.compile_incdec(target, Opcode::PostInc, 1),
            Expr::PreDecr(target) => self.compile_incdec(target, Opcode::PreDec, -1),
            Expr::PostDecr(target) => self.compile_incdec(target, Opcode::PostDec, -1),

            Expr::List(items) => {
                let regs: Vec<u16> = items.iter().map(|e| self.expr(e)).collect::<Result<_, _>>()?;
                let reg = self.scopes.alloc();
                self.emit_create_list(reg, &regs);
                Ok(reg)
            }

            Expr::AnonArray(items) => {
                // A fresh container with copied values, then a reference
                // to it.
                let list_reg = self.compile_arg_list(items)?;
                let array_reg = self.scopes.alloc();
                self.b.emit1(Opcode::ArrayCreate, array_reg);
                self.b.emit_slow(SlowOp::ArrayAssign);
                self.b.push_unit(array_reg);
                self.b.push_unit(list_reg);
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::CreateRef, reg, array_reg);
                Ok(reg)
            }

            Expr::AnonHash(items) => {
                let list_reg = self.compile_arg_list(items)?;
                let hash_reg = self.scopes.alloc();
                self.b.emit1(Opcode::HashCreate, hash_reg);
                self.b.emit_slow(SlowOp::HashAssign);
                self.b.push_unit(hash_reg);
                self.b.push_unit(list_reg);
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::CreateRef, reg, hash_reg);
                Ok(reg)
            }

            Expr::Range { lo, hi } => {
                let lo_reg = self.expr(lo)?;
                let hi_reg = self.expr(hi)?;
                let reg = self.scopes.alloc();
                self.b.emit3(Opcode::Range, reg, lo_reg, hi_reg);
                Ok(reg)
            }

            Expr::Call { name, args } => {
                let qualified = if name.contains("::") {
                    name.clone()
                } else {
                    format!("{}::{}", self.package, name)
                };
                let code_reg = self.scopes.alloc();
                let idx = self.b.intern_string(&qualified);
                self.b.emit2(Opcode::LoadGlobalCode, code_reg, idx);
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                self.b.emit4(Opcode::CallSub, reg, code_reg, args_reg, Context::Runtime.as_unit());
                Ok(reg)
            }

            Expr::DynCall { callee, args } => {
                let code_reg = self.expr(callee)?;
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                self.b.emit4(Opcode::CallSub, reg, code_reg, args_reg, Context::Runtime.as_unit());
                Ok(reg)
            }

            Expr::MethodCall {
                invocant,
                method,
                args,
            } => {
                let invocant_reg = self.expr(invocant)?;
                let method_reg = match method {
                    Method::Named(name) => {
                        let reg = self.scopes.alloc();
                        let idx = self.b.intern_string(name);
                        self.b.emit2(Opcode::LoadString, reg, idx);
                        reg
                    }
                    Method::Dynamic(expr) => self.expr(expr)?,
                };
                // The invocant rides at the front of the argument list.
                let mut regs = vec![invocant_reg];
                for arg in args {
                    regs.push(self.expr(arg)?);
                }
                let args_reg = self.scopes.alloc();
                self.emit_create_list(args_reg, &regs);
                let reg = self.scopes.alloc();
                self.b.emit5(
                    Opcode::CallMethod,
                    reg,
                    invocant_reg,
                    method_reg,
                    args_reg,
                    Context::Runtime.as_unit(),
                );
                Ok(reg)
            }

            Expr::Func { func, args } => self.compile_func(*func, args),

            Expr::AnonSub { body } => self.compile_closure(body),

            Expr::Eval { body } => self.compile_eval_block(body),

            Expr::EvalStr(source) => {
                let source_reg = self.expr(source)?;
                let reg = self.scopes.alloc();
                self.b.emit_slow(SlowOp::EvalString);
                self.b.push_unit(reg);
                self.b.push_unit(source_reg);
                self.b.push_unit(Context::Runtime.as_unit());
                Ok(reg)
            }

            Expr::Ref(inner) => {
                let inner_reg = self.expr(inner)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::CreateRef, reg, inner_reg);
                Ok(reg)
            }

            Expr::Deref { sigil, expr } => {
                let inner_reg = self.expr(expr)?;
                let reg = self.scopes.alloc();
                let op = match sigil {
                    Sigil::Scalar => Opcode::Deref,
                    Sigil::Array => Opcode::DerefArray,
                    Sigil::Hash => Opcode::DerefHash,
                };
                self.b.emit2(op, reg, inner_reg);
                Ok(reg)
            }

            Expr::Isa { object, class } => {
                let object_reg = self.expr(object)?;
                let class_reg = self.expr(class)?;
                let reg = self.scopes.alloc();
                self.b.emit3(Opcode::Isa, reg, object_reg, class_reg);
                Ok(reg)
            }
        }
    }

    // ========================================================================
    // Variables and assignment
    // ========================================================================

    /// Splits a sigiled name and qualifies the rest with the current
    /// package.
    fn qualify(&self, name: &str, line: u32) -> Result<(u8, String), CompileError> {
        let Some((&sigil, rest)) = name.as_bytes().split_first() else {
            return Err(CompileError::new("empty variable name", line));
        };
        let rest = std::str::from_utf8(rest).expect("names are utf-8");
        let qualified = if rest.contains("::") {
            rest.to_owned()
        } else {
            format!("{}::{rest}", self.package)
        };
        Ok((sigil, qualified))
    }

    fn qualify_scalar(&self, name: &str, line: u32) -> Result<String, CompileError> {
        let (sigil, qualified) = self.qualify(name, line)?;
        if sigil != b'$' {
            return Err(CompileError::new(format!("local requires a scalar: {name}"), line));
        }
        Ok(qualified)
    }

    /// Loads a sigiled name: a lexical resolves to its own register, an
    /// undeclared name falls back to the package global. `@_` is the
    /// argument list, which every frame keeps in register 1.
    fn load_var(&mut self, name: &str) -> Result<u16, CompileError> {
        if let Some(reg) = self.scopes.lookup(name) {
            return Ok(reg);
        }
        if name == "@_" {
            return Ok(1);
        }
        self.load_global(name)
    }

    fn load_global(&mut self, name: &str) -> Result<u16, CompileError> {
        let (sigil, qualified) = self.qualify(name, self.b.line())?;
        let idx = self.b.intern_string(&qualified);
        let reg = self.scopes.alloc();
        let op = match sigil {
            b'$' => Opcode::LoadGlobal,
            b'@' => Opcode::LoadGlobalArray,
            b'%' => Opcode::LoadGlobalHash,
            b'&' => Opcode::LoadGlobalCode,
            other => {
                return Err(CompileError::new(
                    format!("bad sigil '{}' in {name}", other as char),
                    self.b.line(),
                ));
            }
        };
        self.b.emit2(op, reg, idx);
        Ok(reg)
    }

    /// Compiles an lvalue to a register holding its live scalar cell, for
    /// in-place superinstructions. Lexicals and globals hand out their
    /// cells directly; element targets go through the read-modify-write
    /// path instead.
    fn lvalue_cell(&mut self, target: &Expr) -> Result<u16, CompileError> {
        if is_cell_lvalue(target) {
            self.expr(target)
        } else {
            Err(CompileError::new("not a scalar lvalue", self.b.line()))
        }
    }

    /// `++`/`--` as expressions. Cell targets use the PRE/POST
    /// superinstructions; element targets read-modify-write with the
    /// container and index evaluated once.
    fn compile_incdec(&mut self, target: &Expr, op: Opcode, delta: i32) -> Result<u16, CompileError> {
        if is_cell_lvalue(target) {
            let cell = self.lvalue_cell(target)?;
            let reg = self.scopes.alloc();
            self.b.emit2(op, reg, cell);
            return Ok(reg);
        }
        let Expr::Elem { container, index, kind } = target else {
            return Err(CompileError::new("not an lvalue", self.b.line()));
        };
        let container_reg = self.expr(container)?;
        let index_reg = self.expr(index)?;
        let (get, set) = match kind {
            AccessKind::Array => (Opcode::ArrayGet, Opcode::ArraySet),
            AccessKind::Hash => (Opcode::HashGet, Opcode::HashSet),
        };
        let current = self.scopes.alloc();
        self.b.emit3(get, current, container_reg, index_reg);
        // The store below writes through the element's live cell, so the
        // old value needs its own copy first.
        let old = self.scopes.alloc();
        self.b.emit1(Opcode::LoadUndef, old);
        self.b.emit2(Opcode::SetScalar, old, current);
        let updated = self.scopes.alloc();
        self.b.emit2(Opcode::AddInt, updated, current);
        self.b.push_imm32(delta);
        self.b.emit3(set, container_reg, index_reg, updated);
        // Post forms yield the old value, pre forms the new one.
        Ok(match op {
            Opcode::PostInc | Opcode::PostDec => old,
            _ => updated,
        })
    }

    /// Stores `value_reg` into an assignment target.
    fn assign_into(&mut self, target: &Expr, value_reg: u16) -> Result<(), CompileError> {
        match target {
            Expr::Var(name) => {
                if let Some(reg) = self.scopes.lookup(name) {
                    return self.assign_to_declared(name, reg, value_reg, self.b.line());
                }
                self.assign_global(name, value_reg)
            }
            Expr::Global(name) => self.assign_global(name, value_reg),

            Expr::Elem { container, index, kind } => {
                let container_reg = self.expr(container)?;
                let index_reg = self.expr(index)?;
                let op = match kind {
                    AccessKind::Array => Opcode::ArraySet,
                    AccessKind::Hash => Opcode::HashSet,
                };
                self.b.emit3(op, container_reg, index_reg, value_reg);
                Ok(())
            }

            Expr::Slice {
                container,
                indices,
                kind,
            } => {
                let container_reg = self.expr(container)?;
                let indices_reg = self.expr(indices)?;
                let op = match kind {
                    AccessKind::Array => Opcode::ArraySliceSet,
                    AccessKind::Hash => Opcode::HashSliceSet,
                };
                self.b.emit3(op, container_reg, indices_reg, value_reg);
                Ok(())
            }

            Expr::Deref { sigil, expr } => {
                let cell_reg = self.expr(&Expr::Deref {
                    sigil: *sigil,
                    expr: expr.clone(),
                })?;
                match sigil {
                    Sigil::Scalar => self.b.emit2(Opcode::SetScalar, cell_reg, value_reg),
                    Sigil::Array => {
                        self.b.emit_slow(SlowOp::ArrayAssign);
                        self.b.push_unit(cell_reg);
                        self.b.push_unit(value_reg);
                    }
                    Sigil::Hash => {
                        self.b.emit_slow(SlowOp::HashAssign);
                        self.b.push_unit(cell_reg);
                        self.b.push_unit(value_reg);
                    }
                }
                Ok(())
            }

            Expr::List(items) => {
                let iter = self.scopes.alloc();
                self.b.emit2(Opcode::IterCreate, iter, value_reg);
                for item in items {
                    let is_aggregate = matches!(item, Expr::Var(n) | Expr::Global(n)
                        if n.starts_with('@') || n.starts_with('%'));
                    if is_aggregate {
                        let rest = self.scopes.alloc();
                        self.b.emit_slow(SlowOp::IterRest);
                        self.b.push_unit(rest);
                        self.b.push_unit(iter);
                        self.assign_into(item, rest)?;
                    } else {
                        let slot = self.scopes.alloc();
                        self.b.emit2(Opcode::IterNext, slot, iter);
                        self.assign_into(item, slot)?;
                    }
                }
                Ok(())
            }

            _ => Err(CompileError::new("not an lvalue", self.b.line())),
        }
    }

    fn assign_global(&mut self, name: &str, value_reg: u16) -> Result<(), CompileError> {
        let (sigil, qualified) = self.qualify(name, self.b.line())?;
        let idx = self.b.intern_string(&qualified);
        let op = match sigil {
            b'$' => Opcode::StoreGlobal,
            b'@' => Opcode::StoreGlobalArray,
            b'%' => Opcode::StoreGlobalHash,
            b'&' => Opcode::StoreGlobalCode,
            other => {
                return Err(CompileError::new(
                    format!("bad sigil '{}' in {name}", other as char),
                    self.b.line(),
                ));
            }
        };
        self.b.emit2(op, idx, value_reg);
        Ok(())
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<u16, CompileError> {
        // Immediate fast path: integer literal on the right of +/-/*.
        if let Expr::Int(value) = rhs {
            if let Ok(imm) = i32::try_from(*value) {
                let fast = match op {
                    BinOp::Add => Some(Opcode::AddInt),
                    BinOp::Sub => Some(Opcode::SubInt),
                    BinOp::Mul => Some(Opcode::MulInt),
                    _ => None,
                };
                if let Some(fast) = fast {
                    let lhs_reg = self.expr(lhs)?;
                    let reg = self.scopes.alloc();
                    self.b.emit2(fast, reg, lhs_reg);
                    self.b.push_imm32(imm);
                    return Ok(reg);
                }
            }
        }

        let lhs_reg = self.expr(lhs)?;
        let rhs_reg = self.expr(rhs)?;

        if let Some(builtin) = bitwise_builtin(op) {
            let args_reg = self.scopes.alloc();
            self.emit_create_list(args_reg, &[lhs_reg, rhs_reg]);
            let reg = self.scopes.alloc();
            self.b.emit4(Opcode::CallBuiltin, reg, builtin as u16, args_reg, Context::Scalar.as_unit());
            return Ok(reg);
        }

        let reg = self.scopes.alloc();
        self.b.emit3(binop_opcode(op), reg, lhs_reg, rhs_reg);
        Ok(reg)
    }

    /// Short-circuit operators lower to branches over the result
    /// register; the right side only runs when needed.
    fn compile_logical(&mut self, op: LogicalOp, lhs: &Expr, rhs: &Expr) -> Result<u16, CompileError> {
        let reg = self.scopes.alloc();
        let lhs_reg = self.expr(lhs)?;
        self.b.emit2(Opcode::Move, reg, lhs_reg);
        let skip = match op {
            LogicalOp::And => self.b.emit_branch(Opcode::GotoIfFalse, reg),
            LogicalOp::Or => self.b.emit_branch(Opcode::GotoIfTrue, reg),
            LogicalOp::DefinedOr => {
                let defined = self.scopes.alloc();
                self.b.emit2(Opcode::Defined, defined, reg);
                self.b.emit_branch(Opcode::GotoIfTrue, defined)
            }
        };
        let rhs_reg = self.expr(rhs)?;
        self.b.emit2(Opcode::Move, reg, rhs_reg);
        self.b.patch_jump(skip);
        Ok(reg)
    }

    fn compile_compound_assign(&mut self, op: BinOp, target: &Expr, value: &Expr) -> Result<u16, CompileError> {
        // Element targets: read-modify-write with the container and index
        // evaluated once.
        if let Expr::Elem { container, index, kind } = target {
            let container_reg = self.expr(container)?;
            let index_reg = self.expr(index)?;
            let (get, set) = match kind {
                AccessKind::Array => (Opcode::ArrayGet, Opcode::ArraySet),
                AccessKind::Hash => (Opcode::HashGet, Opcode::HashSet),
            };
            let current = self.scopes.alloc();
            self.b.emit3(get, current, container_reg, index_reg);
            let value_reg = self.expr(value)?;
            let result = self.scopes.alloc();
            if let Some(builtin) = bitwise_builtin(op) {
                let args_reg = self.scopes.alloc();
                self.emit_create_list(args_reg, &[current, value_reg]);
                self.b.emit4(Opcode::CallBuiltin, result, builtin as u16, args_reg, Context::Scalar.as_unit());
            } else {
                self.b.emit3(binop_opcode(op), result, current, value_reg);
            }
            self.b.emit3(set, container_reg, index_reg, result);
            return Ok(result);
        }

        // Cell targets mutate in place through the superinstructions, so
        // captured and aliased holders observe the write.
        let cell = self.lvalue_cell(target)?;

        if op == BinOp::Add {
            if let Expr::Int(value) = value {
                if let Ok(imm) = i32::try_from(*value) {
                    self.b.emit1(Opcode::AddAssignInt, cell);
                    self.b.push_imm32(imm);
                    return Ok(cell);
                }
            }
        }

        let value_reg = self.expr(value)?;
        let assign = match op {
            BinOp::Add => Some(Opcode::AddAssign),
            BinOp::Sub => Some(Opcode::SubAssign),
            BinOp::Mul => Some(Opcode::MulAssign),
            BinOp::Div => Some(Opcode::DivAssign),
            BinOp::Mod => Some(Opcode::ModAssign),
            BinOp::Concat => Some(Opcode::ConcatAssign),
            BinOp::BitAnd => Some(Opcode::BitAndAssign),
            BinOp::BitOr => Some(Opcode::BitOrAssign),
            BinOp::BitXor => Some(Opcode::BitXorAssign),
            _ => None,
        };
        match assign {
            Some(assign) => {
                self.b.emit2(assign, cell, value_reg);
            }
            None => {
                // No fused form (**=, <<=, ...): compute then store back.
                let result = self.scopes.alloc();
                if let Some(builtin) = bitwise_builtin(op) {
                    let args_reg = self.scopes.alloc();
                    self.emit_create_list(args_reg, &[cell, value_reg]);
                    self.b.emit4(Opcode::CallBuiltin, result, builtin as u16, args_reg, Context::Scalar.as_unit());
                } else {
                    self.b.emit3(binop_opcode(op), result, cell, value_reg);
                }
                self.b.emit2(Opcode::SetScalar, cell, result);
            }
        }
        Ok(cell)
    }

    // ========================================================================
    // Named functions
    // ========================================================================

    fn compile_func(&mut self, func: Func, args: &[Expr]) -> Result<u16, CompileError> {
        let line = self.b.line();
        match func {
            Func::Print | Func::Say => {
                let handle = self.scopes.alloc();
                self.b.emit1(Opcode::LoadUndef, handle);
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                let op = if func == Func::Print { Opcode::Print } else { Opcode::Say };
                self.b.emit3(op, reg, handle, args_reg);
                Ok(reg)
            }

            Func::Push | Func::Unshift => {
                let (first, rest) = split_first(args, "push", line)?;
                let array_reg = self.expr(first)?;
                let values_reg = self.compile_arg_list(rest)?;
                let reg = self.scopes.alloc();
                let op = if func == Func::Push { Opcode::ArrayPush } else { Opcode::ArrayUnshift };
                self.b.emit3(op, reg, array_reg, values_reg);
                Ok(reg)
            }

            Func::Pop | Func::Shift => {
                // Bare `shift`/`pop` operate on the argument list.
                let array_reg = match args.first() {
                    Some(first) => self.expr(first)?,
                    None => 1,
                };
                let reg = self.scopes.alloc();
                let op = if func == Func::Pop { Opcode::ArrayPop } else { Opcode::ArrayShift };
                self.b.emit2(op, reg, array_reg);
                Ok(reg)
            }

            Func::Scalar => {
                let (first, _) = split_first(args, "scalar", line)?;
                let value_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                let is_array = matches!(first, Expr::Var(n) | Expr::Global(n) if n.starts_with('@'))
                    || matches!(first, Expr::Deref { sigil: Sigil::Array, .. });
                if is_array {
                    self.b.emit2(Opcode::ArraySize, reg, value_reg);
                } else {
                    self.b.emit2(Opcode::ListToScalar, reg, value_reg);
                }
                Ok(reg)
            }

            Func::Keys | Func::Values => {
                let (first, _) = split_first(args, "keys", line)?;
                let hash_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                let op = if func == Func::Keys { Opcode::HashKeys } else { Opcode::HashValues };
                self.b.emit2(op, reg, hash_reg);
                Ok(reg)
            }

            Func::Exists | Func::Delete => {
                let (first, _) = split_first(args, "exists", line)?;
                let Expr::Elem { container, index, kind } = first else {
                    return Err(CompileError::new("exists/delete need an element target", line));
                };
                let container_reg = self.expr(container)?;
                let index_reg = self.expr(index)?;
                let reg = self.scopes.alloc();
                let op = match (func, kind) {
                    (Func::Exists, AccessKind::Hash) => Opcode::HashExists,
                    (Func::Delete, AccessKind::Hash) => Opcode::HashDelete,
                    _ => {
                        return Err(CompileError::new("exists/delete support hash elements", line));
                    }
                };
                self.b.emit3(op, reg, container_reg, index_reg);
                Ok(reg)
            }

            Func::Defined => {
                let (first, _) = split_first(args, "defined", line)?;
                let value_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Defined, reg, value_reg);
                Ok(reg)
            }

            Func::Ref => {
                let (first, _) = split_first(args, "ref", line)?;
                let value_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Ref, reg, value_reg);
                Ok(reg)
            }

            Func::Bless => {
                let (first, rest) = split_first(args, "bless", line)?;
                let ref_reg = self.expr(first)?;
                let package_reg = match rest.first() {
                    Some(pkg) => self.expr(pkg)?,
                    None => {
                        let package = self.package.clone();
                        let reg = self.scopes.alloc();
                        let idx = self.b.intern_string(&package);
                        self.b.emit2(Opcode::LoadString, reg, idx);
                        reg
                    }
                };
                let reg = self.scopes.alloc();
                self.b.emit3(Opcode::Bless, reg, ref_reg, package_reg);
                Ok(reg)
            }

            Func::Die => {
                let args_reg = self.compile_arg_list(args)?;
                self.b.emit1(Opcode::Die, args_reg);
                // Unreachable, but the expression needs a register.
                let reg = self.scopes.alloc();
                self.b.emit1(Opcode::LoadUndef, reg);
                Ok(reg)
            }

            Func::Warn => {
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Warn, reg, args_reg);
                Ok(reg)
            }

            Func::Require => {
                let (first, _) = split_first(args, "require", line)?;
                let value_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Require, reg, value_reg);
                Ok(reg)
            }

            Func::Rand => {
                let max_reg = match args.first() {
                    Some(max) => self.expr(max)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Rand, reg, max_reg);
                Ok(reg)
            }

            Func::Join => {
                let (first, rest) = split_first(args, "join", line)?;
                let sep_reg = self.expr(first)?;
                let list_reg = self.compile_arg_list(rest)?;
                let reg = self.scopes.alloc();
                self.b.emit3(Opcode::Join, reg, sep_reg, list_reg);
                Ok(reg)
            }

            Func::Length => {
                let (first, _) = split_first(args, "length", line)?;
                let value_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Length, reg, value_reg);
                Ok(reg)
            }

            Func::Substr => {
                let (first, rest) = split_first(args, "substr", line)?;
                let string_reg = self.expr(first)?;
                let offset_reg = match rest.first() {
                    Some(offset) => self.expr(offset)?,
                    None => return Err(CompileError::new("substr needs an offset", line)),
                };
                let len_reg = match rest.get(1) {
                    Some(len) => self.expr(len)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                let reg = self.scopes.alloc();
                self.b.emit4(Opcode::Substr, reg, string_reg, offset_reg, len_reg);
                Ok(reg)
            }

            Func::Reverse => {
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::ArrayReverse, reg, args_reg);
                Ok(reg)
            }

            Func::Splice => {
                let (first, rest) = split_first(args, "splice", line)?;
                let array_reg = self.expr(first)?;
                let offset_reg = match rest.first() {
                    Some(offset) => self.expr(offset)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadInt, reg);
                        self.b.push_imm32(0);
                        reg
                    }
                };
                let len_reg = match rest.get(1) {
                    Some(len) => self.expr(len)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                let replacement_reg = if rest.len() > 2 {
                    self.compile_arg_list(&rest[2..])?
                } else {
                    let reg = self.scopes.alloc();
                    self.b.emit1(Opcode::LoadUndef, reg);
                    reg
                };
                let reg = self.scopes.alloc();
                self.b.emit5(Opcode::ArraySplice, reg, array_reg, offset_reg, len_reg, replacement_reg);
                Ok(reg)
            }

            Func::Sort => {
                let (comparator, rest) = comparator_split(args);
                let code_reg = match comparator {
                    Some(cmp) => self.expr(cmp)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                let list_reg = self.compile_arg_list(rest)?;
                let reg = self.scopes.alloc();
                self.b.emit3(Opcode::Sort, reg, code_reg, list_reg);
                Ok(reg)
            }

            Func::Map | Func::Grep => {
                let (first, rest) = split_first(args, "map", line)?;
                let code_reg = self.expr(first)?;
                let list_reg = self.compile_arg_list(rest)?;
                let reg = self.scopes.alloc();
                let op = if func == Func::Map { Opcode::Map } else { Opcode::Grep };
                self.b.emit3(op, reg, code_reg, list_reg);
                Ok(reg)
            }

            Func::Open => {
                let (first, rest) = split_first(args, "open", line)?;
                let handle_reg = self.expr(first)?;
                let mode_reg = match rest.first() {
                    Some(mode) => self.expr(mode)?,
                    None => return Err(CompileError::new("open needs a mode", line)),
                };
                let path_reg = match rest.get(1) {
                    Some(path) => self.expr(path)?,
                    None => return Err(CompileError::new("open needs a path", line)),
                };
                let reg = self.scopes.alloc();
                self.b.emit4(Opcode::Open, reg, handle_reg, mode_reg, path_reg);
                Ok(reg)
            }

            Func::Readline => {
                let (first, _) = split_first(args, "readline", line)?;
                let handle_reg = self.expr(first)?;
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Readline, reg, handle_reg);
                self.b.push_unit(Context::Runtime.as_unit());
                Ok(reg)
            }

            Func::Select => {
                let handle_reg = match args.first() {
                    Some(handle) => self.expr(handle)?,
                    None => {
                        let reg = self.scopes.alloc();
                        self.b.emit1(Opcode::LoadUndef, reg);
                        reg
                    }
                };
                let reg = self.scopes.alloc();
                self.b.emit2(Opcode::Select, reg, handle_reg);
                Ok(reg)
            }

            // Everything else routes through the builtin table.
            Func::Wantarray
            | Func::Sprintf
            | Func::Split
            | Func::Abs
            | Func::Int
            | Func::Sqrt
            | Func::Uc
            | Func::Lc
            | Func::Ucfirst
            | Func::Lcfirst
            | Func::Chr
            | Func::Ord
            | Func::Hex
            | Func::Oct
            | Func::Index
            | Func::Rindex
            | Func::Chomp
            | Func::Chop => {
                let builtin = builtin_for(func).expect("routed funcs have builtin ids");
                let args_reg = self.compile_arg_list(args)?;
                let reg = self.scopes.alloc();
                self.b.emit4(Opcode::CallBuiltin, reg, builtin as u16, args_reg, Context::Runtime.as_unit());
                Ok(reg)
            }
        }
    }

    // ========================================================================
    // Closures and eval blocks
    // ========================================================================

    fn compile_closure(&mut self, body: &Block) -> Result<u16, CompileError> {
        let visible = self.scopes.visible_names();
        let free = free_vars(body, &visible);

        let code = SubCompiler::compile(body, &free, &self.package, "__ANON__", &self.source, self.b.line())?;
        let cidx = self.b.add_const(Const::Code(code));
        let reg = self.scopes.alloc();

        if free.is_empty() {
            self.b.emit2(Opcode::LoadConst, reg, cidx);
            return Ok(reg);
        }

        let mut capture_regs = Vec::with_capacity(free.len());
        for name in &free {
            let captured = self.scopes.lookup(name).ok_or_else(|| {
                CompileError::new(format!("cannot capture {name}: not in scope"), self.b.line())
            })?;
            capture_regs.push(captured);
        }
        self.b.emit2(Opcode::CreateClosure, reg, cidx);
        self.b.push_unit(capture_regs.len() as u16);
        for captured in capture_regs {
            self.b.push_unit(captured);
        }
        Ok(reg)
    }

    /// `eval { ... }`: push a handler around the body; the catch site
    /// yields undef and the error variable carries the message.
    fn compile_eval_block(&mut self, body: &Block) -> Result<u16, CompileError> {
        let reg = self.scopes.alloc();
        let try_label = self.b.emit_eval_try();

        let body_reg = self.block(body)?;
        match body_reg {
            Some(body_reg) => self.b.emit2(Opcode::Move, reg, body_reg),
            None => self.b.emit1(Opcode::LoadUndef, reg),
        }
        self.b.emit(Opcode::EvalEnd);
        let to_end = self.b.emit_jump(Opcode::Goto);

        self.b.patch_eval_try(try_label);
        self.b.emit1(Opcode::EvalCatch, reg);
        self.b.patch_jump(to_end);
        Ok(reg)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Evaluates expressions and flattens them into one list register.
    fn compile_arg_list(&mut self, args: &[Expr]) -> Result<u16, CompileError> {
        let regs: Vec<u16> = args.iter().map(|e| self.expr(e)).collect::<Result<_, _>>()?;
        let reg = self.scopes.alloc();
        self.emit_create_list(reg, &regs);
        Ok(reg)
    }

    fn emit_create_list(&mut self, reg: u16, regs: &[u16]) {
        self.b.emit1(Opcode::CreateList, reg);
        self.b.push_unit(regs.len() as u16);
        for &r in regs {
            self.b.push_unit(r);
        }
    }
}

/// True for lvalues whose compiled register holds the live scalar cell,
/// so in-place superinstructions can mutate through it.
fn is_cell_lvalue(target: &Expr) -> bool {
    matches!(
        target,
        Expr::Var(_) | Expr::Global(_) | Expr::Deref { sigil: Sigil::Scalar, .. }
    )
}

/// True for expressions whose statement-position result can carry a
/// control-flow marker out of a callee.
fn expr_can_return_marker(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Call { .. } | Expr::DynCall { .. } | Expr::MethodCall { .. } | Expr::EvalStr(_)
    )
}

fn split_first<'a>(args: &'a [Expr], what: &str, line: u32) -> Result<(&'a Expr, &'a [Expr]), CompileError> {
    args.split_first()
        .ok_or_else(|| CompileError::new(format!("{what} needs an argument"), line))
}

/// `sort { ... } LIST` passes the block as the first argument; a plain
/// `sort LIST` has no comparator. A scalar variable in comparator
/// position is a coderef comparator.
fn comparator_split(args: &[Expr]) -> (Option<&Expr>, &[Expr]) {
    match args.split_first() {
        Some((first @ Expr::AnonSub { .. }, rest)) => (Some(first), rest),
        Some((first @ Expr::Var(name), rest)) if name.starts_with('$') && !rest.is_empty() => (Some(first), rest),
        _ => (None, args),
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Pow => Opcode::Pow,
        BinOp::Concat => Opcode::Concat,
        BinOp::Repeat => Opcode::Repeat,
        BinOp::NumEq => Opcode::NumEq,
        BinOp::NumNe => Opcode::NumNe,
        BinOp::NumLt => Opcode::NumLt,
        BinOp::NumGt => Opcode::NumGt,
        BinOp::NumLe => Opcode::NumLe,
        BinOp::NumGe => Opcode::NumGe,
        BinOp::NumCmp => Opcode::NumCmp,
        BinOp::StrEq => Opcode::StrEq,
        BinOp::StrNe => Opcode::StrNe,
        BinOp::StrLt => Opcode::StrLt,
        BinOp::StrGt => Opcode::StrGt,
        BinOp::StrLe => Opcode::StrLe,
        BinOp::StrGe => Opcode::StrGe,
        BinOp::StrCmp => Opcode::StrCmp,
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
            unreachable!("bitwise operators route through CALL_BUILTIN")
        }
    }
}

fn bitwise_builtin(op: BinOp) -> Option<Builtin> {
    match op {
        BinOp::BitAnd => Some(Builtin::BitAnd),
        BinOp::BitOr => Some(Builtin::BitOr),
        BinOp::BitXor => Some(Builtin::BitXor),
        BinOp::Shl => Some(Builtin::Shl),
        BinOp::Shr => Some(Builtin::Shr),
        _ => None,
    }
}

fn builtin_for(func: Func) -> Option<Builtin> {
    match func {
        Func::Wantarray => Some(Builtin::Wantarray),
        Func::Sprintf => Some(Builtin::Sprintf),
        Func::Split => Some(Builtin::Split),
        Func::Abs => Some(Builtin::Abs),
        Func::Int => Some(Builtin::Int),
        Func::Sqrt => Some(Builtin::Sqrt),
        Func::Uc => Some(Builtin::Uc),
        Func::Lc => Some(Builtin::Lc),
        Func::Ucfirst => Some(Builtin::Ucfirst),
        Func::Lcfirst => Some(Builtin::Lcfirst),
        Func::Chr => Some(Builtin::Chr),
        Func::Ord => Some(Builtin::Ord),
        Func::Hex => Some(Builtin::Hex),
        Func::Oct => Some(Builtin::Oct),
        Func::Index => Some(Builtin::Index),
        Func::Rindex => Some(Builtin::Rindex),
        Func::Chomp => Some(Builtin::Chomp),
        Func::Chop => Some(Builtin::Chop),
        _ => None,
    }
}

// ============================================================================
// Free-variable analysis
// ============================================================================

/// Computes the ordered capture list for a sub body: names used but not
/// declared inside it that the enclosing lexical environment can supply.
fn free_vars(body: &Block, visible: &AHashSet<String>) -> Vec<String> {
    let mut scan = FreeVarScan {
        declared: AHashSet::new(),
        free: Vec::new(),
        visible,
    };
    scan.block(body);
    scan.free
}

struct FreeVarScan<'a> {
    declared: AHashSet<String>,
    free: Vec<String>,
    visible: &'a AHashSet<String>,
}

impl FreeVarScan<'_> {
    fn note_use(&mut self, name: &str) {
        if !self.declared.contains(name) && self.visible.contains(name) && !self.free.iter().any(|f| f == name) {
            self.free.push(name.to_owned());
        }
    }

    fn block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) | StmtKind::Return(Some(e)) => self.expr(e),
            StmtKind::My { names, init } => {
                if let Some(init) = init {
                    self.expr(init);
                }
                for name in names {
                    self.declared.insert(name.clone());
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.expr(cond);
                self.block(then_block);
                if let Some(else_block) = else_block {
                    self.block(else_block);
                }
            }
            StmtKind::While { cond, body, .. } => {
                self.expr(cond);
                self.block(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                for e in [init, cond, step].into_iter().flatten() {
                    self.expr(e);
                }
                self.block(body);
            }
            StmtKind::Foreach { var, list, body, .. } => {
                self.expr(list);
                if let Some(var) = var {
                    self.declared.insert(var.clone());
                }
                self.block(body);
            }
            StmtKind::Block { body, .. } => self.block(body),
            StmtKind::Goto(GotoTarget::Sub(e)) => self.expr(e),
            StmtKind::SubDef { body, .. } => self.nested_sub(body),
            StmtKind::Labeled { stmt, .. } => self.stmt(stmt),
            StmtKind::Return(None)
            | StmtKind::Local { .. }
            | StmtKind::Last { .. }
            | StmtKind::Next { .. }
            | StmtKind::Redo { .. }
            | StmtKind::Package { .. }
            | StmtKind::Goto(GotoTarget::Label(_)) => {}
        }
    }

    /// A nested sub's free variables become uses here: anything it needs
    /// that we don't declare must be captured from our own environment.
    fn nested_sub(&mut self, body: &Block) {
        let mut inner_visible: AHashSet<String> = self.visible.clone();
        inner_visible.extend(self.declared.iter().cloned());
        inner_visible.extend(self.free.iter().cloned());
        for name in free_vars(body, &inner_visible) {
            self.note_use(&name);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Var(name) => self.note_use(name),
            Expr::Undef | Expr::Int(_) | Expr::Num(_) | Expr::Str(_) | Expr::Global(_) => {}
            Expr::Elem { container, index, .. } => {
                self.expr(container);
                self.expr(index);
            }
            Expr::Slice {
                container, indices, ..
            } => {
                self.expr(container);
                self.expr(indices);
            }
            Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond);
                self.expr(then_expr);
                self.expr(else_expr);
            }
            Expr::Assign { target, value } | Expr::CompoundAssign { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            Expr::PreIncr(e) | Expr::PostIncr(e) | Expr::PreDecr(e) | Expr::PostDecr(e) => self.expr(e),
            Expr::List(items) | Expr::AnonArray(items) | Expr::AnonHash(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            Expr::Range { lo, hi } => {
                self.expr(lo);
                self.expr(hi);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::DynCall { callee, args } => {
                self.expr(callee);
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::MethodCall {
                invocant,
                method,
                args,
            } => {
                self.expr(invocant);
                if let Method::Dynamic(m) = method {
                    self.expr(m);
                }
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::Func { args, .. } => {
                for arg in args {
                    self.expr(arg);
                }
            }
            Expr::AnonSub { body } => self.nested_sub(body),
            Expr::Eval { body } => self.block(body),
            Expr::EvalStr(e) | Expr::Ref(e) => self.expr(e),
            Expr::Deref { expr, .. } => self.expr(expr),
            Expr::Isa { object, class } => {
                self.expr(object);
                self.expr(class);
            }
        }
    }
}

/// Collects every statement label in a sub (not descending into nested
/// subs), so `goto` emission can pick direct jumps for local targets.
fn collect_labels(body: &Block) -> AHashSet<String> {
    fn walk(block: &Block, out: &mut AHashSet<String>) {
        for stmt in &block.stmts {
            match &stmt.kind {
                StmtKind::Labeled { label, stmt } => {
                    out.insert(label.clone());
                    walk(&Block::new(vec![(**stmt).clone()]), out);
                }
                StmtKind::If {
                    then_block, else_block, ..
                } => {
                    walk(then_block, out);
                    if let Some(else_block) = else_block {
                        walk(else_block, out);
                    }
                }
                StmtKind::While { label, body, .. }
                | StmtKind::For { label, body, .. }
                | StmtKind::Foreach { label, body, .. }
                | StmtKind::Block { label, body } => {
                    if let Some(label) = label {
                        out.insert(label.clone());
                    }
                    walk(body, out);
                }
                _ => {}
            }
        }
    }
    let mut out = AHashSet::new();
    walk(body, &mut out);
    out
}

// ============================================================================
// Errors
// ============================================================================

/// A compile-time failure: malformed tree, bad lvalue, capture of an
/// out-of-scope name, or a bytecode-format limit. No code object is
/// produced.
#[derive(Debug, Clone)]
pub struct CompileError {
    message: Cow<'static, str>,
    line: u32,
}

impl CompileError {
    fn new(message: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}", self.message, self.line)
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_unit_returns_undef() {
        let code = Compiler::compile_unit(&Block::default(), "test.pl", 1).unwrap();
        // LOAD_UNDEF r3; RETURN r3
        assert_eq!(
            code.units(),
            &[Opcode::LoadUndef as u16, 3, Opcode::Return as u16, 3]
        );
    }

    #[test]
    fn test_literal_int_uses_immediate() {
        let unit = Block::new(vec![Stmt::expr(1, Expr::Int(70000))]);
        let code = Compiler::compile_unit(&unit, "test.pl", 1).unwrap();
        assert_eq!(code.units()[0], Opcode::LoadInt as u16);
        // 70000 = 0x0001_1170 big-endian across two units.
        assert_eq!(&code.units()[2..4], &[0x0001, 0x1170]);
    }

    #[test]
    fn test_string_pool_dedup_across_uses() {
        let unit = Block::new(vec![
            Stmt::expr(1, Expr::str("hello")),
            Stmt::expr(2, Expr::str("hello")),
        ]);
        let code = Compiler::compile_unit(&unit, "test.pl", 1).unwrap();
        let loads: Vec<u16> = code
            .units()
            .windows(3)
            .filter(|w| w[0] == Opcode::LoadString as u16)
            .map(|w| w[2])
            .collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0], loads[1], "same string must share a pool index");
    }

    #[test]
    fn test_free_var_scan_finds_transitive_captures() {
        // sub { sub { $x } } where $x is visible outside.
        let mut visible = AHashSet::new();
        visible.insert("$x".to_owned());
        let inner = Expr::AnonSub {
            body: Block::new(vec![Stmt::expr(1, Expr::var("$x"))]),
        };
        let body = Block::new(vec![Stmt::expr(1, inner)]);
        assert_eq!(free_vars(&body, &visible), vec!["$x".to_owned()]);
    }

    #[test]
    fn test_free_var_scan_skips_locally_declared() {
        let mut visible = AHashSet::new();
        visible.insert("$x".to_owned());
        let body = Block::new(vec![
            Stmt::new(
                1,
                StmtKind::My {
                    names: vec!["$x".to_owned()],
                    init: None,
                },
            ),
            Stmt::expr(2, Expr::var("$x")),
        ]);
        assert!(free_vars(&body, &visible).is_empty());
    }

    #[test]
    fn test_undeclared_scalar_falls_back_to_global() {
        let unit = Block::new(vec![Stmt::expr(1, Expr::var("$x"))]);
        let code = Compiler::compile_unit(&unit, "test.pl", 1).unwrap();
        assert_eq!(code.units()[0], Opcode::LoadGlobal as u16);
        let idx = code.units()[2];
        assert_eq!(&**code.string_at(idx).unwrap(), "main::x");
    }

    #[test]
    fn test_label_not_found_is_an_error() {
        // goto into a label that exists nowhere emits the marker form, so
        // this compiles; a *pending* local label that never lands errors.
        let unit = Block::new(vec![Stmt::new(
            1,
            StmtKind::Goto(GotoTarget::Label("NOWHERE".to_owned())),
        )]);
        assert!(Compiler::compile_unit(&unit, "test.pl", 1).is_ok());
    }
}
