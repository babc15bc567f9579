//! The engine: process-wide state and the top-level entry points.
//!
//! An [`Interp`] owns everything invocations share: the global symbol
//! table, the error and errno variables, the selected output handle, the
//! phase-variable store, the dynamic-scope save stack, and the optional
//! host [`Frontend`] that turns source text into ASTs. Register files are
//! per-invocation and live in the dispatch loop, not here.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ast::Block;
use crate::bytecode::compiler::Compiler;
use crate::code::CodeValue;
use crate::context::Context;
use crate::runtime::error::RunError;
use crate::runtime::io::{handle_ref, FileHandle, HandleRef};
use crate::runtime::ops::Rng;
use crate::runtime::phase::PhaseStore;
use crate::runtime::scalar::{Scalar, ScalarCell};
use crate::runtime::symbols::SymbolTable;
use crate::runtime::value::Value;

/// Default nesting-depth guard for runaway recursion.
const DEFAULT_MAX_DEPTH: usize = 4096;

/// Host-installed source frontend.
///
/// The lexer and parser live outside the core; `compile_and_run` and
/// dynamic `eval` on strings call back through this trait. The error
/// string becomes a catchable runtime error.
pub trait Frontend {
    /// Parses source text starting at `line` of `source_name`.
    fn parse(&self, source: &str, source_name: &str, line: u32) -> Result<Block, String>;
}

/// One saved `local` binding: the global cell and its previous value.
#[derive(Debug)]
pub(crate) struct LocalSave {
    pub cell: ScalarCell,
    pub saved: Scalar,
}

/// The engine state shared by every invocation.
pub struct Interp {
    symbols: SymbolTable,
    /// The error variable (`$@`); also installed as `main::@`.
    error_var: ScalarCell,
    /// The errno variable (`$!`); also installed as `main::!`.
    errno_var: ScalarCell,
    /// Currently selected output handle.
    selected: HandleRef,
    /// Warning destination.
    stderr: HandleRef,
    frontend: Option<Box<dyn Frontend>>,
    phase: PhaseStore,
    /// Dynamic-scope saves, unwound by `LOCAL_RESTORE` and at frame exit.
    local_saves: Vec<LocalSave>,
    rng: Rng,
    /// Current call depth, guarded against runaway recursion.
    depth: usize,
    max_depth: usize,
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    #[must_use]
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        let error_var = symbols.get_scalar("main::@");
        let errno_var = symbols.get_scalar("main::!");
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0x9e37_79b9, |d| d.as_nanos() as u64);
        Self {
            symbols,
            error_var,
            errno_var,
            selected: handle_ref(FileHandle::Stdout),
            stderr: handle_ref(FileHandle::Stderr),
            frontend: None,
            phase: PhaseStore::new(),
            local_saves: Vec::new(),
            rng: Rng::new(seed),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    // ========================================================================
    // Shared state access
    // ========================================================================

    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Sets the error variable after a catch.
    pub fn set_error(&mut self, value: Scalar) {
        *self.error_var.borrow_mut() = value;
    }

    /// Clears the error variable (successful eval exit).
    pub fn clear_error(&mut self) {
        *self.error_var.borrow_mut() = Scalar::str("");
    }

    /// The current error-variable contents.
    #[must_use]
    pub fn error_value(&self) -> Scalar {
        self.error_var.borrow().clone()
    }

    /// Sets the errno variable (platform-unavailable slow ops).
    pub fn set_errno(&mut self, value: Scalar) {
        *self.errno_var.borrow_mut() = value;
    }

    #[must_use]
    pub fn selected_handle(&self) -> HandleRef {
        Rc::clone(&self.selected)
    }

    /// Selects a new output handle, returning the previous one.
    pub fn select_handle(&mut self, handle: HandleRef) -> HandleRef {
        std::mem::replace(&mut self.selected, handle)
    }

    /// Replaces the selected handle with a capture buffer and returns it.
    /// The capture's text is readable via [`crate::runtime::io::capture_text`].
    pub fn capture_output(&mut self) -> HandleRef {
        let capture = handle_ref(FileHandle::Capture(String::new()));
        self.selected = Rc::clone(&capture);
        capture
    }

    /// Writes a warning to the warning handler.
    pub fn emit_warning(&mut self, text: &str) {
        if let Err(err) = self.stderr.borrow_mut().write_str(text) {
            log::warn!("warning handler failed: {err}");
        }
    }

    /// Redirects warnings (tests, embedders).
    pub fn set_warning_handle(&mut self, handle: HandleRef) {
        self.stderr = handle;
    }

    pub fn set_frontend(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    #[must_use]
    pub fn phase_store(&self) -> &PhaseStore {
        &self.phase
    }

    pub fn phase_store_mut(&mut self) -> &mut PhaseStore {
        &mut self.phase
    }

    /// Uniform random number in `[0, max)`.
    pub fn rand(&mut self, max: f64) -> f64 {
        self.rng.next_f64() * max
    }

    // ========================================================================
    // Dynamic scope (`local`)
    // ========================================================================

    /// Saves a global cell's value for later restoration, setting it to
    /// undef.
    pub(crate) fn local_save(&mut self, cell: ScalarCell) {
        let saved = std::mem::take(&mut *cell.borrow_mut());
        self.local_saves.push(LocalSave { cell, saved });
    }

    /// Restores the most recent `count` saves.
    pub(crate) fn local_restore(&mut self, count: usize) {
        for _ in 0..count {
            let Some(save) = self.local_saves.pop() else { break };
            *save.cell.borrow_mut() = save.saved;
        }
    }

    /// The current save-stack depth; frames snapshot this on entry and
    /// restore down to it on any exit, so exceptions unwind `local` too.
    #[must_use]
    pub(crate) fn local_mark(&self) -> usize {
        self.local_saves.len()
    }

    pub(crate) fn local_unwind_to(&mut self, mark: usize) {
        while self.local_saves.len() > mark {
            self.local_restore(1);
        }
    }

    // ========================================================================
    // Recursion guard
    // ========================================================================

    pub(crate) fn enter_call(&mut self) -> Result<(), RunError> {
        if self.depth >= self.max_depth {
            return Err(RunError::msg(format!(
                "Deep recursion: call depth exceeds {}",
                self.max_depth
            )));
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Compiles an AST unit and runs it.
    ///
    /// This is the AST-level twin of [`Interp::compile_and_run`] for hosts
    /// that drive the parser themselves.
    pub fn run_unit(
        &mut self,
        unit: &Block,
        source_name: &str,
        line: u32,
        args: Value,
        ctx: Context,
    ) -> Result<Value, RunError> {
        let code = Compiler::compile_unit(unit, source_name, line)
            .map_err(|e| RunError::msg(e.to_string()))?;
        let result = CodeValue::Interpreted(code).apply(self, args, ctx)?;
        // A loop-control marker that escapes the whole unit is a user
        // error, not a value.
        if let Some(marker) = result.as_control() {
            return Err(RunError::msg(format!(
                "Can't \"{}\" outside a loop block",
                marker.keyword()
            )));
        }
        Ok(result)
    }

    /// The top-level shim: parse source text through the installed
    /// frontend, compile, and run. Used by test harnesses and by dynamic
    /// `eval` on strings.
    pub fn compile_and_run(
        &mut self,
        source: &str,
        source_name: &str,
        line: u32,
        args: Value,
        ctx: Context,
    ) -> Result<Value, RunError> {
        let Some(frontend) = &self.frontend else {
            return Err(RunError::msg("no frontend installed: cannot compile source text"));
        };
        let unit = frontend.parse(source, source_name, line).map_err(RunError::msg)?;
        log::debug!("compiled eval source from {source_name}:{line}");
        self.run_unit(&unit, source_name, line, args, ctx)
    }
}

impl std::fmt::Debug for Interp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interp")
            .field("depth", &self.depth)
            .field("local_saves", &self.local_saves.len())
            .field("has_frontend", &self.frontend.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_var_is_global_alias() {
        let mut interp = Interp::new();
        interp.set_error(Scalar::str("boom\n"));
        let through_table = interp.symbols_mut().get_scalar("main::@");
        assert_eq!(through_table.borrow().to_text(), "boom\n");
        interp.clear_error();
        assert_eq!(through_table.borrow().to_text(), "");
    }

    #[test]
    fn test_local_save_restore() {
        let mut interp = Interp::new();
        let cell = interp.symbols_mut().get_scalar("main::x");
        *cell.borrow_mut() = Scalar::Int(1);

        let mark = interp.local_mark();
        interp.local_save(Rc::clone(&cell));
        assert!(!cell.borrow().defined());
        *cell.borrow_mut() = Scalar::Int(2);
        interp.local_unwind_to(mark);
        assert_eq!(cell.borrow().to_int(), 1);
    }

    #[test]
    fn test_compile_and_run_without_frontend_fails() {
        let mut interp = Interp::new();
        let err = interp
            .compile_and_run("1 + 1", "eval", 1, Value::empty_list(), Context::Scalar)
            .unwrap_err();
        assert!(err.message().contains("no frontend"));
    }
}
