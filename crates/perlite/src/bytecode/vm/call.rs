//! Call dispatch helpers for the VM: sub calls, method resolution, the
//! builtin table, and the code-taking list operators (map/grep/sort).
//!
//! Method dispatch and comparator calls go through the same
//! `CodeValue::apply` surface as everything else, so interpreted and
//! native subs are interchangeable in every position.

use std::cmp::Ordering;
use std::rc::Rc;

use super::{Flow, Frame};
use crate::builtins::{self, Builtin};
use crate::code::CodeValue;
use crate::context::Context;
use crate::interp::Interp;
use crate::runtime::error::RunError;
use crate::runtime::scalar::ScalarCell;
use crate::runtime::value::Value;

impl Frame<'_> {
    /// `CALL_SUB rd, rf, rargs, ctx`.
    pub(super) fn call_sub(&mut self, interp: &mut Interp) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rf = self.fetch()?;
        let rargs = self.fetch()?;
        let ctx = self.fetch_ctx()?;
        let code = self.value(rf)?.as_code().map_err(Flow::Error)?;
        let args = self.value(rargs)?.clone();
        let result = code.apply(interp, args, ctx)?;
        // Markers land in rd; the compiler emitted the handling (or the
        // next observer propagates).
        self.set_reg(rd, result)
    }

    /// `CALL_METHOD rd, rinv, rmeth, rargs, ctx`.
    ///
    /// The invocant decides the package: a blessed reference dispatches on
    /// its package, a plain string is a class-method call. Resolution
    /// walks `@ISA` in the symbol table.
    pub(super) fn call_method(&mut self, interp: &mut Interp) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rinv = self.fetch()?;
        let rmeth = self.fetch()?;
        let rargs = self.fetch()?;
        let ctx = self.fetch_ctx()?;

        let method = self.scalar_val(rmeth)?;
        let args = self.value(rargs)?.clone();

        // A coderef in method position calls directly.
        if let Some(code) = method.as_code() {
            let result = code.apply(interp, args, ctx)?;
            return self.set_reg(rd, result);
        }

        let invocant = self.scalar_val(rinv)?;
        let package = invocant
            .blessed_package()
            .map_or_else(|| invocant.to_text(), |p| p.to_string());
        let name = method.to_text();
        let code = interp
            .symbols_mut()
            .resolve_method(&package, &name)
            .ok_or_else(|| {
                RunError::msg(format!(
                    "Can't locate object method \"{name}\" via package \"{package}\""
                ))
            })?;
        let result = code.apply_sub(&format!("{package}::{name}"), interp, args, ctx)?;
        self.set_reg(rd, result)
    }

    /// `CALL_BUILTIN rd, id, rargs, ctx`. The context operand is part of
    /// the encoding but the builtin table only consults the frame's own
    /// context (for `wantarray`).
    pub(super) fn call_builtin(&mut self) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let id = self.fetch()?;
        let rargs = self.fetch()?;
        let _ = self.fetch_ctx()?;
        let builtin = Builtin::from_unit(id).ok_or_else(|| Flow::Error(self.bug(format!("unknown builtin id {id}"))))?;
        let args = self.list_arg(rargs)?;
        log::trace!("builtin {}", builtin.name());
        let result = builtins::call(builtin, &args, self.ctx)?;
        self.set_reg(rd, result)
    }

    // ========================================================================
    // map / grep / sort
    // ========================================================================

    /// Runs `code` once per element with `$_` mirroring the element cell:
    /// copied in before the call, copied back after, so blocks that
    /// mutate `$_` update the source list.
    fn with_topic<T>(
        interp: &mut Interp,
        code: &CodeValue,
        items: &[ScalarCell],
        mut each: impl FnMut(&mut Interp, &CodeValue, &ScalarCell) -> Result<T, RunError>,
        mut collect: impl FnMut(T, &ScalarCell),
    ) -> Result<(), RunError> {
        let topic = interp.symbols_mut().get_scalar("main::_");
        let saved = topic.borrow().clone();
        let mut failure = None;
        for item in items {
            *topic.borrow_mut() = item.borrow().clone();
            match each(interp, code, item) {
                Ok(value) => {
                    *item.borrow_mut() = topic.borrow().clone();
                    collect(value, item);
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        *topic.borrow_mut() = saved;
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// `MAP rd, rf, rlist`: list-context results, flattened.
    pub(super) fn call_map(&mut self, interp: &mut Interp) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rf = self.fetch()?;
        let rlist = self.fetch()?;
        let code = self.value(rf)?.as_code().map_err(Flow::Error)?;
        let items = self.list_arg(rlist)?;

        let mut out: Vec<ScalarCell> = Vec::new();
        Self::with_topic(
            interp,
            &code,
            &items,
            |interp, code, item| {
                let args = Value::list(vec![Rc::clone(item)]);
                code.apply(interp, args, Context::List)
            },
            |result, _| out.extend(result.flatten()),
        )?;
        self.set_reg(rd, Value::list(out))
    }

    /// `GREP rd, rf, rlist`: elements whose scalar-context result is true.
    pub(super) fn call_grep(&mut self, interp: &mut Interp) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rf = self.fetch()?;
        let rlist = self.fetch()?;
        let code = self.value(rf)?.as_code().map_err(Flow::Error)?;
        let items = self.list_arg(rlist)?;

        let mut out: Vec<ScalarCell> = Vec::new();
        Self::with_topic(
            interp,
            &code,
            &items,
            |interp, code, item| {
                let args = Value::list(vec![Rc::clone(item)]);
                code.apply(interp, args, Context::Scalar)
            },
            |result, item| {
                if result.truthy() {
                    out.push(Rc::clone(item));
                }
            },
        )?;
        self.set_reg(rd, Value::list(out))
    }

    /// `SORT rd, rf, rlist`: string sort without a comparator, otherwise
    /// the comparator sees each pair through the global `$a`/`$b`.
    pub(super) fn call_sort(&mut self, interp: &mut Interp) -> Result<(), Flow> {
        let rd = self.fetch()?;
        let rf = self.fetch()?;
        let rlist = self.fetch()?;
        let comparator = match self.value(rf)? {
            Value::Scalar(c) if !c.borrow().defined() => None,
            other => Some(other.as_code().map_err(Flow::Error)?),
        };
        let mut items = self.list_arg(rlist)?;

        match comparator {
            None => {
                items.sort_by(|x, y| x.borrow().to_text().cmp(&y.borrow().to_text()));
            }
            Some(code) => {
                let a_cell = interp.symbols_mut().get_scalar("main::a");
                let b_cell = interp.symbols_mut().get_scalar("main::b");
                let saved_a = a_cell.borrow().clone();
                let saved_b = b_cell.borrow().clone();

                let mut failure: Option<RunError> = None;
                items.sort_by(|x, y| {
                    if failure.is_some() {
                        return Ordering::Equal;
                    }
                    *a_cell.borrow_mut() = x.borrow().clone();
                    *b_cell.borrow_mut() = y.borrow().clone();
                    match code.apply(interp, Value::empty_list(), Context::Scalar) {
                        Ok(result) => {
                            let n = result.scalarize().to_int();
                            n.cmp(&0)
                        }
                        Err(error) => {
                            failure = Some(error);
                            Ordering::Equal
                        }
                    }
                });

                *a_cell.borrow_mut() = saved_a;
                *b_cell.borrow_mut() = saved_b;
                if let Some(error) = failure {
                    return Err(Flow::Error(error));
                }
            }
        }

        // Sorted output is a fresh list of the same cells.
        self.set_reg(rd, Value::list(items))
    }
}
