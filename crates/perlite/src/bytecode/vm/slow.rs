//! The cold-path dispatch table.
//!
//! `SLOW_OP` routes rarely-executed operations through this secondary
//! match so the main loop's hot switch stays small. Each sub-op reads its
//! own operands. Process shims the host cannot support fail with a
//! catchable error and set the errno variable, as the platform contract
//! requires.

use crate::bytecode::op::SlowOp;
use crate::interp::Interp;
use crate::runtime::error::RunError;
use crate::runtime::scalar::Scalar;
use crate::runtime::value::Value;

use super::{Flow, Frame};

impl Frame<'_> {
    pub(super) fn slow_op(&mut self, interp: &mut Interp, sub_id: u16) -> Result<(), Flow> {
        let Some(sub) = SlowOp::from_unit(sub_id) else {
            return Err(Flow::Error(self.bug(format!("unknown slow op {sub_id}"))));
        };
        log::trace!("slow op {}", sub.name());

        match sub {
            SlowOp::EvalString => {
                let rd = self.fetch()?;
                let rsrc = self.fetch()?;
                let ctx = self.fetch_ctx()?;
                let source = self.scalar_val(rsrc)?.to_text();
                let line = self.line();
                // Dynamic eval catches its own failures, including compile
                // errors from the frontend, reporting them through the
                // error variable like an eval block would.
                match interp.compile_and_run(&source, "(eval)", line, Value::empty_list(), ctx) {
                    Ok(value) => {
                        interp.clear_error();
                        self.set_reg(rd, value)?;
                    }
                    Err(error) => {
                        let located = error.ensure_located(self.location());
                        interp.set_error(located.catch_value());
                        self.set_reg(rd, Value::undef())?;
                    }
                }
            }

            SlowOp::PhaseScalar => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let phase = self.fetch()? as u32;
                let found = interp.phase_store().scalar(&name, phase).ok_or_else(|| {
                    RunError::msg(format!("No persistent scalar {name} for phase {phase}"))
                })?;
                self.set_reg(rd, Value::Scalar(found))?;
            }

            SlowOp::PhaseArray => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let phase = self.fetch()? as u32;
                let found = interp.phase_store().array(&name, phase).ok_or_else(|| {
                    RunError::msg(format!("No persistent array {name} for phase {phase}"))
                })?;
                self.set_reg(rd, Value::Array(found))?;
            }

            SlowOp::PhaseHash => {
                let rd = self.fetch()?;
                let name = self.string_operand()?;
                let phase = self.fetch()? as u32;
                let found = interp.phase_store().hash(&name, phase).ok_or_else(|| {
                    RunError::msg(format!("No persistent hash {name} for phase {phase}"))
                })?;
                self.set_reg(rd, Value::Hash(found))?;
            }

            SlowOp::LocalSave => {
                let name = self.string_operand()?;
                let cell = interp.symbols_mut().get_scalar(&name);
                interp.local_save(cell);
            }

            SlowOp::LocalRestore => {
                let count = self.fetch()? as usize;
                interp.local_restore(count);
            }

            SlowOp::ArrayAssign => {
                let ra = self.fetch()?;
                let rlist = self.fetch()?;
                // List assignment copies values into fresh cells; the
                // source keeps its own.
                let cells = self.list_copy(rlist)?;
                let array = self.array_lvalue(ra)?;
                array.borrow_mut().assign(cells);
            }

            SlowOp::HashAssign => {
                let rh = self.fetch()?;
                let rlist = self.fetch()?;
                let cells = self.list_arg(rlist)?;
                let hash = self.hash_lvalue(rh)?;
                hash.borrow_mut().assign(&cells);
            }

            SlowOp::IterRest => {
                let rd = self.fetch()?;
                let rit = self.fetch()?;
                let rest = match self.reg(rit)? {
                    Value::Iter(it) => it.borrow_mut().rest(),
                    _ => return Err(Flow::Error(self.bug("expected an iterator register".to_owned()))),
                };
                self.set_reg(rd, Value::list(rest))?;
            }

            SlowOp::Fork | SlowOp::Waitpid | SlowOp::Getppid | SlowOp::Getpriority | SlowOp::Setpriority => {
                let _rd = self.fetch()?;
                interp.set_errno(Scalar::str("Function not implemented"));
                return Err(Flow::Error(RunError::msg(format!(
                    "{} is not supported on this platform",
                    sub.name()
                ))));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::bytecode::builder::CodeBuilder;
    use crate::bytecode::code::Code;
    use crate::bytecode::op::{Opcode, SlowOp};
    use crate::bytecode::vm;
    use crate::context::Context;
    use crate::interp::Interp;
    use crate::runtime::value::Value;

    #[test]
    fn test_unsupported_shim_sets_errno_and_is_catchable() {
        let mut b = CodeBuilder::new();
        // eval { fork() }
        let try_label = b.emit_eval_try();
        b.emit_slow(SlowOp::Fork);
        b.push_unit(3);
        b.emit2(Opcode::Move, 4, 3);
        b.emit(Opcode::EvalEnd);
        let to_end = b.emit_jump(Opcode::Goto);
        b.patch_eval_try(try_label);
        b.emit1(Opcode::EvalCatch, 4);
        b.patch_jump(to_end);
        b.emit1(Opcode::Return, 4);

        let body = b.build(5, 0, Rc::from("t.pl"), 1, Rc::from("main"), Rc::from("t"));
        let code = Code::new(body);
        let mut interp = Interp::new();
        let result = vm::run(&mut interp, &code, Value::empty_list(), Context::Scalar).unwrap();
        assert!(!result.defined(), "eval result is undef after the failure");
        assert!(interp.error_value().to_text().contains("FORK is not supported"));

        let errno = interp.symbols_mut().get_scalar("main::!");
        assert_eq!(errno.borrow().to_text(), "Function not implemented");
    }
}
