//! perlite: a bytecode compiler and register-machine interpreter for a
//! Perl-flavored, dynamically-typed language.
//!
//! The pipeline: a host-supplied parser produces an [`ast`] tree, the
//! [`bytecode::compiler`] lowers it to an immutable code object (a 16-bit
//! instruction stream plus pools and metadata), and the switch-dispatched
//! interpreter in [`bytecode::vm`] executes it over a register file.
//! Interpreted and native-compiled subroutines share one `apply`
//! interface ([`CodeValue`]) and one runtime value layer, so they are
//! interchangeable at every call site, including method dispatch.
//!
//! Non-local control (`last`/`next`/`redo`/`goto`/tail calls) travels as
//! control-flow marker values through normal returns; `eval` blocks catch
//! host-level errors through a per-invocation handler stack and report
//! them in the error variable.
//!
//! ```
//! use perlite::{ast, Context, Interp, Value};
//!
//! // my $x = 10 + 20;  $x
//! let unit = ast::Block::new(vec![
//!     ast::Stmt::new(1, ast::StmtKind::My {
//!         names: vec!["$x".to_owned()],
//!         init: Some(ast::Expr::Binary {
//!             op: ast::BinOp::Add,
//!             lhs: ast::Expr::Int(10).boxed(),
//!             rhs: ast::Expr::Int(20).boxed(),
//!         }),
//!     }),
//!     ast::Stmt::expr(2, ast::Expr::var("$x")),
//! ]);
//!
//! let mut interp = Interp::new();
//! let result = interp
//!     .run_unit(&unit, "example.pl", 1, Value::empty_list(), Context::Scalar)
//!     .unwrap();
//! assert_eq!(result.scalarize().to_int(), 30);
//! ```

pub mod ast;
pub mod builtins;
pub mod bytecode;
mod code;
mod context;
mod interp;
pub mod runtime;

pub use crate::{
    bytecode::code::{Code, Const},
    bytecode::compiler::{CompileError, Compiler},
    bytecode::op::{Opcode, SlowOp},
    code::{CodeValue, NativeFn, NativeSub},
    context::Context,
    interp::{Frontend, Interp},
    runtime::control::{ControlFlow, ControlKind},
    runtime::error::{DieLocation, RunError},
    runtime::scalar::{Scalar, ScalarCell},
    runtime::value::Value,
};
