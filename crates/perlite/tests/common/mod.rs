//! Shared AST-building helpers for the integration tests.
//!
//! The parser is out of scope, so tests construct the prepared trees a
//! frontend would produce. These shorthands keep the programs readable.
#![allow(dead_code)]

use perlite::ast::{BinOp, Block, Expr, Func, Stmt, StmtKind};
use perlite::{Context, Interp, RunError, Scalar, Value};

/// Runs a unit in a fresh engine, scalar context.
pub fn run_scalar(unit: &Block) -> Result<Scalar, RunError> {
    let mut interp = Interp::new();
    run_in(&mut interp, unit, Context::Scalar).map(|v| v.scalarize())
}

/// Runs a unit in a given engine and context.
pub fn run_in(interp: &mut Interp, unit: &Block, ctx: Context) -> Result<Value, RunError> {
    interp.run_unit(unit, "test.pl", 1, Value::empty_list(), ctx)
}

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block::new(stmts)
}

pub fn expr_stmt(line: u32, expr: Expr) -> Stmt {
    Stmt::expr(line, expr)
}

/// `my $name = init;`
pub fn my_scalar(line: u32, name: &str, init: Option<Expr>) -> Stmt {
    Stmt::new(
        line,
        StmtKind::My {
            names: vec![name.to_owned()],
            init,
        },
    )
}

pub fn int(value: i64) -> Expr {
    Expr::Int(value)
}

pub fn string(value: &str) -> Expr {
    Expr::str(value)
}

pub fn var(name: &str) -> Expr {
    Expr::var(name)
}

pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: lhs.boxed(),
        rhs: rhs.boxed(),
    }
}

pub fn assign(target: Expr, value: Expr) -> Expr {
    Expr::Assign {
        target: target.boxed(),
        value: value.boxed(),
    }
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.to_owned(),
        args,
    }
}

pub fn dyn_call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::DynCall {
        callee: callee.boxed(),
        args,
    }
}

pub fn func(f: Func, args: Vec<Expr>) -> Expr {
    Expr::Func { func: f, args }
}

pub fn anon_sub(stmts: Vec<Stmt>) -> Expr {
    Expr::AnonSub {
        body: Block::new(stmts),
    }
}

/// `$_[n]` — the n-th argument.
pub fn arg(n: i64) -> Expr {
    Expr::Elem {
        container: var("@_").boxed(),
        index: int(n).boxed(),
        kind: perlite::ast::AccessKind::Array,
    }
}
