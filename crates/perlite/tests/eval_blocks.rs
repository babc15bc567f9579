//! Eval-block semantics: catching, nesting, isolation, and dynamic eval
//! through a stub frontend.

mod common;

use common::*;
use perlite::ast::{BinOp, Block, Expr, Func, Stmt};
use perlite::{Context, Frontend, Interp, Value};

fn eval_block(stmts: Vec<Stmt>) -> Expr {
    Expr::Eval { body: block(stmts) }
}

/// A successful eval clears the error variable and yields its last
/// expression.
#[test]
fn successful_eval_clears_error() {
    let unit = block(vec![
        // Poison $@ first so the clear is observable.
        my_scalar(1, "$r", Some(eval_block(vec![expr_stmt(1, func(Func::Die, vec![string("x\n")]))]))),
        my_scalar(2, "$ok", Some(eval_block(vec![expr_stmt(2, int(7))]))),
        expr_stmt(3, func(Func::Join, vec![string("|"), var("$ok"), var("$@")])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_text(), "7|");
}

/// Registers written before a caught die remain usable after the catch.
#[test]
fn registers_survive_catch() {
    let unit = block(vec![
        my_scalar(1, "$before", Some(int(11))),
        my_scalar(
            2,
            "$r",
            Some(eval_block(vec![
                expr_stmt(2, assign(var("$before"), int(22))),
                expr_stmt(3, func(Func::Die, vec![string("bang\n")])),
            ])),
        ),
        expr_stmt(4, var("$before")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 22);
}

/// Nested evals pop handlers LIFO: the inner catch fires, the outer one
/// stays armed for the re-raise.
#[test]
fn nested_evals_are_lifo() {
    // eval { my $inner = eval { die "in\n" }; die "out" . $@ };  $@
    let unit = block(vec![
        expr_stmt(
            1,
            eval_block(vec![
                my_scalar(
                    2,
                    "$inner",
                    Some(eval_block(vec![expr_stmt(2, func(Func::Die, vec![string("in\n")]))])),
                ),
                expr_stmt(
                    3,
                    func(
                        Func::Die,
                        vec![bin(BinOp::Concat, string("out:"), var("$@"))],
                    ),
                ),
            ]),
        ),
        expr_stmt(4, var("$@")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_text(), "out:in\n");
}

/// An uncaught die escapes to the host with its message intact.
#[test]
fn uncaught_die_reaches_host() {
    let unit = block(vec![expr_stmt(1, func(Func::Die, vec![string("fatal\n")]))]);
    let err = run_scalar(&unit).unwrap_err();
    assert_eq!(err.message(), "fatal\n");
}

/// Errors from operators (not just `die`) route through the same path.
#[test]
fn operator_error_is_catchable() {
    let unit = block(vec![
        my_scalar(
            1,
            "$r",
            Some(eval_block(vec![expr_stmt(
                2,
                bin(BinOp::Div, int(1), int(0)),
            )])),
        ),
        expr_stmt(3, var("$@")),
    ]);
    let message = run_scalar(&unit).unwrap().to_text();
    assert!(message.starts_with("Illegal division by zero"));
    assert!(message.contains("line 2"));
}

/// Dying with a reference delivers the reference itself to `$@`.
#[test]
fn die_with_reference() {
    let unit = block(vec![
        expr_stmt(
            1,
            eval_block(vec![expr_stmt(
                1,
                func(Func::Die, vec![Expr::AnonArray(vec![int(1), int(2)])]),
            )]),
        ),
        expr_stmt(2, func(Func::Ref, vec![var("$@")])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_text(), "ARRAY");
}

// ============================================================================
// Dynamic eval through a stub frontend
// ============================================================================

/// A frontend that understands exactly two strings: "six*seven" and
/// anything else fails to parse.
struct StubFrontend;

impl Frontend for StubFrontend {
    fn parse(&self, source: &str, _name: &str, line: u32) -> Result<Block, String> {
        if source == "six*seven" {
            Ok(Block::new(vec![Stmt::expr(
                line,
                Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Expr::Int(6).boxed(),
                    rhs: Expr::Int(7).boxed(),
                },
            )]))
        } else {
            Err(format!("syntax error at {source:?}"))
        }
    }
}

#[test]
fn compile_and_run_uses_frontend() {
    let mut interp = Interp::new();
    interp.set_frontend(Box::new(StubFrontend));
    let result = interp
        .compile_and_run("six*seven", "harness", 1, Value::empty_list(), Context::Scalar)
        .unwrap();
    assert_eq!(result.scalarize().to_int(), 42);
}

/// `eval STRING` catches its own compile failures: undef result, message
/// in the error variable.
#[test]
fn eval_string_reports_compile_errors() {
    let mut interp = Interp::new();
    interp.set_frontend(Box::new(StubFrontend));

    let ok = block(vec![expr_stmt(1, Expr::EvalStr(string("six*seven").boxed()))]);
    let result = run_in(&mut interp, &ok, Context::Scalar).unwrap();
    assert_eq!(result.scalarize().to_int(), 42);

    let bad = block(vec![
        my_scalar(1, "$r", Some(Expr::EvalStr(string("nonsense").boxed()))),
        expr_stmt(2, func(Func::Join, vec![string("|"), func(Func::Defined, vec![var("$r")]), var("$@")])),
    ]);
    let text = run_in(&mut interp, &bad, Context::Scalar).unwrap().scalarize().to_text();
    assert!(text.starts_with('|'), "eval result is undef: {text}");
    assert!(text.contains("syntax error"), "compile failure lands in $@: {text}");
}

/// Without a frontend, dynamic eval fails catchably.
#[test]
fn eval_string_without_frontend() {
    let unit = block(vec![
        my_scalar(1, "$r", Some(Expr::EvalStr(string("1+1").boxed()))),
        expr_stmt(2, var("$@")),
    ]);
    let message = run_scalar(&unit).unwrap().to_text();
    assert!(message.contains("no frontend"));
}
