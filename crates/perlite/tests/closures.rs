//! Closure semantics: template sharing, per-instance capture vectors, and
//! by-cell capture visibility.

mod common;

use common::*;
use perlite::ast::{BinOp, Expr, Stmt, StmtKind};
use perlite::{Context, Interp};

/// Two instances minted from one template share streams and pools by
/// reference but own independent captured vectors.
#[test]
fn instances_share_template() {
    // sub make { my $count = 0; sub { $count = $count + 1; $count } }
    // $main::a = make(); $main::b = make();
    let inner = anon_sub(vec![
        expr_stmt(
            2,
            assign(var("$count"), bin(BinOp::Add, var("$count"), int(1))),
        ),
        expr_stmt(3, var("$count")),
    ]);
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::SubDef {
                name: "make".to_owned(),
                body: block(vec![my_scalar(1, "$count", Some(int(0))), expr_stmt(2, inner)]),
            },
        ),
        expr_stmt(4, assign(var("$first"), call("make", vec![]))),
        expr_stmt(5, assign(var("$second"), call("make", vec![]))),
    ]);

    let mut interp = Interp::new();
    run_in(&mut interp, &unit, Context::Void).unwrap();

    let first = interp.symbols_mut().get_scalar("main::first");
    let second = interp.symbols_mut().get_scalar("main::second");
    let first = first.borrow().as_code().unwrap();
    let second = second.borrow().as_code().unwrap();
    let first = first.as_interpreted().unwrap().clone();
    let second = second.as_interpreted().unwrap().clone();

    assert!(first.shares_template(&second), "instruction stream and pools are shared");
    assert_eq!(first.capture_count(), 1);

    // Independent counters: each instance carries its own cell.
    let a1 = dyn_call(var("$first"), vec![]);
    let counter_unit = block(vec![expr_stmt(1, a1)]);
    assert_eq!(
        run_in(&mut interp, &counter_unit, Context::Scalar).unwrap().scalarize().to_int(),
        1
    );
    assert_eq!(
        run_in(&mut interp, &counter_unit, Context::Scalar).unwrap().scalarize().to_int(),
        2
    );
    let other_unit = block(vec![expr_stmt(1, dyn_call(var("$second"), vec![]))]);
    assert_eq!(
        run_in(&mut interp, &other_unit, Context::Scalar).unwrap().scalarize().to_int(),
        1,
        "the second closure's counter is untouched"
    );
}

/// Two closures capturing the same lexical share its cell: a write
/// through one is visible through the other.
#[test]
fn captures_share_cells() {
    let unit = block(vec![
        my_scalar(1, "$x", Some(int(10))),
        my_scalar(
            2,
            "$set",
            Some(anon_sub(vec![expr_stmt(2, assign(var("$x"), arg(0)))])),
        ),
        my_scalar(3, "$get", Some(anon_sub(vec![expr_stmt(3, var("$x"))]))),
        expr_stmt(4, dyn_call(var("$set"), vec![int(77)])),
        expr_stmt(5, dyn_call(var("$get"), vec![])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 77);
}

/// The defining scope observes writes made through a capture, and the
/// closure observes later writes from the defining scope.
#[test]
fn capture_is_by_cell_not_by_snapshot() {
    let unit = block(vec![
        my_scalar(1, "$x", Some(int(1))),
        my_scalar(2, "$get", Some(anon_sub(vec![expr_stmt(2, var("$x"))]))),
        expr_stmt(3, assign(var("$x"), int(5))),
        expr_stmt(4, dyn_call(var("$get"), vec![])),
    ]);
    assert_eq!(
        run_scalar(&unit).unwrap().to_int(),
        5,
        "the closure reads through the live cell"
    );
}

/// Captured arrays alias the container, not a copy.
#[test]
fn captured_array_aliases() {
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::My {
                names: vec!["@items".to_owned()],
                init: None,
            },
        ),
        my_scalar(
            2,
            "$add",
            Some(anon_sub(vec![expr_stmt(
                2,
                func(perlite::ast::Func::Push, vec![var("@items"), arg(0)]),
            )])),
        ),
        expr_stmt(3, dyn_call(var("$add"), vec![int(4)])),
        expr_stmt(4, dyn_call(var("$add"), vec![int(5)])),
        expr_stmt(5, func(perlite::ast::Func::Join, vec![string(","), var("@items")])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_text(), "4,5");
}

/// A nested closure reaches a grandparent lexical through the chain of
/// capture vectors.
#[test]
fn transitive_capture() {
    // my $x = 3;
    // my $outer = sub { sub { $x + 1 } };
    // $outer->()->()  — via two calls
    let unit = block(vec![
        my_scalar(1, "$x", Some(int(3))),
        my_scalar(
            2,
            "$outer",
            Some(anon_sub(vec![expr_stmt(
                2,
                anon_sub(vec![expr_stmt(2, bin(BinOp::Add, var("$x"), int(1)))]),
            )])),
        ),
        my_scalar(3, "$inner", Some(dyn_call(var("$outer"), vec![]))),
        expr_stmt(4, dyn_call(var("$inner"), vec![])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 4);
}

/// Named subs recurse through their global name; each invocation gets a
/// fresh register file.
#[test]
fn closures_recurse_through_named_subs() {
    // sub fact { my $n = $_[0]; $n <= 1 ? 1 : $n * fact($n - 1) }
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::SubDef {
                name: "fact".to_owned(),
                body: block(vec![
                    my_scalar(1, "$n", Some(arg(0))),
                    expr_stmt(
                        2,
                        Expr::Ternary {
                            cond: bin(BinOp::NumLe, var("$n"), int(1)).boxed(),
                            then_expr: int(1).boxed(),
                            else_expr: bin(
                                BinOp::Mul,
                                var("$n"),
                                call("fact", vec![bin(BinOp::Sub, var("$n"), int(1))]),
                            )
                            .boxed(),
                        },
                    ),
                ]),
            },
        ),
        expr_stmt(3, call("fact", vec![int(6)])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 720);
}
