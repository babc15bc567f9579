//! Loop control, labels, `goto`, and marker propagation through calls.

mod common;

use common::*;
use perlite::ast::{BinOp, Expr, GotoTarget, Stmt, StmtKind};
use perlite::Context;
use perlite::Interp;

fn while_loop(cond: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        3,
        StmtKind::While {
            label: None,
            cond,
            body: block(body),
            negate: false,
        },
    )
}

/// Plain `last` exits the innermost loop via a direct jump.
#[test]
fn last_exits_loop() {
    let unit = block(vec![
        my_scalar(1, "$n", Some(int(0))),
        while_loop(
            int(1),
            vec![
                expr_stmt(4, Expr::PostIncr(var("$n").boxed())),
                Stmt::new(
                    5,
                    StmtKind::If {
                        cond: bin(BinOp::NumGe, var("$n"), int(5)),
                        then_block: block(vec![Stmt::new(5, StmtKind::Last { label: None })]),
                        else_block: None,
                    },
                ),
            ],
        ),
        expr_stmt(6, var("$n")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 5);
}

/// `next` skips the rest of the body.
#[test]
fn next_skips_body_tail() {
    // my $sum = 0; foreach my $i (1..5) { next if $i == 3; $sum += $i }
    let unit = block(vec![
        my_scalar(1, "$sum", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Foreach {
                label: None,
                var: Some("$i".to_owned()),
                list: Expr::Range {
                    lo: int(1).boxed(),
                    hi: int(5).boxed(),
                },
                body: block(vec![
                    Stmt::new(
                        3,
                        StmtKind::If {
                            cond: bin(BinOp::NumEq, var("$i"), int(3)),
                            then_block: block(vec![Stmt::new(3, StmtKind::Next { label: None })]),
                            else_block: None,
                        },
                    ),
                    expr_stmt(
                        4,
                        Expr::CompoundAssign {
                            op: BinOp::Add,
                            target: var("$sum").boxed(),
                            value: var("$i").boxed(),
                        },
                    ),
                ]),
            },
        ),
        expr_stmt(5, var("$sum")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 12);
}

/// `redo` restarts the body without advancing the iterator.
#[test]
fn redo_restarts_iteration() {
    let unit = block(vec![
        my_scalar(1, "$n", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Foreach {
                label: None,
                var: Some("$x".to_owned()),
                list: Expr::List(vec![int(10)]),
                body: block(vec![
                    expr_stmt(3, Expr::PostIncr(var("$n").boxed())),
                    Stmt::new(
                        4,
                        StmtKind::If {
                            cond: bin(BinOp::NumLt, var("$n"), int(3)),
                            then_block: block(vec![Stmt::new(4, StmtKind::Redo { label: None })]),
                            else_block: None,
                        },
                    ),
                ]),
            },
        ),
        expr_stmt(5, var("$n")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 3);
}

/// `last LABEL` from an inner loop exits the labelled outer loop.
#[test]
fn labelled_last_exits_outer() {
    let unit = block(vec![
        my_scalar(1, "$hits", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Foreach {
                label: Some("OUTER".to_owned()),
                var: Some("$i".to_owned()),
                list: Expr::Range {
                    lo: int(1).boxed(),
                    hi: int(3).boxed(),
                },
                body: block(vec![Stmt::new(
                    3,
                    StmtKind::Foreach {
                        label: None,
                        var: Some("$j".to_owned()),
                        list: Expr::Range {
                            lo: int(1).boxed(),
                            hi: int(3).boxed(),
                        },
                        body: block(vec![
                            expr_stmt(4, Expr::PostIncr(var("$hits").boxed())),
                            Stmt::new(
                                5,
                                StmtKind::If {
                                    cond: bin(BinOp::NumEq, var("$j"), int(2)),
                                    then_block: block(vec![Stmt::new(
                                        5,
                                        StmtKind::Last {
                                            label: Some("OUTER".to_owned()),
                                        },
                                    )]),
                                    else_block: None,
                                },
                            ),
                        ]),
                    },
                )]),
            },
        ),
        expr_stmt(6, var("$hits")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 2);
}

/// A `last` raised inside a called sub unwinds, as a marker, into the
/// caller's loop.
#[test]
fn marker_from_callee_exits_callers_loop() {
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::SubDef {
                name: "bail".to_owned(),
                body: block(vec![Stmt::new(1, StmtKind::Last { label: None })]),
            },
        ),
        my_scalar(2, "$n", Some(int(0))),
        while_loop(
            int(1),
            vec![
                expr_stmt(4, Expr::PostIncr(var("$n").boxed())),
                expr_stmt(5, call("bail", vec![])),
                expr_stmt(6, assign(var("$n"), int(99))),
            ],
        ),
        expr_stmt(7, var("$n")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 1);
}

/// A `next` from a callee re-enters the caller's loop condition.
#[test]
fn marker_next_from_callee_continues() {
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::SubDef {
                name: "again".to_owned(),
                body: block(vec![Stmt::new(1, StmtKind::Next { label: None })]),
            },
        ),
        my_scalar(2, "$i", Some(int(0))),
        my_scalar(3, "$ran", Some(int(0))),
        while_loop(
            bin(BinOp::NumLt, var("$i"), int(3)),
            vec![
                expr_stmt(5, Expr::PostIncr(var("$i").boxed())),
                expr_stmt(6, call("again", vec![])),
                expr_stmt(7, Expr::PostIncr(var("$ran").boxed())),
            ],
        ),
        expr_stmt(8, var("$ran")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 0);
}

/// A loop-control marker escaping the whole program is a user error.
#[test]
fn escaped_marker_is_an_error() {
    let unit = block(vec![Stmt::new(1, StmtKind::Last { label: None })]);
    let err = run_scalar(&unit).unwrap_err();
    assert!(err.message().contains("Can't \"last\" outside a loop block"));
}

/// `goto &sub` replaces the call: the target sees the original arguments.
#[test]
fn goto_sub_trampolines() {
    let unit = block(vec![
        Stmt::new(
            1,
            StmtKind::SubDef {
                name: "target".to_owned(),
                body: block(vec![expr_stmt(1, bin(BinOp::Add, arg(0), int(1)))]),
            },
        ),
        Stmt::new(
            2,
            StmtKind::SubDef {
                name: "hop".to_owned(),
                body: block(vec![Stmt::new(2, StmtKind::Goto(GotoTarget::Sub(var("&target"))))]),
            },
        ),
        expr_stmt(3, call("hop", vec![int(41)])),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 42);
}

/// Forward `goto LABEL` jumps over statements.
#[test]
fn goto_label_forward() {
    let unit = block(vec![
        my_scalar(1, "$x", Some(int(1))),
        Stmt::new(2, StmtKind::Goto(GotoTarget::Label("SKIP".to_owned()))),
        expr_stmt(3, assign(var("$x"), int(99))),
        Stmt::new(
            4,
            StmtKind::Labeled {
                label: "SKIP".to_owned(),
                stmt: Box::new(expr_stmt(4, var("$x"))),
            },
        ),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 1);
}

/// Backward `goto LABEL` forms a loop; registers survive the jumps.
#[test]
fn goto_label_backward() {
    let unit = block(vec![
        my_scalar(1, "$n", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Labeled {
                label: "TOP".to_owned(),
                stmt: Box::new(expr_stmt(2, Expr::PostIncr(var("$n").boxed()))),
            },
        ),
        Stmt::new(
            3,
            StmtKind::If {
                cond: bin(BinOp::NumLt, var("$n"), int(4)),
                then_block: block(vec![Stmt::new(3, StmtKind::Goto(GotoTarget::Label("TOP".to_owned())))]),
                else_block: None,
            },
        ),
        expr_stmt(4, var("$n")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 4);
}

/// A labelled bare block behaves as a loop that runs once.
#[test]
fn bare_block_last() {
    let unit = block(vec![
        my_scalar(1, "$x", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Block {
                label: Some("B".to_owned()),
                body: block(vec![
                    expr_stmt(3, assign(var("$x"), int(1))),
                    Stmt::new(
                        4,
                        StmtKind::Last {
                            label: Some("B".to_owned()),
                        },
                    ),
                    expr_stmt(5, assign(var("$x"), int(2))),
                ]),
            },
        ),
        expr_stmt(6, var("$x")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 1);
}

/// `until` loops invert the condition.
#[test]
fn until_loop() {
    let unit = block(vec![
        my_scalar(1, "$n", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::While {
                label: None,
                cond: bin(BinOp::NumGe, var("$n"), int(3)),
                body: block(vec![expr_stmt(3, Expr::PostIncr(var("$n").boxed()))]),
                negate: true,
            },
        ),
        expr_stmt(4, var("$n")),
    ]);
    assert_eq!(run_scalar(&unit).unwrap().to_int(), 3);
}

/// Unlabelled foreach binds the global `$_`.
#[test]
fn foreach_default_topic() {
    let mut interp = Interp::new();
    let unit = block(vec![
        my_scalar(1, "$sum", Some(int(0))),
        Stmt::new(
            2,
            StmtKind::Foreach {
                label: None,
                var: None,
                list: Expr::List(vec![int(1), int(2), int(3)]),
                body: block(vec![expr_stmt(
                    3,
                    Expr::CompoundAssign {
                        op: BinOp::Add,
                        target: var("$sum").boxed(),
                        value: var("$_").boxed(),
                    },
                )]),
            },
        ),
        expr_stmt(4, var("$sum")),
    ]);
    let result = run_in(&mut interp, &unit, Context::Scalar).unwrap();
    assert_eq!(result.scalarize().to_int(), 6);
}
