//! Encoding and disassembly guarantees: deterministic compilation,
//! byte-identical streams for equivalent programs, lossless listings, and
//! dense opcode numbering.

mod common;

use common::*;
use perlite::ast::{BinOp, Expr, Func, Stmt, StmtKind};
use perlite::bytecode::compiler::Compiler;
use perlite::{Opcode, SlowOp};

fn sample_unit() -> perlite::ast::Block {
    block(vec![
        my_scalar(1, "$x", Some(bin(BinOp::Add, int(10), int(20)))),
        Stmt::new(
            2,
            StmtKind::My {
                names: vec!["@a".to_owned()],
                init: Some(Expr::List(vec![int(1), var("$x")])),
            },
        ),
        Stmt::new(
            3,
            StmtKind::Foreach {
                label: None,
                var: Some("$i".to_owned()),
                list: var("@a"),
                body: block(vec![expr_stmt(
                    4,
                    func(Func::Push, vec![var("@a"), var("$i")]),
                )]),
            },
        ),
        expr_stmt(
            5,
            Expr::Eval {
                body: block(vec![expr_stmt(5, func(Func::Die, vec![string("no\n")]))]),
            },
        ),
        expr_stmt(6, call("helper", vec![var("$x"), string("tag")])),
    ])
}

/// Equivalent construction produces byte-identical bytecode, pools
/// included.
#[test]
fn compilation_is_deterministic() {
    let first = Compiler::compile_unit(&sample_unit(), "same.pl", 1).unwrap();
    let second = Compiler::compile_unit(&sample_unit(), "same.pl", 1).unwrap();
    assert_eq!(first.units(), second.units());
    assert_eq!(first.register_count(), second.register_count());
    assert_eq!(first.disassemble(), second.disassemble());
}

/// The listing names every opcode and resolves every pool operand.
#[test]
fn disassembly_is_lossless() {
    let code = Compiler::compile_unit(&sample_unit(), "t.pl", 1).unwrap();
    let listing = code.disassemble();

    for expected in [
        "LOAD_INT",
        "ADD",
        "CREATE_LIST",
        "ITER_CREATE",
        "FOREACH_NEXT_OR_EXIT",
        "ARRAY_PUSH",
        "EVAL_TRY",
        "EVAL_CATCH",
        "EVAL_END",
        "LOAD_GLOBAL_CODE",
        "CALL_SUB",
        "RETURN",
    ] {
        assert!(listing.contains(expected), "missing {expected} in:\n{listing}");
    }
    // Pool operands resolve to their contents.
    assert!(listing.contains("\"main::helper\""));
    assert!(listing.contains("\"tag\""));

    // Every instruction line carries its offset; offsets are strictly
    // increasing and every unit is accounted for.
    let mut last = None;
    let mut lines = 0usize;
    for line in listing.lines().skip(1) {
        let offset: usize = line.split(':').next().unwrap().trim().parse().unwrap();
        if let Some(previous) = last {
            assert!(offset > previous);
        }
        last = Some(offset);
        lines += 1;
    }
    assert!(lines > 10);
}

/// A different source name changes metadata but not the stream.
#[test]
fn stream_is_independent_of_source_name() {
    let first = Compiler::compile_unit(&sample_unit(), "a.pl", 1).unwrap();
    let second = Compiler::compile_unit(&sample_unit(), "b.pl", 1).unwrap();
    assert_eq!(first.units(), second.units());
}

/// Every opcode in the numbering range decodes and has an operand shape;
/// the dispatch table is total over the dense range.
#[test]
fn opcode_table_is_total() {
    let last = Opcode::SlowOp as u16;
    for unit in 0..=last {
        let op = Opcode::from_unit(unit).expect("dense numbering");
        // The operand table is defined for every opcode.
        let _ = op.operands();
        assert!(!op.name().is_empty());
    }
    let last_slow = SlowOp::Setpriority as u16;
    for unit in 0..=last_slow {
        let sub = SlowOp::from_unit(unit).expect("dense slow table");
        let _ = sub.operands();
    }
}

/// Immediates embed big-endian: high unit first.
#[test]
fn imm32_is_big_endian_in_stream() {
    let unit = block(vec![expr_stmt(1, Expr::Int(0x0102_0304))]);
    let code = Compiler::compile_unit(&unit, "t.pl", 1).unwrap();
    let units = code.units();
    assert_eq!(units[0], Opcode::LoadInt as u16);
    assert_eq!(units[2], 0x0102);
    assert_eq!(units[3], 0x0304);
}
