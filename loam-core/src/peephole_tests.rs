//! Tests for the peephole rules and the tail-fail finalizer.

use crate::asm::{Instr, InstrKind, Op};
use crate::ast::Span;
use crate::peephole::{end_fails, finalize, peephole};
use crate::types::{Const, Type};

fn i(kind: InstrKind) -> Instr {
    Instr::new(kind, Span::new(1, 1, 1, 1))
}

#[test]
fn push_then_drop_vanishes() {
    let code = vec![
        i(InstrKind::Push(Type::Int, Const::Int(1))),
        i(InstrKind::Drop),
        i(InstrKind::Op(Op::Add)),
    ];
    let out = peephole(code);
    assert_eq!(out, vec![i(InstrKind::Op(Op::Add))]);
}

#[test]
fn dup_then_cleanup_vanishes() {
    let code = vec![i(InstrKind::Dup(1)), i(InstrKind::DipDrop(1, 1))];
    let out = peephole(code);
    assert!(out.is_empty());
}

#[test]
fn double_swap_cancels() {
    let code = vec![i(InstrKind::Swap), i(InstrKind::Swap), i(InstrKind::Drop)];
    let out = peephole(code);
    assert_eq!(out, vec![i(InstrKind::Drop)]);
}

#[test]
fn adjacent_dips_merge() {
    let code = vec![
        i(InstrKind::Dip(1, vec![i(InstrKind::Op(Op::Add))])),
        i(InstrKind::Dip(1, vec![i(InstrKind::Op(Op::Mul))])),
    ];
    let out = peephole(code);
    assert_eq!(
        out,
        vec![i(InstrKind::Dip(
            1,
            vec![i(InstrKind::Op(Op::Add)), i(InstrKind::Op(Op::Mul))]
        ))]
    );
}

#[test]
fn cleanups_coalesce() {
    let code = vec![i(InstrKind::DipDrop(1, 1)), i(InstrKind::DipDrop(1, 2))];
    let out = peephole(code);
    assert_eq!(out, vec![i(InstrKind::DipDrop(1, 3))]);
}

#[test]
fn rules_apply_inside_branches() {
    let code = vec![i(InstrKind::If(
        vec![i(InstrKind::Swap), i(InstrKind::Swap)],
        vec![i(InstrKind::Push(Type::Int, Const::Int(0))), i(InstrKind::Drop)],
    ))];
    let out = peephole(code);
    assert_eq!(out, vec![i(InstrKind::If(vec![], vec![]))]);
}

#[test]
fn unpack_triple_fuses_into_unpair() {
    let mut cdr = i(InstrKind::Cdr(None));
    cdr.name = Some("s".to_string());
    let mut car = i(InstrKind::Car(None));
    car.name = Some("p".to_string());
    let code = vec![i(InstrKind::Dup(1)), i(InstrKind::Dip(1, vec![cdr])), car];
    let out = peephole(code);
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].kind,
        InstrKind::Unpair(Some("p".to_string()), Some("s".to_string()))
    );
}

#[test]
fn annotated_dup_blocks_unpair_fusion() {
    // DUP @x is a variable access, not a pair unpack; fusing would lose
    // the name.
    let mut dup = i(InstrKind::Dup(1));
    dup.name = Some("x".to_string());
    let code = vec![
        dup,
        i(InstrKind::Dip(1, vec![i(InstrKind::Cdr(None))])),
        i(InstrKind::Car(None)),
    ];
    let out = peephole(code);
    assert!(out.iter().all(|instr| !matches!(instr.kind, InstrKind::Unpair(_, _))));
    assert_eq!(out.len(), 3);
}

#[test]
fn end_fails_is_inductive() {
    let fail = i(InstrKind::Failwith);
    assert!(end_fails(&fail));

    let both_arms_fail = i(InstrKind::If(
        vec![i(InstrKind::Push(Type::Int, Const::Int(1))), i(InstrKind::Failwith)],
        vec![i(InstrKind::Failwith)],
    ));
    assert!(end_fails(&both_arms_fail));

    let one_arm_fails = i(InstrKind::If(vec![i(InstrKind::Failwith)], vec![]));
    assert!(!end_fails(&one_arm_fails));

    let failing_dip = i(InstrKind::Dip(1, vec![i(InstrKind::Failwith)]));
    assert!(end_fails(&failing_dip));
}

#[test]
fn finalize_truncates_after_failure() {
    let code = vec![
        i(InstrKind::Push(Type::String_, Const::String("x".to_string()))),
        i(InstrKind::Failwith),
        i(InstrKind::Drop),
        i(InstrKind::Op(Op::Add)),
    ];
    let out = finalize(code);
    assert_eq!(out.len(), 2);
    assert_eq!(out.last().map(|i| &i.kind), Some(&InstrKind::Failwith));
}

#[test]
fn finalize_descends_into_sequences() {
    let code = vec![i(InstrKind::IfLeft(
        vec![i(InstrKind::Failwith), i(InstrKind::Drop)],
        vec![i(InstrKind::Op(Op::Add))],
    ))];
    let out = finalize(code);
    match &out[0].kind {
        InstrKind::IfLeft(a, _) => {
            assert_eq!(a.len(), 1);
            assert_eq!(a[0].kind, InstrKind::Failwith);
        }
        other => panic!("unexpected {:?}", other),
    }
}
