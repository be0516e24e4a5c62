//! Tests for the concrete codec: mnemonic rendering, macro decoding,
//! text parsing, and the JSON form.

use crate::asm::{ContractCode, Instr, InstrKind, MExpr, Op};
use crate::ast::Span;
use crate::emit::*;
use crate::types::{Const, Type};

fn i(kind: InstrKind) -> Instr {
    Instr::new(kind, Span::new(1, 1, 1, 1))
}

fn render(kind: InstrKind) -> String {
    let trees = instrs_to_mexpr(&[i(kind)]).unwrap();
    print_compact(&trees[0])
}

#[test]
fn dup_and_dip_macros_render_by_depth() {
    assert_eq!(render(InstrKind::Dup(1)), "DUP");
    assert_eq!(render(InstrKind::Dup(2)), "DUUP");
    assert_eq!(render(InstrKind::Dup(3)), "DUUUP");
    assert_eq!(render(InstrKind::Dip(1, vec![])), "DIP {  }");
    assert_eq!(render(InstrKind::Dip(2, vec![])), "DIIP {  }");
}

#[test]
fn access_macros_render_and_decode() {
    assert_eq!(render(InstrKind::CdAr(1, None)), "CDAR");
    assert_eq!(render(InstrKind::CdAr(2, None)), "CDDAR");
    assert_eq!(render(InstrKind::CdDr(0, None)), "CDR");
    assert_eq!(render(InstrKind::CdDr(1, None)), "CDDR");

    let decoded = mexpr_to_instrs(&MExpr::prim("CDDAR")).unwrap();
    assert_eq!(decoded[0].kind, InstrKind::CdAr(2, None));
    let decoded = mexpr_to_instrs(&MExpr::prim("CDDR")).unwrap();
    assert_eq!(decoded[0].kind, InstrKind::CdDr(1, None));
    // Mixed chains expand to elementary accesses, execution order.
    let decoded = mexpr_to_instrs(&MExpr::prim("CADR")).unwrap();
    assert_eq!(decoded[0].kind, InstrKind::Car(None));
    assert_eq!(decoded[1].kind, InstrKind::Cdr(None));
}

#[test]
fn unpair_renders_and_decodes() {
    assert_eq!(
        render(InstrKind::Unpair(
            Some("p".to_string()),
            Some("s".to_string())
        )),
        "UNPAIR @p @s"
    );
    // Only the cdr named: the car slot is held open positionally.
    assert_eq!(
        render(InstrKind::Unpair(None, Some("s".to_string()))),
        "UNPAIR @_ @s"
    );

    let tree = MExpr::prim("UNPAIR").with_annots(vec!["@p".to_string(), "@s".to_string()]);
    let decoded = mexpr_to_instrs(&tree).unwrap();
    assert_eq!(
        decoded[0].kind,
        InstrKind::Unpair(Some("p".to_string()), Some("s".to_string()))
    );
    assert_eq!(decoded[0].name, None);

    let decoded = mexpr_to_instrs(&MExpr::prim("UNPAIR")).unwrap();
    assert_eq!(decoded[0].kind, InstrKind::Unpair(None, None));
}

#[test]
fn dip_drop_renders_as_drop_block_and_decodes_back() {
    assert_eq!(render(InstrKind::DipDrop(1, 2)), "DIP { DROP ; DROP }");
    let tree = instrs_to_mexpr(&[i(InstrKind::DipDrop(1, 2))]).unwrap();
    let decoded = mexpr_to_instrs(&tree[0]).unwrap();
    assert_eq!(decoded[0].kind, InstrKind::DipDrop(1, 2));
}

#[test]
fn annotations_render_with_sigils() {
    let mut push = i(InstrKind::Push(Type::Int, Const::Int(1)));
    push.name = Some("balance".to_string());
    let tree = instrs_to_mexpr(&[push]).unwrap();
    assert_eq!(print_compact(&tree[0]), "PUSH @balance int 1");

    assert_eq!(
        render(InstrKind::Car(Some("owner".to_string()))),
        "CAR %owner"
    );
    assert_eq!(
        render(InstrKind::RecordOf("x".to_string(), Some("y".to_string()))),
        "PAIR %x %y"
    );
}

#[test]
fn types_render_in_wire_syntax() {
    let ty = Type::Tuple(vec![Type::Int, Type::String_, Type::Bool]);
    let tree = type_to_mexpr(&ty).unwrap();
    assert_eq!(print_compact(&tree), "pair int (pair string bool)");

    let ty = Type::or(Type::Unit, Type::list(Type::Nat));
    let tree = type_to_mexpr(&ty).unwrap();
    assert_eq!(print_compact(&tree), "or unit (list nat)");

    let ty = Type::BigMap(Box::new(Type::String_), Box::new(Type::Tez));
    let tree = type_to_mexpr(&ty).unwrap();
    assert_eq!(print_compact(&tree), "big_map string tez");
}

#[test]
fn program_text_round_trips() {
    let code = ContractCode {
        parameter: Type::Int,
        storage: Type::Int,
        code: vec![
            i(InstrKind::Dup(1)),
            i(InstrKind::Dip(1, vec![i(InstrKind::Cdr(None))])),
            i(InstrKind::Car(None)),
            i(InstrKind::Op(Op::Add)),
            i(InstrKind::Nil(Type::Operation)),
            i(InstrKind::Pair),
        ],
    };
    let program = contract_to_mexpr(&code, &[]).unwrap();
    let text = print_program(&program, true);
    let reparsed = parse_program(&text).unwrap();
    assert_eq!(program, reparsed);
}

#[test]
fn program_json_round_trips() {
    let code = ContractCode {
        parameter: Type::String_,
        storage: Type::pair(Type::Int, Type::String_),
        code: vec![
            i(InstrKind::Push(Type::Int, Const::Int(42))),
            i(InstrKind::Failwith),
        ],
    };
    let program = contract_to_mexpr(&code, &[]).unwrap();
    let json = program_to_json(&program);
    let reparsed = json_to_program(&json).unwrap();
    assert_eq!(program, reparsed);
}

#[test]
fn entry_annotations_mark_the_parameter_arms() {
    let code = ContractCode {
        parameter: Type::or(Type::Unit, Type::Int),
        storage: Type::Int,
        code: vec![],
    };
    let names = vec!["entry_pay".to_string(), "entry_set".to_string()];
    let program = contract_to_mexpr(&code, &names).unwrap();
    let text = print_compact(&program.parameter);
    assert_eq!(text, "or (unit %entry_pay) (int %entry_set)");
}

#[test]
fn constants_render_in_wire_syntax() {
    let c = Const::Tuple(vec![
        Const::Int(1),
        Const::Some_(Box::new(Const::String("hi".to_string()))),
    ]);
    let tree = const_to_mexpr(&c).unwrap();
    assert_eq!(print_compact(&tree), "Pair 1 (Some \"hi\")");

    let m = Const::Map(vec![(Const::String("k".to_string()), Const::Nat(3))]);
    let tree = const_to_mexpr(&m).unwrap();
    assert_eq!(print_compact(&tree), "{ Elt \"k\" 3 }");
}

#[test]
fn push_constants_decode_against_their_type() {
    let tree = MExpr::prim_args(
        "PUSH",
        vec![
            MExpr::prim_args("pair", vec![MExpr::prim("int"), MExpr::prim("string")]),
            MExpr::prim_args("Pair", vec![MExpr::Int(5), MExpr::Str("v".to_string())]),
        ],
    );
    let decoded = mexpr_to_instrs(&tree).unwrap();
    match &decoded[0].kind {
        InstrKind::Push(ty, c) => {
            assert_eq!(*ty, Type::pair(Type::Int, Type::String_));
            assert_eq!(
                *c,
                Const::Tuple(vec![Const::Int(5), Const::String("v".to_string())])
            );
        }
        other => panic!("expected PUSH, got {:?}", other),
    }
}

#[test]
fn lambda_bodies_nest_in_text() {
    let code = vec![i(InstrKind::Lambda(
        Type::Int,
        Type::Int,
        vec![i(InstrKind::Push(Type::Int, Const::Int(1))), i(InstrKind::Op(Op::Add))],
    ))];
    let tree = instrs_to_mexpr(&code).unwrap();
    let text = print_compact(&tree[0]);
    assert_eq!(text, "LAMBDA int int { PUSH int 1 ; ADD }");
    // And back.
    let seq = MExpr::Seq(tree);
    let decoded = mexpr_to_instrs(&seq).unwrap();
    assert_eq!(decoded.len(), 1);
    assert!(matches!(decoded[0].kind, InstrKind::Lambda(_, _, _)));
}
