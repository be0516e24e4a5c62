//! Tests for the decompilation path: reconstruction shapes, entry
//! recovery, and the annotation-conflict retry contract.

use crate::ast::ExprKind;
use crate::decompile::entry_names_of;
use crate::emit::parse_program;
use crate::error::{CompilerError, DecompileErrorKind};
use crate::types::Type;

#[test]
fn entry_names_come_from_parameter_annotations() {
    let program = parse_program(
        "parameter (or (unit %entry_pay) (or (int %entry_set) (string %entry_close)));\n\
         storage int;\n\
         code { DUP ; DIP { CDR } ; CAR ; DROP ; NIL operation ; PAIR ; DIP { DROP ; DROP } };",
    )
    .unwrap();
    assert_eq!(
        entry_names_of(&program.parameter),
        vec!["pay".to_string(), "set".to_string(), "close".to_string()]
    );
}

#[test]
fn unannotated_parameter_yields_no_entries() {
    let program = parse_program(
        "parameter (or unit int);\nstorage int;\ncode {};",
    )
    .unwrap();
    assert!(entry_names_of(&program.parameter).is_empty());
}

#[test]
fn identity_contract_reconstructs() {
    let program = parse_program(
        "parameter unit;\n\
         storage string;\n\
         code { DUP ; DIP { CDR @s } ; CAR @p ; DUUP @s ; NIL operation ; PAIR ; DIP { DROP ; DROP } };",
    )
    .unwrap();
    let decl = crate::decompile_program(&program, false).unwrap();
    assert_eq!(decl.entries.len(), 1);
    let entry = &decl.entries[0];
    assert_eq!(entry.name, "main");
    assert_eq!(entry.param_name, "p");
    assert_eq!(entry.storage_name, "s");
    assert_eq!(entry.param_ty, Type::Unit);
    assert_eq!(decl.storage, Type::String_);
}

#[test]
fn if_branches_merge_into_an_if_expression() {
    // parameter bool; storage int; code: if p then 1 else 2.
    let program = parse_program(
        "parameter bool;\n\
         storage int;\n\
         code { DUP ; DIP { CDR @s } ; CAR @p ;\n\
                IF { PUSH int 1 } { PUSH int 2 } ;\n\
                NIL operation ; PAIR ; DIP { DROP ; DROP } };",
    )
    .unwrap();
    let decl = crate::decompile_program(&program, false).unwrap();
    let body = &decl.entries[0].body;

    fn contains_if(e: &crate::ast::Expression) -> bool {
        match &e.kind {
            ExprKind::If { .. } => true,
            ExprKind::Let { value, body, .. } => contains_if(value) || contains_if(body),
            ExprKind::Tuple(items) => items.iter().any(contains_if),
            _ => false,
        }
    }
    assert!(contains_if(body), "IF must reconstruct as a surface if");
}

#[test]
fn failing_branch_reconstructs_as_failwith() {
    let program = parse_program(
        "parameter bool;\n\
         storage int;\n\
         code { DUP ; DIP { CDR @s } ; CAR @p ;\n\
                IF { PUSH string \"no\" ; FAILWITH } { PUSH int 2 } ;\n\
                NIL operation ; PAIR ; DIP { DROP ; DROP } };",
    )
    .unwrap();
    let decl = crate::decompile_program(&program, false).unwrap();
    assert_eq!(decl.entries.len(), 1);
}

#[test]
fn conflicting_annotations_abort_without_the_retry_flag() {
    // Both CAR and CDR claim @x.
    let program = parse_program(
        "parameter unit;\n\
         storage string;\n\
         code { DUP ; DIP { CDR @x } ; CAR @x ; DROP ; DUP @x ; NIL operation ; PAIR ; DIP { DROP } };",
    )
    .unwrap();
    let err = crate::decompile_program(&program, false).unwrap_err();
    match err {
        CompilerError::Decompile { kind, .. } => {
            assert_eq!(kind, DecompileErrorKind::AnnotationConflict)
        }
        other => panic!("expected an annotation conflict, got {:?}", other),
    }
    // The retry path ignores annotations and succeeds.
    crate::decompile_program(&program, true).unwrap();
}

#[test]
fn two_entry_dispatch_splits_back_into_entries() {
    // Compile a two-entry contract, then decompile its output.
    use crate::ast::*;
    use crate::types::Const;

    let mut nc = NodeCounter::new();
    let mut e = |kind| nc.mk_node(kind, Span::new(1, 1, 1, 1));
    let entry = |name: &str, param_ty: Type, body| EntryDecl {
        name: name.to_string(),
        param_name: format!("{}_arg", name),
        param_ty,
        storage_name: "s".to_string(),
        body,
    };
    let body_keep = {
        let nil = e(ExprKind::Const {
            value: Const::List(vec![]),
            ascribed: Some(Type::list(Type::Operation)),
        });
        let s = e(ExprKind::Var("s".to_string()));
        e(ExprKind::Tuple(vec![nil, s]))
    };
    let body_set = {
        let nil = e(ExprKind::Const {
            value: Const::List(vec![]),
            ascribed: Some(Type::list(Type::Operation)),
        });
        let v = e(ExprKind::Var("set_arg".to_string()));
        e(ExprKind::Tuple(vec![nil, v]))
    };
    let decl = ContractDecl {
        name: "two".to_string(),
        version: None,
        storage: Type::Int,
        types: vec![],
        values: vec![],
        entries: vec![
            entry("keep", Type::Unit, body_keep),
            entry("set", Type::Int, body_set),
        ],
        init: None,
    };
    let emitted = crate::compile_contract(&decl, &crate::Config::default()).unwrap();
    let round = crate::decompile_program(&emitted.program, false).unwrap();

    assert_eq!(round.entries.len(), 2);
    assert_eq!(round.entries[0].name, "keep");
    assert_eq!(round.entries[0].param_ty, Type::Unit);
    assert_eq!(round.entries[1].name, "set");
    assert_eq!(round.entries[1].param_ty, Type::Int);
}
