//! Tests for the encoding pass: variant binarization, entry dispatch,
//! closure conversion, and the initializer bigmap convention.

use crate::ast::{NodeCounter, NodeId, Span};
use crate::encode::{encode_contract, EncodedInit};
use crate::tir::{Contract, Entry, Init, TExpr, TExprKind};
use crate::types::{Const, Env, Type};

fn span() -> Span {
    Span::new(1, 1, 1, 1)
}

fn texpr(ty: Type, kind: TExprKind) -> TExpr {
    TExpr::new(NodeId(0), ty, kind, span())
}

fn tvar(name: &str, ty: Type) -> TExpr {
    texpr(ty, TExprKind::Var(name.to_string()))
}

fn entry_result(storage: Type, body: TExpr) -> TExpr {
    let nil = texpr(
        Type::list(Type::Operation),
        TExprKind::Const(Const::List(vec![])),
    );
    texpr(Type::entry_result(storage), TExprKind::Tuple(vec![nil, body]))
}

fn one_entry_contract(storage: Type, body: TExpr) -> Contract {
    Contract {
        name: "t".to_string(),
        storage,
        values: vec![],
        entries: vec![Entry {
            name: "main".to_string(),
            param_name: "p".to_string(),
            param_ty: Type::Unit,
            storage_name: "s".to_string(),
            body,
        }],
        init: None,
    }
}

fn color_env() -> Env {
    let mut env = Env::new();
    env.register_variant(
        "color",
        vec![
            ("Red".to_string(), Type::Unit),
            ("Green".to_string(), Type::Unit),
            ("Blue".to_string(), Type::Unit),
        ],
    )
    .unwrap();
    env
}

/// Collect the Left/Right path of a nested injection, outermost first.
fn inject_path(mut e: &TExpr) -> Vec<bool> {
    let mut path = Vec::new();
    while let TExprKind::Inject { left, arg, .. } = &e.kind {
        path.push(*left);
        e = arg;
    }
    path
}

#[test]
fn variant_constructors_take_right_leaning_paths() {
    let env = color_env();
    let mut nc = NodeCounter::new();

    let paths: Vec<Vec<bool>> = ["Red", "Green", "Blue"]
        .iter()
        .map(|ctor| {
            let unit = texpr(Type::Unit, TExprKind::Const(Const::Unit));
            let construct = texpr(
                Type::Variant("color".to_string()),
                TExprKind::Construct {
                    ctor: ctor.to_string(),
                    arg: Box::new(unit),
                },
            );
            let rest = entry_result(Type::Unit, tvar("s", Type::Unit));
            let body = texpr(
                rest.ty.clone(),
                TExprKind::Let {
                    name: "v".to_string(),
                    uses: 0,
                    inline: false,
                    value: Box::new(construct),
                    body: Box::new(rest),
                },
            );
            let contract = one_entry_contract(Type::Unit, body);
            let program = encode_contract(&env, &contract, &mut nc).unwrap();
            // The encoded let value holds the injection chain.
            match &program.body.kind {
                TExprKind::Let { value, .. } => inject_path(value),
                other => panic!("expected a let, got {:?}", other),
            }
        })
        .collect();

    assert_eq!(paths[0], vec![true]);
    assert_eq!(paths[1], vec![false, true]);
    assert_eq!(paths[2], vec![false, false]);
}

#[test]
fn appending_a_constructor_keeps_existing_paths() {
    // The path of constructor i among n depends only on i (for i < n-1),
    // so extending the variant at the end is non-breaking.
    for count in 2..6 {
        for index in 0..count - 1 {
            assert_eq!(
                Env::ctor_path(index, count),
                Env::ctor_path(index, count + 1),
                "path of ctor {} changed when extending {} to {}",
                index,
                count,
                count + 1
            );
        }
    }
}

#[test]
fn multi_entry_contract_synthesizes_dispatch() {
    let env = Env::new();
    let mut nc = NodeCounter::new();
    let mk_entry = |name: &str, param_ty: Type| Entry {
        name: name.to_string(),
        param_name: format!("{}_p", name),
        param_ty,
        storage_name: "s".to_string(),
        body: entry_result(Type::Int, tvar("s", Type::Int)),
    };
    let contract = Contract {
        name: "multi".to_string(),
        storage: Type::Int,
        values: vec![],
        entries: vec![
            mk_entry("pay", Type::Unit),
            mk_entry("set", Type::Int),
            mk_entry("close", Type::String_),
        ],
        init: None,
    };
    let program = encode_contract(&env, &contract, &mut nc).unwrap();

    assert_eq!(
        program.parameter,
        Type::or(Type::Unit, Type::or(Type::Int, Type::String_))
    );
    assert_eq!(program.entry_names, vec!["entry_pay", "entry_set", "entry_close"]);
    assert_eq!(program.param_name, "parameter");

    match &program.body.kind {
        TExprKind::MatchVariant { cases, .. } => {
            assert_eq!(cases.len(), 2);
            assert_eq!(cases[0].ctor, "entry_pay");
            assert_eq!(cases[0].var.as_deref(), Some("pay_p"));
            match &cases[1].body.kind {
                TExprKind::MatchVariant { cases, .. } => {
                    assert_eq!(cases[0].ctor, "entry_set");
                }
                other => panic!("expected a nested dispatch, got {:?}", other),
            }
        }
        other => panic!("expected a dispatch match, got {:?}", other),
    }
}

#[test]
fn closure_becomes_env_lambda_pair() {
    let env = Env::new();
    let mut nc = NodeCounter::new();
    let body = texpr(
        Type::Int,
        TExprKind::Apply {
            prim: crate::tir::Prim::Add,
            args: vec![tvar("y", Type::Int), tvar("x", Type::Int)],
        },
    );
    let closure = texpr(
        Type::Closure {
            arg: Box::new(Type::Int),
            ret: Box::new(Type::Int),
            env: Box::new(Type::Tuple(vec![Type::Int])),
        },
        TExprKind::Closure {
            param: "y".to_string(),
            param_ty: Type::Int,
            ret_ty: Type::Int,
            captured: vec![("x".to_string(), Type::Int)],
            body: Box::new(body),
        },
    );
    let one = texpr(Type::Int, TExprKind::Const(Const::Int(1)));
    let with_x = texpr(
        closure.ty.clone(),
        TExprKind::Let {
            name: "x".to_string(),
            uses: 1,
            inline: false,
            value: Box::new(one),
            body: Box::new(closure),
        },
    );
    let body = texpr(
        Type::entry_result(Type::Int),
        TExprKind::Let {
            name: "f".to_string(),
            uses: 0,
            inline: false,
            value: Box::new(with_x),
            body: Box::new(entry_result(Type::Int, tvar("s", Type::Int))),
        },
    );
    let contract = Contract {
        name: "clo".to_string(),
        storage: Type::Int,
        values: vec![],
        entries: vec![Entry {
            name: "main".to_string(),
            param_name: "p".to_string(),
            param_ty: Type::Unit,
            storage_name: "s".to_string(),
            body,
        }],
        init: None,
    };
    let program = encode_contract(&env, &contract, &mut nc).unwrap();

    // let f = (let x = 1 in (env, lifted)) in ...
    let f_value = match &program.body.kind {
        TExprKind::Let { value, .. } => value,
        other => panic!("expected a let, got {:?}", other),
    };
    let pair = match &f_value.kind {
        TExprKind::Let { body, .. } => body,
        other => panic!("expected the x binding, got {:?}", other),
    };
    match &pair.kind {
        TExprKind::Tuple(items) => {
            assert_eq!(items.len(), 2);
            assert!(matches!(items[0].kind, TExprKind::Tuple(_)));
            match &items[1].kind {
                TExprKind::Lambda { param_ty, .. } => {
                    assert_eq!(
                        *param_ty,
                        Type::pair(Type::Tuple(vec![Type::Int]), Type::Int)
                    );
                }
                other => panic!("expected the lifted lambda, got {:?}", other),
            }
        }
        other => panic!("expected the closure pair, got {:?}", other),
    }
}

#[test]
fn empty_bigmap_in_initializer_projects_storage_slot_zero() {
    let env = Env::new();
    let mut nc = NodeCounter::new();
    let bigmap_ty = Type::BigMap(Box::new(Type::String_), Box::new(Type::Int));
    let storage = Type::Tuple(vec![bigmap_ty.clone(), Type::Int]);

    let init_body = texpr(
        storage.clone(),
        TExprKind::Tuple(vec![
            texpr(bigmap_ty.clone(), TExprKind::Const(Const::EmptyBigMap)),
            texpr(Type::Int, TExprKind::Const(Const::Int(0))),
        ]),
    );
    let contract = Contract {
        name: "ledger".to_string(),
        storage: storage.clone(),
        values: vec![],
        entries: vec![Entry {
            name: "main".to_string(),
            param_name: "p".to_string(),
            param_ty: Type::Unit,
            storage_name: "s".to_string(),
            body: entry_result(storage, tvar("s", Type::Tuple(vec![bigmap_ty, Type::Int]))),
        }],
        init: Some(Init {
            params: vec![],
            body: init_body,
        }),
    };
    let program = encode_contract(&env, &contract, &mut nc).unwrap();
    let init = program.initializer.expect("initializer present");
    match init {
        EncodedInit::Code { body, storage_name, .. } => match &body.kind {
            TExprKind::Tuple(items) => match &items[0].kind {
                TExprKind::Proj { index: 0, tuple, .. } => {
                    assert!(
                        matches!(&tuple.kind, TExprKind::Var(v) if *v == storage_name),
                        "slot-0 projection should read the storage frame"
                    );
                }
                other => panic!("expected a slot-0 projection, got {:?}", other),
            },
            other => panic!("expected the storage tuple, got {:?}", other),
        },
        EncodedInit::Constant(c) => panic!("initializer folded to a constant: {:?}", c),
    }
}
