//! Tests for the typechecker: the arithmetic kind table, effect
//! analysis, use counting, and record/variant resolution.

use crate::ast::*;
use crate::checker::TypeChecker;
use crate::error::{CompilerError, TypeErrorKind};
use crate::tir::TExprKind;
use crate::types::{Const, Env, Type};

struct Ast {
    nc: NodeCounter,
}

impl Ast {
    fn new() -> Self {
        Ast {
            nc: NodeCounter::new(),
        }
    }

    fn e(&mut self, kind: ExprKind) -> Expression {
        self.nc.mk_node(kind, Span::new(1, 1, 1, 1))
    }

    fn var(&mut self, name: &str) -> Expression {
        self.e(ExprKind::Var(name.to_string()))
    }

    fn int(&mut self, i: i128) -> Expression {
        self.e(ExprKind::Const {
            value: Const::Int(i),
            ascribed: None,
        })
    }

    fn nat(&mut self, n: u64) -> Expression {
        self.e(ExprKind::Const {
            value: Const::Nat(n),
            ascribed: None,
        })
    }

    fn apply(&mut self, prim: &str, args: Vec<Expression>) -> Expression {
        self.e(ExprKind::Apply {
            prim: prim.to_string(),
            args,
        })
    }

    fn let_(&mut self, name: &str, value: Expression, body: Expression) -> Expression {
        self.e(ExprKind::Let {
            name: name.to_string(),
            value: Box::new(value),
            body: Box::new(body),
        })
    }
}

fn check_expr(ast: &mut Ast, expr: &Expression) -> crate::error::Result<crate::tir::TExpr> {
    let env = Env::new();
    let mut checker = TypeChecker::new(&env);
    let _ = ast;
    checker.check(expr, None)
}

fn expect_kind(err: CompilerError, kind: TypeErrorKind) {
    match err {
        CompilerError::Type { kind: got, .. } => assert_eq!(got, kind),
        other => panic!("expected a type error, got {:?}", other),
    }
}

#[test]
fn int_plus_int_is_int() {
    let mut ast = Ast::new();
    let a = ast.int(1);
    let b = ast.int(2);
    let sum = ast.apply("+", vec![a, b]);
    let typed = check_expr(&mut ast, &sum).unwrap();
    assert_eq!(typed.ty, Type::Int);
}

#[test]
fn nat_plus_nat_is_nat() {
    let mut ast = Ast::new();
    let a = ast.nat(1);
    let b = ast.nat(2);
    let sum = ast.apply("+", vec![a, b]);
    let typed = check_expr(&mut ast, &sum).unwrap();
    assert_eq!(typed.ty, Type::Nat);
}

#[test]
fn nat_minus_nat_is_int() {
    let mut ast = Ast::new();
    let a = ast.nat(5);
    let b = ast.nat(7);
    let diff = ast.apply("-", vec![a, b]);
    let typed = check_expr(&mut ast, &diff).unwrap();
    assert_eq!(typed.ty, Type::Int);
}

#[test]
fn tez_plus_tez_is_tez() {
    let mut ast = Ast::new();
    let a = ast.e(ExprKind::Const {
        value: Const::Tez(100),
        ascribed: None,
    });
    let b = ast.e(ExprKind::Const {
        value: Const::Tez(200),
        ascribed: None,
    });
    let sum = ast.apply("+", vec![a, b]);
    let typed = check_expr(&mut ast, &sum).unwrap();
    assert_eq!(typed.ty, Type::Tez);
}

#[test]
fn int_times_tez_is_rejected() {
    let mut ast = Ast::new();
    let a = ast.int(2);
    let b = ast.e(ExprKind::Const {
        value: Const::Tez(100),
        ascribed: None,
    });
    let product = ast.apply("*", vec![a, b]);
    let err = check_expr(&mut ast, &product).unwrap_err();
    expect_kind(err, TypeErrorKind::TypeMismatch);
}

#[test]
fn ediv_of_nats_is_option_pair() {
    let mut ast = Ast::new();
    let a = ast.nat(7);
    let b = ast.nat(2);
    let q = ast.apply("/", vec![a, b]);
    let typed = check_expr(&mut ast, &q).unwrap();
    assert_eq!(typed.ty, Type::option(Type::pair(Type::Nat, Type::Nat)));
}

#[test]
fn unbound_variable_is_reported() {
    let mut ast = Ast::new();
    let expr = ast.var("ghost");
    let err = check_expr(&mut ast, &expr).unwrap_err();
    expect_kind(err, TypeErrorKind::UnboundVar);
}

#[test]
fn left_without_annotation_is_rejected() {
    let mut ast = Ast::new();
    let payload = ast.int(1);
    let expr = ast.e(ExprKind::Construct {
        ctor: "Left".to_string(),
        arg: Box::new(payload),
        ascribed: None,
    });
    let err = check_expr(&mut ast, &expr).unwrap_err();
    expect_kind(err, TypeErrorKind::UnannotatedSum);
}

#[test]
fn left_with_or_annotation_checks() {
    let mut ast = Ast::new();
    let payload = ast.int(1);
    let expr = ast.e(ExprKind::Construct {
        ctor: "Left".to_string(),
        arg: Box::new(payload),
        ascribed: Some(Type::or(Type::Int, Type::String_)),
    });
    let typed = check_expr(&mut ast, &expr).unwrap();
    assert_eq!(typed.ty, Type::or(Type::Int, Type::String_));
    assert!(matches!(typed.kind, TExprKind::Inject { left: true, .. }));
}

#[test]
fn match_nat_binds_naturals() {
    let mut ast = Ast::new();
    let scrut = ast.int(-3);
    let plus = ast.var("n");
    let minus = ast.var("m");
    let expr = ast.e(ExprKind::MatchNat {
        arg: Box::new(scrut),
        plus_name: Some("n".to_string()),
        ifplus: Box::new(plus),
        minus_name: Some("m".to_string()),
        ifminus: Box::new(minus),
    });
    let typed = check_expr(&mut ast, &expr).unwrap();
    assert_eq!(typed.ty, Type::Nat);
}

#[test]
fn use_counts_and_inline_flags() {
    let mut ast = Ast::new();
    let one = ast.int(1);
    let x1 = ast.var("x");
    let x2 = ast.var("x");
    let sum = ast.apply("+", vec![x1, x2]);
    let expr = ast.let_("x", one, sum);
    let typed = check_expr(&mut ast, &expr).unwrap();
    match &typed.kind {
        TExprKind::Let { uses, inline, .. } => {
            assert_eq!(*uses, 2);
            assert!(!inline);
        }
        other => panic!("expected a let, got {:?}", other),
    }

    let mut ast = Ast::new();
    let one = ast.int(1);
    let x = ast.var("x");
    let expr = ast.let_("x", one, x);
    let typed = check_expr(&mut ast, &expr).unwrap();
    match &typed.kind {
        TExprKind::Let { uses, inline, .. } => {
            assert_eq!(*uses, 1);
            assert!(inline);
        }
        other => panic!("expected a let, got {:?}", other),
    }
}

#[test]
fn transfer_inside_lambda_is_rejected() {
    let mut ast = Ast::new();
    let contract = ast.e(ExprKind::Const {
        value: Const::Address("KT1target".to_string()),
        ascribed: None,
    });
    let contract_at = ast.e(ExprKind::ContractAt {
        addr: Box::new(contract),
        ty: Type::Unit,
    });
    let failwith_arg = ast.e(ExprKind::Const {
        value: Const::String("no contract".to_string()),
        ascribed: None,
    });
    let none_branch = ast.e(ExprKind::Failwith(Box::new(failwith_arg)));
    let some_var = ast.var("c");
    let amount = ast.e(ExprKind::Const {
        value: Const::Tez(0),
        ascribed: None,
    });
    let unit = ast.e(ExprKind::Const {
        value: Const::Unit,
        ascribed: None,
    });
    let transfer = ast.e(ExprKind::Transfer {
        contract: Box::new(some_var),
        amount: Box::new(amount),
        arg: Box::new(unit),
    });
    let matched = ast.e(ExprKind::MatchOption {
        arg: Box::new(contract_at),
        ifnone: Box::new(none_branch),
        some_name: Some("c".to_string()),
        ifsome: Box::new(transfer),
    });
    let lambda = ast.e(ExprKind::Lambda {
        param: "u".to_string(),
        param_ty: Type::Unit,
        ret_ty: None,
        rec_name: None,
        body: Box::new(matched),
    });
    let err = check_expr(&mut ast, &lambda).unwrap_err();
    expect_kind(err, TypeErrorKind::ForbiddenEffect);
}

#[test]
fn ambiguous_field_registration_is_rejected() {
    let mut env = Env::new();
    env.register_record("a", vec![("x".to_string(), Type::Int)]).unwrap();
    let err = env
        .register_record("b", vec![("x".to_string(), Type::Nat)])
        .unwrap_err();
    match err {
        CompilerError::Type { kind, .. } => assert_eq!(kind, TypeErrorKind::UnknownField),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn record_projection_carries_index_and_label() {
    let mut env = Env::new();
    env.register_record(
        "point",
        vec![("x".to_string(), Type::Int), ("y".to_string(), Type::Int)],
    )
    .unwrap();
    let mut ast = Ast::new();
    let one = ast.int(1);
    let two = ast.int(2);
    let lit = ast.e(ExprKind::RecordLit(vec![
        ("x".to_string(), one),
        ("y".to_string(), two),
    ]));
    let field = ast.e(ExprKind::Field {
        record: Box::new(lit),
        field: "y".to_string(),
    });
    let mut checker = TypeChecker::new(&env);
    let typed = checker.check(&field, None).unwrap();
    assert_eq!(typed.ty, Type::Int);
    match &typed.kind {
        TExprKind::Proj { index, label, .. } => {
            assert_eq!(*index, 1);
            assert_eq!(label.as_deref(), Some("y"));
        }
        other => panic!("expected a projection, got {:?}", other),
    }
}

#[test]
fn storage_initializer_rejects_sender() {
    let mut ast = Ast::new();
    let sender = ast.apply("Current.sender", vec![]);
    let decl = ContractDecl {
        name: "bad_init".to_string(),
        version: None,
        storage: Type::Address,
        types: vec![],
        values: vec![],
        entries: vec![EntryDecl {
            name: "main".to_string(),
            param_name: "p".to_string(),
            param_ty: Type::Unit,
            storage_name: "s".to_string(),
            body: {
                let nil = ast.e(ExprKind::Const {
                    value: Const::List(vec![]),
                    ascribed: Some(Type::list(Type::Operation)),
                });
                let s = ast.var("s");
                ast.e(ExprKind::Tuple(vec![nil, s]))
            },
        }],
        init: Some(InitDecl {
            params: vec![],
            body: sender,
        }),
    };
    let env = Env::new();
    let mut checker = TypeChecker::new(&env);
    let err = checker.check_contract(&decl).unwrap_err();
    expect_kind(err, TypeErrorKind::ForbiddenEffect);
}

#[test]
fn bigmap_outside_first_storage_slot_is_rejected() {
    let storage = Type::Tuple(vec![
        Type::Int,
        Type::BigMap(Box::new(Type::String_), Box::new(Type::Int)),
    ]);
    let mut ast = Ast::new();
    let decl = ContractDecl {
        name: "bad_bigmap".to_string(),
        version: None,
        storage,
        types: vec![],
        values: vec![],
        entries: vec![EntryDecl {
            name: "main".to_string(),
            param_name: "p".to_string(),
            param_ty: Type::Unit,
            storage_name: "s".to_string(),
            body: {
                let nil = ast.e(ExprKind::Const {
                    value: Const::List(vec![]),
                    ascribed: Some(Type::list(Type::Operation)),
                });
                let s = ast.var("s");
                ast.e(ExprKind::Tuple(vec![nil, s]))
            },
        }],
        init: None,
    };
    let env = Env::new();
    let mut checker = TypeChecker::new(&env);
    let err = checker.check_contract(&decl).unwrap_err();
    expect_kind(err, TypeErrorKind::BadBigMap);
}

#[test]
fn lambda_capturing_a_variable_becomes_a_closure() {
    let mut ast = Ast::new();
    let one = ast.int(1);
    let x = ast.var("x");
    let y = ast.var("y");
    let body = ast.apply("+", vec![y, x]);
    let lambda = ast.e(ExprKind::Lambda {
        param: "y".to_string(),
        param_ty: Type::Int,
        ret_ty: None,
        rec_name: None,
        body: Box::new(body),
    });
    let expr = ast.let_("x", one, lambda);
    let typed = check_expr(&mut ast, &expr).unwrap();
    match &typed.kind {
        TExprKind::Let { body, .. } => match &body.kind {
            TExprKind::Closure { captured, .. } => {
                assert_eq!(captured.len(), 1);
                assert_eq!(captured[0].0, "x");
            }
            other => panic!("expected a closure, got {:?}", other),
        },
        other => panic!("expected a let, got {:?}", other),
    }
}
