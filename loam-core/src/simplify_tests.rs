//! Tests for the simplification pass.

use crate::ast::{NodeId, Span};
use crate::checker::count_uses;
use crate::simplify::simplify;
use crate::tir::{Prim, TExpr, TExprKind};
use crate::types::{Const, Type};

fn texpr(ty: Type, kind: TExprKind) -> TExpr {
    TExpr::new(NodeId(0), ty, kind, Span::new(1, 1, 1, 1))
}

fn int(i: i128) -> TExpr {
    texpr(Type::Int, TExprKind::Const(Const::Int(i)))
}

fn var(name: &str) -> TExpr {
    texpr(Type::Int, TExprKind::Var(name.to_string()))
}

fn let_(name: &str, value: TExpr, body: TExpr) -> TExpr {
    let uses = count_uses(&body, name);
    let inline = uses == 1 && value.is_pure();
    texpr(
        body.ty.clone(),
        TExprKind::Let {
            name: name.to_string(),
            uses,
            inline,
            value: Box::new(value),
            body: Box::new(body),
        },
    )
}

fn add(a: TExpr, b: TExpr) -> TExpr {
    texpr(
        Type::Int,
        TExprKind::Apply {
            prim: Prim::Add,
            args: vec![a, b],
        },
    )
}

#[test]
fn one_use_binding_is_inlined() {
    let expr = let_("x", int(1), add(var("x"), int(2)));
    let simplified = simplify(&expr);
    match &simplified.kind {
        TExprKind::Apply { args, .. } => {
            assert!(matches!(args[0].kind, TExprKind::Const(Const::Int(1))));
        }
        other => panic!("let was not inlined: {:?}", other),
    }
    // The inlined binding leaves no reference behind.
    assert_eq!(count_uses(&simplified, "x"), 0);
}

#[test]
fn two_use_binding_is_kept() {
    let expr = let_("x", int(1), add(var("x"), var("x")));
    let simplified = simplify(&expr);
    assert!(matches!(
        simplified.kind,
        TExprKind::Let { uses: 2, .. }
    ));
}

#[test]
fn unused_pure_binding_is_dropped() {
    let expr = let_("x", int(1), int(9));
    let simplified = simplify(&expr);
    assert!(matches!(simplified.kind, TExprKind::Const(Const::Int(9))));
}

#[test]
fn failing_binding_is_not_dropped() {
    let msg = texpr(
        Type::String_,
        TExprKind::Const(Const::String("boom".to_string())),
    );
    let fail = texpr(Type::Int, TExprKind::Failwith(Box::new(msg)));
    let expr = let_("x", fail, int(9));
    let simplified = simplify(&expr);
    assert!(matches!(simplified.kind, TExprKind::Let { .. }));
}

#[test]
fn dropping_exposes_further_dead_bindings() {
    // let a = 1 in let b = a in 9  =>  9
    // (removing b strands a, which must then be removed too)
    let inner = let_("b", var("a"), int(9));
    let expr = let_("a", int(1), inner);
    let simplified = simplify(&expr);
    assert!(matches!(simplified.kind, TExprKind::Const(Const::Int(9))));
}

#[test]
fn inlining_stops_at_capture() {
    // let y = 0 in let x = y in (let y = 1 in x + y)
    // Inlining x into the shadowed scope would capture the inner y.
    let shadowed_body = add(var("x"), var("y"));
    let inner_let = let_("y", int(1), shadowed_body);
    let x_let = let_("x", var("y"), inner_let);
    let expr = let_("y", int(0), x_let);
    let simplified = simplify(&expr);
    // x must still be bound somewhere in the result.
    fn has_let_named(e: &TExpr, name: &str) -> bool {
        match &e.kind {
            TExprKind::Let { name: n, value, body, .. } => {
                n == name || has_let_named(value, name) || has_let_named(body, name)
            }
            kind => kind.subterms().iter().any(|sub| has_let_named(sub, name)),
        }
    }
    assert!(has_let_named(&simplified, "x"), "capturing inline must be refused");
}
