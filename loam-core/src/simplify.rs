//! Simplification pass: one-use inlining and dead-binding elimination.
//!
//! Each pure binding referenced exactly once is inlined into its single
//! use site; pure bindings with no remaining references are deleted.
//! The pass is a semantic no-op, guarded by the purity of the bound
//! value. Reference counts are recomputed bottom-up so that deleting a
//! binding correctly updates the counts of the bindings it used.

use crate::checker::count_uses;
use crate::encode::{EncodedInit, EncodedProgram};
use crate::tir::{map_subterms, TExpr, TExprKind};
use log::debug;

pub fn simplify_program(mut program: EncodedProgram) -> EncodedProgram {
    debug!("simplifying {}", program.name);
    program.body = simplify(&program.body);
    if let Some(EncodedInit::Code { body, .. }) = &mut program.initializer {
        *body = simplify(body);
    }
    program
}

/// Simplify an expression tree. Unchanged subtrees are reused as-is.
pub fn simplify(expr: &TExpr) -> TExpr {
    simp(expr).unwrap_or_else(|| expr.clone())
}

fn simp(expr: &TExpr) -> Option<TExpr> {
    let rebuilt = map_subterms(expr, &mut simp);
    let current = rebuilt.as_ref().unwrap_or(expr);

    if let TExprKind::Let {
        name,
        value,
        body,
        ..
    } = &current.kind
    {
        if value.is_pure() {
            let uses = count_uses(body, name);
            if uses == 0 {
                return Some(body.as_ref().clone());
            }
            if uses == 1 {
                if let Some(inlined) = substitute_once(body, name, value) {
                    // Inlining may expose a new redex (for example a
                    // projection of a freshly inlined tuple), so give
                    // the subtree another look.
                    return Some(simplify(&inlined));
                }
            }
            // Keep the binding, with the recomputed count.
            let kind = TExprKind::Let {
                name: name.clone(),
                uses,
                inline: false,
                value: value.clone(),
                body: body.clone(),
            };
            return Some(TExpr {
                id: current.id,
                ty: current.ty.clone(),
                kind,
                span: current.span,
                name: current.name.clone(),
                transfer: current.transfer,
            });
        }
    }
    rebuilt
}

/// Replace the single occurrence of `Var(name)` in `body` with `value`.
/// Returns `None` when a binder on the path would capture one of the
/// value's free variables, in which case the binding must stay.
fn substitute_once(body: &TExpr, name: &str, value: &TExpr) -> Option<TExpr> {
    let mut value_free = Vec::new();
    let mut bound = std::collections::HashSet::new();
    crate::checker::collect_free_vars(value, &mut bound, &mut value_free);

    fn walk(
        body: &TExpr,
        name: &str,
        value: &TExpr,
        value_free: &[String],
        shadowers: &mut Vec<String>,
        blocked: &mut bool,
    ) -> Option<TExpr> {
        match &body.kind {
            TExprKind::Var(v) if v == name => {
                if value_free.iter().any(|fv| shadowers.contains(fv)) {
                    *blocked = true;
                    return None;
                }
                Some(value.clone())
            }
            kind => {
                // A binder shadowing `name` would make inner
                // occurrences refer to something else; they were not
                // counted, so there is nothing to replace below it.
                let names: Vec<String> = binder_names(kind);
                if names.iter().any(|n| n == name) {
                    return None;
                }
                let before = shadowers.len();
                shadowers.extend(names);
                let result = map_subterms(body, &mut |sub| {
                    walk(sub, name, value, value_free, shadowers, blocked)
                });
                shadowers.truncate(before);
                result
            }
        }
    }

    fn binder_names(kind: &TExprKind) -> Vec<String> {
        match kind {
            TExprKind::Let { name, .. } => vec![name.clone()],
            TExprKind::Lambda { param, rec_name, .. } => {
                let mut names = vec![param.clone()];
                names.extend(rec_name.clone());
                names
            }
            TExprKind::Closure { param, .. } => vec![param.clone()],
            TExprKind::MatchOption { some_name, .. } => some_name.iter().cloned().collect(),
            TExprKind::MatchNat {
                plus_name,
                minus_name,
                ..
            } => plus_name.iter().chain(minus_name).cloned().collect(),
            TExprKind::MatchList {
                head_name,
                tail_name,
                ..
            } => head_name.iter().chain(tail_name).cloned().collect(),
            TExprKind::MatchVariant { cases, .. } => {
                cases.iter().filter_map(|c| c.var.clone()).collect()
            }
            TExprKind::Loop { name, .. }
            | TExprKind::LoopLeft { name, .. }
            | TExprKind::Fold { name, .. }
            | TExprKind::MapOp { name, .. }
            | TExprKind::MapFold { name, .. } => vec![name.clone()],
            _ => vec![],
        }
    }

    let mut blocked = false;
    let mut shadowers = Vec::new();
    let result = walk(body, name, value, &value_free, &mut shadowers, &mut blocked);
    if blocked {
        return None;
    }
    result
}
