//! Decompilation driver: from a parsed wire-format contract back to a
//! surface-language contract declaration.
//!
//! The symbolic interpreter reconstructs a named expression for the
//! code body; this module recovers the contract shape around it:
//! parameter/storage types, the entry-point split from the `%entry_`
//! arm annotations of the parameter type, and the frame variable names.
//! The result is an untyped surface AST, which the caller feeds to the
//! typechecker in decompiling mode.

use crate::asm::{ContractCode, MContract, MExpr};
use crate::ast::{ContractDecl, EntryDecl, ExprKind, Expression, NodeCounter};
use crate::emit::{mexpr_to_instrs, mexpr_to_type};
use crate::error::Result;
use crate::interp::Interp;
use crate::types::Type;
use log::debug;

/// Decompile a parsed wire contract.
pub fn decompile_contract(
    nc: &mut NodeCounter,
    contract: &MContract,
    ignore_annots: bool,
) -> Result<ContractDecl> {
    let code = ContractCode {
        parameter: mexpr_to_type(&contract.parameter)?,
        storage: mexpr_to_type(&contract.storage)?,
        code: mexpr_to_instrs(&contract.code)?,
    };
    let entry_names = entry_names_of(&contract.parameter);
    decompile(nc, &code, &entry_names, ignore_annots)
}

/// Decompile an already-decoded contract (used for nested
/// CREATE_CONTRACT bodies, which carry no entry annotations).
pub fn decompile_code(
    nc: &mut NodeCounter,
    code: &ContractCode,
    ignore_annots: bool,
) -> Result<ContractDecl> {
    decompile(nc, code, &[], ignore_annots)
}

fn decompile(
    nc: &mut NodeCounter,
    code: &ContractCode,
    entry_names: &[String],
    ignore_annots: bool,
) -> Result<ContractDecl> {
    debug!("decompiling ({} entry annotations)", entry_names.len());
    let mut interp = Interp::new(nc, ignore_annots);
    let (body, param_name, storage_name) = interp.run_entry(code)?;

    let entries = match split_entries(&body, &param_name, &storage_name, &code.parameter, entry_names)
    {
        Some(entries) => entries,
        None => vec![EntryDecl {
            name: "main".to_string(),
            param_name,
            param_ty: code.parameter.clone(),
            storage_name,
            body,
        }],
    };

    Ok(ContractDecl {
        name: "decompiled".to_string(),
        version: Some("0.4".to_string()),
        storage: code.storage.clone(),
        types: vec![],
        values: vec![],
        entries,
        init: None,
    })
}

/// Entry names recovered from `%entry_NAME` annotations on the
/// parameter's or-comb arms, outermost-left first. Empty when the
/// parameter does not follow the dispatch convention.
pub fn entry_names_of(parameter: &MExpr) -> Vec<String> {
    fn annot_name(e: &MExpr) -> Option<String> {
        if let MExpr::Prim { annots, .. } = e {
            annots
                .iter()
                .find(|a| a.starts_with("%entry_"))
                .map(|a| a["%entry_".len()..].to_string())
        } else {
            None
        }
    }
    let mut names = Vec::new();
    let mut cursor = parameter;
    loop {
        match cursor {
            MExpr::Prim { name, args, .. } if name == "or" && args.len() == 2 => {
                match annot_name(&args[0]) {
                    Some(n) => names.push(n),
                    None => return vec![],
                }
                if let Some(last) = annot_name(&args[1]) {
                    names.push(last);
                    return names;
                }
                cursor = &args[1];
            }
            other => {
                // A single annotated arm is a one-entry contract.
                match annot_name(other) {
                    Some(n) if names.is_empty() => return vec![n],
                    _ => return vec![],
                }
            }
        }
    }
}

/// Undo the dispatch synthesis: a body that is a nested Left/Right
/// match on the parameter splits back into per-entry declarations.
fn split_entries(
    body: &Expression,
    param_name: &str,
    storage_name: &str,
    param_ty: &Type,
    entry_names: &[String],
) -> Option<Vec<EntryDecl>> {
    if entry_names.len() < 2 {
        return None;
    }
    let mut entries = Vec::with_capacity(entry_names.len());
    let mut remaining = entry_names;
    let mut scrut = param_name.to_string();
    let mut cursor_ty = param_ty.clone();
    let mut cursor = body;

    while remaining.len() > 1 {
        let (left_ty, right_ty) = match &cursor_ty {
            Type::Or(l, r) => (l.as_ref().clone(), r.as_ref().clone()),
            _ => return None,
        };
        let cases = match &cursor.kind {
            ExprKind::MatchVariant { arg, cases } if cases.len() == 2 => match &arg.kind {
                ExprKind::Var(v) if *v == scrut => cases,
                _ => return None,
            },
            _ => return None,
        };
        let left = &cases[0];
        let right = &cases[1];
        if left.ctor != "Left" || right.ctor != "Right" {
            return None;
        }
        entries.push(EntryDecl {
            name: remaining[0].clone(),
            param_name: left.var.clone()?,
            param_ty: left_ty,
            storage_name: storage_name.to_string(),
            body: left.body.clone(),
        });
        remaining = &remaining[1..];
        if remaining.len() == 1 {
            entries.push(EntryDecl {
                name: remaining[0].clone(),
                param_name: right.var.clone()?,
                param_ty: right_ty,
                storage_name: storage_name.to_string(),
                body: right.body.clone(),
            });
            return Some(entries);
        }
        scrut = right.var.clone()?;
        cursor_ty = right_ty;
        cursor = &right.body;
    }
    None
}
