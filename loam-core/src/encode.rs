//! Encoding pass: canonicalize the typed IR for code generation.
//!
//! - records become labeled tuples, variant constructors become nested
//!   `Left`/`Right` injections into a right-leaning `or` comb;
//! - the multi-entry contract becomes a single dispatching entry whose
//!   parameter is the `or`-sum of the entry parameter types;
//! - closures are converted to `(captured_env, lifted_lambda)` pairs and
//!   closure application re-pairs the argument with the environment;
//! - tail-recursive lambdas are rewritten onto the target's LOOP_LEFT;
//! - leftover polymorphic primitives are internal errors.
//!
//! Types are preserved modulo binarization: the output tree is fully
//! structural (no named record/variant types remain).

use crate::ast::{NodeCounter, Span};
use crate::error::Result;
use crate::tir::{map_subterms, Contract, Init, Prim, TExpr, TExprKind, VariantCase};
use crate::types::{Const, Env, Type};
use crate::{bail_encode_at, err_internal};
use log::debug;

/// The canonical single-entry program produced by encoding.
#[derive(Debug, Clone)]
pub struct EncodedProgram {
    pub name: String,
    /// Binarized contract parameter: the or-comb over entries.
    pub parameter: Type,
    pub storage: Type,
    /// Entry names in declaration order, used as `%entry_NAME` arm
    /// annotations on the parameter type (and recovered by the
    /// decompiler).
    pub entry_names: Vec<String>,
    pub param_name: String,
    pub storage_name: String,
    /// Typed `(operation list, storage)` body over the frame bindings.
    pub body: TExpr,
    pub initializer: Option<EncodedInit>,
}

/// Encoded storage initializer: either a compile-time constant or an
/// initializer contract evaluating the storage value.
#[derive(Debug, Clone)]
pub enum EncodedInit {
    Constant(Const),
    Code {
        /// Tuple of the initializer's declared parameters.
        parameter: Type,
        param_names: Vec<String>,
        storage_name: String,
        body: TExpr,
    },
}

pub fn encode_contract(env: &Env, contract: &Contract, nc: &mut NodeCounter) -> Result<EncodedProgram> {
    let mut encoder = Encoder {
        env,
        nc,
        init_storage: None,
        init_storage_name: "storage".to_string(),
    };
    encoder.contract(contract)
}

struct Encoder<'a> {
    env: &'a Env,
    nc: &'a mut NodeCounter,
    /// Set while encoding the storage initializer body: the binarized
    /// storage type. `BigMap.empty` is rewritten to a projection of
    /// storage slot 0 in that context.
    init_storage: Option<Type>,
    init_storage_name: String,
}

impl<'a> Encoder<'a> {
    fn mk(&mut self, ty: Type, kind: TExprKind, span: Span) -> TExpr {
        TExpr::new(self.nc.next_id(), ty, kind, span)
    }

    fn var(&mut self, name: &str, ty: Type, span: Span) -> TExpr {
        self.mk(ty, TExprKind::Var(name.to_string()), span)
    }

    fn contract(&mut self, contract: &Contract) -> Result<EncodedProgram> {
        debug!("encoding contract {}", contract.name);
        let storage = self.env.binarize(&contract.storage)?;
        let entry_names: Vec<String> =
            contract.entries.iter().map(|e| format!("entry_{}", e.name)).collect();

        let param_tys: Result<Vec<Type>> = contract
            .entries
            .iter()
            .map(|e| self.env.binarize(&e.param_ty))
            .collect();
        let param_tys = param_tys?;
        let parameter = crate::types::right_comb_or(param_tys.clone());

        let (param_name, storage_name, body) = if contract.entries.len() == 1 {
            let entry = &contract.entries[0];
            let body = self.expr(&entry.body)?;
            let body = self.wrap_globals(contract, body)?;
            (entry.param_name.clone(), entry.storage_name.clone(), body)
        } else {
            // Synthesize the dispatch: nested matches over the or-comb,
            // each arm binding the entry's own parameter name. Every
            // entry shares the storage frame slot, so the dispatch
            // normalizes the storage name.
            let storage_name = "storage".to_string();
            let mut bodies = Vec::with_capacity(contract.entries.len());
            for entry in &contract.entries {
                let mut body = self.expr(&entry.body)?;
                if entry.storage_name != storage_name {
                    body = self.rename_var(&body, &entry.storage_name, &storage_name);
                }
                bodies.push(body);
            }
            let body = self.dispatch(contract, &param_tys, bodies, &parameter)?;
            let body = self.wrap_globals(contract, body)?;
            ("parameter".to_string(), storage_name, body)
        };

        let initializer = match &contract.init {
            Some(init) => Some(self.initializer(contract, init)?),
            None => None,
        };

        Ok(EncodedProgram {
            name: contract.name.clone(),
            parameter,
            storage,
            entry_names,
            param_name,
            storage_name,
            body,
            initializer,
        })
    }

    /// Build the nested dispatch over entries. `param_tys` are already
    /// binarized; `bodies` are the encoded entry bodies.
    fn dispatch(
        &mut self,
        contract: &Contract,
        param_tys: &[Type],
        mut bodies: Vec<TExpr>,
        parameter: &Type,
    ) -> Result<TExpr> {
        fn build(
            enc: &mut Encoder,
            contract: &Contract,
            index: usize,
            scrut: TExpr,
            param_tys: &[Type],
            bodies: &mut Vec<TExpr>,
        ) -> TExpr {
            let remaining = param_tys.len() - index;
            if remaining == 1 {
                // Single remaining entry: bind its parameter directly.
                let entry = &contract.entries[index];
                let body = bodies.remove(0);
                let ty = body.ty.clone();
                let span = body.span;
                let value = scrut;
                return enc.mk(
                    ty.clone(),
                    TExprKind::Let {
                        name: entry.param_name.clone(),
                        uses: crate::checker::count_uses(&body, &entry.param_name),
                        inline: false,
                        value: Box::new(value),
                        body: Box::new(body),
                    },
                    span,
                );
            }
            let entry = &contract.entries[index];
            let left_body = bodies.remove(0);
            let rest_ty = crate::types::right_comb_or(param_tys[index + 1..].to_vec());
            let rest_name = format!("_param_{}", index + 1);
            let rest_var = enc.var(&rest_name, rest_ty, left_body.span);
            let right_body = build(enc, contract, index + 1, rest_var, param_tys, bodies);
            let ty = left_body.ty.clone();
            let span = left_body.span;
            enc.mk(
                ty,
                TExprKind::MatchVariant {
                    arg: Box::new(scrut),
                    cases: vec![
                        VariantCase {
                            ctor: format!("entry_{}", entry.name),
                            var: Some(entry.param_name.clone()),
                            body: left_body,
                        },
                        VariantCase {
                            ctor: String::new(),
                            var: Some(rest_name),
                            body: right_body,
                        },
                    ],
                },
                span,
            )
        }

        let scrut = self.var("parameter", parameter.clone(), Span::generated());
        Ok(build(self, contract, 0, scrut, param_tys, &mut bodies))
    }

    /// Prefix `body` with let bindings for the contract's global values,
    /// in declaration order. Unused globals are dropped by the
    /// simplifier.
    fn wrap_globals(&mut self, contract: &Contract, body: TExpr) -> Result<TExpr> {
        let mut result = body;
        for (name, value) in contract.values.iter().rev() {
            if crate::checker::count_uses(&result, name) == 0 {
                continue;
            }
            let value = self.expr(value)?;
            let uses = crate::checker::count_uses(&result, name);
            let inline = uses == 1 && value.is_pure();
            let ty = result.ty.clone();
            let span = result.span;
            result = self.mk(
                ty,
                TExprKind::Let {
                    name: name.clone(),
                    uses,
                    inline,
                    value: Box::new(value),
                    body: Box::new(result),
                },
                span,
            );
        }
        Ok(result)
    }

    fn initializer(&mut self, contract: &Contract, init: &Init) -> Result<EncodedInit> {
        self.init_storage = Some(self.env.binarize(&contract.storage)?);
        let body = self.expr(&init.body);
        self.init_storage = None;
        let body = body?;
        if let TExprKind::Const(c) = &body.kind {
            if !matches!(c, Const::EmptyBigMap) {
                return Ok(EncodedInit::Constant(c.clone()));
            }
        }
        let param_tys: Result<Vec<Type>> =
            init.params.iter().map(|(_, t)| self.env.binarize(t)).collect();
        let parameter = match param_tys?.as_slice() {
            [] => Type::Unit,
            [single] => single.clone(),
            many => Type::Tuple(many.to_vec()),
        };
        Ok(EncodedInit::Code {
            parameter,
            param_names: init.params.iter().map(|(n, _)| n.clone()).collect(),
            storage_name: self.init_storage_name.clone(),
            body,
        })
    }

    /// Substitute a variable name throughout (no capture concerns: the
    /// new name is a reserved frame name that user code cannot bind).
    fn rename_var(&mut self, expr: &TExpr, from: &str, to: &str) -> TExpr {
        fn walk(expr: &TExpr, from: &str, to: &str) -> Option<TExpr> {
            if let TExprKind::Var(name) = &expr.kind {
                if name == from {
                    let mut new = expr.clone();
                    new.kind = TExprKind::Var(to.to_string());
                    return Some(new);
                }
                return None;
            }
            map_subterms(expr, &mut |sub| walk(sub, from, to))
        }
        walk(expr, from, to).unwrap_or_else(|| expr.clone())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expr(&mut self, e: &TExpr) -> Result<TExpr> {
        let ty = self.env.binarize(&e.ty)?;
        let kind = match &e.kind {
            TExprKind::Var(_) => e.kind.clone(),

            TExprKind::Const(Const::EmptyBigMap) if self.init_storage.is_some() => {
                // The initializer receives the runtime-provided empty
                // bigmap pre-bound at storage slot 0.
                let storage_ty = self.init_storage.clone().unwrap_or(Type::Unit);
                let storage_name = self.init_storage_name.clone();
                let storage = self.var(&storage_name, storage_ty, e.span);
                TExprKind::Proj {
                    index: 0,
                    label: None,
                    tuple: Box::new(storage),
                }
            }
            TExprKind::Const(_) => e.kind.clone(),

            TExprKind::Construct { ctor, arg } => {
                return self.encode_construct(e, ctor, arg, &ty);
            }

            TExprKind::Closure {
                param,
                param_ty,
                ret_ty,
                captured,
                body,
            } => {
                return self.encode_closure(e, param, param_ty, ret_ty, captured, body);
            }

            TExprKind::Lambda {
                param,
                param_ty,
                ret_ty,
                rec_name: Some(rec),
                body,
            } => {
                return self.encode_rec_lambda(e, param, param_ty, ret_ty, rec, body);
            }

            TExprKind::Call { func, arg } => {
                let func = self.expr(func)?;
                let arg = self.expr(arg)?;
                match closure_parts(&func.ty) {
                    Some((env_ty, lam_ty)) => {
                        // let _clo = func in (cdr _clo) exec (car _clo, arg)
                        let span = e.span;
                        let clo_name = "_clo".to_string();
                        let clo_var = self.var(&clo_name, func.ty.clone(), span);
                        let env_proj = self.mk(
                            env_ty.clone(),
                            TExprKind::Proj {
                                index: 0,
                                label: None,
                                tuple: Box::new(clo_var.clone()),
                            },
                            span,
                        );
                        let lam_proj = self.mk(
                            lam_ty.clone(),
                            TExprKind::Proj {
                                index: 1,
                                label: None,
                                tuple: Box::new(clo_var),
                            },
                            span,
                        );
                        let arg_ty = arg.ty.clone();
                        let paired = self.mk(
                            Type::pair(env_ty, arg_ty),
                            TExprKind::Tuple(vec![env_proj, arg]),
                            span,
                        );
                        let call = self.mk(
                            ty.clone(),
                            TExprKind::Call {
                                func: Box::new(lam_proj),
                                arg: Box::new(paired),
                            },
                            span,
                        );
                        let let_expr = self.mk(
                            ty,
                            TExprKind::Let {
                                name: clo_name,
                                uses: 2,
                                inline: false,
                                value: Box::new(func),
                                body: Box::new(call),
                            },
                            span,
                        );
                        return Ok(let_expr.with_name(e.name.clone()));
                    }
                    None => TExprKind::Call {
                        func: Box::new(func),
                        arg: Box::new(arg),
                    },
                }
            }

            TExprKind::Apply { prim, args } => {
                if matches!(
                    prim,
                    Prim::Unknown
                        | Prim::Size
                        | Prim::Mem
                        | Prim::Get
                        | Prim::Update
                        | Prim::Rev
                        | Prim::Fold
                        | Prim::Map_
                        | Prim::MapFold_
                ) {
                    return Err(err_internal!(
                        "encode",
                        "polymorphic primitive {} survived typechecking",
                        prim
                    ));
                }
                let args: Result<Vec<TExpr>> = args.iter().map(|a| self.expr(a)).collect();
                TExprKind::Apply {
                    prim: *prim,
                    args: args?,
                }
            }

            // Structural recursion for everything else, with types
            // rewritten in embedded positions.
            _ => {
                let mut failed = None;
                let rebuilt = map_subterms(e, &mut |sub| match self.expr(sub) {
                    Ok(new) => Some(new),
                    Err(err) => {
                        failed = Some(err);
                        None
                    }
                });
                if let Some(err) = failed {
                    return Err(err);
                }
                let rebuilt = rebuilt.unwrap_or_else(|| e.clone());
                let kind = self.binarize_embedded(rebuilt.kind)?;
                return Ok(TExpr {
                    id: e.id,
                    ty,
                    kind,
                    span: e.span,
                    name: e.name.clone(),
                    transfer: e.transfer,
                });
            }
        };
        Ok(TExpr {
            id: e.id,
            ty,
            kind,
            span: e.span,
            name: e.name.clone(),
            transfer: e.transfer,
        })
    }

    /// Rewrite type annotations embedded in node payloads.
    fn binarize_embedded(&mut self, kind: TExprKind) -> Result<TExprKind> {
        Ok(match kind {
            TExprKind::Lambda {
                param,
                param_ty,
                ret_ty,
                rec_name,
                body,
            } => TExprKind::Lambda {
                param,
                param_ty: self.env.binarize(&param_ty)?,
                ret_ty: self.env.binarize(&ret_ty)?,
                rec_name,
                body,
            },
            TExprKind::ContractAt { addr, ty } => TExprKind::ContractAt {
                addr,
                ty: self.env.binarize(&ty)?,
            },
            TExprKind::Unpack { arg, ty } => TExprKind::Unpack {
                arg,
                ty: self.env.binarize(&ty)?,
            },
            other => other,
        })
    }

    /// Variant constructor -> nested Left/Right injection. The
    /// outermost injection carries the constructor annotation.
    fn encode_construct(&mut self, e: &TExpr, ctor: &str, arg: &TExpr, or_ty: &Type) -> Result<TExpr> {
        let variant_name = match &e.ty {
            Type::Variant(name) => name.clone(),
            other => {
                return Err(err_internal!("encode", "Construct node typed {} (not a variant)", other))
            }
        };
        let ctors = self
            .env
            .variant_ctors(&variant_name)
            .ok_or_else(|| err_internal!("encode", "variant {} not registered", variant_name))?;
        let index = ctors
            .iter()
            .position(|(l, _)| l == ctor)
            .ok_or_else(|| err_internal!("encode", "constructor {} not in variant {}", ctor, variant_name))?;
        let count = ctors.len();
        let arg = self.expr(arg)?;

        // Walk down the right spine to the injection point, then build
        // back out. At each level the or-type narrows to its right arm.
        let path = Env::ctor_path(index, count);
        let mut level_tys = Vec::with_capacity(path.len());
        let mut cursor = or_ty.clone();
        for step_left in &path {
            match (&cursor, step_left) {
                (Type::Or(l, r), true) => {
                    level_tys.push((l.as_ref().clone(), r.as_ref().clone()));
                    break;
                }
                (Type::Or(l, r), false) => {
                    level_tys.push((l.as_ref().clone(), r.as_ref().clone()));
                    cursor = r.as_ref().clone();
                }
                (other, _) => {
                    bail_encode_at!(e.span, "constructor path does not match or-type {}", other)
                }
            }
        }

        let mut result = arg;
        for (depth, step_left) in path.iter().enumerate().rev() {
            let (l, r) = &level_tys[depth];
            let annot = if depth == 0 { Some(ctor.to_string()) } else { None };
            let this_ty = Type::or(l.clone(), r.clone());
            // The last step of the path for a trailing constructor is
            // Right into the innermost or; all earlier steps are Right,
            // the terminal step of non-last constructors is Left.
            result = self.mk(
                this_ty,
                TExprKind::Inject {
                    left: *step_left,
                    ctor: annot,
                    arg: Box::new(result),
                },
                e.span,
            );
        }
        Ok(result.with_name(e.name.clone()))
    }

    /// Closure conversion: `(captured_env, lifted_lambda)` where the
    /// lifted lambda takes `(env, arg)` and rebinds the captured names
    /// from the environment tuple.
    fn encode_closure(
        &mut self,
        e: &TExpr,
        param: &str,
        param_ty: &Type,
        ret_ty: &Type,
        captured: &[(String, Type)],
        body: &TExpr,
    ) -> Result<TExpr> {
        let span = e.span;
        let param_ty = self.env.binarize(param_ty)?;
        let ret_ty = self.env.binarize(ret_ty)?;
        let cap_tys: Result<Vec<Type>> = captured.iter().map(|(_, t)| self.env.binarize(t)).collect();
        let cap_tys = cap_tys?;
        let env_ty = Type::Tuple(cap_tys.clone());
        let lifted_param_ty = Type::pair(env_ty.clone(), param_ty.clone());

        let body = self.expr(body)?;

        // fun _env_arg ->
        //   let <param> = _env_arg.(1) in
        //   let c_i = _env_arg.(0).(i) in ... body
        let lifted_param = "_env_arg".to_string();
        let mut inner = body;
        for (i, (cap_name, _)) in captured.iter().enumerate().rev() {
            let arg_var = self.var(&lifted_param, lifted_param_ty.clone(), span);
            let env_proj = self.mk(
                env_ty.clone(),
                TExprKind::Proj {
                    index: 0,
                    label: None,
                    tuple: Box::new(arg_var),
                },
                span,
            );
            let cap_proj = self.mk(
                cap_tys[i].clone(),
                TExprKind::Proj {
                    index: i,
                    label: None,
                    tuple: Box::new(env_proj),
                },
                span,
            );
            let uses = crate::checker::count_uses(&inner, cap_name);
            let ty = inner.ty.clone();
            inner = self.mk(
                ty,
                TExprKind::Let {
                    name: cap_name.clone(),
                    uses,
                    inline: false,
                    value: Box::new(cap_proj.with_name(Some(cap_name.clone()))),
                    body: Box::new(inner),
                },
                span,
            );
        }
        let arg_var = self.var(&lifted_param, lifted_param_ty.clone(), span);
        let param_proj = self.mk(
            param_ty.clone(),
            TExprKind::Proj {
                index: 1,
                label: None,
                tuple: Box::new(arg_var),
            },
            span,
        );
        let uses = crate::checker::count_uses(&inner, param);
        let ty = inner.ty.clone();
        let inner = self.mk(
            ty,
            TExprKind::Let {
                name: param.to_string(),
                uses,
                inline: false,
                value: Box::new(param_proj.with_name(Some(param.to_string()))),
                body: Box::new(inner),
            },
            span,
        );

        let lifted = self.mk(
            Type::lambda(lifted_param_ty.clone(), ret_ty.clone()),
            TExprKind::Lambda {
                param: lifted_param,
                param_ty: lifted_param_ty,
                ret_ty: ret_ty.clone(),
                rec_name: None,
                body: Box::new(inner),
            },
            span,
        );

        let env_items: Vec<TExpr> = captured
            .iter()
            .zip(&cap_tys)
            .map(|((name, _), ty)| self.var(name, ty.clone(), span))
            .collect();
        let env_tuple = self.mk(env_ty.clone(), TExprKind::Tuple(env_items), span);
        let pair_ty = Type::pair(env_ty, lifted.ty.clone());
        Ok(self
            .mk(pair_ty, TExprKind::Tuple(vec![env_tuple, lifted]), span)
            .with_name(e.name.clone()))
    }

    /// Tail-recursive lambda -> LOOP_LEFT. Tail self-calls become
    /// `Left next_arg`, tail results become `Right result`; a self
    /// reference anywhere else is an error.
    fn encode_rec_lambda(
        &mut self,
        e: &TExpr,
        param: &str,
        param_ty: &Type,
        ret_ty: &Type,
        rec: &str,
        body: &TExpr,
    ) -> Result<TExpr> {
        let span = e.span;
        let param_ty = self.env.binarize(param_ty)?;
        let ret_ty = self.env.binarize(ret_ty)?;
        let body = self.expr(body)?;
        let or_ty = Type::or(param_ty.clone(), ret_ty.clone());
        let rewritten = self.rec_to_or(&body, rec, &or_ty)?;

        let state_name = format!("_{}_state", rec);
        let init = self.var(param, param_ty.clone(), span);
        let renamed = self.rename_var(&rewritten, param, &state_name);
        let loop_body = self.mk(
            ret_ty.clone(),
            TExprKind::LoopLeft {
                name: state_name,
                body: Box::new(renamed),
                init: Box::new(init),
                acc: None,
            },
            span,
        );
        Ok(self
            .mk(
                Type::lambda(param_ty.clone(), ret_ty.clone()),
                TExprKind::Lambda {
                    param: param.to_string(),
                    param_ty,
                    ret_ty,
                    rec_name: None,
                    body: Box::new(loop_body),
                },
                span,
            )
            .with_name(e.name.clone()))
    }

    /// Rewrite the tail positions of a recursive lambda body into
    /// `or param ret` injections.
    fn rec_to_or(&mut self, body: &TExpr, rec: &str, or_ty: &Type) -> Result<TExpr> {
        if uses_rec_non_tail(body, rec) {
            bail_encode_at!(
                body.span,
                "recursive call to {} outside tail position cannot be encoded",
                rec
            );
        }
        self.rec_tail(body, rec, or_ty)
    }

    fn rec_tail(&mut self, body: &TExpr, rec: &str, or_ty: &Type) -> Result<TExpr> {
        let span = body.span;
        match &body.kind {
            TExprKind::Call { func, arg } if is_var(func, rec) => {
                let arg = self.expr(arg)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::Inject {
                        left: true,
                        ctor: None,
                        arg: Box::new(arg),
                    },
                    span,
                ))
            }
            TExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(cond)?;
                let then_branch = self.rec_tail(then_branch, rec, or_ty)?;
                let else_branch = self.rec_tail(else_branch, rec, or_ty)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    },
                    span,
                ))
            }
            TExprKind::Let {
                name,
                uses,
                inline,
                value,
                body: inner,
            } => {
                let value = self.expr(value)?;
                let inner = self.rec_tail(inner, rec, or_ty)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::Let {
                        name: name.clone(),
                        uses: *uses,
                        inline: *inline,
                        value: Box::new(value),
                        body: Box::new(inner),
                    },
                    span,
                ))
            }
            TExprKind::MatchOption {
                arg,
                ifnone,
                some_name,
                ifsome,
            } => {
                let arg = self.expr(arg)?;
                let ifnone = self.rec_tail(ifnone, rec, or_ty)?;
                let ifsome = self.rec_tail(ifsome, rec, or_ty)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::MatchOption {
                        arg: Box::new(arg),
                        ifnone: Box::new(ifnone),
                        some_name: some_name.clone(),
                        ifsome: Box::new(ifsome),
                    },
                    span,
                ))
            }
            TExprKind::MatchList {
                arg,
                head_name,
                tail_name,
                ifcons,
                ifnil,
            } => {
                let arg = self.expr(arg)?;
                let ifcons = self.rec_tail(ifcons, rec, or_ty)?;
                let ifnil = self.rec_tail(ifnil, rec, or_ty)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::MatchList {
                        arg: Box::new(arg),
                        head_name: head_name.clone(),
                        tail_name: tail_name.clone(),
                        ifcons: Box::new(ifcons),
                        ifnil: Box::new(ifnil),
                    },
                    span,
                ))
            }
            TExprKind::MatchNat {
                arg,
                plus_name,
                ifplus,
                minus_name,
                ifminus,
            } => {
                let arg = self.expr(arg)?;
                let ifplus = self.rec_tail(ifplus, rec, or_ty)?;
                let ifminus = self.rec_tail(ifminus, rec, or_ty)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::MatchNat {
                        arg: Box::new(arg),
                        plus_name: plus_name.clone(),
                        ifplus: Box::new(ifplus),
                        minus_name: minus_name.clone(),
                        ifminus: Box::new(ifminus),
                    },
                    span,
                ))
            }
            TExprKind::MatchVariant { arg, cases } => {
                let arg = self.expr(arg)?;
                let mut new_cases = Vec::with_capacity(cases.len());
                for case in cases {
                    new_cases.push(VariantCase {
                        ctor: case.ctor.clone(),
                        var: case.var.clone(),
                        body: self.rec_tail(&case.body, rec, or_ty)?,
                    });
                }
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::MatchVariant {
                        arg: Box::new(arg),
                        cases: new_cases,
                    },
                    span,
                ))
            }
            _ => {
                let done = self.expr(body)?;
                Ok(self.mk(
                    or_ty.clone(),
                    TExprKind::Inject {
                        left: false,
                        ctor: None,
                        arg: Box::new(done),
                    },
                    span,
                ))
            }
        }
    }
}

fn is_var(e: &TExpr, name: &str) -> bool {
    matches!(&e.kind, TExprKind::Var(v) if v == name)
}

/// `(env_ty, lambda (env, arg) ret)` components of an encoded closure
/// type, when `ty` is one.
fn closure_parts(ty: &Type) -> Option<(Type, Type)> {
    match ty {
        Type::Closure { arg, ret, env } => {
            let lam = Type::lambda(
                Type::pair(env.as_ref().clone(), arg.as_ref().clone()),
                ret.as_ref().clone(),
            );
            Some((env.as_ref().clone(), lam))
        }
        Type::Tuple(items) if items.len() == 2 => match &items[1] {
            Type::Lambda(arg, _) => match arg.as_ref() {
                Type::Tuple(pair) if pair.len() == 2 && pair[0] == items[0] => {
                    Some((items[0].clone(), items[1].clone()))
                }
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

/// True if `rec` is referenced anywhere other than as the function of a
/// tail call.
fn uses_rec_non_tail(body: &TExpr, rec: &str) -> bool {
    fn tail(body: &TExpr, rec: &str) -> bool {
        match &body.kind {
            TExprKind::Call { func, arg } if is_var(func, rec) => non_tail(arg, rec),
            TExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => non_tail(cond, rec) || tail(then_branch, rec) || tail(else_branch, rec),
            TExprKind::Let { value, body, .. } => non_tail(value, rec) || tail(body, rec),
            TExprKind::MatchOption {
                arg, ifnone, ifsome, ..
            } => non_tail(arg, rec) || tail(ifnone, rec) || tail(ifsome, rec),
            TExprKind::MatchNat {
                arg, ifplus, ifminus, ..
            } => non_tail(arg, rec) || tail(ifplus, rec) || tail(ifminus, rec),
            TExprKind::MatchList {
                arg, ifcons, ifnil, ..
            } => non_tail(arg, rec) || tail(ifcons, rec) || tail(ifnil, rec),
            TExprKind::MatchVariant { arg, cases } => {
                non_tail(arg, rec) || cases.iter().any(|c| tail(&c.body, rec))
            }
            _ => non_tail(body, rec),
        }
    }
    fn non_tail(e: &TExpr, rec: &str) -> bool {
        if is_var(e, rec) {
            return true;
        }
        e.kind.subterms().iter().any(|sub| non_tail(sub, rec))
    }
    tail(body, rec)
}
