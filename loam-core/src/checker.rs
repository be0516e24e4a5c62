//! Bidirectional typechecker.
//!
//! Match arms, lambdas and let bodies check against an expected type
//! propagated downward; constants and applications synthesize upward.
//! Unification is structural and first-order: after checking, every node
//! carries a ground, fully monomorphic type.
//!
//! Beyond types, the checker performs the effect analysis (`transfer`
//! flags, forbidden-effect contexts) and use counting for the
//! simplifier's one-use inlining.

use crate::ast::{self, ContractDecl, ExprKind, Expression, Span, TypeDefKind};
use crate::error::{CompilerError, Result, TypeErrorKind};
use crate::tir::{Contract, Entry, Init, Prim, TExpr, TExprKind, VariantCase};
use crate::types::{right_comb_or, Const, Env, Type};
use crate::{bail_type_at, err_effect_at, err_internal, err_kind_at, err_type_at, err_unbound_at};
use log::debug;
use std::collections::HashSet;

/// A warning produced during type checking.
#[derive(Debug, Clone)]
pub enum TypeWarning {
    /// A let binding is never referenced in its body.
    UnusedBinding { name: String, span: Span },
}

impl TypeWarning {
    pub fn message(&self) -> String {
        match self {
            TypeWarning::UnusedBinding { name, .. } => {
                format!("unused binding {}", name)
            }
        }
    }

    pub fn span(&self) -> &Span {
        match self {
            TypeWarning::UnusedBinding { span, .. } => span,
        }
    }
}

/// Syntactic contexts in which the transfer effect is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EffectContext {
    Entry,
    LambdaBody,
    IterationBody,
    Initializer,
}

/// Lexical frames of value bindings. Contract code keeps only a
/// handful of names in scope at once, so frames are plain vectors
/// searched newest-first; a rebinding shadows the older entry the way
/// nested lets do.
struct Scopes {
    frames: Vec<Vec<(String, Type)>>,
}

impl Scopes {
    fn new() -> Self {
        Scopes {
            frames: vec![Vec::new()],
        }
    }

    fn enter(&mut self) {
        self.frames.push(Vec::new());
    }

    fn leave(&mut self) {
        debug_assert!(self.frames.len() > 1, "left the global frame");
        self.frames.pop();
    }

    fn bind(&mut self, name: String, ty: Type) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push((name, ty));
        }
    }

    fn find(&self, name: &str) -> Option<&Type> {
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .find(|(bound, _)| bound.as_str() == name)
            .map(|(_, ty)| ty)
    }
}

pub struct TypeChecker<'a> {
    env: &'a Env,
    scopes: Scopes,
    /// Parameter type of the whole contract (the or-sum over entries),
    /// used to type `Current.self`.
    self_param_ty: Option<Type>,
    effect_ctx: EffectContext,
    /// Decompiling mode tolerates unused bindings (no warning) and is
    /// used on the reconstruction path.
    decompiling: bool,
    warnings: Vec<TypeWarning>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(env: &'a Env) -> Self {
        TypeChecker {
            env,
            scopes: Scopes::new(),
            self_param_ty: None,
            effect_ctx: EffectContext::Entry,
            decompiling: false,
            warnings: Vec::new(),
        }
    }

    /// Checker for the decompilation path: unused bindings and odd
    /// shapes produced by reconstruction are tolerated.
    pub fn decompiling(env: &'a Env) -> Self {
        let mut checker = Self::new(env);
        checker.decompiling = true;
        checker
    }

    pub fn warnings(&self) -> &[TypeWarning] {
        &self.warnings
    }

    /// Register the contract's type definitions into a fresh environment.
    pub fn build_env(decl: &ContractDecl) -> Result<Env> {
        let mut env = Env::new();
        for def in &decl.types {
            match &def.kind {
                TypeDefKind::Record(fields) => env.register_record(&def.name, fields.clone())?,
                TypeDefKind::Variant(ctors) => env.register_variant(&def.name, ctors.clone())?,
            }
        }
        Ok(env)
    }

    /// The contract-level parameter type: the right-leaning `or` comb of
    /// entry parameter types (a single entry keeps its own type).
    pub fn contract_param_ty(decl: &ContractDecl) -> Type {
        let tys: Vec<Type> = decl.entries.iter().map(|e| e.param_ty.clone()).collect();
        right_comb_or(tys)
    }

    pub fn check_contract(&mut self, decl: &ContractDecl) -> Result<Contract> {
        debug!("typechecking contract {}", decl.name);

        if let Some(version) = &decl.version {
            check_version(version)?;
        }
        if !decl.storage.bigmap_placement_ok() {
            return Err(err_kind_at!(
                BadBigMap,
                Span::generated(),
                "big_map may only appear as the first component of the storage tuple"
            ));
        }
        if decl.entries.is_empty() {
            bail_type_at!(Span::generated(), "contract {} has no entry points", decl.name);
        }
        let mut seen = HashSet::new();
        for entry in &decl.entries {
            if !seen.insert(entry.name.clone()) {
                bail_type_at!(
                    entry.body.h.span,
                    "duplicate entry point {}",
                    entry.name
                );
            }
        }

        self.self_param_ty = Some(Self::contract_param_ty(decl));

        // Global values are visible to every entry, in declaration order.
        let mut values = Vec::with_capacity(decl.values.len());
        for value in &decl.values {
            let typed = self.check(&value.body, None)?;
            self.scopes.bind(value.name.clone(), typed.ty.clone());
            values.push((value.name.clone(), typed.with_name(Some(value.name.clone()))));
        }

        let mut entries = Vec::with_capacity(decl.entries.len());
        for entry in &decl.entries {
            entries.push(self.check_entry(decl, entry)?);
        }

        let init = match &decl.init {
            Some(init) => Some(self.check_init(decl, init)?),
            None => None,
        };

        Ok(Contract {
            name: decl.name.clone(),
            storage: decl.storage.clone(),
            values,
            entries,
            init,
        })
    }

    fn check_entry(&mut self, decl: &ContractDecl, entry: &ast::EntryDecl) -> Result<Entry> {
        debug!("typechecking entry {}", entry.name);
        let expected = Type::entry_result(decl.storage.clone());
        self.scopes.enter();
        self.scopes.bind(entry.param_name.clone(), entry.param_ty.clone());
        self.scopes.bind(entry.storage_name.clone(), decl.storage.clone());
        self.effect_ctx = EffectContext::Entry;
        let body = self.check(&entry.body, Some(&expected));
        self.scopes.leave();
        Ok(Entry {
            name: entry.name.clone(),
            param_name: entry.param_name.clone(),
            param_ty: entry.param_ty.clone(),
            storage_name: entry.storage_name.clone(),
            body: body?,
        })
    }

    fn check_init(&mut self, decl: &ContractDecl, init: &ast::InitDecl) -> Result<Init> {
        self.scopes.enter();
        for (name, ty) in &init.params {
            self.scopes.bind(name.clone(), ty.clone());
        }
        self.effect_ctx = EffectContext::Initializer;
        let body = self.check(&init.body, Some(&decl.storage));
        self.effect_ctx = EffectContext::Entry;
        self.scopes.leave();
        let body = body?;
        if body.transfer {
            return Err(err_effect_at!(
                body.span,
                "storage initializer may not cause transfers"
            ));
        }
        Ok(Init {
            params: init.params.clone(),
            body,
        })
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn mk(&mut self, e: &Expression, ty: Type, kind: TExprKind) -> TExpr {
        TExpr::new(e.h.id, ty, kind, e.h.span)
    }

    /// Check `e` against `expected` (when present) or synthesize.
    pub fn check(&mut self, e: &Expression, expected: Option<&Type>) -> Result<TExpr> {
        let typed = self.check_inner(e, expected)?;
        if let Some(expected) = expected {
            self.expect(e.h.span, expected, &typed.ty)?;
        }
        Ok(typed)
    }

    fn expect(&self, span: Span, expected: &Type, actual: &Type) -> Result<()> {
        if expected != actual {
            bail_type_at!(span, "expected {}, got {}", expected, actual);
        }
        Ok(())
    }

    fn check_inner(&mut self, e: &Expression, expected: Option<&Type>) -> Result<TExpr> {
        match &e.kind {
            ExprKind::Const { value, ascribed } => {
                let annot = ascribed.as_ref().or(expected);
                let ty = self.const_type(e.h.span, value, annot)?;
                Ok(self.mk(e, ty, TExprKind::Const(value.clone())))
            }

            ExprKind::Var(name) => match self.scopes.find(name) {
                Some(ty) => {
                    let ty = ty.clone();
                    Ok(self.mk(e, ty, TExprKind::Var(name.clone())))
                }
                None => Err(err_unbound_at!(e.h.span, "{}", name)),
            },

            ExprKind::Tuple(items) => {
                let expected_items: Option<&[Type]> = match expected {
                    Some(Type::Tuple(tys)) if tys.len() == items.len() => Some(tys),
                    _ => None,
                };
                let mut typed = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    typed.push(self.check(item, expected_items.map(|tys| &tys[i]))?);
                }
                let ty = Type::Tuple(typed.iter().map(|t| t.ty.clone()).collect());
                Ok(self.mk(e, ty, TExprKind::Tuple(typed)))
            }

            ExprKind::RecordLit(fields) => self.check_record_lit(e, fields),

            ExprKind::Construct { ctor, arg, ascribed } => {
                self.check_construct(e, ctor, arg, ascribed.as_ref().or(expected))
            }

            ExprKind::Let { name, value, body } => {
                let value = self.check(value, None)?.with_name(Some(name.clone()));
                self.scopes.enter();
                self.scopes.bind(name.clone(), value.ty.clone());
                let body = self.check(body, expected);
                self.scopes.leave();
                let body = body?;
                let uses = count_uses(&body, name);
                if uses == 0 && !self.decompiling {
                    self.warnings.push(TypeWarning::UnusedBinding {
                        name: name.clone(),
                        span: e.h.span,
                    });
                }
                let inline = uses == 1 && value.is_pure();
                let ty = body.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::Let {
                        name: name.clone(),
                        uses,
                        inline,
                        value: Box::new(value),
                        body: Box::new(body),
                    },
                ))
            }

            ExprKind::Seq(first, second) => {
                let first = self.check(first, Some(&Type::Unit))?;
                let second = self.check(second, expected)?;
                let ty = second.ty.clone();
                Ok(self.mk(e, ty, TExprKind::Seq(Box::new(first), Box::new(second))))
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.check(cond, Some(&Type::Bool))?;
                // A failing arm takes its type from the other arm.
                let (then_branch, else_branch) = if diverges(then_branch) && expected.is_none() {
                    let else_b = self.check(else_branch, None)?;
                    let then_b = self.check(then_branch, Some(&else_b.ty.clone()))?;
                    (then_b, else_b)
                } else {
                    let then_b = self.check(then_branch, expected)?;
                    let else_b = self.check(else_branch, Some(&then_b.ty.clone()))?;
                    (then_b, else_b)
                };
                let ty = then_branch.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    },
                ))
            }

            ExprKind::Lambda {
                param,
                param_ty,
                ret_ty,
                rec_name,
                body,
            } => self.check_lambda(e, param, param_ty, ret_ty.as_ref(), rec_name.as_ref(), body, expected),

            ExprKind::Apply { prim, args } => self.check_apply(e, prim, args),

            ExprKind::Call { func, arg } => {
                let func = self.check(func, None)?;
                let (arg_ty, ret_ty) = match &func.ty {
                    Type::Lambda(a, b) => (a.as_ref().clone(), b.as_ref().clone()),
                    Type::Closure { arg, ret, .. } => (arg.as_ref().clone(), ret.as_ref().clone()),
                    other => bail_type_at!(e.h.span, "cannot apply a value of type {}", other),
                };
                let arg = self.check(arg, Some(&arg_ty))?;
                Ok(self.mk(
                    e,
                    ret_ty,
                    TExprKind::Call {
                        func: Box::new(func),
                        arg: Box::new(arg),
                    },
                ))
            }

            ExprKind::Proj { tuple, index } => {
                let tuple = self.check(tuple, None)?;
                let ty = match &tuple.ty {
                    Type::Tuple(tys) if *index < tys.len() => tys[*index].clone(),
                    Type::Tuple(tys) => bail_type_at!(
                        e.h.span,
                        "tuple has {} components, cannot project component {}",
                        tys.len(),
                        index
                    ),
                    other => bail_type_at!(e.h.span, "cannot project component of {}", other),
                };
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::Proj {
                        index: *index,
                        label: None,
                        tuple: Box::new(tuple),
                    },
                ))
            }

            ExprKind::SetProj { tuple, index, value } => {
                let tuple = self.check(tuple, None)?;
                let component_ty = match &tuple.ty {
                    Type::Tuple(tys) if *index < tys.len() => tys[*index].clone(),
                    other => bail_type_at!(e.h.span, "cannot update component {} of {}", index, other),
                };
                let value = self.check(value, Some(&component_ty))?;
                let ty = tuple.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::SetField {
                        index: *index,
                        label: None,
                        tuple: Box::new(tuple),
                        value: Box::new(value),
                    },
                ))
            }

            ExprKind::Field { record, field } => {
                let record = self.check(record, None)?;
                let (index, field_ty) = self.resolve_field_of(e.h.span, &record.ty, field)?;
                Ok(self.mk(
                    e,
                    field_ty,
                    TExprKind::Proj {
                        index,
                        label: Some(field.clone()),
                        tuple: Box::new(record),
                    },
                ))
            }

            ExprKind::SetField { record, field, value } => {
                let record = self.check(record, None)?;
                let (index, field_ty) = self.resolve_field_of(e.h.span, &record.ty, field)?;
                let value = self.check(value, Some(&field_ty))?;
                let ty = record.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::SetField {
                        index,
                        label: Some(field.clone()),
                        tuple: Box::new(record),
                        value: Box::new(value),
                    },
                ))
            }

            ExprKind::MatchOption {
                arg,
                ifnone,
                some_name,
                ifsome,
            } => {
                let arg = self.check(arg, None)?;
                let inner = match &arg.ty {
                    Type::Option_(inner) => inner.as_ref().clone(),
                    other => bail_type_at!(e.h.span, "match%option on non-option {}", other),
                };
                let (ifnone, ifsome) = if diverges(ifnone) && expected.is_none() {
                    let some_b = self.check_in_scope(
                        some_name.as_deref().map(|n| (n, inner.clone())),
                        ifsome,
                        None,
                    )?;
                    let none_b = self.check(ifnone, Some(&some_b.ty.clone()))?;
                    (none_b, some_b)
                } else {
                    let none_b = self.check(ifnone, expected)?;
                    let some_b = self.check_in_scope(
                        some_name.as_deref().map(|n| (n, inner.clone())),
                        ifsome,
                        Some(&none_b.ty.clone()),
                    )?;
                    (none_b, some_b)
                };
                let ty = ifnone.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::MatchOption {
                        arg: Box::new(arg),
                        ifnone: Box::new(ifnone),
                        some_name: some_name.clone(),
                        ifsome: Box::new(ifsome),
                    },
                ))
            }

            ExprKind::MatchNat {
                arg,
                plus_name,
                ifplus,
                minus_name,
                ifminus,
            } => {
                let arg = self.check(arg, Some(&Type::Int))?;
                let (ifplus, ifminus) = if diverges(ifplus) && expected.is_none() {
                    let minus_b = self.check_in_scope(
                        minus_name.as_deref().map(|n| (n, Type::Nat)),
                        ifminus,
                        None,
                    )?;
                    let plus_b = self.check_in_scope(
                        plus_name.as_deref().map(|n| (n, Type::Nat)),
                        ifplus,
                        Some(&minus_b.ty.clone()),
                    )?;
                    (plus_b, minus_b)
                } else {
                    let plus_b = self.check_in_scope(
                        plus_name.as_deref().map(|n| (n, Type::Nat)),
                        ifplus,
                        expected,
                    )?;
                    let minus_b = self.check_in_scope(
                        minus_name.as_deref().map(|n| (n, Type::Nat)),
                        ifminus,
                        Some(&plus_b.ty.clone()),
                    )?;
                    (plus_b, minus_b)
                };
                let ty = ifplus.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::MatchNat {
                        arg: Box::new(arg),
                        plus_name: plus_name.clone(),
                        ifplus: Box::new(ifplus),
                        minus_name: minus_name.clone(),
                        ifminus: Box::new(ifminus),
                    },
                ))
            }

            ExprKind::MatchList {
                arg,
                head_name,
                tail_name,
                ifcons,
                ifnil,
            } => {
                let arg = self.check(arg, None)?;
                let elt = match &arg.ty {
                    Type::List(elt) => elt.as_ref().clone(),
                    other => bail_type_at!(e.h.span, "match on non-list {}", other),
                };
                let (ifnil, ifcons) = if diverges(ifnil) && expected.is_none() {
                    let cons_b =
                        self.check_cons_arm(head_name, tail_name, &elt, ifcons, None)?;
                    let nil_b = self.check(ifnil, Some(&cons_b.ty.clone()))?;
                    (nil_b, cons_b)
                } else {
                    let nil_b = self.check(ifnil, expected)?;
                    let cons_b = self.check_cons_arm(
                        head_name,
                        tail_name,
                        &elt,
                        ifcons,
                        Some(&nil_b.ty.clone()),
                    )?;
                    (nil_b, cons_b)
                };
                let ty = ifnil.ty.clone();
                Ok(self.mk(
                    e,
                    ty,
                    TExprKind::MatchList {
                        arg: Box::new(arg),
                        head_name: head_name.clone(),
                        tail_name: tail_name.clone(),
                        ifcons: Box::new(ifcons),
                        ifnil: Box::new(ifnil),
                    },
                ))
            }

            ExprKind::MatchVariant { arg, cases } => self.check_match_variant(e, arg, cases, expected),

            ExprKind::Loop { name, body, init } => {
                let init = self.check(init, None)?;
                let state_ty = init.ty.clone();
                let body_ty = Type::pair(Type::Bool, state_ty.clone());
                let body =
                    self.check_in_scope(Some((name.as_str(), state_ty.clone())), body, Some(&body_ty))?;
                Ok(self.mk(
                    e,
                    state_ty,
                    TExprKind::Loop {
                        name: name.clone(),
                        body: Box::new(body),
                        init: Box::new(init),
                    },
                ))
            }

            ExprKind::LoopLeft {
                name,
                body,
                init,
                acc,
            } => self.check_loop_left(e, name, body, init, acc.as_deref()),

            ExprKind::Fold {
                prim,
                name,
                body,
                coll,
                init,
            } => self.check_fold(e, prim, name, body, coll, init),

            ExprKind::MapOp {
                prim,
                name,
                body,
                coll,
            } => self.check_map(e, prim, name, body, coll),

            ExprKind::MapFold {
                prim,
                name,
                body,
                coll,
                init,
            } => self.check_map_fold(e, prim, name, body, coll, init),

            ExprKind::Transfer {
                contract,
                amount,
                arg,
            } => {
                if self.effect_ctx != EffectContext::Entry {
                    return Err(err_effect_at!(
                        e.h.span,
                        "transfer is not allowed in this context"
                    ));
                }
                let contract = self.check(contract, None)?;
                let param_ty = match &contract.ty {
                    Type::Contract(t) => t.as_ref().clone(),
                    other => bail_type_at!(e.h.span, "Contract.call target has type {}", other),
                };
                let amount = self.check(amount, Some(&Type::Tez))?;
                let arg = self.check(arg, Some(&param_ty))?;
                Ok(self.mk(
                    e,
                    Type::Operation,
                    TExprKind::Transfer {
                        contract: Box::new(contract),
                        amount: Box::new(amount),
                        arg: Box::new(arg),
                    },
                ))
            }

            ExprKind::Failwith(arg) => {
                let arg = self.check(arg, None)?;
                // failwith inhabits any type; default to unit when there
                // is no expectation to meet.
                let ty = expected.cloned().unwrap_or(Type::Unit);
                Ok(self.mk(e, ty, TExprKind::Failwith(Box::new(arg))))
            }

            ExprKind::CreateContract {
                delegate,
                amount,
                contract,
                storage_init,
            } => {
                if self.effect_ctx != EffectContext::Entry {
                    return Err(err_effect_at!(
                        e.h.span,
                        "Contract.create is not allowed in this context"
                    ));
                }
                let delegate = self.check(delegate, Some(&Type::option(Type::KeyHash)))?;
                let amount = self.check(amount, Some(&Type::Tez))?;
                // Nested contracts may not declare named types: their
                // bodies must encode against the enclosing environment.
                if !contract.types.is_empty() {
                    bail_type_at!(
                        e.h.span,
                        "nested contracts may not declare record or variant types"
                    );
                }
                let mut inner = TypeChecker::new(self.env);
                let typed_contract = inner.check_contract(contract)?;
                let storage_init = self.check(storage_init, Some(&contract.storage))?;
                Ok(self.mk(
                    e,
                    Type::pair(Type::Operation, Type::Address),
                    TExprKind::CreateContract {
                        delegate: Box::new(delegate),
                        amount: Box::new(amount),
                        contract: Box::new(typed_contract),
                        storage_init: Box::new(storage_init),
                    },
                ))
            }

            ExprKind::ContractAt { addr, ty } => {
                let addr = self.check(addr, Some(&Type::Address))?;
                Ok(self.mk(
                    e,
                    Type::option(Type::Contract(Box::new(ty.clone()))),
                    TExprKind::ContractAt {
                        addr: Box::new(addr),
                        ty: ty.clone(),
                    },
                ))
            }

            ExprKind::Unpack { arg, ty } => {
                let arg = self.check(arg, Some(&Type::Bytes))?;
                Ok(self.mk(
                    e,
                    Type::option(ty.clone()),
                    TExprKind::Unpack {
                        arg: Box::new(arg),
                        ty: ty.clone(),
                    },
                ))
            }
        }
    }

    /// The cons arm of a list match: head and tail bindings in scope.
    fn check_cons_arm(
        &mut self,
        head_name: &Option<String>,
        tail_name: &Option<String>,
        elt: &Type,
        body: &Expression,
        expected: Option<&Type>,
    ) -> Result<TExpr> {
        self.scopes.enter();
        if let Some(head) = head_name {
            self.scopes.bind(head.clone(), elt.clone());
        }
        if let Some(tail) = tail_name {
            self.scopes.bind(tail.clone(), Type::list(elt.clone()));
        }
        let result = self.check(body, expected);
        self.scopes.leave();
        result
    }

    fn check_in_scope(
        &mut self,
        binding: Option<(&str, Type)>,
        body: &Expression,
        expected: Option<&Type>,
    ) -> Result<TExpr> {
        self.scopes.enter();
        if let Some((name, ty)) = binding {
            self.scopes.bind(name.to_string(), ty);
        }
        let result = self.check(body, expected);
        self.scopes.leave();
        result
    }

    /// Check a loop/fold/map body: same scoping as [`check_in_scope`]
    /// but with the transfer effect rejected.
    fn check_iteration_body(
        &mut self,
        binding: Option<(&str, Type)>,
        body: &Expression,
        expected: Option<&Type>,
    ) -> Result<TExpr> {
        let saved = self.effect_ctx;
        if saved != EffectContext::Initializer {
            self.effect_ctx = EffectContext::IterationBody;
        }
        let result = self.check_in_scope(binding, body, expected);
        self.effect_ctx = saved;
        let body = result?;
        if body.transfer {
            return Err(err_effect_at!(
                body.span,
                "transfers are not allowed inside iteration bodies"
            ));
        }
        Ok(body)
    }

    /// Resolve a field label against the record type of the scrutinee.
    /// Resolution goes through the scrutinee's own record when its type
    /// is known, which keeps ambiguous labels usable in decompiling mode.
    fn resolve_field_of(&self, span: Span, ty: &Type, field: &str) -> Result<(usize, Type)> {
        let record_name = match ty {
            Type::Record(name) => name,
            other => bail_type_at!(span, "{} has no field {}", other, field),
        };
        let fields = self
            .env
            .record_fields(record_name)
            .ok_or_else(|| err_internal!("checker", "record {} not registered", record_name))?;
        match fields.iter().position(|(l, _)| l == field) {
            Some(index) => Ok((index, fields[index].1.clone())),
            None => Err(err_kind_at!(
                UnknownField,
                span,
                "record {} has no field {}",
                record_name,
                field
            )),
        }
    }

    fn check_record_lit(&mut self, e: &Expression, fields: &[(String, Expression)]) -> Result<TExpr> {
        let first = fields
            .first()
            .ok_or_else(|| err_type_at!(e.h.span, "empty record literal"))?;
        let (record_name, _, _) = self
            .env
            .resolve_field(&first.0)
            .ok_or_else(|| err_kind_at!(UnknownField, e.h.span, "{}", first.0))?;
        let record_name = record_name.to_string();
        let decl_fields = self
            .env
            .record_fields(&record_name)
            .ok_or_else(|| err_internal!("checker", "record {} not registered", record_name))?
            .to_vec();
        if decl_fields.len() != fields.len() {
            return Err(err_kind_at!(
                ArityMismatch,
                e.h.span,
                "record {} has {} fields, literal has {}",
                record_name,
                decl_fields.len(),
                fields.len()
            ));
        }
        // Check in declaration order regardless of literal order.
        let mut typed = Vec::with_capacity(decl_fields.len());
        for (label, field_ty) in &decl_fields {
            let given = fields
                .iter()
                .find(|(l, _)| l == label)
                .ok_or_else(|| {
                    err_kind_at!(UnknownField, e.h.span, "missing field {} of {}", label, record_name)
                })?;
            let value = self.check(&given.1, Some(field_ty))?;
            typed.push((label.clone(), value));
        }
        Ok(self.mk(e, Type::Record(record_name), TExprKind::RecordCons(typed)))
    }

    fn check_construct(
        &mut self,
        e: &Expression,
        ctor: &str,
        arg: &Expression,
        annot: Option<&Type>,
    ) -> Result<TExpr> {
        if ctor == "Left" || ctor == "Right" {
            let (left_ty, right_ty) = match annot {
                Some(Type::Or(l, r)) => (l.as_ref().clone(), r.as_ref().clone()),
                Some(other) => bail_type_at!(e.h.span, "{} ascribed non-or type {}", ctor, other),
                None => {
                    return Err(err_kind_at!(
                        UnannotatedSum,
                        e.h.span,
                        "{} requires an or-type annotation",
                        ctor
                    ))
                }
            };
            let left = ctor == "Left";
            let arg = self.check(arg, Some(if left { &left_ty } else { &right_ty }))?;
            return Ok(self.mk(
                e,
                Type::or(left_ty, right_ty),
                TExprKind::Inject {
                    left,
                    ctor: None,
                    arg: Box::new(arg),
                },
            ));
        }
        let (variant, _, payload_ty) = self
            .env
            .resolve_constructor(ctor)
            .ok_or_else(|| err_kind_at!(UnknownConstructor, e.h.span, "{}", ctor))?;
        let variant = variant.to_string();
        let payload_ty = payload_ty.clone();
        let arg = self.check(arg, Some(&payload_ty))?;
        Ok(self.mk(
            e,
            Type::Variant(variant),
            TExprKind::Construct {
                ctor: ctor.to_string(),
                arg: Box::new(arg),
            },
        ))
    }

    fn check_match_variant(
        &mut self,
        e: &Expression,
        arg: &Expression,
        cases: &[ast::MatchCase],
        expected: Option<&Type>,
    ) -> Result<TExpr> {
        let arg = self.check(arg, None)?;
        // Either a registered variant or a raw `or` matched with
        // Left/Right arms.
        let ctors: Vec<(String, Type)> = match &arg.ty {
            Type::Variant(name) => self
                .env
                .variant_ctors(name)
                .ok_or_else(|| err_internal!("checker", "variant {} not registered", name))?
                .to_vec(),
            Type::Or(l, r) => vec![
                ("Left".to_string(), l.as_ref().clone()),
                ("Right".to_string(), r.as_ref().clone()),
            ],
            other => bail_type_at!(e.h.span, "match on non-variant {}", other),
        };
        if cases.len() != ctors.len() {
            return Err(err_kind_at!(
                ArityMismatch,
                e.h.span,
                "match has {} cases, variant has {} constructors",
                cases.len(),
                ctors.len()
            ));
        }

        // Arms are stored in declaration order whatever the source
        // order. When no type is expected, the result type is seeded
        // from the first non-diverging arm so that failing arms adopt
        // it instead of imposing their own.
        let mut result_ty: Option<Type> = expected.cloned();
        let mut seed: Option<(String, TExpr)> = None;
        if result_ty.is_none() {
            for (ctor, payload_ty) in &ctors {
                let case = cases.iter().find(|c| &c.ctor == ctor);
                if let Some(case) = case {
                    if !diverges(&case.body) {
                        let body = self.check_in_scope(
                            case.var.as_deref().map(|v| (v, payload_ty.clone())),
                            &case.body,
                            None,
                        )?;
                        result_ty = Some(body.ty.clone());
                        seed = Some((ctor.clone(), body));
                        break;
                    }
                }
            }
        }
        let mut typed_cases = Vec::with_capacity(ctors.len());
        for (ctor, payload_ty) in &ctors {
            let case = cases
                .iter()
                .find(|c| &c.ctor == ctor)
                .ok_or_else(|| {
                    err_kind_at!(UnknownConstructor, e.h.span, "missing case for constructor {}", ctor)
                })?;
            let body = match &seed {
                Some((seeded, body)) if seeded == ctor => body.clone(),
                _ => self.check_in_scope(
                    case.var.as_deref().map(|v| (v, payload_ty.clone())),
                    &case.body,
                    result_ty.as_ref(),
                )?,
            };
            if result_ty.is_none() {
                result_ty = Some(body.ty.clone());
            }
            typed_cases.push(VariantCase {
                ctor: ctor.clone(),
                var: case.var.clone(),
                body,
            });
        }
        let ty = result_ty.expect("at least one case");
        Ok(self.mk(
            e,
            ty,
            TExprKind::MatchVariant {
                arg: Box::new(arg),
                cases: typed_cases,
            },
        ))
    }

    fn check_lambda(
        &mut self,
        e: &Expression,
        param: &str,
        param_ty: &Type,
        ret_ty: Option<&Type>,
        rec_name: Option<&String>,
        body: &Expression,
        expected: Option<&Type>,
    ) -> Result<TExpr> {
        let expected_ret = match (ret_ty, expected) {
            (Some(t), _) => Some(t.clone()),
            (None, Some(Type::Lambda(a, b))) => {
                self.expect(e.h.span, a, param_ty)?;
                Some(b.as_ref().clone())
            }
            _ => None,
        };
        if rec_name.is_some() && expected_ret.is_none() {
            bail_type_at!(e.h.span, "recursive lambda requires a return type annotation");
        }

        self.scopes.enter();
        self.scopes.bind(param.to_string(), param_ty.clone());
        if let Some(rec) = rec_name {
            self.scopes.bind(
                rec.clone(),
                Type::lambda(param_ty.clone(), expected_ret.clone().expect("checked above")),
            );
        }
        let saved = self.effect_ctx;
        self.effect_ctx = EffectContext::LambdaBody;
        let body_result = self.check(body, expected_ret.as_ref());
        self.effect_ctx = saved;
        self.scopes.leave();
        let body = body_result?;
        if body.transfer {
            return Err(err_effect_at!(
                body.span,
                "transfers are not allowed inside lambdas"
            ));
        }
        let ret_ty = body.ty.clone();

        // Free variables of the body become the captured environment.
        let mut bound: HashSet<String> = HashSet::new();
        bound.insert(param.to_string());
        if let Some(rec) = rec_name {
            bound.insert(rec.clone());
        }
        let mut free = Vec::new();
        collect_free_vars(&body, &mut bound, &mut free);
        let captured: Vec<(String, Type)> = free
            .into_iter()
            .filter_map(|name| self.scopes.find(&name).map(|ty| (name, ty.clone())))
            .collect();
        if rec_name.is_some() && !captured.is_empty() {
            bail_type_at!(
                e.h.span,
                "recursive lambdas may not capture variables ({})",
                captured.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", ")
            );
        }

        let kind = if captured.is_empty() {
            TExprKind::Lambda {
                param: param.to_string(),
                param_ty: param_ty.clone(),
                ret_ty: ret_ty.clone(),
                rec_name: rec_name.cloned(),
                body: Box::new(body),
            }
        } else {
            TExprKind::Closure {
                param: param.to_string(),
                param_ty: param_ty.clone(),
                ret_ty: ret_ty.clone(),
                captured,
                body: Box::new(body),
            }
        };
        let ty = match &kind {
            TExprKind::Lambda { .. } => Type::lambda(param_ty.clone(), ret_ty),
            TExprKind::Closure { captured, .. } => Type::Closure {
                arg: Box::new(param_ty.clone()),
                ret: Box::new(ret_ty),
                env: Box::new(Type::Tuple(captured.iter().map(|(_, t)| t.clone()).collect())),
            },
            _ => unreachable!(),
        };
        Ok(self.mk(e, ty, kind))
    }

    fn check_loop_left(
        &mut self,
        e: &Expression,
        name: &str,
        body: &Expression,
        init: &Expression,
        acc: Option<&Expression>,
    ) -> Result<TExpr> {
        let init = self.check(init, None)?;
        let state_ty = init.ty.clone();
        match acc {
            None => {
                // body: state -> or state result
                let body = self.check_in_scope(Some((name, state_ty.clone())), body, None)?;
                let result_ty = match &body.ty {
                    Type::Or(l, r) if l.as_ref() == &state_ty => r.as_ref().clone(),
                    other => bail_type_at!(
                        e.h.span,
                        "Loop.left body must return (({}, _) or), got {}",
                        state_ty,
                        other
                    ),
                };
                Ok(self.mk(
                    e,
                    result_ty,
                    TExprKind::LoopLeft {
                        name: name.to_string(),
                        body: Box::new(body),
                        init: Box::new(init),
                        acc: None,
                    },
                ))
            }
            Some(acc) => {
                // body: (state, acc) -> (or state result, acc)
                let acc = self.check(acc, None)?;
                let acc_ty = acc.ty.clone();
                let arg_ty = Type::pair(state_ty.clone(), acc_ty.clone());
                let body = self.check_in_scope(Some((name, arg_ty)), body, None)?;
                let result_ty = match &body.ty {
                    Type::Tuple(items) if items.len() == 2 => match &items[0] {
                        Type::Or(l, r) if l.as_ref() == &state_ty && items[1] == acc_ty => {
                            r.as_ref().clone()
                        }
                        other => bail_type_at!(
                            e.h.span,
                            "Loop.left body must return (({}, _) or, {}), got first component {}",
                            state_ty,
                            acc_ty,
                            other
                        ),
                    },
                    other => bail_type_at!(e.h.span, "Loop.left body must return a pair, got {}", other),
                };
                Ok(self.mk(
                    e,
                    Type::pair(result_ty, acc_ty),
                    TExprKind::LoopLeft {
                        name: name.to_string(),
                        body: Box::new(body),
                        init: Box::new(init),
                        acc: Some(Box::new(acc)),
                    },
                ))
            }
        }
    }

    fn fold_element_type(&self, span: Span, coll_ty: &Type) -> Result<(Type, Prim, Prim, Prim)> {
        // (element type, fold prim, map prim, map-fold prim)
        match coll_ty {
            Type::List(elt) => Ok((elt.as_ref().clone(), Prim::ListFold, Prim::ListMap, Prim::ListMapFold)),
            Type::Set(elt) => Ok((elt.as_ref().clone(), Prim::SetFold, Prim::Unknown, Prim::Unknown)),
            Type::Map(k, v) => Ok((
                Type::pair(k.as_ref().clone(), v.as_ref().clone()),
                Prim::MapFoldColl,
                Prim::MapMap,
                Prim::MapMapFold,
            )),
            other => Err(err_type_at!(span, "cannot iterate over {}", other)),
        }
    }

    fn check_fold(
        &mut self,
        e: &Expression,
        prim: &str,
        name: &str,
        body: &Expression,
        coll: &Expression,
        init: &Expression,
    ) -> Result<TExpr> {
        let coll = self.check(coll, None)?;
        let (elt_ty, fold_prim, _, _) = self.fold_element_type(e.h.span, &coll.ty)?;
        if Prim::from_surface(prim) != Prim::Fold {
            bail_type_at!(e.h.span, "unknown fold primitive {}", prim);
        }
        let init = self.check(init, None)?;
        let acc_ty = init.ty.clone();
        let arg_ty = Type::pair(elt_ty, acc_ty.clone());
        let body = self.check_iteration_body(Some((name, arg_ty)), body, Some(&acc_ty))?;
        Ok(self.mk(
            e,
            acc_ty,
            TExprKind::Fold {
                prim: fold_prim,
                name: name.to_string(),
                body: Box::new(body),
                coll: Box::new(coll),
                init: Box::new(init),
            },
        ))
    }

    fn check_map(
        &mut self,
        e: &Expression,
        prim: &str,
        name: &str,
        body: &Expression,
        coll: &Expression,
    ) -> Result<TExpr> {
        let coll = self.check(coll, None)?;
        if Prim::from_surface(prim) != Prim::Map_ {
            bail_type_at!(e.h.span, "unknown map primitive {}", prim);
        }
        let (elt_ty, _, map_prim, _) = self.fold_element_type(e.h.span, &coll.ty)?;
        if map_prim == Prim::Unknown {
            bail_type_at!(e.h.span, "{} cannot be mapped", coll.ty);
        }
        let body = self.check_iteration_body(Some((name, elt_ty)), body, None)?;
        let result_ty = match &coll.ty {
            Type::List(_) => Type::list(body.ty.clone()),
            Type::Map(k, _) => Type::Map(Box::new(k.as_ref().clone()), Box::new(body.ty.clone())),
            _ => unreachable!("fold_element_type filters the rest"),
        };
        Ok(self.mk(
            e,
            result_ty,
            TExprKind::MapOp {
                prim: map_prim,
                name: name.to_string(),
                body: Box::new(body),
                coll: Box::new(coll),
            },
        ))
    }

    fn check_map_fold(
        &mut self,
        e: &Expression,
        prim: &str,
        name: &str,
        body: &Expression,
        coll: &Expression,
        init: &Expression,
    ) -> Result<TExpr> {
        let coll = self.check(coll, None)?;
        if Prim::from_surface(prim) != Prim::MapFold_ {
            bail_type_at!(e.h.span, "unknown map_fold primitive {}", prim);
        }
        let (elt_ty, _, _, mapfold_prim) = self.fold_element_type(e.h.span, &coll.ty)?;
        if mapfold_prim == Prim::Unknown {
            bail_type_at!(e.h.span, "{} cannot be map_folded", coll.ty);
        }
        let init = self.check(init, None)?;
        let acc_ty = init.ty.clone();
        let arg_ty = Type::pair(elt_ty, acc_ty.clone());
        let body = self.check_iteration_body(Some((name, arg_ty)), body, None)?;
        let (new_elt_ty, body_acc) = match &body.ty {
            Type::Tuple(items) if items.len() == 2 => (items[0].clone(), items[1].clone()),
            other => bail_type_at!(e.h.span, "map_fold body must return a pair, got {}", other),
        };
        self.expect(body.span, &acc_ty, &body_acc)?;
        let result_coll = match &coll.ty {
            Type::List(_) => Type::list(new_elt_ty),
            Type::Map(k, _) => Type::Map(Box::new(k.as_ref().clone()), Box::new(new_elt_ty)),
            _ => unreachable!(),
        };
        Ok(self.mk(
            e,
            Type::pair(result_coll, acc_ty),
            TExprKind::MapFold {
                prim: mapfold_prim,
                name: name.to_string(),
                body: Box::new(body),
                coll: Box::new(coll),
                init: Box::new(init),
            },
        ))
    }

    // =========================================================================
    // Primitive applications
    // =========================================================================

    fn check_apply(&mut self, e: &Expression, prim: &str, args: &[Expression]) -> Result<TExpr> {
        let resolved = Prim::from_surface(prim);
        if resolved == Prim::Unknown {
            bail_type_at!(e.h.span, "unknown primitive {}", prim);
        }
        if resolved.arity() != args.len() {
            return Err(err_kind_at!(
                ArityMismatch,
                e.h.span,
                "{} expects {} arguments, got {}",
                prim,
                resolved.arity(),
                args.len()
            ));
        }
        if self.effect_ctx == EffectContext::Initializer
            && matches!(resolved, Prim::Sender | Prim::Source)
        {
            return Err(err_effect_at!(
                e.h.span,
                "{} is not allowed in a storage initializer",
                prim
            ));
        }

        let args: Vec<TExpr> = args.iter().map(|a| self.check(a, None)).collect::<Result<_>>()?;
        let (prim, ty) = self.prim_result(e.h.span, resolved, &args)?;

        // Big map access must not carry effects in its arguments.
        if matches!(prim, Prim::BigMapGet | Prim::BigMapMem | Prim::BigMapUpdate)
            && args.iter().any(|a| a.transfer)
        {
            return Err(err_effect_at!(
                e.h.span,
                "transfers are not allowed inside big map operations"
            ));
        }

        Ok(self.mk(e, ty, TExprKind::Apply { prim, args }))
    }

    /// Monomorphize a polymorphic primitive and compute its result type.
    fn prim_result(&self, span: Span, prim: Prim, args: &[TExpr]) -> Result<(Prim, Type)> {
        use Prim::*;
        let ty = |i: usize| -> &Type { &args[i].ty };
        let result = match prim {
            Add | Sub | Mul | Ediv => {
                let out = arith_result(prim, ty(0), ty(1)).ok_or_else(|| {
                    err_type_at!(span, "{} is not defined on {} and {}", prim, ty(0), ty(1))
                })?;
                (prim, out)
            }
            Neg => match ty(0) {
                Type::Int | Type::Nat => (prim, Type::Int),
                other => bail_type_at!(span, "cannot negate {}", other),
            },
            Abs => match ty(0) {
                Type::Int => (prim, Type::Nat),
                other => bail_type_at!(span, "abs expects int, got {}", other),
            },
            IsNat => match ty(0) {
                Type::Int => (prim, Type::option(Type::Nat)),
                other => bail_type_at!(span, "is_nat expects int, got {}", other),
            },
            IntOf => match ty(0) {
                Type::Nat => (prim, Type::Int),
                other => bail_type_at!(span, "int expects nat, got {}", other),
            },
            Not => match ty(0) {
                Type::Bool => (prim, Type::Bool),
                other => bail_type_at!(span, "not expects bool, got {}", other),
            },
            And | Or | Xor => match (ty(0), ty(1)) {
                (Type::Bool, Type::Bool) => (prim, Type::Bool),
                (Type::Nat, Type::Nat) => (prim, Type::Nat),
                (a, b) => bail_type_at!(span, "{} is not defined on {} and {}", prim, a, b),
            },
            Lsl | Lsr => match (ty(0), ty(1)) {
                (Type::Nat, Type::Nat) => (prim, Type::Nat),
                (a, b) => bail_type_at!(span, "{} is not defined on {} and {}", prim, a, b),
            },
            Compare | Eq | Neq | Lt | Le | Gt | Ge => {
                if ty(0) != ty(1) {
                    bail_type_at!(span, "cannot compare {} with {}", ty(0), ty(1));
                }
                if !ty(0).is_comparable() {
                    bail_type_at!(span, "{} is not comparable", ty(0));
                }
                let out = if prim == Compare { Type::Int } else { Type::Bool };
                (prim, out)
            }
            Concat => match (ty(0), ty(1)) {
                (Type::String_, Type::String_) => (prim, Type::String_),
                (Type::Bytes, Type::Bytes) => (prim, Type::Bytes),
                (a, b) => bail_type_at!(span, "cannot concatenate {} and {}", a, b),
            },
            Slice => match (ty(0), ty(1), ty(2)) {
                (Type::Nat, Type::Nat, Type::String_) => (prim, Type::option(Type::String_)),
                (Type::Nat, Type::Nat, Type::Bytes) => (prim, Type::option(Type::Bytes)),
                (a, b, c) => bail_type_at!(span, "slice is not defined on ({}, {}, {})", a, b, c),
            },
            Pack => (prim, Type::Bytes),
            Size => match ty(0) {
                Type::List(_) => (ListSize, Type::Nat),
                Type::Set(_) => (SetSize, Type::Nat),
                Type::Map(_, _) => (MapSize, Type::Nat),
                Type::String_ => (StringSize, Type::Nat),
                Type::Bytes => (BytesSize, Type::Nat),
                other => bail_type_at!(span, "{} has no size", other),
            },
            Rev => match ty(0) {
                Type::List(_) => (ListRev, ty(0).clone()),
                other => bail_type_at!(span, "List.rev expects a list, got {}", other),
            },
            Mem => match ty(1) {
                Type::Set(elt) => {
                    self.expect(span, elt, ty(0))?;
                    (SetMem, Type::Bool)
                }
                Type::Map(k, _) => {
                    self.expect(span, k, ty(0))?;
                    (MapMem, Type::Bool)
                }
                Type::BigMap(k, _) => {
                    self.expect(span, k, ty(0))?;
                    (BigMapMem, Type::Bool)
                }
                other => bail_type_at!(span, "mem is not defined on {}", other),
            },
            Get => match ty(1) {
                Type::Map(k, v) => {
                    self.expect(span, k, ty(0))?;
                    (MapGet, Type::option(v.as_ref().clone()))
                }
                Type::BigMap(k, v) => {
                    self.expect(span, k, ty(0))?;
                    (BigMapGet, Type::option(v.as_ref().clone()))
                }
                other => bail_type_at!(span, "find is not defined on {}", other),
            },
            Update => match ty(2) {
                Type::Set(elt) => {
                    self.expect(span, elt, ty(0))?;
                    self.expect(span, &Type::Bool, ty(1))?;
                    (SetUpdate, ty(2).clone())
                }
                Type::Map(k, v) => {
                    self.expect(span, k, ty(0))?;
                    self.expect(span, &Type::option(v.as_ref().clone()), ty(1))?;
                    (MapUpdate, ty(2).clone())
                }
                Type::BigMap(k, v) => {
                    self.expect(span, k, ty(0))?;
                    self.expect(span, &Type::option(v.as_ref().clone()), ty(1))?;
                    (BigMapUpdate, ty(2).clone())
                }
                other => bail_type_at!(span, "update is not defined on {}", other),
            },
            Cons => match ty(1) {
                Type::List(elt) => {
                    self.expect(span, elt, ty(0))?;
                    (Cons, ty(1).clone())
                }
                other => bail_type_at!(span, "cannot cons onto {}", other),
            },
            SomeOp => (prim, Type::option(ty(0).clone())),
            Blake2b | Sha256 | Sha512 => {
                self.expect(span, &Type::Bytes, ty(0))?;
                (prim, Type::Bytes)
            }
            HashKey => {
                self.expect(span, &Type::Key, ty(0))?;
                (prim, Type::KeyHash)
            }
            CheckSignature => {
                self.expect(span, &Type::Key, ty(0))?;
                self.expect(span, &Type::Signature, ty(1))?;
                self.expect(span, &Type::Bytes, ty(2))?;
                (prim, Type::Bool)
            }
            Balance | Amount => (prim, Type::Tez),
            Now => (prim, Type::Timestamp),
            Sender | Source => (prim, Type::Address),
            SelfOp => {
                let param = self
                    .self_param_ty
                    .clone()
                    .ok_or_else(|| err_type_at!(span, "Current.self outside a contract"))?;
                (prim, Type::Contract(Box::new(param)))
            }
            StepsToQuota => (prim, Type::Nat),
            AddressOf => match ty(0) {
                Type::Contract(_) => (prim, Type::Address),
                other => bail_type_at!(span, "Contract.address expects a contract, got {}", other),
            },
            ImplicitAccount => {
                self.expect(span, &Type::KeyHash, ty(0))?;
                (prim, Type::Contract(Box::new(Type::Unit)))
            }
            SetDelegate => {
                self.expect(span, &Type::option(Type::KeyHash), ty(0))?;
                (prim, Type::Operation)
            }
            CreateAccount => {
                self.expect(span, &Type::KeyHash, ty(0))?;
                self.expect(span, &Type::option(Type::KeyHash), ty(1))?;
                self.expect(span, &Type::Bool, ty(2))?;
                self.expect(span, &Type::Tez, ty(3))?;
                (prim, Type::pair(Type::Operation, Type::Address))
            }
            other => {
                return Err(err_internal!(
                    "checker",
                    "primitive {} reached prim_result unresolved",
                    other
                ))
            }
        };
        Ok(result)
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// Type of a constant, using `annot` to resolve the ambiguous cases
    /// (empty collections, `None`, injections).
    fn const_type(&mut self, span: Span, value: &Const, annot: Option<&Type>) -> Result<Type> {
        if let Some(ty) = value.ground_type() {
            if let Some(annot) = annot {
                self.expect(span, annot, &ty)?;
            }
            return Ok(ty);
        }
        let annot = match annot {
            Some(t) => t,
            None => bail_type_at!(span, "this constant needs a type annotation"),
        };
        self.check_const(span, value, annot)?;
        Ok(annot.clone())
    }

    fn check_const(&mut self, span: Span, value: &Const, expected: &Type) -> Result<()> {
        match (value, expected) {
            (Const::None_, Type::Option_(_)) => Ok(()),
            (Const::Some_(inner), Type::Option_(t)) => self.check_const(span, inner, t),
            (Const::Left(inner), Type::Or(l, _)) => self.check_const(span, inner, l),
            (Const::Right(inner), Type::Or(_, r)) => self.check_const(span, inner, r),
            (Const::List(items), Type::List(elt)) => {
                for item in items {
                    self.check_const(span, item, elt)?;
                }
                Ok(())
            }
            (Const::Set(items), Type::Set(elt)) => {
                for item in items {
                    self.check_const(span, item, elt)?;
                }
                Ok(())
            }
            (Const::Map(items), Type::Map(k, v)) => {
                for (key, val) in items {
                    self.check_const(span, key, k)?;
                    self.check_const(span, val, v)?;
                }
                Ok(())
            }
            (Const::EmptyBigMap, Type::BigMap(_, _)) => {
                if self.effect_ctx != EffectContext::Initializer {
                    return Err(err_kind_at!(
                        BadBigMap,
                        span,
                        "BigMap.empty is only allowed in the storage initializer"
                    ));
                }
                Ok(())
            }
            (Const::Tuple(items), Type::Tuple(tys)) if items.len() == tys.len() => {
                for (item, ty) in items.iter().zip(tys) {
                    self.check_const(span, item, ty)?;
                }
                Ok(())
            }
            (value, expected) => match value.ground_type() {
                Some(ty) => self.expect(span, expected, &ty),
                None => bail_type_at!(span, "constant does not match type {}", expected),
            },
        }
    }
}

/// Syntactic divergence: the expression always fails, so its type is
/// whatever the context needs.
fn diverges(e: &Expression) -> bool {
    match &e.kind {
        ExprKind::Failwith(_) => true,
        ExprKind::Let { body, .. } => diverges(body),
        ExprKind::Seq(_, second) => diverges(second),
        ExprKind::If {
            then_branch,
            else_branch,
            ..
        } => diverges(then_branch) && diverges(else_branch),
        _ => false,
    }
}

fn check_version(version: &str) -> Result<()> {
    let supported = "0.4";
    let major_minor = |s: &str| -> Option<(u32, u32)> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    };
    let declared = major_minor(version)
        .ok_or_else(|| err_type_at!(Span::generated(), "malformed version {}", version))?;
    let current = major_minor(supported).expect("supported version is well-formed");
    if declared.0 != current.0 || declared.1 > current.1 {
        bail_type_at!(
            Span::generated(),
            "version {} is not supported (compiler speaks {})",
            version,
            supported
        );
    }
    Ok(())
}

/// The arithmetic result table dictated by the target machine.
pub fn arith_result(prim: Prim, lhs: &Type, rhs: &Type) -> Option<Type> {
    use Type::*;
    match prim {
        Prim::Add => match (lhs, rhs) {
            (Nat, Nat) => Some(Nat),
            (Int | Nat, Int | Nat) => Some(Int),
            (Tez, Tez) => Some(Tez),
            (Timestamp, Int) | (Int, Timestamp) => Some(Timestamp),
            _ => None,
        },
        Prim::Sub => match (lhs, rhs) {
            (Nat, Nat) | (Int | Nat, Int | Nat) => Some(Int),
            (Tez, Tez) => Some(Tez),
            (Timestamp, Int) => Some(Timestamp),
            (Timestamp, Timestamp) => Some(Int),
            _ => None,
        },
        Prim::Mul => match (lhs, rhs) {
            (Nat, Nat) => Some(Nat),
            (Int | Nat, Int | Nat) => Some(Int),
            (Tez, Nat) | (Nat, Tez) => Some(Tez),
            _ => None,
        },
        Prim::Ediv => match (lhs, rhs) {
            (Nat, Nat) => Some(Type::option(Type::pair(Nat, Nat))),
            (Int | Nat, Int | Nat) => Some(Type::option(Type::pair(Int, Nat))),
            (Tez, Nat) => Some(Type::option(Type::pair(Tez, Tez))),
            (Tez, Tez) => Some(Type::option(Type::pair(Nat, Tez))),
            _ => None,
        },
        _ => None,
    }
}

/// Count references to `name` in `body`. Each binder shadows only the
/// subterm it scopes over; scrutinee and value positions always count.
pub fn count_uses(body: &TExpr, name: &str) -> usize {
    // Count a scoped subterm unless one of its binders shadows `name`.
    fn gated(body: &TExpr, name: &str, binders: &[Option<&str>]) -> usize {
        if binders.iter().any(|b| *b == Some(name)) {
            0
        } else {
            count_uses(body, name)
        }
    }

    match &body.kind {
        TExprKind::Var(v) => usize::from(v.as_str() == name),
        TExprKind::Let {
            name: bound,
            value,
            body,
            ..
        } => count_uses(value, name) + gated(body, name, &[Some(bound.as_str())]),
        TExprKind::Lambda {
            param,
            rec_name,
            body,
            ..
        } => gated(body, name, &[Some(param.as_str()), rec_name.as_deref()]),
        TExprKind::Closure { param, body, .. } => gated(body, name, &[Some(param.as_str())]),
        TExprKind::MatchOption {
            arg,
            ifnone,
            some_name,
            ifsome,
        } => {
            count_uses(arg, name)
                + count_uses(ifnone, name)
                + gated(ifsome, name, &[some_name.as_deref()])
        }
        TExprKind::MatchNat {
            arg,
            plus_name,
            ifplus,
            minus_name,
            ifminus,
        } => {
            count_uses(arg, name)
                + gated(ifplus, name, &[plus_name.as_deref()])
                + gated(ifminus, name, &[minus_name.as_deref()])
        }
        TExprKind::MatchList {
            arg,
            head_name,
            tail_name,
            ifcons,
            ifnil,
        } => {
            count_uses(arg, name)
                + count_uses(ifnil, name)
                + gated(ifcons, name, &[head_name.as_deref(), tail_name.as_deref()])
        }
        TExprKind::MatchVariant { arg, cases } => {
            count_uses(arg, name)
                + cases
                    .iter()
                    .map(|c| gated(&c.body, name, &[c.var.as_deref()]))
                    .sum::<usize>()
        }
        TExprKind::Loop {
            name: bound,
            body,
            init,
        } => count_uses(init, name) + gated(body, name, &[Some(bound.as_str())]),
        TExprKind::LoopLeft {
            name: bound,
            body,
            init,
            acc,
        } => {
            count_uses(init, name)
                + acc.as_ref().map_or(0, |a| count_uses(a, name))
                + gated(body, name, &[Some(bound.as_str())])
        }
        TExprKind::Fold {
            name: bound,
            body,
            coll,
            init,
            ..
        }
        | TExprKind::MapFold {
            name: bound,
            body,
            coll,
            init,
            ..
        } => {
            count_uses(coll, name)
                + count_uses(init, name)
                + gated(body, name, &[Some(bound.as_str())])
        }
        TExprKind::MapOp {
            name: bound,
            body,
            coll,
            ..
        } => count_uses(coll, name) + gated(body, name, &[Some(bound.as_str())]),
        kind => kind.subterms().iter().map(|sub| count_uses(sub, name)).sum(),
    }
}

/// Collect free variables of `body` in first-occurrence order.
pub fn collect_free_vars(body: &TExpr, bound: &mut HashSet<String>, out: &mut Vec<String>) {
    match &body.kind {
        TExprKind::Var(name) => {
            if !bound.contains(name) && !out.contains(name) {
                out.push(name.clone());
            }
        }
        TExprKind::Let { name, value, body: inner, .. } => {
            collect_free_vars(value, bound, out);
            let added = bound.insert(name.clone());
            collect_free_vars(inner, bound, out);
            if added {
                bound.remove(name);
            }
        }
        TExprKind::Lambda { param, body: inner, .. }
        | TExprKind::Closure { param, body: inner, .. } => {
            let added = bound.insert(param.clone());
            collect_free_vars(inner, bound, out);
            if added {
                bound.remove(param);
            }
        }
        TExprKind::MatchOption {
            arg,
            ifnone,
            some_name,
            ifsome,
        } => {
            collect_free_vars(arg, bound, out);
            collect_free_vars(ifnone, bound, out);
            with_bound(bound, some_name.as_deref(), |b| collect_free_vars(ifsome, b, out));
        }
        TExprKind::MatchNat {
            arg,
            plus_name,
            ifplus,
            minus_name,
            ifminus,
        } => {
            collect_free_vars(arg, bound, out);
            with_bound(bound, plus_name.as_deref(), |b| collect_free_vars(ifplus, b, out));
            with_bound(bound, minus_name.as_deref(), |b| collect_free_vars(ifminus, b, out));
        }
        TExprKind::MatchList {
            arg,
            head_name,
            tail_name,
            ifcons,
            ifnil,
        } => {
            collect_free_vars(arg, bound, out);
            collect_free_vars(ifnil, bound, out);
            with_bound(bound, head_name.as_deref(), |b| {
                with_bound(b, tail_name.as_deref(), |b| collect_free_vars(ifcons, b, out));
            });
        }
        TExprKind::MatchVariant { arg, cases } => {
            collect_free_vars(arg, bound, out);
            for case in cases {
                with_bound(bound, case.var.as_deref(), |b| collect_free_vars(&case.body, b, out));
            }
        }
        TExprKind::Loop { name, body: inner, init } => {
            collect_free_vars(init, bound, out);
            with_bound(bound, Some(name), |b| collect_free_vars(inner, b, out));
        }
        TExprKind::LoopLeft {
            name,
            body: inner,
            init,
            acc,
        } => {
            collect_free_vars(init, bound, out);
            if let Some(acc) = acc {
                collect_free_vars(acc, bound, out);
            }
            with_bound(bound, Some(name), |b| collect_free_vars(inner, b, out));
        }
        TExprKind::Fold {
            name,
            body: inner,
            coll,
            init,
            ..
        }
        | TExprKind::MapFold {
            name,
            body: inner,
            coll,
            init,
            ..
        } => {
            collect_free_vars(coll, bound, out);
            collect_free_vars(init, bound, out);
            with_bound(bound, Some(name), |b| collect_free_vars(inner, b, out));
        }
        TExprKind::MapOp {
            name,
            body: inner,
            coll,
            ..
        } => {
            collect_free_vars(coll, bound, out);
            with_bound(bound, Some(name), |b| collect_free_vars(inner, b, out));
        }
        kind => {
            for sub in kind.subterms() {
                collect_free_vars(sub, bound, out);
            }
        }
    }
}

fn with_bound<F: FnOnce(&mut HashSet<String>)>(
    bound: &mut HashSet<String>,
    name: Option<&str>,
    f: F,
) {
    match name {
        Some(name) => {
            let added = bound.insert(name.to_string());
            f(bound);
            if added {
                bound.remove(name);
            }
        }
        None => f(bound),
    }
}
