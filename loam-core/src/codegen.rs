//! Stack-code generation from the encoded typed IR.
//!
//! The generator maintains `depth`, the current stack height relative to
//! the frame base, and an environment mapping each variable name to the
//! absolute depth its value sits at. A variable at position `p` with the
//! stack `depth` cells tall reads as `DUP(depth - p)`; a let extends the
//! environment for its body and cleans the binding with `DIP_DROP(1,1)`.
//!
//! The output is deterministic: for any input IR the emitted sequence is
//! byte-identical across runs (the environment is a journal searched by
//! name, so no iteration order is ever observable).

use crate::asm::{ContractCode, Instr, InstrKind, Op};
use crate::ast::{NodeCounter, Span};
use crate::encode::{encode_contract, EncodedInit, EncodedProgram};
use crate::error::Result;
use crate::simplify::simplify_program;
use crate::tir::{Contract, Prim, TExpr, TExprKind, VariantCase};
use crate::types::{Const, Env, Type};
use crate::{err_gen_at, err_internal};
use log::debug;

/// Generate the contract code for an encoded program.
pub fn generate(env: &Env, program: &EncodedProgram, nc: &mut NodeCounter) -> Result<ContractCode> {
    debug!("generating code for {}", program.name);
    let mut gen = Codegen::new(env, nc);
    let code = gen.entry_frame(
        &program.param_name,
        &program.storage_name,
        &program.body,
    )?;
    Ok(ContractCode {
        parameter: program.parameter.clone(),
        storage: program.storage.clone(),
        code,
    })
}

/// Generate the initializer contract, when the initial storage is not a
/// compile-time constant.
pub fn generate_initializer(
    env: &Env,
    program: &EncodedProgram,
    nc: &mut NodeCounter,
) -> Result<Option<ContractCode>> {
    let (parameter, param_names, storage_name, body) = match &program.initializer {
        Some(EncodedInit::Code {
            parameter,
            param_names,
            storage_name,
            body,
        }) => (parameter, param_names, storage_name, body),
        _ => return Ok(None),
    };
    let mut gen = Codegen::new(env, nc);
    let code = gen.initializer_frame(parameter, param_names, storage_name, body)?;
    Ok(Some(ContractCode {
        parameter: parameter.clone(),
        storage: program.storage.clone(),
        code,
    }))
}

struct Codegen<'a> {
    env: &'a Env,
    nc: &'a mut NodeCounter,
    /// Current stack height relative to the frame base.
    depth: usize,
    /// Variable name -> absolute stack position (0 = frame bottom).
    vars: DepthMap,
}

impl<'a> Codegen<'a> {
    fn new(env: &'a Env, nc: &'a mut NodeCounter) -> Self {
        Codegen {
            env,
            nc,
            depth: 0,
            vars: DepthMap::new(),
        }
    }

    fn emit(&mut self, out: &mut Vec<Instr>, kind: InstrKind, span: Span) {
        out.push(Instr::new(kind, span));
    }

    /// Annotate the value on top of the stack with a (sanitized)
    /// variable name. Instructions that cannot carry an annotation in
    /// the wire format get a trailing RENAME.
    fn annotate(&self, out: &mut Vec<Instr>, name: &str, span: Span) {
        let name = sanitize_name(name);
        match out.last_mut() {
            Some(last) if !is_control_form(&last.kind) => {
                last.name = Some(name);
            }
            _ => {
                let mut rename = Instr::new(InstrKind::Rename, span);
                rename.name = Some(name);
                out.push(rename);
            }
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// The entry frame: the machine provides `(parameter, storage)` as
    /// the only stack cell. The prelude unpacks it so the body sees the
    /// parameter at position 1 and the storage at position 0; the
    /// trailer drops everything but the result pair.
    fn entry_frame(&mut self, param_name: &str, storage_name: &str, body: &TExpr) -> Result<Vec<Instr>> {
        let span = body.span;
        let mut out = Vec::new();
        self.emit(&mut out, InstrKind::Dup(1), span);
        let cdr = Instr::new(InstrKind::Cdr(None), span).named(Some(sanitize_name(storage_name)));
        self.emit(&mut out, InstrKind::Dip(1, vec![cdr]), span);
        self.emit(&mut out, InstrKind::Car(None), span);
        self.annotate(&mut out, param_name, span);
        self.depth = 2;
        self.vars.bind(storage_name, 0);
        self.vars.bind(param_name, 1);

        self.compile(body, &mut out)?;
        self.emit(&mut out, InstrKind::DipDrop(1, 2), span);
        self.depth = 1;
        Ok(out)
    }

    /// The initializer frame: parameter is the tuple of init arguments,
    /// storage is the target storage with the runtime-provided empty
    /// bigmap pre-bound at slot 0. The body computes the storage value;
    /// the trailer packs `([], storage)`.
    fn initializer_frame(
        &mut self,
        parameter: &Type,
        param_names: &[String],
        storage_name: &str,
        body: &TExpr,
    ) -> Result<Vec<Instr>> {
        let span = body.span;
        let mut out = Vec::new();
        self.emit(&mut out, InstrKind::Dup(1), span);
        let cdr = Instr::new(InstrKind::Cdr(None), span).named(Some(sanitize_name(storage_name)));
        self.emit(&mut out, InstrKind::Dip(1, vec![cdr]), span);
        self.emit(&mut out, InstrKind::Car(None), span);
        self.depth = 2;
        self.vars.bind(storage_name, 0);

        // Destructure the parameter tuple into one binding per declared
        // initializer argument.
        match param_names {
            [] => {}
            [single] => {
                self.vars.bind(single, 1);
            }
            many => {
                let arity = match parameter {
                    Type::Tuple(tys) => tys.len(),
                    _ => {
                        return Err(err_internal!(
                            "codegen",
                            "initializer with {} parameters has non-tuple type",
                            many.len()
                        ))
                    }
                };
                for (i, name) in many.iter().enumerate() {
                    self.emit(&mut out, InstrKind::Dup(self.depth - 1), span);
                    self.depth += 1;
                    self.project(&mut out, i, arity, None, span);
                    self.annotate(&mut out, name, span);
                    self.vars.bind(name, self.depth - 1);
                }
            }
        }

        self.compile(body, &mut out)?;
        self.emit(&mut out, InstrKind::Nil(Type::Operation), span);
        self.depth += 1;
        self.emit(&mut out, InstrKind::Pair, span);
        self.depth -= 1;
        let junk = self.depth - 1;
        self.emit(&mut out, InstrKind::DipDrop(1, junk), span);
        self.depth = 1;
        Ok(out)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Compile `e`, leaving exactly one new cell (its value) on top.
    fn compile(&mut self, e: &TExpr, out: &mut Vec<Instr>) -> Result<()> {
        let span = e.span;
        match &e.kind {
            TExprKind::Var(name) => {
                let pos = self
                    .vars
                    .position(name)
                    .ok_or_else(|| err_gen_at!(span, "variable {} has no stack position", name))?;
                self.emit(out, InstrKind::Dup(self.depth - pos), span);
                self.depth += 1;
                self.annotate(out, e.name.as_deref().unwrap_or(name), span);
            }

            TExprKind::Const(c) => {
                self.compile_const(c, &e.ty, span, out)?;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Let { name, value, body, .. } => {
                self.compile(value, out)?;
                self.annotate(out, name, span);
                let mark = self.vars.mark();
                self.vars.bind(name, self.depth - 1);
                let result = self.compile(body, out);
                self.vars.rollback(mark);
                result?;
                self.emit(out, InstrKind::DipDrop(1, 1), span);
                self.depth -= 1;
            }

            TExprKind::Seq(first, second) => {
                self.compile(first, out)?;
                self.emit(out, InstrKind::Drop, span);
                self.depth -= 1;
                self.compile(second, out)?;
            }

            TExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.compile(cond, out)?;
                self.depth -= 1;
                let base = self.depth;
                let then_code = self.in_branch(base, |gen, code| gen.compile(then_branch, code))?;
                let else_code = self.in_branch(base, |gen, code| gen.compile(else_branch, code))?;
                self.depth = base + 1;
                self.emit(out, InstrKind::If(then_code, else_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::Tuple(items) => {
                self.compile_tuple(items, None, span, out)?;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::RecordCons(fields) => {
                let labels: Vec<&str> = fields.iter().map(|(l, _)| l.as_str()).collect();
                let items: Vec<&TExpr> = fields.iter().map(|(_, v)| v).collect();
                self.compile_record(&items, &labels, span, out)?;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Proj { index, label, tuple } => {
                let arity = tuple_arity(&tuple.ty)
                    .ok_or_else(|| err_gen_at!(span, "projection from non-tuple {}", tuple.ty))?;
                self.compile(tuple, out)?;
                self.project(out, *index, arity, label.clone(), span);
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::SetField {
                index,
                label,
                tuple,
                value,
            } => {
                let arity = tuple_arity(&tuple.ty)
                    .ok_or_else(|| err_gen_at!(span, "field update on non-tuple {}", tuple.ty))?;
                self.compile(tuple, out)?;
                self.compile_set_field(out, *index, arity, label.as_deref(), value, span)?;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Inject { left, ctor, arg } => {
                let (l_ty, r_ty) = match &e.ty {
                    Type::Or(l, r) => (l.as_ref().clone(), r.as_ref().clone()),
                    other => return Err(err_gen_at!(span, "injection typed {} (not an or)", other)),
                };
                self.compile(arg, out)?;
                let kind = if *left {
                    InstrKind::Left(r_ty, ctor.clone())
                } else {
                    InstrKind::Right(l_ty, ctor.clone())
                };
                self.emit(out, kind, span);
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Construct { ctor, .. } => {
                return Err(err_internal!("codegen", "constructor {} survived encoding", ctor));
            }
            TExprKind::Closure { .. } => {
                return Err(err_internal!("codegen", "closure survived encoding"));
            }

            TExprKind::MatchOption {
                arg,
                ifnone,
                some_name,
                ifsome,
            } => {
                self.compile(arg, out)?;
                self.depth -= 1;
                let base = self.depth;
                let none_code = self.in_branch(base, |gen, code| gen.compile(ifnone, code))?;
                let some_code = self.in_branch(base + 1, |gen, code| {
                    gen.compile_bound_branch(code, &[some_name.as_deref()], ifsome, span)
                })?;
                self.depth = base + 1;
                self.emit(out, InstrKind::IfNone(none_code, some_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::MatchNat {
                arg,
                plus_name,
                ifplus,
                minus_name,
                ifminus,
            } => {
                self.compile(arg, out)?;
                self.emit(out, InstrKind::Dup(1), span);
                self.depth += 1;
                self.emit(out, InstrKind::Op(Op::Abs), span);
                self.emit(out, InstrKind::Swap, span);
                self.emit(out, InstrKind::Op(Op::Ge), span);
                // stack: [is_plus, abs]; IF consumes the bool, both arms
                // consume the carried natural.
                self.depth -= 1;
                let base = self.depth;
                let plus_code = self.in_branch(base, |gen, code| {
                    gen.compile_bound_branch(code, &[plus_name.as_deref()], ifplus, span)
                })?;
                let minus_code = self.in_branch(base, |gen, code| {
                    gen.compile_bound_branch(code, &[minus_name.as_deref()], ifminus, span)
                })?;
                self.depth = base;
                self.emit(out, InstrKind::If(plus_code, minus_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::MatchList {
                arg,
                head_name,
                tail_name,
                ifcons,
                ifnil,
            } => {
                self.compile(arg, out)?;
                self.depth -= 1;
                let base = self.depth;
                // Cons branch: head is pushed first, the tail sits on
                // top of it.
                let cons_code = self.in_branch(base + 2, |gen, code| {
                    gen.compile_bound_branch(
                        code,
                        &[head_name.as_deref(), tail_name.as_deref()],
                        ifcons,
                        span,
                    )
                })?;
                let nil_code = self.in_branch(base, |gen, code| gen.compile(ifnil, code))?;
                self.depth = base + 1;
                self.emit(out, InstrKind::IfCons(cons_code, nil_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::MatchVariant { arg, cases } => {
                self.compile(arg, out)?;
                self.depth -= 1;
                let or_ty = arg.ty.clone();
                let code = self.compile_variant_cases(cases, &or_ty, span)?;
                out.extend(code);
                self.depth += 1;
                self.rename_after(out, e, span);
            }

            TExprKind::Loop { name, body, init } => {
                self.compile(init, out)?;
                // The seeded condition is consumed by LOOP immediately,
                // so the depth is unchanged on entry to the body.
                self.emit(out, InstrKind::Push(Type::Bool, Const::Bool(true)), span);
                let base = self.depth;
                let body_code = self.in_branch(base, |gen, code| {
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    gen.emit(code, InstrKind::Dup(1), span);
                    gen.depth += 1;
                    gen.emit(code, InstrKind::Car(None), span);
                    gen.emit(
                        code,
                        InstrKind::Dip(1, vec![Instr::new(InstrKind::Cdr(None), span)]),
                        span,
                    );
                    Ok(())
                })?;
                self.depth = base;
                self.emit(out, InstrKind::Loop(body_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::LoopLeft {
                name,
                body,
                init,
                acc,
            } => {
                self.compile_loop_left(e, name, body, init, acc.as_deref(), out)?;
            }

            TExprKind::Fold {
                name, body, coll, init, ..
            } => {
                self.compile(init, out)?;
                self.compile(coll, out)?;
                self.depth -= 1;
                let base = self.depth;
                // Each iteration receives the element on top of the
                // accumulator; the body re-pairs them.
                let body_code = self.in_branch(base + 1, |gen, code| {
                    gen.emit(code, InstrKind::Pair, span);
                    gen.depth -= 1;
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    Ok(())
                })?;
                self.depth = base;
                self.emit(out, InstrKind::Iter(body_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::MapOp { name, body, coll, .. } => {
                self.compile(coll, out)?;
                self.depth -= 1;
                let base = self.depth;
                let body_code = self.in_branch(base + 1, |gen, code| {
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    Ok(())
                })?;
                self.depth = base + 1;
                self.emit(out, InstrKind::MapI(body_code), span);
                self.rename_after(out, e, span);
            }

            TExprKind::MapFold {
                name, body, coll, init, ..
            } => {
                self.compile(init, out)?;
                self.compile(coll, out)?;
                self.depth -= 1;
                let base = self.depth;
                // Body marshalling: pair the element with the threaded
                // accumulator, run the body, then split the result pair
                // so the mapped element lands on top for collection and
                // the new accumulator stays beneath.
                let body_code = self.in_branch(base + 1, |gen, code| {
                    gen.emit(code, InstrKind::Pair, span);
                    gen.depth -= 1;
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    gen.emit(code, InstrKind::Dup(1), span);
                    gen.depth += 1;
                    gen.emit(code, InstrKind::Car(None), span);
                    gen.emit(
                        code,
                        InstrKind::Dip(1, vec![Instr::new(InstrKind::Cdr(None), span)]),
                        span,
                    );
                    Ok(())
                })?;
                self.depth = base + 1;
                self.emit(out, InstrKind::MapI(body_code), span);
                self.emit(out, InstrKind::Pair, span);
                self.depth -= 1;
                self.rename_after(out, e, span);
            }

            TExprKind::Apply { prim, args } => {
                self.compile_apply(e, *prim, args, out)?;
            }

            TExprKind::Call { func, arg } => {
                self.compile(func, out)?;
                self.compile(arg, out)?;
                self.emit(out, InstrKind::Exec, span);
                self.depth -= 1;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Lambda {
                param,
                param_ty,
                ret_ty,
                rec_name,
                body,
            } => {
                if rec_name.is_some() {
                    return Err(err_internal!("codegen", "recursive lambda survived encoding"));
                }
                let body_code = self.lambda_frame(param, body)?;
                self.emit(
                    out,
                    InstrKind::Lambda(param_ty.clone(), ret_ty.clone(), body_code),
                    span,
                );
                self.depth += 1;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Transfer {
                contract,
                amount,
                arg,
            } => {
                self.compile(contract, out)?;
                self.compile(amount, out)?;
                self.compile(arg, out)?;
                self.emit(out, InstrKind::Op(Op::TransferTokens), span);
                self.depth -= 2;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Failwith(arg) => {
                self.compile(arg, out)?;
                self.emit(out, InstrKind::Failwith, span);
                // FAILWITH never returns; the phantom result keeps the
                // bookkeeping aligned for enclosing branches.
            }

            TExprKind::CreateContract {
                delegate,
                amount,
                contract,
                storage_init,
            } => {
                let code = self.compile_nested(contract)?;
                self.compile(storage_init, out)?;
                self.compile(amount, out)?;
                self.compile(delegate, out)?;
                self.emit(out, InstrKind::CreateContract(Box::new(code)), span);
                // delegate, amount, storage consumed; operation and
                // address pushed.
                self.depth -= 1;
                self.emit(out, InstrKind::Pair, span);
                self.depth -= 1;
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::ContractAt { addr, ty } => {
                self.compile(addr, out)?;
                self.emit(out, InstrKind::Contract(ty.clone()), span);
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }

            TExprKind::Unpack { arg, ty } => {
                self.compile(arg, out)?;
                self.emit(out, InstrKind::Unpack(ty.clone()), span);
                if let Some(name) = &e.name {
                    self.annotate(out, name, span);
                }
            }
        }
        Ok(())
    }

    /// Compile a branch body at the given entry depth, returning its
    /// instruction sequence. The surrounding depth is left untouched.
    fn in_branch<F>(&mut self, entry_depth: usize, f: F) -> Result<Vec<Instr>>
    where
        F: FnOnce(&mut Self, &mut Vec<Instr>) -> Result<()>,
    {
        let saved = self.depth;
        self.depth = entry_depth;
        let mut code = Vec::new();
        let result = f(self, &mut code);
        self.depth = saved;
        result?;
        Ok(code)
    }

    /// A match branch with values pushed by the machine, bound to the
    /// given names (deepest first). `None` entries drop their value.
    fn compile_bound_branch(
        &mut self,
        code: &mut Vec<Instr>,
        names: &[Option<&str>],
        body: &TExpr,
        span: Span,
    ) -> Result<()> {
        let mut bound = 0usize;
        let mark = self.vars.mark();
        // Pushed values occupy the top `names.len()` cells; the first
        // name is the deepest.
        for (i, name) in names.iter().enumerate() {
            match name {
                Some(name) => {
                    let pos = self.depth - names.len() + i;
                    self.vars.bind(name, pos);
                    bound += 1;
                }
                None => {}
            }
        }
        if bound == 0 {
            // Nothing bound: drop the pushed values before the body.
            for _ in 0..names.len() {
                self.emit(code, InstrKind::Drop, span);
                self.depth -= 1;
            }
        }
        let result = self.compile(body, code);
        self.vars.rollback(mark);
        result?;
        if bound > 0 {
            self.emit(code, InstrKind::DipDrop(1, names.len()), span);
            self.depth -= names.len();
        }
        Ok(())
    }

    /// Nested IF_LEFT tree for canonical variant matching.
    fn compile_variant_cases(
        &mut self,
        cases: &[VariantCase],
        or_ty: &Type,
        span: Span,
    ) -> Result<Vec<Instr>> {
        if cases.len() == 1 {
            // Single-constructor variants are encoded as the bare
            // payload; bind it directly.
            let case = &cases[0];
            let base = self.depth;
            return self.in_branch(base + 1, |gen, code| {
                gen.compile_bound_branch(code, &[case.var.as_deref()], &case.body, span)
            });
        }
        let (l_ty, r_ty) = match or_ty {
            Type::Or(l, r) => (l.as_ref().clone(), r.as_ref().clone()),
            other => return Err(err_gen_at!(span, "match cases over non-or type {}", other)),
        };
        let base = self.depth;
        let case = &cases[0];
        let left_code = self.in_branch(base + 1, |gen, code| {
            gen.compile_bound_branch(code, &[case.var.as_deref()], &case.body, span)
        })?;
        let right_code = if cases.len() == 2 {
            let case = &cases[1];
            self.in_branch(base + 1, |gen, code| {
                gen.compile_bound_branch(code, &[case.var.as_deref()], &case.body, span)
            })?
        } else {
            let saved = self.depth;
            self.depth = base;
            let inner = self.compile_variant_cases(&cases[1..], &r_ty, span);
            self.depth = saved;
            inner?
        };
        let _ = l_ty;
        Ok(vec![Instr::new(InstrKind::IfLeft(left_code, right_code), span)])
    }

    fn compile_loop_left(
        &mut self,
        e: &TExpr,
        name: &str,
        body: &TExpr,
        init: &TExpr,
        acc: Option<&TExpr>,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let span = e.span;
        let result_ty = match (&body.ty, acc) {
            (Type::Or(_, r), None) => r.as_ref().clone(),
            (Type::Tuple(items), Some(_)) if items.len() == 2 => match &items[0] {
                Type::Or(_, r) => r.as_ref().clone(),
                other => return Err(err_gen_at!(span, "loop-left body typed {}", other)),
            },
            (other, _) => return Err(err_gen_at!(span, "loop-left body typed {}", other)),
        };
        match acc {
            None => {
                self.compile(init, out)?;
                self.emit(out, InstrKind::Left(result_ty, None), span);
                self.depth -= 1;
                let base = self.depth;
                let body_code = self.in_branch(base + 1, |gen, code| {
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    Ok(())
                })?;
                self.depth = base + 1;
                self.emit(out, InstrKind::LoopLeft(body_code), span);
                self.rename_after(out, e, span);
            }
            Some(acc) => {
                self.compile(acc, out)?;
                self.compile(init, out)?;
                self.emit(out, InstrKind::Left(result_ty, None), span);
                self.depth -= 1;
                let base = self.depth;
                // Body receives the Left payload on top of the threaded
                // accumulator; re-pair for the source-level binding,
                // then split the returned (or, acc) pair back out.
                let body_code = self.in_branch(base + 1, |gen, code| {
                    gen.emit(code, InstrKind::Pair, span);
                    gen.depth -= 1;
                    let mark = gen.vars.mark();
                    gen.vars.bind(name, gen.depth - 1);
                    let result = gen.compile(body, code);
                    gen.vars.rollback(mark);
                    result?;
                    gen.emit(code, InstrKind::DipDrop(1, 1), span);
                    gen.depth -= 1;
                    gen.emit(code, InstrKind::Dup(1), span);
                    gen.depth += 1;
                    gen.emit(code, InstrKind::Car(None), span);
                    gen.emit(
                        code,
                        InstrKind::Dip(1, vec![Instr::new(InstrKind::Cdr(None), span)]),
                        span,
                    );
                    Ok(())
                })?;
                self.depth = base + 1;
                self.emit(out, InstrKind::LoopLeft(body_code), span);
                self.emit(out, InstrKind::Pair, span);
                self.depth -= 1;
                self.rename_after(out, e, span);
            }
        }
        Ok(())
    }

    fn compile_apply(&mut self, e: &TExpr, prim: Prim, args: &[TExpr], out: &mut Vec<Instr>) -> Result<()> {
        let span = e.span;

        // List.rev has no machine instruction; reverse through an
        // accumulating ITER.
        if prim == Prim::ListRev {
            let elt_ty = match &e.ty {
                Type::List(elt) => elt.as_ref().clone(),
                other => return Err(err_gen_at!(span, "List.rev typed {}", other)),
            };
            self.compile(&args[0], out)?;
            self.emit(out, InstrKind::Nil(elt_ty), span);
            self.depth += 1;
            self.emit(out, InstrKind::Swap, span);
            self.depth -= 1;
            let body = vec![Instr::new(InstrKind::Op(Op::Cons), span)];
            self.emit(out, InstrKind::Iter(body), span);
            if let Some(name) = &e.name {
                self.annotate(out, name, span);
            }
            return Ok(());
        }

        // Operands are compiled in reverse so the first argument ends on
        // top, matching the machine's operand order.
        for arg in args.iter().rev() {
            self.compile(arg, out)?;
        }

        let ops: &[Op] = match prim {
            Prim::Add => &[Op::Add],
            Prim::Sub => &[Op::Sub],
            Prim::Mul => &[Op::Mul],
            Prim::Ediv => &[Op::Ediv],
            Prim::Neg => &[Op::Neg],
            Prim::Abs => &[Op::Abs],
            Prim::IsNat => &[Op::IsNat],
            Prim::IntOf => &[Op::Int],
            Prim::Not => &[Op::Not],
            Prim::And => &[Op::And],
            Prim::Or => &[Op::Or],
            Prim::Xor => &[Op::Xor],
            Prim::Lsl => &[Op::Lsl],
            Prim::Lsr => &[Op::Lsr],
            Prim::Compare => &[Op::Compare],
            Prim::Eq => &[Op::Compare, Op::Eq],
            Prim::Neq => &[Op::Compare, Op::Neq],
            Prim::Lt => &[Op::Compare, Op::Lt],
            Prim::Le => &[Op::Compare, Op::Le],
            Prim::Gt => &[Op::Compare, Op::Gt],
            Prim::Ge => &[Op::Compare, Op::Ge],
            Prim::Concat => &[Op::Concat],
            Prim::Slice => &[Op::Slice],
            Prim::Pack => &[Op::Pack],
            Prim::ListSize | Prim::SetSize | Prim::MapSize | Prim::StringSize | Prim::BytesSize => {
                &[Op::Size]
            }
            Prim::SetMem | Prim::MapMem | Prim::BigMapMem => &[Op::Mem],
            Prim::MapGet | Prim::BigMapGet => &[Op::Get],
            Prim::SetUpdate | Prim::MapUpdate | Prim::BigMapUpdate => &[Op::Update],
            Prim::Cons => &[Op::Cons],
            Prim::SomeOp => &[Op::Some_],
            Prim::Blake2b => &[Op::Blake2b],
            Prim::Sha256 => &[Op::Sha256],
            Prim::Sha512 => &[Op::Sha512],
            Prim::HashKey => &[Op::HashKey],
            Prim::CheckSignature => &[Op::CheckSignature],
            Prim::Balance => &[Op::Balance],
            Prim::Now => &[Op::Now],
            Prim::Amount => &[Op::Amount],
            Prim::Sender => &[Op::Sender],
            Prim::Source => &[Op::Source],
            Prim::SelfOp => &[Op::Self_],
            Prim::StepsToQuota => &[Op::StepsToQuota],
            Prim::AddressOf => &[Op::Address],
            Prim::ImplicitAccount => &[Op::ImplicitAccount],
            Prim::SetDelegate => &[Op::SetDelegate],
            Prim::CreateAccount => &[Op::CreateAccount],
            other => {
                return Err(err_internal!("codegen", "primitive {} survived encoding", other));
            }
        };
        for op in ops {
            self.emit(out, InstrKind::Op(*op), span);
        }

        // Net effect of the whole application: operands consumed, one
        // result pushed, except CREATE_ACCOUNT which pushes a pair.
        if prim == Prim::CreateAccount {
            self.depth -= args.len();
            self.depth += 2;
            self.emit(out, InstrKind::Pair, span);
            self.depth -= 1;
        } else if !args.is_empty() {
            self.depth -= args.len() - 1;
        } else {
            self.depth += 1;
        }
        if let Some(name) = &e.name {
            self.annotate(out, name, span);
        }
        Ok(())
    }

    /// Right-leaning construction, last element first.
    fn compile_tuple(
        &mut self,
        items: &[TExpr],
        labels: Option<&[&str]>,
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let n = items.len();
        if n == 0 {
            self.emit(out, InstrKind::Unit, span);
            self.depth += 1;
            return Ok(());
        }
        self.compile(&items[n - 1], out)?;
        for i in (0..n - 1).rev() {
            self.compile(&items[i], out)?;
            let kind = match labels {
                Some(labels) => {
                    let second = if i == n - 2 {
                        Some(labels[n - 1].to_string())
                    } else {
                        None
                    };
                    InstrKind::RecordOf(labels[i].to_string(), second)
                }
                None => InstrKind::Pair,
            };
            self.emit(out, kind, span);
            self.depth -= 1;
        }
        Ok(())
    }

    fn compile_record(
        &mut self,
        items: &[&TExpr],
        labels: &[&str],
        span: Span,
        out: &mut Vec<Instr>,
    ) -> Result<()> {
        let owned: Vec<TExpr> = items.iter().map(|e| (*e).clone()).collect();
        self.compile_tuple(&owned, Some(labels), span, out)
    }

    /// Tuple projection: component `index` of an `arity`-component
    /// right-leaning spine.
    fn project(&mut self, out: &mut Vec<Instr>, index: usize, arity: usize, label: Option<String>, span: Span) {
        let kind = if arity == 1 {
            // Degenerate single-component spine: the value itself.
            return;
        } else if index == 0 {
            InstrKind::Car(label)
        } else if index == arity - 1 {
            InstrKind::CdDr(index - 1, label)
        } else {
            InstrKind::CdAr(index, label)
        };
        self.emit(out, kind, span);
    }

    /// Destructor/constructor chain for `t.(i) <- v` with the tuple on
    /// top of the stack. The updated component's label, when present,
    /// annotates the accessor that removes the old value.
    fn compile_set_field(
        &mut self,
        out: &mut Vec<Instr>,
        index: usize,
        arity: usize,
        label: Option<&str>,
        value: &TExpr,
        span: Span,
    ) -> Result<()> {
        if index == 0 {
            self.emit(out, InstrKind::Cdr(label.map(sanitize_name)), span);
            self.compile(value, out)?;
            self.emit(out, InstrKind::Pair, span);
            self.depth -= 1;
        } else if arity == 2 {
            // Replacing the trailing component.
            self.emit(out, InstrKind::Car(label.map(sanitize_name)), span);
            self.compile(value, out)?;
            self.emit(out, InstrKind::Swap, span);
            self.emit(out, InstrKind::Pair, span);
            self.depth -= 1;
        } else {
            // Keep the head aside, rebuild the tail spine, re-pair.
            self.emit(out, InstrKind::Dup(1), span);
            self.depth += 1;
            self.emit(out, InstrKind::Car(None), span);
            self.emit(out, InstrKind::Swap, span);
            self.emit(out, InstrKind::Cdr(None), span);
            self.compile_set_field(out, index - 1, arity - 1, label, value, span)?;
            self.emit(out, InstrKind::Swap, span);
            self.emit(out, InstrKind::Pair, span);
            self.depth -= 1;
        }
        Ok(())
    }

    fn compile_const(&mut self, c: &Const, ty: &Type, span: Span, out: &mut Vec<Instr>) -> Result<()> {
        let kind = match (c, ty) {
            (Const::Unit, _) => InstrKind::Unit,
            (Const::List(items), Type::List(elt)) if items.is_empty() => {
                InstrKind::Nil(elt.as_ref().clone())
            }
            (Const::None_, Type::Option_(inner)) => InstrKind::None_(inner.as_ref().clone()),
            (Const::Set(items), Type::Set(elt)) if items.is_empty() => {
                InstrKind::EmptySet(elt.as_ref().clone())
            }
            (Const::Map(items), Type::Map(k, v)) if items.is_empty() => {
                InstrKind::EmptyMap(k.as_ref().clone(), v.as_ref().clone())
            }
            (Const::EmptyBigMap, _) => {
                return Err(err_internal!("codegen", "empty bigmap constant survived encoding"))
            }
            (c, ty) => InstrKind::Push(ty.clone(), c.clone()),
        };
        self.emit(out, kind, span);
        self.depth += 1;
        Ok(())
    }

    /// Fresh frame for a first-class lambda body.
    fn lambda_frame(&mut self, param: &str, body: &TExpr) -> Result<Vec<Instr>> {
        let span = body.span;
        let saved_depth = self.depth;
        let saved_vars = std::mem::replace(&mut self.vars, DepthMap::new());
        self.depth = 1;
        self.vars.bind(param, 0);
        let mut code = Vec::new();
        let result = self.compile(body, &mut code);
        self.depth = saved_depth;
        self.vars = saved_vars;
        result?;
        code.push(Instr::new(InstrKind::DipDrop(1, 1), span));
        Ok(code)
    }

    /// Compile a nested contract through its own encode/simplify/
    /// generate pipeline.
    fn compile_nested(&mut self, contract: &Contract) -> Result<ContractCode> {
        let encoded = encode_contract(self.env, contract, self.nc)?;
        let simplified = simplify_program(encoded);
        generate(self.env, &simplified, self.nc)
    }

    /// Control-flow instructions cannot carry the produced value's name
    /// directly; a RENAME after the fact does.
    fn rename_after(&self, out: &mut Vec<Instr>, e: &TExpr, span: Span) {
        if let Some(name) = &e.name {
            let mut rename = Instr::new(InstrKind::Rename, span);
            rename.name = Some(sanitize_name(name));
            out.push(rename);
        }
    }
}

/// Where each named value sits on the stack. Bindings append as they
/// are compiled and references resolve to the newest entry, which is
/// how source-level shadowing reads; a binder takes a checkpoint
/// before binding and truncates back to it when its scope ends,
/// matching the generator's strictly nested recursion. Depths are
/// small integers and rebinding is frequent, so the flat journal wins
/// over hashing here.
struct DepthMap {
    slots: Vec<(String, usize)>,
}

impl DepthMap {
    fn new() -> Self {
        DepthMap { slots: Vec::new() }
    }

    /// Record that `name` now lives at absolute position `pos`.
    fn bind(&mut self, name: &str, pos: usize) {
        self.slots.push((name.to_string(), pos));
    }

    /// Absolute position of the newest binding of `name`.
    fn position(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .rev()
            .find(|(bound, _)| bound.as_str() == name)
            .map(|(_, pos)| *pos)
    }

    /// Checkpoint taken before a binder, restored when its scope ends.
    fn mark(&self) -> usize {
        self.slots.len()
    }

    fn rollback(&mut self, mark: usize) {
        self.slots.truncate(mark);
    }
}

fn tuple_arity(ty: &Type) -> Option<usize> {
    match ty {
        Type::Tuple(items) => Some(items.len()),
        _ => None,
    }
}

fn is_control_form(kind: &InstrKind) -> bool {
    matches!(
        kind,
        InstrKind::If(_, _)
            | InstrKind::IfNone(_, _)
            | InstrKind::IfLeft(_, _)
            | InstrKind::IfCons(_, _)
            | InstrKind::Loop(_)
            | InstrKind::LoopLeft(_)
            | InstrKind::Iter(_)
            | InstrKind::MapI(_)
            | InstrKind::Failwith
            | InstrKind::Rename
    )
}

/// Variable annotations are restricted to `[A-Za-z0-9_]`; the three
/// characters the surface language can produce beyond that have fixed
/// spellings.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '#' => out.push_str("_sharp_"),
            '/' => out.push_str("_slash_"),
            '\'' => out.push_str("_prim_"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}
