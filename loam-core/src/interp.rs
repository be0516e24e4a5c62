//! Symbolic interpreter for the target assembly.
//!
//! Executes a (decoded) instruction tree on an abstract stack whose
//! cells are named, typed references to surface-language bindings built
//! along the way. Straight-line instructions append `let` bindings;
//! control flow forks the abstract state and rejoins it, requiring the
//! branch stacks to agree in shape (`UnstructuredProgram` otherwise).
//! Loops and iterations are recovered as the corresponding surface
//! constructs by re-running their bodies on fresh loop-variable cells.

use crate::asm::{ContractCode, Instr, InstrKind, Op};
use crate::ast::{ExprKind, Expression, MatchCase, NodeCounter, NodeCounterExt, Span};
use crate::checker::arith_result;
use crate::err_decompile;
use crate::error::Result;
use crate::tir::Prim;
use crate::types::{Const, Type};

/// One abstract stack cell: a reference to a bound (or frame-provided)
/// variable of a known type.
#[derive(Debug, Clone)]
pub struct Cell {
    pub name: String,
    pub ty: Type,
}

/// A binding accumulated during symbolic execution.
#[derive(Debug, Clone)]
struct Binding {
    name: String,
    value: Expression,
}

pub struct Interp<'a> {
    nc: &'a mut NodeCounter,
    counter: usize,
    /// When set, `@` annotations are ignored and every binding gets a
    /// fresh synthetic name (the decompiler's retry mode).
    ignore_annots: bool,
    /// Names already bound on the current path, for annotation-conflict
    /// detection.
    known_names: Vec<String>,
}

/// The result of symbolically executing a sequence on a stack.
struct Run {
    bindings: Vec<Binding>,
    stack: Vec<Cell>,
    /// Set when the sequence ended in FAILWITH; holds the argument.
    failed: Option<Expression>,
}

impl<'a> Interp<'a> {
    pub fn new(nc: &'a mut NodeCounter, ignore_annots: bool) -> Self {
        Interp {
            nc,
            counter: 0,
            ignore_annots,
            known_names: Vec::new(),
        }
    }

    fn mk(&mut self, kind: ExprKind) -> Expression {
        self.nc.mk_node(kind, Span::generated())
    }

    fn var(&mut self, cell: &Cell) -> Expression {
        let kind = ExprKind::Var(cell.name.clone());
        self.mk(kind)
    }

    fn fresh(&mut self, hint: &str) -> String {
        self.counter += 1;
        format!("{}{}", hint, self.counter)
    }

    /// Pick the binding name for a newly produced value.
    fn bind_name(&mut self, annot: Option<&String>) -> Result<String> {
        match annot {
            Some(name) if !self.ignore_annots => {
                if self.known_names.iter().any(|n| n == name) {
                    return Err(err_decompile!(
                        AnnotationConflict,
                        "annotation @{} rebinds an existing name",
                        name
                    ));
                }
                self.known_names.push(name.clone());
                Ok(name.clone())
            }
            _ => {
                let name = self.fresh("_x");
                self.known_names.push(name.clone());
                Ok(name)
            }
        }
    }

    /// Execute a whole code body against the frame cell, producing the
    /// entry body expression together with the recovered parameter and
    /// storage names.
    pub fn run_entry(&mut self, code: &ContractCode) -> Result<(Expression, String, String)> {
        let frame = Cell {
            name: "_frame".to_string(),
            ty: Type::pair(code.parameter.clone(), code.storage.clone()),
        };
        let mut run = Run {
            bindings: Vec::new(),
            stack: vec![frame],
            failed: None,
        };
        self.exec_seq(&code.code, &mut run)?;

        let result = match &run.failed {
            Some(expr) => expr.clone(),
            None => {
                let cell = run.stack.last().ok_or_else(|| {
                    err_decompile!(UnstructuredProgram, "code left an empty stack")
                })?;
                let cell = cell.clone();
                self.var(&cell)
            }
        };

        // The frame projections become the entry's parameter and
        // storage names; their bindings disappear into the frame.
        let mut param_name = None;
        let mut storage_name = None;
        let mut kept = Vec::with_capacity(run.bindings.len());
        for binding in run.bindings {
            match frame_projection(&binding.value) {
                Some(0) if param_name.is_none() => param_name = Some(binding.name),
                Some(1) if storage_name.is_none() => storage_name = Some(binding.name),
                _ => kept.push(binding),
            }
        }
        let param_name = param_name.unwrap_or_else(|| "parameter".to_string());
        let storage_name = storage_name.unwrap_or_else(|| "storage".to_string());

        let mut body = self.wrap_lets(kept, result);
        // Code that uses the argument pair beyond the two standard
        // projections still needs the frame in scope.
        if references(&body, "_frame") {
            let param = self.mk(ExprKind::Var(param_name.clone()));
            let storage = self.mk(ExprKind::Var(storage_name.clone()));
            let pair = self.mk(ExprKind::Tuple(vec![param, storage]));
            body = self.mk(ExprKind::Let {
                name: "_frame".to_string(),
                value: Box::new(pair),
                body: Box::new(body),
            });
        }
        Ok((body, param_name, storage_name))
    }

    fn wrap_lets(&mut self, mut bindings: Vec<Binding>, result: Expression) -> Expression {
        let mut body = result;
        // `let x = E in x` with no other use of x reduces to E; this
        // keeps reconstructed control shapes (like the entry dispatch)
        // at the top level instead of behind a trivial binding.
        loop {
            let name = match &body.kind {
                ExprKind::Var(name) => name.clone(),
                _ => break,
            };
            let is_last = bindings.last().map(|b| b.name == name).unwrap_or(false);
            let used_elsewhere = bindings
                .iter()
                .take(bindings.len().saturating_sub(1))
                .any(|b| references(&b.value, &name));
            if is_last && !used_elsewhere {
                body = bindings.pop().expect("checked non-empty").value;
            } else {
                break;
            }
        }
        for binding in bindings.into_iter().rev() {
            // A binding that the rest of the body never mentions is
            // noise from stack shuffling; drop it here rather than in
            // the surface simplifier.
            if !references(&body, &binding.name) {
                continue;
            }
            body = self.mk(ExprKind::Let {
                name: binding.name,
                value: Box::new(binding.value),
                body: Box::new(body),
            });
        }
        body
    }

    // =========================================================================
    // Sequence execution
    // =========================================================================

    fn exec_seq(&mut self, instrs: &[Instr], run: &mut Run) -> Result<()> {
        let mut i = 0;
        while i < instrs.len() {
            if run.failed.is_some() {
                return Err(err_decompile!(
                    UnstructuredProgram,
                    "instruction after a failing tail"
                ));
            }
            // match%nat fingerprint: DUP; ABS; SWAP; GE; IF.
            if let Some(consumed) = self.try_match_nat(&instrs[i..], run)? {
                i += consumed;
                continue;
            }
            self.exec(&instrs[i], run)?;
            i += 1;
        }
        Ok(())
    }

    fn pop(&mut self, run: &mut Run) -> Result<Cell> {
        run.stack.pop().ok_or_else(|| {
            err_decompile!(UnboundStackPosition, "pop from an empty stack")
        })
    }

    fn push_value(
        &mut self,
        run: &mut Run,
        value: Expression,
        ty: Type,
        annot: Option<&String>,
    ) -> Result<Cell> {
        let name = self.bind_name(annot)?;
        run.bindings.push(Binding {
            name: name.clone(),
            value,
        });
        let cell = Cell { name, ty };
        run.stack.push(cell.clone());
        Ok(cell)
    }

    fn apply(
        &mut self,
        run: &mut Run,
        prim: &str,
        args: Vec<Expression>,
        ty: Type,
        annot: Option<&String>,
    ) -> Result<()> {
        let expr = self.mk(ExprKind::Apply {
            prim: prim.to_string(),
            args,
        });
        self.push_value(run, expr, ty, annot)?;
        Ok(())
    }

    fn exec(&mut self, instr: &Instr, run: &mut Run) -> Result<()> {
        let annot = instr.name.as_ref();
        match &instr.kind {
            InstrKind::Dup(n) => {
                let len = run.stack.len();
                if *n == 0 || *n > len {
                    return Err(err_decompile!(
                        UnboundStackPosition,
                        "DUP {} on a stack of {}",
                        n,
                        len
                    ));
                }
                let cell = run.stack[len - n].clone();
                run.stack.push(cell);
            }
            InstrKind::Swap => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                run.stack.push(a);
                run.stack.push(b);
            }
            InstrKind::Dip(n, body) => {
                let len = run.stack.len();
                if *n > len {
                    return Err(err_decompile!(UnboundStackPosition, "DIP {} on a stack of {}", n, len));
                }
                let protected: Vec<Cell> = run.stack.split_off(len - n);
                self.exec_seq(body, run)?;
                if run.failed.is_some() {
                    return Err(err_decompile!(UnstructuredProgram, "DIP body fails"));
                }
                run.stack.extend(protected);
            }
            InstrKind::DipDrop(n, k) => {
                let len = run.stack.len();
                if n + k > len {
                    return Err(err_decompile!(
                        UnboundStackPosition,
                        "DIP_DROP({},{}) on a stack of {}",
                        n,
                        k,
                        len
                    ));
                }
                let protected: Vec<Cell> = run.stack.split_off(len - n);
                run.stack.truncate(run.stack.len() - k);
                run.stack.extend(protected);
            }
            InstrKind::Drop => {
                self.pop(run)?;
            }

            InstrKind::Pair => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let items = vec![self.var(&a), self.var(&b)];
                let expr = self.mk(ExprKind::Tuple(items));
                let ty = Type::pair(a.ty, b.ty);
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::RecordOf(_, _) => {
                // Field labels are cosmetic on the wire; the decompiled
                // surface sees a plain pair.
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let items = vec![self.var(&a), self.var(&b)];
                let expr = self.mk(ExprKind::Tuple(items));
                let ty = Type::pair(a.ty, b.ty);
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::Unpair(car, cdr) => {
                let cell = self.pop(run)?;
                let (car_ty, cdr_ty) = match &cell.ty {
                    Type::Tuple(items) if items.len() == 2 => (items[0].clone(), items[1].clone()),
                    other => {
                        return Err(err_decompile!(UnstructuredProgram, "UNPAIR on {}", other))
                    }
                };
                // The cdr lands under the car.
                let tuple = self.var(&cell);
                let cdr_expr = self.mk(ExprKind::Proj {
                    tuple: Box::new(tuple),
                    index: 1,
                });
                self.push_value(run, cdr_expr, cdr_ty, cdr.as_ref())?;
                let tuple = self.var(&cell);
                let car_expr = self.mk(ExprKind::Proj {
                    tuple: Box::new(tuple),
                    index: 0,
                });
                self.push_value(run, car_expr, car_ty, car.as_ref())?;
            }
            InstrKind::Car(_) => self.project(run, 0, annot)?,
            InstrKind::Cdr(_) => self.project(run, 1, annot)?,
            InstrKind::CdAr(n, _) => {
                for _ in 0..*n {
                    self.project(run, 1, None)?;
                }
                self.project(run, 0, annot)?;
            }
            InstrKind::CdDr(n, _) => {
                for _ in 0..*n {
                    self.project(run, 1, None)?;
                }
                self.project(run, 1, annot)?;
            }

            InstrKind::Left(right_ty, _) => {
                let v = self.pop(run)?;
                let or_ty = Type::or(v.ty.clone(), right_ty.clone());
                let arg = self.var(&v);
                let expr = self.mk(ExprKind::Construct {
                    ctor: "Left".to_string(),
                    arg: Box::new(arg),
                    ascribed: Some(or_ty.clone()),
                });
                self.push_value(run, expr, or_ty, annot)?;
            }
            InstrKind::Right(left_ty, _) => {
                let v = self.pop(run)?;
                let or_ty = Type::or(left_ty.clone(), v.ty.clone());
                let arg = self.var(&v);
                let expr = self.mk(ExprKind::Construct {
                    ctor: "Right".to_string(),
                    arg: Box::new(arg),
                    ascribed: Some(or_ty.clone()),
                });
                self.push_value(run, expr, or_ty, annot)?;
            }

            InstrKind::Push(ty, c) => {
                let expr = self.mk(ExprKind::Const {
                    value: c.clone(),
                    ascribed: Some(ty.clone()),
                });
                self.push_value(run, expr, ty.clone(), annot)?;
            }
            InstrKind::Unit => {
                let expr = self.mk(ExprKind::Const {
                    value: Const::Unit,
                    ascribed: None,
                });
                self.push_value(run, expr, Type::Unit, annot)?;
            }
            InstrKind::Nil(elt) => {
                let ty = Type::list(elt.clone());
                let expr = self.mk(ExprKind::Const {
                    value: Const::List(vec![]),
                    ascribed: Some(ty.clone()),
                });
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::None_(inner) => {
                let ty = Type::option(inner.clone());
                let expr = self.mk(ExprKind::Const {
                    value: Const::None_,
                    ascribed: Some(ty.clone()),
                });
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::EmptySet(elt) => {
                let ty = Type::Set(Box::new(elt.clone()));
                let expr = self.mk(ExprKind::Const {
                    value: Const::Set(vec![]),
                    ascribed: Some(ty.clone()),
                });
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::EmptyMap(k, v) => {
                let ty = Type::Map(Box::new(k.clone()), Box::new(v.clone()));
                let expr = self.mk(ExprKind::Const {
                    value: Const::Map(vec![]),
                    ascribed: Some(ty.clone()),
                });
                self.push_value(run, expr, ty, annot)?;
            }

            InstrKind::If(a, b) => {
                let cond = self.pop(run)?;
                let cond_expr = self.var(&cond);
                self.fork(run, annot, &[], &[], a, b, |interp, cond_pair| {
                    let (then_branch, else_branch) = cond_pair;
                    interp.mk(ExprKind::If {
                        cond: Box::new(cond_expr),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    })
                })?;
            }
            InstrKind::IfNone(a, b) => {
                let opt = self.pop(run)?;
                let inner = match &opt.ty {
                    Type::Option_(inner) => inner.as_ref().clone(),
                    other => {
                        return Err(err_decompile!(UnstructuredProgram, "IF_NONE on {}", other))
                    }
                };
                let arg = self.var(&opt);
                let payload = self.fresh("_s");
                let payload_cell = Cell {
                    name: payload.clone(),
                    ty: inner,
                };
                self.fork(run, annot, &[], &[payload_cell], a, b, |interp, (ifnone, ifsome)| {
                    interp.mk(ExprKind::MatchOption {
                        arg: Box::new(arg),
                        ifnone: Box::new(ifnone),
                        some_name: Some(payload),
                        ifsome: Box::new(ifsome),
                    })
                })?;
            }
            InstrKind::IfLeft(a, b) => {
                let or_cell = self.pop(run)?;
                let (l_ty, r_ty) = match &or_cell.ty {
                    Type::Or(l, r) => (l.as_ref().clone(), r.as_ref().clone()),
                    other => {
                        return Err(err_decompile!(UnstructuredProgram, "IF_LEFT on {}", other))
                    }
                };
                let arg = self.var(&or_cell);
                let left_name = self.fresh("_l");
                let right_name = self.fresh("_r");
                let left_cell = Cell {
                    name: left_name.clone(),
                    ty: l_ty,
                };
                let right_cell = Cell {
                    name: right_name.clone(),
                    ty: r_ty,
                };
                self.fork(
                    run,
                    annot,
                    &[left_cell],
                    &[right_cell],
                    a,
                    b,
                    |interp, (left_body, right_body)| {
                        interp.mk(ExprKind::MatchVariant {
                            arg: Box::new(arg),
                            cases: vec![
                                MatchCase {
                                    ctor: "Left".to_string(),
                                    var: Some(left_name),
                                    body: left_body,
                                },
                                MatchCase {
                                    ctor: "Right".to_string(),
                                    var: Some(right_name),
                                    body: right_body,
                                },
                            ],
                        })
                    },
                )?;
            }
            InstrKind::IfCons(a, b) => {
                let list = self.pop(run)?;
                let elt = match &list.ty {
                    Type::List(elt) => elt.as_ref().clone(),
                    other => {
                        return Err(err_decompile!(UnstructuredProgram, "IF_CONS on {}", other))
                    }
                };
                let arg = self.var(&list);
                let head = self.fresh("_hd");
                let tail = self.fresh("_tl");
                // Head is pushed first, the tail above it.
                let cons_cells = vec![
                    Cell {
                        name: head.clone(),
                        ty: elt,
                    },
                    Cell {
                        name: tail.clone(),
                        ty: list.ty.clone(),
                    },
                ];
                self.fork(run, annot, &cons_cells, &[], a, b, |interp, (ifcons, ifnil)| {
                    interp.mk(ExprKind::MatchList {
                        arg: Box::new(arg),
                        head_name: Some(head),
                        tail_name: Some(tail),
                        ifcons: Box::new(ifcons),
                        ifnil: Box::new(ifnil),
                    })
                })?;
            }

            InstrKind::Loop(body) => self.exec_loop(run, body, annot)?,
            InstrKind::LoopLeft(body) => self.exec_loop_left(run, body, annot)?,
            InstrKind::Iter(body) => self.exec_iter(run, body, annot)?,
            InstrKind::MapI(body) => self.exec_map(run, body, annot)?,

            InstrKind::Lambda(arg_ty, ret_ty, body) => {
                let param = self.fresh("_p");
                let param_cell = Cell {
                    name: param.clone(),
                    ty: arg_ty.clone(),
                };
                let mut inner = Run {
                    bindings: Vec::new(),
                    stack: vec![param_cell],
                    failed: None,
                };
                self.exec_seq(body, &mut inner)?;
                let result = match inner.failed.take() {
                    Some(expr) => expr,
                    None => {
                        let cell = inner
                            .stack
                            .last()
                            .ok_or_else(|| {
                                err_decompile!(UnstructuredProgram, "lambda body left an empty stack")
                            })?
                            .clone();
                        self.var(&cell)
                    }
                };
                let lambda_body = self.wrap_lets(inner.bindings, result);
                let expr = self.mk(ExprKind::Lambda {
                    param,
                    param_ty: arg_ty.clone(),
                    ret_ty: Some(ret_ty.clone()),
                    rec_name: None,
                    body: Box::new(lambda_body),
                });
                self.push_value(run, expr, Type::lambda(arg_ty.clone(), ret_ty.clone()), annot)?;
            }
            InstrKind::Exec => {
                let arg = self.pop(run)?;
                let lam = self.pop(run)?;
                let ret_ty = match &lam.ty {
                    Type::Lambda(_, ret) => ret.as_ref().clone(),
                    other => return Err(err_decompile!(UnstructuredProgram, "EXEC on {}", other)),
                };
                let func = self.var(&lam);
                let arg = self.var(&arg);
                let expr = self.mk(ExprKind::Call {
                    func: Box::new(func),
                    arg: Box::new(arg),
                });
                self.push_value(run, expr, ret_ty, annot)?;
            }
            InstrKind::Rename => {
                let cell = self.pop(run)?;
                let value = self.var(&cell);
                self.push_value(run, value, cell.ty, annot)?;
            }
            InstrKind::Failwith => {
                let arg = self.pop(run)?;
                let arg = self.var(&arg);
                let expr = self.mk(ExprKind::Failwith(Box::new(arg)));
                run.failed = Some(expr);
            }

            InstrKind::Op(op) => self.exec_op(run, *op, annot)?,

            InstrKind::Contract(ty) => {
                let addr = self.pop(run)?;
                let addr = self.var(&addr);
                let expr = self.mk(ExprKind::ContractAt {
                    addr: Box::new(addr),
                    ty: ty.clone(),
                });
                let ty = Type::option(Type::Contract(Box::new(ty.clone())));
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::Unpack(ty) => {
                let arg = self.pop(run)?;
                let arg = self.var(&arg);
                let expr = self.mk(ExprKind::Unpack {
                    arg: Box::new(arg),
                    ty: ty.clone(),
                });
                let ty = Type::option(ty.clone());
                self.push_value(run, expr, ty, annot)?;
            }
            InstrKind::CreateContract(code) => {
                let delegate = self.pop(run)?;
                let amount = self.pop(run)?;
                let storage_init = self.pop(run)?;
                let contract = crate::decompile::decompile_code(self.nc, code, self.ignore_annots)?;
                let delegate = self.var(&delegate);
                let amount = self.var(&amount);
                let storage_init = self.var(&storage_init);
                let expr = self.mk(ExprKind::CreateContract {
                    delegate: Box::new(delegate),
                    amount: Box::new(amount),
                    contract: Box::new(contract),
                    storage_init: Box::new(storage_init),
                });
                let pair_ty = Type::pair(Type::Operation, Type::Address);
                let pair_cell = self.push_value(run, expr, pair_ty, None)?;
                // The machine leaves address below, operation on top.
                run.stack.pop();
                let pair_var = self.var(&pair_cell);
                let addr = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                self.push_value(run, addr, Type::Address, None)?;
                let pair_var = self.var(&pair_cell);
                let op = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                self.push_value(run, op, Type::Operation, annot)?;
            }
        }
        Ok(())
    }

    fn project(&mut self, run: &mut Run, index: usize, annot: Option<&String>) -> Result<()> {
        let cell = self.pop(run)?;
        let ty = match &cell.ty {
            Type::Tuple(items) if items.len() == 2 => items[index].clone(),
            other => {
                return Err(err_decompile!(UnstructuredProgram, "projection from {}", other))
            }
        };
        let tuple = self.var(&cell);
        let expr = self.mk(ExprKind::Proj {
            tuple: Box::new(tuple),
            index,
        });
        self.push_value(run, expr, ty, annot)?;
        Ok(())
    }

    fn exec_op(&mut self, run: &mut Run, op: Op, annot: Option<&String>) -> Result<()> {
        // Zero-operand chain context reads.
        let zero: Option<(&str, Type)> = match op {
            Op::Balance => Some(("Current.balance", Type::Tez)),
            Op::Now => Some(("Current.time", Type::Timestamp)),
            Op::Amount => Some(("Current.amount", Type::Tez)),
            Op::Sender => Some(("Current.sender", Type::Address)),
            Op::Source => Some(("Current.source", Type::Address)),
            Op::StepsToQuota => Some(("Current.gas", Type::Nat)),
            Op::Self_ => None,
            _ => None,
        };
        if let Some((prim, ty)) = zero {
            return self.apply(run, prim, vec![], ty, annot);
        }

        match op {
            Op::Self_ => {
                // The parameter type is not tracked through SELF here;
                // re-typechecking pins it down.
                let expr = self.mk(ExprKind::Apply {
                    prim: "Current.self".to_string(),
                    args: vec![],
                });
                self.push_value(run, expr, Type::Contract(Box::new(Type::Unit)), annot)?;
                Ok(())
            }
            Op::Add | Op::Sub | Op::Mul | Op::Ediv => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let prim = match op {
                    Op::Add => Prim::Add,
                    Op::Sub => Prim::Sub,
                    Op::Mul => Prim::Mul,
                    _ => Prim::Ediv,
                };
                let ty = arith_result(prim, &a.ty, &b.ty).ok_or_else(|| {
                    err_decompile!(UnstructuredProgram, "{:?} on {} and {}", op, a.ty, b.ty)
                })?;
                let surface = match op {
                    Op::Add => "+",
                    Op::Sub => "-",
                    Op::Mul => "*",
                    _ => "/",
                };
                let args = vec![self.var(&a), self.var(&b)];
                self.apply(run, surface, args, ty, annot)
            }
            Op::Neg => self.unop(run, "~-", Type::Int, annot),
            Op::Abs => self.unop(run, "abs", Type::Nat, annot),
            Op::IsNat => self.unop(run, "is_nat", Type::option(Type::Nat), annot),
            Op::Int => self.unop(run, "int", Type::Int, annot),
            Op::Not => self.unop(run, "not", Type::Bool, annot),
            Op::And | Op::Or | Op::Xor => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let ty = a.ty.clone();
                let surface = match op {
                    Op::And => "&",
                    Op::Or => "or",
                    _ => "xor",
                };
                let args = vec![self.var(&a), self.var(&b)];
                self.apply(run, surface, args, ty, annot)
            }
            Op::Lsl | Op::Lsr => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let surface = if op == Op::Lsl { "<<" } else { ">>" };
                let args = vec![self.var(&a), self.var(&b)];
                self.apply(run, surface, args, Type::Nat, annot)
            }
            Op::Compare => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let args = vec![self.var(&a), self.var(&b)];
                self.apply(run, "compare", args, Type::Int, annot)
            }
            Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let surface = match op {
                    Op::Eq => "=",
                    Op::Neq => "<>",
                    Op::Lt => "<",
                    Op::Le => "<=",
                    Op::Gt => ">",
                    _ => ">=",
                };
                let cell = self.pop(run)?;
                // Fuse COMPARE; <cmp> back into a single comparison.
                if let Some(binding) = run
                    .bindings
                    .iter_mut()
                    .rev()
                    .find(|b| b.name == cell.name)
                {
                    if let ExprKind::Apply { prim, .. } = &mut binding.value.kind {
                        if prim == "compare" {
                            *prim = surface.to_string();
                            let reused = Cell {
                                name: cell.name,
                                ty: Type::Bool,
                            };
                            run.stack.push(reused);
                            return Ok(());
                        }
                    }
                }
                let zero = self.mk(ExprKind::Const {
                    value: Const::Int(0),
                    ascribed: None,
                });
                let lhs = self.var(&cell);
                let expr = self.mk(ExprKind::Apply {
                    prim: surface.to_string(),
                    args: vec![lhs, zero],
                });
                self.push_value(run, expr, Type::Bool, annot)?;
                Ok(())
            }
            Op::Concat => {
                let a = self.pop(run)?;
                let b = self.pop(run)?;
                let ty = a.ty.clone();
                let args = vec![self.var(&a), self.var(&b)];
                self.apply(run, "@", args, ty, annot)
            }
            Op::Slice => {
                let off = self.pop(run)?;
                let len = self.pop(run)?;
                let s = self.pop(run)?;
                let prim = if s.ty == Type::Bytes { "Bytes.slice" } else { "String.slice" };
                let ty = Type::option(s.ty.clone());
                let args = vec![self.var(&off), self.var(&len), self.var(&s)];
                self.apply(run, prim, args, ty, annot)
            }
            Op::Size => {
                let c = self.pop(run)?;
                let prim = match &c.ty {
                    Type::List(_) => "List.size",
                    Type::Set(_) => "Set.size",
                    Type::Map(_, _) => "Map.size",
                    Type::Bytes => "Bytes.size",
                    _ => "String.size",
                };
                let args = vec![self.var(&c)];
                self.apply(run, prim, args, Type::Nat, annot)
            }
            Op::Mem => {
                let k = self.pop(run)?;
                let c = self.pop(run)?;
                let prim = match &c.ty {
                    Type::Set(_) => "Set.mem",
                    _ => "Map.mem",
                };
                let args = vec![self.var(&k), self.var(&c)];
                self.apply(run, prim, args, Type::Bool, annot)
            }
            Op::Get => {
                let k = self.pop(run)?;
                let c = self.pop(run)?;
                let val_ty = match &c.ty {
                    Type::Map(_, v) | Type::BigMap(_, v) => v.as_ref().clone(),
                    other => {
                        return Err(err_decompile!(UnstructuredProgram, "GET on {}", other))
                    }
                };
                let args = vec![self.var(&k), self.var(&c)];
                self.apply(run, "Map.find", args, Type::option(val_ty), annot)
            }
            Op::Update => {
                let k = self.pop(run)?;
                let v = self.pop(run)?;
                let c = self.pop(run)?;
                let prim = match &c.ty {
                    Type::Set(_) => "Set.update",
                    _ => "Map.update",
                };
                let ty = c.ty.clone();
                let args = vec![self.var(&k), self.var(&v), self.var(&c)];
                self.apply(run, prim, args, ty, annot)
            }
            Op::Some_ => {
                let v = self.pop(run)?;
                let ty = Type::option(v.ty.clone());
                let args = vec![self.var(&v)];
                self.apply(run, "Some", args, ty, annot)
            }
            Op::Cons => {
                let head = self.pop(run)?;
                let tail = self.pop(run)?;
                let ty = tail.ty.clone();
                let args = vec![self.var(&head), self.var(&tail)];
                self.apply(run, "::", args, ty, annot)
            }
            Op::Pack => {
                let v = self.pop(run)?;
                let args = vec![self.var(&v)];
                self.apply(run, "Bytes.pack", args, Type::Bytes, annot)
            }
            Op::Blake2b => self.unop(run, "Crypto.blake2b", Type::Bytes, annot),
            Op::Sha256 => self.unop(run, "Crypto.sha256", Type::Bytes, annot),
            Op::Sha512 => self.unop(run, "Crypto.sha512", Type::Bytes, annot),
            Op::HashKey => self.unop(run, "Crypto.hash_key", Type::KeyHash, annot),
            Op::CheckSignature => {
                let key = self.pop(run)?;
                let sig = self.pop(run)?;
                let bytes = self.pop(run)?;
                let args = vec![self.var(&key), self.var(&sig), self.var(&bytes)];
                self.apply(run, "Crypto.check", args, Type::Bool, annot)
            }
            Op::TransferTokens => {
                let arg = self.pop(run)?;
                let amount = self.pop(run)?;
                let contract = self.pop(run)?;
                let contract = self.var(&contract);
                let amount = self.var(&amount);
                let arg = self.var(&arg);
                let expr = self.mk(ExprKind::Transfer {
                    contract: Box::new(contract),
                    amount: Box::new(amount),
                    arg: Box::new(arg),
                });
                self.push_value(run, expr, Type::Operation, annot)?;
                Ok(())
            }
            Op::Address => {
                let c = self.pop(run)?;
                let args = vec![self.var(&c)];
                self.apply(run, "Contract.address", args, Type::Address, annot)
            }
            Op::ImplicitAccount => {
                let kh = self.pop(run)?;
                let args = vec![self.var(&kh)];
                self.apply(
                    run,
                    "Account.default",
                    args,
                    Type::Contract(Box::new(Type::Unit)),
                    annot,
                )
            }
            Op::SetDelegate => {
                let d = self.pop(run)?;
                let args = vec![self.var(&d)];
                self.apply(run, "Contract.set_delegate", args, Type::Operation, annot)
            }
            Op::CreateAccount => {
                let manager = self.pop(run)?;
                let delegate = self.pop(run)?;
                let spendable = self.pop(run)?;
                let amount = self.pop(run)?;
                let args = vec![
                    self.var(&manager),
                    self.var(&delegate),
                    self.var(&spendable),
                    self.var(&amount),
                ];
                let pair_ty = Type::pair(Type::Operation, Type::Address);
                let expr = self.mk(ExprKind::Apply {
                    prim: "Account.create".to_string(),
                    args,
                });
                let pair_cell = self.push_value(run, expr, pair_ty, None)?;
                run.stack.pop();
                let pair_var = self.var(&pair_cell);
                let addr = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                self.push_value(run, addr, Type::Address, None)?;
                let pair_var = self.var(&pair_cell);
                let op = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                self.push_value(run, op, Type::Operation, annot)?;
                Ok(())
            }
            Op::Balance
            | Op::Now
            | Op::Amount
            | Op::Sender
            | Op::Source
            | Op::StepsToQuota
            | Op::Self_ => unreachable!("handled above"),
        }
    }

    fn unop(&mut self, run: &mut Run, prim: &str, ty: Type, annot: Option<&String>) -> Result<()> {
        let v = self.pop(run)?;
        let args = vec![self.var(&v)];
        self.apply(run, prim, args, ty, annot)
    }

    // =========================================================================
    // Branch fork / rejoin
    // =========================================================================

    /// Execute both arms of a two-way branch and rejoin. `a_cells` /
    /// `b_cells` are the values the machine pushes at each arm's entry
    /// (deepest first). `build` assembles the surface construct from
    /// the two arm bodies.
    fn fork<F>(
        &mut self,
        run: &mut Run,
        annot: Option<&String>,
        a_cells: &[Cell],
        b_cells: &[Cell],
        a: &[Instr],
        b: &[Instr],
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self, (Expression, Expression)) -> Expression,
    {
        let base = run.stack.clone();
        let run_a = self.run_branch(&base, a_cells, a)?;
        let run_b = self.run_branch(&base, b_cells, b)?;
        let both_failed = run_a.failed.is_some() && run_b.failed.is_some();

        // Positions where the two arms disagree become the match
        // result; inherited cells pass through untouched.
        let (merged_stack, changed, a_result, b_result) = self.merge(&base, run_a, run_b)?;
        let (a_body, b_body) = (a_result, b_result);
        let expr = build(self, (a_body, b_body));

        if both_failed {
            run.stack = merged_stack;
            run.failed = Some(expr);
            return Ok(());
        }

        match changed.as_slice() {
            [] => {
                // Pure-effect branch: the value is kept as a binding so
                // effects are not lost; the stack stays as inherited.
                run.stack = merged_stack;
                let name = self.bind_name(annot)?;
                run.bindings.push(Binding { name, value: expr });
            }
            [(pos, ty)] => {
                run.stack = merged_stack;
                let name = self.bind_name(annot)?;
                run.bindings.push(Binding {
                    name: name.clone(),
                    value: expr,
                });
                run.stack.insert(
                    *pos,
                    Cell {
                        name,
                        ty: ty.clone(),
                    },
                );
            }
            many => {
                run.stack = merged_stack;
                let tuple_name = self.bind_name(annot)?;
                run.bindings.push(Binding {
                    name: tuple_name.clone(),
                    value: expr,
                });
                // Destructure the merged tuple back onto the stack.
                for (i, (pos, ty)) in many.iter().enumerate() {
                    let cell_name = self.fresh("_m");
                    let tuple_var = self.mk(ExprKind::Var(tuple_name.clone()));
                    let proj = self.spine_proj(tuple_var, i, many.len());
                    self.known_names.push(cell_name.clone());
                    run.bindings.push(Binding {
                        name: cell_name.clone(),
                        value: proj,
                    });
                    run.stack.insert(
                        *pos,
                        Cell {
                            name: cell_name,
                            ty: ty.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Projection of component `i` out of an `n`-component right-nested
    /// pair spine rooted at `root`.
    fn spine_proj(&mut self, root: Expression, i: usize, n: usize) -> Expression {
        let mut expr = root;
        let cdrs = i.min(n - 1);
        for _ in 0..cdrs {
            expr = self.mk(ExprKind::Proj {
                tuple: Box::new(expr),
                index: 1,
            });
        }
        if i < n - 1 {
            expr = self.mk(ExprKind::Proj {
                tuple: Box::new(expr),
                index: 0,
            });
        }
        expr
    }

    fn run_branch(&mut self, base: &[Cell], pushed: &[Cell], instrs: &[Instr]) -> Result<Run> {
        let mut stack = base.to_vec();
        stack.extend(pushed.iter().cloned());
        let mut run = Run {
            bindings: Vec::new(),
            stack,
            failed: None,
        };
        let names_before = self.known_names.len();
        self.exec_seq(instrs, &mut run)?;
        self.known_names.truncate(names_before);
        Ok(run)
    }

    /// Rejoin two branch states over a shared base stack.
    #[allow(clippy::type_complexity)]
    fn merge(
        &mut self,
        base: &[Cell],
        mut a: Run,
        mut b: Run,
    ) -> Result<(Vec<Cell>, Vec<(usize, Type)>, Expression, Expression)> {
        match (a.failed.take(), b.failed.take()) {
            (Some(fa), Some(fb)) => {
                let a_body = self.wrap_lets(a.bindings, fa);
                let b_body = self.wrap_lets(b.bindings, fb);
                return Ok((base.to_vec(), vec![], a_body, b_body));
            }
            (Some(fa), None) => {
                let (stack, changed, b_body) = self.branch_result(base, b)?;
                let a_body = self.wrap_lets(a.bindings, fa);
                return Ok((stack, changed, a_body, b_body));
            }
            (None, Some(fb)) => {
                let (stack, changed, a_body) = self.branch_result(base, a)?;
                let b_body = self.wrap_lets(b.bindings, fb);
                return Ok((stack, changed, a_body, b_body));
            }
            (None, None) => {}
        }

        if a.stack.len() != b.stack.len() {
            return Err(err_decompile!(
                UnstructuredProgram,
                "branches rejoin with stacks of {} and {}",
                a.stack.len(),
                b.stack.len()
            ));
        }
        let mut changed = Vec::new();
        let mut merged = Vec::with_capacity(a.stack.len());
        let mut a_cells = Vec::new();
        let mut b_cells = Vec::new();
        for (i, (ca, cb)) in a.stack.iter().zip(&b.stack).enumerate() {
            if ca.name == cb.name {
                merged.push(ca.clone());
            } else {
                if ca.ty != cb.ty {
                    return Err(err_decompile!(
                        UnstructuredProgram,
                        "branches rejoin with {} against {}",
                        ca.ty,
                        cb.ty
                    ));
                }
                changed.push((i, ca.ty.clone()));
                a_cells.push(ca.clone());
                b_cells.push(cb.clone());
            }
        }
        // Positions recorded bottom-up; the merged stack excludes the
        // changed cells (they are re-inserted by the caller).
        let a_result = self.branch_value(&a_cells);
        let a_body = self.wrap_lets(a.bindings, a_result);
        let b_result = self.branch_value(&b_cells);
        let b_body = self.wrap_lets(b.bindings, b_result);
        Ok((merged, changed, a_body, b_body))
    }

    /// Result stack and value of a single surviving branch.
    fn branch_result(&mut self, base: &[Cell], run: Run) -> Result<(Vec<Cell>, Vec<(usize, Type)>, Expression)> {
        let mut merged = Vec::new();
        let mut changed = Vec::new();
        let mut cells = Vec::new();
        for (i, cell) in run.stack.iter().enumerate() {
            let inherited = base.get(i).map(|c| c.name == cell.name).unwrap_or(false);
            if inherited {
                merged.push(cell.clone());
            } else {
                changed.push((i, cell.ty.clone()));
                cells.push(cell.clone());
            }
        }
        let value = self.branch_value(&cells);
        let body = self.wrap_lets(run.bindings, value);
        Ok((merged, changed, body))
    }

    /// The value a branch produces: unit when nothing changed, the
    /// single changed cell, or the nested-pair tuple of changed cells.
    fn branch_value(&mut self, cells: &[Cell]) -> Expression {
        match cells {
            [] => self.mk(ExprKind::Const {
                value: Const::Unit,
                ascribed: None,
            }),
            [one] => self.var(&one.clone()),
            many => {
                let items: Vec<Expression> = many.to_vec().iter().map(|c| self.var(c)).collect();
                // Right-nested spine to mirror the machine pairing.
                let mut iter = items.into_iter().rev();
                let mut acc = iter.next().expect("non-empty");
                for item in iter {
                    acc = self.mk(ExprKind::Tuple(vec![item, acc]));
                }
                acc
            }
        }
    }

    // =========================================================================
    // Loops and iterations
    // =========================================================================

    /// `PUSH bool True; LOOP(body)` recovers the surface loop; any
    /// other condition guards the loop with an if.
    fn exec_loop(&mut self, run: &mut Run, body: &[Instr], annot: Option<&String>) -> Result<()> {
        let cond = self.pop(run)?;
        let init = self.pop(run)?;
        let state_name = self.fresh("_loop");
        let state_cell = Cell {
            name: state_name.clone(),
            ty: init.ty.clone(),
        };
        let base = run.stack.clone();
        let inner = self.run_branch(&base, &[state_cell], body)?;
        if inner.failed.is_some() {
            return Err(err_decompile!(UnstructuredProgram, "LOOP body always fails"));
        }
        // The body must leave the base untouched plus [pair-parts]: a
        // continue flag on top of the next state.
        if inner.stack.len() != base.len() + 2 {
            return Err(err_decompile!(
                UnstructuredProgram,
                "LOOP body changes the stack shape"
            ));
        }
        for (i, cell) in inner.stack[..base.len()].iter().enumerate() {
            if cell.name != base[i].name {
                return Err(err_decompile!(UnstructuredProgram, "LOOP body touches outer stack"));
            }
        }
        let next_state = inner.stack[base.len()].clone();
        let cont = inner.stack[base.len() + 1].clone();
        let cont_var = self.var(&cont);
        let state_var = self.var(&next_state);
        let pair = self.mk(ExprKind::Tuple(vec![cont_var, state_var]));
        let loop_body = self.wrap_lets(inner.bindings, pair);
        let init_var = self.var(&init);
        let mut expr = self.mk(ExprKind::Loop {
            name: state_name,
            body: Box::new(loop_body),
            init: Box::new(init_var),
        });

        let cond_is_true = {
            let defining = run.bindings.iter().rev().find(|b| b.name == cond.name);
            matches!(
                defining.map(|b| &b.value.kind),
                Some(ExprKind::Const {
                    value: Const::Bool(true),
                    ..
                })
            )
        };
        if !cond_is_true {
            let cond_var = self.var(&cond);
            let else_var = self.var(&init);
            expr = self.mk(ExprKind::If {
                cond: Box::new(cond_var),
                then_branch: Box::new(expr),
                else_branch: Box::new(else_var),
            });
        }
        self.push_value(run, expr, init.ty, annot)?;
        Ok(())
    }

    fn exec_loop_left(&mut self, run: &mut Run, body: &[Instr], annot: Option<&String>) -> Result<()> {
        let or_cell = self.pop(run)?;
        let (state_ty, result_ty) = match &or_cell.ty {
            Type::Or(l, r) => (l.as_ref().clone(), r.as_ref().clone()),
            other => return Err(err_decompile!(UnstructuredProgram, "LOOP_LEFT on {}", other)),
        };
        // The canonical shape injects the initial state right before
        // the loop.
        let init_expr = match run.bindings.iter().rev().find(|b| b.name == or_cell.name) {
            Some(binding) => match &binding.value.kind {
                ExprKind::Construct { ctor, arg, .. } if ctor == "Left" => arg.as_ref().clone(),
                _ => {
                    return Err(err_decompile!(
                        UnstructuredProgram,
                        "LOOP_LEFT input is not a direct Left injection"
                    ))
                }
            },
            None => {
                return Err(err_decompile!(
                    UnstructuredProgram,
                    "LOOP_LEFT input has no visible definition"
                ))
            }
        };

        let state_name = self.fresh("_state");
        let state_cell = Cell {
            name: state_name.clone(),
            ty: state_ty.clone(),
        };
        let base = run.stack.clone();
        let inner = self.run_branch(&base, &[state_cell], body)?;
        if inner.failed.is_some() {
            return Err(err_decompile!(UnstructuredProgram, "LOOP_LEFT body always fails"));
        }
        if inner.stack.len() != base.len() + 1 {
            return Err(err_decompile!(
                UnstructuredProgram,
                "LOOP_LEFT body changes the stack shape"
            ));
        }

        // Cells of the base the body replaced: at most one, the
        // threaded accumulator.
        let mut acc_pos = None;
        for (i, cell) in inner.stack[..base.len()].iter().enumerate() {
            if cell.name != base[i].name {
                if acc_pos.is_some() {
                    return Err(err_decompile!(
                        UnstructuredProgram,
                        "LOOP_LEFT body touches more than one outer cell"
                    ));
                }
                acc_pos = Some(i);
            }
        }

        let or_out = inner.stack[base.len()].clone();
        match acc_pos {
            None => {
                let or_var = self.var(&or_out);
                let loop_body = self.wrap_lets(inner.bindings, or_var);
                let expr = self.mk(ExprKind::LoopLeft {
                    name: state_name,
                    body: Box::new(loop_body),
                    init: Box::new(init_expr),
                    acc: None,
                });
                self.push_value(run, expr, result_ty, annot)?;
            }
            Some(pos) => {
                let acc_cell = base[pos].clone();
                let acc_out = inner.stack[pos].clone();
                // The surface binding is the (state, acc) pair; rebind
                // the two components from it.
                let pair_name = self.fresh("_sa");
                let or_var = self.var(&or_out);
                let acc_var = self.var(&acc_out);
                let result = self.mk(ExprKind::Tuple(vec![or_var, acc_var]));
                let inner_body = self.wrap_lets(inner.bindings, result);
                let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
                let state_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
                let acc_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                let with_acc = self.mk(ExprKind::Let {
                    name: acc_cell.name.clone(),
                    value: Box::new(acc_proj),
                    body: Box::new(inner_body),
                });
                let loop_body = self.mk(ExprKind::Let {
                    name: state_name,
                    value: Box::new(state_proj),
                    body: Box::new(with_acc),
                });
                let acc_init = self.var(&acc_cell);
                let expr = self.mk(ExprKind::LoopLeft {
                    name: pair_name,
                    body: Box::new(loop_body),
                    init: Box::new(init_expr),
                    acc: Some(Box::new(acc_init)),
                });
                // Result is the (result, acc) pair; split it back into
                // the stack cells.
                let out_ty = Type::pair(result_ty.clone(), acc_cell.ty.clone());
                let pair_cell = self.push_value(run, expr, out_ty, annot)?;
                run.stack.pop();
                let pair_var = self.var(&pair_cell);
                let new_acc = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                let new_acc_cell = self.push_value(run, new_acc, acc_cell.ty.clone(), None)?;
                run.stack.pop();
                run.stack[pos] = new_acc_cell;
                let pair_var = self.var(&pair_cell);
                let result_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                self.push_value(run, result_proj, result_ty, None)?;
            }
        }
        Ok(())
    }

    fn exec_iter(&mut self, run: &mut Run, body: &[Instr], annot: Option<&String>) -> Result<()> {
        let coll = self.pop(run)?;
        let elt_ty = element_type(&coll.ty).ok_or_else(|| {
            err_decompile!(UnstructuredProgram, "ITER over {}", coll.ty)
        })?;
        let elt_name = self.fresh("_elt");
        let elt_cell = Cell {
            name: elt_name.clone(),
            ty: elt_ty.clone(),
        };
        let base = run.stack.clone();
        let inner = self.run_branch(&base, &[elt_cell], body)?;
        if inner.failed.is_some() {
            return Err(err_decompile!(UnstructuredProgram, "ITER body always fails"));
        }
        if inner.stack.len() != base.len() {
            return Err(err_decompile!(
                UnstructuredProgram,
                "ITER body changes the stack shape"
            ));
        }
        let mut acc_pos = None;
        for (i, cell) in inner.stack.iter().enumerate() {
            if cell.name != base[i].name {
                if acc_pos.is_some() {
                    return Err(err_decompile!(
                        UnstructuredProgram,
                        "ITER body threads more than one accumulator"
                    ));
                }
                acc_pos = Some(i);
            }
        }
        let pos = acc_pos.ok_or_else(|| {
            err_decompile!(UnstructuredProgram, "ITER body has no accumulator")
        })?;
        let acc_cell = base[pos].clone();
        let acc_out = inner.stack[pos].clone();

        // Surface fold binds the (element, accumulator) pair.
        let pair_name = self.fresh("_ea");
        let acc_result = self.var(&acc_out);
        let inner_body = self.wrap_lets(inner.bindings, acc_result);
        let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
        let elt_proj = self.mk(ExprKind::Proj {
            tuple: Box::new(pair_var),
            index: 0,
        });
        let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
        let acc_proj = self.mk(ExprKind::Proj {
            tuple: Box::new(pair_var),
            index: 1,
        });
        let with_acc = self.mk(ExprKind::Let {
            name: acc_cell.name.clone(),
            value: Box::new(acc_proj),
            body: Box::new(inner_body),
        });
        let fold_body = self.mk(ExprKind::Let {
            name: elt_name,
            value: Box::new(elt_proj),
            body: Box::new(with_acc),
        });
        let coll_var = self.var(&coll);
        let acc_init = self.var(&acc_cell);
        let expr = self.mk(ExprKind::Fold {
            prim: "Coll.fold".to_string(),
            name: pair_name,
            body: Box::new(fold_body),
            coll: Box::new(coll_var),
            init: Box::new(acc_init),
        });
        let ty = acc_cell.ty.clone();
        let new_acc = self.push_value(run, expr, ty, annot)?;
        run.stack.pop();
        run.stack[pos] = new_acc;
        Ok(())
    }

    fn exec_map(&mut self, run: &mut Run, body: &[Instr], annot: Option<&String>) -> Result<()> {
        let coll = self.pop(run)?;
        let elt_ty = element_type(&coll.ty).ok_or_else(|| {
            err_decompile!(UnstructuredProgram, "MAP over {}", coll.ty)
        })?;
        let elt_name = self.fresh("_elt");
        let elt_cell = Cell {
            name: elt_name.clone(),
            ty: elt_ty,
        };
        let base = run.stack.clone();
        let inner = self.run_branch(&base, &[elt_cell], body)?;
        if inner.failed.is_some() {
            return Err(err_decompile!(UnstructuredProgram, "MAP body always fails"));
        }
        if inner.stack.len() != base.len() + 1 {
            return Err(err_decompile!(
                UnstructuredProgram,
                "MAP body changes the stack shape"
            ));
        }
        let mut acc_pos = None;
        for (i, cell) in inner.stack[..base.len()].iter().enumerate() {
            if cell.name != base[i].name {
                if acc_pos.is_some() {
                    return Err(err_decompile!(
                        UnstructuredProgram,
                        "MAP body threads more than one accumulator"
                    ));
                }
                acc_pos = Some(i);
            }
        }
        let mapped = inner.stack[base.len()].clone();
        let out_coll_ty = mapped_collection(&coll.ty, &mapped.ty).ok_or_else(|| {
            err_decompile!(UnstructuredProgram, "MAP over {}", coll.ty)
        })?;

        match acc_pos {
            None => {
                let mapped_var = self.var(&mapped);
                let map_body = self.wrap_lets(inner.bindings, mapped_var);
                let coll_var = self.var(&coll);
                let expr = self.mk(ExprKind::MapOp {
                    prim: "Coll.map".to_string(),
                    name: elt_name,
                    body: Box::new(map_body),
                    coll: Box::new(coll_var),
                });
                self.push_value(run, expr, out_coll_ty, annot)?;
            }
            Some(pos) => {
                let acc_cell = base[pos].clone();
                let acc_out = inner.stack[pos].clone();
                let pair_name = self.fresh("_ea");
                let mapped_var = self.var(&mapped);
                let acc_var = self.var(&acc_out);
                let result = self.mk(ExprKind::Tuple(vec![mapped_var, acc_var]));
                let inner_body = self.wrap_lets(inner.bindings, result);
                let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
                let elt_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                let pair_var = self.mk(ExprKind::Var(pair_name.clone()));
                let acc_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                let with_acc = self.mk(ExprKind::Let {
                    name: acc_cell.name.clone(),
                    value: Box::new(acc_proj),
                    body: Box::new(inner_body),
                });
                let body_expr = self.mk(ExprKind::Let {
                    name: elt_name,
                    value: Box::new(elt_proj),
                    body: Box::new(with_acc),
                });
                let coll_var = self.var(&coll);
                let acc_init = self.var(&acc_cell);
                let expr = self.mk(ExprKind::MapFold {
                    prim: "Coll.map_fold".to_string(),
                    name: pair_name,
                    body: Box::new(body_expr),
                    coll: Box::new(coll_var),
                    init: Box::new(acc_init),
                });
                let out_ty = Type::pair(out_coll_ty.clone(), acc_cell.ty.clone());
                let pair_cell = self.push_value(run, expr, out_ty, annot)?;
                run.stack.pop();
                let pair_var = self.var(&pair_cell);
                let new_acc = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 1,
                });
                let new_acc_cell = self.push_value(run, new_acc, acc_cell.ty.clone(), None)?;
                run.stack.pop();
                run.stack[pos] = new_acc_cell;
                let pair_var = self.var(&pair_cell);
                let mapped_proj = self.mk(ExprKind::Proj {
                    tuple: Box::new(pair_var),
                    index: 0,
                });
                self.push_value(run, mapped_proj, out_coll_ty, None)?;
            }
        }
        Ok(())
    }

    /// Recognize `DUP; ABS; SWAP; GE; IF(plus, minus)` and rebuild a
    /// match%nat. Returns the number of instructions consumed.
    fn try_match_nat(&mut self, instrs: &[Instr], run: &mut Run) -> Result<Option<usize>> {
        let window: Vec<&InstrKind> = instrs.iter().take(5).map(|i| &i.kind).collect();
        let (plus, minus) = match window.as_slice() {
            [InstrKind::Dup(1), InstrKind::Op(Op::Abs), InstrKind::Swap, InstrKind::Op(Op::Ge), InstrKind::If(a, b)] => {
                (a.as_slice(), b.as_slice())
            }
            _ => return Ok(None),
        };
        let int_cell = self.pop(run)?;
        if int_cell.ty != Type::Int {
            run.stack.push(int_cell);
            return Ok(None);
        }
        let annot = instrs[4].name.as_ref().cloned();
        let arg = self.var(&int_cell);
        let plus_name = self.fresh("_n");
        let minus_name = self.fresh("_n");
        let plus_cell = Cell {
            name: plus_name.clone(),
            ty: Type::Nat,
        };
        let minus_cell = Cell {
            name: minus_name.clone(),
            ty: Type::Nat,
        };
        self.fork(
            run,
            annot.as_ref(),
            &[plus_cell],
            &[minus_cell],
            plus,
            minus,
            |interp, (ifplus, ifminus)| {
                interp.mk(ExprKind::MatchNat {
                    arg: Box::new(arg),
                    plus_name: Some(plus_name),
                    ifplus: Box::new(ifplus),
                    minus_name: Some(minus_name),
                    ifminus: Box::new(ifminus),
                })
            },
        )?;
        Ok(Some(5))
    }
}

fn element_type(ty: &Type) -> Option<Type> {
    match ty {
        Type::List(elt) | Type::Set(elt) => Some(elt.as_ref().clone()),
        Type::Map(k, v) => Some(Type::pair(k.as_ref().clone(), v.as_ref().clone())),
        _ => None,
    }
}

fn mapped_collection(coll: &Type, new_elt: &Type) -> Option<Type> {
    match coll {
        Type::List(_) => Some(Type::list(new_elt.clone())),
        Type::Map(k, _) => Some(Type::Map(k.clone(), Box::new(new_elt.clone()))),
        _ => None,
    }
}

/// `Some(index)` when the expression is a projection of the frame cell.
fn frame_projection(e: &Expression) -> Option<usize> {
    match &e.kind {
        ExprKind::Proj { tuple, index } => match &tuple.kind {
            ExprKind::Var(name) if name == "_frame" => Some(*index),
            _ => None,
        },
        _ => None,
    }
}

/// Whether `name` occurs free-ish anywhere in the expression. Shadowing
/// is ignored on purpose: decompiled names are unique per path, and a
/// false positive only keeps a binding alive.
pub fn references(e: &Expression, name: &str) -> bool {
    match &e.kind {
        ExprKind::Var(v) => v == name,
        ExprKind::Const { .. } => false,
        kind => sub_expressions(kind).iter().any(|sub| references(sub, name)),
    }
}

fn sub_expressions(kind: &ExprKind) -> Vec<&Expression> {
    match kind {
        ExprKind::Const { .. } | ExprKind::Var(_) => vec![],
        ExprKind::Tuple(items) => items.iter().collect(),
        ExprKind::RecordLit(fields) => fields.iter().map(|(_, e)| e).collect(),
        ExprKind::Construct { arg, .. } => vec![arg],
        ExprKind::Let { value, body, .. } => vec![value, body],
        ExprKind::Seq(a, b) => vec![a, b],
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => vec![cond, then_branch, else_branch],
        ExprKind::Lambda { body, .. } => vec![body],
        ExprKind::Apply { args, .. } => args.iter().collect(),
        ExprKind::Call { func, arg } => vec![func, arg],
        ExprKind::Proj { tuple, .. } => vec![tuple],
        ExprKind::SetProj { tuple, value, .. } => vec![tuple, value],
        ExprKind::Field { record, .. } => vec![record],
        ExprKind::SetField { record, value, .. } => vec![record, value],
        ExprKind::MatchOption {
            arg, ifnone, ifsome, ..
        } => vec![arg, ifnone, ifsome],
        ExprKind::MatchNat {
            arg, ifplus, ifminus, ..
        } => vec![arg, ifplus, ifminus],
        ExprKind::MatchList {
            arg, ifcons, ifnil, ..
        } => vec![arg, ifcons, ifnil],
        ExprKind::MatchVariant { arg, cases } => {
            let mut out = vec![arg.as_ref()];
            out.extend(cases.iter().map(|c| &c.body));
            out
        }
        ExprKind::Loop { body, init, .. } => vec![body, init],
        ExprKind::LoopLeft {
            body, init, acc, ..
        } => {
            let mut out = vec![body.as_ref(), init.as_ref()];
            if let Some(acc) = acc {
                out.push(acc);
            }
            out
        }
        ExprKind::Fold {
            body, coll, init, ..
        }
        | ExprKind::MapFold {
            body, coll, init, ..
        } => vec![body, coll, init],
        ExprKind::MapOp { body, coll, .. } => vec![body, coll],
        ExprKind::Transfer {
            contract,
            amount,
            arg,
        } => vec![contract, amount, arg],
        ExprKind::Failwith(e) => vec![e],
        ExprKind::CreateContract {
            delegate,
            amount,
            storage_init,
            ..
        } => vec![delegate, amount, storage_init],
        ExprKind::ContractAt { addr, .. } => vec![addr],
        ExprKind::Unpack { arg, .. } => vec![arg],
    }
}
