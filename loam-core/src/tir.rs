//! Typed intermediate representation.
//!
//! Every node carries its inferred type, source span, an optional debug
//! name (propagated into the generated assembly as a variable
//! annotation), and the `transfer` effect flag. The typechecker builds
//! this tree; encoder and simplifier transform it; the code generator
//! consumes it.

use crate::ast::{NodeId, Span};
use crate::types::{Const, Type};

#[derive(Debug, Clone, PartialEq)]
pub struct TExpr {
    pub id: NodeId,
    pub ty: Type,
    pub kind: TExprKind,
    pub span: Span,
    /// Debug name attached to the value this node produces.
    pub name: Option<String>,
    /// True iff evaluating this node may enqueue an operation.
    pub transfer: bool,
}

impl TExpr {
    pub fn new(id: NodeId, ty: Type, kind: TExprKind, span: Span) -> Self {
        let transfer = kind.is_transfer_root() || kind.subterms().iter().any(|e| e.transfer);
        TExpr {
            id,
            ty,
            kind,
            span,
            name: None,
            transfer,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Whether this term is pure enough to duplicate or delete: no
    /// transfer effect and no failure.
    pub fn is_pure(&self) -> bool {
        if self.transfer {
            return false;
        }
        match &self.kind {
            TExprKind::Failwith(_) => false,
            kind => kind.subterms().iter().all(|e| e.is_pure()),
        }
    }
}

/// A single arm of a variant match.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantCase {
    pub ctor: String,
    /// `None` means the payload is dropped (`_` arm).
    pub var: Option<String>,
    pub body: TExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TExprKind {
    Var(String),
    Const(Const),
    Let {
        name: String,
        /// Number of references to `name` inside `body`.
        uses: usize,
        /// Count-1 + pure RHS; consumed by the simplifier.
        inline: bool,
        value: Box<TExpr>,
        body: Box<TExpr>,
    },
    Seq(Box<TExpr>, Box<TExpr>),
    If {
        cond: Box<TExpr>,
        then_branch: Box<TExpr>,
        else_branch: Box<TExpr>,
    },
    /// A lambda with no free variables.
    Lambda {
        param: String,
        param_ty: Type,
        ret_ty: Type,
        /// Self-reference name for recursive lambdas; encoded away via
        /// the target's LOOP_LEFT before code generation.
        rec_name: Option<String>,
        body: Box<TExpr>,
    },
    /// A lambda plus its captured environment. Eliminated by the
    /// encoder in favor of an `(env, lifted lambda)` pair.
    Closure {
        param: String,
        param_ty: Type,
        ret_ty: Type,
        captured: Vec<(String, Type)>,
        body: Box<TExpr>,
    },
    Apply {
        prim: Prim,
        args: Vec<TExpr>,
    },
    /// Application of a first-class lambda or closure value.
    Call {
        func: Box<TExpr>,
        arg: Box<TExpr>,
    },
    MatchOption {
        arg: Box<TExpr>,
        ifnone: Box<TExpr>,
        some_name: Option<String>,
        ifsome: Box<TExpr>,
    },
    MatchNat {
        arg: Box<TExpr>,
        plus_name: Option<String>,
        ifplus: Box<TExpr>,
        minus_name: Option<String>,
        ifminus: Box<TExpr>,
    },
    MatchList {
        arg: Box<TExpr>,
        head_name: Option<String>,
        tail_name: Option<String>,
        ifcons: Box<TExpr>,
        ifnil: Box<TExpr>,
    },
    MatchVariant {
        arg: Box<TExpr>,
        cases: Vec<VariantCase>,
    },
    Tuple(Vec<TExpr>),
    RecordCons(Vec<(String, TExpr)>),
    Proj {
        /// Component index in the (binarized) tuple.
        index: usize,
        /// Field label when projecting a record, kept as an annotation.
        label: Option<String>,
        tuple: Box<TExpr>,
    },
    SetField {
        index: usize,
        label: Option<String>,
        tuple: Box<TExpr>,
        value: Box<TExpr>,
    },
    /// Variant constructor injection. After encoding only `Left`/`Right`
    /// paths into `or` types remain.
    Construct {
        ctor: String,
        arg: Box<TExpr>,
    },
    /// `Left`/`Right` injection into an `or` type, with an optional
    /// constructor annotation for decompiler recovery.
    Inject {
        left: bool,
        ctor: Option<String>,
        arg: Box<TExpr>,
    },
    Loop {
        name: String,
        body: Box<TExpr>,
        init: Box<TExpr>,
    },
    LoopLeft {
        name: String,
        body: Box<TExpr>,
        init: Box<TExpr>,
        acc: Option<Box<TExpr>>,
    },
    Fold {
        prim: Prim,
        name: String,
        body: Box<TExpr>,
        coll: Box<TExpr>,
        init: Box<TExpr>,
    },
    MapOp {
        prim: Prim,
        name: String,
        body: Box<TExpr>,
        coll: Box<TExpr>,
    },
    MapFold {
        prim: Prim,
        name: String,
        body: Box<TExpr>,
        coll: Box<TExpr>,
        init: Box<TExpr>,
    },
    Transfer {
        contract: Box<TExpr>,
        amount: Box<TExpr>,
        arg: Box<TExpr>,
    },
    Failwith(Box<TExpr>),
    CreateContract {
        delegate: Box<TExpr>,
        amount: Box<TExpr>,
        contract: Box<Contract>,
        storage_init: Box<TExpr>,
    },
    ContractAt {
        addr: Box<TExpr>,
        ty: Type,
    },
    Unpack {
        arg: Box<TExpr>,
        ty: Type,
    },
}

impl TExprKind {
    /// Whether this node itself introduces the transfer effect
    /// (independently of its subterms).
    pub fn is_transfer_root(&self) -> bool {
        match self {
            TExprKind::Transfer { .. } | TExprKind::CreateContract { .. } => true,
            TExprKind::Apply { prim, .. } => matches!(prim, Prim::SetDelegate | Prim::CreateAccount),
            _ => false,
        }
    }

    /// Direct subterms, in evaluation order.
    pub fn subterms(&self) -> Vec<&TExpr> {
        match self {
            TExprKind::Var(_) | TExprKind::Const(_) => vec![],
            TExprKind::Let { value, body, .. } => vec![value, body],
            TExprKind::Seq(a, b) => vec![a, b],
            TExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => vec![cond, then_branch, else_branch],
            TExprKind::Lambda { body, .. } | TExprKind::Closure { body, .. } => vec![body],
            TExprKind::Apply { args, .. } => args.iter().collect(),
            TExprKind::Call { func, arg } => vec![func, arg],
            TExprKind::MatchOption {
                arg, ifnone, ifsome, ..
            } => vec![arg, ifnone, ifsome],
            TExprKind::MatchNat {
                arg, ifplus, ifminus, ..
            } => vec![arg, ifplus, ifminus],
            TExprKind::MatchList {
                arg, ifcons, ifnil, ..
            } => vec![arg, ifcons, ifnil],
            TExprKind::MatchVariant { arg, cases } => {
                let mut subs = vec![arg.as_ref()];
                subs.extend(cases.iter().map(|c| &c.body));
                subs
            }
            TExprKind::Tuple(items) => items.iter().collect(),
            TExprKind::RecordCons(fields) => fields.iter().map(|(_, e)| e).collect(),
            TExprKind::Proj { tuple, .. } => vec![tuple],
            TExprKind::SetField { tuple, value, .. } => vec![tuple, value],
            TExprKind::Construct { arg, .. } | TExprKind::Inject { arg, .. } => vec![arg],
            TExprKind::Loop { body, init, .. } => vec![init, body],
            TExprKind::LoopLeft {
                body, init, acc, ..
            } => {
                let mut subs = vec![init.as_ref()];
                if let Some(acc) = acc {
                    subs.push(acc);
                }
                subs.push(body);
                subs
            }
            TExprKind::Fold {
                body, coll, init, ..
            } => vec![coll, init, body],
            TExprKind::MapOp { body, coll, .. } => vec![coll, body],
            TExprKind::MapFold {
                body, coll, init, ..
            } => vec![coll, init, body],
            TExprKind::Transfer {
                contract,
                amount,
                arg,
            } => vec![contract, amount, arg],
            TExprKind::Failwith(e) => vec![e],
            TExprKind::CreateContract {
                delegate,
                amount,
                storage_init,
                ..
            } => vec![delegate, amount, storage_init],
            TExprKind::ContractAt { addr, .. } => vec![addr],
            TExprKind::Unpack { arg, .. } => vec![arg],
        }
    }
}

/// The typed contract: storage type, global values, entry points, and
/// the optional storage initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub name: String,
    pub storage: Type,
    pub values: Vec<(String, TExpr)>,
    pub entries: Vec<Entry>,
    pub init: Option<Init>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub param_name: String,
    pub param_ty: Type,
    pub storage_name: String,
    /// Typed `(operation list, storage)`.
    pub body: TExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Init {
    pub params: Vec<(String, Type)>,
    pub body: TExpr,
}

/// Primitive operations. Polymorphic collection primitives (`Size`,
/// `Mem`, `Get`, `Update`) are resolved to their monomorphic form by the
/// encoder based on the argument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    // arithmetic
    Add,
    Sub,
    Mul,
    Ediv,
    Neg,
    Abs,
    IsNat,
    IntOf,
    // bitwise / boolean
    Not,
    And,
    Or,
    Xor,
    Lsl,
    Lsr,
    // comparison
    Compare,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    // string / bytes
    Concat,
    Slice,
    Pack,
    // polymorphic collection ops, monomorphized at encode time
    Size,
    Mem,
    Get,
    Update,
    Rev,
    // monomorphic collection ops
    ListSize,
    ListRev,
    SetSize,
    MapSize,
    StringSize,
    BytesSize,
    SetMem,
    SetUpdate,
    MapMem,
    MapGet,
    MapUpdate,
    BigMapMem,
    BigMapGet,
    BigMapUpdate,
    Cons,
    SomeOp,
    // polymorphic iteration prims carried by the dedicated IR nodes,
    // monomorphized by the checker from the collection type
    Fold,
    Map_,
    MapFold_,
    ListFold,
    SetFold,
    MapFoldColl,
    ListMap,
    MapMap,
    ListMapFold,
    MapMapFold,
    // crypto
    Blake2b,
    Sha256,
    Sha512,
    HashKey,
    CheckSignature,
    // chain context
    Balance,
    Now,
    Amount,
    Sender,
    Source,
    SelfOp,
    StepsToQuota,
    AddressOf,
    ImplicitAccount,
    SetDelegate,
    CreateAccount,
    /// Unresolved surface primitive: must not survive encoding.
    Unknown,
}

impl Prim {
    /// Resolve a surface primitive name. `Unknown` is returned for names
    /// the checker should reject.
    pub fn from_surface(name: &str) -> Prim {
        match name {
            "+" => Prim::Add,
            "-" => Prim::Sub,
            "*" => Prim::Mul,
            "/" => Prim::Ediv,
            "~-" => Prim::Neg,
            "abs" => Prim::Abs,
            "is_nat" => Prim::IsNat,
            "int" => Prim::IntOf,
            "not" => Prim::Not,
            "&" | "land" => Prim::And,
            "or" | "lor" => Prim::Or,
            "xor" | "lxor" => Prim::Xor,
            "<<" | "lsl" => Prim::Lsl,
            ">>" | "lsr" => Prim::Lsr,
            "compare" => Prim::Compare,
            "=" => Prim::Eq,
            "<>" => Prim::Neq,
            "<" => Prim::Lt,
            "<=" => Prim::Le,
            ">" => Prim::Gt,
            ">=" => Prim::Ge,
            "@" | "String.concat" | "Bytes.concat" => Prim::Concat,
            "String.slice" | "Bytes.slice" => Prim::Slice,
            "Bytes.pack" => Prim::Pack,
            "Coll.size" | "List.size" | "Set.size" | "Map.size" | "String.size" | "Bytes.size" => {
                Prim::Size
            }
            "Coll.mem" | "Set.mem" | "Map.mem" => Prim::Mem,
            "Coll.find" | "Map.find" => Prim::Get,
            "Coll.update" | "Set.update" | "Map.update" => Prim::Update,
            "Coll.fold" | "List.fold" | "Set.fold" | "Map.fold" => Prim::Fold,
            "Coll.map" | "List.map" | "Map.map" => Prim::Map_,
            "Coll.map_fold" | "List.map_fold" | "Map.map_fold" => Prim::MapFold_,
            "List.rev" => Prim::Rev,
            "::" | "List.cons" => Prim::Cons,
            "Some" => Prim::SomeOp,
            "Crypto.blake2b" => Prim::Blake2b,
            "Crypto.sha256" => Prim::Sha256,
            "Crypto.sha512" => Prim::Sha512,
            "Crypto.hash_key" => Prim::HashKey,
            "Crypto.check" => Prim::CheckSignature,
            "Current.balance" => Prim::Balance,
            "Current.time" => Prim::Now,
            "Current.amount" => Prim::Amount,
            "Current.sender" => Prim::Sender,
            "Current.source" => Prim::Source,
            "Current.self" => Prim::SelfOp,
            "Current.gas" => Prim::StepsToQuota,
            "Contract.address" => Prim::AddressOf,
            "Account.default" => Prim::ImplicitAccount,
            "Contract.set_delegate" => Prim::SetDelegate,
            "Account.create" => Prim::CreateAccount,
            _ => Prim::Unknown,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Prim::Neg
            | Prim::Abs
            | Prim::IsNat
            | Prim::IntOf
            | Prim::Not
            | Prim::Size
            | Prim::Rev
            | Prim::ListSize
            | Prim::ListRev
            | Prim::SetSize
            | Prim::MapSize
            | Prim::StringSize
            | Prim::BytesSize
            | Prim::SomeOp
            | Prim::Pack
            | Prim::Blake2b
            | Prim::Sha256
            | Prim::Sha512
            | Prim::HashKey
            | Prim::AddressOf
            | Prim::ImplicitAccount
            | Prim::SetDelegate => 1,
            Prim::Balance
            | Prim::Now
            | Prim::Amount
            | Prim::Sender
            | Prim::Source
            | Prim::SelfOp
            | Prim::StepsToQuota => 0,
            Prim::Slice => 3,
            Prim::Update | Prim::SetUpdate | Prim::MapUpdate | Prim::BigMapUpdate => 3,
            Prim::CheckSignature => 3,
            Prim::CreateAccount => 4,
            _ => 2,
        }
    }

    /// Whether the primitive reads chain context (forbidden in storage
    /// initializers for `Sender`/`Source`).
    pub fn is_chain_context(&self) -> bool {
        matches!(
            self,
            Prim::Balance
                | Prim::Now
                | Prim::Amount
                | Prim::Sender
                | Prim::Source
                | Prim::SelfOp
                | Prim::StepsToQuota
        )
    }
}

impl std::fmt::Display for Prim {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Rebuild helper: apply `f` to every direct subterm, rebuilding the
/// node only if some child actually changed. `f` returns `None` to
/// signal "unchanged", which lets large untouched subtrees be reused
/// as-is.
pub fn map_subterms<F>(expr: &TExpr, f: &mut F) -> Option<TExpr>
where
    F: FnMut(&TExpr) -> Option<TExpr>,
{
    // Applies f to one boxed child; tracks whether anything changed.
    fn go<F: FnMut(&TExpr) -> Option<TExpr>>(
        child: &TExpr,
        f: &mut F,
        changed: &mut bool,
    ) -> Box<TExpr> {
        match f(child) {
            Some(new) => {
                *changed = true;
                Box::new(new)
            }
            None => Box::new(child.clone()),
        }
    }

    let mut changed = false;
    let kind = match &expr.kind {
        TExprKind::Var(_) | TExprKind::Const(_) => return None,
        TExprKind::Let {
            name,
            uses,
            inline,
            value,
            body,
        } => TExprKind::Let {
            name: name.clone(),
            uses: *uses,
            inline: *inline,
            value: go(value, f, &mut changed),
            body: go(body, f, &mut changed),
        },
        TExprKind::Seq(a, b) => TExprKind::Seq(go(a, f, &mut changed), go(b, f, &mut changed)),
        TExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => TExprKind::If {
            cond: go(cond, f, &mut changed),
            then_branch: go(then_branch, f, &mut changed),
            else_branch: go(else_branch, f, &mut changed),
        },
        TExprKind::Lambda {
            param,
            param_ty,
            ret_ty,
            rec_name,
            body,
        } => TExprKind::Lambda {
            param: param.clone(),
            param_ty: param_ty.clone(),
            ret_ty: ret_ty.clone(),
            rec_name: rec_name.clone(),
            body: go(body, f, &mut changed),
        },
        TExprKind::Closure {
            param,
            param_ty,
            ret_ty,
            captured,
            body,
        } => TExprKind::Closure {
            param: param.clone(),
            param_ty: param_ty.clone(),
            ret_ty: ret_ty.clone(),
            captured: captured.clone(),
            body: go(body, f, &mut changed),
        },
        TExprKind::Apply { prim, args } => TExprKind::Apply {
            prim: *prim,
            args: args
                .iter()
                .map(|a| match f(a) {
                    Some(new) => {
                        changed = true;
                        new
                    }
                    None => a.clone(),
                })
                .collect(),
        },
        TExprKind::Call { func, arg } => TExprKind::Call {
            func: go(func, f, &mut changed),
            arg: go(arg, f, &mut changed),
        },
        TExprKind::MatchOption {
            arg,
            ifnone,
            some_name,
            ifsome,
        } => TExprKind::MatchOption {
            arg: go(arg, f, &mut changed),
            ifnone: go(ifnone, f, &mut changed),
            some_name: some_name.clone(),
            ifsome: go(ifsome, f, &mut changed),
        },
        TExprKind::MatchNat {
            arg,
            plus_name,
            ifplus,
            minus_name,
            ifminus,
        } => TExprKind::MatchNat {
            arg: go(arg, f, &mut changed),
            plus_name: plus_name.clone(),
            ifplus: go(ifplus, f, &mut changed),
            minus_name: minus_name.clone(),
            ifminus: go(ifminus, f, &mut changed),
        },
        TExprKind::MatchList {
            arg,
            head_name,
            tail_name,
            ifcons,
            ifnil,
        } => TExprKind::MatchList {
            arg: go(arg, f, &mut changed),
            head_name: head_name.clone(),
            tail_name: tail_name.clone(),
            ifcons: go(ifcons, f, &mut changed),
            ifnil: go(ifnil, f, &mut changed),
        },
        TExprKind::MatchVariant { arg, cases } => TExprKind::MatchVariant {
            arg: go(arg, f, &mut changed),
            cases: cases
                .iter()
                .map(|c| VariantCase {
                    ctor: c.ctor.clone(),
                    var: c.var.clone(),
                    body: match f(&c.body) {
                        Some(new) => {
                            changed = true;
                            new
                        }
                        None => c.body.clone(),
                    },
                })
                .collect(),
        },
        TExprKind::Tuple(items) => TExprKind::Tuple(
            items
                .iter()
                .map(|e| match f(e) {
                    Some(new) => {
                        changed = true;
                        new
                    }
                    None => e.clone(),
                })
                .collect(),
        ),
        TExprKind::RecordCons(fields) => TExprKind::RecordCons(
            fields
                .iter()
                .map(|(l, e)| {
                    (
                        l.clone(),
                        match f(e) {
                            Some(new) => {
                                changed = true;
                                new
                            }
                            None => e.clone(),
                        },
                    )
                })
                .collect(),
        ),
        TExprKind::Proj { index, label, tuple } => TExprKind::Proj {
            index: *index,
            label: label.clone(),
            tuple: go(tuple, f, &mut changed),
        },
        TExprKind::SetField {
            index,
            label,
            tuple,
            value,
        } => TExprKind::SetField {
            index: *index,
            label: label.clone(),
            tuple: go(tuple, f, &mut changed),
            value: go(value, f, &mut changed),
        },
        TExprKind::Construct { ctor, arg } => TExprKind::Construct {
            ctor: ctor.clone(),
            arg: go(arg, f, &mut changed),
        },
        TExprKind::Inject { left, ctor, arg } => TExprKind::Inject {
            left: *left,
            ctor: ctor.clone(),
            arg: go(arg, f, &mut changed),
        },
        TExprKind::Loop { name, body, init } => TExprKind::Loop {
            name: name.clone(),
            body: go(body, f, &mut changed),
            init: go(init, f, &mut changed),
        },
        TExprKind::LoopLeft {
            name,
            body,
            init,
            acc,
        } => TExprKind::LoopLeft {
            name: name.clone(),
            body: go(body, f, &mut changed),
            init: go(init, f, &mut changed),
            acc: acc.as_ref().map(|a| go(a, f, &mut changed)),
        },
        TExprKind::Fold {
            prim,
            name,
            body,
            coll,
            init,
        } => TExprKind::Fold {
            prim: *prim,
            name: name.clone(),
            body: go(body, f, &mut changed),
            coll: go(coll, f, &mut changed),
            init: go(init, f, &mut changed),
        },
        TExprKind::MapOp {
            prim,
            name,
            body,
            coll,
        } => TExprKind::MapOp {
            prim: *prim,
            name: name.clone(),
            body: go(body, f, &mut changed),
            coll: go(coll, f, &mut changed),
        },
        TExprKind::MapFold {
            prim,
            name,
            body,
            coll,
            init,
        } => TExprKind::MapFold {
            prim: *prim,
            name: name.clone(),
            body: go(body, f, &mut changed),
            coll: go(coll, f, &mut changed),
            init: go(init, f, &mut changed),
        },
        TExprKind::Transfer {
            contract,
            amount,
            arg,
        } => TExprKind::Transfer {
            contract: go(contract, f, &mut changed),
            amount: go(amount, f, &mut changed),
            arg: go(arg, f, &mut changed),
        },
        TExprKind::Failwith(e) => TExprKind::Failwith(go(e, f, &mut changed)),
        TExprKind::CreateContract {
            delegate,
            amount,
            contract,
            storage_init,
        } => TExprKind::CreateContract {
            delegate: go(delegate, f, &mut changed),
            amount: go(amount, f, &mut changed),
            contract: contract.clone(),
            storage_init: go(storage_init, f, &mut changed),
        },
        TExprKind::ContractAt { addr, ty } => TExprKind::ContractAt {
            addr: go(addr, f, &mut changed),
            ty: ty.clone(),
        },
        TExprKind::Unpack { arg, ty } => TExprKind::Unpack {
            arg: go(arg, f, &mut changed),
            ty: ty.clone(),
        },
    };

    if !changed {
        return None;
    }
    Some(TExpr {
        id: expr.id,
        ty: expr.ty.clone(),
        kind,
        span: expr.span,
        name: expr.name.clone(),
        transfer: expr.transfer,
    })
}
