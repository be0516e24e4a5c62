//! Untyped surface AST.
//!
//! This is the tree handed over by the external parser frontend (as JSON,
//! hence the serde derives). It carries no types beyond user-written
//! annotations; the typechecker turns it into [`crate::tir::TExpr`].

use crate::types::{Const, Type};
use serde::{Deserialize, Serialize};

/// Source location span tracking (line, column) start and end positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn new(start_line: usize, start_col: usize, end_line: usize, end_col: usize) -> Self {
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// A generated span (all zeros) for synthesized nodes.
    pub fn generated() -> Self {
        Span::new(0, 0, 0, 0)
    }

    pub fn is_generated(&self) -> bool {
        self.start_line == 0 && self.start_col == 0 && self.end_line == 0 && self.end_col == 0
    }

    /// Merge two spans to create a span covering both
    pub fn merge(&self, other: &Span) -> Span {
        if self.is_generated() {
            return *other;
        }
        if other.is_generated() {
            return *self;
        }
        let (start_line, start_col) = if self.start_line < other.start_line
            || (self.start_line == other.start_line && self.start_col <= other.start_col)
        {
            (self.start_line, self.start_col)
        } else {
            (other.start_line, other.start_col)
        };
        let (end_line, end_col) = if self.end_line > other.end_line
            || (self.end_line == other.end_line && self.end_col >= other.end_col)
        {
            (self.end_line, self.end_col)
        } else {
            (other.end_line, other.end_col)
        };
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_col)
    }
}

/// Unique identifier for AST and IR nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

/// Counter for generating unique node IDs across compilation phases
pub type NodeCounter = crate::IdSource<NodeId>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub id: NodeId,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node<T> {
    pub h: Header,
    pub kind: T,
}

impl<T: PartialEq> PartialEq for Node<T> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

pub type Expression = Node<ExprKind>;

pub trait NodeCounterExt {
    fn mk_node<T>(&mut self, kind: T, span: Span) -> Node<T>;
}

impl NodeCounterExt for NodeCounter {
    fn mk_node<T>(&mut self, kind: T, span: Span) -> Node<T> {
        Node {
            h: Header {
                id: self.next_id(),
                span,
            },
            kind,
        }
    }
}

/// A complete translation unit: one contract with its type definitions,
/// global values, entry points and optional storage initializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDecl {
    pub name: String,
    /// Declared compatibility version, e.g. "0.4".
    pub version: Option<String>,
    pub storage: Type,
    pub types: Vec<TypeDef>,
    pub values: Vec<ValueDecl>,
    pub entries: Vec<EntryDecl>,
    pub init: Option<InitDecl>,
}

/// A named record or variant definition, registered once and referenced
/// by name from types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeDefKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDefKind {
    /// Ordered, uniquely labeled fields.
    Record(Vec<(String, Type)>),
    /// Ordered, uniquely labeled constructors.
    Variant(Vec<(String, Type)>),
}

/// A global `let` binding usable from every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDecl {
    pub name: String,
    pub body: Expression,
}

/// An entry point: `(parameter, storage) -> (operation list, storage)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecl {
    pub name: String,
    pub param_name: String,
    pub param_ty: Type,
    pub storage_name: String,
    pub body: Expression,
}

/// The storage initializer: its body must evaluate to the storage type
/// and may not use `sender`/`source` or cause transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitDecl {
    pub params: Vec<(String, Type)>,
    pub body: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// A literal constant, possibly with a user type ascription
    /// (`([] : operation list)`).
    Const {
        value: Const,
        ascribed: Option<Type>,
    },
    Var(String),
    Tuple(Vec<Expression>),
    RecordLit(Vec<(String, Expression)>),
    /// Variant constructor application, including bare `Left`/`Right`
    /// (which require an `or` ascription to typecheck).
    Construct {
        ctor: String,
        arg: Box<Expression>,
        ascribed: Option<Type>,
    },
    Let {
        name: String,
        value: Box<Expression>,
        body: Box<Expression>,
    },
    Seq(Box<Expression>, Box<Expression>),
    If {
        cond: Box<Expression>,
        then_branch: Box<Expression>,
        else_branch: Box<Expression>,
    },
    Lambda {
        param: String,
        param_ty: Type,
        ret_ty: Option<Type>,
        /// Name the lambda may call itself by (recursive lambdas).
        rec_name: Option<String>,
        body: Box<Expression>,
    },
    /// Application of a named surface primitive (`"+"`, `"List.size"`,
    /// `"Map.update"`, ...). Resolution to a monomorphic primitive
    /// happens at encode time.
    Apply {
        prim: String,
        args: Vec<Expression>,
    },
    /// Application of a first-class lambda or closure value.
    Call {
        func: Box<Expression>,
        arg: Box<Expression>,
    },
    /// Tuple component projection `t.(i)`.
    Proj {
        tuple: Box<Expression>,
        index: usize,
    },
    /// Tuple component update `t.(i) <- v`.
    SetProj {
        tuple: Box<Expression>,
        index: usize,
        value: Box<Expression>,
    },
    /// Record field projection `r.f`.
    Field {
        record: Box<Expression>,
        field: String,
    },
    /// Record field update `r.f <- v`.
    SetField {
        record: Box<Expression>,
        field: String,
        value: Box<Expression>,
    },
    MatchOption {
        arg: Box<Expression>,
        ifnone: Box<Expression>,
        some_name: Option<String>,
        ifsome: Box<Expression>,
    },
    MatchNat {
        arg: Box<Expression>,
        plus_name: Option<String>,
        ifplus: Box<Expression>,
        minus_name: Option<String>,
        ifminus: Box<Expression>,
    },
    MatchList {
        arg: Box<Expression>,
        head_name: Option<String>,
        tail_name: Option<String>,
        ifcons: Box<Expression>,
        ifnil: Box<Expression>,
    },
    MatchVariant {
        arg: Box<Expression>,
        cases: Vec<MatchCase>,
    },
    /// `Loop.loop (fun x -> (continue, x')) init`
    Loop {
        name: String,
        body: Box<Expression>,
        init: Box<Expression>,
    },
    /// `Loop.left (fun (x, acc?) -> (Left x' | Right r, acc?)) init acc?`
    LoopLeft {
        name: String,
        body: Box<Expression>,
        init: Box<Expression>,
        acc: Option<Box<Expression>>,
    },
    /// `Coll.fold (fun (elt, acc) -> acc') coll init`
    Fold {
        prim: String,
        name: String,
        body: Box<Expression>,
        coll: Box<Expression>,
        init: Box<Expression>,
    },
    /// `Coll.map (fun elt -> elt') coll`
    MapOp {
        prim: String,
        name: String,
        body: Box<Expression>,
        coll: Box<Expression>,
    },
    /// `Coll.map_fold (fun (elt, acc) -> (elt', acc')) coll init`
    MapFold {
        prim: String,
        name: String,
        body: Box<Expression>,
        coll: Box<Expression>,
        init: Box<Expression>,
    },
    /// `Contract.call contract amount arg`
    Transfer {
        contract: Box<Expression>,
        amount: Box<Expression>,
        arg: Box<Expression>,
    },
    Failwith(Box<Expression>),
    /// `Contract.create manager delegate spendable delegatable amount code storage`,
    /// reduced here to the delegate/amount/code/storage essentials.
    CreateContract {
        delegate: Box<Expression>,
        amount: Box<Expression>,
        contract: Box<ContractDecl>,
        storage_init: Box<Expression>,
    },
    /// `(Contract.at addr : ty contract option)`
    ContractAt {
        addr: Box<Expression>,
        ty: Type,
    },
    /// `(Bytes.unpack b : ty option)`
    Unpack {
        arg: Box<Expression>,
        ty: Type,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub ctor: String,
    /// `None` is a wildcard binding (`_`): the payload is dropped.
    pub var: Option<String>,
    pub body: Expression,
}
