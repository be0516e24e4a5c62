//! The target stack assembly.
//!
//! Two layers: the *symbolic* instruction tree the code generator emits
//! and the peephole/finalizer passes rewrite ([`Instr`]), and the
//! *concrete* syntax tree of the wire format ([`MExpr`]) produced by the
//! emitter. The wire format is fixed: lowercase-stanza programs of
//! `parameter TYPE; storage TYPE; code INSTR;` where each instruction is
//! a primitive with positional args and `@var`/`%field` annotations.

use crate::ast::Span;
use crate::types::{Const, Type};

/// A symbolic instruction: form, source location, optional variable-name
/// annotation for the value it leaves on top of the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub kind: InstrKind,
    pub span: Span,
    pub name: Option<String>,
}

impl Instr {
    pub fn new(kind: InstrKind, span: Span) -> Self {
        Instr {
            kind,
            span,
            name: None,
        }
    }

    pub fn named(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Simple no-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Ediv,
    Neg,
    Abs,
    IsNat,
    Int,
    Not,
    And,
    Or,
    Xor,
    Lsl,
    Lsr,
    Compare,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Slice,
    Size,
    Mem,
    Get,
    Update,
    Some_,
    Cons,
    Pack,
    Blake2b,
    Sha256,
    Sha512,
    HashKey,
    CheckSignature,
    TransferTokens,
    Self_,
    Balance,
    Now,
    Amount,
    Sender,
    Source,
    StepsToQuota,
    Address,
    SetDelegate,
    ImplicitAccount,
    CreateAccount,
}

impl Op {
    /// Wire mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Ediv => "EDIV",
            Op::Neg => "NEG",
            Op::Abs => "ABS",
            Op::IsNat => "ISNAT",
            Op::Int => "INT",
            Op::Not => "NOT",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::Lsl => "LSL",
            Op::Lsr => "LSR",
            Op::Compare => "COMPARE",
            Op::Eq => "EQ",
            Op::Neq => "NEQ",
            Op::Lt => "LT",
            Op::Le => "LE",
            Op::Gt => "GT",
            Op::Ge => "GE",
            Op::Concat => "CONCAT",
            Op::Slice => "SLICE",
            Op::Size => "SIZE",
            Op::Mem => "MEM",
            Op::Get => "GET",
            Op::Update => "UPDATE",
            Op::Some_ => "SOME",
            Op::Cons => "CONS",
            Op::Pack => "PACK",
            Op::Blake2b => "BLAKE2B",
            Op::Sha256 => "SHA256",
            Op::Sha512 => "SHA512",
            Op::HashKey => "HASH_KEY",
            Op::CheckSignature => "CHECK_SIGNATURE",
            Op::TransferTokens => "TRANSFER_TOKENS",
            Op::Self_ => "SELF",
            Op::Balance => "BALANCE",
            Op::Now => "NOW",
            Op::Amount => "AMOUNT",
            Op::Sender => "SENDER",
            Op::Source => "SOURCE",
            Op::StepsToQuota => "STEPS_TO_QUOTA",
            Op::Address => "ADDRESS",
            Op::SetDelegate => "SET_DELEGATE",
            Op::ImplicitAccount => "IMPLICIT_ACCOUNT",
            Op::CreateAccount => "CREATE_ACCOUNT",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Op> {
        let all = [
            Op::Add,
            Op::Sub,
            Op::Mul,
            Op::Ediv,
            Op::Neg,
            Op::Abs,
            Op::IsNat,
            Op::Int,
            Op::Not,
            Op::And,
            Op::Or,
            Op::Xor,
            Op::Lsl,
            Op::Lsr,
            Op::Compare,
            Op::Eq,
            Op::Neq,
            Op::Lt,
            Op::Le,
            Op::Gt,
            Op::Ge,
            Op::Concat,
            Op::Slice,
            Op::Size,
            Op::Mem,
            Op::Get,
            Op::Update,
            Op::Some_,
            Op::Cons,
            Op::Pack,
            Op::Blake2b,
            Op::Sha256,
            Op::Sha512,
            Op::HashKey,
            Op::CheckSignature,
            Op::TransferTokens,
            Op::Self_,
            Op::Balance,
            Op::Now,
            Op::Amount,
            Op::Sender,
            Op::Source,
            Op::StepsToQuota,
            Op::Address,
            Op::SetDelegate,
            Op::ImplicitAccount,
            Op::CreateAccount,
        ];
        all.iter().copied().find(|op| op.mnemonic() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    // -- stack moves --
    /// Copy the n-th cell (1-based from the top) to the top.
    Dup(usize),
    Swap,
    /// Protect the top `n` cells and run the body below them.
    Dip(usize, Vec<Instr>),
    /// Drop `count` cells found under the top `keep` cells.
    DipDrop(usize, usize),
    Drop,
    // -- structural --
    Pair,
    /// PAIR with field annotations for record construction.
    RecordOf(String, Option<String>),
    /// Split the pair on top into its components, car on top. Produced
    /// by the peephole from the `DUP; DIP(CDR); CAR` unpack triple; the
    /// annotations name the car and cdr values respectively.
    Unpair(Option<String>, Option<String>),
    Car(Option<String>),
    Cdr(Option<String>),
    /// `CD^n AR`: project tuple component n (n >= 1).
    CdAr(usize, Option<String>),
    /// `CD^n DR`: project the trailing component after n cdrs (n >= 1).
    CdDr(usize, Option<String>),
    /// Inject into `or _ right_ty`, optional constructor annotation.
    Left(Type, Option<String>),
    /// Inject into `or left_ty _`.
    Right(Type, Option<String>),
    // -- constants --
    Push(Type, Const),
    Unit,
    Nil(Type),
    None_(Type),
    EmptySet(Type),
    EmptyMap(Type, Type),
    // -- control --
    If(Vec<Instr>, Vec<Instr>),
    IfNone(Vec<Instr>, Vec<Instr>),
    IfLeft(Vec<Instr>, Vec<Instr>),
    IfCons(Vec<Instr>, Vec<Instr>),
    Loop(Vec<Instr>),
    LoopLeft(Vec<Instr>),
    Iter(Vec<Instr>),
    MapI(Vec<Instr>),
    Lambda(Type, Type, Vec<Instr>),
    Exec,
    /// Re-annotate the top of the stack; used after control-flow forms
    /// that cannot carry a name themselves.
    Rename,
    Failwith,
    // -- ops --
    Op(Op),
    // -- typed contract ops --
    Contract(Type),
    Unpack(Type),
    CreateContract(Box<ContractCode>),
}

/// A compiled contract: the three top-level stanzas.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCode {
    pub parameter: Type,
    pub storage: Type,
    pub code: Vec<Instr>,
}

// =============================================================================
// Concrete syntax tree
// =============================================================================

/// Node of the external wire syntax: a primitive application with
/// positional args and annotations, a sequence, or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum MExpr {
    Prim {
        name: String,
        args: Vec<MExpr>,
        annots: Vec<String>,
    },
    Seq(Vec<MExpr>),
    Int(i128),
    Str(String),
    Bytes(Vec<u8>),
}

impl MExpr {
    pub fn prim(name: &str) -> MExpr {
        MExpr::Prim {
            name: name.to_string(),
            args: vec![],
            annots: vec![],
        }
    }

    pub fn prim_args(name: &str, args: Vec<MExpr>) -> MExpr {
        MExpr::Prim {
            name: name.to_string(),
            args,
            annots: vec![],
        }
    }

    pub fn with_annots(self, annots: Vec<String>) -> MExpr {
        match self {
            MExpr::Prim { name, args, .. } => MExpr::Prim { name, args, annots },
            other => other,
        }
    }
}

/// A parsed wire-format contract.
#[derive(Debug, Clone, PartialEq)]
pub struct MContract {
    pub parameter: MExpr,
    pub storage: MExpr,
    pub code: MExpr,
}
