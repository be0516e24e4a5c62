//! Type and constant algebra, and the per-translation environment.
//!
//! Types are a closed, monomorphic sum. Named records and variants are
//! registered once in [`Env`] and referenced by name; the encoder later
//! binarizes them into pairs and nested `or`s.

use crate::err_internal;
use crate::error::{CompilerError, Result, TypeErrorKind};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Unit,
    Bool,
    Int,
    Nat,
    Tez,
    String_,
    Bytes,
    Timestamp,
    Key,
    KeyHash,
    Signature,
    Operation,
    Address,
    Tuple(Vec<Type>),
    Option_(Box<Type>),
    Or(Box<Type>, Box<Type>),
    List(Box<Type>),
    Set(Box<Type>),
    Map(Box<Type>, Box<Type>),
    BigMap(Box<Type>, Box<Type>),
    Contract(Box<Type>),
    Lambda(Box<Type>, Box<Type>),
    /// A lambda that captures an environment; represented at runtime as
    /// the pair `(env, lambda (env, arg) ret)`.
    Closure {
        arg: Box<Type>,
        ret: Box<Type>,
        env: Box<Type>,
    },
    /// Named record, registered in [`Env`].
    Record(String),
    /// Named variant, registered in [`Env`].
    Variant(String),
}

impl Type {
    pub fn option(inner: Type) -> Type {
        Type::Option_(Box::new(inner))
    }

    pub fn or(left: Type, right: Type) -> Type {
        Type::Or(Box::new(left), Box::new(right))
    }

    pub fn list(inner: Type) -> Type {
        Type::List(Box::new(inner))
    }

    pub fn pair(a: Type, b: Type) -> Type {
        Type::Tuple(vec![a, b])
    }

    pub fn lambda(arg: Type, ret: Type) -> Type {
        Type::Lambda(Box::new(arg), Box::new(ret))
    }

    /// The `(operation list, storage)` result type of an entry body.
    pub fn entry_result(storage: Type) -> Type {
        Type::pair(Type::list(Type::Operation), storage)
    }

    /// Whether values of this type can be used as map/set keys and with
    /// `Compare`.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Int
                | Type::Nat
                | Type::Tez
                | Type::String_
                | Type::Bytes
                | Type::Timestamp
                | Type::KeyHash
                | Type::Address
        )
    }

    pub fn contains_bigmap(&self) -> bool {
        match self {
            Type::BigMap(_, _) => true,
            Type::Tuple(tys) => tys.iter().any(Type::contains_bigmap),
            Type::Option_(t) | Type::List(t) | Type::Set(t) | Type::Contract(t) => t.contains_bigmap(),
            Type::Or(a, b) | Type::Map(a, b) | Type::Lambda(a, b) => {
                a.contains_bigmap() || b.contains_bigmap()
            }
            Type::Closure { arg, ret, env } => {
                arg.contains_bigmap() || ret.contains_bigmap() || env.contains_bigmap()
            }
            _ => false,
        }
    }

    /// A `bigmap` may only appear as the first component of a storage
    /// tuple; everywhere else it is rejected.
    pub fn bigmap_placement_ok(&self) -> bool {
        match self {
            Type::Tuple(tys) => {
                let rest_ok = tys.iter().skip(1).all(|t| !t.contains_bigmap());
                let head_ok = match tys.first() {
                    Some(Type::BigMap(k, v)) => !k.contains_bigmap() && !v.contains_bigmap(),
                    Some(other) => !other.contains_bigmap(),
                    None => true,
                };
                head_ok && rest_ok
            }
            other => !other.contains_bigmap(),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::Unit => write!(f, "unit"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Nat => write!(f, "nat"),
            Type::Tez => write!(f, "tez"),
            Type::String_ => write!(f, "string"),
            Type::Bytes => write!(f, "bytes"),
            Type::Timestamp => write!(f, "timestamp"),
            Type::Key => write!(f, "key"),
            Type::KeyHash => write!(f, "key_hash"),
            Type::Signature => write!(f, "signature"),
            Type::Operation => write!(f, "operation"),
            Type::Address => write!(f, "address"),
            Type::Tuple(tys) => {
                write!(f, "(")?;
                for (i, t) in tys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            Type::Option_(t) => write!(f, "{} option", t),
            Type::Or(a, b) => write!(f, "({}, {}) or", a, b),
            Type::List(t) => write!(f, "{} list", t),
            Type::Set(t) => write!(f, "{} set", t),
            Type::Map(k, v) => write!(f, "({}, {}) map", k, v),
            Type::BigMap(k, v) => write!(f, "({}, {}) big_map", k, v),
            Type::Contract(t) => write!(f, "{} contract", t),
            Type::Lambda(a, b) => write!(f, "{} -> {}", a, b),
            Type::Closure { arg, ret, env } => write!(f, "{} ~{}~> {}", arg, env, ret),
            Type::Record(name) | Type::Variant(name) => write!(f, "{}", name),
        }
    }
}

/// Constants mirror the types. Literal `bigmap` and `operation` values
/// cannot be written in source; they only arise at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Unit,
    Bool(bool),
    Int(i128),
    Nat(u64),
    /// Amount in the smallest token unit.
    Tez(u64),
    String(String),
    Bytes(Vec<u8>),
    /// Seconds since epoch; the textual RFC3339 form is a printer concern.
    Timestamp(i64),
    Key(String),
    KeyHash(String),
    Signature(String),
    Address(String),
    Tuple(Vec<Const>),
    None_,
    Some_(Box<Const>),
    Left(Box<Const>),
    Right(Box<Const>),
    List(Vec<Const>),
    Set(Vec<Const>),
    Map(Vec<(Const, Const)>),
    /// `BigMap.empty`; restricted to storage initializers.
    EmptyBigMap,
}

impl Const {
    /// The type of a literal when it is unambiguous. Empty collections,
    /// `None`, and injections need an ascription and return `None` here.
    pub fn ground_type(&self) -> Option<Type> {
        match self {
            Const::Unit => Some(Type::Unit),
            Const::Bool(_) => Some(Type::Bool),
            Const::Int(_) => Some(Type::Int),
            Const::Nat(_) => Some(Type::Nat),
            Const::Tez(_) => Some(Type::Tez),
            Const::String(_) => Some(Type::String_),
            Const::Bytes(_) => Some(Type::Bytes),
            Const::Timestamp(_) => Some(Type::Timestamp),
            Const::Key(_) => Some(Type::Key),
            Const::KeyHash(_) => Some(Type::KeyHash),
            Const::Signature(_) => Some(Type::Signature),
            Const::Address(_) => Some(Type::Address),
            Const::Tuple(items) => {
                let tys: Option<Vec<Type>> = items.iter().map(Const::ground_type).collect();
                tys.map(Type::Tuple)
            }
            Const::Some_(inner) => inner.ground_type().map(Type::option),
            _ => None,
        }
    }
}

/// Per-translation registries of named records and variants, plus label
/// indexes for field and constructor resolution.
#[derive(Debug, Clone, Default)]
pub struct Env {
    records: IndexMap<String, Vec<(String, Type)>>,
    variants: IndexMap<String, Vec<(String, Type)>>,
    /// field label -> record name; ambiguous labels are rejected at
    /// registration.
    fields: HashMap<String, String>,
    /// constructor label -> variant name.
    constructors: HashMap<String, String>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    fn type_err(kind: TypeErrorKind, message: String) -> CompilerError {
        CompilerError::Type {
            kind,
            message,
            span: crate::ast::Span::generated(),
            secondary: None,
        }
    }

    pub fn register_record(&mut self, name: &str, fields: Vec<(String, Type)>) -> Result<()> {
        if fields.is_empty() {
            return Err(Self::type_err(
                TypeErrorKind::TypeMismatch,
                format!("record {} has no fields", name),
            ));
        }
        for (label, _) in &fields {
            if fields.iter().filter(|(l, _)| l == label).count() > 1 {
                return Err(Self::type_err(
                    TypeErrorKind::UnknownField,
                    format!("duplicate field {} in record {}", label, name),
                ));
            }
            if let Some(other) = self.fields.get(label) {
                return Err(Self::type_err(
                    TypeErrorKind::UnknownField,
                    format!("field {} already belongs to record {}", label, other),
                ));
            }
        }
        for (label, _) in &fields {
            self.fields.insert(label.clone(), name.to_string());
        }
        self.records.insert(name.to_string(), fields);
        Ok(())
    }

    pub fn register_variant(&mut self, name: &str, ctors: Vec<(String, Type)>) -> Result<()> {
        if ctors.is_empty() {
            return Err(Self::type_err(
                TypeErrorKind::TypeMismatch,
                format!("variant {} has no constructors", name),
            ));
        }
        for (label, _) in &ctors {
            if ctors.iter().filter(|(l, _)| l == label).count() > 1 {
                return Err(Self::type_err(
                    TypeErrorKind::UnknownConstructor,
                    format!("duplicate constructor {} in variant {}", label, name),
                ));
            }
            if let Some(other) = self.constructors.get(label) {
                return Err(Self::type_err(
                    TypeErrorKind::UnknownConstructor,
                    format!("constructor {} already belongs to variant {}", label, other),
                ));
            }
        }
        for (label, _) in &ctors {
            self.constructors.insert(label.clone(), name.to_string());
        }
        self.variants.insert(name.to_string(), ctors);
        Ok(())
    }

    pub fn record_fields(&self, name: &str) -> Option<&[(String, Type)]> {
        self.records.get(name).map(Vec::as_slice)
    }

    pub fn variant_ctors(&self, name: &str) -> Option<&[(String, Type)]> {
        self.variants.get(name).map(Vec::as_slice)
    }

    /// Resolve a field label to `(record name, field index, field type)`.
    pub fn resolve_field(&self, label: &str) -> Option<(&str, usize, &Type)> {
        let record = self.fields.get(label)?;
        let fields = self.records.get(record)?;
        let index = fields.iter().position(|(l, _)| l == label)?;
        Some((record.as_str(), index, &fields[index].1))
    }

    /// Resolve a constructor label to `(variant name, ctor index, payload type)`.
    pub fn resolve_constructor(&self, label: &str) -> Option<(&str, usize, &Type)> {
        let variant = self.constructors.get(label)?;
        let ctors = self.variants.get(variant)?;
        let index = ctors.iter().position(|(l, _)| l == label)?;
        Some((variant.as_str(), index, &ctors[index].1))
    }

    /// Structural encoding of a type: records become tuples, variants
    /// become right-leaning nested `or`s over declaration order. Stable
    /// under appending constructors at the end.
    pub fn binarize(&self, ty: &Type) -> Result<Type> {
        match ty {
            Type::Record(name) => {
                let fields = self
                    .records
                    .get(name)
                    .ok_or_else(|| err_internal!("encode", "record {} not registered", name))?;
                let tys: Result<Vec<Type>> = fields.iter().map(|(_, t)| self.binarize(t)).collect();
                Ok(Type::Tuple(tys?))
            }
            Type::Variant(name) => {
                let ctors = self
                    .variants
                    .get(name)
                    .ok_or_else(|| err_internal!("encode", "variant {} not registered", name))?;
                let mut encoded: Vec<Type> = Vec::with_capacity(ctors.len());
                for (_, t) in ctors.iter() {
                    encoded.push(self.binarize(t)?);
                }
                Ok(right_comb_or(encoded))
            }
            Type::Tuple(tys) => {
                let tys: Result<Vec<Type>> = tys.iter().map(|t| self.binarize(t)).collect();
                Ok(Type::Tuple(tys?))
            }
            Type::Option_(t) => Ok(Type::option(self.binarize(t)?)),
            Type::Or(a, b) => Ok(Type::or(self.binarize(a)?, self.binarize(b)?)),
            Type::List(t) => Ok(Type::list(self.binarize(t)?)),
            Type::Set(t) => Ok(Type::Set(Box::new(self.binarize(t)?))),
            Type::Map(k, v) => Ok(Type::Map(Box::new(self.binarize(k)?), Box::new(self.binarize(v)?))),
            Type::BigMap(k, v) => Ok(Type::BigMap(
                Box::new(self.binarize(k)?),
                Box::new(self.binarize(v)?),
            )),
            Type::Contract(t) => Ok(Type::Contract(Box::new(self.binarize(t)?))),
            Type::Lambda(a, b) => Ok(Type::lambda(self.binarize(a)?, self.binarize(b)?)),
            Type::Closure { arg, ret, env } => {
                // (env, lambda (env, arg) ret)
                let arg = self.binarize(arg)?;
                let ret = self.binarize(ret)?;
                let env = self.binarize(env)?;
                Ok(Type::pair(
                    env.clone(),
                    Type::lambda(Type::pair(env, arg), ret),
                ))
            }
            ground => Ok(ground.clone()),
        }
    }

    /// The Left/Right path of constructor `index` among `count` in the
    /// right-leaning encoding: `true` = Left at that level.
    pub fn ctor_path(index: usize, count: usize) -> Vec<bool> {
        debug_assert!(index < count);
        let mut path = Vec::new();
        let mut i = index;
        let mut n = count;
        while n > 1 {
            if i == 0 {
                path.push(true);
                break;
            }
            path.push(false);
            i -= 1;
            n -= 1;
        }
        path
    }
}

/// Fold a list of types into a right-leaning `or` comb.
/// `[a, b, c]` becomes `or a (or b c)`.
pub fn right_comb_or(mut tys: Vec<Type>) -> Type {
    match tys.len() {
        0 => Type::Unit,
        1 => tys.remove(0),
        _ => {
            let head = tys.remove(0);
            Type::or(head, right_comb_or(tys))
        }
    }
}
