//! Concrete codec for the target assembly.
//!
//! Converts the symbolic instruction tree to the wire syntax tree and
//! back, and serializes the wire tree as text or as structured JSON
//! (`{"prim": NAME, "args": [...], "annots": [...]}`). The macro
//! mnemonics (`DUUP`, `DIIP`, `CDAR`, `CDDR`, `DIP { DROP ... }`) are
//! fixed by the wire format; the decoder reverses them.

use crate::asm::{ContractCode, Instr, InstrKind, MContract, MExpr, Op};
use crate::ast::Span;
use crate::error::Result;
use crate::err_parse;
use crate::types::{Const, Type};

// =============================================================================
// Symbolic -> concrete
// =============================================================================

/// Render a compiled contract with `%entry_NAME` annotations attached to
/// the parameter's or-comb arms (multi-entry contracts only).
pub fn contract_to_mexpr(code: &ContractCode, entry_names: &[String]) -> Result<MContract> {
    let mut parameter = type_to_mexpr(&code.parameter)?;
    if entry_names.len() > 1 {
        parameter = annotate_entries(parameter, entry_names);
    }
    Ok(MContract {
        parameter,
        storage: type_to_mexpr(&code.storage)?,
        code: MExpr::Seq(instrs_to_mexpr(&code.code)?),
    })
}

fn annotate_entries(parameter: MExpr, names: &[String]) -> MExpr {
    fn tag(e: MExpr, name: &str) -> MExpr {
        match e {
            MExpr::Prim { name: p, args, mut annots } => {
                annots.push(format!("%{}", name));
                MExpr::Prim { name: p, args, annots }
            }
            other => other,
        }
    }
    match (parameter, names) {
        (p, []) => p,
        (p, [last]) => tag(p, last),
        (MExpr::Prim { name, mut args, annots }, [first, rest @ ..]) if name == "or" && args.len() == 2 => {
            let right = args.pop().expect("or arity");
            let left = args.pop().expect("or arity");
            MExpr::Prim {
                name,
                args: vec![tag(left, first), annotate_entries(right, rest)],
                annots,
            }
        }
        (p, _) => p,
    }
}

pub fn instrs_to_mexpr(instrs: &[Instr]) -> Result<Vec<MExpr>> {
    instrs.iter().map(instr_to_mexpr).collect()
}

fn seq(instrs: &[Instr]) -> Result<MExpr> {
    Ok(MExpr::Seq(instrs_to_mexpr(instrs)?))
}

fn instr_to_mexpr(instr: &Instr) -> Result<MExpr> {
    let mut annots = Vec::new();
    if let Some(name) = &instr.name {
        // UNPAIR names its two results through its own annotation pair.
        if !matches!(instr.kind, InstrKind::Unpair(_, _)) {
            annots.push(format!("@{}", name));
        }
    }
    let e = match &instr.kind {
        InstrKind::Dup(n) => MExpr::prim(&dup_mnemonic(*n)),
        InstrKind::Swap => MExpr::prim("SWAP"),
        InstrKind::Dip(n, body) => MExpr::prim_args(&dip_mnemonic(*n), vec![seq(body)?]),
        InstrKind::DipDrop(n, k) => {
            let drops = vec![MExpr::prim("DROP"); *k];
            MExpr::prim_args(&dip_mnemonic(*n), vec![MExpr::Seq(drops)])
        }
        InstrKind::Drop => MExpr::prim("DROP"),
        InstrKind::Pair => MExpr::prim("PAIR"),
        InstrKind::Unpair(car, cdr) => {
            // Positional annotations: car first, cdr second; `@_` holds
            // the car slot open when only the cdr is named.
            match (car, cdr) {
                (Some(car), Some(cdr)) => {
                    annots.push(format!("@{}", car));
                    annots.push(format!("@{}", cdr));
                }
                (Some(car), None) => annots.push(format!("@{}", car)),
                (None, Some(cdr)) => {
                    annots.push("@_".to_string());
                    annots.push(format!("@{}", cdr));
                }
                (None, None) => {}
            }
            MExpr::prim("UNPAIR")
        }
        InstrKind::RecordOf(f1, f2) => {
            annots.push(format!("%{}", f1));
            if let Some(f2) = f2 {
                annots.push(format!("%{}", f2));
            }
            MExpr::prim("PAIR")
        }
        InstrKind::Car(label) => {
            if let Some(label) = label {
                annots.push(format!("%{}", label));
            }
            MExpr::prim("CAR")
        }
        InstrKind::Cdr(label) => {
            if let Some(label) = label {
                annots.push(format!("%{}", label));
            }
            MExpr::prim("CDR")
        }
        InstrKind::CdAr(n, label) => {
            if let Some(label) = label {
                annots.push(format!("%{}", label));
            }
            let mut name = String::from("C");
            for _ in 0..*n {
                name.push('D');
            }
            name.push_str("AR");
            MExpr::prim(&name)
        }
        InstrKind::CdDr(n, label) => {
            if let Some(label) = label {
                annots.push(format!("%{}", label));
            }
            let mut name = String::from("C");
            for _ in 0..*n {
                name.push('D');
            }
            name.push_str("DR");
            MExpr::prim(&name)
        }
        InstrKind::Left(right_ty, ctor) => {
            if let Some(ctor) = ctor {
                annots.push(format!("%{}", ctor));
            }
            MExpr::prim_args("LEFT", vec![type_to_mexpr(right_ty)?])
        }
        InstrKind::Right(left_ty, ctor) => {
            if let Some(ctor) = ctor {
                annots.push(format!("%{}", ctor));
            }
            MExpr::prim_args("RIGHT", vec![type_to_mexpr(left_ty)?])
        }
        InstrKind::Push(ty, c) => {
            MExpr::prim_args("PUSH", vec![type_to_mexpr(ty)?, const_to_mexpr(c)?])
        }
        InstrKind::Unit => MExpr::prim("UNIT"),
        InstrKind::Nil(ty) => MExpr::prim_args("NIL", vec![type_to_mexpr(ty)?]),
        InstrKind::None_(ty) => MExpr::prim_args("NONE", vec![type_to_mexpr(ty)?]),
        InstrKind::EmptySet(ty) => MExpr::prim_args("EMPTY_SET", vec![type_to_mexpr(ty)?]),
        InstrKind::EmptyMap(k, v) => {
            MExpr::prim_args("EMPTY_MAP", vec![type_to_mexpr(k)?, type_to_mexpr(v)?])
        }
        InstrKind::If(a, b) => MExpr::prim_args("IF", vec![seq(a)?, seq(b)?]),
        InstrKind::IfNone(a, b) => MExpr::prim_args("IF_NONE", vec![seq(a)?, seq(b)?]),
        InstrKind::IfLeft(a, b) => MExpr::prim_args("IF_LEFT", vec![seq(a)?, seq(b)?]),
        InstrKind::IfCons(a, b) => MExpr::prim_args("IF_CONS", vec![seq(a)?, seq(b)?]),
        InstrKind::Loop(body) => MExpr::prim_args("LOOP", vec![seq(body)?]),
        InstrKind::LoopLeft(body) => MExpr::prim_args("LOOP_LEFT", vec![seq(body)?]),
        InstrKind::Iter(body) => MExpr::prim_args("ITER", vec![seq(body)?]),
        InstrKind::MapI(body) => MExpr::prim_args("MAP", vec![seq(body)?]),
        InstrKind::Lambda(arg, ret, body) => MExpr::prim_args(
            "LAMBDA",
            vec![type_to_mexpr(arg)?, type_to_mexpr(ret)?, seq(body)?],
        ),
        InstrKind::Exec => MExpr::prim("EXEC"),
        InstrKind::Rename => MExpr::prim("RENAME"),
        InstrKind::Failwith => MExpr::prim("FAILWITH"),
        InstrKind::Op(op) => MExpr::prim(op.mnemonic()),
        InstrKind::Contract(ty) => MExpr::prim_args("CONTRACT", vec![type_to_mexpr(ty)?]),
        InstrKind::Unpack(ty) => MExpr::prim_args("UNPACK", vec![type_to_mexpr(ty)?]),
        InstrKind::CreateContract(code) => {
            let inner = vec![
                MExpr::prim_args("parameter", vec![type_to_mexpr(&code.parameter)?]),
                MExpr::prim_args("storage", vec![type_to_mexpr(&code.storage)?]),
                MExpr::prim_args("code", vec![seq(&code.code)?]),
            ];
            MExpr::prim_args("CREATE_CONTRACT", vec![MExpr::Seq(inner)])
        }
    };
    Ok(e.with_annots(annots))
}

fn dup_mnemonic(n: usize) -> String {
    let mut s = String::from("D");
    for _ in 0..n.max(1) {
        s.push('U');
    }
    s.push('P');
    s
}

fn dip_mnemonic(n: usize) -> String {
    let mut s = String::from("D");
    for _ in 0..n.max(1) {
        s.push('I');
    }
    s.push('P');
    s
}

pub fn type_to_mexpr(ty: &Type) -> Result<MExpr> {
    let e = match ty {
        Type::Unit => MExpr::prim("unit"),
        Type::Bool => MExpr::prim("bool"),
        Type::Int => MExpr::prim("int"),
        Type::Nat => MExpr::prim("nat"),
        Type::Tez => MExpr::prim("tez"),
        Type::String_ => MExpr::prim("string"),
        Type::Bytes => MExpr::prim("bytes"),
        Type::Timestamp => MExpr::prim("timestamp"),
        Type::Key => MExpr::prim("key"),
        Type::KeyHash => MExpr::prim("key_hash"),
        Type::Signature => MExpr::prim("signature"),
        Type::Operation => MExpr::prim("operation"),
        Type::Address => MExpr::prim("address"),
        Type::Tuple(items) => {
            // Right-leaning pair spine.
            let mut iter = items.iter().rev();
            let mut acc = match iter.next() {
                Some(last) => type_to_mexpr(last)?,
                None => MExpr::prim("unit"),
            };
            for item in iter {
                acc = MExpr::prim_args("pair", vec![type_to_mexpr(item)?, acc]);
            }
            acc
        }
        Type::Option_(t) => MExpr::prim_args("option", vec![type_to_mexpr(t)?]),
        Type::Or(l, r) => MExpr::prim_args("or", vec![type_to_mexpr(l)?, type_to_mexpr(r)?]),
        Type::List(t) => MExpr::prim_args("list", vec![type_to_mexpr(t)?]),
        Type::Set(t) => MExpr::prim_args("set", vec![type_to_mexpr(t)?]),
        Type::Map(k, v) => MExpr::prim_args("map", vec![type_to_mexpr(k)?, type_to_mexpr(v)?]),
        Type::BigMap(k, v) => MExpr::prim_args("big_map", vec![type_to_mexpr(k)?, type_to_mexpr(v)?]),
        Type::Contract(t) => MExpr::prim_args("contract", vec![type_to_mexpr(t)?]),
        Type::Lambda(a, b) => MExpr::prim_args("lambda", vec![type_to_mexpr(a)?, type_to_mexpr(b)?]),
        Type::Closure { .. } | Type::Record(_) | Type::Variant(_) => {
            return Err(crate::err_internal!("emit", "non-structural type {} reached the emitter", ty))
        }
    };
    Ok(e)
}

pub fn const_to_mexpr(c: &Const) -> Result<MExpr> {
    let e = match c {
        Const::Unit => MExpr::prim("Unit"),
        Const::Bool(true) => MExpr::prim("True"),
        Const::Bool(false) => MExpr::prim("False"),
        Const::Int(i) => MExpr::Int(*i),
        Const::Nat(n) => MExpr::Int(*n as i128),
        Const::Tez(t) => MExpr::Int(*t as i128),
        Const::Timestamp(t) => MExpr::Int(*t as i128),
        Const::String(s) => MExpr::Str(s.clone()),
        Const::Bytes(b) => MExpr::Bytes(b.clone()),
        Const::Key(s) | Const::KeyHash(s) | Const::Signature(s) | Const::Address(s) => {
            MExpr::Str(s.clone())
        }
        Const::Tuple(items) => {
            let mut iter = items.iter().rev();
            let mut acc = match iter.next() {
                Some(last) => const_to_mexpr(last)?,
                None => MExpr::prim("Unit"),
            };
            for item in iter {
                acc = MExpr::prim_args("Pair", vec![const_to_mexpr(item)?, acc]);
            }
            acc
        }
        Const::None_ => MExpr::prim("None"),
        Const::Some_(inner) => MExpr::prim_args("Some", vec![const_to_mexpr(inner)?]),
        Const::Left(inner) => MExpr::prim_args("Left", vec![const_to_mexpr(inner)?]),
        Const::Right(inner) => MExpr::prim_args("Right", vec![const_to_mexpr(inner)?]),
        Const::List(items) | Const::Set(items) => {
            let items: Result<Vec<MExpr>> = items.iter().map(const_to_mexpr).collect();
            MExpr::Seq(items?)
        }
        Const::Map(items) => {
            let items: Result<Vec<MExpr>> = items
                .iter()
                .map(|(k, v)| {
                    Ok(MExpr::prim_args("Elt", vec![const_to_mexpr(k)?, const_to_mexpr(v)?]))
                })
                .collect();
            MExpr::Seq(items?)
        }
        Const::EmptyBigMap => {
            return Err(crate::err_internal!("emit", "empty bigmap constant reached the emitter"))
        }
    };
    Ok(e)
}

// =============================================================================
// Concrete -> symbolic (decoder)
// =============================================================================

pub fn mexpr_to_instrs(e: &MExpr) -> Result<Vec<Instr>> {
    match e {
        MExpr::Seq(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(mexpr_to_instrs(item)?);
            }
            Ok(out)
        }
        prim => decode_instr(prim),
    }
}

fn decode_instr(e: &MExpr) -> Result<Vec<Instr>> {
    let (name, args, annots) = match e {
        MExpr::Prim { name, args, annots } => (name.as_str(), args.as_slice(), annots.as_slice()),
        other => return Err(err_parse!("expected an instruction, got {}", print_compact(other))),
    };
    let span = Span::generated();
    let var_name = annots
        .iter()
        .find(|a| a.starts_with('@'))
        .map(|a| a[1..].to_string());
    let field = annots
        .iter()
        .find(|a| a.starts_with('%'))
        .map(|a| a[1..].to_string());

    let arg_seq = |i: usize| -> Result<Vec<Instr>> {
        args.get(i)
            .ok_or_else(|| err_parse!("{} is missing argument {}", name, i))
            .and_then(mexpr_to_instrs)
    };
    let arg_ty = |i: usize| -> Result<Type> {
        args.get(i)
            .ok_or_else(|| err_parse!("{} is missing argument {}", name, i))
            .and_then(mexpr_to_type)
    };

    let kind = match name {
        "SWAP" => InstrKind::Swap,
        "DROP" => InstrKind::Drop,
        "PAIR" => {
            let fields: Vec<&String> = annots.iter().filter(|a| a.starts_with('%')).collect();
            match fields.as_slice() {
                [] => InstrKind::Pair,
                [f1] => InstrKind::RecordOf(f1[1..].to_string(), None),
                [f1, f2, ..] => InstrKind::RecordOf(f1[1..].to_string(), Some(f2[1..].to_string())),
            }
        }
        "UNPAIR" => {
            let mut names = annots
                .iter()
                .filter(|a| a.starts_with('@'))
                .map(|a| a[1..].to_string());
            let car = names.next().filter(|n| n != "_");
            let cdr = names.next().filter(|n| n != "_");
            InstrKind::Unpair(car, cdr)
        }
        "CAR" => InstrKind::Car(field),
        "CDR" => InstrKind::Cdr(field),
        "LEFT" => InstrKind::Left(arg_ty(0)?, field),
        "RIGHT" => InstrKind::Right(arg_ty(0)?, field),
        "PUSH" => {
            let ty = arg_ty(0)?;
            let c = mexpr_to_const(
                args.get(1)
                    .ok_or_else(|| err_parse!("PUSH is missing its value"))?,
                &ty,
            )?;
            InstrKind::Push(ty, c)
        }
        "UNIT" => InstrKind::Unit,
        "NIL" => InstrKind::Nil(arg_ty(0)?),
        "NONE" => InstrKind::None_(arg_ty(0)?),
        "EMPTY_SET" => InstrKind::EmptySet(arg_ty(0)?),
        "EMPTY_MAP" => InstrKind::EmptyMap(arg_ty(0)?, arg_ty(1)?),
        "IF" => InstrKind::If(arg_seq(0)?, arg_seq(1)?),
        "IF_NONE" => InstrKind::IfNone(arg_seq(0)?, arg_seq(1)?),
        "IF_LEFT" => InstrKind::IfLeft(arg_seq(0)?, arg_seq(1)?),
        "IF_CONS" => InstrKind::IfCons(arg_seq(0)?, arg_seq(1)?),
        "LOOP" => InstrKind::Loop(arg_seq(0)?),
        "LOOP_LEFT" => InstrKind::LoopLeft(arg_seq(0)?),
        "ITER" => InstrKind::Iter(arg_seq(0)?),
        "MAP" => InstrKind::MapI(arg_seq(0)?),
        "LAMBDA" => InstrKind::Lambda(arg_ty(0)?, arg_ty(1)?, arg_seq(2)?),
        "EXEC" => InstrKind::Exec,
        "RENAME" => InstrKind::Rename,
        "FAILWITH" | "FAIL" => InstrKind::Failwith,
        "CONTRACT" => InstrKind::Contract(arg_ty(0)?),
        "UNPACK" => InstrKind::Unpack(arg_ty(0)?),
        "CREATE_CONTRACT" => {
            let inner = args
                .first()
                .ok_or_else(|| err_parse!("CREATE_CONTRACT is missing its code"))?;
            let contract = mexpr_to_contract_stanzas(inner)?;
            InstrKind::CreateContract(Box::new(contract))
        }
        other => {
            if let Some(op) = Op::from_mnemonic(other) {
                InstrKind::Op(op)
            } else if let Some(n) = parse_repeated(other, 'D', 'U', 'P') {
                InstrKind::Dup(n)
            } else if let Some(n) = parse_repeated(other, 'D', 'I', 'P') {
                // DIP { DROP ; ... } is the cleanup macro.
                let body = arg_seq(0)?;
                if !body.is_empty() && body.iter().all(|i| matches!(i.kind, InstrKind::Drop)) {
                    InstrKind::DipDrop(n, body.len())
                } else {
                    InstrKind::Dip(n, body)
                }
            } else if let Some(path) = parse_access_macro(other) {
                // C[AD]+R chains; the common D*A / D+ shapes keep their
                // dedicated forms, anything else expands.
                return Ok(decode_access_path(&path, field, var_name, span));
            } else {
                return Err(err_parse!("unknown instruction {}", other));
            }
        }
    };
    let mut instr = Instr::new(kind, span);
    // UNPAIR's annotations name its components, not a single result.
    if !matches!(instr.kind, InstrKind::Unpair(_, _)) {
        instr.name = var_name;
    }
    Ok(vec![instr])
}

fn parse_repeated(name: &str, first: char, mid: char, last: char) -> Option<usize> {
    let mut chars = name.chars();
    if chars.next()? != first {
        return None;
    }
    let rest: Vec<char> = chars.collect();
    if rest.len() < 2 || *rest.last()? != last {
        return None;
    }
    let mids = &rest[..rest.len() - 1];
    if mids.is_empty() || !mids.iter().all(|c| *c == mid) {
        return None;
    }
    Some(mids.len())
}

/// `C[AD]+R` -> the A/D letters, in execution order.
fn parse_access_macro(name: &str) -> Option<Vec<char>> {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() < 3 || chars[0] != 'C' || *chars.last()? != 'R' {
        return None;
    }
    let inner = &chars[1..chars.len() - 1];
    if inner.iter().all(|c| *c == 'A' || *c == 'D') {
        Some(inner.to_vec())
    } else {
        None
    }
}

fn decode_access_path(
    path: &[char],
    field: Option<String>,
    var_name: Option<String>,
    span: Span,
) -> Vec<Instr> {
    let ds = path.iter().take_while(|c| **c == 'D').count();
    let kind = if ds == path.len() {
        // Pure cdr chain.
        if ds == 1 {
            InstrKind::Cdr(field)
        } else {
            InstrKind::CdDr(ds - 1, field)
        }
    } else if ds == path.len() - 1 && path[path.len() - 1] == 'A' {
        if ds == 0 {
            InstrKind::Car(field)
        } else {
            InstrKind::CdAr(ds, field)
        }
    } else {
        // Arbitrary mix: expand to elementary accesses.
        let mut out: Vec<Instr> = path
            .iter()
            .map(|c| {
                Instr::new(
                    if *c == 'A' {
                        InstrKind::Car(None)
                    } else {
                        InstrKind::Cdr(None)
                    },
                    span,
                )
            })
            .collect();
        if let Some(last) = out.last_mut() {
            last.name = var_name;
        }
        return out;
    };
    let mut instr = Instr::new(kind, span);
    instr.name = var_name;
    vec![instr]
}

fn mexpr_to_contract_stanzas(e: &MExpr) -> Result<ContractCode> {
    let items = match e {
        MExpr::Seq(items) => items.as_slice(),
        other => return Err(err_parse!("expected contract stanzas, got {}", print_compact(other))),
    };
    let mut parameter = None;
    let mut storage = None;
    let mut code = None;
    for item in items {
        match item {
            MExpr::Prim { name, args, .. } if name == "parameter" => {
                parameter = Some(mexpr_to_type(args.first().ok_or_else(|| {
                    err_parse!("parameter stanza is missing its type")
                })?)?);
            }
            MExpr::Prim { name, args, .. } if name == "storage" => {
                storage = Some(mexpr_to_type(args.first().ok_or_else(|| {
                    err_parse!("storage stanza is missing its type")
                })?)?);
            }
            MExpr::Prim { name, args, .. } if name == "code" => {
                code = Some(mexpr_to_instrs(args.first().ok_or_else(|| {
                    err_parse!("code stanza is missing its body")
                })?)?);
            }
            other => return Err(err_parse!("unexpected stanza {}", print_compact(other))),
        }
    }
    Ok(ContractCode {
        parameter: parameter.ok_or_else(|| err_parse!("missing parameter stanza"))?,
        storage: storage.ok_or_else(|| err_parse!("missing storage stanza"))?,
        code: code.ok_or_else(|| err_parse!("missing code stanza"))?,
    })
}

pub fn mexpr_to_type(e: &MExpr) -> Result<Type> {
    let (name, args) = match e {
        MExpr::Prim { name, args, .. } => (name.as_str(), args.as_slice()),
        other => return Err(err_parse!("expected a type, got {}", print_compact(other))),
    };
    let arg = |i: usize| -> Result<Type> {
        args.get(i)
            .ok_or_else(|| err_parse!("type {} is missing argument {}", name, i))
            .and_then(mexpr_to_type)
    };
    let ty = match name {
        "unit" => Type::Unit,
        "bool" => Type::Bool,
        "int" => Type::Int,
        "nat" => Type::Nat,
        "tez" | "mutez" => Type::Tez,
        "string" => Type::String_,
        "bytes" => Type::Bytes,
        "timestamp" => Type::Timestamp,
        "key" => Type::Key,
        "key_hash" => Type::KeyHash,
        "signature" => Type::Signature,
        "operation" => Type::Operation,
        "address" => Type::Address,
        "pair" => Type::pair(arg(0)?, arg(1)?),
        "option" => Type::option(arg(0)?),
        "or" => Type::or(arg(0)?, arg(1)?),
        "list" => Type::list(arg(0)?),
        "set" => Type::Set(Box::new(arg(0)?)),
        "map" => Type::Map(Box::new(arg(0)?), Box::new(arg(1)?)),
        "big_map" => Type::BigMap(Box::new(arg(0)?), Box::new(arg(1)?)),
        "contract" => Type::Contract(Box::new(arg(0)?)),
        "lambda" => Type::lambda(arg(0)?, arg(1)?),
        other => return Err(err_parse!("unknown type {}", other)),
    };
    Ok(ty)
}

pub fn mexpr_to_const(e: &MExpr, ty: &Type) -> Result<Const> {
    let c = match (e, ty) {
        (MExpr::Int(i), Type::Int) => Const::Int(*i),
        (MExpr::Int(i), Type::Nat) => Const::Nat(*i as u64),
        (MExpr::Int(i), Type::Tez) => Const::Tez(*i as u64),
        (MExpr::Int(i), Type::Timestamp) => Const::Timestamp(*i as i64),
        (MExpr::Str(s), Type::String_) => Const::String(s.clone()),
        (MExpr::Str(s), Type::Key) => Const::Key(s.clone()),
        (MExpr::Str(s), Type::KeyHash) => Const::KeyHash(s.clone()),
        (MExpr::Str(s), Type::Signature) => Const::Signature(s.clone()),
        (MExpr::Str(s), Type::Address) => Const::Address(s.clone()),
        (MExpr::Bytes(b), Type::Bytes) => Const::Bytes(b.clone()),
        (MExpr::Prim { name, .. }, _) if name == "Unit" => Const::Unit,
        (MExpr::Prim { name, .. }, _) if name == "True" => Const::Bool(true),
        (MExpr::Prim { name, .. }, _) if name == "False" => Const::Bool(false),
        (MExpr::Prim { name, .. }, _) if name == "None" => Const::None_,
        (MExpr::Prim { name, args, .. }, Type::Option_(inner)) if name == "Some" => {
            let inner_c = mexpr_to_const(
                args.first().ok_or_else(|| err_parse!("Some is missing its argument"))?,
                inner,
            )?;
            Const::Some_(Box::new(inner_c))
        }
        (MExpr::Prim { name, args, .. }, Type::Or(l, _)) if name == "Left" => Const::Left(Box::new(
            mexpr_to_const(args.first().ok_or_else(|| err_parse!("Left is missing its argument"))?, l)?,
        )),
        (MExpr::Prim { name, args, .. }, Type::Or(_, r)) if name == "Right" => Const::Right(Box::new(
            mexpr_to_const(args.first().ok_or_else(|| err_parse!("Right is missing its argument"))?, r)?,
        )),
        (MExpr::Prim { name, args, .. }, Type::Tuple(items)) if name == "Pair" && items.len() >= 2 => {
            let head = mexpr_to_const(
                args.first().ok_or_else(|| err_parse!("Pair is missing its first component"))?,
                &items[0],
            )?;
            let rest_ty = if items.len() == 2 {
                items[1].clone()
            } else {
                Type::Tuple(items[1..].to_vec())
            };
            let rest = mexpr_to_const(
                args.get(1).ok_or_else(|| err_parse!("Pair is missing its second component"))?,
                &rest_ty,
            )?;
            match rest {
                Const::Tuple(mut tail) if items.len() > 2 => {
                    let mut all = vec![head];
                    all.append(&mut tail);
                    Const::Tuple(all)
                }
                rest => Const::Tuple(vec![head, rest]),
            }
        }
        (MExpr::Seq(items), Type::List(elt)) => {
            let items: Result<Vec<Const>> = items.iter().map(|i| mexpr_to_const(i, elt)).collect();
            Const::List(items?)
        }
        (MExpr::Seq(items), Type::Set(elt)) => {
            let items: Result<Vec<Const>> = items.iter().map(|i| mexpr_to_const(i, elt)).collect();
            Const::Set(items?)
        }
        (MExpr::Seq(items), Type::Map(k, v)) => {
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    MExpr::Prim { name, args, .. } if name == "Elt" && args.len() == 2 => {
                        pairs.push((mexpr_to_const(&args[0], k)?, mexpr_to_const(&args[1], v)?));
                    }
                    other => return Err(err_parse!("expected Elt, got {}", print_compact(other))),
                }
            }
            Const::Map(pairs)
        }
        (other, ty) => {
            return Err(err_parse!("constant {} does not fit type {}", print_compact(other), ty))
        }
    };
    Ok(c)
}

// =============================================================================
// Text printing
// =============================================================================

pub fn print_program(contract: &MContract, compact: bool) -> String {
    let mut out = String::new();
    out.push_str("parameter ");
    out.push_str(&print_compact(&contract.parameter));
    out.push_str(";\nstorage ");
    out.push_str(&print_compact(&contract.storage));
    out.push_str(";\ncode ");
    if compact {
        out.push_str(&print_compact(&contract.code));
    } else {
        out.push_str(&print_indented(&contract.code, 0));
    }
    out.push_str(";\n");
    out
}

pub fn print_compact(e: &MExpr) -> String {
    match e {
        MExpr::Int(i) => i.to_string(),
        MExpr::Str(s) => format!("{:?}", s),
        MExpr::Bytes(b) => {
            let mut s = String::from("0x");
            for byte in b {
                s.push_str(&format!("{:02x}", byte));
            }
            s
        }
        MExpr::Seq(items) => {
            let inner: Vec<String> = items.iter().map(print_compact).collect();
            format!("{{ {} }}", inner.join(" ; "))
        }
        MExpr::Prim { name, args, annots } => {
            let mut parts = vec![name.clone()];
            parts.extend(annots.iter().cloned());
            parts.extend(args.iter().map(|a| {
                let s = print_compact(a);
                if needs_parens(a) {
                    format!("({})", s)
                } else {
                    s
                }
            }));
            parts.join(" ")
        }
    }
}

fn needs_parens(e: &MExpr) -> bool {
    matches!(e, MExpr::Prim { args, annots, .. } if !args.is_empty() || !annots.is_empty())
}

fn print_indented(e: &MExpr, level: usize) -> String {
    let pad = "  ".repeat(level);
    match e {
        MExpr::Seq(items) => {
            if items.is_empty() {
                return "{}".to_string();
            }
            let inner: Vec<String> = items
                .iter()
                .map(|i| format!("{}  {}", pad, print_indented(i, level + 1)))
                .collect();
            format!("{{\n{} ;\n{}}}", inner.join(" ;\n"), pad)
        }
        MExpr::Prim { name, args, annots } if args.iter().any(|a| matches!(a, MExpr::Seq(_))) => {
            let mut parts = vec![name.clone()];
            parts.extend(annots.iter().cloned());
            for a in args {
                match a {
                    MExpr::Seq(_) => parts.push(print_indented(a, level)),
                    other => {
                        let s = print_compact(other);
                        if needs_parens(other) {
                            parts.push(format!("({})", s));
                        } else {
                            parts.push(s);
                        }
                    }
                }
            }
            parts.join(" ")
        }
        other => print_compact(other),
    }
}

// =============================================================================
// JSON
// =============================================================================

pub fn mexpr_to_json(e: &MExpr) -> serde_json::Value {
    use serde_json::{json, Value};
    match e {
        MExpr::Int(i) => json!({ "int": i.to_string() }),
        MExpr::Str(s) => json!({ "string": s }),
        MExpr::Bytes(b) => {
            let mut s = String::new();
            for byte in b {
                s.push_str(&format!("{:02x}", byte));
            }
            json!({ "bytes": s })
        }
        MExpr::Seq(items) => Value::Array(items.iter().map(mexpr_to_json).collect()),
        MExpr::Prim { name, args, annots } => {
            let mut obj = serde_json::Map::new();
            obj.insert("prim".to_string(), Value::String(name.clone()));
            if !args.is_empty() {
                obj.insert(
                    "args".to_string(),
                    Value::Array(args.iter().map(mexpr_to_json).collect()),
                );
            }
            if !annots.is_empty() {
                obj.insert(
                    "annots".to_string(),
                    Value::Array(annots.iter().cloned().map(Value::String).collect()),
                );
            }
            Value::Object(obj)
        }
    }
}

pub fn json_to_mexpr(v: &serde_json::Value) -> Result<MExpr> {
    use serde_json::Value;
    match v {
        Value::Array(items) => {
            let items: Result<Vec<MExpr>> = items.iter().map(json_to_mexpr).collect();
            Ok(MExpr::Seq(items?))
        }
        Value::Object(obj) => {
            if let Some(Value::String(i)) = obj.get("int") {
                let parsed: i128 = i
                    .parse()
                    .map_err(|_| err_parse!("malformed integer literal {}", i))?;
                return Ok(MExpr::Int(parsed));
            }
            if let Some(Value::String(s)) = obj.get("string") {
                return Ok(MExpr::Str(s.clone()));
            }
            if let Some(Value::String(h)) = obj.get("bytes") {
                return Ok(MExpr::Bytes(parse_hex(h)?));
            }
            let name = match obj.get("prim") {
                Some(Value::String(name)) => name.clone(),
                _ => return Err(err_parse!("JSON node without prim/int/string/bytes")),
            };
            let args = match obj.get("args") {
                Some(Value::Array(items)) => {
                    let items: Result<Vec<MExpr>> = items.iter().map(json_to_mexpr).collect();
                    items?
                }
                None => vec![],
                Some(other) => return Err(err_parse!("malformed args: {}", other)),
            };
            let annots = match obj.get("annots") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|a| a.as_str().map(String::from))
                    .collect(),
                None => vec![],
                Some(other) => return Err(err_parse!("malformed annots: {}", other)),
            };
            Ok(MExpr::Prim { name, args, annots })
        }
        other => Err(err_parse!("unexpected JSON node {}", other)),
    }
}

pub fn program_to_json(contract: &MContract) -> serde_json::Value {
    serde_json::Value::Array(vec![
        mexpr_to_json(&MExpr::prim_args("parameter", vec![contract.parameter.clone()])),
        mexpr_to_json(&MExpr::prim_args("storage", vec![contract.storage.clone()])),
        mexpr_to_json(&MExpr::prim_args("code", vec![contract.code.clone()])),
    ])
}

pub fn json_to_program(v: &serde_json::Value) -> Result<MContract> {
    let e = json_to_mexpr(v)?;
    let items = match &e {
        MExpr::Seq(items) => items,
        _ => return Err(err_parse!("expected a program array")),
    };
    let find = |stanza: &str| -> Result<MExpr> {
        items
            .iter()
            .find_map(|i| match i {
                MExpr::Prim { name, args, .. } if name == stanza => args.first().cloned(),
                _ => None,
            })
            .ok_or_else(|| err_parse!("missing {} stanza", stanza))
    };
    Ok(MContract {
        parameter: find("parameter")?,
        storage: find("storage")?,
        code: find("code")?,
    })
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(err_parse!("odd-length byte literal"));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16)
            .map_err(|_| err_parse!("malformed byte literal {}", s))?;
        out.push(byte);
    }
    Ok(out)
}

// =============================================================================
// Text parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LBrace,
    RBrace,
    LParen,
    RParen,
    Semi,
    Word(String),
    Annot(String),
    Int(i128),
    Str(String),
    Bytes(Vec<u8>),
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '#' => {
                // Line comment.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(err_parse!("unterminated string literal"));
                }
                tokens.push(Token::Str(s));
            }
            '@' | '%' | ':' => {
                chars.next();
                let mut s = String::new();
                s.push(c);
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Annot(s));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                if c == '0' && chars.peek() == Some(&'x') {
                    chars.next();
                    let mut hex = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_hexdigit() {
                            hex.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Bytes(parse_hex(&hex)?));
                    continue;
                }
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed: i128 = s.parse().map_err(|_| err_parse!("malformed integer {}", s))?;
                tokens.push(Token::Int(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(s));
            }
            other => return Err(err_parse!("unexpected character {:?}", other)),
        }
    }
    Ok(tokens)
}

struct MParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl MParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, t: &Token) -> Result<()> {
        match self.next() {
            Some(got) if &got == t => Ok(()),
            Some(got) => Err(err_parse!("expected {:?}, got {:?}", t, got)),
            None => Err(err_parse!("unexpected end of input (expected {:?})", t)),
        }
    }

    /// One expression: a sequence, a literal, a parenthesized
    /// application, or a bare primitive (with args when `greedy`).
    fn expr(&mut self, greedy: bool) -> Result<MExpr> {
        match self.next() {
            Some(Token::LBrace) => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::RBrace) => {
                            self.next();
                            break;
                        }
                        None => return Err(err_parse!("unterminated sequence")),
                        _ => {
                            items.push(self.expr(true)?);
                            if let Some(Token::Semi) = self.peek() {
                                self.next();
                            }
                        }
                    }
                }
                Ok(MExpr::Seq(items))
            }
            Some(Token::LParen) => {
                let inner = self.expr(true)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Int(i)) => Ok(MExpr::Int(i)),
            Some(Token::Str(s)) => Ok(MExpr::Str(s)),
            Some(Token::Bytes(b)) => Ok(MExpr::Bytes(b)),
            Some(Token::Word(name)) => {
                let mut annots = Vec::new();
                let mut args = Vec::new();
                while let Some(Token::Annot(a)) = self.peek() {
                    annots.push(a.clone());
                    self.next();
                }
                if greedy {
                    loop {
                        match self.peek() {
                            Some(Token::LBrace) | Some(Token::LParen) | Some(Token::Int(_))
                            | Some(Token::Str(_)) | Some(Token::Bytes(_)) | Some(Token::Word(_)) => {
                                args.push(self.expr(false)?);
                            }
                            _ => break,
                        }
                    }
                }
                Ok(MExpr::Prim { name, args, annots })
            }
            Some(other) => Err(err_parse!("unexpected token {:?}", other)),
            None => Err(err_parse!("unexpected end of input")),
        }
    }
}

/// Parse the textual form of a program: `parameter T; storage T; code I;`.
pub fn parse_program(src: &str) -> Result<MContract> {
    let tokens = tokenize(src)?;
    let mut parser = MParser { tokens, pos: 0 };
    let mut parameter = None;
    let mut storage = None;
    let mut code = None;
    while parser.peek().is_some() {
        match parser.next() {
            Some(Token::Word(w)) if w == "parameter" => {
                parameter = Some(parser.expr(true)?);
                parser.expect(&Token::Semi)?;
            }
            Some(Token::Word(w)) if w == "storage" => {
                storage = Some(parser.expr(true)?);
                parser.expect(&Token::Semi)?;
            }
            Some(Token::Word(w)) if w == "code" => {
                code = Some(parser.expr(true)?);
                if let Some(Token::Semi) = parser.peek() {
                    parser.next();
                }
            }
            Some(other) => return Err(err_parse!("unexpected token {:?}", other)),
            None => break,
        }
    }
    Ok(MContract {
        parameter: parameter.ok_or_else(|| err_parse!("missing parameter stanza"))?,
        storage: storage.ok_or_else(|| err_parse!("missing storage stanza"))?,
        code: code.ok_or_else(|| err_parse!("missing code stanza"))?,
    })
}
