//! Peephole simplification and tail-fail finalization.
//!
//! Peephole rules operate on windowed subsequences and run to fixpoint:
//! pushing a pure constant and immediately dropping it vanishes, a
//! duplicated top immediately cleaned vanishes, adjacent protected
//! blocks of the same depth merge, double swaps cancel, adjacent
//! cleanups coalesce, and the pair-unpack triple `DUP; DIP { CDR };
//! CAR` fuses into the UNPAIR macro.
//!
//! Finalization enforces the tail-fail property: FAILWITH poisons the
//! stack type, so no instruction may follow a failing instruction in
//! its sequence. `end_fails` is inductive: FAILWITH fails; a sequence
//! fails if its last element does; an IF-family form fails if both arms
//! do; a DIP fails if its body does.

use crate::asm::{ContractCode, Instr, InstrKind};

/// Run the peephole rules over a whole instruction tree to fixpoint.
pub fn peephole(code: Vec<Instr>) -> Vec<Instr> {
    let mut code = code;
    loop {
        let (next, fused) = fuse_unpair(code);
        let (next, rewrote) = pass(next);
        code = next;
        if !fused && !rewrote {
            return code;
        }
    }
}

/// Fuse the three-instruction pair unpack into UNPAIR. The triple is
/// sound anywhere a pair sits on top, not just in the entry prelude:
/// `DUP; DIP { CDR }; CAR` leaves the car above the cdr and consumes
/// the pair, which is exactly the macro's contract. Annotations on the
/// inner CDR and the CAR become the value names; an annotated DUP (a
/// variable access, not an unpack) blocks the fusion.
fn fuse_unpair(code: Vec<Instr>) -> (Vec<Instr>, bool) {
    let mut changed = false;
    let code: Vec<Instr> = code
        .into_iter()
        .map(|i| {
            let (kind, child_changed) = map_sub_seqs(i.kind, &mut fuse_unpair);
            changed |= child_changed;
            Instr {
                kind,
                span: i.span,
                name: i.name,
            }
        })
        .collect();

    let mut out: Vec<Instr> = Vec::with_capacity(code.len());
    let mut idx = 0;
    while idx < code.len() {
        if idx + 2 < code.len() {
            let window = (&code[idx], &code[idx + 1], &code[idx + 2]);
            if let (
                Instr {
                    kind: InstrKind::Dup(1),
                    name: None,
                    span,
                },
                Instr {
                    kind: InstrKind::Dip(1, body),
                    name: None,
                    ..
                },
                Instr {
                    kind: InstrKind::Car(None),
                    name: car_name,
                    ..
                },
            ) = window
            {
                if let [Instr {
                    kind: InstrKind::Cdr(None),
                    name: cdr_name,
                    ..
                }] = body.as_slice()
                {
                    out.push(Instr {
                        kind: InstrKind::Unpair(car_name.clone(), cdr_name.clone()),
                        span: *span,
                        name: None,
                    });
                    changed = true;
                    idx += 3;
                    continue;
                }
            }
        }
        out.push(code[idx].clone());
        idx += 1;
    }
    (out, changed)
}

/// Apply peephole and tail-fail finalization to a contract.
pub fn finalize_contract(mut contract: ContractCode, peephole_enabled: bool) -> ContractCode {
    if peephole_enabled {
        contract.code = peephole(contract.code);
    }
    contract.code = finalize(contract.code);
    contract
}

fn pass(code: Vec<Instr>) -> (Vec<Instr>, bool) {
    let mut changed = false;

    // Children first, so windows see already-simplified bodies.
    let code: Vec<Instr> = code
        .into_iter()
        .map(|i| {
            let (kind, child_changed) = map_sub_seqs(i.kind, &mut |seq| {
                let (new, c) = pass(seq);
                (new, c)
            });
            if child_changed {
                changed = true;
            }
            Instr {
                kind,
                span: i.span,
                name: i.name,
            }
        })
        .collect();

    let mut out: Vec<Instr> = Vec::with_capacity(code.len());
    let mut iter = code.into_iter().peekable();
    while let Some(instr) = iter.next() {
        let next_kind = iter.peek().map(|n| &n.kind);
        match (&instr.kind, next_kind) {
            // PUSH k; DROP  (k pure)
            (k, Some(InstrKind::Drop)) if pushes_pure_value(k) => {
                iter.next();
                changed = true;
            }
            // DUP 1; DIP_DROP(1,1) is a no-op
            (InstrKind::Dup(1), Some(InstrKind::DipDrop(1, 1))) => {
                iter.next();
                changed = true;
            }
            // DUP 1; SWAP == DUP 1
            (InstrKind::Dup(1), Some(InstrKind::Swap)) => {
                iter.next();
                out.push(instr);
                changed = true;
            }
            // SWAP; SWAP cancels
            (InstrKind::Swap, Some(InstrKind::Swap)) => {
                iter.next();
                changed = true;
            }
            // Unannotated CDR followed by another access folds into the
            // combined macro form.
            (InstrKind::Cdr(None), Some(next)) if instr.name.is_none() && cdr_fuses(next) => {
                let second = iter.next().expect("peeked");
                let kind = match second.kind {
                    InstrKind::Car(label) => InstrKind::CdAr(1, label),
                    InstrKind::Cdr(label) => InstrKind::CdDr(1, label),
                    InstrKind::CdAr(n, label) => InstrKind::CdAr(n + 1, label),
                    InstrKind::CdDr(n, label) => InstrKind::CdDr(n + 1, label),
                    _ => unreachable!("cdr_fuses filters the rest"),
                };
                out.push(Instr {
                    kind,
                    span: instr.span,
                    name: second.name,
                });
                changed = true;
            }
            _ => {
                // DIP(n, a); DIP(n, b) == DIP(n, a ++ b)
                if let InstrKind::Dip(n, _) = &instr.kind {
                    if let Some(Instr {
                        kind: InstrKind::Dip(m, _),
                        ..
                    }) = iter.peek()
                    {
                        if n == m {
                            let second = iter.next().expect("peeked");
                            let (n, mut a) = match instr.kind {
                                InstrKind::Dip(n, a) => (n, a),
                                _ => unreachable!(),
                            };
                            let b = match second.kind {
                                InstrKind::Dip(_, b) => b,
                                _ => unreachable!(),
                            };
                            a.extend(b);
                            out.push(Instr {
                                kind: InstrKind::Dip(n, a),
                                span: instr.span,
                                name: second.name.or(instr.name),
                            });
                            changed = true;
                            continue;
                        }
                    }
                }
                // DIP_DROP(1,a); DIP_DROP(1,b) == DIP_DROP(1,a+b)
                if let InstrKind::DipDrop(1, a) = instr.kind {
                    if let Some(Instr {
                        kind: InstrKind::DipDrop(1, b),
                        ..
                    }) = iter.peek()
                    {
                        let b = *b;
                        let second = iter.next().expect("peeked");
                        out.push(Instr {
                            kind: InstrKind::DipDrop(1, a + b),
                            span: instr.span,
                            name: second.name.or(instr.name),
                        });
                        changed = true;
                        continue;
                    }
                }
                out.push(instr);
            }
        }
    }
    (out, changed)
}

fn cdr_fuses(kind: &InstrKind) -> bool {
    matches!(
        kind,
        InstrKind::Car(_) | InstrKind::Cdr(_) | InstrKind::CdAr(_, _) | InstrKind::CdDr(_, _)
    )
}

/// Whether an instruction pushes one value with no other stack or chain
/// effect, making `it; DROP` dead.
fn pushes_pure_value(kind: &InstrKind) -> bool {
    matches!(
        kind,
        InstrKind::Push(_, _)
            | InstrKind::Unit
            | InstrKind::Nil(_)
            | InstrKind::None_(_)
            | InstrKind::EmptySet(_)
            | InstrKind::EmptyMap(_, _)
            | InstrKind::Dup(_)
            | InstrKind::Lambda(_, _, _)
    )
}

// =============================================================================
// Tail-fail finalization
// =============================================================================

/// Whether executing this instruction never falls through to the next.
pub fn end_fails(instr: &Instr) -> bool {
    match &instr.kind {
        InstrKind::Failwith => true,
        InstrKind::If(a, b)
        | InstrKind::IfNone(a, b)
        | InstrKind::IfLeft(a, b)
        | InstrKind::IfCons(a, b) => seq_fails(a) && seq_fails(b),
        InstrKind::Dip(_, body) => seq_fails(body),
        _ => false,
    }
}

pub fn seq_fails(seq: &[Instr]) -> bool {
    seq.last().map(end_fails).unwrap_or(false)
}

/// Truncate every sequence at its first failing instruction, recursing
/// into nested sequences first.
pub fn finalize(code: Vec<Instr>) -> Vec<Instr> {
    let mut out = Vec::with_capacity(code.len());
    for instr in code {
        let (kind, _) = map_sub_seqs(instr.kind, &mut |seq| (finalize(seq), false));
        let instr = Instr {
            kind,
            span: instr.span,
            name: instr.name,
        };
        let fails = end_fails(&instr);
        out.push(instr);
        if fails {
            break;
        }
    }
    out
}

/// Apply `f` to every nested instruction sequence of a kind, returning
/// the rebuilt kind and whether any sequence changed.
fn map_sub_seqs<F>(kind: InstrKind, f: &mut F) -> (InstrKind, bool)
where
    F: FnMut(Vec<Instr>) -> (Vec<Instr>, bool),
{
    let mut changed = false;
    let mut apply = |seq: Vec<Instr>| -> Vec<Instr> {
        let (new, c) = f(seq);
        changed |= c;
        new
    };
    let kind = match kind {
        InstrKind::Dip(n, body) => InstrKind::Dip(n, apply(body)),
        InstrKind::If(a, b) => InstrKind::If(apply(a), apply(b)),
        InstrKind::IfNone(a, b) => InstrKind::IfNone(apply(a), apply(b)),
        InstrKind::IfLeft(a, b) => InstrKind::IfLeft(apply(a), apply(b)),
        InstrKind::IfCons(a, b) => InstrKind::IfCons(apply(a), apply(b)),
        InstrKind::Loop(body) => InstrKind::Loop(apply(body)),
        InstrKind::LoopLeft(body) => InstrKind::LoopLeft(apply(body)),
        InstrKind::Iter(body) => InstrKind::Iter(apply(body)),
        InstrKind::MapI(body) => InstrKind::MapI(apply(body)),
        InstrKind::Lambda(a, r, body) => InstrKind::Lambda(a, r, apply(body)),
        InstrKind::CreateContract(mut code) => {
            code.code = apply(code.code);
            InstrKind::CreateContract(code)
        }
        other => other,
    };
    (kind, changed)
}
