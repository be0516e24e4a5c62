//! Core library for the loam contract compiler.
//!
//! The compile pipeline turns an untyped surface AST (handed over by
//! the external parser frontend) into a wire-format stack program; the
//! decompile pipeline reverses it for audit.

pub mod asm;
pub mod ast;
pub mod error;
pub mod tir;
pub mod types;

pub mod checker;
pub mod codegen;
pub mod decompile;
pub mod emit;
pub mod encode;
pub mod interp;
pub mod peephole;
pub mod simplify;

#[cfg(test)]
mod checker_tests;
#[cfg(test)]
mod codegen_tests;
#[cfg(test)]
mod decompile_tests;
#[cfg(test)]
mod emit_tests;
#[cfg(test)]
mod encode_tests;
#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod peephole_tests;
#[cfg(test)]
mod simplify_tests;

use std::marker::PhantomData;

use asm::{ContractCode, MContract, MExpr};
use ast::{ContractDecl, NodeCounter};
use error::Result;
use log::debug;

// =============================================================================
// Generic ID allocation
// =============================================================================

/// Generic counter for generating unique IDs.
///
/// The ID type must implement `From<u32>` to convert the raw counter
/// value.
#[derive(Debug, Clone)]
pub struct IdSource<Id> {
    next_id: u32,
    _phantom: PhantomData<Id>,
}

impl<Id: From<u32>> IdSource<Id> {
    pub fn new() -> Self {
        IdSource {
            next_id: 0,
            _phantom: PhantomData,
        }
    }

    pub fn next_id(&mut self) -> Id {
        let id = Id::from(self.next_id);
        self.next_id += 1;
        id
    }
}

impl<Id: From<u32>> Default for IdSource<Id> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Target network dialect. The instruction set is shared; the selector
/// exists so the driver can refuse contracts declaring an incompatible
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Mainnet,
    Zeronet,
    Alphanet,
}

/// Per-invocation configuration, threaded by value through the
/// pipeline. There is no process-global state.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbosity: u8,
    /// Emit the structured JSON form instead of text.
    pub json: bool,
    /// Single-line text output.
    pub compact: bool,
    pub peephole: bool,
    pub protocol: Protocol,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            json: false,
            compact: false,
            peephole: true,
            protocol: Protocol::default(),
        }
    }
}

// =============================================================================
// Compile pipeline (typestate)
// =============================================================================
//
// Each stage consumes `self` and returns the next stage:
//   Compiler::check(&decl)?          -> Checked
//     -> .encode()?                  -> Encoded
//       -> .simplify()               -> Simplified
//         -> .generate()?            -> Generated
//           -> .finalize(&config)    -> Finalized
//             -> .emit()?            -> Emitted

pub struct Compiler;

impl Compiler {
    /// Typecheck a surface contract declaration.
    pub fn check(decl: &ContractDecl) -> Result<Checked> {
        let env = checker::TypeChecker::build_env(decl)?;
        let mut chk = checker::TypeChecker::new(&env);
        let contract = chk.check_contract(decl)?;
        let warnings = chk.warnings().to_vec();
        Ok(Checked {
            env,
            contract,
            warnings,
        })
    }
}

/// Contract has been typechecked.
pub struct Checked {
    pub env: types::Env,
    pub contract: tir::Contract,
    pub warnings: Vec<checker::TypeWarning>,
}

impl Checked {
    pub fn print_warnings(&self) {
        for warning in &self.warnings {
            eprintln!("Warning: {} at {}", warning.message(), warning.span());
        }
    }

    /// Encode to the canonical single-entry shape.
    pub fn encode(self) -> Result<Encoded> {
        let mut nc = NodeCounter::new();
        let program = encode::encode_contract(&self.env, &self.contract, &mut nc)?;
        Ok(Encoded {
            env: self.env,
            program,
            nc,
        })
    }
}

/// Contract has been encoded (records/variants binarized, entry
/// dispatch synthesized, closures converted).
pub struct Encoded {
    pub env: types::Env,
    pub program: encode::EncodedProgram,
    nc: NodeCounter,
}

impl Encoded {
    /// One-use inlining and dead-binding elimination.
    pub fn simplify(self) -> Simplified {
        let program = simplify::simplify_program(self.program);
        Simplified {
            env: self.env,
            program,
            nc: self.nc,
        }
    }
}

/// Contract has been simplified.
pub struct Simplified {
    pub env: types::Env,
    pub program: encode::EncodedProgram,
    nc: NodeCounter,
}

impl Simplified {
    /// Generate the symbolic stack code.
    pub fn generate(mut self) -> Result<Generated> {
        let code = codegen::generate(&self.env, &self.program, &mut self.nc)?;
        let initializer = codegen::generate_initializer(&self.env, &self.program, &mut self.nc)?;
        let init_constant = match &self.program.initializer {
            Some(encode::EncodedInit::Constant(c)) => Some(c.clone()),
            _ => None,
        };
        Ok(Generated {
            entry_names: self.program.entry_names.clone(),
            code,
            initializer,
            init_constant,
        })
    }
}

/// Symbolic stack code has been generated.
pub struct Generated {
    pub entry_names: Vec<String>,
    pub code: ContractCode,
    pub initializer: Option<ContractCode>,
    pub init_constant: Option<types::Const>,
}

impl Generated {
    /// Peephole (when enabled) and tail-fail finalization.
    pub fn finalize(self, config: &Config) -> Finalized {
        let code = peephole::finalize_contract(self.code, config.peephole);
        let initializer = self
            .initializer
            .map(|c| peephole::finalize_contract(c, config.peephole));
        Finalized {
            entry_names: self.entry_names,
            code,
            initializer,
            init_constant: self.init_constant,
        }
    }
}

/// Code has been finalized; no instruction follows a failing tail.
pub struct Finalized {
    pub entry_names: Vec<String>,
    pub code: ContractCode,
    pub initializer: Option<ContractCode>,
    pub init_constant: Option<types::Const>,
}

impl Finalized {
    /// Convert to the wire syntax tree.
    pub fn emit(self) -> Result<Emitted> {
        let program = emit::contract_to_mexpr(&self.code, &self.entry_names)?;
        let initializer = match &self.initializer {
            Some(init) => Some(emit::contract_to_mexpr(init, &[])?),
            None => None,
        };
        let init_constant = match &self.init_constant {
            Some(c) => Some(emit::const_to_mexpr(c)?),
            None => None,
        };
        Ok(Emitted {
            program,
            initializer,
            init_constant,
        })
    }
}

/// Final stage: wire syntax trees ready for printing.
pub struct Emitted {
    pub program: MContract,
    /// Initializer contract, when the initial storage is computed.
    pub initializer: Option<MContract>,
    /// Initial storage value, when it is a compile-time constant.
    pub init_constant: Option<MExpr>,
}

/// Run the whole compile pipeline.
pub fn compile_contract(decl: &ContractDecl, config: &Config) -> Result<Emitted> {
    let checked = Compiler::check(decl)?;
    if config.verbosity > 0 {
        checked.print_warnings();
        debug!("typechecked {}", decl.name);
    }
    let encoded = checked.encode()?;
    if config.verbosity > 0 {
        debug!("encoded: parameter {}", encoded.program.parameter);
    }
    let generated = encoded.simplify().generate()?;
    if config.verbosity > 1 {
        debug!("generated {} instructions", generated.code.code.len());
    }
    generated.finalize(config).emit()
}

// =============================================================================
// Decompile pipeline
// =============================================================================

/// Decompile a wire contract into a surface declaration, validating the
/// result with the typechecker in decompiling mode. `ignore_annots`
/// discards `@` variable annotations (the driver's retry path after an
/// `AnnotationConflict`).
pub fn decompile_program(
    contract: &MContract,
    ignore_annots: bool,
) -> Result<ContractDecl> {
    let mut nc = NodeCounter::new();
    let decl = decompile::decompile_contract(&mut nc, contract, ignore_annots)?;
    // Validation pass: the reconstruction must typecheck.
    let env = checker::TypeChecker::build_env(&decl)?;
    let mut chk = checker::TypeChecker::decompiling(&env);
    chk.check_contract(&decl)?;
    Ok(decl)
}
