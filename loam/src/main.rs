use clap::{Parser, Subcommand, ValueEnum};
use loam_core::ast::ContractDecl;
use loam_core::{emit, Config, Protocol};
use log::info;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Times the execution of a closure and prints the elapsed time if verbose.
fn time<T, F: FnOnce() -> T>(name: &str, verbose: bool, f: F) -> T {
    let start = Instant::now();
    let result = f();
    if verbose {
        let elapsed = start.elapsed().as_millis();
        eprintln!("{}: {}ms", name, elapsed);
    }
    result
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ProtocolArg {
    #[default]
    Mainnet,
    Zeronet,
    Alphanet,
}

impl From<ProtocolArg> for Protocol {
    fn from(p: ProtocolArg) -> Protocol {
        match p {
            ProtocolArg::Mainnet => Protocol::Mainnet,
            ProtocolArg::Zeronet => Protocol::Zeronet,
            ProtocolArg::Alphanet => Protocol::Alphanet,
        }
    }
}

#[derive(Parser)]
#[command(name = "loam")]
#[command(about = "Compiler between the loam contract language and stack-machine assembly", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a contract AST (JSON from the parser frontend) to assembly
    Compile {
        /// Input AST file (.liq.json)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file (defaults to input name with .tz or .tz.json)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Contract to compile when the input declares several
        #[arg(long, value_name = "NAME")]
        main: Option<String>,

        /// Disable the peephole simplifier
        #[arg(long)]
        no_peephole: bool,

        /// Stop after typechecking
        #[arg(long)]
        type_only: bool,

        /// Stop after reading the AST
        #[arg(long)]
        parse_only: bool,

        /// Emit structured JSON instead of text
        #[arg(long)]
        json: bool,

        /// Single-line textual output
        #[arg(long)]
        compact: bool,

        /// Target protocol
        #[arg(long, default_value = "mainnet")]
        protocol: ProtocolArg,

        /// Print verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Decompile an assembly file (.tz or .tz.json) back to a contract AST
    Decompile {
        /// Input assembly file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file (defaults to input name with .liq.json appended)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Target protocol
        #[arg(long, default_value = "mainnet")]
        protocol: ProtocolArg,

        /// Print verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    CompilationError(#[from] loam_core::error::CompilerError),

    #[error("malformed AST input: {0}")]
    AstError(#[from] serde_json::Error),

    #[error("{0}")]
    InputError(String),
}

fn main() -> Result<(), DriverError> {
    env_logger::init();
    let cli = Cli::parse_from(args_with_default_command());

    match cli.command {
        Commands::Compile {
            input,
            output,
            main,
            no_peephole,
            type_only,
            parse_only,
            json,
            compact,
            protocol,
            verbose,
        } => {
            let config = Config {
                verbosity: u8::from(verbose),
                json,
                compact,
                peephole: !no_peephole,
                protocol: protocol.into(),
            };
            compile_file(input, output, main, type_only, parse_only, config, verbose)
        }
        Commands::Decompile {
            input,
            output,
            protocol: _,
            verbose,
        } => decompile_file(input, output, verbose),
    }
}

/// Infer the command from the input extension when none is given:
/// `.liq`/`.liq.json` inputs compile, `.tz`/`.tz.json`/`.json` inputs
/// decompile.
fn args_with_default_command() -> Vec<OsString> {
    let args: Vec<OsString> = std::env::args_os().collect();
    let known = ["compile", "decompile", "help", "--help", "-h", "--version", "-V"];
    if let Some(first) = args.get(1) {
        let s = first.to_string_lossy();
        if !known.contains(&s.as_ref()) && !s.starts_with('-') {
            let command: OsString = if s.ends_with(".tz") || s.ends_with(".tz.json") {
                "decompile".into()
            } else {
                "compile".into()
            };
            let mut with_default = vec![args[0].clone(), command];
            with_default.extend(args[1..].iter().cloned());
            return with_default;
        }
    }
    args
}

fn compile_file(
    input: PathBuf,
    output: Option<PathBuf>,
    main: Option<String>,
    type_only: bool,
    parse_only: bool,
    config: Config,
    verbose: bool,
) -> Result<(), DriverError> {
    if verbose {
        info!("Compiling {}...", input.display());
    }

    let source = fs::read_to_string(&input)?;
    let decl = time("read_ast", verbose, || select_contract(&source, main.as_deref()))?;
    if parse_only {
        info!("{} parsed", decl.name);
        return Ok(());
    }

    let checked = time("typecheck", verbose, || loam_core::Compiler::check(&decl))?;
    checked.print_warnings();
    if type_only {
        info!("{} typechecks", decl.name);
        return Ok(());
    }

    let encoded = time("encode", verbose, || checked.encode())?;
    let generated = time("generate", verbose, || encoded.simplify().generate())?;
    let emitted = time("finalize", verbose, || {
        generated.finalize(&config).emit()
    })?;

    // Main artifact.
    let output_path = output.unwrap_or_else(|| artifact_path(&input, &config));
    write_program(&emitted.program, &output_path, &config)?;
    if verbose {
        info!("Wrote {}", output_path.display());
    }

    // Initial storage artifacts: `.initializer` when computed,
    // `.init` when constant.
    if let Some(initializer) = &emitted.initializer {
        let path = sibling_path(&output_path, ".initializer");
        write_program(initializer, &path, &config)?;
        if verbose {
            info!("Wrote {}", path.display());
        }
    }
    if let Some(constant) = &emitted.init_constant {
        let path = sibling_path(&output_path, ".init");
        let rendered = if config.json {
            serde_json::to_string_pretty(&emit::mexpr_to_json(constant))
                .expect("serializing JSON values cannot fail")
        } else {
            emit::print_compact(constant)
        };
        fs::write(&path, rendered + "\n")?;
        if verbose {
            info!("Wrote {}", path.display());
        }
    }

    Ok(())
}

fn decompile_file(
    input: PathBuf,
    output: Option<PathBuf>,
    verbose: bool,
) -> Result<(), DriverError> {
    if verbose {
        info!("Decompiling {}...", input.display());
    }

    let source = fs::read_to_string(&input)?;
    let program = if input.extension().map(|e| e == "json").unwrap_or(false) {
        let value: serde_json::Value = serde_json::from_str(&source)?;
        emit::json_to_program(&value)?
    } else {
        emit::parse_program(&source)?
    };

    // One retry with annotations ignored: conflicting @names are a
    // recoverable defect of the input, not of the structure.
    let decl = match time("decompile", verbose, || {
        loam_core::decompile_program(&program, false)
    }) {
        Ok(decl) => decl,
        Err(err) if err.is_annotation_conflict() => {
            if verbose {
                info!("annotation conflict, retrying with annotations ignored");
            }
            loam_core::decompile_program(&program, true)?
        }
        Err(err) => return Err(err.into()),
    };

    let output_path = output.unwrap_or_else(|| {
        let mut name = input.as_os_str().to_os_string();
        name.push(".liq.json");
        PathBuf::from(name)
    });
    let rendered = serde_json::to_string_pretty(&decl)?;
    fs::write(&output_path, rendered + "\n")?;
    if verbose {
        info!("Wrote {} (render with the surface printer)", output_path.display());
    }
    Ok(())
}

/// Read one contract declaration from the frontend JSON, honoring
/// `--main` when the file holds several.
fn select_contract(source: &str, main: Option<&str>) -> Result<ContractDecl, DriverError> {
    if let Ok(decl) = serde_json::from_str::<ContractDecl>(source) {
        return match main {
            Some(name) if decl.name != name => Err(DriverError::InputError(format!(
                "contract {} not found in input",
                name
            ))),
            _ => Ok(decl),
        };
    }
    let decls: Vec<ContractDecl> = serde_json::from_str(source)?;
    match main {
        Some(name) => decls
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DriverError::InputError(format!("contract {} not found in input", name))),
        None => decls
            .into_iter()
            .last()
            .ok_or_else(|| DriverError::InputError("input declares no contracts".to_string())),
    }
}

fn artifact_path(input: &Path, config: &Config) -> PathBuf {
    // foo.liq.json -> foo.tz / foo.tz.json
    let stem = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem
        .strip_suffix(".liq.json")
        .or_else(|| stem.strip_suffix(".json"))
        .or_else(|| stem.strip_suffix(".liq"))
        .unwrap_or(&stem);
    let name = if config.json {
        format!("{}.tz.json", base)
    } else {
        format!("{}.tz", base)
    };
    input.with_file_name(name)
}

/// `foo.tz` + ".init" -> `foo.init.tz` (and likewise for `.tz.json`).
fn sibling_path(output: &Path, tag: &str) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = if let Some(base) = name.strip_suffix(".tz.json") {
        format!("{}{}.tz.json", base, tag)
    } else if let Some(base) = name.strip_suffix(".tz") {
        format!("{}{}.tz", base, tag)
    } else {
        format!("{}{}", name, tag)
    };
    output.with_file_name(renamed)
}

fn write_program(
    program: &loam_core::asm::MContract,
    path: &Path,
    config: &Config,
) -> Result<(), DriverError> {
    let rendered = if config.json {
        serde_json::to_string_pretty(&emit::program_to_json(program))
            .expect("serializing JSON values cannot fail")
    } else {
        emit::print_program(program, config.compact)
    };
    fs::write(path, rendered)?;
    Ok(())
}
