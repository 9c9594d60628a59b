///
/// gvjit CLI - demo host for the execution engine
///
/// Builds small programs in memory and runs them through the engine:
/// - gvjit answer: call a nullary function returning 42
/// - gvjit add <a> <b>: call add(i32, i32) through a synthesized stub
/// - gvjit entry <argc>: call a main-like entry point directly
/// - gvjit recompile: change a function's body and relink its callers
///

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gvjit::ir::{Constant, Expr, Stmt};
use gvjit::{EngineConfig, GenericValue, JitEngine, Module, NativePatcher, Signature, Type};

#[derive(Parser)]
#[command(name = "gvjit")]
#[command(author, version, about = "A lazy just-in-time execution engine", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call answer() -> i32
    Answer,

    /// Call add(a, b) -> i32 with boxed arguments
    Add {
        a: i32,
        b: i32,
    },

    /// Call entry(argc, argv, envp) -> i32 through the direct entry path
    Entry {
        argc: i32,
    },

    /// Compile version() -> i32, change its body, recompile and call the
    /// old entry point again
    Recompile,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };

    let result = match cli.command {
        Commands::Answer => run_answer(config),
        Commands::Add { a, b } => run_add(config, a, b),
        Commands::Entry { argc } => run_entry(config, argc),
        Commands::Recompile => run_recompile(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gvjit={}", level)));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();
}

fn run_answer(config: EngineConfig) -> gvjit::Result<()> {
    let mut module = Module::new("answer");
    let answer = module.define_function(
        "answer",
        Signature::new(&[], Type::I32),
        vec![Stmt::Return(Some(Expr::i32(42)))],
    );

    let engine = JitEngine::new(module, config)?;
    let result = engine.invoke(answer, &[])?;
    println!("answer() = {:?}", result);
    Ok(())
}

fn run_add(config: EngineConfig, a: i32, b: i32) -> gvjit::Result<()> {
    let mut module = Module::new("add");
    let add = module.define_function(
        "add",
        Signature::new(&[Type::I32, Type::I32], Type::I32),
        vec![Stmt::Return(Some(Expr::add(Expr::param(0), Expr::param(1))))],
    );

    let engine = JitEngine::new(module, config)?;
    let result = engine.invoke(add, &[GenericValue::I32(a), GenericValue::I32(b)])?;
    println!("add({}, {}) = {:?}", a, b, result);
    Ok(())
}

fn run_entry(config: EngineConfig, argc: i32) -> gvjit::Result<()> {
    let mut module = Module::new("entry");
    let bias = module.define_global("bias", Type::I32, Some(Constant::int(Type::I32, 1)));
    let twice = module.define_function(
        "twice",
        Signature::new(&[Type::I32], Type::I32),
        vec![Stmt::Return(Some(Expr::mul(Expr::param(0), Expr::i32(2))))],
    );
    let entry = module.define_function(
        "entry",
        Signature::new(&[Type::I32, Type::Ptr, Type::Ptr], Type::I32),
        vec![Stmt::Return(Some(Expr::add(
            Expr::call(twice, vec![Expr::param(0)]),
            Expr::load(Type::I32, Expr::GlobalAddr(bias)),
        )))],
    );

    let engine = JitEngine::new(module, config)?;
    let null = GenericValue::ptr(std::ptr::null::<u8>());
    let result = engine.invoke(entry, &[GenericValue::I32(argc), null, null])?;
    println!("entry({}) = {:?}", argc, result);
    Ok(())
}

fn run_recompile(config: EngineConfig) -> gvjit::Result<()> {
    if !NativePatcher::is_supported() {
        println!(
            "code patching is not available on {}-{}",
            std::env::consts::ARCH,
            std::env::consts::OS
        );
        return Ok(());
    }

    let mut module = Module::new("recompile");
    let base = module.define_global("base", Type::I32, Some(Constant::int(Type::I32, 0)));
    let body = |bump: i32| {
        vec![Stmt::Return(Some(Expr::add(
            Expr::load(Type::I32, Expr::GlobalAddr(base)),
            Expr::i32(bump),
        )))]
    };
    let version = module.define_function("version", Signature::new(&[], Type::I32), body(1));

    let engine = JitEngine::new(module, config)?;
    let old = engine.ensure_compiled(version)?;
    println!("version() = {:?}", engine.invoke(version, &[])?);

    engine
        .module_mut()
        .replace_body(version, body(2))?;
    let new = engine.recompile(version)?;

    let through_old: extern "C" fn() -> i32 = unsafe { std::mem::transmute(old.as_ptr()) };
    println!("recompiled {:?} -> {:?}", old, new);
    println!("version() via old entry = {}", through_old());
    println!("version() = {:?}", engine.invoke(version, &[])?);
    Ok(())
}
