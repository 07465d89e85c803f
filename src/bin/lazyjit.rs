//! Command-line driver: load modules, run their entry point.
//!
//! Every input (a file, or a directory of sources) is translated to a module
//! and added to the main namespace. The entry point is then looked up and
//! called as `main(argc, argv)` with the first input as `argv[0]`; its
//! return value becomes the exit status.

use clap::Parser;
use lazyjit::frontend::{collect_sources, translate, CommandFrontend, Frontend, IrTextFrontend, IR_EXTENSION};
use lazyjit::{JitError, JitResult, LazyJit};
use std::ffi::{c_char, CString};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Lazily compile and run IR modules", long_about = None)]
struct Cli {
    /// Source files or directories.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Compile threads (0 compiles on the calling thread).
    #[arg(long, default_value_t = 4)]
    num_threads: usize,

    /// Entry point to call.
    #[arg(long, default_value = "main")]
    entry: String,

    /// Compile whole modules on first lookup instead of per function on first call.
    #[arg(long)]
    eager: bool,

    /// External translator for non-IR sources, e.g. "mycc --emit-jir".
    #[arg(long, requires = "source_ext")]
    translator: Option<String>,

    /// Extension of the sources the translator accepts.
    #[arg(long, requires = "translator")]
    source_ext: Option<String>,

    /// Do not resolve symbols from the host process.
    #[arg(long)]
    no_process_symbols: bool,

    /// Print JIT statistics on exit.
    #[arg(long)]
    stats: bool,

    /// Arguments passed to the program.
    #[arg(last = true)]
    program_args: Vec<String>,
}

type EntryFn = extern "C" fn(i32, *const *const c_char) -> i64;

fn frontends(cli: &Cli) -> JitResult<Vec<Box<dyn Frontend>>> {
    let mut frontends: Vec<Box<dyn Frontend>> = vec![Box::new(IrTextFrontend)];
    if let (Some(command), Some(ext)) = (&cli.translator, &cli.source_ext) {
        let frontend = CommandFrontend::from_command_line(command, ext.as_str()).ok_or_else(|| {
            JitError::Io {
                path: command.clone(),
                message: "empty translator command".to_string(),
            }
        })?;
        frontends.push(Box::new(frontend));
    }
    Ok(frontends)
}

fn c_string(arg: &str) -> JitResult<CString> {
    CString::new(arg).map_err(|e| JitError::Io {
        path: arg.to_string(),
        message: e.to_string(),
    })
}

fn run(cli: &Cli) -> JitResult<i32> {
    let frontends = frontends(cli)?;
    let mut extensions = vec![IR_EXTENSION];
    if let Some(ext) = &cli.source_ext {
        extensions.push(ext.trim_start_matches('.'));
    }
    let sources = collect_sources(&cli.inputs, &extensions)?;
    if sources.is_empty() {
        return Err(JitError::Io {
            path: cli.inputs[0].display().to_string(),
            message: "no sources found".to_string(),
        });
    }

    let jit = LazyJit::builder()
        .num_threads(cli.num_threads)
        .lazy(!cli.eager)
        .process_symbols(!cli.no_process_symbols)
        .build()?;

    for source in &sources {
        let module = translate(&frontends, source)?;
        jit.add_module(module)?;
    }

    let entry = jit.lookup(&cli.entry)?;
    log::info!("calling `{}` at {}", cli.entry, entry);

    let mut args = vec![c_string(&sources[0].display().to_string())?];
    for arg in &cli.program_args {
        args.push(c_string(arg)?);
    }
    let mut argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: the entry was compiled for the host ABI with this signature.
    let main: EntryFn = unsafe { std::mem::transmute(entry.0 as usize) };
    let status = main(args.len() as i32, argv.as_ptr());

    if cli.stats {
        eprint!("{}", jit.stats());
    }
    jit.shutdown()?;
    Ok(status as i32)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
