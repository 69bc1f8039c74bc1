// File: src/main.rs
//
// CLI entry point (spec.md §6): no path -> REPL; a path -> compile and run
// that file; anything else -> usage message on stderr, exit 64. Exit codes
// mirror the spec's taxonomy: 0 success, 64 usage, 65 compile error, 70
// runtime error, 74 I/O error.

mod builtins;
mod chunk;
mod compiler;
mod errors;
mod lexer;
mod memory;
mod module;
mod repl;
mod table;
mod value;
mod vm;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use vm::{InterpretResult, Vm};

#[derive(Parser)]
#[command(name = "ruff", version = env!("CARGO_PKG_VERSION"), about = "Ruff: a class-based scripting language")]
struct Cli {
    /// Script to run. Omit to start the REPL.
    path: Option<PathBuf>,

    /// Print GC stats (bytes allocated, next threshold) after the program exits.
    #[arg(long)]
    gc_stats: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.path {
        None => run_repl(),
        Some(path) => run_file(&path, cli.gc_stats),
    }
}

fn run_repl() -> ExitCode {
    match repl::Repl::new() {
        Ok(mut repl) => match repl.run() {
            Ok(()) => ExitCode::from(0),
            Err(e) => {
                eprintln!("REPL error: {}", e);
                ExitCode::from(74)
            }
        },
        Err(e) => {
            eprintln!("Failed to start REPL: {}", e);
            ExitCode::from(74)
        }
    }
}

fn run_file(path: &std::path::Path, gc_stats: bool) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot open '{}': {}", path.display(), e);
            return ExitCode::from(74);
        }
    };

    let base_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    let mut vm = Vm::new();
    let result = vm.interpret_file(&source, &base_dir);

    if gc_stats {
        eprintln!(
            "[gc] bytes_allocated={} next_gc={}",
            vm.bytes_allocated.get(),
            vm.next_gc.get()
        );
    }

    match result {
        InterpretResult::Ok => ExitCode::from(0),
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}
