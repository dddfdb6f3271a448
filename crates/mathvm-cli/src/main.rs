//! MathVM command-line driver.
//!
//! Modes: `-p` prints the parsed program back as source, `-t` translates and
//! disassembles, `-i` interprets, `-j` (the default) JIT-compiles and runs.
//! Without a script argument a built-in sample program is used. Translation
//! errors are reported as `line,col: message` and exit non-zero.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use mathvm_engine::compiler::{self, CompileError};
use mathvm_engine::parser::{print_ast, Parser as AstParser};
use mathvm_engine::vm::StackMachine;

/// The program run when no script is given.
const DEFAULT_PROGRAM: &str = "double x; double y;\
                               x += 8.0; y = 2.0;\
                               print('Hello, x=',x,' y=',y,'\\n');";

#[derive(Parser)]
#[command(name = "mathvm")]
#[command(about = "MathVM: translate, interpret, or JIT-compile MathVM programs")]
#[command(version)]
struct Cli {
    /// Print the program back from its AST
    #[arg(short = 'p', long = "print-ast")]
    print_ast: bool,

    /// Translate and disassemble the bytecode
    #[arg(short = 't', long = "translate")]
    translate: bool,

    /// Execute with the interpreter
    #[arg(short = 'i', long = "interpret")]
    interpret: bool,

    /// Execute with the JIT (the default)
    #[arg(short = 'j', long = "jit")]
    jit: bool,

    /// Script to run; a built-in sample program is used when omitted
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match &cli.script {
        Some(path) => {
            match std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read file: {}", path.display()))
            {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("{}", err);
                    return ExitCode::FAILURE;
                }
            }
        }
        None => DEFAULT_PROGRAM.to_string(),
    };

    match run(&cli, &source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, source: &str) -> anyhow::Result<()> {
    if cli.print_ast {
        let ast = AstParser::new(source)
            .map_err(|e| translation_error(source, &CompileError::Lex(e)))?
            .parse()
            .map_err(|e| translation_error(source, &CompileError::Parse(e)))?;
        print!("{}", print_ast(&ast));
        return Ok(());
    }

    let code = compiler::compile(source).map_err(|e| translation_error(source, &e))?;

    if cli.translate {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        compiler::disassemble(&code, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    // -j beats -i when both are given.
    if cli.interpret && !cli.jit {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        StackMachine::new(&mut out).execute(&code)?;
        out.flush()?;
        return Ok(());
    }

    let program = mathvm_engine::jit::build_program(&code)?;
    program.run();
    Ok(())
}

/// Format a pipeline error as `line,col: message`.
fn translation_error(source: &str, err: &CompileError) -> anyhow::Error {
    match err.pos() {
        Some(pos) => {
            let (line, col) = position_to_line_col(source, pos);
            anyhow::anyhow!("{},{}: {}", line, col, err)
        }
        None => anyhow::anyhow!("{}", err),
    }
}

/// 1-based line and column of a byte offset.
fn position_to_line_col(source: &str, pos: u32) -> (u32, u32) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i as u32 >= pos {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
