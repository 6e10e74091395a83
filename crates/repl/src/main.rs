//! miniscript - CLI driver and REPL for the MiniScript language
//!
//! Usage:
//!   miniscript                 # start an interactive REPL
//!   miniscript prog.ms         # run a file
//!   miniscript --selftest      # run the built-in end-to-end test battery
//!
//! The REPL accepts multi-line input (an unclosed `if`/`while`/`for`/
//! `function` block continues onto the next prompt) and the `:quit`/`exit`
//! pseudo-commands. Errors print as `[line N] message`.

mod selftest;

use std::path::PathBuf;

use clap::Parser as ClapParser;
use miniscript_compiler::Parser;
use miniscript_core::Error;
use miniscript_runtime::{Machine, MachineLimits, StdoutIo};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(ClapParser)]
#[command(name = "miniscript")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interpreter and REPL for the MiniScript language", long_about = None)]
struct Cli {
    /// MiniScript source file to run; omit to start a REPL
    file: Option<PathBuf>,

    /// Run the built-in end-to-end test battery instead of a file/REPL
    #[arg(long)]
    selftest: bool,

    /// Maximum `__isa` prototype-chain length before a key error (§3/§9)
    #[arg(long)]
    isa_chain_limit: Option<usize>,

    /// Maximum string length in UTF-8 scalar values
    #[arg(long)]
    max_string_len: Option<usize>,

    /// Maximum list length
    #[arg(long)]
    max_list_len: Option<usize>,

    /// Maximum map length
    #[arg(long)]
    max_map_len: Option<usize>,

    /// Maximum pending call arguments before `TooManyArguments`
    #[arg(long)]
    max_pending_arguments: Option<usize>,

    /// Maximum `Line`s executed per host `run()` call before yielding
    #[arg(long)]
    step_budget: Option<usize>,
}

impl Cli {
    fn limits(&self) -> MachineLimits {
        let mut limits = MachineLimits::default();
        if let Some(v) = self.isa_chain_limit {
            limits.isa_chain_limit = v;
        }
        if let Some(v) = self.max_string_len {
            limits.max_string_len = v;
        }
        if let Some(v) = self.max_list_len {
            limits.max_list_len = v;
        }
        if let Some(v) = self.max_map_len {
            limits.max_map_len = v;
        }
        if let Some(v) = self.max_pending_arguments {
            limits.max_pending_arguments = v;
        }
        if let Some(v) = self.step_budget {
            limits.step_budget_per_run = v;
        }
        limits
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.selftest {
        let (passed, failed) = selftest::run();
        println!("{passed} passed, {failed} failed");
        std::process::exit(if failed == 0 { 0 } else { 1 });
    }

    let limits = cli.limits();
    let result = match &cli.file {
        Some(path) => run_file(path, limits),
        None => run_repl(limits),
    };

    if let Err(e) = result {
        eprintln!("{}", format_error(&e));
        std::process::exit(1);
    }
}

fn format_error(e: &Error) -> String {
    match e.location() {
        Some(loc) => format!("[line {}] {}", loc.line_num + 1, e.message()),
        None => format!("{}: {}", e.kind(), e.message()),
    }
}

fn run_file(path: &std::path::Path, limits: MachineLimits) -> Result<(), Error> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Error::runtime(format!("cannot read {}: {e}", path.display())))?;
    let context_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("<script>");
    let outcome = Parser::parse_source(&source, context_name)?;
    if outcome.incomplete {
        return Err(match outcome.unmatched {
            Some((keyword, line)) => Error::compile(format!("'{keyword}' does not have a matching 'end {keyword}'"))
                .with_location_if_missing(miniscript_core::Location::new(context_name.to_string(), line)),
            None => Error::compile("unexpected end of file"),
        });
    }
    let mut machine = Machine::new(limits);
    machine.set_io(Box::new(StdoutIo));
    machine.run_code(outcome.lines)
}

/// Multi-line, history-aware REPL. Input accumulates across prompts while a
/// block (`if`/`while`/`for`/`function`) is open, detected via the Parser's
/// `incomplete` flag exactly as the lexer's `last_token`/`trim_comment`
/// helpers are intended to support.
fn run_repl(limits: MachineLimits) -> Result<(), Error> {
    let mut machine = Machine::new(limits);
    machine.set_io(Box::new(StdoutIo));

    let mut rl = DefaultEditor::new().map_err(|e| Error::runtime(format!("readline init failed: {e}")))?;
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "> " } else { ">>> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if pending.is_empty() && (trimmed == ":quit" || trimmed == "exit") {
                    break;
                }
                let _ = rl.add_history_entry(&line);
                if !pending.is_empty() {
                    pending.push('\n');
                }
                pending.push_str(&line);

                match Parser::parse_source(&pending, "<repl>") {
                    Ok(outcome) if outcome.incomplete => continue,
                    Ok(outcome) => {
                        pending.clear();
                        if let Err(e) = machine.run_code(outcome.lines) {
                            eprintln!("{}", format_error(&e));
                        }
                    }
                    Err(e) => {
                        pending.clear();
                        eprintln!("{}", format_error(&e));
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                pending.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(Error::runtime(format!("readline error: {e}"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unclosed_block_names_the_opener_in_file_mode() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        write!(file, "for i in range(3)\n  print i\n").expect("write temp file");
        let err = run_file(file.path(), MachineLimits::default()).unwrap_err();
        assert_eq!(*err.kind(), miniscript_core::ErrorKind::Compile);
        assert!(err.message().contains("'for'"), "message was: {}", err.message());
        assert!(err.message().contains("end for"), "message was: {}", err.message());
    }
}
