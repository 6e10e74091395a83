//! Lexer and single-pass parser for MiniScript (components C6 + the
//! lexer half of §6's external interfaces).
//!
//! This crate turns source text into a flat `Vec<miniscript_core::Line>` —
//! three-address code the `miniscript_runtime::Machine` can execute
//! directly. It has no notion of execution itself; a host can compile once
//! and run the result on any number of machines.

pub mod lexer;
pub mod parser;
pub mod token;

pub use lexer::Lexer;
pub use parser::{ParseOutcome, Parser};
pub use token::{Token, TokenType};
