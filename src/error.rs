//! Error types used throughout the crate.
//!
//! Provides a unified [`Error`] enum covering lexing and parsing failures
//! (with source locations), debugger-level failures, location-expression
//! interpretation failures, and transport I/O. All fallible functions
//! return [`Result<T>`].

use thiserror::Error;

/// Unified error type for all minidbg operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The lexer rejected the input text.
    #[error("lex error at {row}:{col}: {msg}")]
    Lex { row: usize, col: usize, msg: String },

    /// A parser (assembly or debug info) rejected the token stream.
    #[error("parse error at {row}:{col}: {msg}")]
    Parse { row: usize, col: usize, msg: String },

    /// Native control or source layer error. The process stays alive.
    #[error("debugger error: {0}")]
    Debugger(String),

    /// Location-expression interpretation error.
    #[error("location error: {0}")]
    Interpret(String),

    /// Transport I/O error when talking to the target process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
