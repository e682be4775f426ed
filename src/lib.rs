//! minidbg — the native debugger core for a didactic register machine.
//!
//! Sits between a debugger front-end and a remote target process running
//! the machine, mediating all inspection and control of the debuggee and
//! mapping source-level queries onto machine-level operations.
//!
//! # Module overview
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`lexer`] — Token stream over assembly and debug-info text.
//! - [`program`] — Registers, operands, instructions, `Program`.
//! - [`asm`] — Assembly parser with per-instruction operand validation.
//! - [`debug_info`] — DIE tree, line mapping, debug-info parser.
//! - [`location`] — Location-expression programs and their interpreter.
//! - [`arch`] — Architecture capability record.
//! - [`types`] — Stop reasons and debug events.
//! - [`process`] — Contract for concrete target-process drivers.
//! - [`remote`] — Line-protocol driver for a TCP-attached target VM.
//! - [`native`] — Breakpoints, watchpoints, stepping, event mapping.
//! - [`source`] — Line mapping queries, variables, types, source steps.

pub mod arch;
pub mod asm;
pub mod debug_info;
pub mod error;
pub mod lexer;
pub mod location;
pub mod native;
pub mod process;
pub mod program;
pub mod remote;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod testvm;
