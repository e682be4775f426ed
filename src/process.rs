//! Contract between native control and a concrete target-process driver.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::StopReason;

/// A debugged target process.
///
/// Implementations drive one concrete machine (for example the TCP-attached
/// reference VM in [`crate::remote`]). Text memory holds instruction text,
/// data memory holds 64-bit signed words. All calls are blocking; `wait`
/// blocks until the process stops and `reason` reports why.
pub trait Process {
    /// `amount` consecutive instructions starting at `address`.
    /// Fails when the range leaves the program text.
    fn read_text(&mut self, address: u64, amount: u64) -> Result<Vec<String>>;

    /// Overwrite instructions starting at `address`.
    /// Fails when the range leaves the program text.
    fn write_text(&mut self, address: u64, data: &[String]) -> Result<()>;

    /// `amount` consecutive data words starting at `address`.
    fn read_memory(&mut self, address: u64, amount: u64) -> Result<Vec<i64>>;

    /// Overwrite data words starting at `address`.
    fn write_memory(&mut self, address: u64, data: &[i64]) -> Result<()>;

    fn fetch_registers(&mut self) -> Result<BTreeMap<String, i64>>;
    fn set_registers(&mut self, regs: &BTreeMap<String, i64>) -> Result<()>;

    fn fetch_float_registers(&mut self) -> Result<BTreeMap<String, f64>>;
    fn set_float_registers(&mut self, regs: &BTreeMap<String, f64>) -> Result<()>;

    /// The debug-register file as an architecture-opaque vector; the
    /// [`crate::arch::Arch`] record knows its layout.
    fn fetch_debug_registers(&mut self) -> Result<Vec<u64>>;
    fn set_debug_registers(&mut self, regs: &[u64]) -> Result<()>;

    /// Resume free-running execution.
    fn resume_execution(&mut self) -> Result<()>;

    /// Execute exactly one instruction.
    fn singlestep(&mut self) -> Result<()>;

    /// Block until the process stops.
    fn wait(&mut self) -> Result<()>;

    /// Why the last wait returned.
    fn reason(&mut self) -> Result<StopReason>;

    /// Number of instructions in the program text.
    fn text_size(&mut self) -> Result<u64>;

    /// End the process. The handle must not be used afterwards.
    fn terminate(&mut self) -> Result<()>;
}
