//! Core event types shared between the process drivers and native control.

/// Raw stop cause reported by the target process after a wait.
///
/// This is what the driver can observe; [`DebugEvent`] is the enriched
/// form produced by native control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The machine executed the trap opcode.
    SoftwareBreakpointHit,
    /// A hardware debug register fired.
    HardwareBreak,
    /// A single instruction was executed in step mode.
    Singlestep,
    /// The machine stopped before executing its first instruction.
    ExecutionBegin,
    /// The machine halted.
    ExecutionEnd,
}

/// Breakpoint flavor attached to a hit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointType {
    Software,
    Hardware,
}

/// Access kind a watchpoint fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Read,
    Write,
}

/// A stop event as reported to the debugger front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    /// A breakpoint fired; `address` is the instruction the trap replaced.
    BreakpointHit {
        kind: BreakpointType,
        address: u64,
    },
    /// A watchpoint fired; `address` is the watched data address.
    WatchpointTrigger {
        kind: WatchpointKind,
        address: u64,
    },
    Singlestep,
    ExecutionBegin,
    ExecutionEnd,
}
