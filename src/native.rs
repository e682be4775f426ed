//! Native control over the debugged process.
//!
//! Owns the process handle for the debuggee's lifetime, plus the software
//! breakpoint and hardware watchpoint tables. Keeps up the illusion that
//! user code runs untouched while trap opcodes sit in the instruction
//! stream: reads substitute the saved instruction back in, writes through
//! a trapped address update the saved copy instead of the visible text.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::process::Process;
use crate::remote::{RemoteProcess, TcpMessenger};
use crate::types::{BreakpointType, DebugEvent, StopReason, WatchpointKind};

/// A software breakpoint: the instruction the trap replaced, and whether
/// the trap is currently installed.
///
/// While `enabled` holds, the debuggee's text at the keyed address is the
/// architecture's trap opcode and `saved_opcode` is what was there before.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareBreakpoint {
    pub saved_opcode: String,
    pub enabled: bool,
}

/// A hardware watchpoint occupying one debug-register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub kind: WatchpointKind,
    pub debug_register: usize,
}

/// The native debugging session.
pub struct Native {
    process: Box<dyn Process>,
    arch: Arch,
    software_breakpoints: BTreeMap<u64, SoftwareBreakpoint>,
    watchpoints: BTreeMap<u64, Watchpoint>,
    /// Written only by `continue_execution` when a step-over swallowed a
    /// non-singlestep event; drained only by the next `wait_for_debug_event`.
    cached_event: Option<DebugEvent>,
}

impl Native {
    pub fn new(process: Box<dyn Process>, arch: Arch) -> Self {
        Native {
            process,
            arch,
            software_breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            cached_event: None,
        }
    }

    /// Connect to a target VM listening on localhost.
    ///
    /// The register counts must match the machine configuration; the driver
    /// supplies the architecture record.
    pub fn connect(port: u16, gp_register_count: u64, float_register_count: u64) -> Result<Self> {
        let messenger = TcpMessenger::connect(("127.0.0.1", port))?;
        let process = RemoteProcess::new(messenger, gp_register_count, float_register_count);
        let arch = process.arch();
        Ok(Native::new(Box::new(process), arch))
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    // ── Breakpoints ────────────────────────────────────────────────

    /// Create and enable a breakpoint. Setting twice fails.
    pub fn set_breakpoint(&mut self, address: u64) -> Result<()> {
        if self.software_breakpoints.contains_key(&address) {
            return Err(Error::Debugger(format!(
                "breakpoint at {} is already set",
                address
            )));
        }
        let bp = self.create_software_breakpoint(address)?;
        info!("breakpoint set at {}", address);
        self.software_breakpoints.insert(address, bp);
        Ok(())
    }

    /// Disable and forget the breakpoint at `address`.
    pub fn unset_breakpoint(&mut self, address: u64) -> Result<()> {
        self.disable_breakpoint(address)?;
        self.software_breakpoints.remove(&address);
        Ok(())
    }

    /// Re-install the trap for a disabled breakpoint. Enabling an enabled
    /// breakpoint is a no-op; enabling a missing one fails.
    pub fn enable_breakpoint(&mut self, address: u64) -> Result<()> {
        let bp = self
            .software_breakpoints
            .get(&address)
            .ok_or_else(|| Error::Debugger(format!("no breakpoint at address {}", address)))?;
        if !bp.enabled {
            let fresh = self.create_software_breakpoint(address)?;
            self.software_breakpoints.insert(address, fresh);
        }
        Ok(())
    }

    /// Restore the saved instruction but keep the table entry. Disabling a
    /// disabled breakpoint is a no-op; disabling a missing one fails.
    pub fn disable_breakpoint(&mut self, address: u64) -> Result<()> {
        let bp = self
            .software_breakpoints
            .get(&address)
            .ok_or_else(|| Error::Debugger(format!("no breakpoint at address {}", address)))?;
        if bp.enabled {
            let saved = bp.saved_opcode.clone();
            self.process.write_text(address, &[saved])?;
            self.software_breakpoints
                .get_mut(&address)
                .expect("entry checked above")
                .enabled = false;
        }
        Ok(())
    }

    pub fn breakpoints(&self) -> &BTreeMap<u64, SoftwareBreakpoint> {
        &self.software_breakpoints
    }

    /// Install the trap opcode at `address` and verify it took.
    ///
    /// Either the opcode is installed and the record returned, or the
    /// debuggee text is left as it was.
    fn create_software_breakpoint(&mut self, address: u64) -> Result<SoftwareBreakpoint> {
        let opcode = self.arch.trap_opcode;
        let backup = self
            .process
            .read_text(address, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Debugger("empty text read".into()))?;

        self.process.write_text(address, &[opcode.to_string()])?;

        let readback = self
            .process
            .read_text(address, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Debugger("empty text read".into()))?;
        if readback != opcode {
            return Err(Error::Debugger(format!(
                "failed to set breakpoint! expected opcode '{}', got '{}'",
                opcode, readback
            )));
        }

        Ok(SoftwareBreakpoint {
            saved_opcode: backup,
            enabled: true,
        })
    }

    // ── Text memory ────────────────────────────────────────────────

    /// Read instructions the way the program sees them: addresses holding
    /// an enabled trap report the saved instruction instead.
    pub fn read_text(&mut self, address: u64, amount: u64) -> Result<Vec<String>> {
        let text_size = self.text_size()?;
        if address + amount > text_size {
            return Err(Error::Debugger(format!(
                "reading text at range {}-{}, but text size is {}",
                address,
                address + amount,
                text_size
            )));
        }
        let mut text = self.process.read_text(address, amount)?;
        for (i, line) in text.iter_mut().enumerate() {
            if let Some(bp) = self.software_breakpoints.get(&(address + i as u64)) {
                if bp.enabled {
                    *line = bp.saved_opcode.clone();
                }
            }
        }
        Ok(text)
    }

    /// Write instructions, preserving enabled traps: a write through a
    /// trapped address lands in the breakpoint's saved copy.
    pub fn write_text(&mut self, address: u64, text: &[String]) -> Result<()> {
        let text_size = self.text_size()?;
        if address + text.len() as u64 > text_size {
            return Err(Error::Debugger(format!(
                "writing text at range {}-{}, but text size is {}",
                address,
                address + text.len() as u64,
                text_size
            )));
        }
        let mut outgoing = Vec::with_capacity(text.len());
        for (i, line) in text.iter().enumerate() {
            let addr = address + i as u64;
            match self.software_breakpoints.get_mut(&addr) {
                Some(bp) if bp.enabled => {
                    bp.saved_opcode = line.clone();
                    outgoing.push(self.arch.trap_opcode.to_string());
                }
                _ => outgoing.push(line.clone()),
            }
        }
        self.process.write_text(address, &outgoing)
    }

    pub fn text_size(&mut self) -> Result<u64> {
        self.process.text_size()
    }

    // ── Stepping and execution control ─────────────────────────────

    /// Execute one instruction, honoring a breakpoint at the current IP.
    pub fn single_step(&mut self) -> Result<DebugEvent> {
        if !self.arch.hardware_single_step {
            return Err(Error::Debugger(
                "singlestep is not supported for the current architecture".into(),
            ));
        }
        let ip = self.ip()?;
        match self.software_breakpoints.get(&ip) {
            Some(bp) if bp.enabled => self.step_over_breakpoint(ip),
            _ => self.raw_single_step(),
        }
    }

    /// Hardware step without any breakpoint bookkeeping.
    pub fn raw_single_step(&mut self) -> Result<DebugEvent> {
        self.process.singlestep()?;
        self.wait_for_debug_event()
    }

    /// One hardware step with the breakpoint at `ip` temporarily removed.
    fn step_over_breakpoint(&mut self, ip: u64) -> Result<DebugEvent> {
        self.disable_breakpoint(ip)?;
        let event = self.single_step()?;
        self.enable_breakpoint(ip)?;
        Ok(event)
    }

    /// Step one instruction, treating a call as one step.
    ///
    /// When the current instruction calls into a function, a transient
    /// breakpoint on the return address lets the whole call run; hitting
    /// any other breakpoint inside the call surfaces that event instead.
    /// `skip_bp` steps over a breakpoint sitting on the current address.
    pub fn step_over(&mut self, skip_bp: bool) -> Result<DebugEvent> {
        if !self.arch.hardware_single_step {
            return Err(Error::Debugger(
                "singlestep is not supported for the current architecture".into(),
            ));
        }
        let ip = self.ip()?;
        let text = self
            .read_text(ip, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Debugger("empty text read".into()))?;
        if !self.arch.is_call(&text) {
            return if skip_bp {
                self.single_step()
            } else {
                self.raw_single_step()
            };
        }

        let return_addr = ip + 1;
        let bp_exists = self.software_breakpoints.contains_key(&return_addr);
        if !bp_exists {
            self.set_breakpoint(return_addr)?;
        }
        if skip_bp {
            // Get off a breakpoint on the call itself before resuming.
            self.single_step()?;
        }
        self.continue_execution()?;
        let event = self.wait_for_debug_event()?;
        if !bp_exists {
            self.unset_breakpoint(return_addr)?;
        }
        if self.ip()? != return_addr {
            // Some other breakpoint fired inside the call.
            Ok(event)
        } else {
            Ok(DebugEvent::Singlestep)
        }
    }

    /// Resume the process.
    ///
    /// A breakpoint on the current IP is first stepped over; if that step
    /// reports anything except a plain singlestep the event is cached for
    /// the next `wait_for_debug_event` and the process stays stopped.
    pub fn continue_execution(&mut self) -> Result<()> {
        let ip = self.ip()?;
        match self.software_breakpoints.get(&ip) {
            Some(bp) if bp.enabled => {
                let event = self.step_over_breakpoint(ip)?;
                if event != DebugEvent::Singlestep {
                    self.cached_event = Some(event);
                    return Ok(());
                }
                self.process.resume_execution()
            }
            _ => self.process.resume_execution(),
        }
    }

    /// Block until the process reports a stop, then map it to an event.
    ///
    /// A cached event is drained without touching the process; IP is only
    /// moved back onto the trapped instruction when the event is freshly
    /// mapped (the wait that produced a cached event already adjusted it).
    pub fn wait_for_debug_event(&mut self) -> Result<DebugEvent> {
        if let Some(event) = self.cached_event.take() {
            return Ok(event);
        }
        self.process.wait()?;
        let reason = self.process.reason()?;
        let event = self.map_reason_to_event(reason)?;
        if let DebugEvent::BreakpointHit { address, .. } = event {
            let mut regs = self.registers()?;
            regs.insert(self.arch.ip_name.to_string(), address as i64);
            self.set_registers(&regs)?;
        }
        Ok(event)
    }

    fn map_reason_to_event(&mut self, reason: StopReason) -> Result<DebugEvent> {
        match reason {
            StopReason::SoftwareBreakpointHit => Ok(DebugEvent::BreakpointHit {
                kind: BreakpointType::Software,
                // The trap has already executed; report the slot it sits in.
                address: self.ip()? - 1,
            }),
            StopReason::HardwareBreak => {
                let dregs = self.process.fetch_debug_registers()?;
                let slot = self.arch.responsible_register(&dregs)?;
                let (&address, wp) = self
                    .watchpoints
                    .iter()
                    .find(|(_, w)| w.debug_register == slot)
                    .ok_or_else(|| {
                        Error::Debugger(format!("no watchpoint occupies debug register {}", slot))
                    })?;
                Ok(DebugEvent::WatchpointTrigger {
                    kind: wp.kind,
                    address,
                })
            }
            StopReason::Singlestep => Ok(DebugEvent::Singlestep),
            StopReason::ExecutionBegin => Ok(DebugEvent::ExecutionBegin),
            StopReason::ExecutionEnd => Ok(DebugEvent::ExecutionEnd),
        }
    }

    pub fn terminate(&mut self) -> Result<()> {
        self.process.terminate()
    }

    // ── Watchpoints ────────────────────────────────────────────────

    /// Arm a write watchpoint on a data address, taking the lowest free
    /// debug-register slot.
    pub fn set_watchpoint_write(&mut self, address: u64) -> Result<()> {
        if !self.arch.hardware_watchpoints {
            return Err(Error::Debugger(
                "this architecture does not support watchpoints".into(),
            ));
        }
        if self.watchpoints.contains_key(&address) {
            return Err(Error::Debugger(
                "a watchpoint is already set on that address".into(),
            ));
        }
        let slot = self.free_debug_register().ok_or_else(|| {
            Error::Debugger("maximum amount of watchpoints has been set".into())
        })?;

        let mut dregs = self.process.fetch_debug_registers()?;
        self.arch.set_debug_register(slot, address, &mut dregs)?;
        self.arch.activate_debug_register(slot, &mut dregs)?;
        self.process.set_debug_registers(&dregs)?;

        info!("watchpoint set at {} in debug register {}", address, slot);
        self.watchpoints.insert(
            address,
            Watchpoint {
                kind: WatchpointKind::Write,
                debug_register: slot,
            },
        );
        Ok(())
    }

    /// Disarm and forget the watchpoint on `address`.
    pub fn remove_watchpoint(&mut self, address: u64) -> Result<()> {
        let wp = self
            .watchpoints
            .get(&address)
            .copied()
            .ok_or_else(|| Error::Debugger(format!("no watchpoint at address {}", address)))?;

        let mut dregs = self.process.fetch_debug_registers()?;
        self.arch
            .deactivate_debug_register(wp.debug_register, &mut dregs)?;
        self.process.set_debug_registers(&dregs)?;
        self.watchpoints.remove(&address);
        Ok(())
    }

    pub fn watchpoints(&self) -> &BTreeMap<u64, Watchpoint> {
        &self.watchpoints
    }

    /// Lowest debug-register slot no watchpoint occupies.
    fn free_debug_register(&self) -> Option<usize> {
        (0..self.arch.debug_register_count)
            .find(|slot| !self.watchpoints.values().any(|w| w.debug_register == *slot))
    }

    // ── Registers ──────────────────────────────────────────────────

    pub fn registers(&mut self) -> Result<BTreeMap<String, i64>> {
        self.process.fetch_registers()
    }

    pub fn set_registers(&mut self, regs: &BTreeMap<String, i64>) -> Result<()> {
        self.process.set_registers(regs)
    }

    /// One register by name. Fetching the whole map is cheaper when more
    /// than one value is needed.
    pub fn get_register(&mut self, name: &str) -> Result<i64> {
        let regs = self.process.fetch_registers()?;
        regs.get(name)
            .copied()
            .ok_or_else(|| Error::Debugger(format!("no register '{}' in target", name)))
    }

    /// Read-modify-write of one register through the full map.
    pub fn set_register(&mut self, name: &str, value: i64) -> Result<()> {
        let mut regs = self.process.fetch_registers()?;
        if !regs.contains_key(name) {
            return Err(Error::Debugger(format!("unknown register name '{}'", name)));
        }
        debug!("setting register {} to {}", name, value);
        regs.insert(name.to_string(), value);
        self.process.set_registers(&regs)
    }

    pub fn float_registers(&mut self) -> Result<BTreeMap<String, f64>> {
        self.process.fetch_float_registers()
    }

    pub fn set_float_registers(&mut self, regs: &BTreeMap<String, f64>) -> Result<()> {
        self.process.set_float_registers(regs)
    }

    pub fn get_float_register(&mut self, name: &str) -> Result<f64> {
        let regs = self.process.fetch_float_registers()?;
        regs.get(name)
            .copied()
            .ok_or_else(|| Error::Debugger(format!("'{}' is not a float register", name)))
    }

    pub fn set_float_register(&mut self, name: &str, value: f64) -> Result<()> {
        let mut regs = self.process.fetch_float_registers()?;
        if !regs.contains_key(name) {
            return Err(Error::Debugger(format!(
                "'{}' is not a float register",
                name
            )));
        }
        regs.insert(name.to_string(), value);
        self.process.set_float_registers(&regs)
    }

    /// Current instruction pointer via the architecture's canonical name.
    pub fn ip(&mut self) -> Result<u64> {
        Ok(self.get_register(self.arch.ip_name)? as u64)
    }

    // ── Data memory ────────────────────────────────────────────────

    pub fn read_memory(&mut self, address: u64, amount: u64) -> Result<Vec<i64>> {
        self.process.read_memory(address, amount)
    }

    pub fn write_memory(&mut self, address: u64, values: &[i64]) -> Result<()> {
        self.process.write_memory(address, values)
    }
}
