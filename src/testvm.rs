//! In-memory target machine for the test suite.
//!
//! Stands in for a live VM behind the wire protocol: it executes the
//! instruction subset the tests exercise, traps on `BKPT`, honors the
//! debug-register watchpoint slots, and reports stop reasons the way the
//! real machine does. Unsupported instructions panic so a test never
//! silently runs past them.

use std::collections::BTreeMap;

use crate::arch::Arch;
use crate::asm::Parser;
use crate::error::{Error, Result};
use crate::native::Native;
use crate::process::Process;
use crate::program::{Instruction, Operand, Register};
use crate::types::StopReason;

const GP_COUNT: u64 = 8;
const FLOAT_COUNT: u64 = 4;
const DATA_SIZE: usize = 1024;

enum Outcome {
    Normal,
    Stop(StopReason),
}

pub(crate) struct TestVm {
    text: Vec<Instruction>,
    data: Vec<i64>,
    regs: BTreeMap<String, i64>,
    fregs: BTreeMap<String, f64>,
    dregs: Vec<u64>,
    reason: StopReason,
}

impl TestVm {
    pub fn new(program: &str) -> Self {
        let program = Parser::new(program)
            .and_then(|p| p.parse())
            .expect("test program must parse");
        let mut data = program.data;
        data.resize(DATA_SIZE, 0);

        let mut regs = BTreeMap::new();
        for i in 0..GP_COUNT {
            regs.insert(format!("R{}", i), 0);
        }
        regs.insert("IP".into(), 0);
        regs.insert("BP".into(), 0);
        regs.insert("SP".into(), DATA_SIZE as i64);
        regs.insert("FLAGS".into(), 0);

        let mut fregs = BTreeMap::new();
        for i in 0..FLOAT_COUNT {
            fregs.insert(format!("F{}", i), 0.0);
        }

        TestVm {
            text: program.instructions,
            data,
            regs,
            fregs,
            dregs: vec![0; Arch::t86().debug_register_file_len()],
            reason: StopReason::ExecutionBegin,
        }
    }

    fn reg(&self, reg: Register) -> i64 {
        self.regs[&reg.to_string()]
    }

    fn set_reg(&mut self, reg: Register, value: i64) {
        self.regs.insert(reg.to_string(), value);
    }

    fn ip(&self) -> i64 {
        self.regs["IP"]
    }

    fn set_ip(&mut self, value: i64) {
        self.regs.insert("IP".into(), value);
    }

    fn value(&self, op: Operand) -> i64 {
        match op {
            Operand::Imm(n) => n,
            Operand::Register(r) => self.reg(r),
            Operand::MemImm(a) => self.data[a as usize],
            Operand::MemRegister(r) => self.data[self.reg(r) as usize],
            Operand::MemRegisterImm(r, i) => self.data[(self.reg(r) + i) as usize],
            other => panic!("operand form {} not supported by the test vm", other),
        }
    }

    /// Write a data word, reporting a hardware break when an armed
    /// debug-register slot watches the address.
    fn store(&mut self, addr: i64, value: i64) -> Option<StopReason> {
        let addr = addr as usize;
        self.data[addr] = value;
        let control = self.dregs[4];
        for slot in 0..4 {
            if control & (1 << slot) != 0 && self.dregs[slot] == addr as u64 {
                self.dregs[4] |= 1 << (8 + slot);
                return Some(StopReason::HardwareBreak);
            }
        }
        None
    }

    fn write_operand(&mut self, op: Operand, value: i64) -> Option<StopReason> {
        match op {
            Operand::Register(r) => {
                self.set_reg(r, value);
                None
            }
            Operand::MemImm(a) => self.store(a, value),
            Operand::MemRegister(r) => self.store(self.reg(r), value),
            Operand::MemRegisterImm(r, i) => self.store(self.reg(r) + i, value),
            other => panic!("destination form {} not supported by the test vm", other),
        }
    }

    fn step(&mut self) -> Outcome {
        let ip = self.ip();
        if ip < 0 || ip as usize >= self.text.len() {
            return Outcome::Stop(StopReason::ExecutionEnd);
        }
        let ins = self.text[ip as usize].clone();
        self.set_ip(ip + 1);

        let stop = match ins {
            Instruction::Bkpt => return Outcome::Stop(StopReason::SoftwareBreakpointHit),
            Instruction::Halt => return Outcome::Stop(StopReason::ExecutionEnd),
            Instruction::Nop => None,
            Instruction::Mov(dst, src) => {
                let v = self.value(src);
                self.write_operand(dst, v)
            }
            Instruction::Add(r, src) => {
                let v = self.reg(r) + self.value(src);
                self.set_reg(r, v);
                None
            }
            Instruction::Sub(r, src) => {
                let v = self.reg(r) - self.value(src);
                self.set_reg(r, v);
                None
            }
            Instruction::Push(src) => {
                let sp = self.regs["SP"] - 1;
                self.regs.insert("SP".into(), sp);
                let v = self.value(src);
                self.store(sp, v)
            }
            Instruction::Pop(r) => {
                let sp = self.regs["SP"];
                let v = self.data[sp as usize];
                self.regs.insert("SP".into(), sp + 1);
                self.set_reg(r, v);
                None
            }
            Instruction::Call(target) => {
                let ret = self.ip();
                let sp = self.regs["SP"] - 1;
                self.regs.insert("SP".into(), sp);
                let stop = self.store(sp, ret);
                let t = self.value(target);
                self.set_ip(t);
                stop
            }
            Instruction::Ret => {
                let sp = self.regs["SP"];
                let ret = self.data[sp as usize];
                self.regs.insert("SP".into(), sp + 1);
                self.set_ip(ret);
                None
            }
            Instruction::Jmp(target) => {
                let t = self.value(target);
                self.set_ip(t);
                None
            }
            other => panic!("instruction {} not supported by the test vm", other),
        };
        match stop {
            Some(reason) => Outcome::Stop(reason),
            None => Outcome::Normal,
        }
    }

    /// Clear the watchpoint status bits before running.
    fn clear_debug_status(&mut self) {
        self.dregs[4] &= 0xFF;
    }
}

impl Process for TestVm {
    fn read_text(&mut self, address: u64, amount: u64) -> Result<Vec<String>> {
        let end = address + amount;
        if end > self.text.len() as u64 {
            return Err(Error::Debugger("text read out of bounds".into()));
        }
        Ok(self.text[address as usize..end as usize]
            .iter()
            .map(Instruction::to_string)
            .collect())
    }

    fn write_text(&mut self, address: u64, data: &[String]) -> Result<()> {
        let end = address + data.len() as u64;
        if end > self.text.len() as u64 {
            return Err(Error::Debugger("text write out of bounds".into()));
        }
        for (i, line) in data.iter().enumerate() {
            self.text[address as usize + i] = Parser::parse_instruction_line(line)?;
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u64, amount: u64) -> Result<Vec<i64>> {
        let end = address + amount;
        if end > self.data.len() as u64 {
            return Err(Error::Debugger("data read out of bounds".into()));
        }
        Ok(self.data[address as usize..end as usize].to_vec())
    }

    fn write_memory(&mut self, address: u64, data: &[i64]) -> Result<()> {
        let end = address + data.len() as u64;
        if end > self.data.len() as u64 {
            return Err(Error::Debugger("data write out of bounds".into()));
        }
        self.data[address as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn fetch_registers(&mut self) -> Result<BTreeMap<String, i64>> {
        Ok(self.regs.clone())
    }

    fn set_registers(&mut self, regs: &BTreeMap<String, i64>) -> Result<()> {
        for (name, value) in regs {
            if !self.regs.contains_key(name) {
                return Err(Error::Debugger(format!(
                    "register name '{}' is not valid",
                    name
                )));
            }
            self.regs.insert(name.clone(), *value);
        }
        Ok(())
    }

    fn fetch_float_registers(&mut self) -> Result<BTreeMap<String, f64>> {
        Ok(self.fregs.clone())
    }

    fn set_float_registers(&mut self, regs: &BTreeMap<String, f64>) -> Result<()> {
        for (name, value) in regs {
            if !self.fregs.contains_key(name) {
                return Err(Error::Debugger(format!(
                    "register name '{}' is not valid",
                    name
                )));
            }
            self.fregs.insert(name.clone(), *value);
        }
        Ok(())
    }

    fn fetch_debug_registers(&mut self) -> Result<Vec<u64>> {
        Ok(self.dregs.clone())
    }

    fn set_debug_registers(&mut self, regs: &[u64]) -> Result<()> {
        if regs.len() != self.dregs.len() {
            return Err(Error::Debugger("malformed debug register file".into()));
        }
        self.dregs.copy_from_slice(regs);
        Ok(())
    }

    fn resume_execution(&mut self) -> Result<()> {
        self.clear_debug_status();
        loop {
            match self.step() {
                Outcome::Normal => continue,
                Outcome::Stop(reason) => {
                    self.reason = reason;
                    return Ok(());
                }
            }
        }
    }

    fn singlestep(&mut self) -> Result<()> {
        self.clear_debug_status();
        self.reason = match self.step() {
            Outcome::Normal => StopReason::Singlestep,
            Outcome::Stop(reason) => reason,
        };
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        // Execution is synchronous; the machine is already stopped.
        Ok(())
    }

    fn reason(&mut self) -> Result<StopReason> {
        Ok(self.reason)
    }

    fn text_size(&mut self) -> Result<u64> {
        Ok(self.text.len() as u64)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A `Native` driving the in-memory machine.
pub(crate) fn native_with(program: &str) -> Native {
    Native::new(Box::new(TestVm::new(program)), Arch::t86())
}
