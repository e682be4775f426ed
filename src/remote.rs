//! Driver for a target VM attached over a line-oriented channel.
//!
//! The debugger side of the wire protocol: one request per line, one
//! value per response line, `OK` confirming mutations and an unsolicited
//! `STOPPED` line whenever the machine stops. The transport is anything
//! implementing [`Messenger`]; [`TcpMessenger`] is the TCP client used
//! against a real VM.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use tracing::debug;

use crate::arch::Arch;
use crate::asm::Parser;
use crate::error::{Error, Result};
use crate::process::Process;
use crate::types::StopReason;

/// One request/response channel to the target.
pub trait Messenger {
    fn send(&mut self, message: &str) -> Result<()>;
    /// The next message, or `None` when the peer closed the channel.
    fn receive(&mut self) -> Result<Option<String>>;
}

/// Newline-framed TCP transport.
pub struct TcpMessenger {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpMessenger {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(TcpMessenger { stream, reader })
    }
}

impl Messenger for TcpMessenger {
    fn send(&mut self, message: &str) -> Result<()> {
        self.stream.write_all(message.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// `Process` implementation speaking the reference VM's protocol.
pub struct RemoteProcess<M: Messenger> {
    messenger: M,
    arch: Arch,
    gp_register_count: u64,
    float_register_count: u64,
}

impl<M: Messenger> RemoteProcess<M> {
    pub fn new(messenger: M, gp_register_count: u64, float_register_count: u64) -> Self {
        RemoteProcess {
            messenger,
            arch: Arch::t86(),
            gp_register_count,
            float_register_count,
        }
    }

    /// The architecture record describing the attached machine.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    fn receive(&mut self) -> Result<String> {
        self.messenger
            .receive()?
            .ok_or_else(|| Error::Debugger("target closed the connection".into()))
    }

    /// Send a mutating command and insist on `OK`.
    fn check_response(&mut self, command: String, context: &str) -> Result<()> {
        self.messenger.send(&command)?;
        let response = self.messenger.receive()?;
        match response {
            Some(ref r) if r == "OK" => Ok(()),
            Some(r) => Err(Error::Debugger(format!(
                "error communicating with target VM: {}; expected 'OK', got '{}'",
                context, r
            ))),
            None => Err(Error::Debugger(format!(
                "error communicating with target VM: {}; no confirmation was sent back",
                context
            ))),
        }
    }

    /// Read `count` lines of `NAME:VALUE` pairs.
    fn receive_pairs<V>(&mut self, count: u64, context: &str) -> Result<Vec<(String, V)>>
    where
        V: std::str::FromStr,
    {
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let line = self.receive()?;
            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::Debugger(format!("malformed {} response '{}'", context, line))
            })?;
            let value = value.trim().parse().map_err(|_| {
                Error::Debugger(format!("malformed {} value in '{}'", context, line))
            })?;
            pairs.push((name.trim().to_string(), value));
        }
        Ok(pairs)
    }

    fn is_gp_register(&self, name: &str) -> bool {
        name.strip_prefix('R')
            .and_then(|idx| idx.parse::<u64>().ok())
            .is_some_and(|idx| idx < self.gp_register_count)
    }

    fn is_valid_register_name(&self, name: &str) -> bool {
        matches!(name, "IP" | "BP" | "SP" | "FLAGS") || self.is_gp_register(name)
    }

    fn is_valid_float_register_name(&self, name: &str) -> bool {
        name.strip_prefix('F')
            .and_then(|idx| idx.parse::<u64>().ok())
            .is_some_and(|idx| idx < self.float_register_count)
    }

    /// Integer registers: general purpose plus the named specials.
    fn register_count(&self) -> u64 {
        self.gp_register_count + 4
    }
}

impl<M: Messenger> Process for RemoteProcess<M> {
    fn read_text(&mut self, address: u64, amount: u64) -> Result<Vec<String>> {
        self.messenger
            .send(&format!("PEEKTEXT {} {}", address, amount))?;
        (0..amount).map(|_| self.receive()).collect()
    }

    fn write_text(&mut self, address: u64, data: &[String]) -> Result<()> {
        for (i, line) in data.iter().enumerate() {
            // Reject garbage locally; the VM would desync otherwise.
            Parser::parse_instruction_line(line)
                .map_err(|e| Error::Debugger(format!("error in parsing instruction: {}", e)))?;
            self.check_response(
                format!("POKETEXT {} {}", address + i as u64, line),
                "POKETEXT error",
            )?;
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u64, amount: u64) -> Result<Vec<i64>> {
        self.messenger
            .send(&format!("PEEKDATA {} {}", address, amount))?;
        (0..amount)
            .map(|_| {
                let line = self.receive()?;
                line.trim().parse().map_err(|_| {
                    Error::Debugger(format!("malformed PEEKDATA response '{}'", line))
                })
            })
            .collect()
    }

    fn write_memory(&mut self, address: u64, data: &[i64]) -> Result<()> {
        for (i, value) in data.iter().enumerate() {
            self.check_response(
                format!("POKEDATA {} {}", address + i as u64, value),
                "POKEDATA error",
            )?;
        }
        Ok(())
    }

    fn fetch_registers(&mut self) -> Result<BTreeMap<String, i64>> {
        self.messenger.send("PEEKREGS")?;
        let pairs = self.receive_pairs::<i64>(self.register_count(), "PEEKREGS")?;
        Ok(pairs.into_iter().collect())
    }

    fn set_registers(&mut self, regs: &BTreeMap<String, i64>) -> Result<()> {
        for (name, value) in regs {
            if !self.is_valid_register_name(name) {
                return Err(Error::Debugger(format!(
                    "register name '{}' is not valid",
                    name
                )));
            }
            debug!("setting register {} to {}", name, value);
            self.check_response(format!("POKEREGS {} {}", name, value), "POKEREGS error")?;
        }
        Ok(())
    }

    fn fetch_float_registers(&mut self) -> Result<BTreeMap<String, f64>> {
        self.messenger.send("PEEKFLOATREGS")?;
        let pairs =
            self.receive_pairs::<f64>(self.float_register_count, "PEEKFLOATREGS")?;
        Ok(pairs.into_iter().collect())
    }

    fn set_float_registers(&mut self, regs: &BTreeMap<String, f64>) -> Result<()> {
        for (name, value) in regs {
            if !self.is_valid_float_register_name(name) {
                return Err(Error::Debugger(format!(
                    "register name '{}' is not valid",
                    name
                )));
            }
            debug!("setting float register {} to {}", name, value);
            self.check_response(
                format!("POKEFLOATREGS {} {}", name, value),
                "POKEFLOATREGS error",
            )?;
        }
        Ok(())
    }

    fn fetch_debug_registers(&mut self) -> Result<Vec<u64>> {
        self.messenger.send("PEEKDEBUGREGS")?;
        let len = self.arch.debug_register_file_len();
        let pairs = self.receive_pairs::<u64>(len as u64, "PEEKDEBUGREGS")?;
        let mut file = vec![0u64; len];
        for (name, value) in pairs {
            let slot = name
                .strip_prefix('D')
                .and_then(|idx| idx.parse::<usize>().ok())
                .filter(|idx| *idx < len)
                .ok_or_else(|| {
                    Error::Debugger(format!("unexpected debug register '{}'", name))
                })?;
            file[slot] = value;
        }
        Ok(file)
    }

    fn set_debug_registers(&mut self, regs: &[u64]) -> Result<()> {
        if regs.len() != self.arch.debug_register_file_len() {
            return Err(Error::Debugger("malformed debug register file".into()));
        }
        for (slot, value) in regs.iter().enumerate() {
            debug!("setting debug register D{} to {}", slot, value);
            self.check_response(
                format!("POKEDEBUGREGS D{} {}", slot, value),
                "POKEDEBUGREGS error",
            )?;
        }
        Ok(())
    }

    fn resume_execution(&mut self) -> Result<()> {
        self.check_response("CONTINUE".into(), "CONTINUE fail")
    }

    fn singlestep(&mut self) -> Result<()> {
        self.check_response("SINGLESTEP".into(), "SINGLESTEP error")
    }

    fn wait(&mut self) -> Result<()> {
        let message = self.receive()?;
        if message != "STOPPED" {
            return Err(Error::Debugger(format!(
                "expected STOPPED message while waiting, got '{}'",
                message
            )));
        }
        Ok(())
    }

    fn reason(&mut self) -> Result<StopReason> {
        self.messenger.send("REASON")?;
        let reason = self.receive()?;
        match reason.as_str() {
            "START" => Ok(StopReason::ExecutionBegin),
            "SW_BKPT" => Ok(StopReason::SoftwareBreakpointHit),
            "HW_BKPT" => Ok(StopReason::HardwareBreak),
            "SINGLESTEP" => Ok(StopReason::Singlestep),
            "HALT" => Ok(StopReason::ExecutionEnd),
            other => Err(Error::Debugger(format!("unknown stop reason '{}'", other))),
        }
    }

    fn text_size(&mut self) -> Result<u64> {
        self.messenger.send("TEXTSIZE")?;
        let response = self.receive()?;
        response
            .strip_prefix("TEXTSIZE:")
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| Error::Debugger(format!("malformed TEXTSIZE response '{}'", response)))
    }

    fn terminate(&mut self) -> Result<()> {
        self.check_response("TERMINATE".into(), "TERMINATE fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport recording everything sent.
    #[derive(Default)]
    struct MockMessenger {
        sent: Vec<String>,
        responses: VecDeque<String>,
    }

    impl MockMessenger {
        fn with_responses(responses: &[&str]) -> Self {
            MockMessenger {
                sent: Vec::new(),
                responses: responses.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Messenger for MockMessenger {
        fn send(&mut self, message: &str) -> Result<()> {
            self.sent.push(message.to_string());
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<String>> {
            Ok(self.responses.pop_front())
        }
    }

    fn remote(responses: &[&str]) -> RemoteProcess<MockMessenger> {
        RemoteProcess::new(MockMessenger::with_responses(responses), 3, 2)
    }

    #[test]
    fn read_text_requests_and_collects_lines() {
        let mut process = remote(&["MOV R0, 1", "HALT"]);
        let text = process.read_text(2, 2).unwrap();
        assert_eq!(text, vec!["MOV R0, 1", "HALT"]);
        assert_eq!(process.messenger.sent, vec!["PEEKTEXT 2 2"]);
    }

    #[test]
    fn write_text_validates_locally() {
        let mut process = remote(&[]);
        let err = process
            .write_text(0, &["MOV R0, R1 + 1".into()])
            .unwrap_err();
        assert!(matches!(err, Error::Debugger(_)));
        assert!(process.messenger.sent.is_empty());

        let mut process = remote(&["OK", "OK"]);
        process
            .write_text(4, &["NOP".into(), "HALT".into()])
            .unwrap();
        assert_eq!(
            process.messenger.sent,
            vec!["POKETEXT 4 NOP", "POKETEXT 5 HALT"]
        );
    }

    #[test]
    fn memory_roundtrip() {
        let mut process = remote(&["-7", "42"]);
        assert_eq!(process.read_memory(16, 2).unwrap(), vec![-7, 42]);
        assert_eq!(process.messenger.sent, vec!["PEEKDATA 16 2"]);

        let mut process = remote(&["OK"]);
        process.write_memory(3, &[9]).unwrap();
        assert_eq!(process.messenger.sent, vec!["POKEDATA 3 9"]);
    }

    #[test]
    fn fetch_registers_parses_pairs() {
        let mut process = remote(&[
            "R0:1", "R1:-2", "R2:3", "IP:4", "BP:5", "SP:6", "FLAGS:0",
        ]);
        let regs = process.fetch_registers().unwrap();
        assert_eq!(regs["R1"], -2);
        assert_eq!(regs["IP"], 4);
        assert_eq!(regs.len(), 7);
    }

    #[test]
    fn set_registers_rejects_unknown_names() {
        let mut process = remote(&[]);
        let mut regs = BTreeMap::new();
        regs.insert("R7".to_string(), 1);
        assert!(process.set_registers(&regs).is_err());
        let mut regs = BTreeMap::new();
        regs.insert("XX".to_string(), 1);
        assert!(process.set_registers(&regs).is_err());

        let mut process = remote(&["OK"]);
        let mut regs = BTreeMap::new();
        regs.insert("R2".to_string(), 5);
        process.set_registers(&regs).unwrap();
        assert_eq!(process.messenger.sent, vec!["POKEREGS R2 5"]);
    }

    #[test]
    fn float_register_names_are_validated() {
        let mut process = remote(&[]);
        let mut regs = BTreeMap::new();
        regs.insert("F2".to_string(), 1.0);
        assert!(process.set_float_registers(&regs).is_err());

        let mut process = remote(&["OK"]);
        let mut regs = BTreeMap::new();
        regs.insert("F1".to_string(), 2.5);
        process.set_float_registers(&regs).unwrap();
        assert_eq!(process.messenger.sent, vec!["POKEFLOATREGS F1 2.5"]);
    }

    #[test]
    fn debug_registers_come_back_ordered() {
        let mut process = remote(&["D4:256", "D0:16", "D1:0", "D2:0", "D3:0"]);
        let file = process.fetch_debug_registers().unwrap();
        assert_eq!(file, vec![16, 0, 0, 0, 256]);
    }

    #[test]
    fn reason_mapping() {
        for (text, reason) in [
            ("START", StopReason::ExecutionBegin),
            ("SW_BKPT", StopReason::SoftwareBreakpointHit),
            ("HW_BKPT", StopReason::HardwareBreak),
            ("SINGLESTEP", StopReason::Singlestep),
            ("HALT", StopReason::ExecutionEnd),
        ] {
            let mut process = remote(&[text]);
            assert_eq!(process.reason().unwrap(), reason);
        }
        let mut process = remote(&["EXPLODED"]);
        assert!(process.reason().is_err());
    }

    #[test]
    fn text_size_parse() {
        let mut process = remote(&["TEXTSIZE:12"]);
        assert_eq!(process.text_size().unwrap(), 12);
        let mut process = remote(&["nonsense"]);
        assert!(process.text_size().is_err());
    }

    #[test]
    fn wait_expects_stopped() {
        let mut process = remote(&["STOPPED"]);
        process.wait().unwrap();
        let mut process = remote(&["OK"]);
        assert!(process.wait().is_err());
    }

    #[test]
    fn mutating_commands_require_ok() {
        let mut process = remote(&["NO"]);
        assert!(process.resume_execution().is_err());
        let mut process = remote(&[]);
        assert!(process.singlestep().is_err());
        let mut process = remote(&["OK"]);
        process.terminate().unwrap();
        assert_eq!(process.messenger.sent, vec!["TERMINATE"]);
    }
}
