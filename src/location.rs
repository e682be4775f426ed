//! Location-expression programs and their interpreter.
//!
//! A variable's location is described by a small stack program attached to
//! its debug-info entry. Interpreting the program against a live process
//! yields where the variable currently lives: a register, a data address,
//! or a plain value. The scratch stack lives only for one interpretation.

use crate::error::{Error, Result};
use crate::native::Native;

/// One instruction of a location program.
#[derive(Debug, Clone, PartialEq)]
pub enum LocExpr {
    /// Push an integer.
    PushImm(i64),
    /// Push a register reference; resolved only when dereferenced or read.
    PushReg(String),
    /// Push `frame_base + offset` as a data address.
    BaseOffset(i64),
    /// Pop two operands, push their sum.
    Add,
    /// Pop a data address, push the word stored there.
    Dereference,
}

/// Where a variable lives, as computed by a location program.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    /// The value is in this register.
    Register(String),
    /// The value is in data memory at this address.
    Address(u64),
    /// The value is the immediate itself.
    Immediate(i64),
}

/// Run a location program against the debugged process.
///
/// The result is the single operand left on the stack; underflow, an
/// unsupported operand combination, or leftover stack residue fail.
pub fn interpret(exprs: &[LocExpr], native: &mut Native) -> Result<Location> {
    let frame_base = native.arch().frame_base_name;
    let mut stack: Vec<Location> = Vec::new();

    let pop = |stack: &mut Vec<Location>| {
        stack
            .pop()
            .ok_or_else(|| Error::Interpret("stack underflow".into()))
    };

    for expr in exprs {
        match expr {
            LocExpr::PushImm(n) => stack.push(Location::Immediate(*n)),
            LocExpr::PushReg(name) => stack.push(Location::Register(name.clone())),
            LocExpr::BaseOffset(offset) => {
                let base = native.get_register(frame_base)?;
                stack.push(Location::Address((base + offset) as u64));
            }
            LocExpr::Add => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                let sum = match (lhs, rhs) {
                    (Location::Immediate(a), Location::Immediate(b)) => {
                        Location::Immediate(a + b)
                    }
                    (Location::Immediate(a), Location::Address(b))
                    | (Location::Address(b), Location::Immediate(a)) => {
                        Location::Address(b.wrapping_add_signed(a))
                    }
                    (lhs, rhs) => {
                        return Err(Error::Interpret(format!(
                            "can't add operands {:?} and {:?}; registers must be resolved first",
                            lhs, rhs
                        )))
                    }
                };
                stack.push(sum);
            }
            LocExpr::Dereference => {
                let top = pop(&mut stack)?;
                let addr = match top {
                    Location::Address(a) => a,
                    other => {
                        return Err(Error::Interpret(format!(
                            "dereference needs an address, got {:?}",
                            other
                        )))
                    }
                };
                let word = native.read_memory(addr, 1)?[0];
                stack.push(Location::Immediate(word));
            }
        }
    }

    let result = stack
        .pop()
        .ok_or_else(|| Error::Interpret("empty stack at the end of calculation".into()))?;
    if !stack.is_empty() {
        return Err(Error::Interpret(format!(
            "{} leftover operands after calculation",
            stack.len()
        )));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testvm::native_with;
    use crate::types::DebugEvent;

    const HALT_ONLY: &str = ".text\nHALT\n";

    #[test]
    fn base_offset_computes_frame_relative_address() {
        let mut native = native_with(HALT_ONLY);
        assert_eq!(native.wait_for_debug_event().unwrap(), DebugEvent::ExecutionBegin);
        native.set_register("BP", 0x1000).unwrap();
        let loc = interpret(&[LocExpr::BaseOffset(-8)], &mut native).unwrap();
        assert_eq!(loc, Location::Address(0x0FF8));
    }

    #[test]
    fn immediate_addition() {
        let mut native = native_with(HALT_ONLY);
        let loc = interpret(
            &[LocExpr::PushImm(3), LocExpr::PushImm(4), LocExpr::Add],
            &mut native,
        )
        .unwrap();
        assert_eq!(loc, Location::Immediate(7));
    }

    #[test]
    fn immediate_plus_address_stays_an_address() {
        let mut native = native_with(HALT_ONLY);
        native.set_register("BP", 16).unwrap();
        let loc = interpret(
            &[LocExpr::BaseOffset(0), LocExpr::PushImm(-2), LocExpr::Add],
            &mut native,
        )
        .unwrap();
        assert_eq!(loc, Location::Address(14));
    }

    #[test]
    fn register_result_is_left_unresolved() {
        let mut native = native_with(HALT_ONLY);
        let loc = interpret(&[LocExpr::PushReg("R1".into())], &mut native).unwrap();
        assert_eq!(loc, Location::Register("R1".into()));
    }

    #[test]
    fn register_plus_imm_is_rejected() {
        let mut native = native_with(HALT_ONLY);
        let err = interpret(
            &[
                LocExpr::PushReg("R1".into()),
                LocExpr::PushImm(2),
                LocExpr::Add,
            ],
            &mut native,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interpret(_)));
    }

    #[test]
    fn dereference_reads_the_debuggee() {
        let mut native = native_with(HALT_ONLY);
        native.write_memory(5, &[42]).unwrap();
        native.set_register("BP", 5).unwrap();
        let loc = interpret(
            &[LocExpr::BaseOffset(0), LocExpr::Dereference],
            &mut native,
        )
        .unwrap();
        assert_eq!(loc, Location::Immediate(42));
    }

    #[test]
    fn dereference_of_non_address_fails() {
        let mut native = native_with(HALT_ONLY);
        let err = interpret(
            &[LocExpr::PushImm(5), LocExpr::Dereference],
            &mut native,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interpret(_)));
    }

    #[test]
    fn underflow_fails() {
        let mut native = native_with(HALT_ONLY);
        assert!(interpret(&[LocExpr::Add], &mut native).is_err());
        assert!(interpret(&[], &mut native).is_err());
    }

    #[test]
    fn leftover_residue_fails() {
        let mut native = native_with(HALT_ONLY);
        let err = interpret(
            &[LocExpr::PushImm(1), LocExpr::PushImm(2)],
            &mut native,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Interpret(_)));
    }
}
