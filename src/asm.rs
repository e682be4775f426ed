//! Assembly parser for the target machine's textual program format.
//!
//! A program is a sequence of `.section` blocks; `text` holds instructions,
//! `data` holds words and strings, anything else is skipped. Operands are
//! parsed with one unified grammar and then validated against the
//! per-mnemonic table of allowed forms, so a misplaced form reports what
//! the instruction accepts instead of failing mid-operand.

use tracing::info;

use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::program::{FloatRegister, Instruction, Operand, Program, Register};

/// Forms accepted in a given operand position.
#[derive(Debug, Clone, Copy)]
enum FormSet {
    /// `i` or `R`.
    ImmOrRegister,
    /// `i`, `R`, `[i]`, `[R]` or `[R + i]`.
    ImmOrRegisterOrSimpleMemory,
    /// `i`, `R`, `R + i`, `[i]`, `[R]` or `[R + i]`.
    ImmOrRegisterPlusImmOrSimpleMemory,
    /// `f` or `F`.
    FloatImmOrRegister,
}

impl FormSet {
    fn allows(self, op: &Operand) -> bool {
        let simple_memory = matches!(
            op,
            Operand::MemImm(_) | Operand::MemRegister(_) | Operand::MemRegisterImm(..)
        );
        let imm_or_reg = matches!(op, Operand::Imm(_) | Operand::Register(_));
        match self {
            FormSet::ImmOrRegister => imm_or_reg,
            FormSet::ImmOrRegisterOrSimpleMemory => imm_or_reg || simple_memory,
            FormSet::ImmOrRegisterPlusImmOrSimpleMemory => {
                imm_or_reg || simple_memory || matches!(op, Operand::RegisterImm(..))
            }
            FormSet::FloatImmOrRegister => {
                matches!(op, Operand::FloatImm(_) | Operand::FloatRegister(_))
            }
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FormSet::ImmOrRegister => "i or R",
            FormSet::ImmOrRegisterOrSimpleMemory => "i, R, [i], [R] or [R + i]",
            FormSet::ImmOrRegisterPlusImmOrSimpleMemory => "i, R, R + i, [i], [R] or [R + i]",
            FormSet::FloatImmOrRegister => "f or F",
        }
    }
}

/// Recursive-descent parser over the shared lexer.
pub struct Parser {
    lexer: Lexer,
    cur: Token,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let cur = lexer.next_token()?;
        Ok(Parser { lexer, cur })
    }

    /// Parse a complete program: every section until end of input.
    ///
    /// A `.debug_source` section ends the program text; everything after it
    /// belongs to the debug-info side of the file.
    pub fn parse(mut self) -> Result<Program> {
        if self.cur.kind != TokenKind::Dot {
            return Err(self.err("file does not contain any sections"));
        }
        let mut program = Program::default();
        while self.cur.kind == TokenKind::Dot {
            self.advance()?;
            let name = match &self.cur.kind {
                TokenKind::Id(name) => name.clone(),
                _ => return Err(self.err("expected section name")),
            };
            if name == "debug_source" {
                return Ok(program);
            }
            self.advance()?;
            self.section(&name, &mut program)?;
        }
        if self.cur.kind != TokenKind::End {
            return Err(self.err(
                "some part of the file has not been parsed due to wrong input; \
                 this can be caused by an operand form the instruction does not support",
            ));
        }
        Ok(program)
    }

    /// Parse a single instruction line (optional numeric prefix, optional
    /// trailing semicolon) and require that nothing follows it.
    pub fn parse_instruction_line(input: &str) -> Result<Instruction> {
        let mut p = Parser::new(input)?;
        let ins = p.instruction()?;
        if p.cur.kind == TokenKind::Semicolon {
            p.advance()?;
        }
        if p.cur.kind != TokenKind::End {
            return Err(p.err("trailing input after instruction"));
        }
        Ok(ins)
    }

    fn advance(&mut self) -> Result<()> {
        self.cur = self.lexer.next_token()?;
        Ok(())
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::Parse {
            row: self.cur.row,
            col: self.cur.col,
            msg: msg.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        if self.cur.kind != kind {
            return Err(self.err(format!("expected {}", what)));
        }
        self.advance()
    }

    fn section(&mut self, name: &str, program: &mut Program) -> Result<()> {
        match name {
            "text" => {
                info!("parsing 'text' section");
                self.text(&mut program.instructions)
            }
            "data" => {
                info!("parsing 'data' section");
                self.data(&mut program.data)
            }
            _ => {
                info!("skipping '{}' section", name);
                self.lexer.set_ignore_mode(true);
                while self.cur.kind != TokenKind::Dot && self.cur.kind != TokenKind::End {
                    self.advance()?;
                }
                self.lexer.set_ignore_mode(false);
                Ok(())
            }
        }
    }

    fn text(&mut self, out: &mut Vec<Instruction>) -> Result<()> {
        while matches!(self.cur.kind, TokenKind::Num(_) | TokenKind::Id(_)) {
            out.push(self.instruction()?);
            if self.cur.kind == TokenKind::Semicolon {
                self.advance()?;
            }
        }
        Ok(())
    }

    fn data(&mut self, out: &mut Vec<i64>) -> Result<()> {
        loop {
            match &self.cur.kind {
                TokenKind::Str(s) => {
                    out.extend(s.bytes().map(i64::from));
                    out.push(0);
                    self.advance()?;
                }
                TokenKind::Num(n) => {
                    out.push(*n);
                    self.advance()?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// One instruction; a leading number is a positional address and is
    /// ignored.
    fn instruction(&mut self) -> Result<Instruction> {
        if matches!(self.cur.kind, TokenKind::Num(_)) {
            self.advance()?;
        }
        let mnemonic = match &self.cur.kind {
            TokenKind::Id(name) => name.clone(),
            _ => return Err(self.err("expected instruction mnemonic")),
        };
        self.advance()?;

        use Instruction as I;
        match mnemonic.as_str() {
            "MOV" => self.mov(),
            "LEA" => self.lea(),

            "ADD" => self.binary(I::Add, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "SUB" => self.binary(I::Sub, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "MUL" => self.binary(I::Mul, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "DIV" => self.binary(I::Div, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "IMUL" => self.binary(I::Imul, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "IDIV" => self.binary(I::Idiv, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "AND" => self.binary(I::And, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "OR" => self.binary(I::Or, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "XOR" => self.binary(I::Xor, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "LSH" => self.binary(I::Lsh, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "RSH" => self.binary(I::Rsh, FormSet::ImmOrRegisterPlusImmOrSimpleMemory),
            "CMP" => self.binary(I::Cmp, FormSet::ImmOrRegisterOrSimpleMemory),
            "LOOP" => self.binary(I::Loop, FormSet::ImmOrRegister),

            "FADD" => self.float_binary(I::Fadd),
            "FSUB" => self.float_binary(I::Fsub),
            "FMUL" => self.float_binary(I::Fmul),
            "FDIV" => self.float_binary(I::Fdiv),
            "FCMP" => self.float_binary(I::Fcmp),
            "EXT" => {
                let dst = self.float_register_operand()?;
                self.expect(TokenKind::Comma, "','")?;
                let src = self.register_operand()?;
                Ok(I::Ext(dst, src))
            }
            "NRW" => {
                let dst = self.register_operand()?;
                self.expect(TokenKind::Comma, "','")?;
                let src = self.float_register_operand()?;
                Ok(I::Nrw(dst, src))
            }

            "INC" => Ok(I::Inc(self.register_operand()?)),
            "DEC" => Ok(I::Dec(self.register_operand()?)),
            "NEG" => Ok(I::Neg(self.register_operand()?)),
            "NOT" => Ok(I::Not(self.register_operand()?)),
            "POP" => Ok(I::Pop(self.register_operand()?)),
            "FPOP" => Ok(I::Fpop(self.float_register_operand()?)),
            "PUTCHAR" => Ok(I::Putchar(self.register_operand()?)),
            "PUTNUM" => Ok(I::Putnum(self.register_operand()?)),
            "GETCHAR" => Ok(I::Getchar(self.register_operand()?)),

            "JMP" => self.unary(I::Jmp, FormSet::ImmOrRegister),
            "JZ" => self.unary(I::Jz, FormSet::ImmOrRegisterOrSimpleMemory),
            "JNZ" => self.unary(I::Jnz, FormSet::ImmOrRegisterOrSimpleMemory),
            "JE" => self.unary(I::Je, FormSet::ImmOrRegisterOrSimpleMemory),
            "JNE" => self.unary(I::Jne, FormSet::ImmOrRegisterOrSimpleMemory),
            "JG" => self.unary(I::Jg, FormSet::ImmOrRegisterOrSimpleMemory),
            "JGE" => self.unary(I::Jge, FormSet::ImmOrRegisterOrSimpleMemory),
            "JL" => self.unary(I::Jl, FormSet::ImmOrRegisterOrSimpleMemory),
            "JLE" => self.unary(I::Jle, FormSet::ImmOrRegisterOrSimpleMemory),
            "JA" => self.unary(I::Ja, FormSet::ImmOrRegisterOrSimpleMemory),
            "JAE" => self.unary(I::Jae, FormSet::ImmOrRegisterOrSimpleMemory),
            "JB" => self.unary(I::Jb, FormSet::ImmOrRegisterOrSimpleMemory),
            "JBE" => self.unary(I::Jbe, FormSet::ImmOrRegisterOrSimpleMemory),
            "JO" => self.unary(I::Jo, FormSet::ImmOrRegisterOrSimpleMemory),
            "JNO" => self.unary(I::Jno, FormSet::ImmOrRegisterOrSimpleMemory),
            "JS" => self.unary(I::Js, FormSet::ImmOrRegisterOrSimpleMemory),
            "JNS" => self.unary(I::Jns, FormSet::ImmOrRegisterOrSimpleMemory),
            "CALL" => self.unary(I::Call, FormSet::ImmOrRegister),
            "PUSH" => self.unary(I::Push, FormSet::ImmOrRegister),
            "FPUSH" => self.unary(I::Fpush, FormSet::FloatImmOrRegister),

            "HALT" => Ok(I::Halt),
            "NOP" => Ok(I::Nop),
            "BKPT" => Ok(I::Bkpt),
            "BREAK" => Ok(I::Break),
            "RET" => Ok(I::Ret),

            _ => Err(self.err(format!("unknown instruction {}", mnemonic))),
        }
    }

    // ── Per-mnemonic validation ───────────────────────────────────

    /// `MOV` accepts nearly the whole operand grammar, but the two sides
    /// constrain each other.
    fn mov(&mut self) -> Result<Instruction> {
        let dst = self.operand()?;
        self.expect(TokenKind::Comma, "','")?;
        let src = self.operand()?;

        match dst {
            Operand::Imm(_) | Operand::FloatImm(_) | Operand::RegisterImm(..) => {
                return Err(self.err("MOV can't have i or R + i as destination"));
            }
            Operand::Register(_) => {
                if matches!(src, Operand::RegisterImm(..)) {
                    return Err(self.err("MOV can't have R + i as source when destination is R"));
                }
                if matches!(src, Operand::FloatImm(_)) {
                    return Err(
                        self.err("MOV can't move f into R, use a float register instead")
                    );
                }
            }
            Operand::FloatRegister(_) => {
                if !matches!(
                    src,
                    Operand::FloatImm(_)
                        | Operand::FloatRegister(_)
                        | Operand::Register(_)
                        | Operand::MemImm(_)
                        | Operand::MemRegister(_)
                ) {
                    return Err(self.err(format!(
                        "MOV to F can only have f, F, R, [i] or [R] as source, got '{}'",
                        src
                    )));
                }
            }
            _ => {
                // Memory destination.
                if !matches!(
                    src,
                    Operand::Register(_) | Operand::FloatRegister(_) | Operand::Imm(_)
                ) {
                    return Err(self.err(format!(
                        "MOV can't have source '{}' when destination is '{}', \
                         allowed sources are R, F or i",
                        src, dst
                    )));
                }
            }
        }
        Ok(Instruction::Mov(dst, src))
    }

    /// `LEA` takes a register and a compound memory source.
    fn lea(&mut self) -> Result<Instruction> {
        let dst = self.register_operand()?;
        self.expect(TokenKind::Comma, "','")?;
        let src = self.operand()?;
        if !src.is_memory() {
            return Err(self.err("LEA source must be a memory operand"));
        }
        if matches!(src, Operand::MemRegister(_) | Operand::MemImm(_)) {
            return Err(self.err("LEA doesn't support [R] or [i]"));
        }
        Ok(Instruction::Lea(dst, src))
    }

    fn binary(
        &mut self,
        make: fn(Register, Operand) -> Instruction,
        allowed: FormSet,
    ) -> Result<Instruction> {
        let dst = self.register_operand()?;
        self.expect(TokenKind::Comma, "','")?;
        let src = self.operand()?;
        if !allowed.allows(&src) {
            return Err(self.err(format!("expected {}, got '{}'", allowed.describe(), src)));
        }
        Ok(make(dst, src))
    }

    fn float_binary(
        &mut self,
        make: fn(FloatRegister, Operand) -> Instruction,
    ) -> Result<Instruction> {
        let dst = self.float_register_operand()?;
        self.expect(TokenKind::Comma, "','")?;
        let src = self.operand()?;
        if !FormSet::FloatImmOrRegister.allows(&src) {
            return Err(self.err(format!("expected f or F, got '{}'", src)));
        }
        Ok(make(dst, src))
    }

    fn unary(
        &mut self,
        make: fn(Operand) -> Instruction,
        allowed: FormSet,
    ) -> Result<Instruction> {
        let op = self.operand()?;
        if !allowed.allows(&op) {
            return Err(self.err(format!("expected {}, got '{}'", allowed.describe(), op)));
        }
        Ok(make(op))
    }

    // ── Unified operand grammar ───────────────────────────────────

    fn operand(&mut self) -> Result<Operand> {
        match self.cur.kind.clone() {
            TokenKind::Num(n) => {
                self.advance()?;
                Ok(Operand::Imm(n))
            }
            TokenKind::Float(v) => {
                self.advance()?;
                Ok(Operand::FloatImm(v))
            }
            TokenKind::LBracket => self.memory(),
            TokenKind::Id(name) => {
                self.advance()?;
                if let Some(freg) = parse_float_register(&name) {
                    return Ok(Operand::FloatRegister(freg));
                }
                let reg = self.register_from_name(&name)?;
                if self.cur.kind == TokenKind::Plus {
                    self.advance()?;
                    let imm = self.imm()?;
                    return Ok(Operand::RegisterImm(reg, imm));
                }
                Ok(Operand::Register(reg))
            }
            _ => Err(self.err("expected operand")),
        }
    }

    /// `[i]`, `[R]`, `[R + i]`, `[R + R]`, `[R + R * i]`, `[R + i + R]`,
    /// `[R + i + R * i]` or `[R * i]`.
    fn memory(&mut self) -> Result<Operand> {
        self.expect(TokenKind::LBracket, "'['")?;
        let result = match self.cur.kind.clone() {
            TokenKind::Num(n) => {
                self.advance()?;
                Operand::MemImm(n)
            }
            TokenKind::Id(name) => {
                self.advance()?;
                let reg1 = self.register_from_name(&name)?;
                match self.cur.kind {
                    TokenKind::Plus => {
                        self.advance()?;
                        self.memory_after_plus(reg1)?
                    }
                    TokenKind::Times => {
                        self.advance()?;
                        Operand::MemScaled(reg1, self.imm()?)
                    }
                    _ => Operand::MemRegister(reg1),
                }
            }
            _ => return Err(self.err("expected either R or i")),
        };
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(result)
    }

    /// Continuation after `[R +`.
    fn memory_after_plus(&mut self, reg1: Register) -> Result<Operand> {
        match self.cur.kind.clone() {
            TokenKind::Num(imm1) => {
                self.advance()?;
                if self.cur.kind != TokenKind::Plus {
                    return Ok(Operand::MemRegisterImm(reg1, imm1));
                }
                self.advance()?;
                let reg2 = self.register()?;
                if self.cur.kind == TokenKind::Times {
                    self.advance()?;
                    let imm2 = self.imm()?;
                    Ok(Operand::MemRegisterImmScaled(reg1, imm1, reg2, imm2))
                } else {
                    Ok(Operand::MemRegisterImmRegister(reg1, imm1, reg2))
                }
            }
            TokenKind::Id(_) => {
                let reg2 = self.register()?;
                if self.cur.kind == TokenKind::Times {
                    self.advance()?;
                    let imm = self.imm()?;
                    Ok(Operand::MemRegisterScaled(reg1, reg2, imm))
                } else {
                    Ok(Operand::MemRegisterRegister(reg1, reg2))
                }
            }
            _ => Err(self.err("expected either i or R")),
        }
    }

    fn imm(&mut self) -> Result<i64> {
        match self.cur.kind {
            TokenKind::Num(n) => {
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.err("expected i")),
        }
    }

    fn register(&mut self) -> Result<Register> {
        match self.cur.kind.clone() {
            TokenKind::Id(name) => {
                self.advance()?;
                self.register_from_name(&name)
            }
            _ => Err(self.err("expected R")),
        }
    }

    /// A strictly-register operand position.
    fn register_operand(&mut self) -> Result<Register> {
        self.register()
    }

    fn float_register_operand(&mut self) -> Result<FloatRegister> {
        match self.cur.kind.clone() {
            TokenKind::Id(name) => {
                self.advance()?;
                parse_float_register(&name)
                    .ok_or_else(|| self.err("float registers must begin with an F"))
            }
            _ => Err(self.err("expected F")),
        }
    }

    fn register_from_name(&self, name: &str) -> Result<Register> {
        parse_register(name).ok_or_else(|| {
            self.err(format!(
                "registers must begin with an R, unless IP, BP or SP, got {}",
                name
            ))
        })
    }
}

/// Parse a register name (`R<n>`, `BP`, `SP`, `IP`).
pub fn parse_register(name: &str) -> Option<Register> {
    match name {
        "BP" => Some(Register::Bp),
        "SP" => Some(Register::Sp),
        "IP" => Some(Register::Ip),
        _ => {
            let idx = name.strip_prefix('R')?;
            if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            idx.parse().ok().map(Register::Gp)
        }
    }
}

/// Parse a float register name (`F<n>`).
pub fn parse_float_register(name: &str) -> Option<FloatRegister> {
    let idx = name.strip_prefix('F')?;
    if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    idx.parse().ok().map(FloatRegister)
}
