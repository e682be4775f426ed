//! Debug information: the DIE tree, the line mapping, and their parser.
//!
//! Debug info travels as text alongside the program: a `.debug_line`
//! section mapping source lines to instruction addresses, a `.debug_info`
//! section holding the tree of debugging information entries, and a
//! `.debug_source` section carrying the source itself. The source layer
//! consumes the parsed [`DebuggingInfo`].

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{Error, Result};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::location::LocExpr;

/// Tag of a debugging information entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    CompileUnit,
    Function,
    Scope,
    Variable,
    PrimitiveType,
    StructuredType,
    PointerType,
}

impl Tag {
    fn from_name(name: &str) -> Option<Tag> {
        match name {
            "compile_unit" => Some(Tag::CompileUnit),
            "function" => Some(Tag::Function),
            "scope" => Some(Tag::Scope),
            "variable" => Some(Tag::Variable),
            "primitive_type" => Some(Tag::PrimitiveType),
            "structured_type" => Some(Tag::StructuredType),
            "pointer_type" => Some(Tag::PointerType),
            _ => None,
        }
    }
}

/// One member of a structured type: name, type reference, word offset
/// from the start of the structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub type_id: u64,
    pub offset: i64,
}

/// One attribute of a DIE.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Name(String),
    Id(u64),
    BeginAddr(u64),
    EndAddr(u64),
    Size(u64),
    TypeId(u64),
    Members(Vec<Member>),
    LocationExpr(Vec<LocExpr>),
}

impl Attribute {
    fn key(&self) -> &'static str {
        match self {
            Attribute::Name(_) => "name",
            Attribute::Id(_) => "id",
            Attribute::BeginAddr(_) => "begin_addr",
            Attribute::EndAddr(_) => "end_addr",
            Attribute::Size(_) => "size",
            Attribute::TypeId(_) => "type",
            Attribute::Members(_) => "members",
            Attribute::LocationExpr(_) => "location_expr",
        }
    }
}

/// A debugging information entry: a tag, an attribute set, and owned
/// children. References into the tree stay valid until the next debug-info
/// load replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Die {
    tag: Tag,
    attributes: Vec<Attribute>,
    children: Vec<Die>,
}

impl Die {
    pub fn new(tag: Tag, attributes: Vec<Attribute>, children: Vec<Die>) -> Self {
        Die {
            tag,
            attributes,
            children,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn children(&self) -> &[Die] {
        &self.children
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Name(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn id(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Id(id) => Some(*id),
            _ => None,
        })
    }

    pub fn begin_addr(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::BeginAddr(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn end_addr(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::EndAddr(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn size(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Size(s) => Some(*s),
            _ => None,
        })
    }

    pub fn type_id(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::TypeId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn members(&self) -> Option<&[Member]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Members(m) => Some(m.as_slice()),
            _ => None,
        })
    }

    pub fn location_expr(&self) -> Option<&[LocExpr]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::LocationExpr(e) => Some(e.as_slice()),
            _ => None,
        })
    }

    /// Whether `[begin_addr, end_addr)` contains the address. False when
    /// either bound is missing.
    pub fn range_contains(&self, address: u64) -> bool {
        match (self.begin_addr(), self.end_addr()) {
            (Some(begin), Some(end)) => begin <= address && address < end,
            _ => false,
        }
    }

    /// Depth-first search for the entry with the given `id` attribute.
    pub fn find_by_id(&self, id: u64) -> Option<&Die> {
        if self.id() == Some(id) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_id(id))
    }
}

/// Bidirectional partial map between source lines and text addresses.
///
/// Forward lookup is line to address; the reverse direction may yield
/// several lines for one address.
#[derive(Debug, Clone, Default)]
pub struct LineMapping {
    line_to_addr: BTreeMap<u64, u64>,
    addr_to_lines: BTreeMap<u64, Vec<u64>>,
}

impl LineMapping {
    pub fn new(line_to_addr: BTreeMap<u64, u64>) -> Self {
        let mut addr_to_lines: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for (&line, &addr) in &line_to_addr {
            addr_to_lines.entry(addr).or_default().push(line);
        }
        LineMapping {
            line_to_addr,
            addr_to_lines,
        }
    }

    /// Address of the instruction a source line maps to.
    pub fn address(&self, line: u64) -> Option<u64> {
        self.line_to_addr.get(&line).copied()
    }

    /// All source lines mapped to the address, in ascending order.
    pub fn lines(&self, address: u64) -> &[u64] {
        self.addr_to_lines
            .get(&address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.line_to_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_to_addr.is_empty()
    }
}

/// Line cache over the debugged program's source text.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    lines: Vec<String>,
}

impl SourceFile {
    pub fn new(text: &str) -> Self {
        SourceFile {
            lines: text.lines().map(str::to_owned).collect(),
        }
    }

    /// A single 0-based line, if present.
    pub fn line(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(String::as_str)
    }

    /// Up to `amount` lines starting at `idx`; stops at the end instead
    /// of failing.
    pub fn lines_range(&self, idx: usize, amount: usize) -> Vec<&str> {
        (idx..idx.saturating_add(amount))
            .map_while(|i| self.line(i))
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// Everything the debug-info text can carry.
#[derive(Debug, Default)]
pub struct DebuggingInfo {
    pub line_mapping: Option<LineMapping>,
    pub top_die: Option<Die>,
    pub source_code: Option<SourceFile>,
}

/// Parser for the debug-info sections of a program file.
///
/// Sections it does not understand (including the program's own `.text`
/// and `.data`) are skipped, so it can be pointed at the same file as the
/// assembly parser.
pub struct Parser {
    lexer: Lexer,
    cur: Token,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        // Program text shares the file; don't trip over its operands.
        lexer.set_ignore_mode(true);
        let cur = lexer.next_token()?;
        Ok(Parser { lexer, cur })
    }

    pub fn parse(mut self) -> Result<DebuggingInfo> {
        let mut info = DebuggingInfo::default();
        while self.cur.kind != TokenKind::End {
            if self.cur.kind != TokenKind::Dot {
                return Err(self.err("expected section beginning with '.'"));
            }
            self.advance()?;
            let name = match &self.cur.kind {
                TokenKind::Id(name) => name.clone(),
                _ => return Err(self.err("expected section name")),
            };
            match name.as_str() {
                "debug_line" => {
                    self.advance()?;
                    info.line_mapping = Some(self.debug_line()?);
                }
                "debug_info" => {
                    self.advance()?;
                    self.lexer.set_ignore_mode(false);
                    info.top_die = Some(self.die()?);
                    self.lexer.set_ignore_mode(true);
                }
                "debug_source" => {
                    // The source is raw text; take the remainder verbatim.
                    let rest = self.lexer.rest();
                    let body = match rest.find('\n') {
                        Some(pos) => &rest[pos + 1..],
                        None => "",
                    };
                    info.source_code = Some(SourceFile::new(body));
                    return Ok(info);
                }
                _ => {
                    info!("skipping '{}' section", name);
                    self.advance()?;
                    while self.cur.kind != TokenKind::Dot && self.cur.kind != TokenKind::End {
                        self.advance()?;
                    }
                }
            }
        }
        Ok(info)
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

    fn unsigned(&mut self, what: &str) -> Result<u64> {
        match self.cur.kind {
            TokenKind::Num(n) if n >= 0 => {
                self.advance()?;
                Ok(n as u64)
            }
            _ => Err(self.err(format!("expected non-negative number for {}", what))),
        }
    }

    fn number(&mut self, what: &str) -> Result<i64> {
        match self.cur.kind {
            TokenKind::Num(n) => {
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.err(format!("expected number for {}", what))),
        }
    }

    fn string(&mut self, what: &str) -> Result<String> {
        match self.cur.kind.clone() {
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(s)
            }
            _ => Err(self.err(format!("expected string for {}", what))),
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        match self.cur.kind.clone() {
            TokenKind::Id(s) => {
                self.advance()?;
                Ok(s)
            }
            _ => Err(self.err(format!("expected {}", what))),
        }
    }

    /// `LINE: ADDRESS` entries until the next section.
    fn debug_line(&mut self) -> Result<LineMapping> {
        let mut entries = BTreeMap::new();
        while self.cur.kind != TokenKind::Dot && self.cur.kind != TokenKind::End {
            let line = self.unsigned("source line")?;
            self.expect(TokenKind::Colon, "line entry in form 'line: address'")?;
            let address = self.unsigned("address")?;
            entries.insert(line, address);
        }
        Ok(LineMapping::new(entries))
    }

    /// `TAG { attr: value; … child_TAG { … } }`
    fn die(&mut self) -> Result<Die> {
        let tag_row = self.cur.row;
        let tag_col = self.cur.col;
        let name = self.identifier("entry tag")?;
        let tag = Tag::from_name(&name).ok_or(Error::Parse {
            row: tag_row,
            col: tag_col,
            msg: format!("unknown tag '{}'", name),
        })?;

        const ATTRIBUTE_KEYS: &[&str] = &[
            "name",
            "id",
            "begin_addr",
            "end_addr",
            "size",
            "type",
            "members",
            "location_expr",
        ];

        self.expect(TokenKind::LBrace, "'{'")?;
        let mut attributes: Vec<Attribute> = Vec::new();
        let mut children = Vec::new();
        while self.cur.kind != TokenKind::RBrace {
            match &self.cur.kind {
                TokenKind::Id(word) => {
                    if Tag::from_name(word).is_some() {
                        children.push(self.die()?);
                    } else if ATTRIBUTE_KEYS.contains(&word.as_str()) {
                        let attr = self.attribute()?;
                        if attributes.iter().any(|a| a.key() == attr.key()) {
                            return Err(self.err(format!(
                                "duplicate attribute '{}'",
                                attr.key()
                            )));
                        }
                        attributes.push(attr);
                    } else {
                        return Err(self.err(format!(
                            "unknown tag or attribute '{}'",
                            word
                        )));
                    }
                }
                _ => return Err(self.err("expected attribute or child entry")),
            }
        }
        self.advance()?; // closing brace
        Ok(Die::new(tag, attributes, children))
    }

    /// `key: value;`
    fn attribute(&mut self) -> Result<Attribute> {
        let key_row = self.cur.row;
        let key_col = self.cur.col;
        let key = self.identifier("attribute name")?;
        self.expect(TokenKind::Colon, "':'")?;
        let attr = match key.as_str() {
            "name" => Attribute::Name(self.string("name")?),
            "id" => Attribute::Id(self.unsigned("id")?),
            "begin_addr" => Attribute::BeginAddr(self.unsigned("begin_addr")?),
            "end_addr" => Attribute::EndAddr(self.unsigned("end_addr")?),
            "size" => Attribute::Size(self.unsigned("size")?),
            "type" => Attribute::TypeId(self.unsigned("type")?),
            "members" => Attribute::Members(self.members()?),
            "location_expr" => Attribute::LocationExpr(self.location_program()?),
            _ => {
                return Err(Error::Parse {
                    row: key_row,
                    col: key_col,
                    msg: format!("unknown attribute '{}'", key),
                })
            }
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(attr)
    }

    /// `[ { name: "s"; type: N; offset: N; } … ]`
    fn members(&mut self) -> Result<Vec<Member>> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut members = Vec::new();
        while self.cur.kind == TokenKind::LBrace {
            self.advance()?;
            self.keyword("name")?;
            let name = self.string("member name")?;
            self.expect(TokenKind::Semicolon, "';'")?;
            self.keyword("type")?;
            let type_id = self.unsigned("member type")?;
            self.expect(TokenKind::Semicolon, "';'")?;
            self.keyword("offset")?;
            let offset = self.number("member offset")?;
            self.expect(TokenKind::Semicolon, "';'")?;
            self.expect(TokenKind::RBrace, "'}'")?;
            members.push(Member {
                name,
                type_id,
                offset,
            });
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(members)
    }

    fn keyword(&mut self, word: &str) -> Result<()> {
        match &self.cur.kind {
            TokenKind::Id(name) if name == word => {
                self.advance()?;
                self.expect(TokenKind::Colon, "':'")
            }
            _ => Err(self.err(format!("expected '{}'", word))),
        }
    }

    /// `[ push_imm N; push_reg NAME; base_offset N; add; deref ]`
    fn location_program(&mut self) -> Result<Vec<LocExpr>> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut program = Vec::new();
        while self.cur.kind != TokenKind::RBracket {
            let op_row = self.cur.row;
            let op_col = self.cur.col;
            let op = self.identifier("location opcode")?;
            let expr = match op.as_str() {
                "push_imm" => LocExpr::PushImm(self.number("push_imm operand")?),
                "push_reg" => LocExpr::PushReg(self.identifier("register name")?),
                "base_offset" => LocExpr::BaseOffset(self.number("base_offset operand")?),
                "add" => LocExpr::Add,
                "deref" => LocExpr::Dereference,
                _ => {
                    return Err(Error::Parse {
                        row: op_row,
                        col: op_col,
                        msg: format!("unknown location opcode '{}'", op),
                    })
                }
            };
            program.push(expr);
            if self.cur.kind == TokenKind::Semicolon {
                self.advance()?;
            }
        }
        self.advance()?; // closing bracket
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> DebuggingInfo {
        Parser::new(input).unwrap().parse().unwrap()
    }

    #[test]
    fn line_mapping_parsing() {
        let info = parse("\n.debug_line\n0: 3\n1: 3\n2: 4\n3: 5\n");
        let lm = info.line_mapping.unwrap();
        assert_eq!(lm.len(), 4);
        assert_eq!(lm.address(0), Some(3));
        assert_eq!(lm.address(1), Some(3));
        assert_eq!(lm.address(2), Some(4));
        assert_eq!(lm.address(3), Some(5));
    }

    #[test]
    fn line_mapping_tolerates_odd_whitespace() {
        let info = parse("\n.debug_line\n0: 3\n\n5: 3\n\n9:\n\n4\n1: 5\n");
        let lm = info.line_mapping.unwrap();
        assert_eq!(lm.len(), 4);
        assert_eq!(lm.address(9), Some(4));
        assert_eq!(lm.address(1), Some(5));
    }

    #[test]
    fn empty_line_mapping_before_other_section() {
        let info = parse("\n.debug_line\n.text\n");
        assert_eq!(info.line_mapping.unwrap().len(), 0);
    }

    #[test]
    fn reverse_lookup_collects_all_lines() {
        let info = parse(".debug_line\n0: 3\n1: 3\n2: 4\n");
        let lm = info.line_mapping.unwrap();
        assert_eq!(lm.lines(3), &[0, 1]);
        assert_eq!(lm.lines(4), &[2]);
        assert_eq!(lm.lines(9), &[] as &[u64]);
    }

    #[test]
    fn program_sections_are_skipped() {
        let info = parse(".text\n0 MOV R0, 1\n1 HALT\n.debug_line\n0: 0\n");
        assert_eq!(info.line_mapping.unwrap().address(0), Some(0));
        assert!(info.top_die.is_none());
    }

    const DIE_TREE: &str = r#"
.debug_info
compile_unit {
    primitive_type {
        id: 0;
        name: "signed_int";
        size: 1;
    }
    function {
        name: "main";
        begin_addr: 0;
        end_addr: 12;
        variable {
            name: "x";
            type: 0;
            location_expr: [base_offset -2];
        }
        scope {
            begin_addr: 4;
            end_addr: 9;
            variable {
                name: "y";
                type: 0;
                location_expr: [push_reg BP; push_imm -3; add];
            }
        }
    }
}
"#;

    #[test]
    fn die_tree_parsing() {
        let info = parse(DIE_TREE);
        let top = info.top_die.unwrap();
        assert_eq!(top.tag(), Tag::CompileUnit);
        assert_eq!(top.children().len(), 2);

        let fun = &top.children()[1];
        assert_eq!(fun.tag(), Tag::Function);
        assert_eq!(fun.name(), Some("main"));
        assert_eq!(fun.begin_addr(), Some(0));
        assert_eq!(fun.end_addr(), Some(12));
        assert!(fun.range_contains(0));
        assert!(fun.range_contains(11));
        assert!(!fun.range_contains(12));

        let var = &fun.children()[0];
        assert_eq!(var.tag(), Tag::Variable);
        assert_eq!(var.location_expr(), Some(&[LocExpr::BaseOffset(-2)][..]));

        let scope = &fun.children()[1];
        assert_eq!(scope.tag(), Tag::Scope);
        let y = &scope.children()[0];
        assert_eq!(
            y.location_expr().unwrap(),
            &[
                LocExpr::PushReg("BP".into()),
                LocExpr::PushImm(-3),
                LocExpr::Add
            ]
        );
    }

    #[test]
    fn find_by_id_searches_depth_first() {
        let info = parse(DIE_TREE);
        let top = info.top_die.unwrap();
        let primitive = top.find_by_id(0).unwrap();
        assert_eq!(primitive.tag(), Tag::PrimitiveType);
        assert_eq!(primitive.name(), Some("signed_int"));
        assert!(top.find_by_id(99).is_none());
    }

    #[test]
    fn structured_type_members() {
        let info = parse(
            r#"
.debug_info
compile_unit {
    structured_type {
        id: 1;
        name: "list";
        size: 2;
        members: [
            { name: "value"; type: 0; offset: 0; }
            { name: "next"; type: 2; offset: 1; }
        ];
    }
}
"#,
        );
        let top = info.top_die.unwrap();
        let st = &top.children()[0];
        let members = st.members().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(
            members[1],
            Member {
                name: "next".into(),
                type_id: 2,
                offset: 1
            }
        );
    }

    #[test]
    fn duplicate_attribute_fails() {
        let err = Parser::new(".debug_info\ncompile_unit { function { name: \"a\"; name: \"b\"; } }")
            .unwrap()
            .parse()
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn unknown_tag_fails_with_location() {
        let err = Parser::new(".debug_info\ncompile_unit {\n  gadget { }\n}")
            .unwrap()
            .parse()
            .unwrap_err();
        match err {
            Error::Parse { row, msg, .. } => {
                assert_eq!(row, 2);
                assert!(msg.contains("gadget"), "{}", msg);
            }
            other => panic!("expected parse error, got {}", other),
        }
    }

    #[test]
    fn unknown_attribute_fails() {
        let err = Parser::new(".debug_info\ncompile_unit { color: 3; }")
            .unwrap()
            .parse()
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn unknown_location_opcode_fails() {
        let err = Parser::new(
            ".debug_info\ncompile_unit { variable { location_expr: [push_all]; } }",
        )
        .unwrap()
        .parse()
        .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn debug_source_is_captured_verbatim() {
        let info = parse(
            ".debug_line\n0: 2\n.debug_source\nint main(void) {\n    return 5;\n}\n",
        );
        let source = info.source_code.unwrap();
        assert_eq!(source.line(0), Some("int main(void) {"));
        assert_eq!(source.line(1), Some("    return 5;"));
        assert_eq!(source.line(2), Some("}"));
        assert_eq!(source.line(3), None);
        assert!(info.line_mapping.is_some());
    }

    #[test]
    fn lines_range_stops_at_the_end() {
        let file = SourceFile::new("a\nb\nc\n");
        assert_eq!(file.lines_range(1, 5), vec!["b", "c"]);
        assert!(file.lines_range(7, 2).is_empty());
    }
}
