//! Source-level view of the debuggee.
//!
//! Maps between source lines and text addresses, resolves variables and
//! their types from the DIE tree, and implements source-level stepping on
//! top of the native primitives. Scope containment is decided purely by
//! address-range membership during a top-down walk of the tree.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, info, warn};

use crate::debug_info::{DebuggingInfo, Die, LineMapping, SourceFile, Tag};
use crate::error::{Error, Result};
use crate::location::{interpret, Location};
use crate::native::Native;
use crate::types::DebugEvent;

/// Category of a primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Signed,
    Unsigned,
    Float,
    Char,
    Bool,
}

impl PrimitiveKind {
    fn from_name(name: &str) -> Option<PrimitiveKind> {
        match name {
            "signed_int" => Some(PrimitiveKind::Signed),
            "unsigned_int" => Some(PrimitiveKind::Unsigned),
            "float" => Some(PrimitiveKind::Float),
            "char" => Some(PrimitiveKind::Char),
            "bool" => Some(PrimitiveKind::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveKind::Signed => "int",
            PrimitiveKind::Unsigned => "unsigned",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Char => "char",
            PrimitiveKind::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// One member of a reconstructed structured type. `typ` is `None` when
/// the member's own type could not be reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMember {
    pub name: String,
    pub typ: Option<Type>,
    pub offset: i64,
}

/// A reconstructed type.
///
/// Pointers store the pointee's entry id and name instead of the pointee
/// type itself; that indirection is what lets self-referential types
/// terminate.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Primitive {
        kind: PrimitiveKind,
        size: u64,
    },
    Structured {
        name: String,
        size: u64,
        members: Vec<StructuredMember>,
    },
    Pointer {
        pointee_id: u64,
        pointee_name: String,
        size: u64,
    },
}

impl Type {
    pub fn size(&self) -> u64 {
        match self {
            Type::Primitive { size, .. }
            | Type::Structured { size, .. }
            | Type::Pointer { size, .. } => *size,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive { kind, .. } => write!(f, "{}", kind),
            Type::Structured { name, .. } => write!(f, "{}", name),
            Type::Pointer { pointee_name, .. } => write!(f, "{}*", pointee_name),
        }
    }
}

/// Handles most logic behind source-level debugging.
#[derive(Default)]
pub struct Source {
    line_mapping: Option<LineMapping>,
    source_file: Option<SourceFile>,
    top_die: Option<Die>,
    /// Reconstructed types keyed by entry id; lives until the next
    /// debug-info load.
    types: HashMap<u64, Type>,
}

impl Source {
    pub fn new() -> Self {
        Source::default()
    }

    /// Build a source layer from everything a debug-info parse produced.
    pub fn from_debug_info(info: DebuggingInfo) -> Self {
        let mut source = Source::new();
        if let Some(mapping) = info.line_mapping {
            info!("found line mapping in debug info");
            source.register_line_mapping(mapping);
        }
        if let Some(file) = info.source_code {
            info!("found source code in debug info");
            source.register_source_file(file);
        }
        if let Some(die) = info.top_die {
            info!("found debugging entries in debug info");
            source.register_debug_info(die);
        }
        source
    }

    pub fn register_line_mapping(&mut self, mapping: LineMapping) {
        self.line_mapping = Some(mapping);
    }

    pub fn register_source_file(&mut self, file: SourceFile) {
        self.source_file = Some(file);
    }

    pub fn register_debug_info(&mut self, top_die: Die) {
        self.top_die = Some(top_die);
        self.types.clear();
    }

    // ── Line mapping ───────────────────────────────────────────────

    /// Address a source line maps to.
    pub fn line_to_addr(&self, line: u64) -> Option<u64> {
        self.line_mapping.as_ref()?.address(line)
    }

    /// Latest source line mapped to the address; several lines may alias
    /// one address and the greatest wins.
    pub fn addr_to_line(&self, address: u64) -> Option<u64> {
        self.line_mapping.as_ref()?.lines(address).last().copied()
    }

    fn resolve_line(&self, line: u64) -> Result<u64> {
        let mapping = self
            .line_mapping
            .as_ref()
            .ok_or_else(|| Error::Debugger("no debug info for line mapping".into()))?;
        mapping
            .address(line)
            .ok_or_else(|| Error::Debugger(format!("no debug info for line '{}'", line)))
    }

    // ── Source-line breakpoints ────────────────────────────────────

    /// Set a breakpoint at the address a source line maps to; returns the
    /// address.
    pub fn set_source_breakpoint(&self, native: &mut Native, line: u64) -> Result<u64> {
        let address = self.resolve_line(line)?;
        native.set_breakpoint(address)?;
        Ok(address)
    }

    pub fn unset_source_breakpoint(&self, native: &mut Native, line: u64) -> Result<u64> {
        let address = self.resolve_line(line)?;
        native.unset_breakpoint(address)?;
        Ok(address)
    }

    pub fn enable_source_breakpoint(&self, native: &mut Native, line: u64) -> Result<u64> {
        let address = self.resolve_line(line)?;
        native.enable_breakpoint(address)?;
        Ok(address)
    }

    pub fn disable_source_breakpoint(&self, native: &mut Native, line: u64) -> Result<u64> {
        let address = self.resolve_line(line)?;
        native.disable_breakpoint(address)?;
        Ok(address)
    }

    // ── Source text ────────────────────────────────────────────────

    /// A line of the program source, if the source is known.
    pub fn line(&self, idx: usize) -> Option<&str> {
        self.source_file.as_ref()?.line(idx)
    }

    /// Up to `amount` source lines starting at `idx`; stops at the end
    /// instead of failing. Empty without loaded source.
    pub fn lines_range(&self, idx: usize, amount: usize) -> Vec<&str> {
        match &self.source_file {
            Some(file) => file.lines_range(idx, amount),
            None => Vec::new(),
        }
    }

    // ── Functions ──────────────────────────────────────────────────

    /// Name of the function whose range covers the address. Functions are
    /// expected at the top level of the tree; nesting is unsupported.
    pub fn function_name_at(&self, address: u64) -> Option<&str> {
        let top = self.top_die.as_ref()?;
        top.children()
            .iter()
            .filter(|die| die.tag() == Tag::Function)
            .find(|die| die.range_contains(address))
            .and_then(Die::name)
    }

    /// `[begin, end)` addresses of the named function.
    pub fn function_range(&self, name: &str) -> Option<(u64, u64)> {
        let top = self.top_die.as_ref()?;
        top.children()
            .iter()
            .filter(|die| die.tag() == Tag::Function)
            .find(|die| die.name() == Some(name))
            .and_then(|die| Some((die.begin_addr()?, die.end_addr()?)))
    }

    // ── Variables ──────────────────────────────────────────────────

    /// Variables visible at the address, innermost definitions shadowing
    /// outer ones of the same name.
    fn active_variables(&self, address: u64) -> BTreeMap<String, &Die> {
        let mut result = BTreeMap::new();
        if let Some(top) = &self.top_die {
            collect_variables(address, top, &mut result);
        }
        result
    }

    /// Names of the variables in scope at the address.
    pub fn scoped_variables(&self, address: u64) -> BTreeSet<String> {
        self.active_variables(address).into_keys().collect()
    }

    fn variable_die(&self, address: u64, name: &str) -> Option<&Die> {
        self.active_variables(address).remove(name)
    }

    /// Where the named variable lives at the current IP.
    ///
    /// `None` when the variable is unknown, carries no location program,
    /// or its program cannot be evaluated. Evaluation may issue several
    /// calls into the debuggee.
    pub fn variable_location(
        &self,
        native: &mut Native,
        name: &str,
    ) -> Result<Option<Location>> {
        let address = native.ip()?;
        let exprs = match self.variable_die(address, name).and_then(Die::location_expr) {
            Some(exprs) if !exprs.is_empty() => exprs,
            _ => return Ok(None),
        };
        match interpret(exprs, native) {
            Ok(location) => Ok(Some(location)),
            Err(Error::Interpret(msg)) => {
                warn!("location of '{}' unavailable: {}", name, msg);
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Reconstructed type of the named variable at the current IP.
    pub fn variable_type(&mut self, native: &mut Native, name: &str) -> Result<Option<Type>> {
        let address = native.ip()?;
        let type_id = match self.variable_die(address, name).and_then(Die::type_id) {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(self.reconstruct_type(type_id))
    }

    // ── Types ──────────────────────────────────────────────────────

    /// Build the type for an entry id, reusing previously built results.
    pub fn reconstruct_type(&mut self, id: u64) -> Option<Type> {
        let top = self.top_die.as_ref()?;
        build_type(top, &mut self.types, id)
    }

    // ── Source-level stepping ──────────────────────────────────────

    /// Step a single instruction, then keep raw-stepping until some line
    /// maps to the new IP or a non-singlestep event arrives.
    pub fn step_in(&self, native: &mut Native) -> Result<DebugEvent> {
        let mut event = native.single_step()?;
        while event == DebugEvent::Singlestep && self.addr_to_line(native.ip()?).is_none() {
            event = native.raw_single_step()?;
        }
        Ok(event)
    }

    /// Like `step_in`, but calls are stepped over as one step while still
    /// honoring breakpoints inside them.
    pub fn step_over(&self, native: &mut Native) -> Result<DebugEvent> {
        let mut event = native.step_over(true)?;
        while event == DebugEvent::Singlestep && self.addr_to_line(native.ip()?).is_none() {
            event = native.step_over(false)?;
        }
        Ok(event)
    }
}

/// Pre-order walk collecting visible variables; descending into a scope
/// or function requires its range to cover the address, so deeper
/// definitions overwrite shallower ones.
fn collect_variables<'a>(
    address: u64,
    die: &'a Die,
    result: &mut BTreeMap<String, &'a Die>,
) {
    if die.tag() == Tag::Variable {
        if let Some(name) = die.name() {
            result.insert(name.to_string(), die);
        }
        return;
    }
    if matches!(die.tag(), Tag::Scope | Tag::Function) && !die.range_contains(address) {
        return;
    }
    for child in die.children() {
        collect_variables(address, child, result);
    }
}

fn build_type(top: &Die, cache: &mut HashMap<u64, Type>, id: u64) -> Option<Type> {
    if let Some(cached) = cache.get(&id) {
        return Some(cached.clone());
    }
    let die = top.find_by_id(id)?;
    match die.tag() {
        Tag::PrimitiveType => {
            let name = die.name()?;
            let Some(kind) = PrimitiveKind::from_name(name) else {
                info!("entry {}: unsupported primitive type '{}'", id, name);
                return None;
            };
            let Some(size) = die.size() else {
                info!("entry {}: size not found", id);
                return None;
            };
            Some(Type::Primitive { kind, size })
        }
        Tag::StructuredType => {
            let name = die.name()?.to_string();
            let Some(size) = die.size() else {
                return Some(Type::Structured {
                    name,
                    size: 0,
                    members: Vec::new(),
                });
            };
            let Some(members) = die.members() else {
                return Some(Type::Structured {
                    name,
                    size,
                    members: Vec::new(),
                });
            };
            let members = members
                .iter()
                .map(|m| StructuredMember {
                    name: m.name.clone(),
                    typ: build_type(top, cache, m.type_id),
                    offset: m.offset,
                })
                .collect();
            let result = Type::Structured {
                name,
                size,
                members,
            };
            cache.insert(id, result.clone());
            Some(result)
        }
        Tag::PointerType => {
            let Some(pointee_id) = die.type_id() else {
                debug!("entry {}: pointer without a pointee type", id);
                return None;
            };
            let size = die.size()?;
            let pointee_name = top.find_by_id(pointee_id)?.name()?.to_string();
            let result = Type::Pointer {
                pointee_id,
                pointee_name,
                size,
            };
            cache.insert(id, result.clone());
            Some(result)
        }
        _ => {
            warn!("entry {} does not describe a type", id);
            None
        }
    }
}
