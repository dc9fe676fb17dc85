//! GenICam feature engine.
//!
//! The engine owns the parsed document and resolves typed feature accesses
//! into register transfers. A read of `Width` may walk `pValue` into an
//! `IntReg`, resolve its address through `pAddress`, consult the register
//! cache, and interpret the transferred bytes through endianness, sign and
//! bit-range properties; converters and swiss knives run their formulas
//! through the [`evaluator`]. All node state that changes at runtime
//! (change counters, local values, the cache) sits behind interior locks so
//! a `NodeMap` can be shared between the control and streaming sides.

pub mod cache;
pub mod evaluator;
pub mod port;
pub mod register;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, trace, warn};

use genapi_xml::{parse_number, Document, Node, NodeId, NodeKind};

pub use cache::{Cachable, RegisterCache, RegisterCachePolicy};
pub use evaluator::{EvalError, Evaluator, Expression, Value};
pub use port::{document_uses_legacy_access, PortIo, PortRequest, RegisterIo};
pub use register::{BitRange, Endianness, Sign};

/// Recursion guard for `pValue`/`pAddress` chains.
const MAX_RESOLUTION_DEPTH: usize = 32;

/// Errors raised by feature accesses.
#[derive(Debug, Error)]
pub enum GenApiError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("[{node}] expected a {expected} feature")]
    TypeMismatch { node: String, expected: &'static str },
    #[error("[{node}] {source}")]
    Expression {
        node: String,
        #[source]
        source: EvalError,
    },
    #[error("[{node}] pValue chain is circular or too deep")]
    InvalidPvalue { node: String },
    #[error("[{node}] no value source defined")]
    PvalueNotDefined { node: String },
    #[error("[{node}] value {value} out of range [{min}, {max}]")]
    OutOfRange {
        node: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("[{node}] access denied")]
    AccessDenied { node: String },
    #[error("[{node}] invalid bit range {lsb}..{msb}")]
    InvalidBitRange { node: String, lsb: u8, msb: u8 },
    #[error("[{node}] enum entry not found: {entry}")]
    EnumEntryNotFound { node: String, entry: String },
    #[error("[{node}] enumeration has no entry")]
    EmptyEnumeration { node: String },
    #[error("[{node}] property not defined: {property}")]
    PropertyNotDefined { node: String, property: &'static str },
    #[error("[{node}] cannot be set from a string")]
    SetFromStringUndefined { node: String },
    #[error("[{node}] invalid syntax: {text}")]
    InvalidSyntax { node: String, text: String },
    #[error("[{node}] chunk {chunk_id:#010x} not found")]
    ChunkNotFound { node: String, chunk_id: u32 },
    #[error("io: {0}")]
    Io(String),
}

impl GenApiError {
    fn expression(node: &str, source: EvalError) -> Self {
        GenApiError::Expression {
            node: node.to_string(),
            source,
        }
    }
}

/// Range check behaviour on integer and float writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeCheckPolicy {
    /// Writes are forwarded unchecked.
    #[default]
    Disable,
    /// Out-of-range writes fail.
    Enable,
    /// As `Enable`, with the checked bounds logged.
    Debug,
}

/// Access mode check behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessCheckPolicy {
    /// Reads of write-only and writes of read-only nodes are forwarded.
    #[default]
    Disable,
    /// Such accesses fail with `AccessDenied`.
    Enable,
}

/// Effective access mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    RO,
    WO,
    RW,
}

impl AccessMode {
    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "RO" => Some(AccessMode::RO),
            "WO" => Some(AccessMode::WO),
            "RW" => Some(AccessMode::RW),
            _ => None,
        }
    }

    const fn readable(self) -> bool {
        !matches!(self, AccessMode::WO)
    }

    const fn writable(self) -> bool {
        !matches!(self, AccessMode::RO)
    }

    fn intersect(self, other: AccessMode) -> AccessMode {
        match (self.readable() && other.readable(), self.writable() && other.writable()) {
            (true, true) => AccessMode::RW,
            (true, false) => AccessMode::RO,
            _ => AccessMode::WO,
        }
    }
}

#[derive(Debug, Clone)]
enum LocalValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Resolved register transfer parameters.
#[derive(Debug, Clone)]
struct RegSpec {
    address: u64,
    length: usize,
    endianness: Endianness,
    sign: Sign,
    cachable: Cachable,
    port: Option<String>,
    chunk_id: Option<u32>,
    /// Bit range for masked registers and struct entries.
    range: Option<BitRange>,
    /// Node whose cache entry covers the transfer (the register node).
    cache_node: NodeId,
}

/// The feature engine: document plus runtime state.
#[derive(Debug)]
pub struct NodeMap {
    document: Document,
    change_counts: Vec<AtomicU64>,
    local_values: RwLock<HashMap<NodeId, LocalValue>>,
    cache: RegisterCache,
    cache_policy: RegisterCachePolicy,
    range_check_policy: RangeCheckPolicy,
    access_check_policy: AccessCheckPolicy,
    default_endianness: Endianness,
    legacy_access: bool,
}

impl NodeMap {
    /// Build the engine from a parsed document.
    pub fn new(document: Document) -> Self {
        let legacy_access = document_uses_legacy_access(&document);
        let change_counts = (0..document.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            document,
            change_counts,
            local_values: RwLock::new(HashMap::new()),
            cache: RegisterCache::new(),
            cache_policy: RegisterCachePolicy::default(),
            range_check_policy: RangeCheckPolicy::default(),
            access_check_policy: AccessCheckPolicy::default(),
            default_endianness: Endianness::default(),
            legacy_access,
        }
    }

    /// Parse XML and build the engine.
    pub fn from_xml(xml: &str) -> Result<Self, genapi_xml::XmlError> {
        Ok(Self::new(genapi_xml::parse(xml)?))
    }

    /// Access the underlying document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Set the global register cache policy.
    pub fn set_cache_policy(&mut self, policy: RegisterCachePolicy) {
        self.cache_policy = policy;
    }

    /// Set the range check policy.
    pub fn set_range_check_policy(&mut self, policy: RangeCheckPolicy) {
        self.range_check_policy = policy;
    }

    /// Set the access check policy.
    pub fn set_access_check_policy(&mut self, policy: AccessCheckPolicy) {
        self.access_check_policy = policy;
    }

    /// Default byte order for registers without an `Endianess` property.
    pub fn set_default_endianness(&mut self, endianness: Endianness) {
        self.default_endianness = endianness;
    }

    /// Whether the document mandates legacy single-register accesses.
    pub fn uses_legacy_access(&self) -> bool {
        self.legacy_access
    }

    /// Number of observed writes to the named node.
    pub fn change_count(&self, name: &str) -> Result<u64, GenApiError> {
        let id = self.node_id(name)?;
        Ok(self.change_counts[id].load(Ordering::SeqCst))
    }

    /// Drop every cached register transfer.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Drop the cached transfer of one node.
    pub fn invalidate(&self, name: &str) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        self.cache.invalidate(id);
        Ok(())
    }

    /// Node kind by name.
    pub fn kind(&self, name: &str) -> Option<NodeKind> {
        self.document.find(name).map(|id| self.document.node(id).kind)
    }

    /// Whether the named feature exists.
    pub fn has_node(&self, name: &str) -> bool {
        self.document.find(name).is_some()
    }

    fn node_id(&self, name: &str) -> Result<NodeId, GenApiError> {
        self.document
            .find(name)
            .ok_or_else(|| GenApiError::NodeNotFound(name.to_string()))
    }

    fn node(&self, id: NodeId) -> &Node {
        self.document.node(id)
    }

    fn node_name(&self, id: NodeId) -> &str {
        self.node(id).name.as_deref().unwrap_or("<anonymous>")
    }

    fn bump(&self, id: NodeId) {
        self.change_counts[id].fetch_add(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Typed public accessors.
    // ------------------------------------------------------------------

    /// Read an integer feature.
    pub fn get_integer(&self, name: &str, io: &dyn PortIo) -> Result<i64, GenApiError> {
        let id = self.node_id(name)?;
        self.check_readable(id)?;
        self.resolve_int(id, io, 0)
    }

    /// Write an integer feature.
    pub fn set_integer(&self, name: &str, value: i64, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        self.check_writable(id)?;
        self.range_check_int(id, value, io)?;
        self.write_int(id, value, io, 0)
    }

    /// Bounds and increment of an integer feature: `(min, max, inc)`.
    pub fn integer_bounds(&self, name: &str, io: &dyn PortIo) -> Result<(i64, i64, i64), GenApiError> {
        let id = self.node_id(name)?;
        self.int_bounds(id, io, 0)
    }

    /// Read a float feature.
    pub fn get_float(&self, name: &str, io: &dyn PortIo) -> Result<f64, GenApiError> {
        let id = self.node_id(name)?;
        self.check_readable(id)?;
        self.resolve_float(id, io, 0)
    }

    /// Write a float feature.
    pub fn set_float(&self, name: &str, value: f64, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        self.check_writable(id)?;
        self.range_check_float(id, value, io)?;
        self.write_float(id, value, io, 0)
    }

    /// Bounds of a float feature: `(min, max)`.
    pub fn float_bounds(&self, name: &str, io: &dyn PortIo) -> Result<(f64, f64), GenApiError> {
        let id = self.node_id(name)?;
        let min = match self.prop_float_opt(id, "Min", "pMin", io, 0)? {
            Some(value) => value,
            None => f64::MIN,
        };
        let max = match self.prop_float_opt(id, "Max", "pMax", io, 0)? {
            Some(value) => value,
            None => f64::MAX,
        };
        Ok((min, max))
    }

    /// Read a boolean feature.
    pub fn get_boolean(&self, name: &str, io: &dyn PortIo) -> Result<bool, GenApiError> {
        let id = self.node_id(name)?;
        self.check_readable(id)?;
        let node = self.node(id);
        let raw = self.resolve_int(id, io, 0)?;
        let on_value = self.literal_int(node, "OnValue").unwrap_or(1);
        Ok(raw == on_value)
    }

    /// Write a boolean feature.
    pub fn set_boolean(&self, name: &str, value: bool, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        self.check_writable(id)?;
        let node = self.node(id);
        let raw = if value {
            self.literal_int(node, "OnValue").unwrap_or(1)
        } else {
            self.literal_int(node, "OffValue").unwrap_or(0)
        };
        self.write_int(id, raw, io, 0)
    }

    /// Read a string feature.
    pub fn get_string(&self, name: &str, io: &dyn PortIo) -> Result<String, GenApiError> {
        let id = self.node_id(name)?;
        self.check_readable(id)?;
        match self.node(id).kind {
            NodeKind::Enumeration => self.get_enum(name, io),
            _ => self.resolve_string(id, io, 0),
        }
    }

    /// Write a string feature.
    pub fn set_string(&self, name: &str, value: &str, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        self.check_writable(id)?;
        self.write_string(id, value, io, 0)
    }

    /// Current entry name of an enumeration.
    pub fn get_enum(&self, name: &str, io: &dyn PortIo) -> Result<String, GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        if node.kind != NodeKind::Enumeration {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "enumeration",
            });
        }
        self.check_readable(id)?;
        let current = self.resolve_int(id, io, 0)?;
        for &child in &node.children {
            let entry = self.node(child);
            if entry.kind != NodeKind::EnumEntry || !self.entry_selectable(child, io)? {
                continue;
            }
            if self.enum_entry_value(child, io)? == current {
                return Ok(entry.name.clone().unwrap_or_default());
            }
        }
        Err(GenApiError::EnumEntryNotFound {
            node: name.to_string(),
            entry: format!("value {current}"),
        })
    }

    /// Select an enumeration entry by name.
    pub fn set_enum(&self, name: &str, entry: &str, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        if node.kind != NodeKind::Enumeration {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "enumeration",
            });
        }
        self.check_writable(id)?;
        for &child in &node.children {
            let candidate = self.node(child);
            if candidate.kind == NodeKind::EnumEntry && candidate.name.as_deref() == Some(entry) {
                let value = self.enum_entry_value(child, io)?;
                return self.write_int(id, value, io, 0);
            }
        }
        Err(GenApiError::EnumEntryNotFound {
            node: name.to_string(),
            entry: entry.to_string(),
        })
    }

    /// Names of the implemented entries of an enumeration.
    pub fn enum_entries(&self, name: &str, io: &dyn PortIo) -> Result<Vec<String>, GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        if node.kind != NodeKind::Enumeration {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "enumeration",
            });
        }
        let mut entries = Vec::new();
        for &child in &node.children {
            let entry = self.node(child);
            if entry.kind == NodeKind::EnumEntry && self.entry_selectable(child, io)? {
                if let Some(entry_name) = &entry.name {
                    entries.push(entry_name.clone());
                }
            }
        }
        if entries.is_empty() {
            return Err(GenApiError::EmptyEnumeration {
                node: name.to_string(),
            });
        }
        Ok(entries)
    }

    /// Execute a command feature.
    pub fn execute(&self, name: &str, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        if node.kind != NodeKind::Command {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "command",
            });
        }
        self.check_writable(id)?;
        let value = match self.prop_int_opt(id, "CommandValue", "pCommandValue", io, 0)? {
            Some(value) => value,
            None => 1,
        };
        debug!(command = name, value, "executing command");
        self.write_int(id, value, io, 0)
    }

    /// Read the raw bytes of a register-family node.
    pub fn get_register(&self, name: &str, io: &dyn PortIo) -> Result<Vec<u8>, GenApiError> {
        let id = self.node_id(name)?;
        if !self.node(id).kind.is_register() {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "register",
            });
        }
        self.check_readable(id)?;
        let spec = self.reg_spec(id, io, 0)?;
        self.register_read(id, &spec, io)
    }

    /// Write the raw bytes of a register-family node.
    pub fn set_register(&self, name: &str, data: &[u8], io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        if !self.node(id).kind.is_register() {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "register",
            });
        }
        self.check_writable(id)?;
        let spec = self.reg_spec(id, io, 0)?;
        if data.len() != spec.length {
            return Err(GenApiError::OutOfRange {
                node: name.to_string(),
                value: format!("{} bytes", data.len()),
                min: format!("{} bytes", spec.length),
                max: format!("{} bytes", spec.length),
            });
        }
        self.register_write(id, &spec, data, io)
    }

    /// Format any readable feature as a string.
    pub fn get_as_string(&self, name: &str, io: &dyn PortIo) -> Result<String, GenApiError> {
        let id = self.node_id(name)?;
        match self.node(id).kind {
            NodeKind::Integer
            | NodeKind::IntReg
            | NodeKind::MaskedIntReg
            | NodeKind::IntSwissKnife
            | NodeKind::IntConverter
            | NodeKind::StructEntry => Ok(self.get_integer(name, io)?.to_string()),
            NodeKind::Float | NodeKind::FloatReg | NodeKind::SwissKnife | NodeKind::Converter => {
                Ok(self.get_float(name, io)?.to_string())
            }
            NodeKind::Boolean => Ok(self.get_boolean(name, io)?.to_string()),
            NodeKind::Enumeration => self.get_enum(name, io),
            NodeKind::StringNode | NodeKind::StringReg => self.get_string(name, io),
            _ => Err(GenApiError::SetFromStringUndefined {
                node: name.to_string(),
            }),
        }
    }

    /// Parse a string representation and write the feature.
    pub fn set_from_string(&self, name: &str, value: &str, io: &dyn PortIo) -> Result<(), GenApiError> {
        let id = self.node_id(name)?;
        match self.node(id).kind {
            NodeKind::Integer
            | NodeKind::IntReg
            | NodeKind::MaskedIntReg
            | NodeKind::IntConverter
            | NodeKind::StructEntry => {
                let parsed = parse_number(value).ok_or_else(|| GenApiError::InvalidSyntax {
                    node: name.to_string(),
                    text: value.to_string(),
                })?;
                self.set_integer(name, parsed, io)
            }
            NodeKind::Float | NodeKind::FloatReg | NodeKind::Converter => {
                let parsed: f64 = value.trim().parse().map_err(|_| GenApiError::InvalidSyntax {
                    node: name.to_string(),
                    text: value.to_string(),
                })?;
                self.set_float(name, parsed, io)
            }
            NodeKind::Boolean => {
                let parsed = match value.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    _ => {
                        return Err(GenApiError::InvalidSyntax {
                            node: name.to_string(),
                            text: value.to_string(),
                        })
                    }
                };
                self.set_boolean(name, parsed, io)
            }
            NodeKind::Enumeration => self.set_enum(name, value, io),
            NodeKind::StringNode | NodeKind::StringReg => self.set_string(name, value, io),
            NodeKind::Command => self.execute(name, io),
            _ => Err(GenApiError::SetFromStringUndefined {
                node: name.to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Implementation / availability / selectors.
    // ------------------------------------------------------------------

    /// Whether the feature is implemented on this device.
    pub fn is_implemented(&self, name: &str, io: &dyn PortIo) -> Result<bool, GenApiError> {
        let id = self.node_id(name)?;
        self.flag_property(id, "pIsImplemented", io)
    }

    /// Whether the feature is currently available.
    pub fn is_available(&self, name: &str, io: &dyn PortIo) -> Result<bool, GenApiError> {
        let id = self.node_id(name)?;
        self.flag_property(id, "pIsAvailable", io)
    }

    /// Whether the feature is currently locked against writes.
    pub fn is_locked(&self, name: &str, io: &dyn PortIo) -> Result<bool, GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        match node.property("pIsLocked") {
            Some(target) => {
                let target_id = self.node_id(target)?;
                Ok(self.resolve_int(target_id, io, 0)? != 0)
            }
            None => Ok(false),
        }
    }

    fn flag_property(&self, id: NodeId, key: &str, io: &dyn PortIo) -> Result<bool, GenApiError> {
        match self.node(id).properties(key).next() {
            Some(property) => {
                let target = self.node_id(&property.value)?;
                Ok(self.resolve_int(target, io, 0)? != 0)
            }
            None => Ok(true),
        }
    }

    /// Features selected by the named selector (its `pSelected` targets).
    pub fn selected_features(&self, name: &str) -> Result<Vec<String>, GenApiError> {
        let id = self.node_id(name)?;
        Ok(self
            .node(id)
            .properties("pSelected")
            .map(|p| p.value.clone())
            .collect())
    }

    /// All selector features of the document.
    pub fn selectors(&self) -> Vec<String> {
        self.document
            .iter()
            .filter(|(_, node)| node.has_property("pSelected"))
            .filter_map(|(_, node)| node.name.clone())
            .collect()
    }

    /// Selectors that gate the named feature.
    pub fn selectors_of(&self, name: &str) -> Vec<String> {
        self.document
            .iter()
            .filter(|(_, node)| node.properties("pSelected").any(|p| p.value == name))
            .filter_map(|(_, node)| node.name.clone())
            .collect()
    }

    /// Names of the features under a category, in document order.
    pub fn category_features(&self, name: &str) -> Result<Vec<String>, GenApiError> {
        let id = self.node_id(name)?;
        let node = self.node(id);
        if node.kind != NodeKind::Category {
            return Err(GenApiError::TypeMismatch {
                node: name.to_string(),
                expected: "category",
            });
        }
        Ok(node.properties("pFeature").map(|p| p.value.clone()).collect())
    }

    // ------------------------------------------------------------------
    // Access and range checks.
    // ------------------------------------------------------------------

    /// Effective access mode: the intersection of the imposed mode and the
    /// mode of the underlying register chain.
    pub fn access_mode(&self, name: &str) -> Result<AccessMode, GenApiError> {
        let id = self.node_id(name)?;
        Ok(self.effective_access(id, 0))
    }

    fn effective_access(&self, id: NodeId, depth: usize) -> AccessMode {
        if depth > MAX_RESOLUTION_DEPTH {
            return AccessMode::RW;
        }
        let node = self.node(id);
        let mut mode = node
            .imposed_access_mode
            .as_deref()
            .and_then(AccessMode::parse)
            .unwrap_or(AccessMode::RW);
        if let Some(text) = node.property("AccessMode") {
            if let Some(own) = AccessMode::parse(text) {
                mode = mode.intersect(own);
            }
        }
        if let Some(target) = node.property("pValue") {
            if let Some(target_id) = self.document.find(target) {
                mode = mode.intersect(self.effective_access(target_id, depth + 1));
            }
        }
        if node.kind == NodeKind::StructEntry {
            if let Some(parent) = node.parent {
                mode = mode.intersect(self.effective_access(parent, depth + 1));
            }
        }
        // Swiss knives are computed values and never writable.
        if matches!(node.kind, NodeKind::SwissKnife | NodeKind::IntSwissKnife) {
            mode = mode.intersect(AccessMode::RO);
        }
        mode
    }

    fn check_readable(&self, id: NodeId) -> Result<(), GenApiError> {
        if self.access_check_policy == AccessCheckPolicy::Enable
            && !self.effective_access(id, 0).readable()
        {
            return Err(GenApiError::AccessDenied {
                node: self.node_name(id).to_string(),
            });
        }
        Ok(())
    }

    fn check_writable(&self, id: NodeId) -> Result<(), GenApiError> {
        if self.access_check_policy == AccessCheckPolicy::Enable
            && !self.effective_access(id, 0).writable()
        {
            return Err(GenApiError::AccessDenied {
                node: self.node_name(id).to_string(),
            });
        }
        Ok(())
    }

    fn range_check_int(&self, id: NodeId, value: i64, io: &dyn PortIo) -> Result<(), GenApiError> {
        if self.range_check_policy == RangeCheckPolicy::Disable {
            return Ok(());
        }
        let (min, max, inc) = self.int_bounds(id, io, 0)?;
        if self.range_check_policy == RangeCheckPolicy::Debug {
            debug!(node = self.node_name(id), value, min, max, inc, "range check");
        }
        let misaligned = inc > 1 && value > min && (value - min) % inc != 0;
        if value < min || value > max || misaligned {
            return Err(GenApiError::OutOfRange {
                node: self.node_name(id).to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    fn range_check_float(&self, id: NodeId, value: f64, io: &dyn PortIo) -> Result<(), GenApiError> {
        if self.range_check_policy == RangeCheckPolicy::Disable {
            return Ok(());
        }
        let min = self.prop_float_opt(id, "Min", "pMin", io, 0)?.unwrap_or(f64::MIN);
        let max = self.prop_float_opt(id, "Max", "pMax", io, 0)?.unwrap_or(f64::MAX);
        if self.range_check_policy == RangeCheckPolicy::Debug {
            debug!(node = self.node_name(id), value, min, max, "range check");
        }
        if value < min || value > max {
            return Err(GenApiError::OutOfRange {
                node: self.node_name(id).to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    fn int_bounds(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<(i64, i64, i64), GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        let inc = self.prop_int_opt(id, "Inc", "pInc", io, depth)?.unwrap_or(1);
        let own_min = self.prop_int_opt(id, "Min", "pMin", io, depth)?;
        let own_max = self.prop_int_opt(id, "Max", "pMax", io, depth)?;

        let (mut min, mut max) = match node.kind {
            NodeKind::IntReg | NodeKind::Register => {
                let spec = self.reg_spec(id, io, depth)?;
                register::field_bounds((spec.length * 8).min(64) as u32, spec.sign)
            }
            NodeKind::MaskedIntReg | NodeKind::StructEntry => {
                let spec = self.reg_spec(id, io, depth)?;
                let range = spec.range.unwrap_or_else(|| BitRange::full(spec.length));
                register::field_bounds(range.width(), spec.sign)
            }
            _ => match node.property("pValue") {
                Some(target) => {
                    let target_id = self.node_id(target)?;
                    let (min, max, _) = self.int_bounds(target_id, io, depth + 1)?;
                    (min, max)
                }
                None => (i64::MIN, i64::MAX),
            },
        };
        if let Some(own) = own_min {
            min = min.max(own);
        }
        if let Some(own) = own_max {
            max = max.min(own);
        }
        Ok((min, max, inc.max(1)))
    }

    // ------------------------------------------------------------------
    // Value resolution.
    // ------------------------------------------------------------------

    fn resolve_int(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<i64, GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        match node.kind {
            NodeKind::IntReg | NodeKind::Register => {
                let spec = self.reg_spec(id, io, depth)?;
                let bytes = self.register_read(id, &spec, io)?;
                register::extract_field(
                    self.node_name(id),
                    &bytes,
                    BitRange::full(bytes.len()),
                    spec.endianness,
                    spec.sign,
                )
            }
            NodeKind::MaskedIntReg | NodeKind::StructEntry => {
                let spec = self.reg_spec(id, io, depth)?;
                let bytes = self.register_read(spec.cache_node, &spec, io)?;
                let range = spec.range.unwrap_or_else(|| BitRange::full(bytes.len()));
                register::extract_field(self.node_name(id), &bytes, range, spec.endianness, spec.sign)
            }
            NodeKind::IntSwissKnife | NodeKind::SwissKnife => self.eval_formula_int(id, io, depth),
            NodeKind::IntConverter | NodeKind::Converter => {
                Ok(self.converter_read(id, io, depth)?.as_int())
            }
            NodeKind::Float | NodeKind::FloatReg => Ok(self.resolve_float(id, io, depth)? as i64),
            _ => self.value_source_int(id, io, depth),
        }
    }

    /// Resolve the `Value`/`pValue`/`pIndex` chain of a non-register node.
    fn value_source_int(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<i64, GenApiError> {
        let node = self.node(id);
        if let Some(target) = node.property("pValue") {
            let target_id = self.node_id(target)?;
            return self.resolve_int(target_id, io, depth + 1);
        }
        if let Some(index_node) = node.property("pIndex") {
            return self.indexed_int(id, index_node, io, depth);
        }
        if node.has_property("Value") {
            if let Some(LocalValue::Int(value)) =
                self.local_values.read().expect("lock poisoned").get(&id)
            {
                return Ok(*value);
            }
            let text = node.property("Value").unwrap_or_default();
            return parse_number(text).ok_or_else(|| GenApiError::InvalidSyntax {
                node: self.node_name(id).to_string(),
                text: text.to_string(),
            });
        }
        Err(GenApiError::PvalueNotDefined {
            node: self.node_name(id).to_string(),
        })
    }

    fn indexed_int(
        &self,
        id: NodeId,
        index_node: &str,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<i64, GenApiError> {
        let index_id = self.node_id(index_node)?;
        let index = self.resolve_int(index_id, io, depth + 1)?;
        let node = self.node(id);
        for property in node.properties("ValueIndexed") {
            if property.index == Some(index) {
                return parse_number(&property.value).ok_or_else(|| GenApiError::InvalidSyntax {
                    node: self.node_name(id).to_string(),
                    text: property.value.clone(),
                });
            }
        }
        for property in node.properties("pValueIndexed") {
            if property.index == Some(index) {
                let target_id = self.node_id(&property.value)?;
                return self.resolve_int(target_id, io, depth + 1);
            }
        }
        if let Some(text) = node.property("ValueDefault") {
            return parse_number(text).ok_or_else(|| GenApiError::InvalidSyntax {
                node: self.node_name(id).to_string(),
                text: text.to_string(),
            });
        }
        if let Some(target) = node.property("pValueDefault") {
            let target_id = self.node_id(target)?;
            return self.resolve_int(target_id, io, depth + 1);
        }
        Err(GenApiError::PropertyNotDefined {
            node: self.node_name(id).to_string(),
            property: "ValueIndexed",
        })
    }

    fn write_int(&self, id: NodeId, value: i64, io: &dyn PortIo, depth: usize) -> Result<(), GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        let result = match node.kind {
            NodeKind::IntReg | NodeKind::Register => {
                let spec = self.reg_spec(id, io, depth)?;
                let mut bytes = vec![0u8; spec.length];
                register::insert_field(
                    self.node_name(id),
                    &mut bytes,
                    BitRange::full(spec.length),
                    spec.endianness,
                    spec.sign,
                    value,
                )?;
                self.register_write(id, &spec, &bytes, io)
            }
            NodeKind::MaskedIntReg | NodeKind::StructEntry => {
                let spec = self.reg_spec(id, io, depth)?;
                // Read-modify-write; the read may be served by the cache.
                let mut bytes = self.register_read(spec.cache_node, &spec, io)?;
                let range = spec.range.unwrap_or_else(|| BitRange::full(bytes.len()));
                register::insert_field(
                    self.node_name(id),
                    &mut bytes,
                    range,
                    spec.endianness,
                    spec.sign,
                    value,
                )?;
                self.register_write(spec.cache_node, &spec, &bytes, io)
            }
            NodeKind::IntConverter | NodeKind::Converter => {
                self.converter_write(id, Value::Int(value), io, depth)
            }
            NodeKind::IntSwissKnife | NodeKind::SwissKnife => Err(GenApiError::AccessDenied {
                node: self.node_name(id).to_string(),
            }),
            NodeKind::Float | NodeKind::FloatReg => self.write_float(id, value as f64, io, depth),
            _ => self.value_sink_int(id, value, io, depth),
        };
        if result.is_ok() {
            self.bump(id);
        }
        result
    }

    fn value_sink_int(&self, id: NodeId, value: i64, io: &dyn PortIo, depth: usize) -> Result<(), GenApiError> {
        let node = self.node(id);
        if let Some(target) = node.property("pValue") {
            let target_id = self.node_id(target)?;
            return self.write_int(target_id, value, io, depth + 1);
        }
        if node.has_property("Value") {
            self.local_values
                .write()
                .expect("lock poisoned")
                .insert(id, LocalValue::Int(value));
            return Ok(());
        }
        if node.has_property("pIndex") {
            // Indexed values are a read-only switch.
            return Err(GenApiError::AccessDenied {
                node: self.node_name(id).to_string(),
            });
        }
        Err(GenApiError::PvalueNotDefined {
            node: self.node_name(id).to_string(),
        })
    }

    fn resolve_float(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<f64, GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        match node.kind {
            NodeKind::FloatReg => {
                let spec = self.reg_spec(id, io, depth)?;
                let bytes = self.register_read(id, &spec, io)?;
                let raw = register::bytes_to_unsigned(&bytes, spec.endianness);
                match bytes.len() {
                    4 => Ok(f32::from_bits(raw as u32) as f64),
                    8 => Ok(f64::from_bits(raw)),
                    _ => Err(GenApiError::InvalidBitRange {
                        node: self.node_name(id).to_string(),
                        lsb: 0,
                        msb: (bytes.len() * 8).saturating_sub(1) as u8,
                    }),
                }
            }
            NodeKind::SwissKnife | NodeKind::IntSwissKnife => {
                self.eval_formula_double(id, io, depth)
            }
            NodeKind::Converter | NodeKind::IntConverter => {
                Ok(self.converter_read(id, io, depth)?.as_double())
            }
            NodeKind::Float => {
                if let Some(target) = node.property("pValue") {
                    let target_id = self.node_id(target)?;
                    return self.resolve_float(target_id, io, depth + 1);
                }
                if node.has_property("Value") {
                    if let Some(LocalValue::Float(value)) =
                        self.local_values.read().expect("lock poisoned").get(&id)
                    {
                        return Ok(*value);
                    }
                    let text = node.property("Value").unwrap_or_default();
                    return text.trim().parse().map_err(|_| GenApiError::InvalidSyntax {
                        node: self.node_name(id).to_string(),
                        text: text.to_string(),
                    });
                }
                Err(GenApiError::PvalueNotDefined {
                    node: self.node_name(id).to_string(),
                })
            }
            _ => Ok(self.resolve_int(id, io, depth)? as f64),
        }
    }

    fn write_float(&self, id: NodeId, value: f64, io: &dyn PortIo, depth: usize) -> Result<(), GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        let result = match node.kind {
            NodeKind::FloatReg => {
                let spec = self.reg_spec(id, io, depth)?;
                let mut bytes = vec![0u8; spec.length];
                let raw = match spec.length {
                    4 => (value as f32).to_bits() as u64,
                    8 => value.to_bits(),
                    _ => {
                        return Err(GenApiError::InvalidBitRange {
                            node: self.node_name(id).to_string(),
                            lsb: 0,
                            msb: (spec.length * 8).saturating_sub(1) as u8,
                        })
                    }
                };
                register::unsigned_to_bytes(raw, &mut bytes, spec.endianness);
                self.register_write(id, &spec, &bytes, io)
            }
            NodeKind::Converter | NodeKind::IntConverter => {
                self.converter_write(id, Value::Double(value), io, depth)
            }
            NodeKind::SwissKnife | NodeKind::IntSwissKnife => Err(GenApiError::AccessDenied {
                node: self.node_name(id).to_string(),
            }),
            NodeKind::Float => {
                if let Some(target) = node.property("pValue") {
                    let target_id = self.node_id(target)?;
                    self.write_float(target_id, value, io, depth + 1)
                } else if node.has_property("Value") {
                    self.local_values
                        .write()
                        .expect("lock poisoned")
                        .insert(id, LocalValue::Float(value));
                    Ok(())
                } else {
                    Err(GenApiError::PvalueNotDefined {
                        node: self.node_name(id).to_string(),
                    })
                }
            }
            _ => self.write_int(id, value as i64, io, depth),
        };
        if result.is_ok() {
            self.bump(id);
        }
        result
    }

    fn resolve_string(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<String, GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        match node.kind {
            NodeKind::StringReg => {
                let spec = self.reg_spec(id, io, depth)?;
                let bytes = self.register_read(id, &spec, io)?;
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Ok(String::from_utf8_lossy(&bytes[..end]).to_string())
            }
            NodeKind::StringNode => {
                if let Some(target) = node.property("pValue") {
                    let target_id = self.node_id(target)?;
                    return self.resolve_string(target_id, io, depth + 1);
                }
                if let Some(LocalValue::Text(value)) =
                    self.local_values.read().expect("lock poisoned").get(&id)
                {
                    return Ok(value.clone());
                }
                Ok(node.property("Value").unwrap_or_default().to_string())
            }
            _ => Err(GenApiError::TypeMismatch {
                node: self.node_name(id).to_string(),
                expected: "string",
            }),
        }
    }

    fn write_string(&self, id: NodeId, value: &str, io: &dyn PortIo, depth: usize) -> Result<(), GenApiError> {
        if depth > MAX_RESOLUTION_DEPTH {
            return Err(GenApiError::InvalidPvalue {
                node: self.node_name(id).to_string(),
            });
        }
        let node = self.node(id);
        let result = match node.kind {
            NodeKind::StringReg => {
                let spec = self.reg_spec(id, io, depth)?;
                if value.len() > spec.length {
                    return Err(GenApiError::OutOfRange {
                        node: self.node_name(id).to_string(),
                        value: format!("{} bytes", value.len()),
                        min: "0 bytes".to_string(),
                        max: format!("{} bytes", spec.length),
                    });
                }
                let mut bytes = vec![0u8; spec.length];
                bytes[..value.len()].copy_from_slice(value.as_bytes());
                self.register_write(id, &spec, &bytes, io)
            }
            NodeKind::StringNode => {
                if let Some(target) = node.property("pValue") {
                    let target_id = self.node_id(target)?;
                    self.write_string(target_id, value, io, depth + 1)
                } else {
                    self.local_values
                        .write()
                        .expect("lock poisoned")
                        .insert(id, LocalValue::Text(value.to_string()));
                    Ok(())
                }
            }
            _ => Err(GenApiError::TypeMismatch {
                node: self.node_name(id).to_string(),
                expected: "string",
            }),
        };
        if result.is_ok() {
            self.bump(id);
        }
        result
    }

    fn enum_entry_value(&self, id: NodeId, io: &dyn PortIo) -> Result<i64, GenApiError> {
        let entry = self.node(id);
        if let Some(text) = entry.property("Value") {
            return parse_number(text).ok_or_else(|| GenApiError::InvalidSyntax {
                node: self.node_name(id).to_string(),
                text: text.to_string(),
            });
        }
        if let Some(target) = entry.property("pValue") {
            let target_id = self.node_id(target)?;
            return self.resolve_int(target_id, io, 0);
        }
        Err(GenApiError::PropertyNotDefined {
            node: self.node_name(id).to_string(),
            property: "Value",
        })
    }

    fn entry_selectable(&self, id: NodeId, io: &dyn PortIo) -> Result<bool, GenApiError> {
        Ok(self.flag_property(id, "pIsImplemented", io)?
            && self.flag_property(id, "pIsAvailable", io)?)
    }

    // ------------------------------------------------------------------
    // Formulas.
    // ------------------------------------------------------------------

    /// Bind the `pVariable` children of a node into evaluator values.
    fn bind_variables(
        &self,
        id: NodeId,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<HashMap<String, Value>, GenApiError> {
        let node = self.node(id);
        let mut variables = HashMap::new();
        for property in node.properties("pVariable") {
            let target_id = self.node_id(&property.value)?;
            let variable = property
                .name
                .clone()
                .unwrap_or_else(|| property.value.clone());
            let value = self.node_value(target_id, io, depth + 1)?;
            variables.insert(variable, value);
        }
        Ok(variables)
    }

    /// Typed value of a node: int for integer-like kinds, double otherwise.
    fn node_value(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<Value, GenApiError> {
        match self.node(id).kind {
            NodeKind::Float | NodeKind::FloatReg | NodeKind::SwissKnife | NodeKind::Converter => {
                Ok(Value::Double(self.resolve_float(id, io, depth)?))
            }
            _ => Ok(Value::Int(self.resolve_int(id, io, depth)?)),
        }
    }

    fn formula_parts(
        &self,
        id: NodeId,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<(Expression, HashMap<String, Value>), GenApiError> {
        let node = self.node(id);
        let formula = node.property("Formula").ok_or(GenApiError::PropertyNotDefined {
            node: self.node_name(id).to_string(),
            property: "Formula",
        })?;
        let expression = Expression::parse(formula)
            .map_err(|err| GenApiError::expression(self.node_name(id), err))?;
        let variables = self.bind_variables(id, io, depth)?;
        Ok((expression, variables))
    }

    fn eval_formula_int(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<i64, GenApiError> {
        let (expression, variables) = self.formula_parts(id, io, depth)?;
        expression
            .evaluate_as_int64(&mut |n| variables.get(n).copied())
            .map_err(|err| GenApiError::expression(self.node_name(id), err))
    }

    fn eval_formula_double(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<f64, GenApiError> {
        let (expression, variables) = self.formula_parts(id, io, depth)?;
        expression
            .evaluate_as_double(&mut |n| variables.get(n).copied())
            .map_err(|err| GenApiError::expression(self.node_name(id), err))
    }

    fn converter_read(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<Value, GenApiError> {
        let node = self.node(id);
        let formula = node
            .property("FormulaFrom")
            .ok_or(GenApiError::PropertyNotDefined {
                node: self.node_name(id).to_string(),
                property: "FormulaFrom",
            })?;
        let target = node.property("pValue").ok_or(GenApiError::PvalueNotDefined {
            node: self.node_name(id).to_string(),
        })?;
        let target_id = self.node_id(target)?;
        let to_value = self.node_value(target_id, io, depth + 1)?;

        let expression = Expression::parse(formula)
            .map_err(|err| GenApiError::expression(self.node_name(id), err))?;
        let mut variables = self.bind_variables(id, io, depth)?;
        variables.insert("TO".to_string(), to_value);

        let name = self.node_name(id);
        if node.kind == NodeKind::IntConverter {
            let value = expression
                .evaluate_as_int64(&mut |n| variables.get(n).copied())
                .map_err(|err| GenApiError::expression(name, err))?;
            Ok(Value::Int(value))
        } else {
            let value = expression
                .evaluate_as_double(&mut |n| variables.get(n).copied())
                .map_err(|err| GenApiError::expression(name, err))?;
            Ok(Value::Double(value))
        }
    }

    fn converter_write(
        &self,
        id: NodeId,
        value: Value,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<(), GenApiError> {
        let node = self.node(id);
        let formula = node
            .property("FormulaTo")
            .ok_or(GenApiError::PropertyNotDefined {
                node: self.node_name(id).to_string(),
                property: "FormulaTo",
            })?;
        let target = node.property("pValue").ok_or(GenApiError::PvalueNotDefined {
            node: self.node_name(id).to_string(),
        })?;
        let target_id = self.node_id(target)?;

        let expression = Expression::parse(formula)
            .map_err(|err| GenApiError::expression(self.node_name(id), err))?;
        let mut variables = self.bind_variables(id, io, depth)?;
        variables.insert("FROM".to_string(), value);

        let name = self.node_name(id);
        match self.node(target_id).kind {
            NodeKind::Float | NodeKind::FloatReg | NodeKind::Converter => {
                let device_value = expression
                    .evaluate_as_double(&mut |n| variables.get(n).copied())
                    .map_err(|err| GenApiError::expression(name, err))?;
                self.write_float(target_id, device_value, io, depth + 1)
            }
            _ => {
                let device_value = expression
                    .evaluate_as_int64(&mut |n| variables.get(n).copied())
                    .map_err(|err| GenApiError::expression(name, err))?;
                self.write_int(target_id, device_value, io, depth + 1)
            }
        }
    }

    // ------------------------------------------------------------------
    // Register transfers.
    // ------------------------------------------------------------------

    fn reg_spec(&self, id: NodeId, io: &dyn PortIo, depth: usize) -> Result<RegSpec, GenApiError> {
        let node = self.node(id);
        // Struct entries inherit the register block of their parent.
        let (reg_id, reg_node) = if node.kind == NodeKind::StructEntry {
            let parent = node.parent.ok_or_else(|| GenApiError::PropertyNotDefined {
                node: self.node_name(id).to_string(),
                property: "Address",
            })?;
            (parent, self.node(parent))
        } else {
            (id, node)
        };

        let mut address = 0u64;
        let mut has_address = false;
        for property in &reg_node.properties {
            match property.key.as_str() {
                "Address" => {
                    let value = parse_number(&property.value).ok_or_else(|| {
                        GenApiError::InvalidSyntax {
                            node: self.node_name(reg_id).to_string(),
                            text: property.value.clone(),
                        }
                    })?;
                    address = address.wrapping_add(value as u64);
                    has_address = true;
                }
                "pAddress" => {
                    let target_id = self.node_id(&property.value)?;
                    let value = self.resolve_int(target_id, io, depth + 1)?;
                    address = address.wrapping_add(value as u64);
                    has_address = true;
                }
                "pIndex" => {
                    let target_id = self.node_id(&property.value)?;
                    let index = self.resolve_int(target_id, io, depth + 1)?;
                    let stride = property.offset.unwrap_or_else(|| {
                        self.literal_int(reg_node, "Length").unwrap_or(4)
                    });
                    address = address.wrapping_add((index * stride) as u64);
                }
                _ => {}
            }
        }
        if !has_address {
            return Err(GenApiError::PropertyNotDefined {
                node: self.node_name(reg_id).to_string(),
                property: "Address",
            });
        }

        let length = match self.prop_int_opt(reg_id, "Length", "pLength", io, depth)? {
            Some(value) if value > 0 => value as usize,
            Some(_) | None => 4,
        };

        let endianness = reg_node
            .property("Endianess")
            .or_else(|| reg_node.property("Endianness"))
            .and_then(Endianness::parse)
            .unwrap_or(self.default_endianness);
        // Sign and bit ranges live on the entry itself for struct entries.
        let sign = node.property("Sign").and_then(Sign::parse).unwrap_or_default();
        let cachable = reg_node
            .property("Cachable")
            .and_then(Cachable::parse)
            .unwrap_or_default();

        let range = if matches!(node.kind, NodeKind::MaskedIntReg | NodeKind::StructEntry) {
            if let Some(bit) = self.literal_int(node, "Bit") {
                Some(BitRange::bit(bit as u8))
            } else {
                let lsb = self.literal_int(node, "LSB");
                let msb = self.literal_int(node, "MSB");
                match (lsb, msb) {
                    (Some(lsb), Some(msb)) => Some(BitRange {
                        lsb: lsb as u8,
                        msb: msb as u8,
                    }),
                    _ => None,
                }
            }
        } else {
            None
        };

        let port = reg_node.property("pPort").map(str::to_string);
        let chunk_id = port
            .as_deref()
            .and_then(|name| self.document.find(name))
            .and_then(|port_id| self.node(port_id).property("ChunkID"))
            .and_then(|text| u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok());

        Ok(RegSpec {
            address,
            length,
            endianness,
            sign,
            cachable,
            port,
            chunk_id,
            range,
            cache_node: reg_id,
        })
    }

    fn port_request<'a>(&self, spec: &'a RegSpec) -> PortRequest<'a> {
        PortRequest {
            port: spec.port.as_deref(),
            chunk_id: spec.chunk_id,
            legacy_register_access: self.legacy_access && spec.length == 4,
        }
    }

    fn invalidator_snapshot(&self, id: NodeId) -> Vec<(NodeId, u64)> {
        self.node(id)
            .properties("pInvalidator")
            .filter_map(|p| self.document.find(&p.value))
            .map(|node| (node, self.change_counts[node].load(Ordering::SeqCst)))
            .collect()
    }

    fn register_read(&self, id: NodeId, spec: &RegSpec, io: &dyn PortIo) -> Result<Vec<u8>, GenApiError> {
        let use_cache =
            self.cache_policy != RegisterCachePolicy::Disable && spec.cachable != Cachable::NoCache;
        if use_cache {
            let counters = |node: NodeId| self.change_counts[node].load(Ordering::SeqCst);
            if let Some(cached) = self.cache.lookup(id, &counters) {
                if self.cache_policy == RegisterCachePolicy::Debug {
                    let mut fresh = vec![0u8; spec.length];
                    io.read(&self.port_request(spec), spec.address, &mut fresh)?;
                    if fresh != cached {
                        warn!(
                            node = self.node_name(id),
                            address = format!("{:#x}", spec.address),
                            "register cache mismatch"
                        );
                        self.cache.store(id, &fresh, self.invalidator_snapshot(id));
                        return Ok(fresh);
                    }
                }
                trace!(node = self.node_name(id), "register cache hit");
                return Ok(cached);
            }
        }
        let mut bytes = vec![0u8; spec.length];
        io.read(&self.port_request(spec), spec.address, &mut bytes)?;
        if use_cache {
            self.cache.store(id, &bytes, self.invalidator_snapshot(id));
        }
        Ok(bytes)
    }

    fn register_write(&self, id: NodeId, spec: &RegSpec, data: &[u8], io: &dyn PortIo) -> Result<(), GenApiError> {
        io.write(&self.port_request(spec), spec.address, data)?;
        self.bump(id);
        match spec.cachable {
            Cachable::WriteThrough if self.cache_policy != RegisterCachePolicy::Disable => {
                self.cache.store(id, data, self.invalidator_snapshot(id));
            }
            Cachable::WriteAround => self.cache.invalidate(id),
            _ => {}
        }
        Ok(())
    }

    fn prop_int_opt(
        &self,
        id: NodeId,
        key: &str,
        pkey: &str,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<Option<i64>, GenApiError> {
        let node = self.node(id);
        if let Some(text) = node.property(key) {
            let value = parse_number(text).ok_or_else(|| GenApiError::InvalidSyntax {
                node: self.node_name(id).to_string(),
                text: text.to_string(),
            })?;
            return Ok(Some(value));
        }
        if let Some(target) = node.property(pkey) {
            let target_id = self.node_id(target)?;
            return Ok(Some(self.resolve_int(target_id, io, depth + 1)?));
        }
        Ok(None)
    }

    fn prop_float_opt(
        &self,
        id: NodeId,
        key: &str,
        pkey: &str,
        io: &dyn PortIo,
        depth: usize,
    ) -> Result<Option<f64>, GenApiError> {
        let node = self.node(id);
        if let Some(text) = node.property(key) {
            let value: f64 = text.trim().parse().map_err(|_| GenApiError::InvalidSyntax {
                node: self.node_name(id).to_string(),
                text: text.to_string(),
            })?;
            return Ok(Some(value));
        }
        if let Some(target) = node.property(pkey) {
            let target_id = self.node_id(target)?;
            return Ok(Some(self.resolve_float(target_id, io, depth + 1)?));
        }
        Ok(None)
    }

    fn literal_int(&self, node: &Node, key: &str) -> Option<i64> {
        node.property(key).and_then(parse_number)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Flat in-memory register space.
    struct MemoryIo {
        memory: RefCell<Vec<u8>>,
        reads: Cell<usize>,
    }

    impl MemoryIo {
        fn new(size: usize) -> Self {
            Self {
                memory: RefCell::new(vec![0u8; size]),
                reads: Cell::new(0),
            }
        }

        fn poke_u32_be(&self, address: usize, value: u32) {
            self.memory.borrow_mut()[address..address + 4].copy_from_slice(&value.to_be_bytes());
        }

        fn peek_u32_be(&self, address: usize) -> u32 {
            let memory = self.memory.borrow();
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&memory[address..address + 4]);
            u32::from_be_bytes(bytes)
        }
    }

    impl RegisterIo for MemoryIo {
        fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, GenApiError> {
            self.reads.set(self.reads.get() + 1);
            let memory = self.memory.borrow();
            let start = address as usize;
            Ok(memory[start..start + len].to_vec())
        }

        fn write(&self, address: u64, data: &[u8]) -> Result<(), GenApiError> {
            let mut memory = self.memory.borrow_mut();
            let start = address as usize;
            memory[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    const FIXTURE: &str = r#"
<RegisterDescription ModelName="Fake" VendorName="Arvis"
    SchemaMajorVersion="1" SchemaMinorVersion="1" SchemaSubMinorVersion="0">
  <Category Name="Root">
    <pFeature>Width</pFeature>
    <pFeature>Gain</pFeature>
  </Category>
  <Integer Name="Width">
    <pValue>WidthReg</pValue>
    <Min>1</Min>
    <pMax>SensorWidth</pMax>
    <Inc>2</Inc>
  </Integer>
  <IntReg Name="WidthReg">
    <Address>0x100</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <Cachable>NoCache</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <IntSwissKnife Name="SensorWidth">
    <pVariable Name="SHIFT">WidthShift</pVariable>
    <Formula>256 &lt;&lt; SHIFT</Formula>
  </IntSwissKnife>
  <Integer Name="WidthShift">
    <Value>3</Value>
  </Integer>
  <MaskedIntReg Name="GainRaw">
    <Address>0x200</Address>
    <Length>4</Length>
    <Cachable>NoCache</Cachable>
    <LSB>16</LSB>
    <MSB>31</MSB>
    <Sign>Unsigned</Sign>
    <Endianess>BigEndian</Endianess>
  </MaskedIntReg>
  <IntConverter Name="GainPercent">
    <FormulaTo>FROM / 5</FormulaTo>
    <FormulaFrom>TO * 5</FormulaFrom>
    <pValue>GainRaw</pValue>
  </IntConverter>
  <Enumeration Name="TriggerMode">
    <EnumEntry Name="Off">
      <Value>0</Value>
    </EnumEntry>
    <EnumEntry Name="On">
      <Value>1</Value>
    </EnumEntry>
    <pValue>TriggerModeReg</pValue>
  </Enumeration>
  <IntReg Name="TriggerModeReg">
    <Address>0x300</Address>
    <Length>4</Length>
    <Cachable>NoCache</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Boolean Name="ReverseX">
    <pValue>ReverseXBit</pValue>
  </Boolean>
  <MaskedIntReg Name="ReverseXBit">
    <Address>0x304</Address>
    <Length>4</Length>
    <Cachable>NoCache</Cachable>
    <Bit>7</Bit>
    <Endianess>BigEndian</Endianess>
  </MaskedIntReg>
  <Command Name="AcquisitionStart">
    <pValue>AcquisitionStartReg</pValue>
    <CommandValue>1</CommandValue>
  </Command>
  <IntReg Name="AcquisitionStartReg">
    <Address>0x400</Address>
    <Length>4</Length>
    <Cachable>WriteAround</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Integer Name="ExposureIndexed">
    <pIndex>ExposureSelector</pIndex>
    <ValueIndexed Index="0">100</ValueIndexed>
    <ValueIndexed Index="1">250</ValueIndexed>
    <ValueDefault>42</ValueDefault>
  </Integer>
  <Integer Name="ExposureSelector">
    <Value>0</Value>
  </Integer>
  <IntReg Name="CachedStatus">
    <Address>0x500</Address>
    <Length>4</Length>
    <Cachable>WriteThrough</Cachable>
    <pInvalidator>AcquisitionStartReg</pInvalidator>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <IntReg Name="ReadOnlyReg">
    <Address>0x504</Address>
    <Length>4</Length>
    <AccessMode>RO</AccessMode>
    <Cachable>NoCache</Cachable>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <StringReg Name="DeviceVendorName">
    <Address>0x600</Address>
    <Length>16</Length>
    <Cachable>NoCache</Cachable>
  </StringReg>
  <Float Name="Gain">
    <pValue>GainPercent</pValue>
  </Float>
</RegisterDescription>
"#;

    fn nodemap() -> NodeMap {
        NodeMap::from_xml(FIXTURE).expect("parse fixture")
    }

    #[test]
    fn integer_write_read_roundtrip() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        map.set_integer("Width", 1024, &io).expect("set");
        assert_eq!(map.get_integer("Width", &io).expect("get"), 1024);
        assert_eq!(io.peek_u32_be(0x100), 1024);
    }

    #[test]
    fn integer_bounds_follow_swiss_knife() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        let (min, max, inc) = map.integer_bounds("Width", &io).expect("bounds");
        assert_eq!(min, 1);
        assert_eq!(max, 256 << 3);
        assert_eq!(inc, 2);
    }

    #[test]
    fn range_check_rejects_out_of_bounds_writes() {
        let mut map = nodemap();
        map.set_range_check_policy(RangeCheckPolicy::Enable);
        let io = MemoryIo::new(0x1000);
        let err = map.set_integer("Width", 0, &io).unwrap_err();
        assert!(matches!(err, GenApiError::OutOfRange { .. }));
        let err = map.set_integer("Width", 4096, &io).unwrap_err();
        assert!(matches!(err, GenApiError::OutOfRange { .. }));
        // Off the increment grid: valid values are 1, 3, 5, ...
        let err = map.set_integer("Width", 8, &io).unwrap_err();
        assert!(matches!(err, GenApiError::OutOfRange { .. }));
        map.set_integer("Width", 7, &io).expect("aligned write");
    }

    #[test]
    fn masked_register_extracts_high_bits() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x200, 0xABCD_EF12);
        assert_eq!(map.get_integer("GainRaw", &io).expect("get"), 0xABCD);
    }

    #[test]
    fn masked_register_write_preserves_low_bits() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x200, 0xABCD_EF12);
        map.set_integer("GainRaw", 0x1234, &io).expect("set");
        assert_eq!(io.peek_u32_be(0x200), 0x1234_EF12);
        assert_eq!(map.get_integer("GainRaw", &io).expect("get"), 0x1234);
    }

    #[test]
    fn masked_register_bounds_match_field_width() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        let (min, max, _) = map.integer_bounds("GainRaw", &io).expect("bounds");
        assert_eq!((min, max), (0, 0xFFFF));
    }

    #[test]
    fn converter_applies_formulas_both_ways() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x200, 20 << 16);
        assert_eq!(map.get_integer("GainPercent", &io).expect("get"), 100);
        map.set_integer("GainPercent", 50, &io).expect("set");
        assert_eq!(io.peek_u32_be(0x200) >> 16, 10);
        // The float facade resolves through the converter chain.
        assert_eq!(map.get_float("Gain", &io).expect("get"), 50.0);
    }

    #[test]
    fn enumeration_roundtrip_and_entries() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        assert_eq!(
            map.enum_entries("TriggerMode", &io).expect("entries"),
            vec!["Off".to_string(), "On".to_string()]
        );
        map.set_enum("TriggerMode", "On", &io).expect("set");
        assert_eq!(map.get_enum("TriggerMode", &io).expect("get"), "On");
        assert_eq!(io.peek_u32_be(0x300), 1);
        let err = map.set_enum("TriggerMode", "Maybe", &io).unwrap_err();
        assert!(matches!(err, GenApiError::EnumEntryNotFound { .. }));
    }

    #[test]
    fn boolean_drives_single_bit() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x304, 0xFFFF_FF7F);
        assert!(!map.get_boolean("ReverseX", &io).expect("get"));
        map.set_boolean("ReverseX", true, &io).expect("set");
        assert_eq!(io.peek_u32_be(0x304), 0xFFFF_FFFF);
        assert!(map.get_boolean("ReverseX", &io).expect("get"));
    }

    #[test]
    fn command_writes_command_value() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        map.execute("AcquisitionStart", &io).expect("execute");
        assert_eq!(io.peek_u32_be(0x400), 1);
        let err = map.execute("Width", &io).unwrap_err();
        assert!(matches!(err, GenApiError::TypeMismatch { .. }));
    }

    #[test]
    fn indexed_value_switches_on_selector() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        assert_eq!(map.get_integer("ExposureIndexed", &io).expect("get"), 100);
        map.set_integer("ExposureSelector", 1, &io).expect("select");
        assert_eq!(map.get_integer("ExposureIndexed", &io).expect("get"), 250);
        map.set_integer("ExposureSelector", 9, &io).expect("select");
        assert_eq!(map.get_integer("ExposureIndexed", &io).expect("get"), 42);
    }

    #[test]
    fn cache_serves_repeated_reads() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x500, 7);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        let reads_after_first = io.reads.get();
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        assert_eq!(io.reads.get(), reads_after_first, "second read must hit the cache");
    }

    #[test]
    fn invalidator_write_flushes_cache_entry() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x500, 7);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        // Behind the cache's back; a plain re-read would stay stale.
        io.poke_u32_be(0x500, 9);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        // Writing the invalidator makes the next read fresh.
        map.execute("AcquisitionStart", &io).expect("execute");
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 9);
    }

    #[test]
    fn invalidate_all_flushes_everything() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x500, 7);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        io.poke_u32_be(0x500, 11);
        map.invalidate_all();
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 11);
    }

    #[test]
    fn disabled_cache_policy_always_reads_device() {
        let mut map = nodemap();
        map.set_cache_policy(RegisterCachePolicy::Disable);
        let io = MemoryIo::new(0x1000);
        io.poke_u32_be(0x500, 7);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 7);
        io.poke_u32_be(0x500, 8);
        assert_eq!(map.get_integer("CachedStatus", &io).expect("get"), 8);
    }

    #[test]
    fn access_check_blocks_read_only_writes() {
        let mut map = nodemap();
        map.set_access_check_policy(AccessCheckPolicy::Enable);
        let io = MemoryIo::new(0x1000);
        let err = map.set_integer("ReadOnlyReg", 1, &io).unwrap_err();
        assert!(matches!(err, GenApiError::AccessDenied { .. }));
        assert_eq!(map.get_integer("ReadOnlyReg", &io).expect("get"), 0);
    }

    #[test]
    fn string_register_roundtrip() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        map.set_string("DeviceVendorName", "Arvis", &io).expect("set");
        assert_eq!(map.get_string("DeviceVendorName", &io).expect("get"), "Arvis");
        let err = map
            .set_string("DeviceVendorName", "a string longer than the register", &io)
            .unwrap_err();
        assert!(matches!(err, GenApiError::OutOfRange { .. }));
    }

    #[test]
    fn string_dispatch_covers_typed_kinds() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        map.set_from_string("Width", "640", &io).expect("set");
        assert_eq!(map.get_as_string("Width", &io).expect("get"), "640");
        map.set_from_string("TriggerMode", "On", &io).expect("set");
        assert_eq!(map.get_as_string("TriggerMode", &io).expect("get"), "On");
        let err = map.set_from_string("Root", "x", &io).unwrap_err();
        assert!(matches!(err, GenApiError::SetFromStringUndefined { .. }));
    }

    #[test]
    fn change_counts_track_writes() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        let before = map.change_count("Width").expect("count");
        map.set_integer("Width", 2, &io).expect("set");
        let after = map.change_count("Width").expect("count");
        assert!(after > before);
        // The pointee register changed as well.
        assert!(map.change_count("WidthReg").expect("count") > 0);
    }

    #[test]
    fn category_lists_features() {
        let map = nodemap();
        assert_eq!(
            map.category_features("Root").expect("features"),
            vec!["Width".to_string(), "Gain".to_string()]
        );
    }

    #[test]
    fn missing_nodes_are_reported_by_name() {
        let map = nodemap();
        let io = MemoryIo::new(0x1000);
        let err = map.get_integer("NoSuchFeature", &io).unwrap_err();
        assert!(matches!(err, GenApiError::NodeNotFound(name) if name == "NoSuchFeature"));
    }
}
