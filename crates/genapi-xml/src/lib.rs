#![cfg_attr(docsrs, feature(doc_cfg))]
//! GenICam XML parsing into an element tree.
//!
//! The document is parsed once at device-open into an arena of typed
//! elements. Feature elements (`Integer`, `IntReg`, `SwissKnife`, ...)
//! become arena nodes; their leaf children (`Value`, `pValue`, `Address`,
//! `LSB`, ...) become properties attached to the owning node. Cross
//! references between nodes stay as string names; the feature engine
//! resolves them against the name map at access time.
//!
//! This is not a general XML engine: only the GenICam element subset is
//! recognised, anything else inside a feature element is kept verbatim as a
//! property so richer documents still load.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{trace, warn};

/// Index of a node inside a [`Document`] arena.
pub type NodeId = usize;

/// Errors raised while parsing a GenICam document.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml: {0}")]
    Xml(String),
    #[error("invalid descriptor: {0}")]
    Invalid(String),
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
}

/// GenICam element kinds recognised by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Category,
    Integer,
    Float,
    Boolean,
    StringNode,
    Enumeration,
    EnumEntry,
    Command,
    Register,
    IntReg,
    MaskedIntReg,
    FloatReg,
    StringReg,
    StructReg,
    StructEntry,
    SwissKnife,
    IntSwissKnife,
    Converter,
    IntConverter,
    Port,
    Group,
}

impl NodeKind {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"Category" => Some(NodeKind::Category),
            b"Integer" => Some(NodeKind::Integer),
            b"Float" => Some(NodeKind::Float),
            b"Boolean" => Some(NodeKind::Boolean),
            b"String" => Some(NodeKind::StringNode),
            b"Enumeration" => Some(NodeKind::Enumeration),
            b"EnumEntry" => Some(NodeKind::EnumEntry),
            b"Command" => Some(NodeKind::Command),
            b"Register" => Some(NodeKind::Register),
            b"IntReg" => Some(NodeKind::IntReg),
            b"MaskedIntReg" => Some(NodeKind::MaskedIntReg),
            b"FloatReg" => Some(NodeKind::FloatReg),
            b"StringReg" => Some(NodeKind::StringReg),
            b"StructReg" => Some(NodeKind::StructReg),
            b"StructEntry" => Some(NodeKind::StructEntry),
            b"SwissKnife" => Some(NodeKind::SwissKnife),
            b"IntSwissKnife" => Some(NodeKind::IntSwissKnife),
            b"Converter" => Some(NodeKind::Converter),
            b"IntConverter" => Some(NodeKind::IntConverter),
            b"Port" => Some(NodeKind::Port),
            b"Group" => Some(NodeKind::Group),
            _ => None,
        }
    }

    /// Whether nodes of this kind belong to the register family.
    pub const fn is_register(self) -> bool {
        matches!(
            self,
            NodeKind::Register
                | NodeKind::IntReg
                | NodeKind::MaskedIntReg
                | NodeKind::FloatReg
                | NodeKind::StringReg
                | NodeKind::StructReg
        )
    }
}

/// One leaf child of a feature element.
///
/// `<pVariable Name="SHIFT">ShiftValue</pVariable>` becomes
/// `{ key: "pVariable", value: "ShiftValue", name: Some("SHIFT") }`;
/// `<ValueIndexed Index="2">64</ValueIndexed>` records the index, and
/// `<pIndex Offset="4">Sel</pIndex>` the addressing stride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub key: String,
    pub value: String,
    pub name: Option<String>,
    pub index: Option<i64>,
    pub offset: Option<i64>,
}

/// One feature element of the document.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Value of the `Name` attribute; anonymous nodes keep `None`.
    pub name: Option<String>,
    /// Value of the `ImposedAccessMode` attribute, verbatim.
    pub imposed_access_mode: Option<String>,
    pub properties: Vec<Property>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    /// First property with the given key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// All properties with the given key, in document order.
    pub fn properties<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Property> + 'a {
        self.properties.iter().filter(move |p| p.key == key)
    }

    /// Whether the node carries the given property at least once.
    pub fn has_property(&self, key: &str) -> bool {
        self.properties.iter().any(|p| p.key == key)
    }
}

/// A parsed GenICam document: the node arena plus the name map.
#[derive(Debug, Clone)]
pub struct Document {
    /// `ModelName` attribute of the register description.
    pub model_name: Option<String>,
    /// `VendorName` attribute of the register description.
    pub vendor_name: Option<String>,
    /// Schema version `(major, minor, subminor)`.
    pub schema_version: (u16, u16, u16),
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    roots: Vec<NodeId>,
}

impl Document {
    /// Node by arena id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Node id by feature name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the document holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Top level nodes in document order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Iterate all `(id, node)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Whether the document declares a schema version older than the given
    /// `(major, minor)`.
    pub fn schema_older_than(&self, major: u16, minor: u16) -> bool {
        let (doc_major, doc_minor, _) = self.schema_version;
        (doc_major, doc_minor) < (major, minor)
    }
}

/// Parse a GenICam XML document.
pub fn parse(xml: &str) -> Result<Document, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut document = Document {
        model_name: None,
        vendor_name: None,
        schema_version: (0, 0, 0),
        nodes: Vec::new(),
        by_name: HashMap::new(),
        roots: Vec::new(),
    };
    // Stack of open feature elements; `None` marks a transparent container
    // (RegisterDescription, Group) whose children are roots.
    let mut stack: Vec<Option<NodeId>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = e.name().as_ref().to_vec();
                if tag == b"RegisterDescription" {
                    read_description_attributes(&mut document, &e)?;
                    stack.push(None);
                } else if let Some(kind) = NodeKind::from_tag(&tag) {
                    if kind == NodeKind::Group {
                        stack.push(None);
                    } else {
                        let id =
                            open_node(&mut document, kind, &e, stack.last().copied().flatten())?;
                        stack.push(Some(id));
                    }
                } else if let Some(Some(owner)) = stack.last().copied() {
                    let property = read_property(&mut reader, &e)?;
                    document.nodes[owner].properties.push(property);
                } else {
                    // Unknown top-level element; skip its subtree.
                    reader
                        .read_to_end(e.to_end().name())
                        .map_err(|err| XmlError::Xml(err.to_string()))?;
                }
            }
            Ok(Event::Empty(e)) => {
                let tag = e.name().as_ref().to_vec();
                if tag == b"RegisterDescription" {
                    read_description_attributes(&mut document, &e)?;
                } else if let Some(kind) = NodeKind::from_tag(&tag) {
                    if kind != NodeKind::Group {
                        open_node(&mut document, kind, &e, stack.last().copied().flatten())?;
                    }
                } else if let Some(Some(owner)) = stack.last().copied() {
                    let mut property = property_from_attributes(&e)?;
                    property.value = String::new();
                    document.nodes[owner].properties.push(property);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let tag = name.as_ref();
                if tag == b"RegisterDescription" || NodeKind::from_tag(tag).is_some() {
                    stack.pop();
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(XmlError::Xml(err.to_string())),
            _ => {}
        }
    }

    trace!(
        nodes = document.nodes.len(),
        named = document.by_name.len(),
        "parsed GenICam document"
    );
    Ok(document)
}

fn read_description_attributes(
    document: &mut Document,
    event: &BytesStart<'_>,
) -> Result<(), XmlError> {
    let mut major = 0u16;
    let mut minor = 0u16;
    let mut subminor = 0u16;
    for attr in event.attributes() {
        let attr = attr.map_err(|err| XmlError::Xml(err.to_string()))?;
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"ModelName" => document.model_name = Some(value),
            b"VendorName" => document.vendor_name = Some(value),
            b"SchemaMajorVersion" => major = value.parse().unwrap_or(0),
            b"SchemaMinorVersion" => minor = value.parse().unwrap_or(0),
            b"SchemaSubMinorVersion" => subminor = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    document.schema_version = (major, minor, subminor);
    Ok(())
}

fn open_node(
    document: &mut Document,
    kind: NodeKind,
    event: &BytesStart<'_>,
    parent: Option<NodeId>,
) -> Result<NodeId, XmlError> {
    let mut name = None;
    let mut imposed_access_mode = None;
    for attr in event.attributes() {
        let attr = attr.map_err(|err| XmlError::Xml(err.to_string()))?;
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"Name" => name = Some(value),
            b"ImposedAccessMode" => imposed_access_mode = Some(value),
            _ => {}
        }
    }

    let id = document.nodes.len();
    document.nodes.push(Node {
        kind,
        name: name.clone(),
        imposed_access_mode,
        properties: Vec::new(),
        children: Vec::new(),
        parent,
    });
    match parent {
        Some(parent) => document.nodes[parent].children.push(id),
        None => document.roots.push(id),
    }
    if let Some(name) = name {
        if document.by_name.insert(name.clone(), id).is_some() {
            return Err(XmlError::DuplicateName(name));
        }
    } else if !matches!(kind, NodeKind::EnumEntry | NodeKind::StructEntry) {
        warn!(kind = ?kind, "anonymous node cannot be referenced");
    }
    Ok(id)
}

fn property_from_attributes(event: &BytesStart<'_>) -> Result<Property, XmlError> {
    let key = String::from_utf8_lossy(event.name().as_ref()).to_string();
    let mut name = None;
    let mut index = None;
    let mut offset = None;
    for attr in event.attributes() {
        let attr = attr.map_err(|err| XmlError::Xml(err.to_string()))?;
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"Name" => name = Some(value),
            b"Index" => {
                index = Some(parse_number(&value).ok_or_else(|| {
                    XmlError::Invalid(format!("bad Index attribute on {key}: {value}"))
                })?)
            }
            b"Offset" => {
                offset = Some(parse_number(&value).ok_or_else(|| {
                    XmlError::Invalid(format!("bad Offset attribute on {key}: {value}"))
                })?)
            }
            _ => {}
        }
    }
    Ok(Property {
        key,
        value: String::new(),
        name,
        index,
        offset,
    })
}

fn read_property(
    reader: &mut Reader<&[u8]>,
    event: &BytesStart<'_>,
) -> Result<Property, XmlError> {
    let mut property = property_from_attributes(event)?;
    let end = event.to_end().into_owned();
    let text = reader
        .read_text(end.name())
        .map_err(|err| XmlError::Xml(err.to_string()))?;
    let text = quick_xml::escape::unescape(text.trim())
        .map_err(|err| XmlError::Xml(err.to_string()))?;
    property.value = text.into_owned();
    Ok(property)
}

/// Parse a GenICam number: decimal or hexadecimal with a `0x` prefix.
pub fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().or_else(|| {
            // Registers like 0xFFFFFFFF_FFFFFFFF wrap into the sign bit.
            u64::from_str_radix(hex, 16).ok().map(|v| v as i64)
        });
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
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
  </Integer>
  <IntReg Name="WidthReg">
    <Address>0x100</Address>
    <Length>4</Length>
    <AccessMode>RW</AccessMode>
    <pPort>Device</pPort>
    <Endianess>BigEndian</Endianess>
  </IntReg>
  <Enumeration Name="Gain">
    <EnumEntry Name="Low">
      <Value>0</Value>
    </EnumEntry>
    <EnumEntry Name="High">
      <Value>1</Value>
    </EnumEntry>
    <pValue>GainReg</pValue>
  </Enumeration>
  <IntSwissKnife Name="SensorWidth">
    <pVariable Name="SHIFT">ShiftVal</pVariable>
    <Formula>1024 &lt;&lt; SHIFT</Formula>
  </IntSwissKnife>
  <Port Name="Device"/>
</RegisterDescription>
"#;

    #[test]
    fn parses_description_attributes() {
        let doc = parse(SAMPLE).expect("parse");
        assert_eq!(doc.model_name.as_deref(), Some("Fake"));
        assert_eq!(doc.vendor_name.as_deref(), Some("Arvis"));
        assert_eq!(doc.schema_version, (1, 1, 0));
        assert!(!doc.schema_older_than(1, 1));
        assert!(doc.schema_older_than(1, 2));
    }

    #[test]
    fn name_map_reaches_every_named_node() {
        let doc = parse(SAMPLE).expect("parse");
        for name in ["Root", "Width", "WidthReg", "Gain", "Low", "High", "SensorWidth", "Device"] {
            assert!(doc.find(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn properties_keep_document_order() {
        let doc = parse(SAMPLE).expect("parse");
        let root = doc.node(doc.find("Root").expect("root"));
        let features: Vec<_> = root.properties("pFeature").map(|p| p.value.as_str()).collect();
        assert_eq!(features, vec!["Width", "Gain"]);
    }

    #[test]
    fn enum_entries_are_children() {
        let doc = parse(SAMPLE).expect("parse");
        let gain = doc.node(doc.find("Gain").expect("gain"));
        assert_eq!(gain.kind, NodeKind::Enumeration);
        assert_eq!(gain.children.len(), 2);
        let low = doc.node(gain.children[0]);
        assert_eq!(low.kind, NodeKind::EnumEntry);
        assert_eq!(low.name.as_deref(), Some("Low"));
        assert_eq!(low.property("Value"), Some("0"));
        assert_eq!(low.parent, doc.find("Gain"));
    }

    #[test]
    fn variable_bindings_keep_their_names() {
        let doc = parse(SAMPLE).expect("parse");
        let knife = doc.node(doc.find("SensorWidth").expect("knife"));
        let var = knife.properties("pVariable").next().expect("variable");
        assert_eq!(var.name.as_deref(), Some("SHIFT"));
        assert_eq!(var.value, "ShiftVal");
        assert_eq!(knife.property("Formula"), Some("1024 << SHIFT"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let xml = r#"
<RegisterDescription>
  <Integer Name="Twice"><Value>1</Value></Integer>
  <Integer Name="Twice"><Value>2</Value></Integer>
</RegisterDescription>"#;
        let err = parse(xml).unwrap_err();
        assert!(matches!(err, XmlError::DuplicateName(name) if name == "Twice"));
    }

    #[test]
    fn numbers_parse_decimal_and_hex() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("-7"), Some(-7));
        assert_eq!(parse_number("0x1A"), Some(26));
        assert_eq!(parse_number(" 0X10 "), Some(16));
        assert_eq!(parse_number("0xFFFFFFFFFFFFFFFF"), Some(-1));
        assert_eq!(parse_number("nope"), None);
    }

    #[test]
    fn value_indexed_records_index() {
        let xml = r#"
<RegisterDescription>
  <Integer Name="Indexed">
    <pIndex>Selector</pIndex>
    <ValueIndexed Index="0">10</ValueIndexed>
    <ValueIndexed Index="1">20</ValueIndexed>
    <ValueDefault>0</ValueDefault>
  </Integer>
</RegisterDescription>"#;
        let doc = parse(xml).expect("parse");
        let node = doc.node(doc.find("Indexed").expect("node"));
        let indexed: Vec<_> = node
            .properties("ValueIndexed")
            .map(|p| (p.index.expect("index"), p.value.as_str()))
            .collect();
        assert_eq!(indexed, vec![(0, "10"), (1, "20")]);
    }

    #[test]
    fn groups_are_transparent() {
        let xml = r#"
<RegisterDescription>
  <Group Comment="Acquisition">
    <Command Name="Start">
      <pValue>StartReg</pValue>
      <CommandValue>1</CommandValue>
    </Command>
  </Group>
</RegisterDescription>"#;
        let doc = parse(xml).expect("parse");
        let id = doc.find("Start").expect("command");
        assert!(doc.roots().contains(&id));
        assert_eq!(doc.node(id).parent, None);
    }
}
