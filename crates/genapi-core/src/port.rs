//! Port access routing and the legacy register endianness mechanism.

use genapi_xml::Document;

use crate::GenApiError;

/// Routing information for one register transfer.
///
/// The feature engine resolves the target port once per access and hands the
/// request to the backend. A request with `chunk_id` set must be served from
/// the chunk list of the buffer currently on loan; `legacy_register_access`
/// asks GigE backends to use the narrow register commands with big-endian
/// values for this 4-byte transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest<'a> {
    /// Name of the Port node the transfer resolves through.
    pub port: Option<&'a str>,
    /// Chunk id declared on the port, for chunk-backed features.
    pub chunk_id: Option<u32>,
    /// Whether the legacy single-register access mechanism applies.
    pub legacy_register_access: bool,
}

/// Backend serving register transfers for the feature engine.
pub trait PortIo {
    /// Fill `buffer` from `address`.
    fn read(
        &self,
        request: &PortRequest<'_>,
        address: u64,
        buffer: &mut [u8],
    ) -> Result<(), GenApiError>;

    /// Write `data` at `address`.
    fn write(
        &self,
        request: &PortRequest<'_>,
        address: u64,
        data: &[u8],
    ) -> Result<(), GenApiError>;
}

/// Plain byte-addressed access, for backends with one flat address space.
pub trait RegisterIo {
    /// Read `len` bytes starting at `address`.
    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, GenApiError>;
    /// Write `data` starting at `address`.
    fn write(&self, address: u64, data: &[u8]) -> Result<(), GenApiError>;
}

impl<T: RegisterIo> PortIo for T {
    fn read(
        &self,
        request: &PortRequest<'_>,
        address: u64,
        buffer: &mut [u8],
    ) -> Result<(), GenApiError> {
        if let Some(chunk_id) = request.chunk_id {
            return Err(GenApiError::ChunkNotFound {
                node: request.port.unwrap_or("?").to_string(),
                chunk_id,
            });
        }
        let bytes = RegisterIo::read(self, address, buffer.len())?;
        if bytes.len() != buffer.len() {
            return Err(GenApiError::Io(format!(
                "short read at {address:#x}: {} of {} bytes",
                bytes.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&bytes);
        Ok(())
    }

    fn write(
        &self,
        request: &PortRequest<'_>,
        address: u64,
        data: &[u8],
    ) -> Result<(), GenApiError> {
        if let Some(chunk_id) = request.chunk_id {
            return Err(GenApiError::ChunkNotFound {
                node: request.port.unwrap_or("?").to_string(),
                chunk_id,
            });
        }
        RegisterIo::write(self, address, data)
    }
}

/// Vendor/model pairs that implement the legacy register access behaviour
/// despite reporting a schema version of 1.1 or newer. The names match the
/// `VendorName` and `ModelName` attributes of the RegisterDescription
/// element; entries may use `*` and `?` wildcards.
const LEGACY_DEVICES: &[(&str, &str)] = &[
    ("Imperx", "IpxGEVCamera"),
    ("KowaOptronics", "SC130ET3"),
    ("NIT", "Tachyon16k"),
    ("PleoraTechnologiesInc", "iPORTCLGigE"),
    ("PleoraTechnologiesInc", "NTxGigE"),
    ("TeledyneDALSA", "ICE"),
    ("Sony", "XCG_CGSeries"),
    ("EVK", "HELIOS"),
    ("AT_Automation_Technology_GmbH", "C6_X_GigE"),
];

/// Decide once per document whether single-register accesses must use the
/// legacy big-endian register commands.
///
/// True for documents declaring a schema older than 1.1, and for devices on
/// the known exception list that report a newer schema while implementing
/// the old behaviour.
pub fn document_uses_legacy_access(document: &Document) -> bool {
    if document.schema_older_than(1, 1) {
        return true;
    }
    let vendor = document.vendor_name.as_deref().unwrap_or("");
    let model = document.model_name.as_deref().unwrap_or("");
    LEGACY_DEVICES
        .iter()
        .any(|(v, m)| glob_match(v, vendor) && glob_match(m, model))
}

/// Minimal glob matcher supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(vendor: &str, model: &str, major: u16, minor: u16) -> Document {
        let xml = format!(
            r#"<RegisterDescription VendorName="{vendor}" ModelName="{model}"
                SchemaMajorVersion="{major}" SchemaMinorVersion="{minor}"
                SchemaSubMinorVersion="0"/>"#
        );
        genapi_xml::parse(&xml).expect("parse")
    }

    #[test]
    fn old_schema_forces_legacy_access() {
        assert!(document_uses_legacy_access(&doc("AnyVendor", "AnyModel", 1, 0)));
        assert!(!document_uses_legacy_access(&doc("AnyVendor", "AnyModel", 1, 1)));
    }

    #[test]
    fn listed_devices_force_legacy_access() {
        assert!(document_uses_legacy_access(&doc("Sony", "XCG_CGSeries", 1, 1)));
        assert!(document_uses_legacy_access(&doc(
            "PleoraTechnologiesInc",
            "NTxGigE",
            2,
            0
        )));
        assert!(!document_uses_legacy_access(&doc("Sony", "OtherModel", 1, 1)));
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("XCG_*", "XCG_CGSeries"));
        assert!(glob_match("?CE", "ICE"));
        assert!(!glob_match("ICE", "ICE2"));
        assert!(glob_match("*", "anything"));
    }
}
