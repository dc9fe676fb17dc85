//! Chunk data: the trailing metadata records of a streamed buffer.
//!
//! A chunk list is stored at the end of the payload and read backwards:
//! each record ends with an `(id, size)` trailer preceded by `size` payload
//! bytes. Chunk-bound GenICam features resolve through a chunk port whose
//! reads are served from the buffer currently on loan to the parser.

use genapi_core::{GenApiError, NodeMap, PortIo, PortRequest};
use thiserror::Error;
use tracing::trace;

use crate::buffer::{Buffer, ChunkEndianness};

/// Size of one chunk trailer record.
const CHUNK_INFOS_SIZE: usize = 8;

/// Errors raised by chunk lookups.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("buffer carries no chunk data")]
    NoChunks,
    #[error("chunk {0:#010x} not found")]
    NotFound(u32),
    #[error("malformed chunk list: record extends before start of data")]
    Malformed,
    #[error(transparent)]
    GenApi(#[from] GenApiError),
}

/// Walk the chunk list of `data` backwards and return the payload of
/// `chunk_id`.
pub fn find_chunk(
    data: &[u8],
    chunk_id: u32,
    endianness: ChunkEndianness,
) -> Result<&[u8], ChunkError> {
    let mut offset = data.len();
    while offset >= CHUNK_INFOS_SIZE {
        let record = &data[offset - CHUNK_INFOS_SIZE..offset];
        let (id, size) = match endianness {
            ChunkEndianness::Big => (
                u32::from_be_bytes([record[0], record[1], record[2], record[3]]),
                u32::from_be_bytes([record[4], record[5], record[6], record[7]]),
            ),
            ChunkEndianness::Little => (
                u32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                u32::from_le_bytes([record[4], record[5], record[6], record[7]]),
            ),
        };
        let size = size as usize;
        if size + CHUNK_INFOS_SIZE > offset {
            return Err(ChunkError::Malformed);
        }
        let payload_start = offset - CHUNK_INFOS_SIZE - size;
        trace!(id = format!("{id:#010x}"), size, "chunk record");
        if id == chunk_id {
            return Ok(&data[payload_start..offset - CHUNK_INFOS_SIZE]);
        }
        offset = payload_start;
    }
    Err(ChunkError::NotFound(chunk_id))
}

/// Port backend serving register reads from a borrowed buffer's chunks.
struct ChunkPortIo<'a> {
    buffer: &'a Buffer,
}

impl PortIo for ChunkPortIo<'_> {
    fn read(
        &self,
        request: &PortRequest<'_>,
        address: u64,
        out: &mut [u8],
    ) -> Result<(), GenApiError> {
        let chunk_id = request.chunk_id.ok_or_else(|| GenApiError::Io(
            "chunk feature resolved through a non-chunk port".into(),
        ))?;
        let node = request.port.unwrap_or("<chunk>").to_string();
        let data = self
            .buffer
            .chunk_data(chunk_id)
            .map_err(|_| GenApiError::ChunkNotFound {
                node: node.clone(),
                chunk_id,
            })?;
        let start = address as usize;
        if start + out.len() > data.len() {
            return Err(GenApiError::Io(format!(
                "chunk {chunk_id:#010x} read of {} bytes at {start} exceeds {} byte payload",
                out.len(),
                data.len()
            )));
        }
        out.copy_from_slice(&data[start..start + out.len()]);
        Ok(())
    }

    fn write(
        &self,
        _request: &PortRequest<'_>,
        _address: u64,
        _data: &[u8],
    ) -> Result<(), GenApiError> {
        Err(GenApiError::Io("chunk data is read-only".into()))
    }
}

/// Resolves chunk-bound features against buffers.
///
/// The parser owns a feature engine built from the camera's GenICam
/// document; each accessor borrows the buffer for the duration of the
/// lookup.
pub struct ChunkParser {
    nodemap: NodeMap,
}

impl ChunkParser {
    /// Build a parser from GenICam XML.
    pub fn new(xml: &str) -> Result<Self, genapi_xml::XmlError> {
        Ok(Self {
            nodemap: NodeMap::from_xml(xml)?,
        })
    }

    /// Build a parser around an existing feature engine.
    pub fn from_nodemap(nodemap: NodeMap) -> Self {
        Self { nodemap }
    }

    /// Read an integer chunk feature from `buffer`.
    pub fn integer(&self, buffer: &Buffer, name: &str) -> Result<i64, ChunkError> {
        let io = ChunkPortIo { buffer };
        Ok(self.nodemap.get_integer(name, &io)?)
    }

    /// Read a float chunk feature from `buffer`.
    pub fn float(&self, buffer: &Buffer, name: &str) -> Result<f64, ChunkError> {
        let io = ChunkPortIo { buffer };
        Ok(self.nodemap.get_float(name, &io)?)
    }

    /// Read a string chunk feature from `buffer`.
    pub fn string(&self, buffer: &Buffer, name: &str) -> Result<String, ChunkError> {
        let io = ChunkPortIo { buffer };
        Ok(self.nodemap.get_string(name, &io)?)
    }

    /// Read a boolean chunk feature from `buffer`.
    pub fn boolean(&self, buffer: &Buffer, name: &str) -> Result<bool, ChunkError> {
        let io = ChunkPortIo { buffer };
        Ok(self.nodemap.get_boolean(name, &io)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPayloadType;

    /// Append a chunk record (payload then trailer) in big-endian layout.
    fn push_chunk(data: &mut Vec<u8>, id: u32, payload: &[u8]) {
        data.extend_from_slice(payload);
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }

    fn chunk_buffer() -> Buffer {
        // 208 bytes total: a 64-byte string chunk and a 4-byte int chunk,
        // padded at the front so the list terminates exactly at the end.
        let mut string_payload = vec![0u8; 64];
        string_payload[..5].copy_from_slice(b"Hello");
        let mut tail = Vec::new();
        push_chunk(&mut tail, 0x8765_4321, &string_payload);
        push_chunk(&mut tail, 0x1234_5678, &0x1122_3344u32.to_be_bytes());
        let mut framed = vec![0u8; 208 - tail.len()];
        framed.extend_from_slice(&tail);
        assert_eq!(framed.len(), 208);

        let mut buffer = Buffer::new(208);
        buffer.storage_mut().copy_from_slice(&framed);
        buffer.set_received_size(208);
        buffer.set_payload_type(BufferPayloadType::ChunkData);
        buffer
    }

    const CHUNK_XML: &str = r#"
<RegisterDescription ModelName="Fake" VendorName="Arvis"
    SchemaMajorVersion="1" SchemaMinorVersion="1" SchemaSubMinorVersion="0">
  <IntReg Name="ChunkIntReg">
    <Address>0</Address>
    <Length>4</Length>
    <Cachable>NoCache</Cachable>
    <Endianess>BigEndian</Endianess>
    <pPort>ChunkIntPort</pPort>
  </IntReg>
  <Integer Name="ChunkInt">
    <pValue>ChunkIntReg</pValue>
  </Integer>
  <Port Name="ChunkIntPort">
    <ChunkID>12345678</ChunkID>
  </Port>
  <StringReg Name="ChunkString">
    <Address>0</Address>
    <Length>64</Length>
    <Cachable>NoCache</Cachable>
    <pPort>ChunkStringPort</pPort>
  </StringReg>
  <Port Name="ChunkStringPort">
    <ChunkID>87654321</ChunkID>
  </Port>
</RegisterDescription>
"#;

    #[test]
    fn find_returns_payloads_regardless_of_order() {
        let buffer = chunk_buffer();
        let int_payload = buffer.chunk_data(0x1234_5678).expect("int chunk");
        assert_eq!(int_payload, &0x1122_3344u32.to_be_bytes());
        let string_payload = buffer.chunk_data(0x8765_4321).expect("string chunk");
        assert_eq!(string_payload.len(), 64);
        assert_eq!(&string_payload[..5], b"Hello");
    }

    #[test]
    fn absent_id_is_not_found() {
        let buffer = chunk_buffer();
        let err = buffer.chunk_data(0xDEAD_BEEF).unwrap_err();
        assert!(matches!(err, ChunkError::NotFound(0xDEAD_BEEF)));
    }

    #[test]
    fn typed_chunk_features() {
        let buffer = chunk_buffer();
        let parser = ChunkParser::new(CHUNK_XML).expect("parser");
        assert_eq!(parser.integer(&buffer, "ChunkInt").expect("int"), 0x1122_3344);
        assert_eq!(parser.string(&buffer, "ChunkString").expect("string"), "Hello");
    }

    #[test]
    fn oversized_record_is_malformed() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0000_0001u32.to_be_bytes());
        // Declared size reaches before byte 0.
        data.extend_from_slice(&1000u32.to_be_bytes());
        let err = find_chunk(&data, 1, ChunkEndianness::Big).unwrap_err();
        assert!(matches!(err, ChunkError::Malformed));
    }

    #[test]
    fn little_endian_records() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xAA, 0xBB]);
        data.extend_from_slice(&0x0000_0042u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        let payload = find_chunk(&data, 0x42, ChunkEndianness::Little).expect("find");
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn round_trip_over_synthesised_records() {
        let chunks: &[(u32, &[u8])] = &[
            (0x11, b"one"),
            (0x22, b"twotwo"),
            (0x33, b""),
            (0x44, b"payload-four"),
        ];
        let mut data = Vec::new();
        for &(id, payload) in chunks {
            push_chunk(&mut data, id, payload);
        }
        for &(id, payload) in chunks {
            assert_eq!(
                find_chunk(&data, id, ChunkEndianness::Big).expect("find"),
                payload
            );
        }
    }
}
