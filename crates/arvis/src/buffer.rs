//! Image buffers and their lifecycle.
//!
//! A buffer is created by the client, queued on a stream, filled by the
//! receive task and handed back through the output queue with a terminal
//! status. Ownership moves along the queues; the receive task is the only
//! writer while a buffer is in flight.

use std::any::Any;

use pfnc::PixelFormat;

use crate::chunks::{self, ChunkError};

/// Delivery status of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStatus {
    /// Buffer is empty and ready to be queued.
    #[default]
    Cleared,
    /// The receive task is filling the buffer.
    Filling,
    /// The frame completed with all payload bytes present.
    Success,
    /// The frame timed out before completion.
    Timeout,
    /// Packets were lost and not recovered.
    MissingPackets,
    /// A packet with an inconsistent id was received.
    WrongPacketId,
    /// The declared payload did not fit the buffer.
    SizeMismatch,
    /// The payload type is not handled by the reassembler.
    PayloadNotSupported,
    /// The stream was stopped while the buffer was in flight.
    Aborted,
}

impl BufferStatus {
    /// Whether this status ends the buffer's time on the stream.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, BufferStatus::Cleared | BufferStatus::Filling)
    }
}

/// Payload layout declared by the frame leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPayloadType {
    #[default]
    Unknown,
    Image,
    Rawdata,
    File,
    ChunkData,
    ExtendedChunkData,
    Multipart,
    Multizone,
    Jpeg,
    Jpeg2000,
    H264,
}

impl BufferPayloadType {
    /// Whether buffers of this payload type carry a trailing chunk list.
    pub const fn has_chunks(self) -> bool {
        matches!(
            self,
            BufferPayloadType::ChunkData | BufferPayloadType::ExtendedChunkData
        )
    }
}

/// Byte order of the chunk trailer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkEndianness {
    #[default]
    Big,
    Little,
}

/// One logical region inside a buffer, for multi-component payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPart {
    pub data_offset: usize,
    pub size: usize,
    pub component_id: u16,
    pub data_type: u16,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub x_padding: u32,
    pub y_padding: u32,
}

enum Storage {
    /// Allocated by the buffer itself.
    Owned(Vec<u8>),
    /// Caller-provided memory, returned untouched on drop.
    Preallocated(Box<[u8]>),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(data) => data,
            Storage::Preallocated(data) => data,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(data) => data,
            Storage::Preallocated(data) => data,
        }
    }
}

/// One acquired frame.
pub struct Buffer {
    storage: Storage,
    received_size: usize,
    status: BufferStatus,
    payload_type: BufferPayloadType,
    frame_id: u64,
    timestamp_ns: u64,
    system_timestamp_ns: u64,
    has_chunks: bool,
    chunk_endianness: ChunkEndianness,
    parts: Vec<BufferPart>,
    user_data: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("allocated_size", &self.allocated_size())
            .field("received_size", &self.received_size)
            .field("status", &self.status)
            .field("payload_type", &self.payload_type)
            .field("frame_id", &self.frame_id)
            .field("has_chunks", &self.has_chunks)
            .field("n_parts", &self.parts.len())
            .finish()
    }
}

impl Buffer {
    /// Allocate a buffer of the given capacity.
    pub fn new(size: usize) -> Self {
        Self::with_storage(Storage::Owned(vec![0u8; size]))
    }

    /// Wrap caller-provided memory without copying.
    pub fn preallocated(data: Box<[u8]>) -> Self {
        Self::with_storage(Storage::Preallocated(data))
    }

    fn with_storage(storage: Storage) -> Self {
        Self {
            storage,
            received_size: 0,
            status: BufferStatus::Cleared,
            payload_type: BufferPayloadType::Unknown,
            frame_id: 0,
            timestamp_ns: 0,
            system_timestamp_ns: 0,
            has_chunks: false,
            chunk_endianness: ChunkEndianness::Big,
            parts: Vec::new(),
            user_data: None,
        }
    }

    /// Capacity in bytes.
    pub fn allocated_size(&self) -> usize {
        self.storage.as_slice().len()
    }

    /// Number of bytes actually filled.
    pub fn received_size(&self) -> usize {
        self.received_size
    }

    /// Filled bytes of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.storage.as_slice()[..self.received_size]
    }

    /// Whole backing storage, mutable.
    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    pub(crate) fn set_received_size(&mut self, size: usize) {
        debug_assert!(size <= self.allocated_size());
        self.received_size = size.min(self.allocated_size());
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: BufferStatus) {
        self.status = status;
    }

    pub fn payload_type(&self) -> BufferPayloadType {
        self.payload_type
    }

    pub(crate) fn set_payload_type(&mut self, payload_type: BufferPayloadType) {
        self.payload_type = payload_type;
        self.has_chunks = payload_type.has_chunks();
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub(crate) fn set_frame_id(&mut self, frame_id: u64) {
        self.frame_id = frame_id;
    }

    /// Device-reported capture time in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub(crate) fn set_timestamp_ns(&mut self, timestamp: u64) {
        self.timestamp_ns = timestamp;
    }

    /// Host-measured reception time in nanoseconds.
    pub fn system_timestamp_ns(&self) -> u64 {
        self.system_timestamp_ns
    }

    pub(crate) fn set_system_timestamp_ns(&mut self, timestamp: u64) {
        self.system_timestamp_ns = timestamp;
    }

    /// Whether a chunk list terminates the payload.
    pub fn has_chunks(&self) -> bool {
        self.has_chunks
    }

    pub(crate) fn set_has_chunks(&mut self, has_chunks: bool) {
        self.has_chunks = has_chunks;
    }

    /// Byte order of the chunk trailer fields.
    pub fn chunk_endianness(&self) -> ChunkEndianness {
        self.chunk_endianness
    }

    pub fn set_chunk_endianness(&mut self, endianness: ChunkEndianness) {
        self.chunk_endianness = endianness;
    }

    /// Payload parts, in part-id order.
    pub fn parts(&self) -> &[BufferPart] {
        &self.parts
    }

    pub(crate) fn set_parts(&mut self, parts: Vec<BufferPart>) {
        self.parts = parts;
    }

    /// Attach client context travelling with the buffer.
    pub fn set_user_data(&mut self, data: Box<dyn Any + Send>) {
        self.user_data = Some(data);
    }

    /// Borrow the attached client context.
    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    /// Reset the buffer for requeuing; storage and user data are kept.
    pub fn reset(&mut self) {
        self.received_size = 0;
        self.status = BufferStatus::Cleared;
        self.payload_type = BufferPayloadType::Unknown;
        self.frame_id = 0;
        self.timestamp_ns = 0;
        self.system_timestamp_ns = 0;
        self.has_chunks = false;
        self.parts.clear();
    }

    /// Payload bytes of the named chunk, walking the trailing chunk list.
    pub fn chunk_data(&self, chunk_id: u32) -> Result<&[u8], ChunkError> {
        if !self.has_chunks {
            return Err(ChunkError::NoChunks);
        }
        chunks::find_chunk(
            self.data(),
            chunk_id,
            self.chunk_endianness,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_size_is_clamped_to_allocation() {
        let mut buffer = Buffer::new(64);
        buffer.set_received_size(32);
        assert_eq!(buffer.received_size(), 32);
        assert_eq!(buffer.data().len(), 32);
    }

    #[test]
    fn preallocated_storage_is_used_in_place() {
        let data = vec![7u8; 16].into_boxed_slice();
        let mut buffer = Buffer::preallocated(data);
        assert_eq!(buffer.allocated_size(), 16);
        buffer.storage_mut()[0] = 9;
        buffer.set_received_size(1);
        assert_eq!(buffer.data(), &[9]);
    }

    #[test]
    fn chunk_payload_types_imply_chunks() {
        let mut buffer = Buffer::new(8);
        buffer.set_payload_type(BufferPayloadType::ChunkData);
        assert!(buffer.has_chunks());
        buffer.set_payload_type(BufferPayloadType::Image);
        assert!(!buffer.has_chunks());
    }

    #[test]
    fn reset_keeps_storage_and_user_data() {
        let mut buffer = Buffer::new(8);
        buffer.set_user_data(Box::new(42usize));
        buffer.set_status(BufferStatus::Success);
        buffer.set_frame_id(5);
        buffer.reset();
        assert_eq!(buffer.status(), BufferStatus::Cleared);
        assert_eq!(buffer.frame_id(), 0);
        assert_eq!(buffer.allocated_size(), 8);
        let stored = buffer.user_data().expect("user data kept");
        assert_eq!(stored.downcast_ref::<usize>(), Some(&42));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BufferStatus::Cleared.is_terminal());
        assert!(!BufferStatus::Filling.is_terminal());
        for status in [
            BufferStatus::Success,
            BufferStatus::Timeout,
            BufferStatus::MissingPackets,
            BufferStatus::Aborted,
        ] {
            assert!(status.is_terminal());
        }
    }
}
