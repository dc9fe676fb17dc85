//! USB3 Vision transport: UVCP control channel over an abstract bulk pipe.
//!
//! Endpoint discovery and claiming are left to the embedder (the `usb`
//! feature pulls in `rusb` for that purpose); this crate only needs a pair
//! of ordered, reliable bulk pipes expressed by [`BulkTransport`].

pub mod abrm;

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use gencp::{Status, UvcpAck, UvcpCommand, UvcpPrefix, UVCP_FLAG_ACK_REQUIRED};
use thiserror::Error;
use tokio::time;
use tracing::{debug, trace, warn};

pub use gencp::uvcp::UVCP_PENDING_ACK;

/// USB device class identifying a U3V device.
pub const DEVICE_CLASS: u8 = 0xEF;
/// USB device subclass identifying a U3V device.
pub const DEVICE_SUBCLASS: u8 = 0x02;
/// USB device protocol identifying a U3V device.
pub const DEVICE_PROTOCOL: u8 = 0x01;
/// Interface class of U3V interfaces.
pub const INTERFACE_CLASS: u8 = 0xEF;
/// Interface subclass of U3V interfaces.
pub const INTERFACE_SUBCLASS: u8 = 0x05;
/// Interface protocol of the control channel.
pub const CONTROL_PROTOCOL: u8 = 0x00;
/// Interface protocol of the streaming channel.
pub const DATA_PROTOCOL: u8 = 0x02;

/// Errors produced by the U3V control path.
#[derive(Debug, Error)]
pub enum U3vError {
    #[error("io: {0}")]
    Io(String),
    #[error("timeout waiting for acknowledgement")]
    Timeout,
    #[error("control transaction cancelled")]
    Cancelled,
    #[error("transport closed")]
    Closed,
    #[error("framing: {0}")]
    Frame(#[from] gencp::FrameError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("device reported status {0:?}")]
    Status(Status),
}

/// Ordered, reliable byte pipe pair partitioned into bounded transfers.
///
/// Implementations wrap a claimed USB bulk IN/OUT endpoint pair. Transfers
/// never interleave; `recv` returns exactly one transfer.
#[async_trait]
pub trait BulkTransport: Send {
    /// Queue one outgoing transfer.
    async fn send(&mut self, data: &[u8]) -> Result<(), U3vError>;
    /// Receive one incoming transfer, waiting up to `timeout`.
    async fn recv(&mut self, timeout: Duration) -> Result<Bytes, U3vError>;
    /// Largest transfer the endpoint accepts.
    fn max_transfer_size(&self) -> usize;
    /// Release the endpoints.
    async fn close(&mut self) -> Result<(), U3vError>;
}

/// Transaction tuning for the control channel.
#[derive(Debug, Clone, Copy)]
pub struct U3vConfig {
    /// Timeout for one attempt.
    pub timeout: Duration,
    /// Maximum number of attempts.
    pub max_attempts: usize,
}

impl Default for U3vConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// UVCP control channel over a bulk transport.
pub struct U3vControl<T: BulkTransport> {
    transport: T,
    request_id: u16,
    config: U3vConfig,
    max_cmd_transfer: usize,
}

impl<T: BulkTransport> U3vControl<T> {
    /// Wrap a claimed control endpoint pair.
    pub fn new(transport: T) -> Self {
        let max = transport
            .max_transfer_size()
            .saturating_sub(gencp::UVCP_HEADER_SIZE + 12)
            .max(8);
        Self {
            transport,
            request_id: 0,
            config: U3vConfig::default(),
            max_cmd_transfer: max.min(512),
        }
    }

    /// Replace the transaction configuration.
    pub fn set_config(&mut self, config: U3vConfig) {
        self.config = config;
    }

    /// Adopt the maximum command transfer size advertised by the bootstrap
    /// register map.
    pub fn set_max_cmd_transfer(&mut self, bytes: usize) {
        self.max_cmd_transfer = bytes.max(8);
    }

    fn next_request_id(&mut self) -> u16 {
        self.request_id = match self.request_id {
            u16::MAX => 1,
            id => id + 1,
        };
        self.request_id
    }

    async fn transact(
        &mut self,
        command: UvcpCommand,
        payload: &[u8],
    ) -> Result<Bytes, U3vError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let id = self.next_request_id();
            let prefix = UvcpPrefix {
                flags: UVCP_FLAG_ACK_REQUIRED,
                command,
                size: payload.len() as u16,
                id,
            };
            let frame = prefix.encode(payload)?;
            trace!(id, ?command, bytes = frame.len(), attempt, "sending UVCP command");
            self.transport.send(&frame).await?;

            match self.await_ack(id).await {
                Ok(payload) => return Ok(payload),
                Err(U3vError::Timeout) if attempt < self.config.max_attempts => {
                    warn!(id, ?command, attempt, "command timeout, retrying");
                }
                Err(U3vError::Status(Status::Busy)) if attempt < self.config.max_attempts => {
                    warn!(id, attempt, "device busy, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn await_ack(&mut self, id: u16) -> Result<Bytes, U3vError> {
        let mut budget = self.config.timeout;
        loop {
            let started = time::Instant::now();
            let transfer = self.transport.recv(budget).await?;
            let elapsed = started.elapsed();
            let ack = match UvcpAck::decode(&transfer) {
                Ok(ack) => ack,
                Err(err) => {
                    debug!(error = %err, "discarding malformed transfer");
                    budget = budget.saturating_sub(elapsed);
                    if budget.is_zero() {
                        return Err(U3vError::Timeout);
                    }
                    continue;
                }
            };
            if ack.id() != id {
                debug!(expected = id, got = ack.id(), "discarding ack with unexpected id");
                budget = budget.saturating_sub(elapsed);
                if budget.is_zero() {
                    return Err(U3vError::Timeout);
                }
                continue;
            }
            match ack {
                UvcpAck::Pending { timeout_ms, .. } => {
                    trace!(id, timeout_ms, "pending ack, extending wait");
                    budget = Duration::from_millis(timeout_ms as u64);
                }
                UvcpAck::Completed { status, payload, .. } => {
                    if status.is_success() {
                        return Ok(payload);
                    }
                    return Err(U3vError::Status(status));
                }
            }
        }
    }

    /// Read a block of device memory, chunked by the transfer limit.
    pub async fn read_memory(&mut self, address: u64, size: usize) -> Result<Vec<u8>, U3vError> {
        let mut remaining = size;
        let mut offset = 0usize;
        let mut data = Vec::with_capacity(size);
        while remaining > 0 {
            let chunk = remaining.min(self.max_cmd_transfer);
            let mut payload = BytesMut::with_capacity(12);
            payload.put_u64_le(address + offset as u64);
            payload.put_u16_le(0); // Reserved.
            payload.put_u16_le(chunk as u16);
            let ack = self.transact(UvcpCommand::ReadMem, &payload).await?;
            if ack.len() != chunk {
                return Err(U3vError::Protocol(format!(
                    "read_memory at {address:#x}: expected {chunk} bytes, device returned {}",
                    ack.len()
                )));
            }
            data.extend_from_slice(&ack);
            remaining -= chunk;
            offset += chunk;
        }
        Ok(data)
    }

    /// Write a block of device memory, chunked by the transfer limit.
    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), U3vError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(self.max_cmd_transfer);
            let mut payload = BytesMut::with_capacity(8 + chunk);
            payload.put_u64_le(address + offset as u64);
            payload.extend_from_slice(&data[offset..offset + chunk]);
            let ack = self.transact(UvcpCommand::WriteMem, &payload).await?;
            // The write ack reports the number of bytes written.
            if ack.len() >= 4 {
                let mut cursor = &ack[..];
                cursor.advance(2);
                let written = cursor.get_u16_le() as usize;
                if written != chunk {
                    return Err(U3vError::Protocol(format!(
                        "short write at {address:#x}: {written} of {chunk} bytes"
                    )));
                }
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Read a 32-bit register (little-endian payload).
    pub async fn read_register(&mut self, address: u64) -> Result<u32, U3vError> {
        let data = self.read_memory(address, 4).await?;
        let mut cursor = &data[..];
        Ok(cursor.get_u32_le())
    }

    /// Write a 32-bit register (little-endian payload).
    pub async fn write_register(&mut self, address: u64, value: u32) -> Result<(), U3vError> {
        self.write_memory(address, &value.to_le_bytes()).await
    }

    /// Release the underlying transport.
    pub async fn close(&mut self) -> Result<(), U3vError> {
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory bulk pipe backed by a register space.
    struct MemoryPipe {
        memory: Vec<u8>,
        replies: VecDeque<Bytes>,
    }

    impl MemoryPipe {
        fn new(size: usize) -> Self {
            Self {
                memory: vec![0u8; size],
                replies: VecDeque::new(),
            }
        }
    }

    #[async_trait]
    impl BulkTransport for MemoryPipe {
        async fn send(&mut self, data: &[u8]) -> Result<(), U3vError> {
            let mut cursor = data;
            let magic = cursor.get_u32_le();
            assert_eq!(magic, gencp::U3V_MAGIC);
            let _flags = cursor.get_u16_le();
            let command = cursor.get_u16_le();
            let _size = cursor.get_u16_le();
            let id = cursor.get_u16_le();
            let mut reply = BytesMut::new();
            reply.put_u32_le(gencp::U3V_MAGIC);
            match command {
                0x0800 => {
                    let address = cursor.get_u64_le() as usize;
                    cursor.advance(2);
                    let size = cursor.get_u16_le() as usize;
                    reply.put_u16_le(0x0000);
                    reply.put_u16_le(0x0801);
                    reply.put_u16_le(size as u16);
                    reply.put_u16_le(id);
                    reply.extend_from_slice(&self.memory[address..address + size]);
                }
                0x0802 => {
                    let address = cursor.get_u64_le() as usize;
                    let data = cursor;
                    self.memory[address..address + data.len()].copy_from_slice(data);
                    reply.put_u16_le(0x0000);
                    reply.put_u16_le(0x0803);
                    reply.put_u16_le(4);
                    reply.put_u16_le(id);
                    reply.put_u16_le(0);
                    reply.put_u16_le(data.len() as u16);
                }
                other => panic!("unexpected command {other:#06x}"),
            }
            self.replies.push_back(reply.freeze());
            Ok(())
        }

        async fn recv(&mut self, _timeout: Duration) -> Result<Bytes, U3vError> {
            self.replies.pop_front().ok_or(U3vError::Timeout)
        }

        fn max_transfer_size(&self) -> usize {
            1024
        }

        async fn close(&mut self) -> Result<(), U3vError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_roundtrip_is_little_endian() {
        let mut control = U3vControl::new(MemoryPipe::new(1024));
        control.write_register(0x0100, 0x1234_5678).await.expect("write");
        let value = control.read_register(0x0100).await.expect("read");
        assert_eq!(value, 0x1234_5678);
        let bytes = control.read_memory(0x0100, 4).await.expect("read");
        assert_eq!(bytes, 0x1234_5678u32.to_le_bytes());
    }

    #[tokio::test]
    async fn memory_transfers_are_chunked() {
        let mut control = U3vControl::new(MemoryPipe::new(4096));
        control.set_max_cmd_transfer(64);
        let data: Vec<u8> = (0..1000).map(|i| (i & 0xFF) as u8).collect();
        control.write_memory(0x0200, &data).await.expect("write");
        let readback = control.read_memory(0x0200, data.len()).await.expect("read");
        assert_eq!(readback, data);
    }

    #[tokio::test]
    async fn request_ids_skip_zero() {
        let mut control = U3vControl::new(MemoryPipe::new(64));
        control.request_id = u16::MAX;
        assert_eq!(control.next_request_id(), 1);
        assert_eq!(control.next_request_id(), 2);
    }
}
