//! UVCP frame encode/decode (little-endian, USB bulk).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;
use crate::FrameError;

/// Magic prefix of every UVCP control frame ("U3VC" little-endian).
pub const U3V_MAGIC: u32 = 0x4356_3355;

/// Size of the UVCP header including the magic (in bytes).
pub const UVCP_HEADER_SIZE: usize = 12;

/// UVCP command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvcpCommand {
    ReadMem,
    WriteMem,
    Event,
}

impl UvcpCommand {
    /// Raw command value.
    pub const fn command_code(self) -> u16 {
        match self {
            UvcpCommand::ReadMem => 0x0800,
            UvcpCommand::WriteMem => 0x0802,
            UvcpCommand::Event => 0x0C00,
        }
    }

    /// Raw acknowledgement value (command + 1).
    pub const fn ack_code(self) -> u16 {
        self.command_code() + 1
    }

    fn from_ack(code: u16) -> Result<Self, FrameError> {
        match code {
            0x0801 => Ok(UvcpCommand::ReadMem),
            0x0803 => Ok(UvcpCommand::WriteMem),
            _ => Err(FrameError::UnknownCommand(code)),
        }
    }
}

/// Acknowledgement code of a UVCP pending ack.
pub const UVCP_PENDING_ACK: u16 = 0x0805;

/// Request-flag bit asking the device to acknowledge a command.
pub const UVCP_FLAG_ACK_REQUIRED: u16 = 0x4000;

/// UVCP command prefix (magic + header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvcpPrefix {
    /// Request flags; commands set [`UVCP_FLAG_ACK_REQUIRED`] here, acks
    /// carry the status instead.
    pub flags: u16,
    /// Command code of the request.
    pub command: UvcpCommand,
    /// Payload length in bytes.
    pub size: u16,
    /// Request identifier chosen by the client.
    pub id: u16,
}

impl UvcpPrefix {
    /// Encode the prefix and payload into a bulk-transfer-ready buffer.
    pub fn encode(self, payload: &[u8]) -> Result<Bytes, FrameError> {
        if payload.len() > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        debug_assert_eq!(self.size as usize, payload.len());
        let mut buf = BytesMut::with_capacity(UVCP_HEADER_SIZE + payload.len());
        buf.put_u32_le(U3V_MAGIC);
        buf.put_u16_le(self.flags);
        buf.put_u16_le(self.command.command_code());
        buf.put_u16_le(self.size);
        buf.put_u16_le(self.id);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }
}

/// Decoded UVCP acknowledgement.
#[derive(Debug, Clone)]
pub enum UvcpAck {
    /// A regular or error acknowledgement for a command.
    Completed {
        status: Status,
        command: UvcpCommand,
        id: u16,
        payload: Bytes,
    },
    /// The device needs more time; the wait should be extended.
    Pending { id: u16, timeout_ms: u16 },
}

impl UvcpAck {
    /// Decode an acknowledgement from a bulk-in transfer.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < UVCP_HEADER_SIZE {
            return Err(FrameError::InvalidPacket("ack too short"));
        }
        let mut cursor = buf;
        let magic = cursor.get_u32_le();
        if magic != U3V_MAGIC {
            return Err(FrameError::InvalidPacket("bad magic"));
        }
        let status_raw = cursor.get_u16_le();
        let ack_code = cursor.get_u16_le();
        let size = cursor.get_u16_le();
        let id = cursor.get_u16_le();

        if buf.len() < UVCP_HEADER_SIZE + size as usize {
            return Err(FrameError::InvalidPacket("ack payload truncated"));
        }
        let payload =
            Bytes::copy_from_slice(&buf[UVCP_HEADER_SIZE..UVCP_HEADER_SIZE + size as usize]);

        if ack_code == UVCP_PENDING_ACK {
            let pending = crate::PendingAck::decode(&payload, false)?;
            return Ok(UvcpAck::Pending {
                id,
                timeout_ms: pending.timeout_ms,
            });
        }

        let command = UvcpCommand::from_ack(ack_code)?;
        Ok(UvcpAck::Completed {
            status: Status::from_raw(status_raw),
            command,
            id,
            payload,
        })
    }

    /// Packet id this acknowledgement answers.
    pub fn id(&self) -> u16 {
        match self {
            UvcpAck::Completed { id, .. } | UvcpAck::Pending { id, .. } => *id,
        }
    }
}
