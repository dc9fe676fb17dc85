//! GVCP frame encode/decode (big-endian, UDP).

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;
use crate::FrameError;

/// Size of the GVCP header (in bytes).
pub const GVCP_HEADER_SIZE: usize = 8;

/// GVCP control port as defined by the GigE Vision specification.
pub const GVCP_PORT: u16 = 3956;

/// First byte of a GVCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvcpPacketType {
    /// Acknowledge packet.
    Ack,
    /// Command packet.
    Cmd,
    /// Error packet.
    Error,
    /// Unknown error packet.
    UnknownError,
}

impl GvcpPacketType {
    /// Raw value as defined by the specification.
    pub const fn to_raw(self) -> u8 {
        match self {
            GvcpPacketType::Ack => 0x00,
            GvcpPacketType::Cmd => 0x42,
            GvcpPacketType::Error => 0x80,
            GvcpPacketType::UnknownError => 0x8F,
        }
    }

    /// Parse the raw packet-type byte.
    pub fn from_raw(raw: u8) -> Result<Self, FrameError> {
        match raw {
            0x00 => Ok(GvcpPacketType::Ack),
            0x42 => Ok(GvcpPacketType::Cmd),
            0x80 => Ok(GvcpPacketType::Error),
            0x8F => Ok(GvcpPacketType::UnknownError),
            _ => Err(FrameError::InvalidPacket("unknown packet type")),
        }
    }
}

bitflags! {
    /// Flags carried in the second byte of a GVCP command.
    ///
    /// Bit 4 is overloaded: on a discovery command it allows the device to
    /// answer with a broadcast acknowledgement, on data-related commands it
    /// selects 64-bit frame ids and 32-bit packet ids.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GvcpPacketFlags: u8 {
        /// Request an acknowledgement for this command.
        const ACK_REQUIRED = 0x01;
        /// Use extended (64-bit frame / 32-bit packet) identifiers.
        const EXTENDED_IDS = 0x10;
        /// Allow a broadcast discovery acknowledgement.
        const ALLOW_BROADCAST_ACK = 0x10;
    }
}

/// GVCP command codes used by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvcpCommand {
    Discovery,
    Bye,
    PacketResend,
    ReadRegister,
    WriteRegister,
    ReadMemory,
    WriteMemory,
}

impl GvcpCommand {
    /// Raw command value.
    pub const fn command_code(self) -> u16 {
        match self {
            GvcpCommand::Discovery => 0x0002,
            GvcpCommand::Bye => 0x0004,
            GvcpCommand::PacketResend => 0x0040,
            GvcpCommand::ReadRegister => 0x0080,
            GvcpCommand::WriteRegister => 0x0082,
            GvcpCommand::ReadMemory => 0x0084,
            GvcpCommand::WriteMemory => 0x0086,
        }
    }

    /// Raw acknowledgement value (command + 1).
    pub const fn ack_code(self) -> u16 {
        self.command_code() + 1
    }

    /// Map an acknowledgement code back to the command it answers.
    pub fn from_ack(code: u16) -> Result<Self, FrameError> {
        match code {
            0x0003 => Ok(GvcpCommand::Discovery),
            0x0005 => Ok(GvcpCommand::Bye),
            0x0041 => Ok(GvcpCommand::PacketResend),
            0x0081 => Ok(GvcpCommand::ReadRegister),
            0x0083 => Ok(GvcpCommand::WriteRegister),
            0x0085 => Ok(GvcpCommand::ReadMemory),
            0x0087 => Ok(GvcpCommand::WriteMemory),
            _ => Err(FrameError::UnknownCommand(code)),
        }
    }
}

/// Acknowledgement code of a pending ack, which answers any outstanding
/// command without closing it.
pub const GVCP_PENDING_ACK: u16 = 0x0089;

/// GVCP command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GvcpHeader {
    /// Request flags (ack required, extended ids, broadcast ack).
    pub flags: GvcpPacketFlags,
    /// Command code of the request.
    pub command: GvcpCommand,
    /// Payload length in bytes.
    pub size: u16,
    /// Packet identifier chosen by the client; 0 is reserved.
    pub id: u16,
}

impl GvcpHeader {
    /// Encode the header and payload into a wire-ready buffer.
    pub fn encode(self, payload: &[u8]) -> Result<Bytes, FrameError> {
        if payload.len() > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        debug_assert_eq!(self.size as usize, payload.len());
        let mut buf = BytesMut::with_capacity(GVCP_HEADER_SIZE + payload.len());
        buf.put_u8(GvcpPacketType::Cmd.to_raw());
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.command.command_code());
        buf.put_u16(self.size);
        buf.put_u16(self.id);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }
}

/// Decoded GVCP acknowledgement.
#[derive(Debug, Clone)]
pub enum GvcpAck {
    /// A regular or error acknowledgement for a command.
    Completed {
        status: Status,
        command: GvcpCommand,
        id: u16,
        payload: Bytes,
    },
    /// The device needs more time; the wait should be extended.
    Pending { id: u16, timeout_ms: u16 },
}

impl GvcpAck {
    /// Decode an acknowledgement from raw bytes.
    ///
    /// The first header byte of an acknowledgement is the high byte of the
    /// 16-bit status field, so ACK (0x00) and ERROR (0x80/0x8F) packets are
    /// both handled by reading the status as one big-endian u16.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < GVCP_HEADER_SIZE {
            return Err(FrameError::InvalidPacket("ack too short"));
        }
        let mut cursor = buf;
        let status_raw = cursor.get_u16();
        let ack_code = cursor.get_u16();
        let size = cursor.get_u16();
        let id = cursor.get_u16();

        if buf.len() < GVCP_HEADER_SIZE + size as usize {
            return Err(FrameError::InvalidPacket("ack payload truncated"));
        }
        let payload = Bytes::copy_from_slice(&buf[GVCP_HEADER_SIZE..GVCP_HEADER_SIZE + size as usize]);

        if ack_code == GVCP_PENDING_ACK {
            let pending = crate::PendingAck::decode(&payload, true)?;
            return Ok(GvcpAck::Pending {
                id,
                timeout_ms: pending.timeout_ms,
            });
        }

        let command = GvcpCommand::from_ack(ack_code)?;
        Ok(GvcpAck::Completed {
            status: Status::from_raw(status_raw),
            command,
            id,
            payload,
        })
    }

    /// Packet id this acknowledgement answers.
    pub fn id(&self) -> u16 {
        match self {
            GvcpAck::Completed { id, .. } | GvcpAck::Pending { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_read_memory_cmd() {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(0x0000_0A00);
        payload.put_u32(4);
        let header = GvcpHeader {
            flags: GvcpPacketFlags::ACK_REQUIRED,
            command: GvcpCommand::ReadMemory,
            size: payload.len() as u16,
            id: 0x0042,
        };
        let encoded = header.encode(&payload).expect("encode");
        assert_eq!(encoded[0], 0x42);
        assert_eq!(encoded[1], 0x01);
        assert_eq!(&encoded[2..4], &0x0084u16.to_be_bytes());
        assert_eq!(&encoded[4..6], &8u16.to_be_bytes());
        assert_eq!(&encoded[6..8], &0x0042u16.to_be_bytes());
        assert_eq!(&encoded[8..], &payload[..]);
    }

    #[test]
    fn decode_read_memory_ack() {
        let data = [0xAAu8; 4];
        let mut buf = BytesMut::new();
        buf.put_u16(0x0000);
        buf.put_u16(0x0085);
        buf.put_u16(data.len() as u16);
        buf.put_u16(0x4242);
        buf.extend_from_slice(&data);
        let ack = GvcpAck::decode(&buf).expect("decode");
        match ack {
            GvcpAck::Completed {
                status,
                command,
                id,
                payload,
            } => {
                assert_eq!(status, Status::Success);
                assert_eq!(command, GvcpCommand::ReadMemory);
                assert_eq!(id, 0x4242);
                assert_eq!(&payload[..], &data[..]);
            }
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[test]
    fn decode_error_ack_carries_status() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x8006);
        buf.put_u16(0x0087);
        buf.put_u16(0);
        buf.put_u16(0x0007);
        let ack = GvcpAck::decode(&buf).expect("decode");
        match ack {
            GvcpAck::Completed { status, .. } => assert_eq!(status, Status::AccessDenied),
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[test]
    fn decode_pending_ack() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0000);
        buf.put_u16(GVCP_PENDING_ACK);
        buf.put_u16(4);
        buf.put_u16(0x0009);
        buf.put_u16(0);
        buf.put_u16(250);
        let ack = GvcpAck::decode(&buf).expect("decode");
        match ack {
            GvcpAck::Pending { id, timeout_ms } => {
                assert_eq!(id, 0x0009);
                assert_eq!(timeout_ms, 250);
            }
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    #[test]
    fn truncated_ack_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0000);
        buf.put_u16(0x0085);
        buf.put_u16(16);
        buf.put_u16(0x0001);
        buf.put_u32(0xDEAD_BEEF);
        let err = GvcpAck::decode(&buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidPacket(_)));
    }
}
