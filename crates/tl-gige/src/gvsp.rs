//! GVSP packet encode/decode.
//!
//! A standard packet is `{status: u16, frame_id: u16, packet_infos: u32}`
//! followed by content-specific data. `packet_infos` holds the content type
//! in bits 24..30, the extended-id flag in bit 31 and the 24-bit packet id
//! in the low bits. In extended-id mode the header grows to
//! `{status: u16, flags: u16, packet_infos: u32, frame_id: u64,
//! packet_id: u32}` with a 32-bit packet id and 64-bit frame id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Mask of the 24-bit packet id in `packet_infos`.
pub const PACKET_ID_MASK: u32 = 0x00FF_FFFF;
/// Mask of the content type bits in `packet_infos`.
pub const CONTENT_TYPE_MASK: u32 = 0x7F00_0000;
/// Bit position of the content type in `packet_infos`.
pub const CONTENT_TYPE_POS: u32 = 24;
/// Extended-id mode flag in `packet_infos`.
pub const EXTENDED_ID_MASK: u32 = 0x8000_0000;

/// Size of the standard GVSP header.
pub const HEADER_SIZE: usize = 8;
/// Size of the extended-id GVSP header.
pub const EXTENDED_HEADER_SIZE: usize = 20;

/// Protocol overhead per streamed datagram (IP + UDP + GVSP headers).
pub const PACKET_PROTOCOL_OVERHEAD: u32 = 20 + 8 + 8;

/// Errors raised while handling GVSP packets.
#[derive(Debug, Error)]
pub enum GvspError {
    #[error("invalid packet: {0}")]
    Invalid(&'static str),
    #[error("unsupported content type: {0:#04x}")]
    UnsupportedContent(u8),
}

/// Content type carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Leader,
    Trailer,
    Payload,
    AllIn,
    H264,
    Multizone,
    Multipart,
    GenDc,
}

impl ContentType {
    /// Raw content type value.
    pub const fn to_raw(self) -> u8 {
        match self {
            ContentType::Leader => 0x01,
            ContentType::Trailer => 0x02,
            ContentType::Payload => 0x03,
            ContentType::AllIn => 0x04,
            ContentType::H264 => 0x05,
            ContentType::Multizone => 0x06,
            ContentType::Multipart => 0x07,
            ContentType::GenDc => 0x08,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, GvspError> {
        match raw {
            0x01 => Ok(ContentType::Leader),
            0x02 => Ok(ContentType::Trailer),
            0x03 => Ok(ContentType::Payload),
            0x04 => Ok(ContentType::AllIn),
            0x05 => Ok(ContentType::H264),
            0x06 => Ok(ContentType::Multizone),
            0x07 => Ok(ContentType::Multipart),
            0x08 => Ok(ContentType::GenDc),
            other => Err(GvspError::UnsupportedContent(other)),
        }
    }
}

/// Payload type declared by a leader packet.
///
/// Raw values follow the GigE Vision payload type table; the extended-chunk
/// variant keeps its historical code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Image,
    RawData,
    File,
    ChunkData,
    ExtendedChunkData,
    Jpeg,
    Jpeg2000,
    H264,
    Multizone,
    Multipart,
    GenDc,
    Unknown(u16),
}

impl PayloadType {
    /// Raw payload type value.
    pub const fn to_raw(self) -> u16 {
        match self {
            PayloadType::Image => 0x0001,
            PayloadType::RawData => 0x0002,
            PayloadType::File => 0x0003,
            PayloadType::ChunkData => 0x0004,
            PayloadType::ExtendedChunkData => 0x0005,
            PayloadType::Jpeg => 0x0006,
            PayloadType::Jpeg2000 => 0x0007,
            PayloadType::H264 => 0x0008,
            PayloadType::Multizone => 0x0009,
            PayloadType::Multipart => 0x000A,
            PayloadType::GenDc => 0x000B,
            PayloadType::Unknown(raw) => raw,
        }
    }

    /// Parse the raw payload type value.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0001 => PayloadType::Image,
            0x0002 => PayloadType::RawData,
            0x0003 => PayloadType::File,
            0x0004 => PayloadType::ChunkData,
            0x0005 => PayloadType::ExtendedChunkData,
            0x0006 => PayloadType::Jpeg,
            0x0007 => PayloadType::Jpeg2000,
            0x0008 => PayloadType::H264,
            0x0009 => PayloadType::Multizone,
            0x000A => PayloadType::Multipart,
            0x000B => PayloadType::GenDc,
            other => PayloadType::Unknown(other),
        }
    }

    /// Whether buffers of this payload type end with a chunk list.
    pub const fn has_chunks(self) -> bool {
        matches!(self, PayloadType::ChunkData | PayloadType::ExtendedChunkData)
    }
}

/// Identifiers shared by all packets of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIds {
    /// Frame (block) id; 16 bits in standard mode, 64 in extended mode.
    pub frame_id: u64,
    /// Packet id within the frame; 24 bits standard, 32 extended.
    pub packet_id: u32,
    /// Whether the packet used the extended-id layout.
    pub extended: bool,
}

/// Image metadata carried by a leader packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfos {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub x_padding: u16,
    pub y_padding: u16,
}

/// One part descriptor inside a multipart leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartInfos {
    pub data_type: u16,
    pub component_id: u16,
    pub pixel_format: u32,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
    pub x_padding: u16,
    pub y_padding: u16,
}

const PART_INFOS_SIZE: usize = 40;

/// Decoded representation of a GVSP packet.
#[derive(Debug, Clone)]
pub enum GvspPacket {
    /// Start-of-frame leader packet with metadata.
    Leader {
        ids: PacketIds,
        payload_type: PayloadType,
        timestamp: u64,
        /// Present for image payloads.
        image: Option<ImageInfos>,
        /// Present for multipart payloads.
        parts: Vec<PartInfos>,
    },
    /// Payload data packet carrying bytes at an implied offset.
    Payload { ids: PacketIds, data: Bytes },
    /// Multipart payload packet carrying bytes at an explicit offset within
    /// the identified part.
    MultipartPayload {
        ids: PacketIds,
        part_id: u16,
        offset: u64,
        data: Bytes,
    },
    /// End-of-frame trailer packet.
    Trailer {
        ids: PacketIds,
        payload_type: PayloadType,
        /// Final height for interlaced/variable-height transfers.
        data: u32,
    },
}

impl GvspPacket {
    /// Identifiers of this packet.
    pub fn ids(&self) -> PacketIds {
        match self {
            GvspPacket::Leader { ids, .. }
            | GvspPacket::Payload { ids, .. }
            | GvspPacket::MultipartPayload { ids, .. }
            | GvspPacket::Trailer { ids, .. } => *ids,
        }
    }
}

/// Parse a raw UDP datagram into a GVSP packet.
pub fn parse_packet(datagram: &[u8]) -> Result<GvspPacket, GvspError> {
    if datagram.len() < HEADER_SIZE {
        return Err(GvspError::Invalid("datagram shorter than GVSP header"));
    }
    let mut cursor = datagram;
    let _status = cursor.get_u16();
    let frame_id_16 = cursor.get_u16();
    let packet_infos = cursor.get_u32();
    let extended = packet_infos & EXTENDED_ID_MASK != 0;
    let content = ContentType::from_raw(((packet_infos & CONTENT_TYPE_MASK) >> CONTENT_TYPE_POS) as u8)?;

    let (ids, body) = if extended {
        if datagram.len() < EXTENDED_HEADER_SIZE {
            return Err(GvspError::Invalid("datagram shorter than extended header"));
        }
        let frame_id = cursor.get_u64();
        let packet_id = cursor.get_u32();
        (
            PacketIds {
                frame_id,
                packet_id,
                extended: true,
            },
            &datagram[EXTENDED_HEADER_SIZE..],
        )
    } else {
        (
            PacketIds {
                frame_id: frame_id_16 as u64,
                packet_id: packet_infos & PACKET_ID_MASK,
                extended: false,
            },
            &datagram[HEADER_SIZE..],
        )
    };

    match content {
        ContentType::Leader => parse_leader(ids, body),
        ContentType::Trailer => parse_trailer(ids, body),
        ContentType::Payload => Ok(GvspPacket::Payload {
            ids,
            data: Bytes::copy_from_slice(body),
        }),
        ContentType::Multipart => parse_multipart_payload(ids, body),
        other => Err(GvspError::UnsupportedContent(other.to_raw())),
    }
}

fn parse_leader(ids: PacketIds, body: &[u8]) -> Result<GvspPacket, GvspError> {
    if body.len() < 12 {
        return Err(GvspError::Invalid("leader too short"));
    }
    let mut cursor = body;
    let _flags = cursor.get_u16();
    let payload_type = PayloadType::from_raw(cursor.get_u16());
    let timestamp = cursor.get_u64();

    match payload_type {
        PayloadType::Multipart => {
            if cursor.remaining() < 4 {
                return Err(GvspError::Invalid("multipart leader too short"));
            }
            let part_count = cursor.get_u16() as usize;
            let _reserved = cursor.get_u16();
            if cursor.remaining() < part_count * PART_INFOS_SIZE {
                return Err(GvspError::Invalid("multipart leader truncated"));
            }
            let mut parts = Vec::with_capacity(part_count);
            for _ in 0..part_count {
                parts.push(PartInfos {
                    data_type: cursor.get_u16(),
                    component_id: cursor.get_u16(),
                    pixel_format: cursor.get_u32(),
                    size: cursor.get_u64(),
                    width: cursor.get_u32(),
                    height: cursor.get_u32(),
                    x_offset: cursor.get_u32(),
                    y_offset: cursor.get_u32(),
                    x_padding: cursor.get_u16(),
                    y_padding: cursor.get_u16(),
                    // Trailing reserved word of the descriptor.
                });
                cursor.advance(4);
            }
            Ok(GvspPacket::Leader {
                ids,
                payload_type,
                timestamp,
                image: None,
                parts,
            })
        }
        PayloadType::Image | PayloadType::ChunkData | PayloadType::ExtendedChunkData => {
            let image = if cursor.remaining() >= 24 {
                Some(ImageInfos {
                    pixel_format: cursor.get_u32(),
                    width: cursor.get_u32(),
                    height: cursor.get_u32(),
                    x_offset: cursor.get_u32(),
                    y_offset: cursor.get_u32(),
                    x_padding: cursor.get_u16(),
                    y_padding: cursor.get_u16(),
                })
            } else {
                None
            };
            Ok(GvspPacket::Leader {
                ids,
                payload_type,
                timestamp,
                image,
                parts: Vec::new(),
            })
        }
        _ => Ok(GvspPacket::Leader {
            ids,
            payload_type,
            timestamp,
            image: None,
            parts: Vec::new(),
        }),
    }
}

fn parse_trailer(ids: PacketIds, body: &[u8]) -> Result<GvspPacket, GvspError> {
    if body.len() < 8 {
        return Err(GvspError::Invalid("trailer too short"));
    }
    let mut cursor = body;
    let _reserved = cursor.get_u16();
    let payload_type = PayloadType::from_raw(cursor.get_u16());
    let data = cursor.get_u32();
    Ok(GvspPacket::Trailer {
        ids,
        payload_type,
        data,
    })
}

fn parse_multipart_payload(ids: PacketIds, body: &[u8]) -> Result<GvspPacket, GvspError> {
    if body.len() < 12 {
        return Err(GvspError::Invalid("multipart payload too short"));
    }
    let mut cursor = body;
    let part_id = cursor.get_u16();
    let _reserved = cursor.get_u16();
    let offset = cursor.get_u64();
    Ok(GvspPacket::MultipartPayload {
        ids,
        part_id,
        offset,
        data: Bytes::copy_from_slice(&body[12..]),
    })
}

fn put_header(buf: &mut BytesMut, ids: PacketIds, content: ContentType) {
    buf.put_u16(0); // Status.
    if ids.extended {
        buf.put_u16(0); // Flags.
        buf.put_u32(((content.to_raw() as u32) << CONTENT_TYPE_POS) | EXTENDED_ID_MASK);
        buf.put_u64(ids.frame_id);
        buf.put_u32(ids.packet_id);
    } else {
        buf.put_u16(ids.frame_id as u16);
        buf.put_u32(((content.to_raw() as u32) << CONTENT_TYPE_POS) | (ids.packet_id & PACKET_ID_MASK));
    }
}

/// Encode an image leader packet.
pub fn encode_image_leader(
    ids: PacketIds,
    payload_type: PayloadType,
    timestamp: u64,
    image: ImageInfos,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXTENDED_HEADER_SIZE + 36);
    put_header(&mut buf, ids, ContentType::Leader);
    buf.put_u16(0); // Flags.
    buf.put_u16(payload_type.to_raw());
    buf.put_u64(timestamp);
    buf.put_u32(image.pixel_format);
    buf.put_u32(image.width);
    buf.put_u32(image.height);
    buf.put_u32(image.x_offset);
    buf.put_u32(image.y_offset);
    buf.put_u16(image.x_padding);
    buf.put_u16(image.y_padding);
    buf.freeze()
}

/// Encode a payload packet.
pub fn encode_payload(ids: PacketIds, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXTENDED_HEADER_SIZE + data.len());
    put_header(&mut buf, ids, ContentType::Payload);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Encode a trailer packet.
pub fn encode_trailer(ids: PacketIds, payload_type: PayloadType, data: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXTENDED_HEADER_SIZE + 8);
    put_header(&mut buf, ids, ContentType::Trailer);
    buf.put_u16(0); // Reserved.
    buf.put_u16(payload_type.to_raw());
    buf.put_u32(data);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(frame_id: u64, packet_id: u32) -> PacketIds {
        PacketIds {
            frame_id,
            packet_id,
            extended: false,
        }
    }

    #[test]
    fn image_leader_roundtrip() {
        let image = ImageInfos {
            pixel_format: 0x0108_0001,
            width: 640,
            height: 480,
            x_offset: 0,
            y_offset: 0,
            x_padding: 0,
            y_padding: 0,
        };
        let encoded = encode_image_leader(ids(3, 0), PayloadType::Image, 0x0102_0304_0506_0708, image);
        let packet = parse_packet(&encoded).expect("parse");
        match packet {
            GvspPacket::Leader {
                ids,
                payload_type,
                timestamp,
                image: Some(parsed),
                ..
            } => {
                assert_eq!(ids.frame_id, 3);
                assert_eq!(ids.packet_id, 0);
                assert!(!ids.extended);
                assert_eq!(payload_type, PayloadType::Image);
                assert_eq!(timestamp, 0x0102_0304_0506_0708);
                assert_eq!(parsed, image);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn payload_roundtrip() {
        let data = [0x55u8; 100];
        let encoded = encode_payload(ids(3, 17), &data);
        let packet = parse_packet(&encoded).expect("parse");
        match packet {
            GvspPacket::Payload { ids, data: parsed } => {
                assert_eq!(ids.packet_id, 17);
                assert_eq!(&parsed[..], &data[..]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn trailer_roundtrip() {
        let encoded = encode_trailer(ids(3, 51), PayloadType::Image, 480);
        let packet = parse_packet(&encoded).expect("parse");
        match packet {
            GvspPacket::Trailer {
                ids,
                payload_type,
                data,
            } => {
                assert_eq!(ids.packet_id, 51);
                assert_eq!(payload_type, PayloadType::Image);
                assert_eq!(data, 480);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn extended_ids_roundtrip() {
        let ids = PacketIds {
            frame_id: 0x0001_0000_0000_0007,
            packet_id: 0x0100_0000,
            extended: true,
        };
        let encoded = encode_payload(ids, &[1, 2, 3]);
        let packet = parse_packet(&encoded).expect("parse");
        let parsed = packet.ids();
        assert!(parsed.extended);
        assert_eq!(parsed.frame_id, ids.frame_id);
        assert_eq!(parsed.packet_id, ids.packet_id);
    }

    #[test]
    fn short_datagram_is_rejected() {
        let err = parse_packet(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, GvspError::Invalid(_)));
    }

    #[test]
    fn packet_id_mask_is_24_bits() {
        let encoded = encode_payload(ids(1, 0x0155_AA55), &[]);
        let packet = parse_packet(&encoded).expect("parse");
        assert_eq!(packet.ids().packet_id, 0x0055_AA55);
    }
}
