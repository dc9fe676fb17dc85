//! GigE Vision bootstrap register map and discovery payload parsing.

use std::io::Cursor;
use std::net::Ipv4Addr;

use bytes::Buf;

use crate::gvcp::GigeError;

/// Fixed bootstrap register offsets (GigE Vision device memory map).
pub mod regs {
    /// Specification version (`major << 16 | minor`).
    pub const VERSION: u64 = 0x0000;
    /// Device mode (endianness, device class, character set).
    pub const DEVICE_MODE: u64 = 0x0004;
    /// High half of the device MAC address.
    pub const DEVICE_MAC_HIGH: u64 = 0x0008;
    /// Low half of the device MAC address.
    pub const DEVICE_MAC_LOW: u64 = 0x000C;
    /// Current IPv4 address of the device.
    pub const CURRENT_IP_ADDRESS: u64 = 0x0024;
    /// Current subnet mask.
    pub const CURRENT_SUBNET_MASK: u64 = 0x0034;
    /// Current default gateway.
    pub const CURRENT_GATEWAY: u64 = 0x0044;

    pub const MANUFACTURER_NAME: u64 = 0x0048;
    pub const MANUFACTURER_NAME_SIZE: usize = 32;
    pub const MODEL_NAME: u64 = 0x0068;
    pub const MODEL_NAME_SIZE: usize = 32;
    pub const DEVICE_VERSION: u64 = 0x0088;
    pub const DEVICE_VERSION_SIZE: usize = 32;
    pub const MANUFACTURER_INFO: u64 = 0x00A8;
    pub const MANUFACTURER_INFO_SIZE: usize = 48;
    pub const SERIAL_NUMBER: u64 = 0x00D8;
    pub const SERIAL_NUMBER_SIZE: usize = 16;
    pub const USER_DEFINED_NAME: u64 = 0x00E8;
    pub const USER_DEFINED_NAME_SIZE: usize = 16;

    /// First GenICam XML URL (512 bytes).
    pub const XML_URL_0: u64 = 0x0200;
    /// Second GenICam XML URL (512 bytes).
    pub const XML_URL_1: u64 = 0x0400;
    pub const XML_URL_SIZE: usize = 512;

    /// Number of message channels.
    pub const N_MESSAGE_CHANNELS: u64 = 0x0900;
    /// Number of stream channels.
    pub const N_STREAM_CHANNELS: u64 = 0x0904;

    /// GVCP capability register.
    pub const GVCP_CAPABILITY: u64 = 0x0934;
    /// Heartbeat timeout in milliseconds.
    pub const HEARTBEAT_TIMEOUT: u64 = 0x0938;
    /// Timestamp tick frequency (high word).
    pub const TIMESTAMP_TICK_FREQUENCY_HIGH: u64 = 0x093C;
    /// Timestamp tick frequency (low word).
    pub const TIMESTAMP_TICK_FREQUENCY_LOW: u64 = 0x0940;

    /// Control channel privilege register (bit 0 exclusive, bit 1 control).
    pub const CONTROL_CHANNEL_PRIVILEGE: u64 = 0x0A00;

    /// Stream channel 0 destination port.
    pub const STREAM_CHANNEL_0_PORT: u64 = 0x0D00;
    /// Stream channel 0 packet size (low 16 bits).
    pub const STREAM_CHANNEL_0_PACKET_SIZE: u64 = 0x0D04;
    /// Stream channel 0 inter-packet delay.
    pub const STREAM_CHANNEL_0_PACKET_DELAY: u64 = 0x0D08;
    /// Stream channel 0 destination IPv4 address.
    pub const STREAM_CHANNEL_0_IP_ADDRESS: u64 = 0x0D18;
}

/// Control channel privilege bits.
pub mod privilege {
    /// Exclusive access to the device.
    pub const EXCLUSIVE: u32 = 1 << 0;
    /// Control access (non-exclusive).
    pub const CONTROL: u32 = 1 << 1;
}

/// GVCP capability bits this implementation inspects.
pub mod capability {
    /// Device supports concatenated multi-register write commands.
    pub const CONCATENATION: u32 = 1 << 0;
    /// Device supports WRITE_MEMORY.
    pub const WRITE_MEMORY: u32 = 1 << 1;
    /// Device supports packet resend.
    pub const PACKET_RESEND: u32 = 1 << 2;
}

/// Size of the fixed discovery acknowledgement payload.
pub const DISCOVERY_DATA_SIZE: usize = 0xF8;

/// Default heartbeat timeout when the register cannot be read.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u32 = 3000;

/// Parsed GenICam XML location from a bootstrap URL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenicamUrl {
    /// XML stored in device memory: `Local:<filename>;<address>;<length>`.
    Local {
        filename: String,
        address: u64,
        length: u64,
    },
    /// XML served over HTTP.
    Http(String),
    /// XML in a local file.
    File(String),
}

/// Parse a bootstrap XML URL.
///
/// The address and length of `Local:` URLs are hexadecimal, with or without
/// a `0x` prefix. The filename may itself contain a zip member suffix; it is
/// kept verbatim.
pub fn parse_genicam_url(url: &str) -> Result<GenicamUrl, GigeError> {
    let trimmed = url.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        return Err(GigeError::Protocol("empty GenICam URL".into()));
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(GenicamUrl::Http(trimmed.to_string()));
    }
    if let Some(path) = lower
        .starts_with("file:///")
        .then(|| trimmed["file://".len()..].to_string())
    {
        return Ok(GenicamUrl::File(path));
    }
    if lower.starts_with("local:") {
        let rest = &trimmed["local:".len()..];
        let mut fields = rest.split(';');
        let filename = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| GigeError::Protocol(format!("malformed local URL: {trimmed}")))?;
        let address = fields
            .next()
            .and_then(parse_hex)
            .ok_or_else(|| GigeError::Protocol(format!("bad address in URL: {trimmed}")))?;
        let length = fields
            .next()
            .and_then(parse_hex)
            .ok_or_else(|| GigeError::Protocol(format!("bad length in URL: {trimmed}")))?;
        return Ok(GenicamUrl::Local {
            filename: filename.to_string(),
            address,
            length,
        });
    }
    Err(GigeError::Protocol(format!(
        "unsupported GenICam URL: {trimmed}"
    )))
}

fn parse_hex(field: &str) -> Option<u64> {
    let digits = field.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).ok()
}

/// Information carried by a GVCP discovery acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryInfo {
    /// GigE Vision specification version (`major`, `minor`).
    pub spec_version: (u16, u16),
    /// Raw device mode register.
    pub device_mode: u32,
    /// Device MAC address.
    pub mac: [u8; 6],
    /// Current IPv4 address.
    pub ip: Ipv4Addr,
    /// Current subnet mask.
    pub subnet: Ipv4Addr,
    /// Current default gateway.
    pub gateway: Ipv4Addr,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub device_version: Option<String>,
    pub manufacturer_info: Option<String>,
    pub serial: Option<String>,
    pub user_name: Option<String>,
}

impl DiscoveryInfo {
    /// Parse the fixed discovery block from an acknowledgement payload.
    pub fn parse(payload: &[u8]) -> Result<Self, GigeError> {
        if payload.len() < DISCOVERY_DATA_SIZE {
            return Err(GigeError::Protocol("discovery payload too small".into()));
        }
        let mut cursor = Cursor::new(payload);
        let spec_major = cursor.get_u16();
        let spec_minor = cursor.get_u16();
        let device_mode = cursor.get_u32();
        cursor.advance(2); // Reserved.
        let mut mac = [0u8; 6];
        cursor.copy_to_slice(&mut mac);
        let _supported_ip_config = cursor.get_u32();
        let _current_ip_config = cursor.get_u32();
        cursor.advance(12); // Reserved.
        let ip = Ipv4Addr::from(cursor.get_u32());
        cursor.advance(12); // Reserved.
        let subnet = Ipv4Addr::from(cursor.get_u32());
        cursor.advance(12); // Reserved.
        let gateway = Ipv4Addr::from(cursor.get_u32());
        let manufacturer = read_fixed_string(&mut cursor, regs::MANUFACTURER_NAME_SIZE)?;
        let model = read_fixed_string(&mut cursor, regs::MODEL_NAME_SIZE)?;
        let device_version = read_fixed_string(&mut cursor, regs::DEVICE_VERSION_SIZE)?;
        let manufacturer_info = read_fixed_string(&mut cursor, regs::MANUFACTURER_INFO_SIZE)?;
        let serial = read_fixed_string(&mut cursor, regs::SERIAL_NUMBER_SIZE)?;
        let user_name = read_fixed_string(&mut cursor, regs::USER_DEFINED_NAME_SIZE)?;

        Ok(Self {
            spec_version: (spec_major, spec_minor),
            device_mode,
            mac,
            ip,
            subnet,
            gateway,
            manufacturer,
            model,
            device_version,
            manufacturer_info,
            serial,
            user_name,
        })
    }
}

pub(crate) fn read_fixed_string(
    cursor: &mut Cursor<&[u8]>,
    len: usize,
) -> Result<Option<String>, GigeError> {
    if cursor.remaining() < len {
        return Err(GigeError::Protocol("discovery string truncated".into()));
    }
    let mut buf = vec![0u8; len];
    cursor.copy_to_slice(&mut buf);
    Ok(parse_fixed_string(&buf))
}

/// Interpret a NUL-padded fixed-size string field.
pub fn parse_fixed_string(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s = String::from_utf8_lossy(&bytes[..end]).trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
