//! GVCP control plane: discovery and the request/acknowledge client.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gencp::{GvcpAck, GvcpCommand, GvcpHeader, GvcpPacketFlags, Status, GVCP_HEADER_SIZE};
use if_addrs::{get_if_addrs, IfAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{self, DiscoveryInfo};
use crate::cancel::CancelToken;

/// GVCP protocol constants grouped by semantic area.
pub mod consts {
    use std::time::Duration;

    /// GVCP control port as defined by the GigE Vision specification.
    pub const PORT: u16 = 3956;

    /// Packet id used by discovery broadcasts.
    pub const DISCOVERY_ID: u16 = 0xFFFF;

    /// Default maximum payload per memory command before negotiation.
    pub const DEFAULT_MAX_CMD_TRANSFER: usize = 512;
    /// Address bytes that accompany a WRITE_MEMORY block.
    pub const WRITE_MEMORY_OVERHEAD: usize = 4;

    /// Default timeout for one control transaction attempt.
    pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
    /// Maximum number of attempts for a control transaction.
    pub const MAX_ATTEMPTS: usize = 5;

    /// Maximum number of bytes captured while listening for acknowledgements.
    pub const ACK_BUFFER: usize = 2048;
}

/// Public alias for the GVCP well-known port.
pub use consts::PORT as GVCP_PORT;

/// Errors that can occur when operating the GVCP control path.
#[derive(Debug, Error)]
pub enum GigeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("timeout waiting for acknowledgement")]
    Timeout,
    #[error("control transaction cancelled")]
    Cancelled,
    #[error("control channel closed")]
    Closed,
    #[error("framing: {0}")]
    Frame(#[from] gencp::FrameError),
    #[error("device reported status {0:?}")]
    Status(Status),
}

/// Information returned by GVCP discovery packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub user_name: Option<String>,
    pub manufacturer_info: Option<String>,
    /// GigE Vision specification version reported by the device.
    pub spec_version: (u16, u16),
}

impl DeviceInfo {
    fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Discover GigE Vision devices by broadcasting a GVCP discovery command on
/// every eligible IPv4 interface.
pub async fn discover(timeout: Duration) -> Result<Vec<DeviceInfo>, GigeError> {
    discover_filtered(timeout, None, false).await
}

/// Discover devices only on the specified interface name.
pub async fn discover_on_interface(
    timeout: Duration,
    interface: &str,
) -> Result<Vec<DeviceInfo>, GigeError> {
    discover_filtered(timeout, Some(interface), false).await
}

/// Discover with the broadcast-acknowledge flag set; some devices behind
/// misconfigured IP stacks only answer this way.
pub async fn discover_broadcast_ack(timeout: Duration) -> Result<Vec<DeviceInfo>, GigeError> {
    discover_filtered(timeout, None, true).await
}

async fn discover_filtered(
    timeout: Duration,
    iface_filter: Option<&str>,
    allow_broadcast_ack: bool,
) -> Result<Vec<DeviceInfo>, GigeError> {
    let mut interfaces = Vec::new();
    for iface in get_if_addrs()? {
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if v4.ip.is_loopback() {
            continue;
        }
        if let Some(filter) = iface_filter {
            if iface.name != filter {
                continue;
            }
        }
        interfaces.push((iface.name, v4));
    }

    if interfaces.is_empty() {
        return Ok(Vec::new());
    }

    let mut join_set = JoinSet::new();
    for (name, v4) in interfaces {
        let interface_name = name.clone();
        join_set.spawn(async move {
            let local_addr = SocketAddr::new(IpAddr::V4(v4.ip), 0);
            let socket = UdpSocket::bind(local_addr).await?;
            socket.set_broadcast(true)?;
            let broadcast = v4.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
            let destination = SocketAddr::new(IpAddr::V4(broadcast), consts::PORT);

            let mut flags = GvcpPacketFlags::ACK_REQUIRED;
            if allow_broadcast_ack {
                flags |= GvcpPacketFlags::ALLOW_BROADCAST_ACK;
            }
            let header = GvcpHeader {
                flags,
                command: GvcpCommand::Discovery,
                size: 0,
                id: consts::DISCOVERY_ID,
            };
            let packet = header.encode(&[])?;
            info!(%interface_name, local = %v4.ip, dest = %destination, "sending GVCP discovery");
            socket.send_to(&packet, destination).await?;

            let mut responses = Vec::new();
            let mut buffer = vec![0u8; consts::ACK_BUFFER];
            let timer = time::sleep(timeout);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    recv = socket.recv_from(&mut buffer) => {
                        let (len, src) = recv?;
                        trace!(%interface_name, %src, bytes = len, "received GVCP response");
                        match parse_discovery_ack(&buffer[..len]) {
                            Ok(Some(info)) => {
                                trace!(ip = %info.ip, mac = %info.mac_string(), "parsed discovery ack");
                                responses.push(info);
                            }
                            Ok(None) => {}
                            Err(err) => warn!(%interface_name, %src, error = %err, "bad discovery ack"),
                        }
                    }
                }
            }
            Ok::<_, GigeError>(responses)
        });
    }

    let mut seen = HashMap::new();
    while let Some(res) = join_set.join_next().await {
        let devices =
            res.map_err(|e| GigeError::Protocol(format!("discovery task failed: {e}")))??;
        for dev in devices {
            seen.entry((dev.ip, dev.mac)).or_insert(dev);
        }
    }

    let mut devices: Vec<_> = seen.into_values().collect();
    devices.sort_by_key(|d| d.ip);
    Ok(devices)
}

fn parse_discovery_ack(buf: &[u8]) -> Result<Option<DeviceInfo>, GigeError> {
    let ack = GvcpAck::decode(buf)?;
    let GvcpAck::Completed {
        status,
        command,
        id,
        payload,
    } = ack
    else {
        return Ok(None);
    };
    if id != consts::DISCOVERY_ID || command != GvcpCommand::Discovery {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(GigeError::Status(status));
    }
    let info = DiscoveryInfo::parse(&payload)?;
    Ok(Some(DeviceInfo {
        ip: info.ip,
        mac: info.mac,
        vendor: info.manufacturer,
        model: info.model,
        serial: info.serial,
        user_name: info.user_name,
        manufacturer_info: info.manufacturer_info,
        spec_version: info.spec_version,
    }))
}

/// Tunable parameters of the control transaction loop.
#[derive(Debug, Clone, Copy)]
pub struct ControlConfig {
    /// Timeout for one attempt; refreshed on retry and on pending acks.
    pub timeout: Duration,
    /// Maximum number of attempts for a transaction.
    pub max_attempts: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout: consts::CONTROL_TIMEOUT,
            max_attempts: consts::MAX_ATTEMPTS,
        }
    }
}

/// GVCP control client bound to one device.
///
/// All transactions are serialised through `&mut self`; callers that share a
/// client across tasks wrap it in a mutex so the 16-bit id sequence is never
/// used concurrently.
pub struct GvcpClient {
    socket: UdpSocket,
    remote: SocketAddr,
    packet_id: u16,
    config: ControlConfig,
    max_cmd_transfer: usize,
    write_concatenation: bool,
    cancel: CancelToken,
}

impl GvcpClient {
    /// Connect to a device GVCP endpoint.
    pub async fn open(addr: SocketAddr) -> Result<Self, GigeError> {
        let local_ip = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => {
                return Err(GigeError::Protocol("IPv6 GVCP is not supported".into()));
            }
        };
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        socket.connect(addr).await?;
        Ok(Self {
            socket,
            remote: addr,
            packet_id: 0,
            config: ControlConfig::default(),
            max_cmd_transfer: consts::DEFAULT_MAX_CMD_TRANSFER,
            write_concatenation: false,
            cancel: CancelToken::new(),
        })
    }

    /// Return the remote GVCP socket address associated with this client.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Replace the transaction configuration.
    pub fn set_config(&mut self, config: ControlConfig) {
        self.config = config;
    }

    /// Token that aborts all pending transactions of this client.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Record the negotiated maximum command transfer size.
    pub fn set_max_cmd_transfer(&mut self, bytes: usize) {
        self.max_cmd_transfer = bytes.max(8);
    }

    /// Record whether the device advertises write concatenation.
    pub fn set_write_concatenation(&mut self, enabled: bool) {
        self.write_concatenation = enabled;
    }

    /// Read the capability register and adopt the advertised options.
    pub async fn negotiate_capabilities(&mut self) -> Result<u32, GigeError> {
        let caps = self.read_register(bootstrap::regs::GVCP_CAPABILITY).await?;
        self.write_concatenation = caps & bootstrap::capability::CONCATENATION != 0;
        debug!(
            caps = format!("{caps:#010x}"),
            concat = self.write_concatenation,
            "GVCP capabilities"
        );
        Ok(caps)
    }

    /// Next packet id; wraps from 0xFFFF back to 1, 0 is never used.
    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = match self.packet_id {
            u16::MAX => 1,
            id => id + 1,
        };
        self.packet_id
    }

    /// Send one command and wait for its acknowledgement, with retries,
    /// pending-ack extension and cancellation.
    async fn transact(&mut self, command: GvcpCommand, payload: &[u8]) -> Result<Bytes, GigeError> {
        let cancel = self.cancel.clone();
        self.transact_with(command, payload, &cancel).await
    }

    /// As [`transact`](Self::transact), racing the provided token.
    pub async fn transact_with(
        &mut self,
        command: GvcpCommand,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<Bytes, GigeError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(GigeError::Cancelled);
            }
            let id = self.next_packet_id();
            let header = GvcpHeader {
                flags: GvcpPacketFlags::ACK_REQUIRED,
                command,
                size: payload.len() as u16,
                id,
            };
            let encoded = header.encode(payload)?;
            trace!(id, ?command, bytes = encoded.len(), attempt, "sending GVCP command");
            if let Err(err) = self.socket.send(&encoded).await {
                if attempt >= self.config.max_attempts {
                    return Err(err.into());
                }
                warn!(id, ?command, attempt, "send failed, retrying");
                continue;
            }

            match self.await_ack(id, cancel).await {
                Ok(payload) => return Ok(payload),
                Err(GigeError::Timeout) if attempt < self.config.max_attempts => {
                    warn!(id, ?command, attempt, "command timeout, retrying");
                }
                Err(GigeError::Status(Status::Busy)) if attempt < self.config.max_attempts => {
                    warn!(id, attempt, "device busy, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Wait for the acknowledgement of packet `id`.
    ///
    /// Acks with a different id are stale answers to an earlier retry; they
    /// are logged and discarded without crediting the wait. A pending ack
    /// extends the deadline by the interval the device reports.
    async fn await_ack(&mut self, id: u16, cancel: &CancelToken) -> Result<Bytes, GigeError> {
        let mut buf = vec![0u8; GVCP_HEADER_SIZE + self.max_cmd_transfer + consts::ACK_BUFFER];
        let mut deadline = time::Instant::now() + self.config.timeout;
        loop {
            let recv = tokio::select! {
                _ = cancel.cancelled() => return Err(GigeError::Cancelled),
                recv = time::timeout_at(deadline, self.socket.recv(&mut buf)) => recv,
            };
            let len = match recv {
                Ok(Ok(len)) => len,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(GigeError::Timeout),
            };
            let ack = match GvcpAck::decode(&buf[..len]) {
                Ok(ack) => ack,
                Err(err) => {
                    debug!(error = %err, "discarding malformed ack");
                    continue;
                }
            };
            if ack.id() != id {
                debug!(expected = id, got = ack.id(), "discarding ack with unexpected id");
                continue;
            }
            match ack {
                GvcpAck::Pending { timeout_ms, .. } => {
                    trace!(id, timeout_ms, "pending ack, extending wait");
                    deadline = time::Instant::now() + Duration::from_millis(timeout_ms as u64);
                }
                GvcpAck::Completed { status, payload, .. } => {
                    if status.is_success() {
                        return Ok(payload);
                    }
                    return Err(GigeError::Status(status));
                }
            }
        }
    }

    /// Read a block of device memory, chunked by the negotiated transfer size.
    pub async fn read_memory(&mut self, address: u64, size: usize) -> Result<Vec<u8>, GigeError> {
        let mut remaining = size;
        let mut offset = 0usize;
        let mut data = Vec::with_capacity(size);
        while remaining > 0 {
            let chunk = remaining.min(self.max_cmd_transfer);
            let mut payload = BytesMut::with_capacity(8);
            payload.put_u32(self.narrow_address(address + offset as u64)?);
            payload.put_u32(chunk as u32);
            let ack = self.transact(GvcpCommand::ReadMemory, &payload).await?;
            // The ack payload echoes the address in its first four bytes.
            if ack.len() != 4 + chunk {
                return Err(GigeError::Protocol(format!(
                    "read_memory at {address:#x}: expected {chunk} bytes, device returned {}",
                    ack.len().saturating_sub(4)
                )));
            }
            data.extend_from_slice(&ack[4..]);
            remaining -= chunk;
            offset += chunk;
        }
        Ok(data)
    }

    /// Write a block of device memory, chunked by the negotiated transfer size.
    pub async fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), GigeError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk =
                (data.len() - offset).min(self.max_cmd_transfer - consts::WRITE_MEMORY_OVERHEAD);
            if chunk == 0 {
                return Err(GigeError::Protocol("write chunk size is zero".into()));
            }
            let mut payload = BytesMut::with_capacity(4 + chunk);
            payload.put_u32(self.narrow_address(address + offset as u64)?);
            payload.extend_from_slice(&data[offset..offset + chunk]);
            let ack = self.transact(GvcpCommand::WriteMemory, &payload).await?;
            if ack.len() != 4 {
                return Err(GigeError::Protocol(
                    "write_memory ack carried unexpected payload".into(),
                ));
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Read a single 32-bit register through the narrow register command.
    pub async fn read_register(&mut self, address: u64) -> Result<u32, GigeError> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(self.narrow_address(address)?);
        let ack = self.transact(GvcpCommand::ReadRegister, &payload).await?;
        if ack.len() != 4 {
            return Err(GigeError::Protocol(format!(
                "read_register at {address:#x}: ack length {}",
                ack.len()
            )));
        }
        let mut cursor = &ack[..];
        Ok(cursor.get_u32())
    }

    /// Write a single 32-bit register through the narrow register command.
    pub async fn write_register(&mut self, address: u64, value: u32) -> Result<(), GigeError> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(self.narrow_address(address)?);
        payload.put_u32(value);
        let ack = self.transact(GvcpCommand::WriteRegister, &payload).await?;
        if ack.len() != 4 {
            return Err(GigeError::Protocol(
                "write_register ack carried unexpected payload".into(),
            ));
        }
        Ok(())
    }

    /// Write several registers in one concatenated WRITE_REGISTER command
    /// when the device advertises concatenation, falling back to one command
    /// per register otherwise.
    pub async fn write_registers(&mut self, writes: &[(u64, u32)]) -> Result<(), GigeError> {
        if !self.write_concatenation || writes.len() < 2 {
            for &(address, value) in writes {
                self.write_register(address, value).await?;
            }
            return Ok(());
        }
        let mut payload = BytesMut::with_capacity(writes.len() * 8);
        for &(address, value) in writes {
            payload.put_u32(self.narrow_address(address)?);
            payload.put_u32(value);
        }
        let ack = self.transact(GvcpCommand::WriteRegister, &payload).await?;
        if ack.len() != 4 {
            return Err(GigeError::Protocol(
                "concatenated write ack carried unexpected payload".into(),
            ));
        }
        Ok(())
    }

    /// Ask the device to retransmit a range of stream packets.
    ///
    /// The resend command is fire-and-forget: no acknowledgement is defined
    /// for it, the answer arrives as retransmitted GVSP packets.
    pub async fn request_resend(
        &mut self,
        frame_id: u64,
        first_packet: u32,
        last_packet: u32,
        extended_ids: bool,
    ) -> Result<(), GigeError> {
        let mut payload = BytesMut::with_capacity(if extended_ids { 20 } else { 12 });
        if extended_ids {
            payload.put_u32(0);
            payload.put_u32(first_packet);
            payload.put_u32(last_packet);
            payload.put_u64(frame_id);
        } else {
            payload.put_u32(frame_id as u32);
            payload.put_u32(first_packet & 0x00FF_FFFF);
            payload.put_u32(last_packet & 0x00FF_FFFF);
        }
        let id = self.next_packet_id();
        let mut flags = GvcpPacketFlags::empty();
        if extended_ids {
            flags |= GvcpPacketFlags::EXTENDED_IDS;
        }
        let header = GvcpHeader {
            flags,
            command: GvcpCommand::PacketResend,
            size: payload.len() as u16,
            id,
        };
        let packet = header.encode(&payload)?;
        trace!(frame_id, first_packet, last_packet, id, "sending packet resend request");
        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Send the goodbye command releasing the control channel.
    pub async fn bye(&mut self) -> Result<(), GigeError> {
        let _ = self.transact(GvcpCommand::Bye, &[]).await?;
        Ok(())
    }

    fn narrow_address(&self, address: u64) -> Result<u32, GigeError> {
        u32::try_from(address)
            .map_err(|_| GigeError::Protocol(format!("address {address:#x} exceeds 32 bits")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_device<F>(handler: F) -> (SocketAddr, tokio::task::JoinHandle<()>)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                for reply in handler(&buf[..len]) {
                    let _ = socket.send_to(&reply, src).await;
                }
            }
        });
        (addr, handle)
    }

    fn ack(status: u16, ack_code: u16, id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(status);
        out.put_u16(ack_code);
        out.put_u16(payload.len() as u16);
        out.put_u16(id);
        out.extend_from_slice(payload);
        out.to_vec()
    }

    fn cmd_id(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[6], packet[7]])
    }

    #[test]
    fn packet_ids_skip_zero_on_wrap() {
        let mut id = 0xFFFEu16;
        let mut seen = Vec::new();
        for _ in 0..4 {
            id = match id {
                u16::MAX => 1,
                v => v + 1,
            };
            seen.push(id);
        }
        assert_eq!(seen, vec![0xFFFF, 1, 2, 3]);
    }

    #[tokio::test]
    async fn read_register_roundtrip() {
        let (addr, _task) = fake_device(|packet| {
            let id = cmd_id(packet);
            vec![ack(0x0000, 0x0081, id, &0xCAFE_BABEu32.to_be_bytes())]
        })
        .await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        let value = client.read_register(0x0934).await.expect("read");
        assert_eq!(value, 0xCAFE_BABE);
    }

    #[tokio::test]
    async fn error_ack_resolves_immediately() {
        let (addr, _task) = fake_device(|packet| {
            let id = cmd_id(packet);
            vec![ack(0x8006, 0x0083, id, &0u32.to_be_bytes())]
        })
        .await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        let err = client.write_register(0x0A00, 2).await.unwrap_err();
        assert!(matches!(err, GigeError::Status(Status::AccessDenied)));
    }

    #[tokio::test]
    async fn stale_ack_id_is_discarded() {
        let (addr, _task) = fake_device(|packet| {
            let id = cmd_id(packet);
            let value = 7u32.to_be_bytes();
            vec![
                // A stale answer from a previous retry, then the real one.
                ack(0x0000, 0x0081, id.wrapping_add(17), &value),
                ack(0x0000, 0x0081, id, &value),
            ]
        })
        .await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        let value = client.read_register(0x0000).await.expect("read");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn pending_ack_extends_wait() {
        let (addr, _task) = fake_device(|packet| {
            let id = cmd_id(packet);
            let mut pending = Vec::new();
            pending.extend_from_slice(&0u16.to_be_bytes());
            pending.extend_from_slice(&300u16.to_be_bytes());
            vec![
                ack(0x0000, 0x0089, id, &pending),
                ack(0x0000, 0x0081, id, &42u32.to_be_bytes()),
            ]
        })
        .await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_config(ControlConfig {
            timeout: Duration::from_millis(50),
            max_attempts: 1,
        });
        let value = client.read_register(0x0000).await.expect("read");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn timeout_exhausts_retries() {
        let (addr, _task) = fake_device(|_| Vec::new()).await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_config(ControlConfig {
            timeout: Duration::from_millis(20),
            max_attempts: 2,
        });
        let err = client.read_register(0x0000).await.unwrap_err();
        assert!(matches!(err, GigeError::Timeout));
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let (addr, _task) = fake_device(|_| Vec::new()).await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_config(ControlConfig {
            timeout: Duration::from_secs(10),
            max_attempts: 1,
        });
        let cancel = client.cancel_token();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let err = client.read_register(0x0000).await.unwrap_err();
        assert!(matches!(err, GigeError::Cancelled));
    }

    #[tokio::test]
    async fn read_memory_chunks_large_transfers() {
        let (addr, _task) = fake_device(|packet| {
            let id = cmd_id(packet);
            let mut cursor = &packet[GVCP_HEADER_SIZE..];
            let address = cursor.get_u32();
            let size = cursor.get_u32() as usize;
            let mut payload = Vec::with_capacity(4 + size);
            payload.extend_from_slice(&address.to_be_bytes());
            payload.extend((0..size).map(|i| ((address as usize + i) & 0xFF) as u8));
            vec![ack(0x0000, 0x0085, id, &payload)]
        })
        .await;
        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_max_cmd_transfer(16);
        let data = client.read_memory(0x100, 40).await.expect("read");
        assert_eq!(data.len(), 40);
        assert_eq!(data[0], 0x00);
        // Chunk boundaries are invisible in the reassembled data.
        assert_eq!(data[17], ((0x100 + 17) & 0xFF) as u8);
    }
}
