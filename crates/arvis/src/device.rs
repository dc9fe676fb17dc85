//! Device abstraction: uniform typed access over GVCP and UVCP backends.
//!
//! A [`Device`] exposes the four memory operations the feature engine
//! needs, plus GenICam document retrieval and control-loss notification.
//! Control calls may come from any task; each backend serialises them
//! through its per-device mutex so the 16-bit packet id sequence is never
//! interleaved.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use genapi_core::{GenApiError, PortIo, PortRequest};
use tl_gige::bootstrap::{self, GenicamUrl};
use tl_gige::gvcp::{GigeError, GvcpClient};
use tl_gige::gvsp::PACKET_PROTOCOL_OVERHEAD;
use tl_gige::heartbeat::{spawn_heartbeat, ControlEvent, HeartbeatHandle};
use tl_gige::nic;
use tl_u3v::{BulkTransport, U3vControl, U3vError};

use crate::stream::{Stream, StreamConfig};

/// Errors surfaced by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Gige(#[from] GigeError),
    #[error(transparent)]
    U3v(#[from] U3vError),
    #[error("genicam: {0}")]
    Genicam(String),
    #[error("device closed")]
    Closed,
}

/// Uniform control access to an open camera.
#[async_trait]
pub trait Device: Send + Sync {
    /// Read a block of device memory.
    async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, DeviceError>;
    /// Write a block of device memory.
    async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), DeviceError>;
    /// Read a 32-bit register.
    async fn read_register(&self, address: u64) -> Result<u32, DeviceError>;
    /// Write a 32-bit register.
    async fn write_register(&self, address: u64, value: u32) -> Result<(), DeviceError>;
    /// Fetch the GenICam document describing the device.
    async fn genicam_xml(&self) -> Result<String, DeviceError>;
    /// Subscribe to out-of-band control events, when the backend has any.
    fn control_events(&self) -> Option<watch::Receiver<ControlEvent>> {
        None
    }
    /// Release the device.
    async fn close(&self) -> Result<(), DeviceError>;
}

/// A GigE Vision device: GVCP client, heartbeat, bootstrap helpers.
pub struct GigeDevice {
    client: Arc<Mutex<GvcpClient>>,
    heartbeat: Option<HeartbeatHandle>,
    heartbeat_timeout_ms: u32,
}

impl GigeDevice {
    /// Open the control channel, take control of the device and start the
    /// heartbeat.
    pub async fn open(addr: SocketAddr) -> Result<Self, DeviceError> {
        let mut client = GvcpClient::open(addr).await?;
        client.negotiate_capabilities().await?;

        let heartbeat_timeout_ms = match client
            .read_register(bootstrap::regs::HEARTBEAT_TIMEOUT)
            .await
        {
            Ok(value) if value > 0 => value,
            _ => bootstrap::DEFAULT_HEARTBEAT_TIMEOUT_MS,
        };
        client
            .write_register(
                bootstrap::regs::CONTROL_CHANNEL_PRIVILEGE,
                bootstrap::privilege::CONTROL,
            )
            .await?;
        info!(%addr, heartbeat_timeout_ms, "GigE device control acquired");

        let client = Arc::new(Mutex::new(client));
        let heartbeat = spawn_heartbeat(
            client.clone(),
            heartbeat_timeout_ms,
            bootstrap::privilege::CONTROL,
        );
        Ok(Self {
            client,
            heartbeat: Some(heartbeat),
            heartbeat_timeout_ms,
        })
    }

    /// Shared handle to the control client, for streams issuing resends.
    pub fn control_client(&self) -> Arc<Mutex<GvcpClient>> {
        self.client.clone()
    }

    /// Device-reported heartbeat timeout.
    pub fn heartbeat_timeout_ms(&self) -> u32 {
        self.heartbeat_timeout_ms
    }

    /// Bind a receive socket, point stream channel 0 at it and start the
    /// receive task.
    ///
    /// `host_ip` is the address of the interface facing the camera;
    /// `packet_delay` is written to `GevSCPD` in device ticks. Resend
    /// requests issued by the stream share this device's control channel.
    pub async fn create_stream(
        &self,
        host_ip: Ipv4Addr,
        packet_delay: u32,
        config: StreamConfig,
    ) -> Result<Stream, DeviceError> {
        let socket = nic::bind_stream_socket(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            nic::DEFAULT_RCVBUF_BYTES,
        )
        .map_err(GigeError::Io)?;
        let port = socket.local_addr().map_err(GigeError::Io)?.port();
        let wire_packet_size = config.payload_packet_size as u32 + PACKET_PROTOCOL_OVERHEAD;
        {
            let mut client = self.client.lock().await;
            client
                .write_register(
                    bootstrap::regs::STREAM_CHANNEL_0_PACKET_SIZE,
                    wire_packet_size,
                )
                .await?;
            client
                .write_register(bootstrap::regs::STREAM_CHANNEL_0_PACKET_DELAY, packet_delay)
                .await?;
            client
                .write_memory(
                    bootstrap::regs::STREAM_CHANNEL_0_IP_ADDRESS,
                    &host_ip.octets(),
                )
                .await?;
            // Writing the port register opens the channel; keep it last.
            client
                .write_register(bootstrap::regs::STREAM_CHANNEL_0_PORT, port as u32)
                .await?;
        }
        info!(%host_ip, port, wire_packet_size, "stream channel 0 configured");
        Ok(Stream::spawn(socket, Some(self.client.clone()), config))
    }
}

#[async_trait]
impl Device for GigeDevice {
    async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, DeviceError> {
        let mut client = self.client.lock().await;
        Ok(client.read_memory(address, size).await?)
    }

    async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut client = self.client.lock().await;
        Ok(client.write_memory(address, data).await?)
    }

    async fn read_register(&self, address: u64) -> Result<u32, DeviceError> {
        let mut client = self.client.lock().await;
        Ok(client.read_register(address).await?)
    }

    async fn write_register(&self, address: u64, value: u32) -> Result<(), DeviceError> {
        let mut client = self.client.lock().await;
        Ok(client.write_register(address, value).await?)
    }

    async fn genicam_xml(&self) -> Result<String, DeviceError> {
        let url_bytes = self
            .read_memory(bootstrap::regs::XML_URL_0, bootstrap::regs::XML_URL_SIZE)
            .await?;
        let url = bootstrap::parse_fixed_string(&url_bytes)
            .ok_or_else(|| DeviceError::Genicam("empty GenICam URL register".into()))?;
        debug!(url, "resolving GenICam document");
        match bootstrap::parse_genicam_url(&url)? {
            GenicamUrl::Local {
                address, length, ..
            } => {
                let xml = self.read_memory(address, length as usize).await?;
                String::from_utf8(xml)
                    .map_err(|err| DeviceError::Genicam(format!("invalid UTF-8: {err}")))
            }
            GenicamUrl::Http(url) => Err(DeviceError::Genicam(format!(
                "HTTP GenICam retrieval is not supported ({url})"
            ))),
            GenicamUrl::File(path) => std::fs::read_to_string(&path)
                .map_err(|err| DeviceError::Genicam(format!("{path}: {err}"))),
        }
    }

    fn control_events(&self) -> Option<watch::Receiver<ControlEvent>> {
        self.heartbeat.as_ref().map(|hb| hb.events())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        let mut client = self.client.lock().await;
        let _ = client
            .write_register(bootstrap::regs::CONTROL_CHANNEL_PRIVILEGE, 0)
            .await;
        // Transactions still parked on the mutex observe cancellation.
        client.cancel_token().cancel();
        Ok(())
    }
}

/// A USB3 Vision device over an abstract bulk transport.
pub struct U3vDevice<T: BulkTransport> {
    control: Mutex<U3vControl<T>>,
}

impl<T: BulkTransport> U3vDevice<T> {
    /// Wrap a claimed control endpoint pair and adopt the transfer limits
    /// advertised by the bootstrap register map.
    pub async fn open(transport: T) -> Result<Self, DeviceError> {
        let mut control = U3vControl::new(transport);
        let sbrm = {
            let bytes = control
                .read_memory(tl_u3v::abrm::abrm::SBRM_ADDRESS, 8)
                .await?;
            u64::from_le_bytes(bytes.as_slice().try_into().unwrap_or([0u8; 8]))
        };
        if sbrm != 0 {
            if let Ok(max) = control
                .read_register(sbrm + tl_u3v::abrm::sbrm::MAX_CMD_TRANSFER_SIZE)
                .await
            {
                if max > 0 {
                    control.set_max_cmd_transfer(max as usize);
                }
            }
        }
        Ok(Self {
            control: Mutex::new(control),
        })
    }
}

#[async_trait]
impl<T: BulkTransport> Device for U3vDevice<T> {
    async fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, DeviceError> {
        let mut control = self.control.lock().await;
        Ok(control.read_memory(address, size).await?)
    }

    async fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut control = self.control.lock().await;
        Ok(control.write_memory(address, data).await?)
    }

    async fn read_register(&self, address: u64) -> Result<u32, DeviceError> {
        let mut control = self.control.lock().await;
        Ok(control.read_register(address).await?)
    }

    async fn write_register(&self, address: u64, value: u32) -> Result<(), DeviceError> {
        let mut control = self.control.lock().await;
        Ok(control.write_register(address, value).await?)
    }

    async fn genicam_xml(&self) -> Result<String, DeviceError> {
        // The manifest table holds the document location; entry 0 is the
        // default manifest.
        let manifest = {
            let bytes = self
                .read_memory(tl_u3v::abrm::abrm::MANIFEST_TABLE_ADDRESS, 8)
                .await?;
            u64::from_le_bytes(bytes.as_slice().try_into().unwrap_or([0u8; 8]))
        };
        if manifest == 0 {
            return Err(DeviceError::Genicam("device has no manifest table".into()));
        }
        let entry = self.read_memory(manifest + 8, 64).await?;
        let address = u64::from_le_bytes(entry[8..16].try_into().unwrap_or([0u8; 8]));
        let length = u64::from_le_bytes(entry[16..24].try_into().unwrap_or([0u8; 8]));
        if address == 0 || length == 0 {
            return Err(DeviceError::Genicam("empty manifest entry".into()));
        }
        let xml = self.read_memory(address, length as usize).await?;
        String::from_utf8(xml).map_err(|err| DeviceError::Genicam(format!("invalid UTF-8: {err}")))
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let mut control = self.control.lock().await;
        Ok(control.close().await?)
    }
}

/// Blocking adapter exposing a [`Device`] to the synchronous feature
/// engine.
///
/// The adapter waits on control transactions through a runtime handle; its
/// methods must not be called from inside the runtime's own worker context
/// or `block_on` panics.
pub struct DevicePortIo {
    handle: tokio::runtime::Handle,
    device: Arc<dyn Device>,
}

impl DevicePortIo {
    /// Create an adapter using the provided runtime handle and device.
    pub fn new(handle: tokio::runtime::Handle, device: Arc<dyn Device>) -> Self {
        Self { handle, device }
    }
}

impl PortIo for DevicePortIo {
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
        if request.legacy_register_access && buffer.len() == 4 {
            // Legacy devices answer 4-byte accesses through the register
            // commands, values big-endian.
            let value = self
                .handle
                .block_on(self.device.read_register(address))
                .map_err(|err| GenApiError::Io(err.to_string()))?;
            buffer.copy_from_slice(&value.to_be_bytes());
            return Ok(());
        }
        let bytes = self
            .handle
            .block_on(self.device.read_memory(address, buffer.len()))
            .map_err(|err| GenApiError::Io(err.to_string()))?;
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
        if request.legacy_register_access && data.len() == 4 {
            let value = u32::from_be_bytes(data.try_into().expect("4-byte slice"));
            return self
                .handle
                .block_on(self.device.write_register(address, value))
                .map_err(|err| GenApiError::Io(err.to_string()));
        }
        self.handle
            .block_on(self.device.write_memory(address, data))
            .map_err(|err| GenApiError::Io(err.to_string()))
    }
}
