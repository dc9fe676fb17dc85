//! Interfaces and discovery: one factory per transport protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use tl_gige::gvcp::{self, GVCP_PORT};

use crate::device::{Device, DeviceError, GigeDevice};
use crate::fake::{FakeDevice, FAKE_MODEL, FAKE_SERIAL, FAKE_VENDOR};

/// Discovery and open errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no device matches '{0}'")]
    NotFound(String),
    #[error("'{0}' matches more than one device")]
    AmbiguousId(String),
    #[error(transparent)]
    Gige(#[from] tl_gige::gvcp::GigeError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Supported interface protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Gige,
    U3v,
    Fake,
}

/// Identity of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    /// Unique id, stable across discovery rounds.
    pub id: String,
    /// Physical identifier (MAC or USB GUID).
    pub physical: String,
    /// Network or bus address.
    pub address: String,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub manufacturer_info: String,
}

impl DeviceId {
    fn matches(&self, needle: &str) -> bool {
        self.id == needle
            || self.physical == needle
            || self.address == needle
            || self.serial == needle
    }
}

/// A protocol-specific device factory.
#[async_trait]
pub trait Interface: Send {
    /// Protocol served by this interface.
    fn kind(&self) -> InterfaceKind;
    /// Refresh the list of reachable devices.
    async fn update_device_list(&mut self) -> Result<(), DiscoveryError>;
    /// Devices found by the last update, in discovery order.
    fn device_ids(&self) -> &[DeviceId];
    /// Open a device by id.
    async fn open_device(&self, id: &str) -> Result<Arc<dyn Device>, DiscoveryError>;
}

/// GigE Vision interface backed by GVCP discovery broadcasts.
pub struct GigeInterface {
    timeout: Duration,
    devices: Vec<DeviceId>,
}

impl GigeInterface {
    /// Create an interface with the given discovery timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            devices: Vec::new(),
        }
    }
}

impl Default for GigeInterface {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl Interface for GigeInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Gige
    }

    async fn update_device_list(&mut self) -> Result<(), DiscoveryError> {
        let found = gvcp::discover(self.timeout).await?;
        self.devices = found
            .into_iter()
            .map(|info| {
                let mac = info
                    .mac
                    .iter()
                    .map(|byte| format!("{byte:02X}"))
                    .collect::<Vec<_>>()
                    .join(":");
                let vendor = info.vendor.unwrap_or_default();
                let model = info.model.unwrap_or_default();
                let serial = info.serial.unwrap_or_default();
                DeviceId {
                    id: format!("{vendor}-{model}-{serial}"),
                    physical: mac,
                    address: info.ip.to_string(),
                    vendor,
                    model,
                    serial,
                    manufacturer_info: info.manufacturer_info.unwrap_or_default(),
                }
            })
            .collect();
        info!(n_devices = self.devices.len(), "GigE discovery complete");
        Ok(())
    }

    fn device_ids(&self) -> &[DeviceId] {
        &self.devices
    }

    async fn open_device(&self, id: &str) -> Result<Arc<dyn Device>, DiscoveryError> {
        let device_id = self
            .devices
            .iter()
            .find(|device| device.matches(id))
            .ok_or_else(|| DiscoveryError::NotFound(id.to_string()))?;
        let ip = device_id
            .address
            .parse()
            .map_err(|_| DiscoveryError::NotFound(id.to_string()))?;
        let addr = SocketAddr::new(ip, GVCP_PORT);
        let device: Arc<dyn Device> = Arc::new(GigeDevice::open(addr).await?);
        Ok(device)
    }
}

/// Fake interface exposing one in-memory camera.
#[derive(Default)]
pub struct FakeInterface {
    devices: Vec<DeviceId>,
}

impl FakeInterface {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Interface for FakeInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Fake
    }

    async fn update_device_list(&mut self) -> Result<(), DiscoveryError> {
        self.devices = vec![DeviceId {
            id: format!("{FAKE_VENDOR}-{FAKE_MODEL}-{FAKE_SERIAL}"),
            physical: String::new(),
            address: String::new(),
            vendor: FAKE_VENDOR.to_string(),
            model: FAKE_MODEL.to_string(),
            serial: FAKE_SERIAL.to_string(),
            manufacturer_info: String::new(),
        }];
        Ok(())
    }

    fn device_ids(&self) -> &[DeviceId] {
        &self.devices
    }

    async fn open_device(&self, id: &str) -> Result<Arc<dyn Device>, DiscoveryError> {
        let known = self
            .devices
            .iter()
            .any(|device| device.matches(id) || device.serial == id);
        if !known {
            return Err(DiscoveryError::NotFound(id.to_string()));
        }
        let device: Arc<dyn Device> = FakeDevice::new();
        Ok(device)
    }
}

/// The set of enabled interfaces; owns discovery state explicitly instead
/// of hiding it behind process-wide singletons.
pub struct System {
    interfaces: Vec<Box<dyn Interface>>,
}

impl System {
    /// A system with no interfaces enabled.
    pub fn new() -> Self {
        Self {
            interfaces: Vec::new(),
        }
    }

    /// Enable an interface.
    pub fn enable(&mut self, kind: InterfaceKind) -> &mut Self {
        if self.interfaces.iter().any(|iface| iface.kind() == kind) {
            return self;
        }
        match kind {
            InterfaceKind::Gige => self.interfaces.push(Box::new(GigeInterface::default())),
            InterfaceKind::Fake => self.interfaces.push(Box::new(FakeInterface::new())),
            InterfaceKind::U3v => {
                // USB enumeration lives behind the `usb` feature of the
                // transport crate; nothing to register here yet.
            }
        }
        self
    }

    /// Refresh every enabled interface.
    pub async fn update_device_list(&mut self) -> Result<(), DiscoveryError> {
        for interface in &mut self.interfaces {
            interface.update_device_list().await?;
        }
        Ok(())
    }

    /// All discovered devices across interfaces.
    pub fn device_ids(&self) -> Vec<&DeviceId> {
        self.interfaces
            .iter()
            .flat_map(|interface| interface.device_ids().iter())
            .collect()
    }

    /// Open a device by id; `None` opens the only discovered device.
    pub async fn open_device(&self, id: Option<&str>) -> Result<Arc<dyn Device>, DiscoveryError> {
        match id {
            None => {
                let all = self.device_ids();
                match all.len() {
                    0 => Err(DiscoveryError::NotFound("<any>".to_string())),
                    1 => {
                        let only = all[0].id.clone();
                        self.open_by_id(&only).await
                    }
                    _ => Err(DiscoveryError::AmbiguousId("<any>".to_string())),
                }
            }
            Some(id) => self.open_by_id(id).await,
        }
    }

    async fn open_by_id(&self, id: &str) -> Result<Arc<dyn Device>, DiscoveryError> {
        let mut owner: Option<&dyn Interface> = None;
        let mut n_matches = 0usize;
        for interface in &self.interfaces {
            let n = interface
                .device_ids()
                .iter()
                .filter(|device| device.matches(id))
                .count();
            if n > 0 {
                owner = Some(interface.as_ref());
                n_matches += n;
            }
        }
        match (n_matches, owner) {
            (0, _) | (_, None) => Err(DiscoveryError::NotFound(id.to_string())),
            (1, Some(interface)) => interface.open_device(id).await,
            _ => Err(DiscoveryError::AmbiguousId(id.to_string())),
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_interface_reports_one_device() {
        let mut system = System::new();
        system.enable(InterfaceKind::Fake);
        system.update_device_list().await.expect("update");
        let devices = system.device_ids();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor, "Arvis");
        assert_eq!(devices[0].model, "Fake");
        assert_eq!(devices[0].serial, "GV01");
    }

    #[tokio::test]
    async fn open_by_serial_and_by_id() {
        let mut system = System::new();
        system.enable(InterfaceKind::Fake);
        system.update_device_list().await.expect("update");
        system.open_device(Some("GV01")).await.expect("by serial");
        system
            .open_device(Some("Arvis-Fake-GV01"))
            .await
            .expect("by id");
        system.open_device(None).await.expect("single device");
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let mut system = System::new();
        system.enable(InterfaceKind::Fake);
        system.update_device_list().await.expect("update");
        let Err(err) = system.open_device(Some("nope")).await else {
            panic!("expected error")
        };
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_system_has_no_devices() {
        let system = System::new();
        let Err(err) = system.open_device(None).await else {
            panic!("expected error")
        };
        assert!(matches!(err, DiscoveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn enabling_twice_keeps_one_interface() {
        let mut system = System::new();
        system.enable(InterfaceKind::Fake).enable(InterfaceKind::Fake);
        system.update_device_list().await.expect("update");
        assert_eq!(system.device_ids().len(), 1);
    }
}
