//! Thin camera façade binding a device to its feature engine.

use std::sync::Arc;

use tracing::info;

use genapi_core::{Endianness, GenApiError, NodeMap};

use crate::device::{Device, DeviceError, DevicePortIo};
use crate::ArvisError;

/// A camera: an open device plus the feature engine built from its
/// GenICam document.
///
/// Feature accessors wait on control transactions through a runtime
/// handle; call them from a blocking context, not from inside an async
/// task (see [`DevicePortIo`]).
pub struct Camera {
    device: Arc<dyn Device>,
    nodemap: NodeMap,
    port: DevicePortIo,
}

impl Camera {
    /// Fetch and parse the device's GenICam document and build the engine.
    pub async fn open(device: Arc<dyn Device>) -> Result<Self, ArvisError> {
        let xml = device.genicam_xml().await?;
        let nodemap = NodeMap::from_xml(&xml)?;
        info!(
            vendor = nodemap.document().vendor_name.as_deref().unwrap_or(""),
            model = nodemap.document().model_name.as_deref().unwrap_or(""),
            nodes = nodemap.document().len(),
            "camera opened"
        );
        let port = DevicePortIo::new(tokio::runtime::Handle::current(), device.clone());
        Ok(Self {
            device,
            nodemap,
            port,
        })
    }

    /// As [`open`](Self::open), with a non-default register byte order
    /// (U3V devices default to little-endian).
    pub async fn open_with_endianness(
        device: Arc<dyn Device>,
        endianness: Endianness,
    ) -> Result<Self, ArvisError> {
        let mut camera = Self::open(device).await?;
        camera.nodemap.set_default_endianness(endianness);
        Ok(camera)
    }

    /// The underlying device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The feature engine.
    pub fn nodemap(&self) -> &NodeMap {
        &self.nodemap
    }

    /// Mutable access to the feature engine, for policy changes.
    pub fn nodemap_mut(&mut self) -> &mut NodeMap {
        &mut self.nodemap
    }

    /// Read an integer feature.
    pub fn get_integer(&self, name: &str) -> Result<i64, GenApiError> {
        self.nodemap.get_integer(name, &self.port)
    }

    /// Write an integer feature.
    pub fn set_integer(&self, name: &str, value: i64) -> Result<(), GenApiError> {
        self.nodemap.set_integer(name, value, &self.port)
    }

    /// Bounds and increment of an integer feature.
    pub fn integer_bounds(&self, name: &str) -> Result<(i64, i64, i64), GenApiError> {
        self.nodemap.integer_bounds(name, &self.port)
    }

    /// Read a float feature.
    pub fn get_float(&self, name: &str) -> Result<f64, GenApiError> {
        self.nodemap.get_float(name, &self.port)
    }

    /// Write a float feature.
    pub fn set_float(&self, name: &str, value: f64) -> Result<(), GenApiError> {
        self.nodemap.set_float(name, value, &self.port)
    }

    /// Read a boolean feature.
    pub fn get_boolean(&self, name: &str) -> Result<bool, GenApiError> {
        self.nodemap.get_boolean(name, &self.port)
    }

    /// Write a boolean feature.
    pub fn set_boolean(&self, name: &str, value: bool) -> Result<(), GenApiError> {
        self.nodemap.set_boolean(name, value, &self.port)
    }

    /// Read a string or enumeration feature.
    pub fn get_string(&self, name: &str) -> Result<String, GenApiError> {
        self.nodemap.get_string(name, &self.port)
    }

    /// Current entry of an enumeration feature.
    pub fn get_enum(&self, name: &str) -> Result<String, GenApiError> {
        self.nodemap.get_enum(name, &self.port)
    }

    /// Select an enumeration entry.
    pub fn set_enum(&self, name: &str, entry: &str) -> Result<(), GenApiError> {
        self.nodemap.set_enum(name, entry, &self.port)
    }

    /// Implemented entries of an enumeration feature.
    pub fn enum_entries(&self, name: &str) -> Result<Vec<String>, GenApiError> {
        self.nodemap.enum_entries(name, &self.port)
    }

    /// Execute a command feature.
    pub fn execute(&self, name: &str) -> Result<(), GenApiError> {
        self.nodemap.execute(name, &self.port)
    }

    /// Start acquisition and drop cached register state, which the device
    /// may change once streaming.
    pub fn acquisition_start(&self) -> Result<(), GenApiError> {
        self.nodemap.execute("AcquisitionStart", &self.port)?;
        self.nodemap.invalidate_all();
        Ok(())
    }

    /// Stop acquisition.
    pub fn acquisition_stop(&self) -> Result<(), GenApiError> {
        self.nodemap.execute("AcquisitionStop", &self.port)
    }

    /// Release the device.
    pub async fn close(self) -> Result<(), DeviceError> {
        self.device.close().await
    }
}
