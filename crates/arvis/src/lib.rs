#![cfg_attr(docsrs, feature(doc_cfg))]
//! Vision camera core.
//!
//! Discovers industrial cameras (GigE Vision, USB3 Vision, fake), opens a
//! control channel, parses the device's GenICam feature model and streams
//! acquired frames back into client-owned buffers. The crates underneath
//! split along protocol lines: [`gencp`] frames control packets,
//! [`tl_gige`]/[`tl_u3v`] speak the transports, [`genapi_xml`] and
//! [`genapi_core`] form the feature engine. This crate binds them: the
//! [`Device`](device::Device) abstraction, buffers and the GVSP stream
//! reassembler, the chunk-data parser, discovery, and a thin camera
//! façade.

pub use genapi_core as genapi;
pub use genapi_xml;
pub use gencp;
pub use pfnc;
pub use tl_gige as gige;
pub use tl_u3v as u3v;

pub mod buffer;
pub mod camera;
pub mod chunks;
pub mod device;
pub mod fake;
pub mod interface;
pub mod stream;

use thiserror::Error;

pub use buffer::{Buffer, BufferPart, BufferPayloadType, BufferStatus, ChunkEndianness};
pub use camera::Camera;
pub use chunks::{ChunkError, ChunkParser};
pub use device::{Device, DeviceError, DevicePortIo, GigeDevice, U3vDevice};
pub use fake::FakeDevice;
pub use interface::{DeviceId, DiscoveryError, Interface, InterfaceKind, System};
pub use stream::{ResendPolicy, Stream, StreamConfig, StreamStatsSnapshot};

/// Top level error type of the façade.
#[derive(Debug, Error)]
pub enum ArvisError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    GenApi(#[from] genapi_core::GenApiError),
    #[error("genicam document: {0}")]
    Xml(#[from] genapi_xml::XmlError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}
