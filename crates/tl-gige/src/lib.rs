#![cfg_attr(docsrs, feature(doc_cfg))]
//! GigE Vision transport: discovery and control (GVCP), streaming (GVSP).

pub mod bootstrap;
pub mod cancel;
pub mod gvcp;
pub mod gvsp;
pub mod heartbeat;
pub mod nic;

pub use cancel::CancelToken;
pub use gvcp::{discover, discover_on_interface, DeviceInfo, GigeError, GvcpClient, GVCP_PORT};
pub use heartbeat::{spawn_heartbeat, ControlEvent, HeartbeatHandle};
