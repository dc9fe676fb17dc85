//! Control channel heartbeat maintenance.
//!
//! After taking control of a device the client must keep re-writing the
//! control-channel-privilege register at a period below the device heartbeat
//! timeout, otherwise the device revokes control. The refresh runs as a
//! background task sharing the control client through the per-device mutex.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::bootstrap;
use crate::gvcp::{GigeError, GvcpClient};

/// Out-of-band control channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Control is held and the heartbeat is being refreshed.
    Active,
    /// The heartbeat failed and the device may have revoked control.
    ControlLost,
}

/// Handle owning the heartbeat task.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
    events: watch::Receiver<ControlEvent>,
}

impl HeartbeatHandle {
    /// Subscribe to control channel events.
    pub fn events(&self) -> watch::Receiver<ControlEvent> {
        self.events.clone()
    }

    /// Stop refreshing the heartbeat.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the heartbeat refresh task.
///
/// `timeout_ms` is the device-reported heartbeat timeout; refreshes are
/// issued at a third of it so that a single lost transaction does not drop
/// control. `privilege` is the value re-written to the privilege register.
pub fn spawn_heartbeat(
    client: Arc<Mutex<GvcpClient>>,
    timeout_ms: u32,
    privilege: u32,
) -> HeartbeatHandle {
    let timeout_ms = timeout_ms.max(100);
    let period = Duration::from_millis((timeout_ms / 3).max(1) as u64);
    let (tx, rx) = watch::channel(ControlEvent::Active);
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let result = {
                let mut client = client.lock().await;
                client
                    .write_register(bootstrap::regs::CONTROL_CHANNEL_PRIVILEGE, privilege)
                    .await
            };
            match result {
                Ok(()) => {
                    debug!("heartbeat refreshed");
                }
                Err(GigeError::Cancelled) => break,
                Err(err) => {
                    warn!(error = %err, "heartbeat refresh failed, control may be lost");
                    let _ = tx.send(ControlEvent::ControlLost);
                    break;
                }
            }
        }
    });
    HeartbeatHandle { task, events: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::UdpSocket;

    use crate::gvcp::ControlConfig;

    #[tokio::test]
    async fn heartbeat_writes_privilege_register() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let writes = Arc::new(AtomicU32::new(0));
        let counter = writes.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let id = u16::from_be_bytes([buf[6], buf[7]]);
                let mut out = bytes::BytesMut::new();
                out.put_u16(0x0000);
                out.put_u16(0x0083);
                out.put_u16(4);
                out.put_u16(id);
                out.put_u32(0);
                let _ = socket.send_to(&out, src).await;
                let _ = len;
            }
        });

        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_config(ControlConfig {
            timeout: Duration::from_millis(100),
            max_attempts: 1,
        });
        let client = Arc::new(Mutex::new(client));
        let handle = spawn_heartbeat(client, 300, bootstrap::privilege::CONTROL);
        time::sleep(Duration::from_millis(350)).await;
        handle.stop();
        assert!(writes.load(Ordering::SeqCst) >= 2);
        assert_eq!(*handle.events().borrow(), ControlEvent::Active);
    }

    #[tokio::test]
    async fn heartbeat_reports_control_lost() {
        // No responder behind this socket: every refresh times out.
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        let mut client = GvcpClient::open(addr).await.expect("open");
        client.set_config(ControlConfig {
            timeout: Duration::from_millis(10),
            max_attempts: 1,
        });
        let client = Arc::new(Mutex::new(client));
        let handle = spawn_heartbeat(client, 150, bootstrap::privilege::CONTROL);
        let mut events = handle.events();
        time::timeout(Duration::from_secs(2), events.changed())
            .await
            .expect("event in time")
            .expect("channel open");
        assert_eq!(*events.borrow(), ControlEvent::ControlLost);
    }
}
