//! Network helper utilities for GigE Vision streaming.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::gvsp::PACKET_PROTOCOL_OVERHEAD;

/// Default receive buffer request for stream sockets.
pub const DEFAULT_RCVBUF_BYTES: usize = 16 * 1024 * 1024;

/// Bind a UDP socket suitable for receiving GVSP packets.
///
/// The OS receive buffer is enlarged to `rcvbuf_bytes` (best effort; the
/// kernel may clamp it). Sizing it to at least one frame's worth of
/// datagrams avoids drops during delivery stalls.
pub fn bind_stream_socket(
    bind_ip: IpAddr,
    port: u16,
    rcvbuf_bytes: usize,
) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(bind_ip, port);
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(rcvbuf_bytes)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let effective = socket.recv_buffer_size().unwrap_or(0);
    debug!(requested = rcvbuf_bytes, effective, %addr, "bound stream socket");
    UdpSocket::from_std(socket.into())
}

/// Compute the maximum GVSP payload size for a given link MTU.
pub fn max_payload_from_mtu(mtu: u32) -> u32 {
    mtu.saturating_sub(PACKET_PROTOCOL_OVERHEAD)
}

/// Receive buffer size covering `frames` frames of `frame_size` bytes split
/// into `packet_size`-sized datagrams.
pub fn rcvbuf_for_frames(frame_size: usize, packet_size: usize, frames: usize) -> usize {
    let payload = packet_size.saturating_sub(PACKET_PROTOCOL_OVERHEAD as usize).max(1);
    let packets = frame_size.div_ceil(payload);
    (packets * packet_size * frames).max(DEFAULT_RCVBUF_BYTES / 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn payload_accounts_for_headers() {
        assert_eq!(max_payload_from_mtu(1500), 1500 - 36);
        assert_eq!(max_payload_from_mtu(16), 0);
    }

    #[test]
    fn rcvbuf_covers_requested_frames() {
        let frame = 1920 * 1080;
        let size = rcvbuf_for_frames(frame, 1500, 2);
        assert!(size >= 2 * frame);
    }

    #[tokio::test]
    async fn bind_requests_large_buffer() {
        let socket = bind_stream_socket(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1 << 20)
            .expect("bind");
        assert!(socket.local_addr().expect("addr").port() != 0);
    }
}
