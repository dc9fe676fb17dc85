//! GVSP stream reception: frame reassembly, resend policy, delivery.
//!
//! The reassembler is a synchronous state machine fed with raw datagrams;
//! the socket loop around it runs as a background task. Buffers travel from
//! the client through the input queue, are filled packet by packet, and
//! leave through the output queue in leader order with a terminal status.
//! Packet loss is repaired through GVCP resend requests when the policy
//! allows, bounded per frame by the request ratio.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use tl_gige::cancel::CancelToken;
use tl_gige::gvcp::GvcpClient;
use tl_gige::gvsp::{self, GvspPacket, PacketIds, PayloadType};

use crate::buffer::{Buffer, BufferPart, BufferPayloadType, BufferStatus};

/// Packet resend behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResendPolicy {
    /// Gaps permanently fail the frame.
    Never,
    /// Every detected gap is requested again from the device.
    #[default]
    Always,
}

/// Stream tuning parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub resend_policy: ResendPolicy,
    /// Cap on resend traffic per frame, as a fraction of the payload size.
    pub packet_request_ratio: f64,
    /// Wait for the first packet of a frame.
    pub initial_packet_timeout: Duration,
    /// Wait for the next packet once a frame is in progress.
    pub packet_timeout: Duration,
    /// Absolute ceiling on the time a frame may hold a buffer.
    pub frame_retention: Duration,
    /// Payload bytes carried by one PAYLOAD packet.
    pub payload_packet_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            resend_policy: ResendPolicy::default(),
            packet_request_ratio: 0.25,
            initial_packet_timeout: Duration::from_micros(100_000),
            packet_timeout: Duration::from_micros(40_000),
            frame_retention: Duration::from_micros(200_000),
            payload_packet_size: 1400,
        }
    }
}

/// Stream counters, shared between the receive task and the client.
#[derive(Debug, Default)]
pub struct StreamStats {
    n_completed_buffers: AtomicU64,
    n_failures: AtomicU64,
    n_underruns: AtomicU64,
    n_missing_packets: AtomicU64,
    n_resent_packets: AtomicU64,
    n_transferred_bytes: AtomicU64,
}

impl StreamStats {
    /// Snapshot the counters.
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            n_completed_buffers: self.n_completed_buffers.load(Ordering::Relaxed),
            n_failures: self.n_failures.load(Ordering::Relaxed),
            n_underruns: self.n_underruns.load(Ordering::Relaxed),
            n_missing_packets: self.n_missing_packets.load(Ordering::Relaxed),
            n_resent_packets: self.n_resent_packets.load(Ordering::Relaxed),
            n_transferred_bytes: self.n_transferred_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatsSnapshot {
    pub n_completed_buffers: u64,
    pub n_failures: u64,
    pub n_underruns: u64,
    pub n_missing_packets: u64,
    pub n_resent_packets: u64,
    pub n_transferred_bytes: u64,
}

/// Side effects requested by the reassembler.
#[derive(Debug)]
pub(crate) enum Action {
    /// Hand a finalised buffer to the output queue.
    Deliver(Buffer),
    /// Ask the device to retransmit a packet range.
    Resend {
        frame_id: u64,
        first: u32,
        last: u32,
        extended: bool,
    },
}

struct InFlight {
    buffer: Buffer,
    frame_id: u64,
    extended: bool,
    /// Expected payload bytes; 0 while unknown.
    expected_size: usize,
    /// Expected payload packet count; 0 while unknown (set by the trailer).
    n_packets: usize,
    received: Vec<bool>,
    received_bytes: usize,
    /// Highest id below which every payload packet has arrived.
    highest_contiguous: u32,
    /// Highest payload id observed; gaps are detected against this.
    max_id_seen: u32,
    resent_bytes: usize,
    trailer_seen: bool,
    last_activity: Instant,
    started: Instant,
    timeout_resend_done: bool,
}

impl InFlight {
    fn mark_received(&mut self, packet_id: u32) {
        let index = (packet_id - 1) as usize;
        if self.received.len() <= index {
            self.received.resize(index + 1, false);
        }
        if !self.received[index] {
            self.received[index] = true;
            while (self.highest_contiguous as usize) < self.received.len()
                && self.received[self.highest_contiguous as usize]
            {
                self.highest_contiguous += 1;
            }
        }
    }

    fn holes(&self, up_to: usize) -> Vec<(u32, u32)> {
        let mut ranges = Vec::new();
        let mut index = 0usize;
        while index < up_to {
            if index < self.received.len() && self.received[index] {
                index += 1;
                continue;
            }
            let first = index;
            while index < up_to && !(index < self.received.len() && self.received[index]) {
                index += 1;
            }
            ranges.push((first as u32 + 1, index as u32));
        }
        ranges
    }

    fn is_complete(&self) -> bool {
        self.n_packets > 0
            && self.received.len() >= self.n_packets
            && self.received[..self.n_packets].iter().all(|&r| r)
    }

    /// Hard cap on the bytes this frame may request again.
    fn resend_budget(&self, ratio: f64) -> usize {
        let reference = if self.expected_size > 0 {
            self.expected_size
        } else {
            self.buffer.allocated_size()
        };
        ((reference as f64) * ratio) as usize
    }
}

/// The frame reassembly state machine.
pub(crate) struct Reassembler {
    config: StreamConfig,
    stats: Arc<StreamStats>,
    current: Option<InFlight>,
}

impl Reassembler {
    pub(crate) fn new(config: StreamConfig, stats: Arc<StreamStats>) -> Self {
        Self {
            config,
            stats,
            current: None,
        }
    }

    /// Deadline of the next timeout decision for the frame in flight.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|frame| {
            (frame.last_activity + self.config.packet_timeout)
                .min(frame.started + self.config.frame_retention)
        })
    }

    /// Feed one datagram into the state machine.
    pub(crate) fn handle_datagram(
        &mut self,
        datagram: &[u8],
        now: Instant,
        pop_buffer: &mut dyn FnMut() -> Option<Buffer>,
        actions: &mut Vec<Action>,
    ) {
        let packet = match gvsp::parse_packet(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, bytes = datagram.len(), "ignoring undecodable datagram");
                return;
            }
        };
        match packet {
            GvspPacket::Leader {
                ids,
                payload_type,
                timestamp,
                image,
                parts,
            } => self.handle_leader(ids, payload_type, timestamp, image, parts, now, pop_buffer, actions),
            GvspPacket::Payload { ids, data } => {
                self.handle_payload(ids, None, &data, now, actions)
            }
            GvspPacket::MultipartPayload {
                ids,
                part_id,
                offset,
                data,
            } => self.handle_payload(ids, Some((part_id, offset)), &data, now, actions),
            GvspPacket::Trailer { ids, .. } => self.handle_trailer(ids, now, actions),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_leader(
        &mut self,
        ids: PacketIds,
        payload_type: PayloadType,
        timestamp: u64,
        image: Option<gvsp::ImageInfos>,
        part_infos: Vec<gvsp::PartInfos>,
        now: Instant,
        pop_buffer: &mut dyn FnMut() -> Option<Buffer>,
        actions: &mut Vec<Action>,
    ) {
        // Frame id 0 is invalid on the standard-id wire format.
        if !ids.extended && ids.frame_id == 0 {
            debug!("discarding leader with invalid frame id 0");
            return;
        }
        // A new leader closes whatever frame was still being assembled.
        if let Some(frame) = self.current.take() {
            warn!(
                frame_id = frame.frame_id,
                new_frame_id = ids.frame_id,
                "leader observed while frame incomplete"
            );
            self.finalise(frame, BufferStatus::MissingPackets, actions);
        }

        let buffer_payload = match payload_type {
            PayloadType::Image => BufferPayloadType::Image,
            PayloadType::RawData => BufferPayloadType::Rawdata,
            PayloadType::File => BufferPayloadType::File,
            PayloadType::ChunkData => BufferPayloadType::ChunkData,
            PayloadType::ExtendedChunkData => BufferPayloadType::ExtendedChunkData,
            PayloadType::Multipart => BufferPayloadType::Multipart,
            other => {
                debug!(payload_type = ?other, "unsupported payload type");
                if let Some(mut buffer) = pop_buffer() {
                    buffer.set_frame_id(ids.frame_id);
                    buffer.set_status(BufferStatus::PayloadNotSupported);
                    self.stats.n_failures.fetch_add(1, Ordering::Relaxed);
                    actions.push(Action::Deliver(buffer));
                }
                return;
            }
        };

        let Some(mut buffer) = pop_buffer() else {
            self.stats.n_underruns.fetch_add(1, Ordering::Relaxed);
            debug!(frame_id = ids.frame_id, "input queue empty, frame dropped");
            return;
        };

        let mut parts = Vec::new();
        let mut expected_size = 0usize;
        match buffer_payload {
            BufferPayloadType::Image => {
                if let Some(info) = image {
                    let format = pfnc::PixelFormat(info.pixel_format);
                    expected_size = format.image_size(info.width, info.height)
                        + info.height as usize * info.y_padding as usize;
                    parts.push(BufferPart {
                        data_offset: 0,
                        size: expected_size,
                        component_id: 0,
                        data_type: 0,
                        pixel_format: format,
                        width: info.width,
                        height: info.height,
                        x_offset: info.x_offset,
                        y_offset: info.y_offset,
                        x_padding: info.x_padding as u32,
                        y_padding: info.y_padding as u32,
                    });
                }
            }
            BufferPayloadType::Multipart => {
                let mut offset = 0usize;
                for info in &part_infos {
                    parts.push(BufferPart {
                        data_offset: offset,
                        size: info.size as usize,
                        component_id: info.component_id,
                        data_type: info.data_type,
                        pixel_format: pfnc::PixelFormat(info.pixel_format),
                        width: info.width,
                        height: info.height,
                        x_offset: info.x_offset,
                        y_offset: info.y_offset,
                        x_padding: info.x_padding as u32,
                        y_padding: info.y_padding as u32,
                    });
                    offset += info.size as usize;
                }
                expected_size = offset;
            }
            // Raw, file and chunk payloads declare their size only through
            // the packet flow itself.
            _ => {}
        }

        buffer.set_frame_id(ids.frame_id);
        buffer.set_payload_type(buffer_payload);
        buffer.set_timestamp_ns(timestamp);
        buffer.set_system_timestamp_ns(system_timestamp_ns());
        buffer.set_parts(parts);
        buffer.set_status(BufferStatus::Filling);

        if expected_size > 0 && buffer.allocated_size() < expected_size {
            warn!(
                frame_id = ids.frame_id,
                expected_size,
                allocated = buffer.allocated_size(),
                "buffer too small for declared payload"
            );
            buffer.set_status(BufferStatus::SizeMismatch);
            self.stats.n_failures.fetch_add(1, Ordering::Relaxed);
            actions.push(Action::Deliver(buffer));
            return;
        }

        let n_packets = if expected_size > 0 {
            expected_size.div_ceil(self.config.payload_packet_size)
        } else {
            0
        };
        trace!(frame_id = ids.frame_id, expected_size, n_packets, "frame started");
        self.current = Some(InFlight {
            buffer,
            frame_id: ids.frame_id,
            extended: ids.extended,
            expected_size,
            n_packets,
            received: vec![false; n_packets],
            received_bytes: 0,
            highest_contiguous: 0,
            max_id_seen: 0,
            resent_bytes: 0,
            trailer_seen: false,
            last_activity: now,
            started: now,
            timeout_resend_done: false,
        });
    }

    fn handle_payload(
        &mut self,
        ids: PacketIds,
        multipart: Option<(u16, u64)>,
        data: &[u8],
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        enum Verdict {
            Fail(BufferStatus),
            Filled { gap: Option<(u32, u32)>, complete: bool },
        }

        let verdict = {
            let Some(frame) = self.current.as_mut() else {
                trace!(frame_id = ids.frame_id, packet_id = ids.packet_id, "payload without frame");
                return;
            };
            if frame.frame_id != ids.frame_id {
                // A packet for an already-closed or future frame.
                trace!(
                    frame_id = ids.frame_id,
                    current = frame.frame_id,
                    "discarding payload for foreign frame"
                );
                return;
            }
            if ids.packet_id == 0 {
                Verdict::Fail(BufferStatus::WrongPacketId)
            } else {
                let offset = match multipart {
                    Some((part_id, part_offset)) => {
                        match frame.buffer.parts().get(part_id as usize).copied() {
                            Some(part) => Some(part.data_offset + part_offset as usize),
                            None => None,
                        }
                    }
                    None => {
                        Some((ids.packet_id as usize - 1) * self.config.payload_packet_size)
                    }
                };
                match offset {
                    None => Verdict::Fail(BufferStatus::WrongPacketId),
                    Some(offset) if offset + data.len() > frame.buffer.allocated_size() => {
                        Verdict::Fail(BufferStatus::SizeMismatch)
                    }
                    Some(offset) => {
                        frame.buffer.storage_mut()[offset..offset + data.len()]
                            .copy_from_slice(data);
                        frame.received_bytes += data.len();
                        frame.last_activity = now;
                        frame.mark_received(ids.packet_id);
                        // Gap detection against the highest id seen so far.
                        let gap = if ids.packet_id > frame.max_id_seen + 1 {
                            Some((frame.max_id_seen + 1, ids.packet_id - 1))
                        } else {
                            None
                        };
                        if ids.packet_id > frame.max_id_seen {
                            frame.max_id_seen = ids.packet_id;
                        }
                        Verdict::Filled {
                            gap,
                            complete: frame.trailer_seen && frame.is_complete(),
                        }
                    }
                }
            }
        };

        match verdict {
            Verdict::Fail(status) => {
                let frame = self.current.take().expect("frame in flight");
                self.finalise(frame, status, actions);
            }
            Verdict::Filled { gap, complete } => {
                self.stats
                    .n_transferred_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                if let Some((first, last)) = gap {
                    self.stats
                        .n_missing_packets
                        .fetch_add((last - first + 1) as u64, Ordering::Relaxed);
                    self.request_resend(first, last, actions);
                }
                // A late packet may close a frame whose trailer has passed.
                if complete {
                    let frame = self.current.take().expect("frame in flight");
                    self.finalise(frame, BufferStatus::Success, actions);
                }
            }
        }
    }

    fn handle_trailer(&mut self, ids: PacketIds, now: Instant, actions: &mut Vec<Action>) {
        enum Verdict {
            Complete,
            Incomplete {
                n_missing: u32,
                tail_missing: u32,
                tail_holes: Vec<(u32, u32)>,
            },
        }

        let verdict = {
            let Some(frame) = self.current.as_mut() else {
                trace!(frame_id = ids.frame_id, "trailer without frame");
                return;
            };
            if frame.frame_id != ids.frame_id {
                trace!(
                    frame_id = ids.frame_id,
                    current = frame.frame_id,
                    "discarding trailer for foreign frame"
                );
                return;
            }
            frame.last_activity = now;
            // The trailer id follows the last payload id.
            if frame.n_packets == 0 {
                frame.n_packets = ids.packet_id.saturating_sub(1) as usize;
            }
            frame.trailer_seen = true;

            if frame.is_complete() {
                Verdict::Complete
            } else {
                let holes = frame.holes(frame.n_packets);
                let n_missing = holes.iter().map(|&(f, l)| l - f + 1).sum();
                // Tail holes were never observed as gaps; they are counted
                // and requested here.
                let tail_holes: Vec<(u32, u32)> = holes
                    .iter()
                    .copied()
                    .filter(|&(first, _)| first > frame.max_id_seen)
                    .collect();
                let tail_missing = tail_holes.iter().map(|&(f, l)| l - f + 1).sum();
                if ids.packet_id > frame.max_id_seen {
                    frame.max_id_seen = ids.packet_id;
                }
                Verdict::Incomplete {
                    n_missing,
                    tail_missing,
                    tail_holes,
                }
            }
        };

        match verdict {
            Verdict::Complete => {
                let frame = self.current.take().expect("frame in flight");
                self.finalise(frame, BufferStatus::Success, actions);
            }
            Verdict::Incomplete {
                n_missing,
                tail_missing,
                tail_holes,
            } => {
                self.stats
                    .n_missing_packets
                    .fetch_add(tail_missing as u64, Ordering::Relaxed);
                if self.config.resend_policy == ResendPolicy::Never {
                    debug!(frame_id = ids.frame_id, n_missing, "frame incomplete at trailer");
                    let frame = self.current.take().expect("frame in flight");
                    self.finalise(frame, BufferStatus::MissingPackets, actions);
                    return;
                }
                // Request the unseen tail once and keep waiting for
                // retransmissions of everything outstanding.
                let mut any_requested = false;
                for (first, last) in tail_holes {
                    any_requested |= self.request_resend(first, last, actions);
                }
                let already_pending = self
                    .current
                    .as_ref()
                    .map(|frame| frame.resent_bytes > 0)
                    .unwrap_or(false);
                if !any_requested && !already_pending {
                    // Nothing was ever requested: the budget is exhausted
                    // or there is nothing left we may ask for again.
                    let frame = self.current.take().expect("frame in flight");
                    self.finalise(frame, BufferStatus::MissingPackets, actions);
                }
            }
        }
    }

    /// Issue a resend request if the policy and per-frame budget allow it.
    fn request_resend(&mut self, first: u32, last: u32, actions: &mut Vec<Action>) -> bool {
        if self.config.resend_policy == ResendPolicy::Never {
            return false;
        }
        let Some(frame) = self.current.as_mut() else {
            return false;
        };
        let n_packets = (last - first + 1) as usize;
        let bytes = n_packets * self.config.payload_packet_size;
        let budget = frame.resend_budget(self.config.packet_request_ratio);
        if frame.resent_bytes + bytes > budget {
            debug!(
                frame_id = frame.frame_id,
                first,
                last,
                resent = frame.resent_bytes,
                budget,
                "resend budget exhausted"
            );
            return false;
        }
        frame.resent_bytes += bytes;
        self.stats
            .n_resent_packets
            .fetch_add(n_packets as u64, Ordering::Relaxed);
        trace!(frame_id = frame.frame_id, first, last, "requesting packet resend");
        actions.push(Action::Resend {
            frame_id: frame.frame_id,
            first,
            last,
            extended: frame.extended,
        });
        true
    }

    /// Apply the packet and retention timeouts.
    pub(crate) fn check_timeouts(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let Some(frame) = self.current.as_mut() else {
            return;
        };
        if now >= frame.started + self.config.frame_retention {
            debug!(frame_id = frame.frame_id, "frame retention expired");
            let frame = self.current.take().expect("frame in flight");
            self.finalise(frame, BufferStatus::Timeout, actions);
            return;
        }
        if now < frame.last_activity + self.config.packet_timeout {
            return;
        }
        if self.config.resend_policy == ResendPolicy::Always && !frame.timeout_resend_done {
            // First expiry: ask once for everything still missing.
            frame.timeout_resend_done = true;
            frame.last_activity = now;
            let up_to = if frame.n_packets > 0 {
                frame.n_packets
            } else {
                frame.max_id_seen as usize
            };
            let holes = frame.holes(up_to);
            let mut any = false;
            for (first, last) in holes {
                any |= self.request_resend(first, last, actions);
            }
            if any {
                return;
            }
        }
        debug!("packet timeout expired without progress");
        let frame = self.current.take().expect("frame in flight");
        self.finalise(frame, BufferStatus::Timeout, actions);
    }

    /// Return the in-flight buffer with `Aborted` status, if any.
    pub(crate) fn abort(&mut self, actions: &mut Vec<Action>) {
        if let Some(frame) = self.current.take() {
            self.finalise(frame, BufferStatus::Aborted, actions);
        }
    }

    fn finalise(&mut self, mut frame: InFlight, status: BufferStatus, actions: &mut Vec<Action>) {
        frame.buffer.set_received_size(frame.received_bytes);
        frame.buffer.set_status(status);
        match status {
            BufferStatus::Success => {
                self.stats.n_completed_buffers.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.n_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        trace!(
            frame_id = frame.frame_id,
            ?status,
            received = frame.received_bytes,
            "frame finalised"
        );
        actions.push(Action::Deliver(frame.buffer));
    }
}

fn system_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A running stream: socket loop, buffer queues, statistics.
pub struct Stream {
    input_tx: mpsc::UnboundedSender<Buffer>,
    output_rx: mpsc::UnboundedReceiver<Buffer>,
    stats: Arc<StreamStats>,
    stop: CancelToken,
    task: Option<JoinHandle<()>>,
}

impl Stream {
    /// Spawn the receive task around a bound socket.
    ///
    /// `control` carries resend requests onto the device's control channel,
    /// serialised against heartbeats by the per-device mutex.
    pub fn spawn(
        socket: UdpSocket,
        control: Option<Arc<Mutex<GvcpClient>>>,
        config: StreamConfig,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StreamStats::default());
        let stop = CancelToken::new();
        let task = tokio::spawn(receive_loop(
            socket,
            control,
            config,
            stats.clone(),
            input_rx,
            output_tx,
            stop.clone(),
        ));
        Self {
            input_tx,
            output_rx,
            stats,
            stop,
            task: Some(task),
        }
    }

    /// Queue an empty buffer for the receive task.
    pub fn push_buffer(&self, mut buffer: Buffer) {
        buffer.reset();
        let _ = self.input_tx.send(buffer);
    }

    /// Wait for the next finalised buffer.
    pub async fn pop_buffer(&mut self) -> Option<Buffer> {
        self.output_rx.recv().await
    }

    /// Wait for the next finalised buffer, up to `timeout`.
    pub async fn pop_buffer_timeout(&mut self, timeout: Duration) -> Option<Buffer> {
        time::timeout(timeout, self.output_rx.recv()).await.ok().flatten()
    }

    /// Take a finalised buffer if one is ready.
    pub fn try_pop_buffer(&mut self) -> Option<Buffer> {
        self.output_rx.try_recv().ok()
    }

    /// Snapshot the stream statistics.
    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the receive task; in-flight buffers drain with `Aborted`.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    control: Option<Arc<Mutex<GvcpClient>>>,
    config: StreamConfig,
    stats: Arc<StreamStats>,
    mut input_rx: mpsc::UnboundedReceiver<Buffer>,
    output_tx: mpsc::UnboundedSender<Buffer>,
    stop: CancelToken,
) {
    let initial_timeout = config.initial_packet_timeout;
    let mut engine = Reassembler::new(config, stats);
    let mut datagram = vec![0u8; 65536];
    let mut actions = Vec::new();
    info!("stream receive loop started");

    loop {
        let deadline = engine
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + initial_timeout);
        let received = tokio::select! {
            _ = stop.cancelled() => break,
            received = time::timeout_at(deadline.into(), socket.recv(&mut datagram)) => received,
        };
        let now = Instant::now();
        match received {
            Ok(Ok(len)) => {
                let mut pop = || input_rx.try_recv().ok();
                engine.handle_datagram(&datagram[..len], now, &mut pop, &mut actions);
            }
            Ok(Err(err)) => {
                warn!(error = %err, "stream socket error");
                break;
            }
            Err(_) => engine.check_timeouts(now, &mut actions),
        }
        run_actions(&mut actions, &output_tx, control.as_ref()).await;
    }

    engine.abort(&mut actions);
    run_actions(&mut actions, &output_tx, control.as_ref()).await;
    // Unused queued buffers drain back to the client as aborted.
    while let Ok(mut buffer) = input_rx.try_recv() {
        buffer.set_status(BufferStatus::Aborted);
        let _ = output_tx.send(buffer);
    }
    info!("stream receive loop finished");
}

async fn run_actions(
    actions: &mut Vec<Action>,
    output_tx: &mpsc::UnboundedSender<Buffer>,
    control: Option<&Arc<Mutex<GvcpClient>>>,
) {
    for action in actions.drain(..) {
        match action {
            Action::Deliver(buffer) => {
                let _ = output_tx.send(buffer);
            }
            Action::Resend {
                frame_id,
                first,
                last,
                extended,
            } => {
                if let Some(control) = control {
                    let mut client = control.lock().await;
                    if let Err(err) = client.request_resend(frame_id, first, last, extended).await {
                        warn!(error = %err, frame_id, first, last, "resend request failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tl_gige::gvsp::{encode_image_leader, encode_payload, encode_trailer, ImageInfos};

    const PACKET_SIZE: usize = 100;

    fn config(policy: ResendPolicy) -> StreamConfig {
        StreamConfig {
            resend_policy: policy,
            payload_packet_size: PACKET_SIZE,
            ..StreamConfig::default()
        }
    }

    fn ids(frame_id: u64, packet_id: u32) -> PacketIds {
        PacketIds {
            frame_id,
            packet_id,
            extended: false,
        }
    }

    /// A 100x49 Mono8 frame fits exactly 49 payload packets of 100 bytes.
    fn leader(frame_id: u64) -> Vec<u8> {
        encode_image_leader(
            ids(frame_id, 0),
            PayloadType::Image,
            0xAABB_CCDD,
            ImageInfos {
                pixel_format: pfnc::formats::MONO_8.raw(),
                width: 100,
                height: 49,
                x_offset: 0,
                y_offset: 0,
                x_padding: 0,
                y_padding: 0,
            },
        )
        .to_vec()
    }

    fn payload(frame_id: u64, packet_id: u32) -> Vec<u8> {
        let fill = vec![packet_id as u8; PACKET_SIZE];
        encode_payload(ids(frame_id, packet_id), &fill).to_vec()
    }

    fn trailer(frame_id: u64, packet_id: u32) -> Vec<u8> {
        encode_trailer(ids(frame_id, packet_id), PayloadType::Image, 49).to_vec()
    }

    struct Harness {
        engine: Reassembler,
        pool: Vec<Buffer>,
        now: Instant,
        stats: Arc<StreamStats>,
    }

    impl Harness {
        fn new(policy: ResendPolicy, n_buffers: usize) -> Self {
            let stats = Arc::new(StreamStats::default());
            Self {
                engine: Reassembler::new(config(policy), stats.clone()),
                pool: (0..n_buffers).map(|_| Buffer::new(49 * PACKET_SIZE)).collect(),
                now: Instant::now(),
                stats,
            }
        }

        fn feed(&mut self, datagram: &[u8]) -> Vec<Action> {
            let mut actions = Vec::new();
            let pool = &mut self.pool;
            let mut pop = || pool.pop();
            self.engine
                .handle_datagram(datagram, self.now, &mut pop, &mut actions);
            actions
        }

        fn delivered(actions: Vec<Action>) -> Vec<Buffer> {
            actions
                .into_iter()
                .filter_map(|action| match action {
                    Action::Deliver(buffer) => Some(buffer),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn complete_frame_is_delivered_in_order() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        assert!(harness.feed(&leader(3)).is_empty());
        for id in 1..=49 {
            assert!(harness.feed(&payload(3, id)).is_empty());
        }
        let delivered = Harness::delivered(harness.feed(&trailer(3, 50)));
        assert_eq!(delivered.len(), 1);
        let buffer = &delivered[0];
        assert_eq!(buffer.status(), BufferStatus::Success);
        assert_eq!(buffer.frame_id(), 3);
        assert_eq!(buffer.received_size(), 49 * PACKET_SIZE);
        assert_eq!(buffer.timestamp_ns(), 0xAABB_CCDD);
        assert_eq!(buffer.parts().len(), 1);
        assert_eq!(buffer.parts()[0].width, 100);
        // Payload bytes landed at their implied offsets.
        assert_eq!(buffer.data()[0], 1);
        assert_eq!(buffer.data()[17 * PACKET_SIZE], 18);
        let stats = harness.stats.snapshot();
        assert_eq!(stats.n_completed_buffers, 1);
        assert_eq!(stats.n_failures, 0);
        assert_eq!(stats.n_transferred_bytes, (49 * PACKET_SIZE) as u64);
    }

    #[test]
    fn missing_packet_without_resend_fails_frame() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(7));
        for id in (1..=49).filter(|&id| id != 17) {
            harness.feed(&payload(7, id));
        }
        let delivered = Harness::delivered(harness.feed(&trailer(7, 50)));
        assert_eq!(delivered.len(), 1);
        let buffer = &delivered[0];
        assert_eq!(buffer.status(), BufferStatus::MissingPackets);
        assert_eq!(buffer.frame_id(), 7);
        assert_eq!(buffer.received_size(), 48 * PACKET_SIZE);
        let stats = harness.stats.snapshot();
        assert_eq!(stats.n_failures, 1);
        assert_eq!(stats.n_missing_packets, 1);
        assert_eq!(stats.n_resent_packets, 0);
    }

    #[test]
    fn missing_packet_with_resend_recovers() {
        let mut harness = Harness::new(ResendPolicy::Always, 1);
        harness.feed(&leader(7));
        let mut resends = Vec::new();
        for id in (1..=49).filter(|&id| id != 17) {
            for action in harness.feed(&payload(7, id)) {
                if let Action::Resend { first, last, frame_id, .. } = action {
                    resends.push((frame_id, first, last));
                }
            }
        }
        // The gap was requested exactly once, when packet 18 arrived.
        assert_eq!(resends, vec![(7, 17, 17)]);
        // Trailer first, then the retransmitted packet arrives late.
        assert!(Harness::delivered(harness.feed(&trailer(7, 50))).is_empty());
        let delivered = Harness::delivered(harness.feed(&payload(7, 17)));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Success);
        assert_eq!(delivered[0].received_size(), 49 * PACKET_SIZE);
        let stats = harness.stats.snapshot();
        assert_eq!(stats.n_resent_packets, 1);
        assert_eq!(stats.n_completed_buffers, 1);
    }

    #[test]
    fn out_of_order_payloads_reassemble() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(9));
        let mut ids: Vec<u32> = (1..=49).collect();
        fastrand::seed(7);
        fastrand::shuffle(&mut ids);
        for id in ids {
            harness.feed(&payload(9, id));
        }
        let delivered = Harness::delivered(harness.feed(&trailer(9, 50)));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Success);
        assert_eq!(delivered[0].received_size(), 49 * PACKET_SIZE);
    }

    #[test]
    fn new_leader_closes_incomplete_frame() {
        let mut harness = Harness::new(ResendPolicy::Never, 2);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        let actions = harness.feed(&leader(2));
        let delivered = Harness::delivered(actions);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].frame_id(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::MissingPackets);
        // The new frame proceeds normally.
        for id in 1..=49 {
            harness.feed(&payload(2, id));
        }
        let delivered = Harness::delivered(harness.feed(&trailer(2, 50)));
        assert_eq!(delivered[0].frame_id(), 2);
        assert_eq!(delivered[0].status(), BufferStatus::Success);
    }

    #[test]
    fn underrun_discards_frame() {
        let mut harness = Harness::new(ResendPolicy::Never, 0);
        harness.feed(&leader(1));
        for id in 1..=49 {
            assert!(harness.feed(&payload(1, id)).is_empty());
        }
        assert!(harness.feed(&trailer(1, 50)).is_empty());
        assert_eq!(harness.stats.snapshot().n_underruns, 1);
    }

    #[test]
    fn resend_budget_caps_requests() {
        let mut harness = Harness::new(ResendPolicy::Always, 1);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        // Frame payload is 4900 bytes; the 0.25 ratio caps resends around
        // 1300 bytes, i.e. 13 packets. A 30-packet gap exceeds it.
        let actions = harness.feed(&payload(1, 32));
        assert!(actions
            .iter()
            .all(|action| !matches!(action, Action::Resend { .. })));
        // A small later gap still fits the remaining budget.
        let actions = harness.feed(&payload(1, 34));
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::Resend { first: 33, last: 33, .. })));
        let stats = harness.stats.snapshot();
        assert_eq!(stats.n_resent_packets, 1);
    }

    #[test]
    fn packet_timeout_finalises_after_grace() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        let mut actions = Vec::new();
        harness.engine.check_timeouts(
            harness.now + Duration::from_micros(50_000),
            &mut actions,
        );
        let delivered = Harness::delivered(actions);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Timeout);
    }

    #[test]
    fn timeout_with_resend_retries_before_failing() {
        let mut harness = Harness::new(ResendPolicy::Always, 1);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        harness.feed(&payload(1, 3));
        let mut actions = Vec::new();
        harness.engine.check_timeouts(
            harness.now + Duration::from_micros(50_000),
            &mut actions,
        );
        // First expiry re-requests the hole instead of failing.
        assert!(actions
            .iter()
            .any(|action| matches!(action, Action::Resend { first: 2, last: 2, .. })));
        assert!(Harness::delivered(actions).is_empty());
        let mut actions = Vec::new();
        harness.engine.check_timeouts(
            harness.now + Duration::from_micros(100_000),
            &mut actions,
        );
        let delivered = Harness::delivered(actions);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Timeout);
    }

    #[test]
    fn frame_retention_is_a_hard_ceiling() {
        let mut harness = Harness::new(ResendPolicy::Always, 1);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        let mut actions = Vec::new();
        harness.engine.check_timeouts(
            harness.now + Duration::from_micros(250_000),
            &mut actions,
        );
        let delivered = Harness::delivered(actions);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Timeout);
    }

    #[test]
    fn abort_returns_in_flight_buffer() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(1));
        harness.feed(&payload(1, 1));
        let mut actions = Vec::new();
        harness.engine.abort(&mut actions);
        let delivered = Harness::delivered(actions);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Aborted);
    }

    #[test]
    fn foreign_frame_packets_are_discarded() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(5));
        harness.feed(&payload(4, 1));
        harness.feed(&trailer(4, 50));
        // Frame 5 is still in flight and completes normally.
        for id in 1..=49 {
            harness.feed(&payload(5, id));
        }
        let delivered = Harness::delivered(harness.feed(&trailer(5, 50)));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::Success);
    }

    #[test]
    fn oversized_payload_is_a_size_mismatch() {
        let mut harness = Harness::new(ResendPolicy::Never, 1);
        harness.feed(&leader(1));
        let delivered = Harness::delivered(harness.feed(&payload(1, 50)));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].status(), BufferStatus::SizeMismatch);
    }

    #[tokio::test]
    async fn stream_task_reassembles_from_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = receiver.local_addr().expect("addr");
        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let mut stream = Stream::spawn(receiver, None, config(ResendPolicy::Never));
        stream.push_buffer(Buffer::new(49 * PACKET_SIZE));
        stream.push_buffer(Buffer::new(49 * PACKET_SIZE));

        sender.send_to(&leader(11), addr).await.expect("send");
        for id in 1..=49 {
            sender.send_to(&payload(11, id), addr).await.expect("send");
        }
        sender.send_to(&trailer(11, 50), addr).await.expect("send");

        let buffer = stream
            .pop_buffer_timeout(Duration::from_secs(2))
            .await
            .expect("buffer");
        assert_eq!(buffer.status(), BufferStatus::Success);
        assert_eq!(buffer.frame_id(), 11);
        assert_eq!(buffer.received_size(), 49 * PACKET_SIZE);

        stream.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_buffers_as_aborted() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let mut stream = Stream::spawn(receiver, None, config(ResendPolicy::Never));
        stream.push_buffer(Buffer::new(64));
        stream.stop.cancel();
        let buffer = stream
            .pop_buffer_timeout(Duration::from_secs(2))
            .await
            .expect("drained buffer");
        assert_eq!(buffer.status(), BufferStatus::Aborted);
    }
}
