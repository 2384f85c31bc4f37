//! # Session Controller
//!
//! One [`Session`] is the single-threaded heart of the protocol: it owns
//! the segment pool, the optional local sender, the receiver multiplexer,
//! the GRTT estimator and the rate controller, and it speaks to the
//! outside world through four calls:
//!
//! - [`Session::handle_datagram`] — feed one inbound UDP datagram
//! - [`Session::poll_transmit`] — pull the next outbound datagram
//! - [`Session::poll_timeout`] / [`Session::handle_timeout`] — drive time
//! - [`Session::poll_event`] — drain application-visible events
//!
//! All sockets, OS timers and threads live with the embedder; every call
//! takes the current `Instant` so behavior is deterministic under test.

use std::collections::{HashMap, VecDeque};

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::congestion::{CcEvent, CcMode, RateController};
use crate::grtt::{GrttEstimator, ProbingMode};
use crate::object::{NackingMode, TxCacheBounds};
use crate::pool::SegmentPool;
use crate::receiver::{
    Destination, Receiver, ReceiverConfig, ReceiverEvent, RepairBoundary, SyncPolicy,
};
use crate::sender::{AckingStatus, Sender, SenderConfig, SenderEmit, SenderEvent};
use crate::stats::{ReceiverStats, SenderStats, SessionStats};
use crate::stream::FlushMode;
use crate::wire::{
    quantize_backoff, quantize_gsize, CmdBody, Message, MessageBody, MsgHeader, NODE_ANY,
    NODE_NONE,
};

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Opaque reference to an object. Cheap to copy; lifetime is governed by
/// the session's retention counting (see [`Session::release_object`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    /// Originating node: [`NODE_NONE`] for locally enqueued objects.
    pub node_id: u32,
    pub object_id: u16,
}

impl ObjectHandle {
    fn local(object_id: u16) -> Self {
        ObjectHandle {
            node_id: NODE_NONE,
            object_id,
        }
    }

    fn remote(node_id: u32, object_id: u16) -> Self {
        ObjectHandle { node_id, object_id }
    }

    pub fn is_local(&self) -> bool {
        self.node_id == NODE_NONE
    }
}

/// Opaque reference to a remote sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u32);

// ─── Events ──────────────────────────────────────────────────────────────────

/// Application-visible events, drained via [`Session::poll_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TxQueueVacancy,
    TxQueueEmpty,
    TxFlushCompleted { object: ObjectHandle },
    TxWatermarkCompleted { object: ObjectHandle },
    TxObjectSent { object: ObjectHandle },
    TxObjectPurged { object: ObjectHandle },
    LocalSenderClosed,
    RemoteSenderNew { node: NodeHandle },
    RemoteSenderActive { node: NodeHandle },
    RemoteSenderInactive { node: NodeHandle },
    RemoteSenderPurged { node: NodeHandle },
    RxObjectNew { object: ObjectHandle },
    RxObjectInfo { object: ObjectHandle },
    RxObjectUpdated { object: ObjectHandle },
    RxObjectCompleted { object: ObjectHandle },
    RxObjectAborted { object: ObjectHandle },
    GrttUpdated { grtt: f64 },
    CcActive,
    CcInactive,
    RxAckRequest { object: ObjectHandle },
}

// ─── Outbound Datagram ───────────────────────────────────────────────────────

/// One UDP payload plus where to send it. The embedder maps
/// [`Destination::Sender`] to the address it last heard that node from.
#[derive(Debug)]
pub struct Datagram {
    pub payload: Bytes,
    pub dest: Destination,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Frozen at [`Session::new`]; later changes go through the named
/// setters, each documented with its effect timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_node_id: u32,
    pub segment_size: u16,
    /// Source segments per block (k).
    pub block_len: u8,
    /// Parity segments per block (n).
    pub parity_len: u8,
    /// Parity sent proactively per block.
    pub auto_parity: u8,
    /// Extra parity per repair round.
    pub extra_parity: u8,
    /// Initial transmit rate, bytes/second.
    pub tx_rate: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub backoff_factor: f64,
    pub tx_robust_factor: u32,
    pub rx_robust_factor: u32,
    pub grtt_initial: f64,
    pub grtt_min: f64,
    pub grtt_max: f64,
    pub probe_interval_min: f64,
    pub probe_interval_max: f64,
    pub probing_mode: ProbingMode,
    pub cc_mode: CcMode,
    /// Group size estimate advertised in headers.
    pub group_size: f64,
    pub tx_cache_bounds: TxCacheBounds,
    pub rx_max_senders: usize,
    pub rx_max_objects_per_sender: usize,
    pub unicast_nacks: bool,
    pub silent_receiver: bool,
    pub default_nacking_mode: NackingMode,
    pub repair_boundary: RepairBoundary,
    pub sync_policy: SyncPolicy,
    /// Segment pool capacity (buffers shared by both paths).
    pub pool_segments: usize,
    /// Receive-side stream ring size in bytes.
    pub rx_stream_buffer: usize,
    /// Bounded notification queue length.
    pub event_queue_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_node_id: 1,
            segment_size: 1400,
            block_len: 16,
            parity_len: 4,
            auto_parity: 0,
            extra_parity: 0,
            tx_rate: 64_000.0,
            rate_min: 0.0,
            rate_max: f64::INFINITY,
            backoff_factor: 4.0,
            tx_robust_factor: 20,
            rx_robust_factor: 20,
            grtt_initial: 0.5,
            grtt_min: 0.001,
            grtt_max: 10.0,
            probe_interval_min: 1.0,
            probe_interval_max: 30.0,
            probing_mode: ProbingMode::Active,
            cc_mode: CcMode::Fixed,
            group_size: 1000.0,
            tx_cache_bounds: TxCacheBounds::default(),
            rx_max_senders: 8,
            rx_max_objects_per_sender: 256,
            unicast_nacks: false,
            silent_receiver: false,
            default_nacking_mode: NackingMode::Normal,
            repair_boundary: RepairBoundary::Block,
            sync_policy: SyncPolicy::Current,
            pool_segments: 2048,
            rx_stream_buffer: 64 * 1024,
            event_queue_limit: 1024,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.local_node_id != NODE_NONE && self.local_node_id != NODE_ANY,
            "node id {} is reserved",
            self.local_node_id
        );
        ensure!(self.segment_size >= 64, "segment size too small");
        ensure!(self.block_len > 0, "block length must be non-zero");
        ensure!(
            self.block_len as usize + self.parity_len as usize <= crate::fec::MAX_BLOCK_SEGMENTS,
            "k + n exceeds {}",
            crate::fec::MAX_BLOCK_SEGMENTS
        );
        ensure!(self.auto_parity <= self.parity_len, "auto parity exceeds n");
        ensure!(self.tx_rate > 0.0, "rate must be positive");
        ensure!(self.grtt_min > 0.0 && self.grtt_min < self.grtt_max, "bad grtt bounds");
        ensure!(
            self.probe_interval_min > 0.0 && self.probe_interval_min <= self.probe_interval_max,
            "bad probe interval"
        );
        ensure!(self.pool_segments >= 2 * self.block_len as usize, "pool too small");
        Ok(())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    pool: SegmentPool,
    sender: Option<Sender>,
    receiver: Option<Receiver>,
    grtt: GrttEstimator,
    rate: RateController,
    rng: SmallRng,
    /// Outbound datagram sequence (loss-event detection at receivers).
    sequence: u16,
    /// Receiver-originated bodies waiting for transmission.
    rx_outbound: VecDeque<Datagram>,
    events: VecDeque<Event>,
    /// Retention counts for remote objects handed out via events.
    retained: HashMap<(u32, u16), i32>,
    /// Token bucket for rate pacing.
    tokens: f64,
    last_refill: Option<Instant>,
    stats: SessionStats,
}

impl Session {
    /// Validate configuration and build a stopped session. Fails fast on
    /// configuration errors.
    pub fn new(config: SessionConfig, now: Instant) -> Result<Self> {
        config.validate().context("session configuration")?;
        let pool = SegmentPool::new(config.pool_segments, config.segment_size as usize);
        let grtt = GrttEstimator::new(
            config.grtt_initial,
            config.grtt_min,
            config.grtt_max,
            config.probing_mode,
            config.probe_interval_min,
            config.probe_interval_max,
            now,
        );
        let rate = {
            let mut r = RateController::new(config.cc_mode, config.tx_rate, config.segment_size as usize);
            r.set_rate_bounds(config.rate_min, config.rate_max);
            r
        };
        let rng = SmallRng::seed_from_u64(config.local_node_id as u64 ^ 0x6E61_6372);
        Ok(Session {
            pool,
            grtt,
            rate,
            rng,
            sender: None,
            receiver: None,
            sequence: 0,
            rx_outbound: VecDeque::new(),
            events: VecDeque::new(),
            retained: HashMap::new(),
            tokens: 0.0,
            last_refill: None,
            stats: SessionStats::default(),
            config,
        })
    }

    pub fn local_node_id(&self) -> u32 {
        self.config.local_node_id
    }

    pub fn session_stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn sender_stats(&self) -> Option<&SenderStats> {
        self.sender.as_ref().map(Sender::stats)
    }

    pub fn receiver_stats(&self) -> Option<&ReceiverStats> {
        self.receiver.as_ref().map(Receiver::stats)
    }

    pub fn grtt_estimate(&self) -> f64 {
        self.grtt.estimate()
    }

    pub fn tx_rate(&self) -> f64 {
        self.rate.rate()
    }

    // ─── Start / Stop ───────────────────────────────────────────────────

    /// Begin sending with a fresh instance id.
    pub fn start_sender(&mut self, instance_id: u16) -> Result<()> {
        if self.sender.is_some() {
            bail!("sender already started");
        }
        let sender = Sender::new(
            SenderConfig {
                instance_id,
                segment_size: self.config.segment_size,
                block_len: self.config.block_len,
                parity_len: self.config.parity_len,
                auto_parity: self.config.auto_parity,
                extra_parity: self.config.extra_parity,
                robust_factor: self.config.tx_robust_factor,
                cache_bounds: self.config.tx_cache_bounds,
                advertise_repairs: self.config.unicast_nacks,
            },
            &self.pool,
        )?;
        self.sender = Some(sender);
        debug!(instance_id, "sender started");
        Ok(())
    }

    pub fn stop_sender(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.close(&mut self.pool);
            self.push_event(Event::LocalSenderClosed);
        }
    }

    /// Begin receiving.
    pub fn start_receiver(&mut self) -> Result<()> {
        if self.receiver.is_some() {
            bail!("receiver already started");
        }
        let receiver = Receiver::new(
            ReceiverConfig {
                local_node_id: self.config.local_node_id,
                max_senders: self.config.rx_max_senders,
                max_objects_per_sender: self.config.rx_max_objects_per_sender,
                rx_robust_factor: self.config.rx_robust_factor,
                sync_policy: self.config.sync_policy,
                repair_boundary: self.config.repair_boundary,
                default_nacking_mode: self.config.default_nacking_mode,
                unicast_nacks: self.config.unicast_nacks,
                silent: self.config.silent_receiver,
                cc_mode: self.config.cc_mode,
                stream_buffer_size: self.config.rx_stream_buffer,
            },
            &self.pool,
        )?;
        self.receiver = Some(receiver);
        debug!("receiver started");
        Ok(())
    }

    pub fn stop_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close(&mut self.pool);
        }
    }

    // ─── Sender API ─────────────────────────────────────────────────────

    fn sender_mut(&mut self) -> Result<&mut Sender> {
        self.sender.as_mut().context("sender not started")
    }

    pub fn enqueue_data(&mut self, data: Bytes, info: Option<Bytes>) -> Result<ObjectHandle> {
        let sender = self.sender.as_mut().context("sender not started")?;
        let id = sender.enqueue_data(data, info, &mut self.pool)?;
        self.drain_sender_events();
        Ok(ObjectHandle::local(id))
    }

    pub fn enqueue_file(
        &mut self,
        path: &std::path::Path,
        info: Option<Bytes>,
    ) -> Result<ObjectHandle> {
        let sender = self.sender.as_mut().context("sender not started")?;
        let id = sender.enqueue_file(path, info, &mut self.pool)?;
        self.drain_sender_events();
        Ok(ObjectHandle::local(id))
    }

    pub fn open_stream(&mut self, buffer_size: usize, info: Option<Bytes>) -> Result<ObjectHandle> {
        let sender = self.sender.as_mut().context("sender not started")?;
        let id = sender.open_stream(buffer_size, info, &mut self.pool)?;
        self.drain_sender_events();
        Ok(ObjectHandle::local(id))
    }

    /// Stream write; returns bytes accepted (0 when the ring is full of
    /// unsent data and push mode is off).
    pub fn stream_write(&mut self, handle: ObjectHandle, bytes: &[u8]) -> Result<usize> {
        ensure!(handle.is_local(), "not a transmit stream");
        self.sender_mut()?.stream_write(handle.object_id, bytes)
    }

    pub fn stream_flush(&mut self, handle: ObjectHandle, eom: bool, mode: FlushMode) -> Result<()> {
        ensure!(handle.is_local(), "not a transmit stream");
        self.sender_mut()?.stream_flush(handle.object_id, eom, mode)
    }

    pub fn stream_set_push_mode(&mut self, handle: ObjectHandle, enabled: bool) -> Result<()> {
        self.sender_mut()?.stream_set_push_mode(handle.object_id, enabled)
    }

    pub fn stream_set_auto_flush(&mut self, handle: ObjectHandle, mode: FlushMode) -> Result<()> {
        self.sender_mut()?.stream_set_auto_flush(handle.object_id, mode)
    }

    pub fn stream_has_vacancy(&mut self, handle: ObjectHandle) -> Result<bool> {
        self.sender_mut()?.stream_has_vacancy(handle.object_id)
    }

    pub fn stream_mark_eom(&mut self, handle: ObjectHandle) -> Result<()> {
        self.sender_mut()?.stream_mark_eom(handle.object_id)
    }

    /// Retransmit a cached object under its original id.
    pub fn requeue(&mut self, handle: ObjectHandle) -> Result<()> {
        ensure!(handle.is_local(), "only transmit objects requeue");
        self.sender_mut()?.requeue(handle.object_id)
    }

    pub fn add_acking_node(&mut self, node_id: u32) -> Result<()> {
        ensure!(node_id != NODE_NONE && node_id != NODE_ANY, "reserved node id");
        self.sender_mut()?.add_acking_node(node_id);
        Ok(())
    }

    pub fn remove_acking_node(&mut self, node_id: u32) -> Result<()> {
        self.sender_mut()?.remove_acking_node(node_id);
        Ok(())
    }

    pub fn acking_status(&self, node_id: u32) -> AckingStatus {
        self.sender
            .as_ref()
            .map_or(AckingStatus::Invalid, |s| s.acking_status(node_id))
    }

    /// Demand positive acknowledgment of `(object, block, segment)` from
    /// the acking-node list. Replaces any prior watermark. Effective
    /// immediately.
    pub fn set_watermark(
        &mut self,
        handle: ObjectHandle,
        block_id: u32,
        segment_id: u8,
        override_flush: bool,
        now: Instant,
    ) -> Result<()> {
        ensure!(handle.is_local(), "watermark targets a transmit object");
        self.sender_mut()?
            .set_watermark(handle.object_id, block_id, segment_id, override_flush, now)
    }

    pub fn cancel_watermark(&mut self) -> Result<()> {
        self.sender_mut()?.cancel_watermark();
        Ok(())
    }

    /// Remove an object from either side; no further events fire for it.
    pub fn cancel(&mut self, handle: ObjectHandle) {
        if handle.is_local() {
            if let Some(sender) = self.sender.as_mut() {
                sender.cancel(handle.object_id, &mut self.pool);
            }
        } else if let Some(receiver) = self.receiver.as_mut() {
            receiver.release_object(handle.node_id, handle.object_id, &mut self.pool);
            self.retained.remove(&(handle.node_id, handle.object_id));
        }
        self.events.retain(|e| event_handle(e) != Some(handle));
    }

    // ─── Live Tuning ────────────────────────────────────────────────────

    /// Manual rate; authoritative in Fixed mode, a hint otherwise.
    /// Effective immediately.
    pub fn set_tx_rate(&mut self, rate: f64) {
        self.rate.set_rate(rate);
    }

    /// Effective immediately; the current rate is re-clamped.
    pub fn set_rate_bounds(&mut self, min: f64, max: f64) {
        self.rate.set_rate_bounds(min, max);
    }

    /// Effective immediately.
    pub fn set_grtt_estimate(&mut self, grtt: f64) {
        self.grtt.set_estimate(grtt);
    }

    /// Effective immediately.
    pub fn set_grtt_max(&mut self, grtt_max: f64) {
        self.grtt.set_max(grtt_max);
    }

    /// Effective at the next probe opportunity.
    pub fn set_grtt_probing_mode(&mut self, mode: ProbingMode) {
        self.grtt.set_probing_mode(mode);
    }

    /// Effective at the next probe scheduling.
    pub fn set_grtt_probing_interval(&mut self, min: f64, max: f64) {
        self.grtt.set_interval(min, max);
    }

    /// Effective for timers armed after the call.
    pub fn set_backoff_factor(&mut self, backoff: f64) {
        self.config.backoff_factor = backoff.max(0.0);
    }

    /// Effective in headers sent after the call.
    pub fn set_group_size(&mut self, group_size: f64) {
        self.config.group_size = group_size.max(1.0);
    }

    /// Effective at the next enqueue/eviction.
    pub fn set_tx_cache_bounds(&mut self, bounds: TxCacheBounds) -> Result<()> {
        self.sender_mut()?.set_cache_bounds(bounds);
        Ok(())
    }

    // ─── Receiver API ───────────────────────────────────────────────────

    /// Completed DATA object payload (also FILE objects still on the
    /// default in-memory backing are read back this way via events).
    pub fn object_payload(&self, handle: ObjectHandle) -> Option<Bytes> {
        let receiver = self.receiver.as_ref()?;
        receiver
            .sender(handle.node_id)?
            .object(handle.object_id)?
            .payload()
    }

    pub fn object_info(&self, handle: ObjectHandle) -> Option<Bytes> {
        let receiver = self.receiver.as_ref()?;
        receiver
            .sender(handle.node_id)?
            .object(handle.object_id)?
            .info
            .clone()
    }

    pub fn stream_read(&mut self, handle: ObjectHandle, buf: &mut [u8]) -> Option<usize> {
        self.receiver
            .as_mut()?
            .stream_read(handle.node_id, handle.object_id, buf)
    }

    /// Advance a receive stream to the next message boundary.
    pub fn stream_seek_msg_start(&mut self, handle: ObjectHandle) -> Option<bool> {
        self.receiver
            .as_mut()?
            .stream_seek_msg_start(handle.node_id, handle.object_id)
    }

    pub fn set_nacking_mode(&mut self, node: NodeHandle, mode: NackingMode) {
        if let Some(receiver) = self.receiver.as_mut() {
            if let Some(sender) = receiver.sender_mut(node.0) {
                sender.nacking_mode = mode;
            }
        }
    }

    pub fn set_object_nacking_mode(&mut self, handle: ObjectHandle, mode: NackingMode) {
        if let Some(receiver) = self.receiver.as_mut() {
            if let Some(sender) = receiver.sender_mut(handle.node_id) {
                if let Some(obj) = sender.object_mut(handle.object_id) {
                    obj.nacking_mode = mode;
                }
            }
        }
    }

    /// Applies to remote senders observed after the call.
    pub fn set_default_nacking_mode(&mut self, mode: NackingMode) {
        self.config.default_nacking_mode = mode;
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.set_default_nacking_mode(mode);
        }
    }

    /// Applies to remote senders observed after the call.
    pub fn set_default_repair_boundary(&mut self, boundary: RepairBoundary) {
        self.config.repair_boundary = boundary;
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.set_default_repair_boundary(boundary);
        }
    }

    /// Embedder-reported ECN mark on traffic from a remote sender
    /// (meaningful in Cce mode).
    pub fn handle_ecn(&mut self, node: NodeHandle, now: Instant) {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.handle_ecn(node.0, now);
        }
    }

    /// Redirect a received file object onto real storage. Call on
    /// RX_OBJECT_NEW, before data lands.
    pub fn attach_rx_file_backing(
        &mut self,
        handle: ObjectHandle,
        backing: Box<dyn crate::object::FileBacking>,
    ) -> Result<()> {
        let receiver = self.receiver.as_mut().context("receiver not started")?;
        receiver
            .sender_mut(handle.node_id)
            .context("unknown remote sender")?
            .object_mut(handle.object_id)
            .context("unknown object")?
            .attach_file_backing(backing)
    }

    pub fn set_node_unicast_nacks(&mut self, node: NodeHandle, unicast: bool) {
        if let Some(receiver) = self.receiver.as_mut() {
            if let Some(sender) = receiver.sender_mut(node.0) {
                sender.unicast_nacks = unicast;
            }
        }
    }

    pub fn node_grtt(&self, node: NodeHandle) -> Option<f64> {
        Some(self.receiver.as_ref()?.sender(node.0)?.grtt())
    }

    // ─── Retention ──────────────────────────────────────────────────────

    /// Extra hold on a remote object beyond the event-implied one.
    pub fn retain_object(&mut self, handle: ObjectHandle) {
        if !handle.is_local() {
            *self
                .retained
                .entry((handle.node_id, handle.object_id))
                .or_insert(0) += 1;
        }
    }

    /// Release one hold. When the count reaches zero and the engine is
    /// done with the object (completed or aborted), its buffers are
    /// freed.
    pub fn release_object(&mut self, handle: ObjectHandle) {
        if handle.is_local() {
            return;
        }
        let key = (handle.node_id, handle.object_id);
        let Some(count) = self.retained.get_mut(&key) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.retained.remove(&key);
        let done = self
            .receiver
            .as_ref()
            .and_then(|r| r.sender(handle.node_id))
            .and_then(|s| s.object(handle.object_id))
            .map(|o| o.completed || o.aborted);
        if done == Some(true) {
            if let Some(receiver) = self.receiver.as_mut() {
                receiver.release_object(handle.node_id, handle.object_id, &mut self.pool);
            }
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Feed one inbound UDP datagram. Malformed input is counted and
    /// dropped, never fatal.
    pub fn handle_datagram(&mut self, raw: Bytes, now: Instant) {
        self.stats.datagrams_in += 1;
        let Some(msg) = Message::decode(raw) else {
            self.stats.malformed_dropped += 1;
            trace!("malformed datagram dropped");
            return;
        };
        if msg.header.source_id == self.config.local_node_id {
            return; // multicast loopback of our own traffic
        }
        match &msg.body {
            MessageBody::Nack(nack) => {
                if nack.sender_id == self.config.local_node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        sender.handle_nack(
                            nack,
                            now,
                            self.grtt.estimate(),
                            (self.config.grtt_min, self.config.grtt_max),
                            self.config.backoff_factor,
                        );
                    }
                } else if let Some(receiver) = self.receiver.as_mut() {
                    // Someone else's NACK: suppression input.
                    receiver.handle_message(&msg, now, &mut self.pool, &mut self.rng);
                }
            }
            MessageBody::Ack(ack) => {
                if ack.sender_id == self.config.local_node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        sender.handle_ack(msg.header.source_id, ack);
                    }
                }
            }
            MessageBody::Cmd(CmdBody::CcReport(report)) if self.sender.is_some() => {
                // A receiver reporting to us.
                if let Some(rtt) = self.grtt.handle_report(report, now) {
                    for ev in
                        self.rate
                            .on_report(msg.header.source_id, report.loss_rate(), rtt, now)
                    {
                        self.push_cc_event(ev);
                    }
                }
            }
            _ => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.handle_message(&msg, now, &mut self.pool, &mut self.rng);
                }
            }
        }
        self.collect_events();
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    fn next_header(&mut self) -> MsgHeader {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        MsgHeader {
            sequence,
            source_id: self.config.local_node_id,
            instance_id: self.sender.as_ref().map_or(0, Sender::instance_id),
            grtt: self.grtt.quantized(),
            backoff: quantize_backoff(self.config.backoff_factor),
            gsize: quantize_gsize(self.config.group_size),
        }
    }

    fn wrap(&mut self, body: MessageBody, dest: Destination) -> Datagram {
        let msg = Message {
            header: self.next_header(),
            body,
        };
        self.stats.datagrams_out += 1;
        Datagram {
            payload: msg.encode().freeze(),
            dest,
        }
    }

    /// Pull the next outbound datagram, honoring the rate budget for
    /// data-bearing traffic. Returns `None` when nothing is due — check
    /// again after [`Session::poll_timeout`].
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Datagram> {
        // Receiver feedback (NACK/ACK/CC reports) is sparse and goes out
        // unpaced.
        let emits = self
            .receiver
            .as_mut()
            .map(Receiver::drain_emits)
            .unwrap_or_default();
        for emit in emits {
            let dg = self.wrap(emit.body, emit.dest);
            self.rx_outbound.push_back(dg);
        }
        if let Some(dg) = self.rx_outbound.pop_front() {
            return Some(dg);
        }

        self.sender.as_ref()?;

        // Everything the sender originates rides the token bucket, in
        // strict priority: repair/watermark/flush, then the GRTT probe,
        // then fresh data. Probes are tiny and never blocked, only
        // debited.
        let grtt = self.grtt.estimate();
        let bounds = (self.config.grtt_min, self.config.grtt_max);
        let backoff = self.config.backoff_factor;
        let budget = self.refill_and_check(now);

        if budget {
            let body = {
                let sender = self.sender.as_mut().expect("checked above");
                sender.poll_control(now, grtt, bounds, backoff, &mut self.pool, &mut self.rng)
            };
            if let Some(emit) = body {
                self.debit(&emit);
                let dg = self.emit_to_datagram(emit);
                self.collect_events();
                return Some(dg);
            }
        }

        if let Some(probe) = self.grtt.poll_probe(now, &mut self.rng) {
            if self.grtt.take_quantized_change() {
                let grtt = self.grtt.estimate();
                self.push_event(Event::GrttUpdated { grtt });
            }
            let sender = self.sender.as_mut().expect("checked above");
            sender.stats_probe_sent();
            self.tokens -= 48.0;
            let dg = self.wrap(MessageBody::Cmd(CmdBody::CcProbe(probe)), Destination::Group);
            return Some(dg);
        }

        if !budget {
            return None;
        }
        let body = {
            let sender = self.sender.as_mut().expect("checked above");
            sender.poll_data(&mut self.pool)
        };
        let emit = body?;
        self.debit(&emit);
        let dg = self.emit_to_datagram(emit);
        self.collect_events();
        Some(dg)
    }

    fn emit_to_datagram(&mut self, emit: SenderEmit) -> Datagram {
        let body = match emit {
            SenderEmit::Data(d) => MessageBody::Data(d),
            SenderEmit::Info(i) => MessageBody::Info(i),
            SenderEmit::Cmd(c) => MessageBody::Cmd(c),
        };
        self.wrap(body, Destination::Group)
    }

    /// Accrue tokens; true when at least half a segment's worth is
    /// banked. The burst cap is one segment, widening to 10 ms worth of
    /// rate when the configured rate outruns segment granularity.
    fn refill_and_check(&mut self, now: Instant) -> bool {
        let segment = self.config.segment_size as f64 + 64.0;
        let cap = (self.rate.rate() * 0.010).max(segment);
        match self.last_refill {
            None => {
                self.tokens = cap;
            }
            Some(last) => {
                let dt = now.duration_since(last).as_secs_f64();
                self.tokens = (self.tokens + dt * self.rate.rate()).min(cap);
            }
        }
        self.last_refill = Some(now);
        self.tokens >= self.config.segment_size as f64 * 0.5
    }

    fn debit(&mut self, emit: &SenderEmit) {
        let size = match emit {
            SenderEmit::Data(d) => d.payload.len() + 32,
            SenderEmit::Info(i) => i.payload.len() + 32,
            SenderEmit::Cmd(_) => 32,
        };
        self.tokens -= size as f64;
    }

    /// When the bucket will next allow a segment.
    fn next_refill_time(&self, now: Instant) -> Option<Instant> {
        let sender = self.sender.as_ref()?;
        if !sender.has_work() {
            return None;
        }
        let need = self.config.segment_size as f64 * 0.5 - self.tokens;
        if need <= 0.0 {
            return Some(now);
        }
        let rate = self.rate.rate().max(1.0);
        Some(now + std::time::Duration::from_secs_f64(need / rate))
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Earliest instant at which [`Session::handle_timeout`] (or another
    /// [`Session::poll_transmit`]) should run.
    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(next.map_or(t, |n: Instant| n.min(t)));
            }
        };
        if let Some(sender) = &self.sender {
            fold(sender.next_timeout());
            fold(self.grtt.next_timeout());
            fold(self.next_refill_time(now));
        }
        if let Some(receiver) = &self.receiver {
            fold(receiver.next_timeout());
            // Inactivity sweeps ride a coarse tick.
            fold(Some(now + std::time::Duration::from_secs(1)));
        }
        next
    }

    /// Advance all expired timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.handle_timeout(now, &mut self.pool, &mut self.rng);
        }
        if self.sender.is_some() {
            for ev in self.rate.check_clr_timeout(now) {
                self.push_cc_event(ev);
            }
        }
        self.collect_events();
    }

    // ─── Events ─────────────────────────────────────────────────────────

    /// Next application event, if any.
    ///
    /// Dequeuing an event that names a remote object takes a retention
    /// hold on it; the application must pair it with
    /// [`Session::release_object`].
    pub fn poll_event(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        if let Some(handle) = event_handle(&event) {
            if !handle.is_local() {
                *self
                    .retained
                    .entry((handle.node_id, handle.object_id))
                    .or_insert(0) += 1;
            }
        }
        Some(event)
    }

    fn push_event(&mut self, event: Event) {
        // Collapse runs of updates for the same object.
        if let Event::RxObjectUpdated { object } = event {
            let dup = self
                .events
                .iter()
                .any(|e| matches!(e, Event::RxObjectUpdated { object: o } if *o == object));
            if dup {
                return;
            }
        }
        if self.events.len() >= self.config.event_queue_limit {
            // Drop the oldest coalescable notification first.
            if let Some(pos) = self
                .events
                .iter()
                .position(|e| matches!(e, Event::RxObjectUpdated { .. }))
            {
                self.events.remove(pos);
            } else {
                warn!("event queue overflow, dropping oldest");
                self.events.pop_front();
            }
        }
        self.events.push_back(event);
    }

    fn push_cc_event(&mut self, ev: CcEvent) {
        match ev {
            CcEvent::Activated => self.push_event(Event::CcActive),
            CcEvent::Deactivated => self.push_event(Event::CcInactive),
            CcEvent::RateChanged => {}
        }
    }

    fn drain_sender_events(&mut self) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        for ev in sender.drain_events() {
            let event = match ev {
                SenderEvent::QueueVacancy => Event::TxQueueVacancy,
                SenderEvent::QueueEmpty => Event::TxQueueEmpty,
                SenderEvent::FlushCompleted { object_id } => Event::TxFlushCompleted {
                    object: ObjectHandle::local(object_id),
                },
                SenderEvent::WatermarkCompleted { object_id } => Event::TxWatermarkCompleted {
                    object: ObjectHandle::local(object_id),
                },
                SenderEvent::ObjectSent { object_id } => Event::TxObjectSent {
                    object: ObjectHandle::local(object_id),
                },
                SenderEvent::ObjectPurged { object_id } => Event::TxObjectPurged {
                    object: ObjectHandle::local(object_id),
                },
            };
            self.push_event(event);
        }
    }

    fn drain_receiver_events(&mut self) {
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        for ev in receiver.drain_events() {
            let event = match ev {
                ReceiverEvent::RemoteSenderNew { node_id } => Event::RemoteSenderNew {
                    node: NodeHandle(node_id),
                },
                ReceiverEvent::RemoteSenderActive { node_id } => Event::RemoteSenderActive {
                    node: NodeHandle(node_id),
                },
                ReceiverEvent::RemoteSenderInactive { node_id } => Event::RemoteSenderInactive {
                    node: NodeHandle(node_id),
                },
                ReceiverEvent::RemoteSenderPurged { node_id } => Event::RemoteSenderPurged {
                    node: NodeHandle(node_id),
                },
                ReceiverEvent::ObjectNew { node_id, object_id } => Event::RxObjectNew {
                    object: ObjectHandle::remote(node_id, object_id),
                },
                ReceiverEvent::ObjectInfo { node_id, object_id } => Event::RxObjectInfo {
                    object: ObjectHandle::remote(node_id, object_id),
                },
                ReceiverEvent::ObjectUpdated { node_id, object_id } => Event::RxObjectUpdated {
                    object: ObjectHandle::remote(node_id, object_id),
                },
                ReceiverEvent::ObjectCompleted { node_id, object_id } => Event::RxObjectCompleted {
                    object: ObjectHandle::remote(node_id, object_id),
                },
                ReceiverEvent::ObjectAborted { node_id, object_id } => Event::RxObjectAborted {
                    object: ObjectHandle::remote(node_id, object_id),
                },
                ReceiverEvent::AckRequested { node_id, object_id } => Event::RxAckRequest {
                    object: ObjectHandle::remote(node_id, object_id),
                },
            };
            self.push_event(event);
        }
    }

    fn collect_events(&mut self) {
        self.drain_sender_events();
        self.drain_receiver_events();
    }
}

/// The object handle an event refers to, if any.
fn event_handle(event: &Event) -> Option<ObjectHandle> {
    match event {
        Event::TxFlushCompleted { object }
        | Event::TxWatermarkCompleted { object }
        | Event::TxObjectSent { object }
        | Event::TxObjectPurged { object }
        | Event::RxObjectNew { object }
        | Event::RxObjectInfo { object }
        | Event::RxObjectUpdated { object }
        | Event::RxObjectCompleted { object }
        | Event::RxObjectAborted { object }
        | Event::RxAckRequest { object } => Some(*object),
        _ => None,
    }
}
