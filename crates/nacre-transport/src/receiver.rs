//! # Receiver Pipeline
//!
//! Per-remote-sender reception state: object reassembly, the NACK state
//! machine, feedback suppression, and probe echoes. One [`Receiver`]
//! serves a session and multiplexes any number of remote senders, keyed
//! by `(node_id, instance_id)` — an instance change means the sender
//! restarted and all prior state is discarded.
//!
//! ## NACK state machine (per remote sender)
//!
//! ```text
//!   Idle ──loss──▶ Backoff ──timer──▶ Holdoff ──timer──▶ Idle
//!     ▲               │ overheard NACK     │ new loss extending
//!     │               ▼ covers ours        ▼ repair content
//!     └───────────── Idle            extended NACK, restart holdoff
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::RngExt;
use tracing::{debug, trace, warn};

use crate::congestion::{CcMode, LossEstimator};
use crate::fec::BlockCodec;
use crate::grtt::scaled_backoff;
use crate::object::{
    object_id_delta, object_id_lt, NackingMode, ObjectKind, ObjectLayout, RxObject,
    RxStoreOutcome,
};
use crate::pool::SegmentPool;
use crate::stats::ReceiverStats;
use crate::wire::{
    flags, unquantize_backoff, unquantize_grtt, AckMsg, AckType, CcProbeCmd, CcReportCmd, CmdBody,
    DataMsg, InfoMsg, Message, MessageBody, MsgHeader, NackMsg, RepairRequest,
};

// ─── Policies ────────────────────────────────────────────────────────────────

/// How a receiver joins an in-progress session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Accept objects from the first one heard onward.
    #[default]
    Current,
    /// Also accept older objects still within the window.
    All,
    /// For streams, join only at a stream start marker.
    Stream,
}

/// What advancing reception squelches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairBoundary {
    /// Completing a block silences NACKs for earlier blocks of the object.
    #[default]
    Block,
    /// Completing an object silences NACKs for earlier objects.
    Object,
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub local_node_id: u32,
    /// Remote-sender states retained at most.
    pub max_senders: usize,
    /// Pending objects per remote sender at most.
    pub max_objects_per_sender: usize,
    /// Inactivity scaling (timeout = factor × multiplier × GRTT).
    pub rx_robust_factor: u32,
    pub sync_policy: SyncPolicy,
    pub repair_boundary: RepairBoundary,
    pub default_nacking_mode: NackingMode,
    /// NACK to the sender alone instead of the group.
    pub unicast_nacks: bool,
    /// Emit nothing at all (no NACK, no ACK, no CC reports).
    pub silent: bool,
    pub cc_mode: CcMode,
    /// Receive-side stream ring size in bytes.
    pub stream_buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            local_node_id: 0,
            max_senders: 8,
            max_objects_per_sender: 256,
            rx_robust_factor: 20,
            sync_policy: SyncPolicy::Current,
            repair_boundary: RepairBoundary::Block,
            default_nacking_mode: NackingMode::Normal,
            unicast_nacks: false,
            silent: false,
            cc_mode: CcMode::Fixed,
            stream_buffer_size: 64 * 1024,
        }
    }
}

/// Inactivity timeout = rx_robust_factor × this × GRTT.
const INACTIVITY_GRTT_MULTIPLIER: f64 = 5.0;

// ─── Events & Emits ──────────────────────────────────────────────────────────

/// Receiver-side happenings the session surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    RemoteSenderNew { node_id: u32 },
    RemoteSenderActive { node_id: u32 },
    RemoteSenderInactive { node_id: u32 },
    RemoteSenderPurged { node_id: u32 },
    ObjectNew { node_id: u32, object_id: u16 },
    ObjectInfo { node_id: u32, object_id: u16 },
    ObjectUpdated { node_id: u32, object_id: u16 },
    ObjectCompleted { node_id: u32, object_id: u16 },
    ObjectAborted { node_id: u32, object_id: u16 },
    AckRequested { node_id: u32, object_id: u16 },
}

/// Where an outbound receiver message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The session (multicast) address.
    Group,
    /// Unicast to the given remote sender.
    Sender(u32),
}

/// An outbound message body the session wraps and transmits.
#[derive(Debug)]
pub struct ReceiverEmit {
    pub dest: Destination,
    pub body: MessageBody,
}

// ─── NACK State ──────────────────────────────────────────────────────────────

enum NackState {
    Idle,
    Backoff { fire_at: Instant },
    Holdoff { until: Instant, content: Vec<RepairRequest> },
}

// ─── Receive Rate Meter ──────────────────────────────────────────────────────

struct RateMeter {
    window_start: Instant,
    bytes: u64,
    rate: f64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        RateMeter {
            window_start: now,
            bytes: 0,
            rate: 0.0,
        }
    }

    fn add(&mut self, bytes: usize, now: Instant) {
        self.bytes += bytes as u64;
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed >= 1.0 {
            self.rate = self.bytes as f64 / elapsed;
            self.window_start = now;
            self.bytes = 0;
        }
    }

    fn rate(&self) -> f64 {
        self.rate
    }
}

// ─── Remote Sender ───────────────────────────────────────────────────────────

/// Reception state for one `(node_id, instance_id)`.
pub struct RemoteSender {
    pub node_id: u32,
    pub instance_id: u16,
    /// Sender timing state, learned from every header.
    grtt: f64,
    backoff: f64,
    objects: HashMap<u16, RxObject>,
    sync_point: Option<u16>,
    /// Next object id whose completion is due to the application.
    deliver_cursor: Option<u16>,
    max_heard: Option<u16>,
    /// Highest completed object (Object repair boundary floor).
    max_completed: Option<u16>,
    /// Repair below this id is unavailable (sender squelch).
    squelch_floor: Option<u16>,
    nack: NackState,
    /// Other receivers' requests overheard while backing off.
    overheard: Vec<RepairRequest>,
    loss: LossEstimator,
    meter: RateMeter,
    pub last_activity: Instant,
    inactive: bool,
    /// Per-sender overrides.
    pub nacking_mode: NackingMode,
    pub unicast_nacks: bool,
    pub repair_boundary: RepairBoundary,
    /// Stream-sync gate: drop stream data until a stream start is seen.
    stream_synced: bool,
}

impl RemoteSender {
    fn new(node_id: u32, instance_id: u16, config: &ReceiverConfig, now: Instant) -> Self {
        RemoteSender {
            node_id,
            instance_id,
            grtt: 0.5,
            backoff: 4.0,
            objects: HashMap::new(),
            sync_point: None,
            deliver_cursor: None,
            max_heard: None,
            max_completed: None,
            squelch_floor: None,
            nack: NackState::Idle,
            overheard: Vec::new(),
            loss: LossEstimator::new(config.cc_mode),
            meter: RateMeter::new(now),
            last_activity: now,
            inactive: false,
            nacking_mode: config.default_nacking_mode,
            unicast_nacks: config.unicast_nacks,
            repair_boundary: config.repair_boundary,
            stream_synced: config.sync_policy != SyncPolicy::Stream,
        }
    }

    pub fn grtt(&self) -> f64 {
        self.grtt
    }

    pub fn object(&self, object_id: u16) -> Option<&RxObject> {
        self.objects.get(&object_id)
    }

    pub fn object_mut(&mut self, object_id: u16) -> Option<&mut RxObject> {
        self.objects.get_mut(&object_id)
    }

    fn absorb_header(&mut self, header: &MsgHeader, now: Instant) {
        self.grtt = unquantize_grtt(header.grtt);
        self.backoff = unquantize_backoff(header.backoff).max(1.0);
        self.loss.on_sequence(header.sequence, now, self.grtt);
        self.last_activity = now;
    }

    /// Everything this sender's reception still needs, in object order.
    fn build_nack_content(&self) -> Vec<RepairRequest> {
        let (Some(cursor), Some(max_heard)) = (self.deliver_cursor, self.max_heard) else {
            return Vec::new();
        };
        let floor = match self.squelch_floor {
            Some(sq) if object_id_lt(cursor, sq) => sq,
            _ => cursor,
        };
        let object_floor = match self.repair_boundary {
            RepairBoundary::Object => match self.max_completed {
                Some(mc) if !object_id_lt(mc, floor) => mc.wrapping_add(1),
                _ => floor,
            },
            RepairBoundary::Block => floor,
        };

        let mut content = Vec::new();
        let mut id = object_floor;
        loop {
            match self.objects.get(&id) {
                Some(obj) if !obj.completed && !obj.aborted => {
                    let block_floor = match self.repair_boundary {
                        RepairBoundary::Block => obj.max_completed_block,
                        RepairBoundary::Object => None,
                    };
                    content.extend(obj.repair_needs(block_floor));
                }
                Some(_) => {}
                None => {
                    // Heard nothing at all of this id, but later ids exist.
                    if object_id_lt(id, max_heard) && self.nacking_mode == NackingMode::Normal {
                        content.push(RepairRequest::Object { object_id: id });
                    }
                }
            }
            if id == max_heard {
                break;
            }
            id = id.wrapping_add(1);
            if object_id_delta(max_heard, id) < 0 {
                break;
            }
        }
        content
    }
}

// ─── Coverage (feedback suppression) ────────────────────────────────────────

/// Whether `needs` is entirely covered by `heard` (another receiver's
/// request list).
fn requests_cover(heard: &[RepairRequest], needs: &[RepairRequest]) -> bool {
    needs.iter().all(|need| {
        heard.iter().any(|h| match (h, need) {
            (RepairRequest::Object { object_id: a }, n) => *a == n.object_id(),
            (RepairRequest::Info { object_id: a }, RepairRequest::Info { object_id: b }) => a == b,
            (
                RepairRequest::Blocks {
                    object_id: a,
                    start: hs,
                    count: hc,
                },
                RepairRequest::Blocks {
                    object_id: b,
                    start: ns,
                    count: nc,
                },
            ) => a == b && hs <= ns && ns + nc <= hs + hc,
            (
                RepairRequest::Blocks {
                    object_id: a,
                    start: hs,
                    count: hc,
                },
                RepairRequest::Segments {
                    object_id: b,
                    block_id,
                    ..
                },
            ) => a == b && *hs <= *block_id && *block_id < hs + hc,
            (
                RepairRequest::Segments {
                    object_id: a,
                    block_id: hb,
                    start: hs,
                    count: hc,
                },
                RepairRequest::Segments {
                    object_id: b,
                    block_id: nb,
                    start: ns,
                    count: nc,
                },
            ) => {
                a == b
                    && hb == nb
                    && *hs as u16 <= *ns as u16
                    && *ns as u16 + nc <= *hs as u16 + hc
            }
            _ => false,
        })
    })
}

// ─── Receiver ────────────────────────────────────────────────────────────────

pub struct Receiver {
    config: ReceiverConfig,
    senders: HashMap<u32, RemoteSender>,
    codec: BlockCodec,
    events: Vec<ReceiverEvent>,
    emits: Vec<ReceiverEmit>,
    stats: ReceiverStats,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, pool: &SegmentPool) -> anyhow::Result<Self> {
        let codec = BlockCodec::new(pool.shard_width_bytes())?;
        Ok(Receiver {
            config,
            senders: HashMap::new(),
            codec,
            events: Vec::new(),
            emits: Vec::new(),
            stats: ReceiverStats::default(),
        })
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn drain_events(&mut self) -> Vec<ReceiverEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_emits(&mut self) -> Vec<ReceiverEmit> {
        std::mem::take(&mut self.emits)
    }

    pub fn sender(&self, node_id: u32) -> Option<&RemoteSender> {
        self.senders.get(&node_id)
    }

    pub fn sender_mut(&mut self, node_id: u32) -> Option<&mut RemoteSender> {
        self.senders.get_mut(&node_id)
    }

    /// Applies to remote senders observed after the call.
    pub fn set_default_nacking_mode(&mut self, mode: NackingMode) {
        self.config.default_nacking_mode = mode;
    }

    /// Applies to remote senders observed after the call; existing ones
    /// keep their per-sender setting.
    pub fn set_default_repair_boundary(&mut self, boundary: RepairBoundary) {
        self.config.repair_boundary = boundary;
    }

    /// Embedder-reported ECN congestion-experienced mark on traffic from
    /// `node_id` (drives loss events in Cce mode).
    pub fn handle_ecn(&mut self, node_id: u32, now: Instant) {
        if let Some(sender) = self.senders.get_mut(&node_id) {
            let rtt = sender.grtt;
            sender.loss.on_ecn(now, rtt);
        }
    }

    /// Drop one object's state (application release / cancel).
    pub fn release_object(&mut self, node_id: u32, object_id: u16, pool: &mut SegmentPool) {
        if let Some(sender) = self.senders.get_mut(&node_id) {
            if let Some(mut obj) = sender.objects.remove(&object_id) {
                obj.release(pool);
            }
        }
    }

    /// Release everything without ceremony (receiver stop).
    pub fn close(&mut self, pool: &mut SegmentPool) {
        for sender in self.senders.values_mut() {
            for obj in sender.objects.values_mut() {
                obj.release(pool);
            }
        }
        self.senders.clear();
    }

    /// Drop a whole remote sender (application or timeout purge).
    pub fn purge_sender(&mut self, node_id: u32, pool: &mut SegmentPool) {
        if let Some(mut sender) = self.senders.remove(&node_id) {
            for (_, obj) in sender.objects.iter_mut() {
                obj.release(pool);
            }
            self.events.push(ReceiverEvent::RemoteSenderPurged { node_id });
        }
    }

    // ─── Ingest ─────────────────────────────────────────────────────────

    /// Dispatch one decoded message into receiver state.
    pub fn handle_message(
        &mut self,
        msg: &Message,
        now: Instant,
        pool: &mut SegmentPool,
        rng: &mut SmallRng,
    ) {
        match &msg.body {
            MessageBody::Data(data) => self.on_data(&msg.header, data, now, pool),
            MessageBody::Info(info) => self.on_info(&msg.header, info, now, pool),
            MessageBody::Cmd(cmd) => self.on_cmd(&msg.header, cmd, now, pool),
            MessageBody::Nack(nack) => self.on_nack_overheard(&msg.header, nack),
            MessageBody::Ack(_) | MessageBody::Report(_) => {}
        }
        self.arm_nack_timers(now, rng);
    }

    /// Ensure state exists for the message's sender, handling restarts
    /// and the sender-cache limit. Returns false when the message should
    /// be ignored.
    fn ensure_sender(&mut self, header: &MsgHeader, now: Instant, pool: &mut SegmentPool) -> bool {
        let node_id = header.source_id;
        match self.senders.get(&node_id) {
            Some(existing) if existing.instance_id == header.instance_id => {}
            Some(_) => {
                // Restarted sender: prior state is worthless.
                debug!(node_id, instance = header.instance_id, "sender restarted");
                self.purge_sender(node_id, pool);
                self.senders.insert(
                    node_id,
                    RemoteSender::new(node_id, header.instance_id, &self.config, now),
                );
                self.events.push(ReceiverEvent::RemoteSenderNew { node_id });
            }
            None => {
                if self.senders.len() >= self.config.max_senders {
                    trace!(node_id, "sender cache full, ignoring");
                    return false;
                }
                self.senders.insert(
                    node_id,
                    RemoteSender::new(node_id, header.instance_id, &self.config, now),
                );
                self.events.push(ReceiverEvent::RemoteSenderNew { node_id });
            }
        }
        let sender = self.senders.get_mut(&node_id).expect("just ensured");
        let was_inactive = sender.inactive;
        sender.inactive = false;
        sender.absorb_header(header, now);
        if was_inactive {
            self.events.push(ReceiverEvent::RemoteSenderActive { node_id });
        }
        true
    }

    fn on_data(&mut self, header: &MsgHeader, data: &DataMsg, now: Instant, pool: &mut SegmentPool) {
        self.stats.segments_received += 1;
        self.stats.bytes_received += data.payload.len() as u64;
        let node_id = header.source_id;
        let sync_policy = self.config.sync_policy;
        let max_objects = self.config.max_objects_per_sender;
        let stream_buffer = self.config.stream_buffer_size;
        if !self.ensure_sender(header, now, pool) {
            return;
        }
        let sender = self.senders.get_mut(&node_id).expect("ensured");
        sender.meter.add(data.payload.len(), now);

        // Stream-sync gate.
        let is_stream = data.flags & flags::STREAM != 0;
        if is_stream && !sender.stream_synced {
            if data.flags & flags::STREAM_START != 0 {
                sender.stream_synced = true;
            } else {
                return;
            }
        }

        // Sync window.
        let object_id = data.object_id;
        match sender.sync_point {
            None => {
                sender.sync_point = Some(object_id);
                sender.deliver_cursor = Some(object_id);
            }
            Some(sync) => {
                let delta = object_id_delta(object_id, sync);
                if delta < 0 {
                    match sync_policy {
                        SyncPolicy::All => {
                            sender.sync_point = Some(object_id);
                            sender.deliver_cursor = Some(object_id);
                        }
                        _ => {
                            self.stats.out_of_window += 1;
                            return;
                        }
                    }
                }
            }
        }
        if let Some(floor) = sender.squelch_floor {
            if object_id_lt(object_id, floor) {
                self.stats.out_of_window += 1;
                return;
            }
        }

        // Object lookup / creation.
        if !sender.objects.contains_key(&object_id) {
            let Some(fti) = data.fti else {
                trace!(object_id, "data without FTI for unknown object");
                return;
            };
            if sender.objects.len() >= max_objects {
                Self::abort_oldest(sender, &mut self.events, &mut self.stats, pool);
            }
            let kind = if data.flags & flags::STREAM != 0 {
                ObjectKind::Stream
            } else if data.flags & flags::FILE != 0 {
                ObjectKind::File
            } else {
                ObjectKind::Data
            };
            let layout = ObjectLayout::from_fti(&fti);
            let obj = RxObject::new(object_id, kind, layout, sender.nacking_mode, stream_buffer);
            sender.objects.insert(object_id, obj);
            self.events.push(ReceiverEvent::ObjectNew { node_id, object_id });
        }
        sender.max_heard = Some(match sender.max_heard {
            Some(mh) if !object_id_lt(mh, object_id) => mh,
            _ => object_id,
        });

        let obj = sender.objects.get_mut(&object_id).expect("just ensured");
        let outcome = obj.store_segment(data.fec_id, data.flags, &data.payload, pool, &mut self.codec);
        match outcome {
            RxStoreOutcome::Stored | RxStoreOutcome::BlockCompleted => {
                if data.fec_id.parity || data.flags & flags::REPAIR != 0 {
                    self.stats.fec_recoveries += u64::from(outcome == RxStoreOutcome::BlockCompleted);
                }
                self.events.push(ReceiverEvent::ObjectUpdated { node_id, object_id });
            }
            RxStoreOutcome::ObjectCompleted => {
                self.events.push(ReceiverEvent::ObjectUpdated { node_id, object_id });
                Self::flush_deliveries(sender, &mut self.events, &mut self.stats);
                // A re-sent object behind the delivery cursor (requeue
                // after release) delivers directly.
                if let Some(obj) = sender.objects.get_mut(&object_id) {
                    let behind = sender
                        .deliver_cursor
                        .is_some_and(|c| object_id_lt(object_id, c));
                    if behind && obj.completed && !obj.delivered {
                        obj.delivered = true;
                        self.stats.objects_completed += 1;
                        self.events.push(ReceiverEvent::ObjectCompleted { node_id, object_id });
                    }
                }
            }
            RxStoreOutcome::Duplicate => {
                self.stats.duplicates += 1;
            }
            RxStoreOutcome::NoBuffers => {
                self.stats.pool_exhausted += 1;
                warn!(node_id, object_id, "segment pool exhausted, dropping");
            }
            RxStoreOutcome::Ignored => {}
        }

        // Stream readers drain continuously, not at object completion.
        if let Some(obj) = sender.objects.get_mut(&object_id) {
            obj.prune_stream_blocks(pool, 64);
        }
    }

    fn on_info(&mut self, header: &MsgHeader, info: &InfoMsg, now: Instant, pool: &mut SegmentPool) {
        let node_id = header.source_id;
        let max_objects = self.config.max_objects_per_sender;
        let stream_buffer = self.config.stream_buffer_size;
        if !self.ensure_sender(header, now, pool) {
            return;
        }
        let sender = self.senders.get_mut(&node_id).expect("ensured");
        let object_id = info.object_id;
        if sender.sync_point.is_none() {
            sender.sync_point = Some(object_id);
            sender.deliver_cursor = Some(object_id);
        }
        if !sender.objects.contains_key(&object_id) {
            let Some(fti) = info.fti else {
                return;
            };
            if sender.objects.len() >= max_objects {
                Self::abort_oldest(sender, &mut self.events, &mut self.stats, pool);
            }
            let kind = if info.flags & flags::STREAM != 0 {
                ObjectKind::Stream
            } else if info.flags & flags::FILE != 0 {
                ObjectKind::File
            } else {
                ObjectKind::Data
            };
            let obj = RxObject::new(
                object_id,
                kind,
                ObjectLayout::from_fti(&fti),
                sender.nacking_mode,
                stream_buffer,
            );
            sender.objects.insert(object_id, obj);
            self.events.push(ReceiverEvent::ObjectNew { node_id, object_id });
        }
        let obj = sender.objects.get_mut(&object_id).expect("just ensured");
        obj.info_expected = true;
        let completed = obj.completed;
        if obj.store_info(&info.payload) {
            self.events.push(ReceiverEvent::ObjectInfo { node_id, object_id });
            if completed {
                // Zero-length objects are whole the moment they exist.
                Self::flush_deliveries(sender, &mut self.events, &mut self.stats);
            }
        } else {
            self.stats.duplicates += 1;
        }
    }

    fn on_cmd(&mut self, header: &MsgHeader, cmd: &CmdBody, now: Instant, pool: &mut SegmentPool) {
        let node_id = header.source_id;
        let local_node = self.config.local_node_id;
        let silent = self.config.silent;
        if !self.ensure_sender(header, now, pool) {
            return;
        }
        let sender = self.senders.get_mut(&node_id).expect("ensured");
        match cmd {
            CmdBody::Flush(fl) => {
                // The flush point tells us how far the sender got; any
                // hole behind it is now provably loss.
                sender.max_heard = Some(match sender.max_heard {
                    Some(mh) if !object_id_lt(mh, fl.object_id) => mh,
                    _ => fl.object_id,
                });
                if sender.sync_point.is_none() {
                    sender.sync_point = Some(fl.object_id);
                    sender.deliver_cursor = Some(fl.object_id);
                }
                if let Some(obj) = sender.objects.get_mut(&fl.object_id) {
                    obj.note_tx_position(fl.fec_id.block_id, fl.fec_id.segment_id);
                }
            }
            CmdBody::AckReq(req) => {
                if !req.acking_nodes.contains(&local_node) {
                    return;
                }
                self.events.push(ReceiverEvent::AckRequested {
                    node_id,
                    object_id: req.object_id,
                });
                if silent {
                    return;
                }
                // ACK only once the watermark point is locally whole.
                let reached = sender.objects.get(&req.object_id).is_some_and(|obj| {
                    obj.completed
                        || (!obj.is_stream()
                            && obj.max_completed_block.is_some_and(|b| b >= req.fec_id.block_id))
                });
                if reached {
                    self.stats.acks_sent += 1;
                    self.emits.push(ReceiverEmit {
                        dest: Destination::Sender(node_id),
                        body: MessageBody::Ack(AckMsg {
                            sender_id: node_id,
                            ack_type: AckType::Watermark,
                            object_id: req.object_id,
                            fec_id: req.fec_id,
                            payload: Bytes::new(),
                        }),
                    });
                }
            }
            CmdBody::CcProbe(probe) => {
                if silent {
                    return;
                }
                let report = Self::probe_reply(sender, probe);
                self.emits.push(ReceiverEmit {
                    dest: Destination::Sender(node_id),
                    body: MessageBody::Cmd(CmdBody::CcReport(report)),
                });
            }
            CmdBody::Squelch(sq) => {
                sender.squelch_floor = Some(sq.oldest_object_id);
                // Anything older and incomplete is now unrepairable.
                let stale: Vec<u16> = sender
                    .objects
                    .iter()
                    .filter(|(&id, obj)| {
                        object_id_lt(id, sq.oldest_object_id) && !obj.completed && !obj.aborted
                    })
                    .map(|(&id, _)| id)
                    .collect();
                for id in stale {
                    let obj = sender.objects.get_mut(&id).expect("listed");
                    obj.aborted = true;
                    obj.release(pool);
                    self.stats.objects_aborted += 1;
                    self.events.push(ReceiverEvent::ObjectAborted {
                        node_id,
                        object_id: id,
                    });
                }
                Self::flush_deliveries(sender, &mut self.events, &mut self.stats);
            }
            CmdBody::RepairAdv(adv) => {
                // A repair advertisement suppresses like an overheard NACK.
                if matches!(sender.nack, NackState::Backoff { .. }) {
                    sender.overheard.extend(adv.requests.iter().cloned());
                }
            }
            CmdBody::CcReport(_) => {}
        }
    }

    fn probe_reply(sender: &mut RemoteSender, probe: &CcProbeCmd) -> CcReportCmd {
        CcReportCmd {
            cc_sequence: probe.cc_sequence,
            loss_quantized: CcReportCmd::quantize_loss(sender.loss.loss_event_rate()),
            send_time_us: probe.send_time_us,
            delay_us: 0,
            recv_rate: sender.meter.rate() as u64,
        }
    }

    /// Another receiver's NACK for a sender we track: suppression input.
    fn on_nack_overheard(&mut self, header: &MsgHeader, nack: &NackMsg) {
        if header.source_id == self.config.local_node_id {
            return;
        }
        let Some(sender) = self.senders.get_mut(&nack.sender_id) else {
            return;
        };
        if matches!(sender.nack, NackState::Backoff { .. }) {
            sender.overheard.extend(nack.requests.iter().cloned());
        }
    }

    fn abort_oldest(
        sender: &mut RemoteSender,
        events: &mut Vec<ReceiverEvent>,
        stats: &mut ReceiverStats,
        pool: &mut SegmentPool,
    ) {
        let oldest = sender
            .objects
            .iter()
            .filter(|(_, obj)| !obj.completed && !obj.aborted)
            .map(|(&id, _)| id)
            .min_by(|&a, &b| {
                if object_id_lt(a, b) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            });
        if let Some(id) = oldest {
            let obj = sender.objects.get_mut(&id).expect("listed");
            obj.aborted = true;
            obj.release(pool);
            stats.objects_aborted += 1;
            events.push(ReceiverEvent::ObjectAborted {
                node_id: sender.node_id,
                object_id: id,
            });
            Self::flush_deliveries(sender, events, stats);
        }
    }

    /// Fire completion events in strict object-id order: a completed
    /// object waits until everything before it completed or aborted.
    fn flush_deliveries(
        sender: &mut RemoteSender,
        events: &mut Vec<ReceiverEvent>,
        stats: &mut ReceiverStats,
    ) {
        let Some(mut cursor) = sender.deliver_cursor else {
            return;
        };
        loop {
            let Some(obj) = sender.objects.get_mut(&cursor) else {
                break;
            };
            if obj.aborted {
                cursor = cursor.wrapping_add(1);
                continue;
            }
            if !obj.completed || obj.is_stream() {
                break;
            }
            if !obj.delivered {
                obj.delivered = true;
                stats.objects_completed += 1;
                events.push(ReceiverEvent::ObjectCompleted {
                    node_id: sender.node_id,
                    object_id: cursor,
                });
            }
            sender.max_completed = Some(cursor);
            cursor = cursor.wrapping_add(1);
        }
        sender.deliver_cursor = Some(cursor);
    }

    // ─── NACK Machine Driving ───────────────────────────────────────────

    /// Arm Backoff on any sender with outstanding needs and an idle
    /// machine.
    fn arm_nack_timers(&mut self, now: Instant, rng: &mut SmallRng) {
        if self.config.silent {
            return;
        }
        for sender in self.senders.values_mut() {
            if sender.nacking_mode == NackingMode::None {
                continue;
            }
            if !matches!(sender.nack, NackState::Idle) {
                continue;
            }
            if sender.build_nack_content().is_empty() {
                continue;
            }
            let window = scaled_backoff(sender.grtt, 1.0e-3, 1.0e3, sender.backoff);
            let fire_at = now + Duration::from_secs_f64(rng.random::<f64>() * window.max(0.001));
            sender.overheard.clear();
            sender.nack = NackState::Backoff { fire_at };
            trace!(node_id = sender.node_id, "nack backoff armed");
        }
    }

    /// Earliest receiver deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for sender in self.senders.values() {
            let t = match &sender.nack {
                NackState::Idle => None,
                NackState::Backoff { fire_at } => Some(*fire_at),
                NackState::Holdoff { until, .. } => Some(*until),
            };
            if let Some(t) = t {
                next = Some(next.map_or(t, |n: Instant| n.min(t)));
            }
        }
        next
    }

    /// Advance NACK machines and inactivity tracking.
    pub fn handle_timeout(&mut self, now: Instant, pool: &mut SegmentPool, rng: &mut SmallRng) {
        let unicast_default = self.config.unicast_nacks;
        let silent = self.config.silent;
        let rx_robust = self.config.rx_robust_factor;

        let mut purge: Vec<u32> = Vec::new();
        for sender in self.senders.values_mut() {
            // Inactivity.
            let timeout = Duration::from_secs_f64(
                rx_robust as f64 * INACTIVITY_GRTT_MULTIPLIER * sender.grtt.max(1.0e-3),
            );
            let idle = now.duration_since(sender.last_activity);
            if idle > timeout * 2 {
                purge.push(sender.node_id);
                continue;
            }
            if idle > timeout && !sender.inactive {
                sender.inactive = true;
                self.events.push(ReceiverEvent::RemoteSenderInactive {
                    node_id: sender.node_id,
                });
            }

            if silent {
                continue;
            }
            match &sender.nack {
                NackState::Backoff { fire_at } if *fire_at <= now => {
                    let content = sender.build_nack_content();
                    if content.is_empty() {
                        sender.nack = NackState::Idle;
                        continue;
                    }
                    if requests_cover(&sender.overheard, &content) {
                        // Someone else already asked for everything we need.
                        self.stats.nacks_suppressed += 1;
                        sender.nack = NackState::Idle;
                        trace!(node_id = sender.node_id, "nack suppressed");
                        continue;
                    }
                    let holdoff = Duration::from_secs_f64(
                        (1.0 + 2.0 * sender.backoff) * sender.grtt.max(1.0e-3),
                    );
                    self.stats.nacks_sent += 1;
                    let dest = if sender.unicast_nacks || unicast_default {
                        Destination::Sender(sender.node_id)
                    } else {
                        Destination::Group
                    };
                    self.emits.push(ReceiverEmit {
                        dest,
                        body: MessageBody::Nack(NackMsg {
                            sender_id: sender.node_id,
                            requests: content.clone(),
                        }),
                    });
                    sender.overheard.clear();
                    sender.nack = NackState::Holdoff {
                        until: now + holdoff,
                        content,
                    };
                }
                NackState::Holdoff { until, content } => {
                    if *until <= now {
                        sender.nack = NackState::Idle;
                    } else {
                        // New loss extending the outstanding request set
                        // goes out immediately; the holdoff restarts.
                        let needs = sender.build_nack_content();
                        if !needs.is_empty() && !requests_cover(content, &needs) {
                            let holdoff = Duration::from_secs_f64(
                                (1.0 + 2.0 * sender.backoff) * sender.grtt.max(1.0e-3),
                            );
                            self.stats.nacks_sent += 1;
                            let dest = if sender.unicast_nacks || unicast_default {
                                Destination::Sender(sender.node_id)
                            } else {
                                Destination::Group
                            };
                            self.emits.push(ReceiverEmit {
                                dest,
                                body: MessageBody::Nack(NackMsg {
                                    sender_id: sender.node_id,
                                    requests: needs.clone(),
                                }),
                            });
                            sender.nack = NackState::Holdoff {
                                until: now + holdoff,
                                content: needs,
                            };
                        }
                    }
                }
                _ => {}
            }
        }
        for node_id in purge {
            self.purge_sender(node_id, pool);
        }
        self.arm_nack_timers(now, rng);
    }

    // ─── Stream API ─────────────────────────────────────────────────────

    pub fn stream_read(
        &mut self,
        node_id: u32,
        object_id: u16,
        buf: &mut [u8],
    ) -> Option<usize> {
        self.senders
            .get_mut(&node_id)?
            .objects
            .get_mut(&object_id)?
            .stream()
            .map(|s| s.read(buf))
    }

    pub fn stream_seek_msg_start(&mut self, node_id: u32, object_id: u16) -> Option<bool> {
        self.senders
            .get_mut(&node_id)?
            .objects
            .get_mut(&object_id)?
            .stream()
            .map(|s| s.seek_msg_start())
    }
}
