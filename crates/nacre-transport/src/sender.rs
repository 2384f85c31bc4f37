//! # Sender Pipeline
//!
//! Pure logic — no sockets, no timers of its own. The session asks the
//! sender for the next datagram body against the current rate budget;
//! selection follows strict priority:
//!
//! 1. repair segments answering aggregated NACK state
//! 2. the outstanding watermark command
//! 3. active-flush commands while the queue is idle
//! 4. (GRTT probes — interleaved by the session)
//! 5. fresh source segments / auto parity from the pending object queue
//!
//! Repair runs through a small state machine: the first NACK for live
//! content opens a collecting window of `2·GRTT·backoff` during which
//! further NACKs union into per-block repair masks; at expiry the union
//! is turned into the smallest covering transmit plan.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use quanta::Instant;
use rand::rngs::SmallRng;
use rand::RngExt;
use tracing::{debug, trace, warn};

use crate::block::RepairSend;
use crate::fec::BlockCodec;
use crate::grtt::scaled_backoff;
use crate::object::{
    FsFileBacking, ObjectKind, ObjectLayout, TxCache, TxCacheBounds, TxContent, TxObject,
    TxPending,
};
use crate::pool::SegmentPool;
use crate::stats::SenderStats;
use crate::stream::{FlushMode, StreamTx};
use crate::wire::{
    flags, AckMsg, AckReqCmd, AckType, CmdBody, DataMsg, FecPayloadId, FlushCmd, InfoMsg, NackMsg,
    SquelchCmd,
};

// ─── Acking State ────────────────────────────────────────────────────────────

/// Watermark acknowledgment status of one acking node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckingStatus {
    /// Node is not on the acking list.
    Invalid,
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy)]
struct AckingNode {
    status: AckingStatus,
}

// ─── Watermark ───────────────────────────────────────────────────────────────

struct Watermark {
    object_id: u16,
    fec_id: FecPayloadId,
    /// Command transmissions so far.
    attempts: u32,
    next_cmd: Instant,
    complete: bool,
}

// ─── Flush ───────────────────────────────────────────────────────────────────

struct ActiveFlush {
    object_id: u16,
    fec_id: FecPayloadId,
    remaining: u32,
    next_cmd: Instant,
    eot: bool,
}

// ─── Repair State Machine ────────────────────────────────────────────────────

enum RepairPhase {
    Ready,
    /// NACKs union into block masks until the window closes.
    Collecting { activate_at: Instant },
    /// Draining the computed plan.
    Transmitting,
}

/// One planned repair transmission.
#[derive(Debug, Clone, Copy)]
enum RepairItem {
    Info { object_id: u16 },
    Send { object_id: u16, send: RepairSend, block_id: u32 },
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Sender-side happenings the session surfaces to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    QueueVacancy,
    QueueEmpty,
    FlushCompleted { object_id: u16 },
    WatermarkCompleted { object_id: u16 },
    ObjectSent { object_id: u16 },
    ObjectPurged { object_id: u16 },
}

// ─── Outbound Bodies ─────────────────────────────────────────────────────────

/// A datagram body the sender wants transmitted.
#[derive(Debug)]
pub enum SenderEmit {
    Data(DataMsg),
    Info(InfoMsg),
    Cmd(CmdBody),
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Sender knobs, frozen at `start_sender` except where setters say
/// otherwise.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub instance_id: u16,
    pub segment_size: u16,
    pub block_len: u8,
    pub parity_len: u8,
    /// Parity segments sent proactively per block.
    pub auto_parity: u8,
    /// Extra parity per repair round beyond the reported need.
    pub extra_parity: u8,
    /// Redundant control transmissions (flush, watermark).
    pub robust_factor: u32,
    pub cache_bounds: TxCacheBounds,
    /// Advertise aggregated repair state to the group (suppression aid
    /// when receivers NACK unicast).
    pub advertise_repairs: bool,
}

// ─── Sender ──────────────────────────────────────────────────────────────────

pub struct Sender {
    config: SenderConfig,
    cache: TxCache,
    /// Objects with initial-pass work, in enqueue order.
    pending: VecDeque<u16>,
    next_object_id: u16,
    codec: BlockCodec,
    repair: RepairPhase,
    repair_plan: VecDeque<RepairItem>,
    /// Fingerprints of NACKs seen within the last GRTT (duplicate
    /// suppression for congestion accounting).
    recent_nacks: Vec<(Instant, u64)>,
    watermark: Option<Watermark>,
    acking: std::collections::BTreeMap<u32, AckingNode>,
    flush: Option<ActiveFlush>,
    /// Streams with Active auto-flush trigger flush rounds on idle.
    active_flush_armed: bool,
    /// Squelch to transmit (oldest retained object id).
    squelch_pending: Option<u16>,
    /// Repair advertisement owed before the next repair round.
    pending_repair_adv: Option<crate::wire::RepairAdvCmd>,
    /// Highest position handed to the wire, for flush/watermark points.
    last_position: Option<(u16, FecPayloadId)>,
    queue_empty_fired: bool,
    events: Vec<SenderEvent>,
    stats: SenderStats,
}

impl Sender {
    pub fn new(config: SenderConfig, pool: &SegmentPool) -> Result<Self> {
        if config.segment_size == 0 {
            bail!("segment size must be non-zero");
        }
        if config.block_len == 0 {
            bail!("block length must be non-zero");
        }
        if config.block_len as usize + config.parity_len as usize > crate::fec::MAX_BLOCK_SEGMENTS {
            bail!("k + n exceeds {}", crate::fec::MAX_BLOCK_SEGMENTS);
        }
        let codec = BlockCodec::new(pool.shard_width_bytes())?;
        Ok(Sender {
            cache: TxCache::new(config.cache_bounds),
            config,
            pending: VecDeque::new(),
            next_object_id: 0,
            codec,
            repair: RepairPhase::Ready,
            repair_plan: VecDeque::new(),
            recent_nacks: Vec::new(),
            watermark: None,
            acking: std::collections::BTreeMap::new(),
            flush: None,
            active_flush_armed: false,
            squelch_pending: None,
            pending_repair_adv: None,
            last_position: None,
            queue_empty_fired: false,
            events: Vec::new(),
            stats: SenderStats::default(),
        })
    }

    pub fn instance_id(&self) -> u16 {
        self.config.instance_id
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// The session transmits GRTT probes; the count lives here with the
    /// rest of the sender counters.
    pub fn stats_probe_sent(&mut self) {
        self.stats.probes_sent += 1;
    }

    pub fn drain_events(&mut self) -> Vec<SenderEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_cache_bounds(&mut self, bounds: TxCacheBounds) {
        self.cache.set_bounds(bounds);
    }

    fn layout_for(&self, object_size: u64) -> ObjectLayout {
        ObjectLayout {
            object_size,
            segment_size: self.config.segment_size,
            block_len: self.config.block_len,
            parity_len: self.config.parity_len,
        }
    }

    // ─── Enqueue Operations ─────────────────────────────────────────────

    fn admit(&mut self, object: TxObject, pool: &mut SegmentPool) -> u16 {
        let id = object.object_id;
        let purged = self.cache.insert(object);
        for mut obj in purged {
            obj.release(pool);
            self.stats.objects_purged += 1;
            self.events.push(SenderEvent::ObjectPurged {
                object_id: obj.object_id,
            });
        }
        self.pending.push_back(id);
        self.queue_empty_fired = false;
        self.events.push(SenderEvent::QueueVacancy);
        id
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_object_id;
        self.next_object_id = self.next_object_id.wrapping_add(1);
        id
    }

    /// Enqueue an in-memory buffer.
    pub fn enqueue_data(
        &mut self,
        data: Bytes,
        info: Option<Bytes>,
        pool: &mut SegmentPool,
    ) -> Result<u16> {
        self.check_info(&info)?;
        let id = self.next_id();
        let layout = self.layout_for(data.len() as u64);
        let obj = TxObject::new(
            id,
            ObjectKind::Data,
            layout,
            info,
            TxContent::Data(data),
            self.config.auto_parity as u16,
        );
        Ok(self.admit(obj, pool))
    }

    /// Enqueue a file by path (opened through the `std::fs` backing).
    pub fn enqueue_file(
        &mut self,
        path: &std::path::Path,
        info: Option<Bytes>,
        pool: &mut SegmentPool,
    ) -> Result<u16> {
        self.check_info(&info)?;
        let backing = FsFileBacking::open(path).context("enqueue file")?;
        let size = crate::object::FileBacking::len(&backing);
        let id = self.next_id();
        let layout = self.layout_for(size);
        let obj = TxObject::new(
            id,
            ObjectKind::File,
            layout,
            info,
            TxContent::File(Box::new(backing)),
            self.config.auto_parity as u16,
        );
        Ok(self.admit(obj, pool))
    }

    /// Open a stream object.
    pub fn open_stream(
        &mut self,
        buffer_size: usize,
        info: Option<Bytes>,
        pool: &mut SegmentPool,
    ) -> Result<u16> {
        self.check_info(&info)?;
        let id = self.next_id();
        let layout = self.layout_for(crate::wire::FtiExt::STREAM_SIZE);
        let stream = StreamTx::new(buffer_size, self.config.segment_size as usize);
        let obj = TxObject::new(
            id,
            ObjectKind::Stream,
            layout,
            info,
            TxContent::Stream(stream),
            self.config.auto_parity as u16,
        );
        Ok(self.admit(obj, pool))
    }

    fn check_info(&self, info: &Option<Bytes>) -> Result<()> {
        if let Some(info) = info {
            if info.len() > self.config.segment_size as usize {
                bail!("info exceeds one segment");
            }
        }
        Ok(())
    }

    /// Put a fully-sent cached object back on the pending queue.
    pub fn requeue(&mut self, object_id: u16) -> Result<()> {
        let obj = self
            .cache
            .get_mut(object_id)
            .context("object no longer cached")?;
        obj.requeue()?;
        if !self.pending.contains(&object_id) {
            self.pending.push_back(object_id);
        }
        self.queue_empty_fired = false;
        Ok(())
    }

    /// Drop an object outright: no further transmissions, repairs or
    /// events for it.
    pub fn cancel(&mut self, object_id: u16, pool: &mut SegmentPool) {
        self.pending.retain(|&id| id != object_id);
        self.repair_plan.retain(|item| match item {
            RepairItem::Info { object_id: id } | RepairItem::Send { object_id: id, .. } => {
                *id != object_id
            }
        });
        if let Some(mut obj) = self.cache.remove(object_id) {
            obj.release(pool);
        }
        if self.watermark.as_ref().is_some_and(|w| w.object_id == object_id) {
            self.watermark = None;
        }
    }

    pub fn object(&self, object_id: u16) -> Option<&TxObject> {
        self.cache.get(object_id)
    }

    pub fn object_mut(&mut self, object_id: u16) -> Option<&mut TxObject> {
        self.cache.get_mut(object_id)
    }

    // ─── Stream Operations ──────────────────────────────────────────────

    fn stream_of(&mut self, object_id: u16) -> Result<&mut StreamTx> {
        self.cache
            .get_mut(object_id)
            .context("unknown stream object")?
            .stream()
            .context("object is not a stream")
    }

    pub fn stream_write(&mut self, object_id: u16, bytes: &[u8]) -> Result<usize> {
        let n = self.stream_of(object_id)?.write(bytes);
        if n > 0 {
            self.queue_empty_fired = false;
            if !self.pending.contains(&object_id) {
                self.pending.push_back(object_id);
            }
        }
        Ok(n)
    }

    pub fn stream_flush(&mut self, object_id: u16, eom: bool, mode: FlushMode) -> Result<()> {
        let stream = self.stream_of(object_id)?;
        stream.flush(eom);
        if mode == FlushMode::Active {
            self.active_flush_armed = true;
        }
        if !self.pending.contains(&object_id) {
            self.pending.push_back(object_id);
        }
        self.queue_empty_fired = false;
        Ok(())
    }

    pub fn stream_set_push_mode(&mut self, object_id: u16, enabled: bool) -> Result<()> {
        self.stream_of(object_id)?.set_push_mode(enabled);
        Ok(())
    }

    pub fn stream_set_auto_flush(&mut self, object_id: u16, mode: FlushMode) -> Result<()> {
        self.stream_of(object_id)?.set_auto_flush(mode);
        Ok(())
    }

    pub fn stream_has_vacancy(&mut self, object_id: u16) -> Result<bool> {
        Ok(self.stream_of(object_id)?.has_vacancy())
    }

    pub fn stream_mark_eom(&mut self, object_id: u16) -> Result<()> {
        self.stream_of(object_id)?.mark_eom();
        Ok(())
    }

    // ─── Watermark & Acking ─────────────────────────────────────────────

    pub fn add_acking_node(&mut self, node_id: u32) {
        self.acking.entry(node_id).or_insert(AckingNode {
            status: AckingStatus::Pending,
        });
    }

    pub fn remove_acking_node(&mut self, node_id: u32) {
        self.acking.remove(&node_id);
    }

    /// Watermark status of one node, or the aggregate for
    /// [`crate::wire::NODE_ANY`]: Success only when every node succeeded,
    /// Pending while any is outstanding, else Failure.
    pub fn acking_status(&self, node_id: u32) -> AckingStatus {
        if node_id == crate::wire::NODE_ANY {
            if self.acking.is_empty() {
                return AckingStatus::Invalid;
            }
            let mut all_success = true;
            for node in self.acking.values() {
                match node.status {
                    AckingStatus::Pending => return AckingStatus::Pending,
                    AckingStatus::Success => {}
                    _ => all_success = false,
                }
            }
            if all_success {
                AckingStatus::Success
            } else {
                AckingStatus::Failure
            }
        } else {
            self.acking
                .get(&node_id)
                .map_or(AckingStatus::Invalid, |n| n.status)
        }
    }

    /// Set (or replace) the watermark point. `override_flush` suppresses
    /// the flush rounds that would otherwise accompany queue idle.
    pub fn set_watermark(
        &mut self,
        object_id: u16,
        block_id: u32,
        segment_id: u8,
        override_flush: bool,
        now: Instant,
    ) -> Result<()> {
        if !self.cache.contains(object_id) {
            bail!("watermark object not cached");
        }
        if self.acking.is_empty() {
            bail!("no acking nodes configured");
        }
        for node in self.acking.values_mut() {
            node.status = AckingStatus::Pending;
        }
        self.watermark = Some(Watermark {
            object_id,
            fec_id: FecPayloadId::source(block_id, segment_id),
            attempts: 0,
            next_cmd: now,
            complete: false,
        });
        if override_flush {
            self.flush = None;
        }
        Ok(())
    }

    pub fn cancel_watermark(&mut self) {
        self.watermark = None;
    }

    /// Ingest a watermark ACK from an acking node.
    pub fn handle_ack(&mut self, from_node: u32, ack: &AckMsg) {
        if ack.ack_type != AckType::Watermark {
            return;
        }
        self.stats.acks_received += 1;
        let Some(wm) = &mut self.watermark else {
            return;
        };
        if wm.object_id != ack.object_id || ack.fec_id < wm.fec_id {
            return; // stale point
        }
        if let Some(node) = self.acking.get_mut(&from_node) {
            if node.status == AckingStatus::Pending {
                node.status = AckingStatus::Success;
                trace!(node_id = from_node, "watermark ack");
            }
        }
        self.check_watermark_completion();
    }

    fn check_watermark_completion(&mut self) {
        let Some(wm) = &mut self.watermark else {
            return;
        };
        if wm.complete {
            return;
        }
        let done = self
            .acking
            .values()
            .all(|n| matches!(n.status, AckingStatus::Success | AckingStatus::Failure));
        if done {
            wm.complete = true;
            self.events.push(SenderEvent::WatermarkCompleted {
                object_id: wm.object_id,
            });
        }
    }

    // ─── NACK Handling ──────────────────────────────────────────────────

    /// Merge a NACK into repair state. `grtt`/`backoff` shape the
    /// collecting window.
    pub fn handle_nack(
        &mut self,
        nack: &NackMsg,
        now: Instant,
        grtt: f64,
        grtt_bounds: (f64, f64),
        backoff: f64,
    ) {
        self.stats.nacks_received += 1;

        // Identical NACK content within one GRTT counts once for
        // congestion accounting.
        let fp = Self::fingerprint(nack);
        let window = Duration::from_secs_f64(grtt.max(grtt_bounds.0));
        self.recent_nacks.retain(|(t, _)| now.duration_since(*t) < window);
        if self.recent_nacks.iter().any(|(_, f)| *f == fp) {
            self.stats.nacks_redundant += 1;
        } else {
            self.recent_nacks.push((now, fp));
        }

        let mut touched_live = false;
        for request in &nack.requests {
            let object_id = request.object_id();
            match self.cache.get_mut(object_id) {
                Some(obj) => {
                    obj.merge_repair(request);
                    touched_live = true;
                }
                None => {
                    // Repair horizon passed: tell the group to stop asking.
                    if let Some(oldest) = self.cache.oldest_id() {
                        if crate::object::object_id_lt(object_id, oldest) {
                            self.squelch_pending = Some(oldest);
                        }
                    }
                }
            }
        }

        if touched_live {
            if let RepairPhase::Ready = self.repair {
                let hold = 2.0 * scaled_backoff(grtt, grtt_bounds.0, grtt_bounds.1, backoff.max(1.0));
                self.repair = RepairPhase::Collecting {
                    activate_at: now + Duration::from_secs_f64(hold),
                };
                debug!(hold_s = hold, "repair collecting");
            }
        }
    }

    fn fingerprint(nack: &NackMsg) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        nack.sender_id.hash(&mut hasher);
        for req in &nack.requests {
            std::mem::discriminant(req).hash(&mut hasher);
            req.object_id().hash(&mut hasher);
            if let crate::wire::RepairRequest::Blocks { start, count, .. } = req {
                start.hash(&mut hasher);
                count.hash(&mut hasher);
            }
            if let crate::wire::RepairRequest::Segments {
                block_id,
                start,
                count,
                ..
            } = req
            {
                block_id.hash(&mut hasher);
                start.hash(&mut hasher);
                count.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Close the collecting window if due and lay out the repair plan.
    fn activate_repair(&mut self, now: Instant) {
        let RepairPhase::Collecting { activate_at } = self.repair else {
            return;
        };
        if now < activate_at {
            return;
        }
        let extra = self.config.extra_parity as u16;
        let mut plan = VecDeque::new();
        for object_id in self.cache.ids().to_vec() {
            let Some(obj) = self.cache.get_mut(object_id) else {
                continue;
            };
            // Objects mid-initial-pass will carry their INFO anyway.
            if obj.fully_sent && obj.info_needs_repair() {
                plan.push_back(RepairItem::Info { object_id });
            }
            for block_id in obj.repair_block_ids() {
                if let Some(blk) = obj.block_mut(block_id) {
                    for send in blk.drain_repair_plan(extra) {
                        plan.push_back(RepairItem::Send {
                            object_id,
                            send,
                            block_id,
                        });
                    }
                }
            }
        }
        debug!(items = plan.len(), "repair transmitting");
        if self.config.advertise_repairs && !plan.is_empty() {
            let mut requests = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for item in &plan {
                match *item {
                    RepairItem::Info { object_id } => {
                        if seen.insert((object_id, u32::MAX)) {
                            requests.push(crate::wire::RepairRequest::Info { object_id });
                        }
                    }
                    RepairItem::Send {
                        object_id,
                        block_id,
                        ..
                    } => {
                        if seen.insert((object_id, block_id)) {
                            requests.push(crate::wire::RepairRequest::Blocks {
                                object_id,
                                start: block_id,
                                count: 1,
                            });
                        }
                    }
                }
            }
            self.pending_repair_adv = Some(crate::wire::RepairAdvCmd { requests });
        }
        self.repair_plan = plan;
        self.repair = if self.repair_plan.is_empty() {
            RepairPhase::Ready
        } else {
            RepairPhase::Transmitting
        };
    }

    // ─── Transmission ───────────────────────────────────────────────────

    /// Next control/repair body due at `now`, by priority. Data comes
    /// from [`Sender::poll_data`] after the session has interleaved its
    /// GRTT probe.
    pub fn poll_control(
        &mut self,
        now: Instant,
        grtt: f64,
        grtt_bounds: (f64, f64),
        backoff: f64,
        pool: &mut SegmentPool,
        rng: &mut SmallRng,
    ) -> Option<SenderEmit> {
        // Squelch rides ahead of everything; it is one datagram.
        if let Some(oldest) = self.squelch_pending.take() {
            self.stats.squelches_sent += 1;
            return Some(SenderEmit::Cmd(CmdBody::Squelch(SquelchCmd {
                oldest_object_id: oldest,
            })));
        }

        self.activate_repair(now);
        if let Some(adv) = self.pending_repair_adv.take() {
            return Some(SenderEmit::Cmd(CmdBody::RepairAdv(adv)));
        }
        if let RepairPhase::Transmitting = self.repair {
            if let Some(emit) = self.next_repair_emit(pool) {
                return Some(emit);
            }
            self.repair = RepairPhase::Ready;
        }

        // Watermark command on its randomized cadence.
        if let Some(emit) = self.poll_watermark(now, grtt, grtt_bounds, backoff, rng) {
            return Some(emit);
        }

        // Flush rounds while idle.
        if let Some(emit) = self.poll_flush(now, grtt, grtt_bounds, backoff) {
            return Some(emit);
        }

        None
    }

    fn next_repair_emit(&mut self, pool: &mut SegmentPool) -> Option<SenderEmit> {
        while let Some(item) = self.repair_plan.pop_front() {
            match item {
                RepairItem::Info { object_id } => {
                    let Some(obj) = self.cache.get_mut(object_id) else {
                        continue;
                    };
                    let Some(info) = obj.info.clone() else {
                        continue;
                    };
                    obj.mark_info_sent();
                    self.stats.repairs_sent += 1;
                    return Some(SenderEmit::Info(InfoMsg {
                        object_id,
                        flags: flags::REPAIR | self.object_flags(object_id),
                        fti: Some(self.cache.get(object_id)?.layout.to_fti()),
                        payload: info,
                    }));
                }
                RepairItem::Send {
                    object_id,
                    send,
                    block_id,
                } => {
                    if let Some(emit) = self.repair_segment_emit(object_id, block_id, send, pool) {
                        self.stats.repairs_sent += 1;
                        return Some(emit);
                    }
                }
            }
        }
        None
    }

    fn repair_segment_emit(
        &mut self,
        object_id: u16,
        block_id: u32,
        send: RepairSend,
        pool: &mut SegmentPool,
    ) -> Option<SenderEmit> {
        let obj_flags = self.object_flags(object_id);
        let obj = self.cache.get_mut(object_id)?;
        let fti = obj.layout.to_fti();
        match send {
            RepairSend::Source(segment_id) => {
                let payload = match obj.read_segment(block_id, segment_id) {
                    Ok(p) => p,
                    Err(err) => {
                        debug!(object_id, block_id, segment_id, %err, "repair read failed");
                        return None;
                    }
                };
                Some(SenderEmit::Data(DataMsg {
                    object_id,
                    flags: flags::REPAIR | obj_flags,
                    fec_id: FecPayloadId::source(block_id, segment_id),
                    fti: Some(fti),
                    payload: Bytes::from(payload),
                }))
            }
            RepairSend::Parity(segment_id) => {
                // Parity may not exist yet if the block never needed it.
                if obj.block(block_id).map_or(true, |b| !b.parity_ready()) {
                    match obj.ensure_block_parity(block_id, &mut self.codec, pool) {
                        Ok(true) => {}
                        Ok(false) => return None, // pool pressure; receivers re-NACK
                        Err(err) => {
                            debug!(object_id, block_id, %err, "parity repair failed");
                            return None;
                        }
                    }
                }
                let shard = obj.block(block_id)?.parity_shard(segment_id)?.to_vec();
                Some(SenderEmit::Data(DataMsg {
                    object_id,
                    flags: flags::REPAIR | obj_flags,
                    fec_id: FecPayloadId::parity(block_id, segment_id),
                    fti: Some(fti),
                    payload: Bytes::from(shard),
                }))
            }
        }
    }

    fn poll_watermark(
        &mut self,
        now: Instant,
        grtt: f64,
        grtt_bounds: (f64, f64),
        backoff: f64,
        rng: &mut SmallRng,
    ) -> Option<SenderEmit> {
        let robust = self.config.robust_factor;
        let wm = self.watermark.as_mut()?;
        if wm.complete || now < wm.next_cmd {
            return None;
        }
        if wm.attempts >= robust {
            // Out of patience: everyone still pending has failed.
            for node in self.acking.values_mut() {
                if node.status == AckingStatus::Pending {
                    node.status = AckingStatus::Failure;
                }
            }
            self.check_watermark_completion();
            return None;
        }
        wm.attempts += 1;
        let spread = 2.0 * scaled_backoff(grtt, grtt_bounds.0, grtt_bounds.1, backoff.max(1.0));
        wm.next_cmd = now + Duration::from_secs_f64(rng.random::<f64>() * spread.max(0.010));
        let cmd = AckReqCmd {
            object_id: wm.object_id,
            fec_id: wm.fec_id,
            acking_nodes: self
                .acking
                .iter()
                .filter(|(_, n)| n.status == AckingStatus::Pending)
                .map(|(&id, _)| id)
                .collect(),
        };
        self.stats.ack_requests_sent += 1;
        Some(SenderEmit::Cmd(CmdBody::AckReq(cmd)))
    }

    fn poll_flush(
        &mut self,
        now: Instant,
        grtt: f64,
        grtt_bounds: (f64, f64),
        backoff: f64,
    ) -> Option<SenderEmit> {
        let fl = self.flush.as_mut()?;
        if now < fl.next_cmd {
            return None;
        }
        if fl.remaining == 0 {
            let object_id = fl.object_id;
            self.flush = None;
            self.events.push(SenderEvent::FlushCompleted { object_id });
            return None;
        }
        fl.remaining -= 1;
        let interval = scaled_backoff(grtt, grtt_bounds.0, grtt_bounds.1, backoff.max(1.0));
        fl.next_cmd = now + Duration::from_secs_f64(interval.max(0.010));
        self.stats.flushes_sent += 1;
        Some(SenderEmit::Cmd(CmdBody::Flush(FlushCmd {
            object_id: fl.object_id,
            fec_id: fl.fec_id,
            eot: fl.eot,
        })))
    }

    /// Next fresh data body from the pending object queue.
    pub fn poll_data(&mut self, pool: &mut SegmentPool) -> Option<SenderEmit> {
        loop {
            let &object_id = self.pending.front()?;
            let Some(obj) = self.cache.get_mut(object_id) else {
                self.pending.pop_front();
                continue;
            };
            match obj.next_pending(&mut self.codec, pool) {
                Some(TxPending::Info) => {
                    let info = obj.info.clone().expect("info pending implies info");
                    obj.mark_info_sent();
                    let fti = obj.layout.to_fti();
                    return Some(SenderEmit::Info(InfoMsg {
                        object_id,
                        flags: self.object_flags(object_id),
                        fti: Some(fti),
                        payload: info,
                    }));
                }
                Some(TxPending::Segment {
                    block_id,
                    segment_id,
                }) => {
                    let payload = match obj.read_segment(block_id, segment_id) {
                        Ok(p) => p,
                        Err(err) => {
                            warn!(object_id, block_id, segment_id, %err, "segment read failed");
                            obj.mark_segment_sent(block_id, segment_id);
                            continue;
                        }
                    };
                    let stream_flags = if obj.is_stream() {
                        obj.stream_segment_flags(block_id, segment_id)
                    } else {
                        0
                    };
                    obj.mark_segment_sent(block_id, segment_id);
                    let fti = obj.layout.to_fti();
                    let msg_flags = stream_flags | self.object_flags(object_id);
                    let fec_id = FecPayloadId::source(block_id, segment_id);
                    self.last_position = Some((object_id, fec_id));
                    self.stats.segments_sent += 1;
                    self.stats.bytes_sent += payload.len() as u64;
                    return Some(SenderEmit::Data(DataMsg {
                        object_id,
                        flags: msg_flags,
                        fec_id,
                        fti: Some(fti),
                        payload: Bytes::from(payload),
                    }));
                }
                Some(TxPending::Parity {
                    block_id,
                    segment_id,
                }) => {
                    let Some(shard) = obj
                        .block(block_id)
                        .and_then(|b| b.parity_shard(segment_id))
                        .map(|s| s.to_vec())
                    else {
                        continue;
                    };
                    let fti = obj.layout.to_fti();
                    let obj_flags = self.object_flags(object_id);
                    let fec_id = FecPayloadId::parity(block_id, segment_id);
                    self.last_position = Some((object_id, fec_id));
                    self.stats.auto_parity_sent += 1;
                    return Some(SenderEmit::Data(DataMsg {
                        object_id,
                        flags: obj_flags,
                        fec_id,
                        fti: Some(fti),
                        payload: Bytes::from(shard),
                    }));
                }
                None => {
                    // Initial pass finished for this object.
                    self.pending.pop_front();
                    let is_stream = obj.is_stream();
                    if !obj.fully_sent {
                        obj.fully_sent = true;
                        if !is_stream {
                            self.events.push(SenderEvent::ObjectSent { object_id });
                        }
                    }
                    if self.pending.is_empty() {
                        self.on_queue_idle(object_id);
                    }
                }
            }
        }
    }

    /// Queue drained: fire TX_QUEUE_EMPTY once and arm flush rounds.
    fn on_queue_idle(&mut self, last_object: u16) {
        if self.queue_empty_fired {
            return;
        }
        self.queue_empty_fired = true;
        self.events.push(SenderEvent::QueueEmpty);
        if !self.active_flush_armed {
            return;
        }
        self.active_flush_armed = false;
        let (object_id, fec_id) = self
            .last_position
            .unwrap_or((last_object, FecPayloadId::source(0, 0)));
        self.flush = Some(ActiveFlush {
            object_id,
            fec_id,
            remaining: self.config.robust_factor,
            next_cmd: Instant::now(),
            eot: false,
        });
    }

    /// Arm active flush explicitly (end of transmission, `eot = true`
    /// when the sender is closing).
    pub fn arm_flush(&mut self, eot: bool, now: Instant) {
        let Some((object_id, fec_id)) = self.last_position else {
            return;
        };
        self.flush = Some(ActiveFlush {
            object_id,
            fec_id,
            remaining: self.config.robust_factor,
            next_cmd: now,
            eot,
        });
    }

    fn object_flags(&self, object_id: u16) -> u8 {
        let Some(obj) = self.cache.get(object_id) else {
            return 0;
        };
        let mut f = 0;
        if obj.info.is_some() {
            f |= flags::INFO_PRESENT;
        }
        match obj.kind {
            ObjectKind::Stream => f |= flags::STREAM,
            ObjectKind::File => f |= flags::FILE,
            ObjectKind::Data => {}
        }
        f
    }

    /// Earliest deadline the sender needs a wakeup for.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |t: Instant| {
            next = Some(next.map_or(t, |n: Instant| n.min(t)));
        };
        if let RepairPhase::Collecting { activate_at } = self.repair {
            fold(activate_at);
        }
        if let Some(wm) = &self.watermark {
            if !wm.complete {
                fold(wm.next_cmd);
            }
        }
        if let Some(fl) = &self.flush {
            fold(fl.next_cmd);
        }
        next
    }

    /// Whether any transmission (control or data) is possibly pending.
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty()
            || !self.repair_plan.is_empty()
            || matches!(self.repair, RepairPhase::Collecting { .. })
            || self.squelch_pending.is_some()
            || self.watermark.as_ref().is_some_and(|w| !w.complete)
            || self.flush.is_some()
    }

    /// Release everything (sender stop).
    pub fn close(&mut self, pool: &mut SegmentPool) {
        let ids: Vec<u16> = self.cache.ids().to_vec();
        for id in ids {
            if let Some(mut obj) = self.cache.remove(id) {
                obj.release(pool);
            }
        }
        self.pending.clear();
        self.repair_plan.clear();
    }
}
