//! # Transmission Objects
//!
//! An object is the unit the application enqueues: a whole file, an
//! in-memory buffer, or an open-ended stream. Objects are partitioned into
//! coding blocks (see [`crate::block`]); object ids are 16-bit and wrap,
//! ordered by signed distance within a sender.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::block::{Bitmask, RxBlock, StoreOutcome, TxBlock};
use crate::fec::BlockCodec;
use crate::pool::SegmentPool;
use crate::stream::{StreamRx, StreamTx};
use crate::wire::{coalesce_segments, FtiExt, RepairRequest};

// ─── Object Id Arithmetic ────────────────────────────────────────────────────

/// Signed distance from `b` to `a` in the 16-bit wrapping id space.
pub fn object_id_delta(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Whether `a` precedes `b` modulo 2^16.
pub fn object_id_lt(a: u16, b: u16) -> bool {
    object_id_delta(a, b) < 0
}

/// Half the id space: ids further ahead than this are outside the sync
/// window and dropped.
pub const SYNC_WINDOW: i16 = i16::MAX;

// ─── Kinds & Modes ───────────────────────────────────────────────────────────

/// Object flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Data,
    Stream,
}

/// How aggressively a receiver repairs an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackingMode {
    /// Never NACK; decode whatever arrives.
    None,
    /// NACK only for the INFO segment.
    InfoOnly,
    /// Full repair.
    #[default]
    Normal,
}

// ─── Layout ──────────────────────────────────────────────────────────────────

/// Segmentation geometry of one object, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Object size in bytes; [`FtiExt::STREAM_SIZE`] for streams.
    pub object_size: u64,
    pub segment_size: u16,
    /// Source segments per block (k).
    pub block_len: u8,
    /// Parity segments per block (n).
    pub parity_len: u8,
}

impl ObjectLayout {
    pub fn from_fti(fti: &FtiExt) -> Self {
        ObjectLayout {
            object_size: fti.object_size,
            segment_size: fti.segment_size,
            block_len: fti.block_len,
            parity_len: fti.parity_len,
        }
    }

    pub fn to_fti(&self) -> FtiExt {
        FtiExt {
            object_size: self.object_size,
            segment_size: self.segment_size,
            block_len: self.block_len,
            parity_len: self.parity_len,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.object_size == FtiExt::STREAM_SIZE
    }

    fn block_span(&self) -> u64 {
        self.segment_size as u64 * self.block_len as u64
    }

    /// Number of blocks of a static object. Zero-length objects have none.
    pub fn block_count(&self) -> u32 {
        debug_assert!(!self.is_stream());
        self.object_size.div_ceil(self.block_span()) as u32
    }

    /// Source segments in the given block (the last block may be short).
    pub fn block_source_count(&self, block_id: u32) -> u16 {
        debug_assert!(!self.is_stream());
        let count = self.block_count();
        debug_assert!(block_id < count);
        if block_id + 1 < count {
            self.block_len as u16
        } else {
            let rem = self.object_size - block_id as u64 * self.block_span();
            rem.div_ceil(self.segment_size as u64) as u16
        }
    }

    /// Byte offset of a source segment within the object.
    pub fn segment_offset(&self, block_id: u32, segment_id: u8) -> u64 {
        block_id as u64 * self.block_span() + segment_id as u64 * self.segment_size as u64
    }

    /// Payload length of a source segment (the final one may be short).
    pub fn segment_len(&self, block_id: u32, segment_id: u8) -> usize {
        debug_assert!(!self.is_stream());
        let offset = self.segment_offset(block_id, segment_id);
        let rem = self.object_size.saturating_sub(offset);
        rem.min(self.segment_size as u64) as usize
    }

    /// The final (block, segment) position — the natural watermark point.
    pub fn final_position(&self) -> Option<(u32, u8)> {
        if self.is_stream() || self.object_size == 0 {
            return None;
        }
        let block = self.block_count() - 1;
        let seg = self.block_source_count(block) - 1;
        Some((block, seg as u8))
    }
}

// ─── File Backing ────────────────────────────────────────────────────────────

/// Random-access storage behind FILE objects. The engine reads/writes in
/// segment-sized chunks and never blocks on anything else.
pub trait FileBacking {
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

/// `std::fs` adapter for the common case.
pub struct FsFileBacking {
    file: std::fs::File,
    len: u64,
}

impl FsFileBacking {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let len = file.metadata().context("stat enqueued file")?.len();
        Ok(FsFileBacking { file, len })
    }

    pub fn create(path: &Path) -> Result<Self> {
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create {}", path.display()))?;
        Ok(FsFileBacking { file, len: 0 })
    }
}

impl FileBacking for FsFileBacking {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }
}

/// Growable in-memory backing; the default destination for received files
/// until the application attaches a real one.
#[derive(Default)]
pub struct MemoryBacking {
    data: Vec<u8>,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }
}

impl FileBacking for MemoryBacking {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let end = offset as usize + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

// ─── TxObject ────────────────────────────────────────────────────────────────

/// Content behind a transmit object.
pub enum TxContent {
    Data(Bytes),
    File(Box<dyn FileBacking>),
    Stream(StreamTx),
}

/// What the sender should transmit next for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPending {
    Info,
    Segment { block_id: u32, segment_id: u8 },
    Parity { block_id: u32, segment_id: u8 },
}

/// Sender-side object state.
pub struct TxObject {
    pub object_id: u16,
    pub kind: ObjectKind,
    pub layout: ObjectLayout,
    pub info: Option<Bytes>,
    info_sent: bool,
    content: TxContent,
    blocks: BTreeMap<u32, TxBlock>,
    /// Initial-pass cursor for static objects.
    next_block: u32,
    auto_parity: u16,
    /// First transmission finished (flush/watermark may begin).
    pub fully_sent: bool,
    /// First stream segment not yet flagged STREAM_START.
    stream_started: bool,
}

impl TxObject {
    pub fn new(
        object_id: u16,
        kind: ObjectKind,
        layout: ObjectLayout,
        info: Option<Bytes>,
        content: TxContent,
        auto_parity: u16,
    ) -> Self {
        TxObject {
            object_id,
            kind,
            layout,
            info,
            info_sent: false,
            content,
            blocks: BTreeMap::new(),
            next_block: 0,
            auto_parity,
            fully_sent: false,
            stream_started: false,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.content, TxContent::Stream(_))
    }

    pub fn stream(&mut self) -> Option<&mut StreamTx> {
        match &mut self.content {
            TxContent::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes this object pins in the transmit cache.
    pub fn cached_size(&self) -> u64 {
        match &self.content {
            TxContent::Data(d) => d.len() as u64,
            TxContent::File(f) => f.len(),
            TxContent::Stream(s) => (s.buffered_segments() * self.layout.segment_size as usize) as u64,
        }
    }

    /// Read a source segment's payload. Short reads happen only at the
    /// object tail.
    pub fn read_segment(&mut self, block_id: u32, segment_id: u8) -> Result<Vec<u8>> {
        match &mut self.content {
            TxContent::Data(data) => {
                let off = self.layout.segment_offset(block_id, segment_id) as usize;
                let len = self.layout.segment_len(block_id, segment_id);
                if off + len > data.len() {
                    bail!("segment {block_id}:{segment_id} outside object");
                }
                Ok(data[off..off + len].to_vec())
            }
            TxContent::File(file) => {
                let off = self.layout.segment_offset(block_id, segment_id);
                let len = self.layout.segment_len(block_id, segment_id);
                let mut buf = vec![0u8; len];
                let n = file.read_at(off, &mut buf).context("file segment read")?;
                if n != len {
                    bail!("short file read at {off}: {n} of {len}");
                }
                Ok(buf)
            }
            TxContent::Stream(stream) => {
                let abs = block_id as u64 * self.layout.block_len as u64 + segment_id as u64;
                stream
                    .segment(abs)
                    .map(|s| s.data.clone())
                    .context("stream segment no longer buffered")
            }
        }
    }

    /// Flags for a stream segment (EOM / MSG_START / STREAM_START),
    /// updating the started marker.
    pub fn stream_segment_flags(&mut self, block_id: u32, segment_id: u8) -> u8 {
        let mut flags = 0;
        let abs = block_id as u64 * self.layout.block_len as u64 + segment_id as u64;
        if let TxContent::Stream(stream) = &self.content {
            if let Some(seg) = stream.segment(abs) {
                if seg.eom {
                    flags |= crate::wire::flags::EOM;
                }
                if seg.msg_start {
                    flags |= crate::wire::flags::MSG_START;
                }
            }
        }
        if !self.stream_started {
            flags |= crate::wire::flags::STREAM_START;
            self.stream_started = true;
        }
        flags
    }

    /// Next item of the initial transmission pass. Auto-parity is
    /// generated on the way; a caller that takes a `Parity`/`Segment`
    /// entry is committed to transmitting it.
    pub fn next_pending(
        &mut self,
        codec: &mut BlockCodec,
        pool: &mut SegmentPool,
    ) -> Option<TxPending> {
        if self.info.is_some() && !self.info_sent {
            return Some(TxPending::Info);
        }
        if self.is_stream() {
            // Parity for freshly finished stream blocks goes out between
            // their sources and the next block's.
            if let Some(bid) = self.stream_parity_due() {
                match self.ensure_block_parity(bid, codec, pool) {
                    Ok(true) => {
                        if let Some(seg) =
                            self.blocks.get_mut(&bid).and_then(TxBlock::take_auto_parity)
                        {
                            return Some(TxPending::Parity {
                                block_id: bid,
                                segment_id: seg,
                            });
                        }
                    }
                    Ok(false) => {} // pool pressure — retry next tick
                    Err(err) => {
                        debug!(block_id = bid, %err, "stream parity generation failed");
                        if let Some(blk) = self.blocks.get_mut(&bid) {
                            blk.auto_parity_pending = 0;
                        }
                    }
                }
            }
            let k = self.layout.block_len as u64;
            let stream = self.stream().expect("is_stream checked");
            let abs = stream.next_pending()?;
            return Some(TxPending::Segment {
                block_id: (abs / k) as u32,
                segment_id: (abs % k) as u8,
            });
        }
        loop {
            let block_count = self.layout.block_count();
            let cursor = self.next_block;
            if cursor >= block_count {
                return None;
            }
            let layout = self.layout;
            let auto = self.auto_parity;
            let blk = self.blocks.entry(cursor).or_insert_with(|| {
                TxBlock::new(
                    cursor,
                    layout.block_source_count(cursor),
                    layout.parity_len as u16,
                    auto,
                )
            });
            if let Some(seg) = blk.next_pending_source() {
                return Some(TxPending::Segment {
                    block_id: cursor,
                    segment_id: seg,
                });
            }
            if blk.auto_parity_pending > 0 {
                match self.ensure_block_parity(cursor, codec, pool) {
                    Ok(true) => {
                        if let Some(seg) =
                            self.blocks.get_mut(&cursor).and_then(TxBlock::take_auto_parity)
                        {
                            return Some(TxPending::Parity {
                                block_id: cursor,
                                segment_id: seg,
                            });
                        }
                    }
                    Ok(false) => return None, // wait for pool space
                    Err(err) => {
                        debug!(block_id = cursor, %err, "parity generation failed");
                        if let Some(blk) = self.blocks.get_mut(&cursor) {
                            blk.auto_parity_pending = 0;
                        }
                    }
                }
                continue;
            }
            self.next_block += 1;
        }
    }

    /// A fully-sent stream block still owing auto parity, if any.
    fn stream_parity_due(&self) -> Option<u32> {
        if self.auto_parity == 0 || self.layout.parity_len == 0 {
            return None;
        }
        let TxContent::Stream(stream) = &self.content else {
            return None;
        };
        let k = self.layout.block_len as u64;
        let sent_blocks = stream.send_cursor() / k;
        // Only the recent window matters; older blocks slid away.
        for b in sent_blocks.saturating_sub(4)..sent_blocks {
            let bid = b as u32;
            match self.blocks.get(&bid) {
                Some(blk) if blk.auto_parity_pending > 0 => return Some(bid),
                Some(_) => {}
                None => {
                    if (0..k).all(|s| stream.segment(b * k + s).is_some()) {
                        return Some(bid);
                    }
                }
            }
        }
        None
    }

    pub fn mark_info_sent(&mut self) {
        self.info_sent = true;
    }

    /// INFO still owed, either first-pass or from a repair request.
    pub fn info_needs_repair(&self) -> bool {
        self.info.is_some() && !self.info_sent
    }

    pub fn mark_segment_sent(&mut self, block_id: u32, segment_id: u8) {
        match &mut self.content {
            TxContent::Stream(stream) => {
                let abs = block_id as u64 * self.layout.block_len as u64 + segment_id as u64;
                stream.mark_sent(abs);
            }
            _ => {
                if let Some(blk) = self.blocks.get_mut(&block_id) {
                    blk.mark_source_sent(segment_id);
                }
            }
        }
    }

    /// Whether the initial pass has anything left.
    pub fn has_pending(&self) -> bool {
        if self.info.is_some() && !self.info_sent {
            return true;
        }
        match &self.content {
            TxContent::Stream(stream) => {
                stream.next_pending().is_some() || self.stream_parity_due().is_some()
            }
            _ => {
                let block_count = self.layout.block_count();
                let cursor = self.next_block;
                if cursor >= block_count {
                    return false;
                }
                // The cursor block may be mid-pass; anything beyond it is
                // untouched by definition.
                cursor + 1 < block_count
                    || self.blocks.get(&cursor).map_or(true, TxBlock::has_pending)
            }
        }
    }

    /// Ensure a block exists and has its parity generated. Returns false
    /// when the pool cannot supply buffers yet.
    pub fn ensure_block_parity(
        &mut self,
        block_id: u32,
        codec: &mut BlockCodec,
        pool: &mut SegmentPool,
    ) -> Result<bool> {
        if self.layout.parity_len == 0 {
            return Ok(true);
        }
        let source_count = self.block_source_count_for(block_id);
        let Some(source_count) = source_count else {
            return Ok(true);
        };
        // Gather source shards (scratch; freed on return).
        let width = pool.shard_width_bytes();
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(source_count as usize);
        for seg in 0..source_count {
            let payload = self.read_segment(block_id, seg as u8)?;
            let mut shard = vec![0u8; width];
            shard[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            shard[2..2 + payload.len()].copy_from_slice(&payload);
            shards.push(shard);
        }
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let layout = self.layout;
        let auto = self.auto_parity;
        let blk = self.blocks.entry(block_id).or_insert_with(|| {
            TxBlock::new(block_id, source_count, layout.parity_len as u16, auto)
        });
        blk.ensure_parity(codec, &refs, pool)
    }

    fn block_source_count_for(&self, block_id: u32) -> Option<u16> {
        match &self.content {
            TxContent::Stream(_) => Some(self.layout.block_len as u16),
            _ => (block_id < self.layout.block_count())
                .then(|| self.layout.block_source_count(block_id)),
        }
    }

    /// Route a repair request into the affected block(s).
    pub fn merge_repair(&mut self, request: &RepairRequest) {
        match *request {
            RepairRequest::Info { .. } => {
                self.info_sent = false;
            }
            RepairRequest::Object { .. } => {
                self.info_sent = self.info.is_none();
                for b in self.all_block_ids() {
                    if let Some(blk) = self.block_entry(b) {
                        blk.merge_repair_all();
                    }
                }
            }
            RepairRequest::Blocks { start, count, .. } => {
                for b in start..start.saturating_add(count) {
                    if let Some(blk) = self.block_entry(b) {
                        blk.merge_repair_all();
                    }
                }
            }
            RepairRequest::Segments {
                block_id,
                start,
                count,
                ..
            } => {
                if let Some(blk) = self.block_entry(block_id) {
                    blk.merge_repair(start as usize, count as usize);
                }
            }
        }
    }

    fn all_block_ids(&self) -> Vec<u32> {
        match &self.content {
            TxContent::Stream(_) => self.blocks.keys().copied().collect(),
            _ => (0..self.layout.block_count()).collect(),
        }
    }

    fn block_entry(&mut self, block_id: u32) -> Option<&mut TxBlock> {
        let source_count = self.block_source_count_for(block_id)?;
        if let TxContent::Stream(stream) = &self.content {
            // Repair only what the ring still holds.
            let base = block_id as u64 * self.layout.block_len as u64;
            if stream.segment(base).is_none() {
                debug!(block_id, "stream repair request past buffer, ignored");
                return None;
            }
        }
        let layout = self.layout;
        let auto = self.auto_parity;
        Some(self.blocks.entry(block_id).or_insert_with(|| {
            let mut blk = TxBlock::new(block_id, source_count, layout.parity_len as u16, auto);
            // A repair-created block is past its initial pass.
            while let Some(s) = blk.next_pending_source() {
                blk.mark_source_sent(s);
            }
            blk.auto_parity_pending = 0;
            blk
        }))
    }

    /// Blocks with aggregated repair state.
    pub fn repair_block_ids(&self) -> Vec<u32> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.repair_pending())
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn block(&self, block_id: u32) -> Option<&TxBlock> {
        self.blocks.get(&block_id)
    }

    pub fn block_mut(&mut self, block_id: u32) -> Option<&mut TxBlock> {
        self.blocks.get_mut(&block_id)
    }

    /// Reset to pending for a fresh full transmission (requeue). Parity
    /// already generated is kept.
    pub fn requeue(&mut self) -> Result<()> {
        if self.is_stream() {
            bail!("streams cannot be requeued");
        }
        self.info_sent = false;
        self.next_block = 0;
        self.fully_sent = false;
        let auto = self.auto_parity;
        for blk in self.blocks.values_mut() {
            blk.reset_for_requeue(auto);
        }
        Ok(())
    }

    /// Release all pooled buffers (on purge/cancel).
    pub fn release(&mut self, pool: &mut SegmentPool) {
        for blk in self.blocks.values_mut() {
            blk.release(pool);
        }
        self.blocks.clear();
    }
}

// ─── Transmit Cache ──────────────────────────────────────────────────────────

/// Bounds on the sender's object retention.
#[derive(Debug, Clone, Copy)]
pub struct TxCacheBounds {
    pub count_min: usize,
    pub count_max: usize,
    pub size_max: u64,
}

impl Default for TxCacheBounds {
    fn default() -> Self {
        TxCacheBounds {
            count_min: 8,
            count_max: 256,
            size_max: 20 * 1024 * 1024,
        }
    }
}

/// Ordered cache of transmit objects. Evicts oldest-first when either
/// bound is exceeded, but never below `count_min` most recent objects.
pub struct TxCache {
    order: Vec<u16>,
    map: std::collections::HashMap<u16, TxObject>,
    bounds: TxCacheBounds,
}

impl TxCache {
    pub fn new(bounds: TxCacheBounds) -> Self {
        TxCache {
            order: Vec::new(),
            map: std::collections::HashMap::new(),
            bounds,
        }
    }

    pub fn set_bounds(&mut self, bounds: TxCacheBounds) {
        self.bounds = bounds;
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.map.values().map(|o| o.cached_size()).sum()
    }

    pub fn contains(&self, object_id: u16) -> bool {
        self.map.contains_key(&object_id)
    }

    pub fn get(&self, object_id: u16) -> Option<&TxObject> {
        self.map.get(&object_id)
    }

    pub fn get_mut(&mut self, object_id: u16) -> Option<&mut TxObject> {
        self.map.get_mut(&object_id)
    }

    /// Oldest retained object id — the squelch horizon.
    pub fn oldest_id(&self) -> Option<u16> {
        self.order.first().copied()
    }

    pub fn ids(&self) -> &[u16] {
        &self.order
    }

    /// Insert a new object, evicting as needed. Returns evicted objects so
    /// the caller can fire purge events and release their buffers.
    pub fn insert(&mut self, object: TxObject) -> Vec<TxObject> {
        let id = object.object_id;
        self.order.push(id);
        self.map.insert(id, object);
        self.evict()
    }

    fn evict(&mut self) -> Vec<TxObject> {
        let mut purged = Vec::new();
        while self.order.len() > self.bounds.count_min
            && (self.order.len() > self.bounds.count_max || self.total_size() > self.bounds.size_max)
        {
            let oldest = self.order.remove(0);
            if let Some(obj) = self.map.remove(&oldest) {
                debug!(object_id = oldest, "transmit cache purge");
                purged.push(obj);
            }
        }
        purged
    }

    pub fn remove(&mut self, object_id: u16) -> Option<TxObject> {
        self.order.retain(|&id| id != object_id);
        self.map.remove(&object_id)
    }
}

// ─── RxObject ────────────────────────────────────────────────────────────────

/// Content destination behind a receive object.
pub enum RxContent {
    Data(BytesMut),
    File(Box<dyn FileBacking>),
    Stream(StreamRx),
}

/// Effect of storing one arriving segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStoreOutcome {
    Ignored,
    Duplicate,
    NoBuffers,
    Stored,
    BlockCompleted,
    ObjectCompleted,
}

/// Receiver-side object state.
pub struct RxObject {
    pub object_id: u16,
    pub kind: ObjectKind,
    pub layout: ObjectLayout,
    pub info: Option<Bytes>,
    /// The sender advertises INFO via a DATA flag.
    pub info_expected: bool,
    pub nacking_mode: NackingMode,
    content: RxContent,
    blocks: BTreeMap<u32, RxBlock>,
    /// Completed blocks of a static object.
    completed_blocks: Bitmask,
    completed_count: u32,
    /// Highest block with any segment heard.
    max_block_heard: Option<u32>,
    /// Highest completed block (repair-boundary squelch point).
    pub max_completed_block: Option<u32>,
    pub completed: bool,
    pub aborted: bool,
    /// Completion event already surfaced (ordered delivery bookkeeping).
    pub delivered: bool,
}

impl RxObject {
    pub fn new(
        object_id: u16,
        kind: ObjectKind,
        layout: ObjectLayout,
        nacking_mode: NackingMode,
        stream_buffer: usize,
    ) -> Self {
        let content = match kind {
            ObjectKind::Stream => {
                RxContent::Stream(StreamRx::new(stream_buffer, layout.segment_size as usize))
            }
            ObjectKind::File => RxContent::File(Box::new(MemoryBacking::new())),
            ObjectKind::Data => {
                let mut data = BytesMut::new();
                data.resize(layout.object_size as usize, 0);
                RxContent::Data(data)
            }
        };
        let block_count = if layout.is_stream() { 0 } else { layout.block_count() };
        RxObject {
            object_id,
            kind,
            layout,
            info: None,
            info_expected: false,
            nacking_mode,
            content,
            blocks: BTreeMap::new(),
            completed_blocks: Bitmask::new(block_count as usize),
            completed_count: 0,
            max_block_heard: None,
            max_completed_block: None,
            completed: block_count == 0 && kind != ObjectKind::Stream,
            aborted: false,
            delivered: false,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.content, RxContent::Stream(_))
    }

    pub fn stream(&mut self) -> Option<&mut StreamRx> {
        match &mut self.content {
            RxContent::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Replace the default in-memory file destination. Only sensible
    /// before any data has been written (i.e., right after RX_OBJECT_NEW).
    pub fn attach_file_backing(&mut self, backing: Box<dyn FileBacking>) -> Result<()> {
        match &mut self.content {
            RxContent::File(slot) => {
                *slot = backing;
                Ok(())
            }
            _ => bail!("not a file object"),
        }
    }

    /// Completed DATA object payload.
    pub fn payload(&self) -> Option<Bytes> {
        match &self.content {
            RxContent::Data(data) if self.completed => Some(Bytes::copy_from_slice(data)),
            _ => None,
        }
    }

    pub fn store_info(&mut self, payload: &[u8]) -> bool {
        if self.info.is_some() {
            return false;
        }
        self.info = Some(Bytes::copy_from_slice(payload));
        true
    }

    /// Store one arriving segment and drive decode/completion.
    pub fn store_segment(
        &mut self,
        fec_id: crate::wire::FecPayloadId,
        msg_flags: u8,
        payload: &[u8],
        pool: &mut SegmentPool,
        codec: &mut BlockCodec,
    ) -> RxStoreOutcome {
        if msg_flags & crate::wire::flags::INFO_PRESENT != 0 {
            self.info_expected = true;
        }
        if self.completed {
            return RxStoreOutcome::Duplicate;
        }
        let block_id = fec_id.block_id;
        if !self.is_stream() {
            if block_id >= self.layout.block_count() {
                return RxStoreOutcome::Ignored;
            }
            if self.completed_blocks.test(block_id as usize) {
                return RxStoreOutcome::Duplicate;
            }
        }

        let layout = self.layout;
        let source_count = if self.is_stream() {
            layout.block_len as u16
        } else {
            layout.block_source_count(block_id)
        };
        let blk = self
            .blocks
            .entry(block_id)
            .or_insert_with(|| RxBlock::new(block_id, source_count, layout.parity_len as u16));

        let outcome = if fec_id.parity {
            blk.store_parity(fec_id.segment_id, payload, pool)
        } else {
            blk.store_source(fec_id.segment_id, payload, pool)
        };
        match outcome {
            StoreOutcome::Stored => {}
            StoreOutcome::Duplicate => return RxStoreOutcome::Duplicate,
            StoreOutcome::NoBuffers => return RxStoreOutcome::NoBuffers,
            StoreOutcome::OutOfRange => return RxStoreOutcome::Ignored,
        }
        self.max_block_heard = Some(self.max_block_heard.map_or(block_id, |m| m.max(block_id)));

        // Stream source segments flow straight into the read ring.
        if !fec_id.parity {
            if let RxContent::Stream(ring) = &mut self.content {
                let abs = block_id as u64 * layout.block_len as u64 + fec_id.segment_id as u64;
                let blk_ref = self.blocks.get(&block_id).expect("just inserted");
                if let Some(data) = blk_ref.source_payload(fec_id.segment_id) {
                    ring.insert(
                        abs,
                        data.to_vec(),
                        msg_flags & crate::wire::flags::EOM != 0,
                        msg_flags & crate::wire::flags::MSG_START != 0,
                    );
                }
            }
        }

        self.advance_block(block_id, pool, codec)
    }

    /// Decode/complete bookkeeping after a store.
    fn advance_block(
        &mut self,
        block_id: u32,
        pool: &mut SegmentPool,
        codec: &mut BlockCodec,
    ) -> RxStoreOutcome {
        let Some(blk) = self.blocks.get_mut(&block_id) else {
            return RxStoreOutcome::Stored;
        };
        if !blk.is_decodable() {
            return RxStoreOutcome::Stored;
        }
        match blk.try_decode(codec, pool) {
            Ok(recovered) => {
                if self.is_stream() && recovered > 0 {
                    // Feed recovered stream segments into the ring.
                    let k = self.layout.block_len as u64;
                    let mut inserts: Vec<(u64, Vec<u8>)> = Vec::new();
                    {
                        let blk = self.blocks.get(&block_id).expect("present");
                        for seg in 0..blk.source_count {
                            if let Some(data) = blk.source_payload(seg as u8) {
                                inserts.push((block_id as u64 * k + seg as u64, data.to_vec()));
                            }
                        }
                    }
                    if let RxContent::Stream(ring) = &mut self.content {
                        // Framing flags live in headers, outside FEC:
                        // recovered segments carry bytes only.
                        for (abs, data) in inserts {
                            ring.insert(abs, data, false, false);
                        }
                    }
                }
            }
            Err(err) => {
                debug!(block_id, %err, "block decode failed");
                return RxStoreOutcome::Stored;
            }
        }
        let blk = self.blocks.get(&block_id).expect("present");
        if !blk.source_complete() {
            return RxStoreOutcome::Stored;
        }
        self.finish_block(block_id, pool)
    }

    /// Copy a finished block into the content destination and retire it.
    fn finish_block(&mut self, block_id: u32, pool: &mut SegmentPool) -> RxStoreOutcome {
        let mut blk = self.blocks.remove(&block_id).expect("present");
        let layout = self.layout;
        match &mut self.content {
            RxContent::Data(data) => {
                for seg in 0..blk.source_count {
                    let payload = blk.source_payload(seg as u8).expect("complete");
                    let off = layout.segment_offset(block_id, seg as u8) as usize;
                    data[off..off + payload.len()].copy_from_slice(payload);
                }
            }
            RxContent::File(file) => {
                for seg in 0..blk.source_count {
                    let payload = blk.source_payload(seg as u8).expect("complete");
                    let off = layout.segment_offset(block_id, seg as u8);
                    if let Err(err) = file.write_at(off, payload) {
                        debug!(block_id, %err, "file write failed");
                    }
                }
            }
            RxContent::Stream(_) => {
                // Stream data already flowed into the ring.
            }
        }
        blk.release(pool);
        if self.is_stream() {
            return RxStoreOutcome::BlockCompleted;
        }
        self.completed_blocks.set(block_id as usize);
        self.completed_count += 1;
        self.max_completed_block =
            Some(self.max_completed_block.map_or(block_id, |m| m.max(block_id)));
        if self.completed_count >= self.layout.block_count() {
            self.completed = true;
            RxStoreOutcome::ObjectCompleted
        } else {
            RxStoreOutcome::BlockCompleted
        }
    }

    /// Build this object's repair needs, honoring the nacking mode and an
    /// optional repair-boundary floor (blocks below it are too old).
    pub fn repair_needs(&self, block_floor: Option<u32>) -> Vec<RepairRequest> {
        let mut needs = Vec::new();
        match self.nacking_mode {
            NackingMode::None => return needs,
            NackingMode::InfoOnly => {
                if self.info_expected && self.info.is_none() {
                    needs.push(RepairRequest::Info {
                        object_id: self.object_id,
                    });
                }
                return needs;
            }
            NackingMode::Normal => {}
        }
        if self.info_expected && self.info.is_none() {
            needs.push(RepairRequest::Info {
                object_id: self.object_id,
            });
        }
        if self.completed {
            return needs;
        }
        let Some(ceiling) = self.max_block_heard else {
            return needs;
        };
        let floor = block_floor.unwrap_or(0);

        if !self.is_stream() {
            // Wholly-missing blocks below the ceiling.
            let mut run_start: Option<u32> = None;
            for b in floor..ceiling {
                let missing =
                    !self.completed_blocks.test(b as usize) && !self.blocks.contains_key(&b);
                match (missing, run_start) {
                    (true, None) => run_start = Some(b),
                    (false, Some(start)) => {
                        needs.push(RepairRequest::Blocks {
                            object_id: self.object_id,
                            start,
                            count: b - start,
                        });
                        run_start = None;
                    }
                    _ => {}
                }
            }
            if let Some(start) = run_start {
                needs.push(RepairRequest::Blocks {
                    object_id: self.object_id,
                    start,
                    count: ceiling - start,
                });
            }
        }

        // Erasures of partially received blocks.
        for (&bid, blk) in &self.blocks {
            if bid < floor {
                continue;
            }
            let erasures = if bid == ceiling {
                // Freshest block: only segments provably lost (a later
                // segment of the block arrived past them).
                let heard = blk.heard_ceiling();
                blk.erasures_needed()
                    .into_iter()
                    .filter(|&s| (s as u16) < heard)
                    .collect()
            } else {
                blk.erasures_needed()
            };
            needs.extend(coalesce_segments(self.object_id, bid, &erasures));
        }
        needs
    }

    /// Fold a sender-announced transmit position (flush point) into gap
    /// detection: everything at or before it is now provably sent.
    pub fn note_tx_position(&mut self, block_id: u32, segment_id: u8) {
        if self.completed {
            return;
        }
        let block_id = if self.is_stream() {
            block_id
        } else {
            block_id.min(self.layout.block_count().saturating_sub(1))
        };
        self.max_block_heard = Some(self.max_block_heard.map_or(block_id, |m| m.max(block_id)));
        if let Some(blk) = self.blocks.get_mut(&block_id) {
            blk.note_heard(segment_id);
        }
    }

    /// Drop stream FEC blocks that slid out of the window.
    pub fn prune_stream_blocks(&mut self, pool: &mut SegmentPool, window_blocks: u32) {
        if !self.is_stream() {
            return;
        }
        let Some(max) = self.max_block_heard else {
            return;
        };
        let floor = max.saturating_sub(window_blocks);
        let stale: Vec<u32> = self.blocks.range(..floor).map(|(&b, _)| b).collect();
        for b in stale {
            if let Some(mut blk) = self.blocks.remove(&b) {
                blk.release(pool);
            }
        }
    }

    /// Release every pooled buffer (abort/cancel/final release).
    pub fn release(&mut self, pool: &mut SegmentPool) {
        for blk in self.blocks.values_mut() {
            blk.release(pool);
        }
        self.blocks.clear();
    }

    pub fn bytes_pending(&self) -> u64 {
        if self.completed || self.is_stream() {
            return 0;
        }
        let done: u64 = (0..self.layout.block_count())
            .filter(|&b| self.completed_blocks.test(b as usize))
            .map(|b| {
                (0..self.layout.block_source_count(b))
                    .map(|s| self.layout.segment_len(b, s as u8) as u64)
                    .sum::<u64>()
            })
            .sum();
        self.layout.object_size.saturating_sub(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FecPayloadId;

    // ─── Id arithmetic ──────────────────────────────────────────────────

    #[test]
    fn object_id_ordering_wraps() {
        assert!(object_id_lt(1, 2));
        assert!(object_id_lt(65535, 0), "wrap: 65535 precedes 0");
        assert!(object_id_lt(65000, 100));
        assert!(!object_id_lt(100, 65000));
        assert_eq!(object_id_delta(0, 65535), 1);
        assert_eq!(object_id_delta(65535, 0), -1);
    }

    // ─── Layout ─────────────────────────────────────────────────────────

    #[test]
    fn layout_block_geometry() {
        let layout = ObjectLayout {
            object_size: 10_000,
            segment_size: 1000,
            block_len: 4,
            parity_len: 2,
        };
        // 10 segments of 1000 → 3 blocks: 4 + 4 + 2.
        assert_eq!(layout.block_count(), 3);
        assert_eq!(layout.block_source_count(0), 4);
        assert_eq!(layout.block_source_count(2), 2);
        assert_eq!(layout.segment_len(2, 1), 1000);
        assert_eq!(layout.final_position(), Some((2, 1)));
    }

    #[test]
    fn layout_short_tail_segment() {
        let layout = ObjectLayout {
            object_size: 2500,
            segment_size: 1000,
            block_len: 4,
            parity_len: 0,
        };
        assert_eq!(layout.block_count(), 1);
        assert_eq!(layout.block_source_count(0), 3);
        assert_eq!(layout.segment_len(0, 2), 500);
    }

    #[test]
    fn layout_zero_size() {
        let layout = ObjectLayout {
            object_size: 0,
            segment_size: 1000,
            block_len: 4,
            parity_len: 0,
        };
        assert_eq!(layout.block_count(), 0);
        assert_eq!(layout.final_position(), None);
    }

    // ─── TxObject ───────────────────────────────────────────────────────

    fn data_tx_object(size: usize, auto_parity: u16) -> TxObject {
        let layout = ObjectLayout {
            object_size: size as u64,
            segment_size: 100,
            block_len: 4,
            parity_len: 2,
        };
        TxObject::new(
            1,
            ObjectKind::Data,
            layout,
            None,
            TxContent::Data(Bytes::from(vec![0xAB; size])),
            auto_parity,
        )
    }

    fn tx_tools() -> (SegmentPool, BlockCodec) {
        let pool = SegmentPool::new(64, 100);
        let codec = BlockCodec::new(SegmentPool::shard_width(100)).unwrap();
        (pool, codec)
    }

    #[test]
    fn tx_initial_pass_walks_segments_in_order() {
        let (mut pool, mut codec) = tx_tools();
        let mut obj = data_tx_object(350, 0);
        let mut seen = Vec::new();
        while let Some(p) = obj.next_pending(&mut codec, &mut pool) {
            match p {
                TxPending::Segment {
                    block_id,
                    segment_id,
                } => {
                    seen.push((block_id, segment_id));
                    obj.mark_segment_sent(block_id, segment_id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn tx_auto_parity_follows_block_sources() {
        let (mut pool, mut codec) = tx_tools();
        let mut obj = data_tx_object(800, 1); // 8 segs → 2 blocks of 4
        let mut sequence = Vec::new();
        while let Some(p) = obj.next_pending(&mut codec, &mut pool) {
            if let TxPending::Segment {
                block_id,
                segment_id,
            } = p
            {
                obj.mark_segment_sent(block_id, segment_id);
                sequence.push((block_id, false));
            } else if let TxPending::Parity { block_id, .. } = p {
                sequence.push((block_id, true));
            }
        }
        // Block 0's parity precedes block 1's sources.
        assert_eq!(
            sequence,
            vec![
                (0, false),
                (0, false),
                (0, false),
                (0, false),
                (0, true),
                (1, false),
                (1, false),
                (1, false),
                (1, false),
                (1, true),
            ]
        );
    }

    #[test]
    fn tx_info_goes_first() {
        let (mut pool, mut codec) = tx_tools();
        let layout = ObjectLayout {
            object_size: 100,
            segment_size: 100,
            block_len: 4,
            parity_len: 0,
        };
        let mut obj = TxObject::new(
            1,
            ObjectKind::Data,
            layout,
            Some(Bytes::from_static(b"meta")),
            TxContent::Data(Bytes::from(vec![0; 100])),
            0,
        );
        assert_eq!(obj.next_pending(&mut codec, &mut pool), Some(TxPending::Info));
        obj.mark_info_sent();
        assert!(matches!(
            obj.next_pending(&mut codec, &mut pool),
            Some(TxPending::Segment { .. })
        ));
    }

    #[test]
    fn tx_read_segment_content() {
        let data: Vec<u8> = (0..=255u8).cycle().take(350).collect();
        let layout = ObjectLayout {
            object_size: 350,
            segment_size: 100,
            block_len: 4,
            parity_len: 0,
        };
        let mut obj = TxObject::new(
            1,
            ObjectKind::Data,
            layout,
            None,
            TxContent::Data(Bytes::from(data.clone())),
            0,
        );
        assert_eq!(obj.read_segment(0, 0).unwrap(), &data[0..100]);
        assert_eq!(obj.read_segment(0, 3).unwrap(), &data[300..350]);
    }

    #[test]
    fn tx_repair_request_routing() {
        let (mut pool, mut codec) = tx_tools();
        let mut obj = data_tx_object(1000, 0);
        // Walk the initial pass so blocks exist.
        while let Some(p) = obj.next_pending(&mut codec, &mut pool) {
            if let TxPending::Segment {
                block_id,
                segment_id,
            } = p
            {
                obj.mark_segment_sent(block_id, segment_id);
            }
        }
        obj.merge_repair(&RepairRequest::Segments {
            object_id: 1,
            block_id: 1,
            start: 2,
            count: 2,
        });
        assert_eq!(obj.repair_block_ids(), vec![1]);
    }

    #[test]
    fn tx_repair_for_untransmitted_block_creates_state() {
        let mut obj = data_tx_object(1000, 0);
        obj.merge_repair(&RepairRequest::Blocks {
            object_id: 1,
            start: 0,
            count: 1,
        });
        assert_eq!(obj.repair_block_ids(), vec![0]);
    }

    #[test]
    fn tx_requeue_resets_pass() {
        let (mut pool, mut codec) = tx_tools();
        let mut obj = data_tx_object(350, 0);
        while let Some(p) = obj.next_pending(&mut codec, &mut pool) {
            if let TxPending::Segment {
                block_id,
                segment_id,
            } = p
            {
                obj.mark_segment_sent(block_id, segment_id);
            }
        }
        assert!(obj.next_pending(&mut codec, &mut pool).is_none());
        assert!(!obj.has_pending());
        obj.requeue().unwrap();
        assert!(obj.has_pending());
        assert!(matches!(
            obj.next_pending(&mut codec, &mut pool),
            Some(TxPending::Segment {
                block_id: 0,
                segment_id: 0
            })
        ));
    }

    // ─── TxCache ────────────────────────────────────────────────────────

    #[test]
    fn cache_evicts_by_count_but_respects_min() {
        let mut cache = TxCache::new(TxCacheBounds {
            count_min: 2,
            count_max: 3,
            size_max: u64::MAX,
        });
        let mut purged_total = 0;
        for id in 0..5u16 {
            let mut obj = data_tx_object(100, 0);
            obj.object_id = id;
            purged_total += cache.insert(obj).len();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(purged_total, 2);
        assert_eq!(cache.oldest_id(), Some(2));
    }

    #[test]
    fn cache_evicts_by_size() {
        let mut cache = TxCache::new(TxCacheBounds {
            count_min: 1,
            count_max: 100,
            size_max: 1000,
        });
        for id in 0..4u16 {
            let mut obj = data_tx_object(400, 0);
            obj.object_id = id;
            cache.insert(obj);
        }
        assert!(cache.total_size() <= 1000 || cache.len() == 1);
        assert!(cache.len() < 4);
    }

    #[test]
    fn cache_never_below_count_min() {
        let mut cache = TxCache::new(TxCacheBounds {
            count_min: 2,
            count_max: 10,
            size_max: 1, // everything over budget
        });
        for id in 0..4u16 {
            let mut obj = data_tx_object(500, 0);
            obj.object_id = id;
            cache.insert(obj);
        }
        assert_eq!(cache.len(), 2, "size pressure must not evict below min");
    }

    // ─── RxObject ───────────────────────────────────────────────────────

    fn rx_fixture(size: u64) -> (RxObject, SegmentPool, BlockCodec) {
        let layout = ObjectLayout {
            object_size: size,
            segment_size: 100,
            block_len: 4,
            parity_len: 2,
        };
        let pool = SegmentPool::new(64, 100);
        let codec = BlockCodec::new(SegmentPool::shard_width(100)).unwrap();
        (
            RxObject::new(7, ObjectKind::Data, layout, NackingMode::Normal, 0),
            pool,
            codec,
        )
    }

    #[test]
    fn rx_object_completes_in_order() {
        let (mut obj, mut pool, mut codec) = rx_fixture(350);
        let mut last = RxStoreOutcome::Stored;
        for seg in 0..4u8 {
            let len = if seg == 3 { 50 } else { 100 };
            last = obj.store_segment(
                FecPayloadId::source(0, seg),
                0,
                &vec![seg; len],
                &mut pool,
                &mut codec,
            );
        }
        assert_eq!(last, RxStoreOutcome::ObjectCompleted);
        assert!(obj.completed);
        let payload = obj.payload().unwrap();
        assert_eq!(payload.len(), 350);
        assert_eq!(&payload[300..], &[3u8; 50][..]);
        // All pooled buffers returned.
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rx_duplicate_segments_flagged() {
        let (mut obj, mut pool, mut codec) = rx_fixture(350);
        obj.store_segment(FecPayloadId::source(0, 0), 0, &[1; 100], &mut pool, &mut codec);
        let again =
            obj.store_segment(FecPayloadId::source(0, 0), 0, &[1; 100], &mut pool, &mut codec);
        assert_eq!(again, RxStoreOutcome::Duplicate);
    }

    #[test]
    fn rx_repair_needs_cover_gaps() {
        let (mut obj, mut pool, mut codec) = rx_fixture(1000);
        // 1000 bytes → 10 segs → blocks: 4+4+2. Hear only block 2.
        obj.store_segment(FecPayloadId::source(2, 0), 0, &[0; 100], &mut pool, &mut codec);
        let needs = obj.repair_needs(None);
        assert!(needs.contains(&RepairRequest::Blocks {
            object_id: 7,
            start: 0,
            count: 2
        }));
    }

    #[test]
    fn rx_repair_needs_respect_boundary_floor() {
        let (mut obj, mut pool, mut codec) = rx_fixture(1000);
        obj.store_segment(FecPayloadId::source(2, 0), 0, &[0; 100], &mut pool, &mut codec);
        let needs = obj.repair_needs(Some(2));
        assert!(
            !needs
                .iter()
                .any(|r| matches!(r, RepairRequest::Blocks { .. })),
            "blocks below the floor are squelched: {needs:?}"
        );
    }

    #[test]
    fn rx_repair_needs_partial_block_erasures() {
        let (mut obj, mut pool, mut codec) = rx_fixture(1000);
        // Block 0: hear segments 0 and 3 → erasures 1, 2 (ceiling 4).
        obj.store_segment(FecPayloadId::source(0, 0), 0, &[0; 100], &mut pool, &mut codec);
        obj.store_segment(FecPayloadId::source(0, 3), 0, &[3; 100], &mut pool, &mut codec);
        let needs = obj.repair_needs(None);
        assert_eq!(
            needs,
            vec![RepairRequest::Segments {
                object_id: 7,
                block_id: 0,
                start: 1,
                count: 2
            }]
        );
    }

    #[test]
    fn rx_nacking_mode_none_is_silent() {
        let (mut obj, mut pool, mut codec) = rx_fixture(1000);
        obj.nacking_mode = NackingMode::None;
        obj.store_segment(FecPayloadId::source(2, 0), 0, &[0; 100], &mut pool, &mut codec);
        assert!(obj.repair_needs(None).is_empty());
    }

    #[test]
    fn rx_info_only_requests_just_info() {
        let (mut obj, mut pool, mut codec) = rx_fixture(1000);
        obj.nacking_mode = NackingMode::InfoOnly;
        obj.store_segment(
            FecPayloadId::source(2, 0),
            crate::wire::flags::INFO_PRESENT,
            &[0; 100],
            &mut pool,
            &mut codec,
        );
        let needs = obj.repair_needs(None);
        assert_eq!(needs, vec![RepairRequest::Info { object_id: 7 }]);
    }

    #[test]
    fn rx_zero_length_object_completes_immediately() {
        let layout = ObjectLayout {
            object_size: 0,
            segment_size: 100,
            block_len: 4,
            parity_len: 0,
        };
        let obj = RxObject::new(1, ObjectKind::Data, layout, NackingMode::Normal, 0);
        assert!(obj.completed);
    }

    #[test]
    fn rx_parity_completes_block() {
        let (mut obj, mut pool, mut codec) = rx_fixture(400);
        // Sender-side parity for the single block.
        let data: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 100]).collect();
        let width = pool.shard_width_bytes();
        let shards: Vec<Vec<u8>> = data
            .iter()
            .map(|d| {
                let mut s = vec![0u8; width];
                s[..2].copy_from_slice(&(d.len() as u16).to_be_bytes());
                s[2..2 + d.len()].copy_from_slice(d);
                s
            })
            .collect();
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(2, &refs).unwrap();

        obj.store_segment(FecPayloadId::source(0, 0), 0, &data[0], &mut pool, &mut codec);
        obj.store_segment(FecPayloadId::source(0, 2), 0, &data[2], &mut pool, &mut codec);
        obj.store_segment(FecPayloadId::parity(0, 0), 0, &parity[0], &mut pool, &mut codec);
        let last =
            obj.store_segment(FecPayloadId::parity(0, 1), 0, &parity[1], &mut pool, &mut codec);
        assert_eq!(last, RxStoreOutcome::ObjectCompleted);
        let payload = obj.payload().unwrap();
        assert_eq!(&payload[100..200], &[1u8; 100][..]);
        assert_eq!(&payload[300..400], &[3u8; 100][..]);
    }
}
