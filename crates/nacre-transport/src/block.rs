//! # Coding Blocks
//!
//! A block is the FEC coding unit: up to `k` source segments plus up to
//! `n` parity segments. The sender tracks per-block transmit/repair state
//! in [`TxBlock`]; the receiver reassembles into [`RxBlock`] and decodes
//! once any `k` of the `k + n` segments have arrived.

use crate::fec::BlockCodec;
use crate::pool::{SegmentBuf, SegmentPool};

// ─── Bitmask ─────────────────────────────────────────────────────────────────

/// Fixed-length bit set for per-segment bookkeeping.
#[derive(Debug, Clone)]
pub struct Bitmask {
    bits: Vec<u64>,
    len: usize,
}

impl Bitmask {
    pub fn new(len: usize) -> Self {
        Bitmask {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `i`; returns true if it was previously clear.
    pub fn set(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (word, bit) = (i / 64, 1u64 << (i % 64));
        let was_clear = self.bits[word] & bit == 0;
        self.bits[word] |= bit;
        was_clear
    }

    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.bits[i / 64] &= !(1u64 << (i % 64));
    }

    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.bits[i / 64] & (1u64 << (i % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn set_all(&mut self) {
        for i in 0..self.len {
            self.set(i);
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|&w| w != 0)
    }

    /// Lowest set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.iter_set().next()
    }

    /// Iterate set bit indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.test(i))
    }

    /// Iterate clear bit indices in ascending order.
    pub fn iter_clear(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| !self.test(i))
    }

    /// Union another mask of the same length into this one.
    pub fn union(&mut self, other: &Bitmask) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    /// Whether every bit set here is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitmask) -> bool {
        debug_assert_eq!(self.len, other.len);
        self.bits.iter().zip(&other.bits).all(|(a, b)| a & !b == 0)
    }
}

// ─── TxBlock ─────────────────────────────────────────────────────────────────

/// Sender-side block state: which source segments remain in the initial
/// pass, which parity has been generated/sent, and the aggregated repair
/// mask from NACKs.
pub struct TxBlock {
    pub id: u32,
    /// Source segments in this block (short for the last block).
    pub source_count: u16,
    /// Parity segments this block may generate.
    pub parity_cap: u16,
    /// Lazily computed parity shards.
    parity: Vec<Option<SegmentBuf>>,
    /// Source segments not yet transmitted in the initial pass.
    pending: Bitmask,
    /// Auto-parity segments still owed for the initial pass.
    pub auto_parity_pending: u16,
    /// Parity segments transmitted at least once (auto or repair).
    parity_sent: Bitmask,
    /// Aggregated repair mask over `source_count + parity_cap` from NACKs.
    repair: Bitmask,
}

impl TxBlock {
    pub fn new(id: u32, source_count: u16, parity_cap: u16, auto_parity: u16) -> Self {
        let mut pending = Bitmask::new(source_count as usize);
        pending.set_all();
        TxBlock {
            id,
            source_count,
            parity_cap,
            parity: (0..parity_cap).map(|_| None).collect(),
            pending,
            auto_parity_pending: auto_parity.min(parity_cap),
            parity_sent: Bitmask::new(parity_cap as usize),
            repair: Bitmask::new(source_count as usize + parity_cap as usize),
        }
    }

    /// Next untransmitted source segment of the initial pass, if any.
    pub fn next_pending_source(&self) -> Option<u8> {
        self.pending.first_set().map(|i| i as u8)
    }

    pub fn mark_source_sent(&mut self, segment_id: u8) {
        self.pending.clear(segment_id as usize);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.any() || self.auto_parity_pending > 0
    }

    /// Whether the parity shards have been generated yet.
    pub fn parity_ready(&self) -> bool {
        self.parity_cap == 0 || self.parity.iter().all(|p| p.is_some())
    }

    /// Generate parity from the block's source shards. No-op if already
    /// done. Fails without side effects when the pool cannot supply enough
    /// buffers (caller retries on a later tick).
    pub fn ensure_parity(
        &mut self,
        codec: &mut BlockCodec,
        sources: &[&[u8]],
        pool: &mut SegmentPool,
    ) -> anyhow::Result<bool> {
        if self.parity_ready() {
            return Ok(true);
        }
        debug_assert_eq!(sources.len(), self.source_count as usize);
        if pool.free_count() < self.parity_cap as usize {
            return Ok(false);
        }
        let shards = codec.encode_parity(self.parity_cap as usize, sources)?;
        for (slot, shard) in self.parity.iter_mut().zip(&shards) {
            let mut buf = pool.acquire().expect("free count checked above");
            buf.set_shard(shard);
            *slot = Some(buf);
        }
        Ok(true)
    }

    /// Next auto-parity segment for the initial pass. Advances state.
    pub fn take_auto_parity(&mut self) -> Option<u8> {
        if self.auto_parity_pending == 0 {
            return None;
        }
        let Some(next) = self.parity_sent.iter_clear().next() else {
            // Repair already spent every parity segment.
            self.auto_parity_pending = 0;
            return None;
        };
        self.auto_parity_pending -= 1;
        self.parity_sent.set(next);
        Some(next as u8)
    }

    /// Full parity shard bytes (the wire payload of a parity segment).
    pub fn parity_shard(&self, idx: u8) -> Option<&[u8]> {
        self.parity
            .get(idx as usize)
            .and_then(|p| p.as_ref())
            .map(|b| b.shard())
    }

    /// Merge a NACK's requested segment run into the repair mask.
    /// Out-of-range indices are clipped.
    pub fn merge_repair(&mut self, start: usize, count: usize) {
        let total = self.repair.len();
        for i in start..(start + count).min(total) {
            self.repair.set(i);
        }
    }

    /// Merge a request for the whole block (all source segments).
    pub fn merge_repair_all(&mut self) {
        for i in 0..self.source_count as usize {
            self.repair.set(i);
        }
    }

    pub fn repair_pending(&self) -> bool {
        self.repair.any()
    }

    /// Turn the aggregated repair mask into a transmit plan and clear it.
    ///
    /// Fresh (never-sent) parity is preferred: any parity segment repairs
    /// any single erasure. Once fresh parity runs out the explicitly
    /// requested segments are retransmitted. `extra` adds that many
    /// additional parity segments per round regardless of the request.
    pub fn drain_repair_plan(&mut self, extra: u16) -> Vec<RepairSend> {
        let requested: Vec<usize> = self.repair.iter_set().collect();
        if requested.is_empty() {
            return Vec::new();
        }
        self.repair.clear_all();

        let mut plan = Vec::new();
        let mut need = requested.len() + extra as usize;

        // Fresh parity first.
        let fresh: Vec<usize> = self.parity_sent.iter_clear().collect();
        for idx in fresh {
            if need == 0 {
                break;
            }
            self.parity_sent.set(idx);
            plan.push(RepairSend::Parity(idx as u8));
            need -= 1;
        }

        // Fall back to retransmitting exactly what was asked for.
        if need > 0 {
            for &i in &requested {
                if i < self.source_count as usize {
                    plan.push(RepairSend::Source(i as u8));
                } else {
                    plan.push(RepairSend::Parity((i - self.source_count as usize) as u8));
                }
            }
        }
        plan
    }

    /// Rearm for a full retransmission (requeue). Generated parity is
    /// kept; transmit and repair bookkeeping start over.
    pub fn reset_for_requeue(&mut self, auto_parity: u16) {
        self.pending.set_all();
        self.parity_sent.clear_all();
        self.repair.clear_all();
        self.auto_parity_pending = auto_parity.min(self.parity_cap);
    }

    /// Release parity buffers back to the pool (on purge).
    pub fn release(&mut self, pool: &mut SegmentPool) {
        for slot in &mut self.parity {
            if let Some(buf) = slot.take() {
                pool.release(buf);
            }
        }
    }
}

/// One entry of a block's repair transmit plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairSend {
    Source(u8),
    Parity(u8),
}

// ─── RxBlock ─────────────────────────────────────────────────────────────────

/// Outcome of storing an arriving segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
    /// Segment pool exhausted; the segment was dropped.
    NoBuffers,
    /// Segment index outside the block's dimensions.
    OutOfRange,
}

/// Receiver-side block state: arrived segments and decode status.
pub struct RxBlock {
    pub id: u32,
    pub source_count: u16,
    pub parity_cap: u16,
    /// Slots 0..source_count are source, the rest parity.
    segments: Vec<Option<SegmentBuf>>,
    received: Bitmask,
    decoded: bool,
    /// One past the highest source index the sender provably got to
    /// (parity implies the whole block). Bounds fresh-block NACKs.
    heard_ceiling: u16,
}

impl RxBlock {
    pub fn new(id: u32, source_count: u16, parity_cap: u16) -> Self {
        let total = source_count as usize + parity_cap as usize;
        RxBlock {
            id,
            source_count,
            parity_cap,
            segments: (0..total).map(|_| None).collect(),
            received: Bitmask::new(total),
            decoded: false,
            heard_ceiling: 0,
        }
    }

    /// One past the highest source index known to have been transmitted.
    pub fn heard_ceiling(&self) -> u16 {
        self.heard_ceiling
    }

    /// Raise the heard ceiling from out-of-band knowledge (flush point).
    pub fn note_heard(&mut self, segment_id: u8) {
        self.heard_ceiling = self
            .heard_ceiling
            .max((segment_id as u16 + 1).min(self.source_count));
    }

    fn slot(&self, segment_id: u8, parity: bool) -> Option<usize> {
        if parity {
            let idx = self.source_count as usize + segment_id as usize;
            ((segment_id as u16) < self.parity_cap).then_some(idx)
        } else {
            ((segment_id as u16) < self.source_count).then_some(segment_id as usize)
        }
    }

    /// Store an arriving source segment payload.
    pub fn store_source(
        &mut self,
        segment_id: u8,
        payload: &[u8],
        pool: &mut SegmentPool,
    ) -> StoreOutcome {
        let Some(idx) = self.slot(segment_id, false) else {
            return StoreOutcome::OutOfRange;
        };
        if self.received.test(idx) {
            return StoreOutcome::Duplicate;
        }
        let Some(mut buf) = pool.acquire() else {
            return StoreOutcome::NoBuffers;
        };
        buf.set_payload(payload);
        self.segments[idx] = Some(buf);
        self.received.set(idx);
        self.heard_ceiling = self.heard_ceiling.max(segment_id as u16 + 1);
        StoreOutcome::Stored
    }

    /// Store an arriving parity segment (payload is the full shard).
    pub fn store_parity(
        &mut self,
        segment_id: u8,
        shard: &[u8],
        pool: &mut SegmentPool,
    ) -> StoreOutcome {
        let Some(idx) = self.slot(segment_id, true) else {
            return StoreOutcome::OutOfRange;
        };
        if self.received.test(idx) {
            return StoreOutcome::Duplicate;
        }
        if shard.len() != pool.shard_width_bytes() {
            return StoreOutcome::OutOfRange;
        }
        let Some(mut buf) = pool.acquire() else {
            return StoreOutcome::NoBuffers;
        };
        buf.set_shard(shard);
        self.segments[idx] = Some(buf);
        self.received.set(idx);
        // Parity follows the block's sources on the wire.
        self.heard_ceiling = self.source_count;
        StoreOutcome::Stored
    }

    pub fn received_count(&self) -> usize {
        self.received.count()
    }

    /// FEC property: decodable once any `k` of the `k + n` arrived.
    pub fn is_decodable(&self) -> bool {
        self.received_count() >= self.source_count as usize
    }

    /// All source segments present (arrived or reconstructed).
    pub fn source_complete(&self) -> bool {
        self.decoded
            || (0..self.source_count as usize).all(|i| self.received.test(i))
    }

    /// Source indices still missing, capped at the count actually needed
    /// to reach `k` (the sender can cover any erasure with fresh parity).
    pub fn erasures_needed(&self) -> Vec<u8> {
        if self.source_complete() {
            return Vec::new();
        }
        let need = (self.source_count as usize).saturating_sub(self.received_count());
        if need == 0 {
            // Decodable as-is; reconstruction will cover the gaps.
            return Vec::new();
        }
        (0..self.source_count as usize)
            .filter(|&i| !self.received.test(i))
            .take(need)
            .map(|i| i as u8)
            .collect()
    }

    /// Run the FEC decoder if the block is decodable but incomplete.
    /// Reconstructed source shards fill their slots; parity buffers are
    /// returned to the pool afterwards. Returns the number of recovered
    /// source segments.
    pub fn try_decode(
        &mut self,
        codec: &mut BlockCodec,
        pool: &mut SegmentPool,
    ) -> anyhow::Result<usize> {
        if self.source_complete() {
            self.decoded = true;
            self.release_parity(pool);
            return Ok(0);
        }
        if !self.is_decodable() {
            return Ok(0);
        }

        let k = self.source_count as usize;
        let sources: Vec<(usize, &[u8])> = (0..k)
            .filter(|&i| self.received.test(i))
            .map(|i| (i, self.segments[i].as_ref().unwrap().shard()))
            .collect();
        let parity: Vec<(usize, &[u8])> = (0..self.parity_cap as usize)
            .filter(|&i| self.received.test(k + i))
            .map(|i| (i, self.segments[k + i].as_ref().unwrap().shard()))
            .collect();

        // Missing sources must be coverable by buffered parity.
        let missing = k - sources.len();
        if pool.free_count() < missing {
            return Ok(0); // retry under less pressure
        }
        let restored = codec.decode(k, self.parity_cap as usize, &sources, &parity)?;
        let recovered = restored.len();
        for (idx, shard) in restored {
            let mut buf = pool.acquire().expect("free count checked above");
            buf.set_shard(&shard);
            self.segments[idx] = Some(buf);
            self.received.set(idx);
        }
        self.decoded = true;
        self.release_parity(pool);
        Ok(recovered)
    }

    /// Payload of a source segment, if present.
    pub fn source_payload(&self, segment_id: u8) -> Option<&[u8]> {
        let idx = self.slot(segment_id, false)?;
        self.segments[idx].as_ref().map(|b| b.payload())
    }

    fn release_parity(&mut self, pool: &mut SegmentPool) {
        let k = self.source_count as usize;
        for slot in &mut self.segments[k..] {
            if let Some(buf) = slot.take() {
                pool.release(buf);
            }
        }
    }

    /// Release every buffer held by this block.
    pub fn release(&mut self, pool: &mut SegmentPool) {
        for slot in &mut self.segments {
            if let Some(buf) = slot.take() {
                pool.release(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SegmentPool;

    const SEG: usize = 64;

    fn fixture() -> (SegmentPool, BlockCodec) {
        let pool = SegmentPool::new(64, SEG);
        let codec = BlockCodec::new(SegmentPool::shard_width(SEG)).unwrap();
        (pool, codec)
    }

    fn payload(i: u8) -> Vec<u8> {
        (0..SEG).map(|j| i.wrapping_mul(17).wrapping_add(j as u8)).collect()
    }

    // ─── Bitmask ────────────────────────────────────────────────────────

    #[test]
    fn bitmask_set_test_count() {
        let mut m = Bitmask::new(130);
        assert!(m.set(0));
        assert!(m.set(64));
        assert!(m.set(129));
        assert!(!m.set(64), "second set reports already-set");
        assert_eq!(m.count(), 3);
        assert!(m.test(129));
        assert!(!m.test(1));
        assert_eq!(m.first_set(), Some(0));
    }

    #[test]
    fn bitmask_union_subset() {
        let mut a = Bitmask::new(16);
        let mut b = Bitmask::new(16);
        a.set(1);
        b.set(1);
        b.set(5);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        a.union(&b);
        assert!(b.is_subset_of(&a));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn bitmask_iterators() {
        let mut m = Bitmask::new(8);
        m.set(2);
        m.set(5);
        assert_eq!(m.iter_set().collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(m.iter_clear().collect::<Vec<_>>(), vec![0, 1, 3, 4, 6, 7]);
    }

    // ─── TxBlock ────────────────────────────────────────────────────────

    #[test]
    fn txblock_initial_pass_order() {
        let mut blk = TxBlock::new(0, 4, 2, 1);
        assert_eq!(blk.next_pending_source(), Some(0));
        blk.mark_source_sent(0);
        blk.mark_source_sent(1);
        assert_eq!(blk.next_pending_source(), Some(2));
        blk.mark_source_sent(2);
        blk.mark_source_sent(3);
        assert_eq!(blk.next_pending_source(), None);
        assert!(blk.has_pending(), "auto parity still owed");
        assert_eq!(blk.take_auto_parity(), Some(0));
        assert!(!blk.has_pending());
    }

    #[test]
    fn txblock_parity_generation() {
        let (mut pool, mut codec) = fixture();
        let mut blk = TxBlock::new(0, 4, 2, 0);
        assert!(!blk.parity_ready());

        let data: Vec<Vec<u8>> = (0..4).map(payload).collect();
        let mut shards: Vec<Vec<u8>> = Vec::new();
        for d in &data {
            let mut buf = pool.acquire().unwrap();
            buf.set_payload(d);
            shards.push(buf.shard().to_vec());
            pool.release(buf);
        }
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        assert!(blk.ensure_parity(&mut codec, &refs, &mut pool).unwrap());
        assert!(blk.parity_ready());
        assert!(blk.parity_shard(0).is_some());
        assert!(blk.parity_shard(1).is_some());

        blk.release(&mut pool);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn txblock_repair_prefers_fresh_parity() {
        let mut blk = TxBlock::new(0, 8, 4, 0);
        blk.merge_repair(1, 2); // segments 1, 2 requested
        let plan = blk.drain_repair_plan(0);
        assert_eq!(plan, vec![RepairSend::Parity(0), RepairSend::Parity(1)]);
        assert!(!blk.repair_pending());
    }

    #[test]
    fn txblock_repair_falls_back_to_source() {
        let mut blk = TxBlock::new(0, 8, 2, 0);
        // Exhaust fresh parity.
        blk.merge_repair(0, 2);
        let _ = blk.drain_repair_plan(0);
        // Next round must retransmit the requested sources.
        blk.merge_repair(3, 2);
        let plan = blk.drain_repair_plan(0);
        assert_eq!(plan, vec![RepairSend::Source(3), RepairSend::Source(4)]);
    }

    #[test]
    fn txblock_extra_parity_added() {
        let mut blk = TxBlock::new(0, 8, 4, 0);
        blk.merge_repair(0, 1);
        let plan = blk.drain_repair_plan(1);
        assert_eq!(plan.len(), 2, "1 erasure + 1 extra parity");
    }

    #[test]
    fn txblock_repair_rounds_union() {
        let mut blk = TxBlock::new(0, 8, 0, 0);
        blk.merge_repair(0, 1);
        blk.merge_repair(0, 1); // duplicate NACK content
        blk.merge_repair(5, 1);
        let plan = blk.drain_repair_plan(0);
        // No parity at all — straight retransmission of the union.
        assert_eq!(plan, vec![RepairSend::Source(0), RepairSend::Source(5)]);
    }

    // ─── RxBlock ────────────────────────────────────────────────────────

    #[test]
    fn rxblock_store_and_complete_without_loss() {
        let (mut pool, mut codec) = fixture();
        let mut blk = RxBlock::new(0, 4, 2);
        for i in 0..4u8 {
            assert_eq!(
                blk.store_source(i, &payload(i), &mut pool),
                StoreOutcome::Stored
            );
        }
        assert!(blk.source_complete());
        assert_eq!(blk.try_decode(&mut codec, &mut pool).unwrap(), 0);
        assert_eq!(blk.source_payload(2).unwrap(), &payload(2)[..]);
    }

    #[test]
    fn rxblock_duplicate_detected() {
        let (mut pool, _) = fixture();
        let mut blk = RxBlock::new(0, 4, 2);
        assert_eq!(blk.store_source(1, &payload(1), &mut pool), StoreOutcome::Stored);
        assert_eq!(
            blk.store_source(1, &payload(1), &mut pool),
            StoreOutcome::Duplicate
        );
    }

    #[test]
    fn rxblock_out_of_range_rejected() {
        let (mut pool, _) = fixture();
        let mut blk = RxBlock::new(0, 4, 2);
        assert_eq!(
            blk.store_source(4, &payload(4), &mut pool),
            StoreOutcome::OutOfRange
        );
        assert_eq!(
            blk.store_parity(2, &[0u8; 2], &mut pool),
            StoreOutcome::OutOfRange
        );
    }

    #[test]
    fn rxblock_pool_exhaustion_signalled() {
        let mut pool = SegmentPool::new(1, SEG);
        let mut blk = RxBlock::new(0, 4, 0);
        assert_eq!(blk.store_source(0, &payload(0), &mut pool), StoreOutcome::Stored);
        assert_eq!(
            blk.store_source(1, &payload(1), &mut pool),
            StoreOutcome::NoBuffers
        );
    }

    #[test]
    fn rxblock_decodes_with_parity_standing_in() {
        let (mut pool, mut codec) = fixture();

        // Sender side: 4 sources, 2 parity.
        let data: Vec<Vec<u8>> = (0..4).map(payload).collect();
        let mut shards: Vec<Vec<u8>> = Vec::new();
        for d in &data {
            let mut buf = pool.acquire().unwrap();
            buf.set_payload(d);
            shards.push(buf.shard().to_vec());
            pool.release(buf);
        }
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let parity = codec.encode_parity(2, &refs).unwrap();

        // Receiver: sources 1 and 3 lost; both parity arrive.
        let mut blk = RxBlock::new(0, 4, 2);
        blk.store_source(0, &data[0], &mut pool);
        blk.store_source(2, &data[2], &mut pool);
        blk.store_parity(0, &parity[0], &mut pool);
        blk.store_parity(1, &parity[1], &mut pool);
        assert!(blk.is_decodable());
        assert!(!blk.source_complete());
        assert_eq!(blk.erasures_needed(), Vec::<u8>::new());

        let recovered = blk.try_decode(&mut codec, &mut pool).unwrap();
        assert_eq!(recovered, 2);
        assert!(blk.source_complete());
        assert_eq!(blk.source_payload(1).unwrap(), &data[1][..]);
        assert_eq!(blk.source_payload(3).unwrap(), &data[3][..]);

        // Parity buffers were handed back after decode: 4 source bufs live.
        assert_eq!(pool.in_use(), 4);
        blk.release(&mut pool);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rxblock_erasures_capped_at_need() {
        let (mut pool, _) = fixture();
        let mut blk = RxBlock::new(0, 8, 4);
        // Received sources 0, 1 and parity 0: 5 segments missing to reach k=8.
        blk.store_source(0, &payload(0), &mut pool);
        blk.store_source(1, &payload(1), &mut pool);
        blk.store_parity(0, &vec![0u8; SegmentPool::shard_width(SEG)], &mut pool);
        let erasures = blk.erasures_needed();
        assert_eq!(erasures.len(), 5, "8 - 3 received = 5 needed");
        assert_eq!(erasures, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn rxblock_not_decodable_below_k() {
        let (mut pool, mut codec) = fixture();
        let mut blk = RxBlock::new(0, 4, 2);
        blk.store_source(0, &payload(0), &mut pool);
        assert!(!blk.is_decodable());
        assert_eq!(blk.try_decode(&mut codec, &mut pool).unwrap(), 0);
        assert!(!blk.source_complete());
    }
}
