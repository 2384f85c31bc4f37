//! # Stream Buffers
//!
//! A stream object's block space is a sliding window over a ring of
//! segment slots. [`StreamTx`] buffers written bytes at the leading edge
//! while the sender transmits from the trailing edge; [`StreamRx`] holds
//! arriving segments until the application reads past them.
//!
//! End-of-message markers are a per-segment flag: flushing with EOM closes
//! the current segment, so a message always ends exactly at an EOM
//! segment and the next message starts at the following segment.

use std::collections::BTreeMap;

/// Stream flush behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// No flushing; segments go out only when filled.
    #[default]
    None,
    /// Close and transmit the partial segment.
    Passive,
    /// As Passive, plus flush commands while the queue stays idle.
    Active,
}

/// One closed stream segment.
#[derive(Debug, Clone)]
pub struct StreamSegment {
    pub data: Vec<u8>,
    /// Payload ends an application message.
    pub eom: bool,
    /// Payload begins an application message.
    pub msg_start: bool,
}

// ─── StreamTx ────────────────────────────────────────────────────────────────

/// Sender-side stream ring.
pub struct StreamTx {
    segment_size: usize,
    /// Ring capacity in segment slots (`buffer_size / segment_size`).
    capacity: usize,
    /// Closed segments keyed by absolute segment index.
    ring: BTreeMap<u64, StreamSegment>,
    /// Absolute index of the segment currently being written.
    write_seg: u64,
    /// Bytes accumulated for the segment being written.
    partial: Vec<u8>,
    /// Sender transmit cursor (absolute segment index).
    next_send: u64,
    /// Overwrite the oldest buffered segment instead of blocking writes.
    push_mode: bool,
    auto_flush: FlushMode,
    /// Mark the next closed segment as ending a message.
    eom_armed: bool,
    /// The next closed segment begins a message (true after an EOM).
    msg_start_armed: bool,
}

impl StreamTx {
    pub fn new(buffer_size: usize, segment_size: usize) -> Self {
        let capacity = (buffer_size / segment_size).max(2);
        StreamTx {
            segment_size,
            capacity,
            ring: BTreeMap::new(),
            write_seg: 0,
            partial: Vec::with_capacity(segment_size),
            next_send: 0,
            push_mode: false,
            auto_flush: FlushMode::None,
            eom_armed: false,
            msg_start_armed: true,
        }
    }

    pub fn set_push_mode(&mut self, enabled: bool) {
        self.push_mode = enabled;
    }

    pub fn push_mode(&self) -> bool {
        self.push_mode
    }

    pub fn set_auto_flush(&mut self, mode: FlushMode) {
        self.auto_flush = mode;
    }

    pub fn auto_flush(&self) -> FlushMode {
        self.auto_flush
    }

    /// Whether at least one more byte would currently be accepted.
    pub fn has_vacancy(&self) -> bool {
        self.push_mode || self.ring.len() < self.capacity || !self.partial.is_empty()
            && self.partial.len() < self.segment_size
    }

    /// Append bytes at the leading edge. Returns bytes accepted — possibly
    /// 0 when the ring is full of unsent data and push mode is off.
    pub fn write(&mut self, mut bytes: &[u8]) -> usize {
        let mut accepted = 0;
        while !bytes.is_empty() {
            if self.partial.len() == self.segment_size {
                if !self.close_partial(false) {
                    break;
                }
            }
            let room = self.segment_size - self.partial.len();
            let take = room.min(bytes.len());
            self.partial.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            accepted += take;
            if self.partial.len() == self.segment_size && !self.close_partial(false) {
                break;
            }
        }
        accepted
    }

    /// Close the current partial segment (even if short), optionally
    /// marking end-of-message.
    pub fn flush(&mut self, eom: bool) {
        if !self.partial.is_empty() {
            if eom {
                self.eom_armed = true;
            }
            self.close_partial(true);
        } else if eom {
            // Retroactively mark the last closed segment.
            self.mark_eom();
        }
    }

    /// Mark EOM on the most recently written byte: on the open partial if
    /// one exists, otherwise on the last closed segment.
    pub fn mark_eom(&mut self) {
        if !self.partial.is_empty() {
            self.eom_armed = true;
        } else if let Some((_, seg)) = self.ring.iter_mut().next_back() {
            seg.eom = true;
            self.msg_start_armed = true;
        }
    }

    /// Close the partial into the ring. Returns false when the ring is
    /// full and push mode is off (nothing closed).
    fn close_partial(&mut self, forced: bool) -> bool {
        if self.partial.is_empty() && !forced {
            return true;
        }
        if self.ring.len() >= self.capacity {
            if !self.push_mode {
                return false;
            }
            // Push mode: drop the oldest buffered segment. The receiver
            // sees the gap as unrecoverable loss and resyncs forward.
            if let Some((&oldest, _)) = self.ring.iter().next() {
                self.ring.remove(&oldest);
                if self.next_send <= oldest {
                    self.next_send = oldest + 1;
                }
            }
        }
        let data = std::mem::replace(&mut self.partial, Vec::with_capacity(self.segment_size));
        let eom = self.eom_armed;
        let msg_start = self.msg_start_armed;
        self.eom_armed = false;
        self.msg_start_armed = eom;
        self.ring
            .insert(self.write_seg, StreamSegment { data, eom, msg_start });
        self.write_seg += 1;
        true
    }

    /// Next closed-but-unsent segment index, if any.
    pub fn next_pending(&self) -> Option<u64> {
        self.ring.range(self.next_send..).next().map(|(&i, _)| i)
    }

    /// Advance the transmit cursor past `seg`.
    pub fn mark_sent(&mut self, seg: u64) {
        if seg >= self.next_send {
            self.next_send = seg + 1;
        }
    }

    /// A buffered segment by absolute index (for repair).
    pub fn segment(&self, seg: u64) -> Option<&StreamSegment> {
        self.ring.get(&seg)
    }

    /// Absolute index of the segment currently being written.
    pub fn write_seg(&self) -> u64 {
        self.write_seg
    }

    /// Transmit cursor (next segment to send).
    pub fn send_cursor(&self) -> u64 {
        self.next_send
    }

    pub fn buffered_segments(&self) -> usize {
        self.ring.len()
    }
}

// ─── StreamRx ────────────────────────────────────────────────────────────────

/// Receiver-side stream ring.
pub struct StreamRx {
    /// Arrived segments by absolute index.
    ring: BTreeMap<u64, StreamSegment>,
    /// Ring capacity in segment slots.
    capacity: usize,
    /// Absolute index of the next segment the reader consumes.
    read_seg: u64,
    /// Byte offset into the `read_seg` segment.
    read_off: usize,
    /// Total bytes handed to the application.
    read_bytes: u64,
    /// Highest segment index observed (gap ceiling).
    max_seen: Option<u64>,
}

impl StreamRx {
    pub fn new(buffer_size: usize, segment_size: usize) -> Self {
        StreamRx {
            ring: BTreeMap::new(),
            capacity: (buffer_size / segment_size).max(2),
            read_seg: 0,
            read_off: 0,
            read_bytes: 0,
            max_seen: None,
        }
    }

    /// Insert an arrived (or FEC-recovered) segment. Segments behind the
    /// read cursor are stale and dropped; under memory pressure the oldest
    /// unread segment gives way.
    pub fn insert(&mut self, seg: u64, data: Vec<u8>, eom: bool, msg_start: bool) {
        if seg < self.read_seg {
            return;
        }
        self.max_seen = Some(self.max_seen.map_or(seg, |m| m.max(seg)));
        if self.ring.len() >= self.capacity && !self.ring.contains_key(&seg) {
            // Drop the oldest to stay bounded; prefer dropping data the
            // reader has fallen behind on.
            if let Some((&oldest, _)) = self.ring.iter().next() {
                if oldest < seg {
                    self.ring.remove(&oldest);
                    if self.read_seg <= oldest {
                        self.read_seg = oldest + 1;
                        self.read_off = 0;
                    }
                } else {
                    return;
                }
            }
        }
        self.ring.entry(seg).or_insert(StreamSegment {
            data,
            eom,
            msg_start,
        });
    }

    /// Read contiguous bytes into `buf`. Stops at a gap. Consumed
    /// segments are evicted.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(seg) = self.ring.get(&self.read_seg) else {
                break;
            };
            let avail = &seg.data[self.read_off..];
            let take = avail.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&avail[..take]);
            filled += take;
            self.read_off += take;
            if self.read_off >= seg.data.len() {
                self.ring.remove(&self.read_seg);
                self.read_seg += 1;
                self.read_off = 0;
            }
        }
        self.read_bytes += filled as u64;
        filled
    }

    /// Whether a read would make progress right now.
    pub fn readable(&self) -> bool {
        self.ring
            .get(&self.read_seg)
            .is_some_and(|s| s.data.len() > self.read_off)
    }

    /// Position the read cursor on a message start. A no-op when already
    /// there; otherwise skips forward to the next buffered MSG_START
    /// segment, discarding whatever came before. Returns false when no
    /// such anchor is currently buffered.
    pub fn seek_msg_start(&mut self) -> bool {
        if self.read_off == 0
            && self
                .ring
                .get(&self.read_seg)
                .is_some_and(|s| s.msg_start)
        {
            return true;
        }
        let from = if self.read_off == 0 {
            self.read_seg
        } else {
            self.read_seg + 1
        };
        let anchor = self
            .ring
            .range(from..)
            .find(|(_, s)| s.msg_start)
            .map(|(&i, _)| i);
        let Some(anchor) = anchor else {
            return false;
        };
        while let Some((&i, _)) = self.ring.iter().next() {
            if i < anchor {
                self.ring.remove(&i);
            } else {
                break;
            }
        }
        self.read_seg = anchor;
        self.read_off = 0;
        true
    }

    /// Whether the reader is currently stalled on a gap that later data
    /// has already arrived beyond.
    pub fn has_gap(&self) -> bool {
        match self.max_seen {
            Some(max) => !self.ring.contains_key(&self.read_seg) && max > self.read_seg,
            None => false,
        }
    }

    /// Total bytes delivered to the application so far.
    pub fn read_offset(&self) -> u64 {
        self.read_bytes
    }

    pub fn buffered_segments(&self) -> usize {
        self.ring.len()
    }
}
