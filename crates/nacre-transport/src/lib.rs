//! # nacre-transport
//!
//! Pure-Rust NACK-oriented reliable multicast engine.
//!
//! One-to-many reliable transfer of files, buffers and streams over an
//! unreliable datagram substrate: negative acknowledgment with randomized
//! feedback suppression, Reed-Solomon block repair, GRTT group probing,
//! and TFRC-style congestion control. The crate is sans-IO — sockets,
//! timers and file descriptors belong to the embedder, which drives a
//! [`session::Session`] with datagrams, instants and polls.
//!
//! ## Crate structure
//!
//! - [`wire`] — message codec, header quantization tables
//! - [`pool`] — fixed-capacity segment buffer pool
//! - [`fec`] — Reed-Solomon block codec integration
//! - [`block`] — coding blocks: bitmaps, erasures, repair plans
//! - [`object`] — file/data/stream objects, transmit cache
//! - [`stream`] — stream rings, push mode, message boundaries
//! - [`grtt`] — group round-trip-time estimation and probing
//! - [`congestion`] — loss-interval tracking and the TFRC equation
//! - [`sender`] — sender pipeline, repair aggregation, watermark acking
//! - [`receiver`] — per-remote-sender reception and the NACK machine
//! - [`session`] — the session controller and application surface
//! - [`stats`] — counters and smoothing helpers

pub mod block;
pub mod congestion;
pub mod fec;
pub mod grtt;
pub mod object;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod stream;
pub mod wire;

pub use congestion::CcMode;
pub use grtt::ProbingMode;
pub use object::{NackingMode, TxCacheBounds};
pub use receiver::{Destination, RepairBoundary, SyncPolicy};
pub use sender::AckingStatus;
pub use session::{Datagram, Event, NodeHandle, ObjectHandle, Session, SessionConfig};
pub use stream::FlushMode;
