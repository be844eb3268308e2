//! The TCP protocol engine.
//!
//! This module holds everything between the wire and the upper layer: header
//! definitions and serialization, segment construction and queuing, the
//! three-way handshake state machine, the send and receive sub-engines, and
//! the per-connection driver that arbitrates between them.

pub mod driver;
pub mod endpoint;
pub mod handshake;
pub mod receiver;
pub mod sender;
pub mod timer;
pub mod wire;

pub mod socket;
pub use socket::{ConnectionId, SocketAddr};

pub mod segment;
pub use segment::{Flags, Segment};

pub mod segment_queue;
pub use segment_queue::SegmentQueue;

pub use endpoint::{Endpoint, State};

/// The maximum number of segments the worker processes per wake-up. Yielding
/// after this many lets other events (timeouts, resets) run in between.
pub(crate) const MAX_SEGMENTS_PER_WAKE: usize = 100;

/// Maximum allowed window scaling (RFC 1323 2.3).
pub(crate) const MAX_WND_SCALE: u8 = 14;

/// RFC 1122 (4.2.2.6)
///
/// If an MSS option is not received at connection setup, TCP MUST assume a
/// default send MSS of 536 (576-40).
pub(crate) const DEFAULT_TCP_MSS: u16 = 536;
