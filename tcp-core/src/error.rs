//! Error types surfaced by the endpoint core.

use thiserror::Error;

/// A convenience wrapper around `Result` for [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Set of errors an endpoint can surface to its upper layer.
///
/// Terminal errors land in the endpoint's hard-error slot; transient ones
/// (`WouldBlock` and friends) are returned from the call that hit them and
/// leave the connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer answered the handshake with an acceptable RST.
    #[error("connection refused by the peer")]
    ConnectionRefused,

    /// An established connection received a RST inside the receive window.
    #[error("connection reset by the peer")]
    ConnectionReset,

    /// The endpoint was closed and the close timer elapsed before the
    /// connection could wind down gracefully.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The endpoint was closed while the handshake was still in flight.
    #[error("operation aborted")]
    Aborted,

    /// Handshake retransmissions exceeded the 60 second ceiling, or the
    /// established-state retransmit limit was reached.
    #[error("operation timed out")]
    Timeout,

    /// The endpoint is not in a state where the requested operation makes
    /// sense, or a passive handshake saw an incompatible second SYN.
    #[error("endpoint is in an invalid state")]
    InvalidEndpointState,

    /// The send side of the connection has been closed.
    #[error("endpoint is closed for sending")]
    ClosedForSend,

    /// The receive side has seen the peer's FIN and the receive list has
    /// been drained.
    #[error("endpoint is closed for receiving")]
    ClosedForReceive,

    /// The operation would need to block to make progress.
    #[error("operation would block")]
    WouldBlock,

    /// The lower layer rejected an outbound packet.
    #[error("no route to host")]
    NoRoute,

    /// A segment or header failed wire-level validation. Never surfaced to
    /// the upper layer; the offending segment is dropped.
    #[error("malformed TCP segment")]
    MalformedSegment,

    /// The system random number generator failed while drawing an initial
    /// sequence number.
    #[error("random number generation failed")]
    Rng,
}
