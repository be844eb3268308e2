//! Core of a user-space TCP endpoint, based on [RFC 793] with [RFC 1323]
//! window scaling: the three-way handshake state machine and the
//! per-connection protocol driver that owns segment ingress and egress,
//! retransmission timing, and orderly shutdown.
//!
//! Each connection is driven by a single worker thread that multiplexes its
//! event sources (application writes and closes, arriving segments, timer
//! expirations, control notifications) through the edge-triggered
//! [`wake`] primitive. Everything below the endpoint — routing, device I/O,
//! demultiplexing — sits behind the [`route::Route`] trait.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793
//! [RFC 1323]: https://www.rfc-editor.org/rfc/rfc1323

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod protocol;
pub mod route;
pub mod seqnum;
pub mod waiter;

pub mod error;
pub use error::{Error, Result};

#[cfg(test)]
mod testutil;
