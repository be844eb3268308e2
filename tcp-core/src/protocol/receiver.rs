//! The receive-side engine of an established connection: acceptability
//! checking, in-order delivery, and FIN tracking.
//!
//! Reassembly of out-of-order data is a concern of the buffering layer
//! above the ingress path; segments that arrive ahead of `rcv_nxt` are
//! dropped here and recovered by the peer's retransmission.

use std::sync::Arc;

use tracing::debug;

use crate::seqnum::SeqNum;

use super::endpoint::Endpoint;
use super::segment::{Flags, Segment};

/// Receive-side state of one connection. Owned by the worker thread.
#[derive(Debug)]
pub(crate) struct Receiver {
    ep: Arc<Endpoint>,

    /// RCV.NXT: the next sequence number expected from the peer.
    pub(crate) rcv_nxt: SeqNum,

    /// The effective receive window scale applied when advertising.
    rcv_wnd_scale: u8,

    /// The receive buffer size the window is computed against. Refreshed
    /// when the upper layer resizes the buffer.
    pub(crate) pending_buf_size: u32,

    /// Set once the peer's FIN has been processed.
    pub(crate) closed: bool,
}

impl Receiver {
    /// Builds the receiver from the handshake's negotiated values: the
    /// peer's `irs`, our receive window, and the effective receive scale.
    pub(crate) fn new(ep: Arc<Endpoint>, irs: SeqNum, rcv_wnd: u32, rcv_wnd_scale: u8) -> Self {
        Self {
            ep,
            rcv_nxt: irs + 1u32,
            rcv_wnd_scale,
            pending_buf_size: rcv_wnd,
            closed: false,
        }
    }

    /// The receive window currently open to the peer, in bytes.
    fn window(&self) -> u32 {
        self.ep
            .receive_buffer_available()
            .min(self.pending_buf_size)
    }

    /// The window value to advertise on outbound segments, pre-shifted by
    /// the negotiated scale.
    pub(crate) fn advertised_window(&self) -> u32 {
        self.window() >> self.rcv_wnd_scale
    }

    /// The RFC 793 (3.3) segment acceptability test:
    ///
    /// ```text
    ///    Length  Window   Test
    ///    ------- -------  -------------------------------------------
    ///       0       0     SEG.SEQ = RCV.NXT
    ///       0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    ///      >0       0     not acceptable
    ///      >0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
    ///                  or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    /// ```
    pub(crate) fn acceptable(&self, seq: SeqNum, len: u32) -> bool {
        let wnd = self.window();

        if len == 0 {
            if wnd == 0 {
                return seq == self.rcv_nxt;
            }
            return seq.in_window(self.rcv_nxt, wnd);
        }

        if wnd == 0 {
            return false;
        }

        seq.in_window(self.rcv_nxt, wnd) || (seq + (len - 1)).in_window(self.rcv_nxt, wnd)
    }

    /// Consumes one received segment: in-order payload is delivered to the
    /// application, the FIN advances `rcv_nxt` and closes the receive
    /// side. The driver emits the cumulative ACK after the batch.
    pub(crate) fn handle_rcvd_segment(&mut self, s: &Segment) {
        if self.closed {
            return;
        }

        if !self.acceptable(s.seq_number, s.logical_len()) {
            debug!(
                "[{}] dropping unacceptable segment, seq {} len {}",
                self.ep.id(),
                s.seq_number,
                s.logical_len()
            );
            return;
        }

        // Only the segment at the left window edge is consumable; anything
        // beyond it waits in the peer's retransmission queue.
        if s.seq_number != self.rcv_nxt {
            debug!(
                "[{}] dropping out-of-order segment, seq {} (expected {})",
                self.ep.id(),
                s.seq_number,
                self.rcv_nxt
            );
            return;
        }

        if !s.payload.is_empty() {
            self.rcv_nxt = self.rcv_nxt + s.payload.len();
            self.ep.deliver_to_receive_list(s.payload.clone());
        }

        if s.flag_is_set(Flags::FIN) {
            debug!(
                "[{}] received FIN, seq {}: receive side closed",
                self.ep.id(),
                self.rcv_nxt
            );

            // The FIN occupies one sequence number.
            self.rcv_nxt = self.rcv_nxt + 1u32;
            self.closed = true;
            self.ep.mark_receive_closed();
        }
    }

    /// Called when the application has drained a previously-full receive
    /// buffer: the reopened window must reach the peer, which a pure
    /// ack-clocked sender would otherwise never learn.
    pub(crate) fn non_zero_window(&mut self) {
        debug!(
            "[{}] receive window reopened to {} bytes",
            self.ep.id(),
            self.window()
        );
    }
}
