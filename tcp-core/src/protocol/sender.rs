//! The send-side engine of an established connection: ACK clocking, window
//! tracking, segmentation, FIN sequencing, and the retransmission timer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use wake::Waker;

use crate::seqnum::SeqNum;

use super::endpoint::Endpoint;
use super::segment::{Flags, Segment};
use super::timer::Timer;

/// Initial retransmission timeout. Doubled on every expiry.
const INITIAL_RTO: Duration = Duration::from_secs(1);

/// The number of back-to-back retransmissions tolerated before the
/// connection is given up on.
const MAX_RETRANSMIT_LIMIT: usize = 5;

/// Send-side state of one connection. Owned by the worker thread; nothing
/// here is shared.
///
/// The write list holds every byte from `snd_una` onward, so byte `i` of
/// the list has sequence number `snd_una + i`. Acknowledgments drain the
/// front; retransmission rewinds `snd_nxt` to `snd_una` and resends from
/// the list (go-back-N).
#[derive(Debug)]
pub(crate) struct Sender {
    ep: Arc<Endpoint>,

    /// SND.UNA: the oldest unacknowledged sequence number.
    pub(crate) snd_una: SeqNum,

    /// SND.NXT: the next sequence number to put on the wire. Rewound to
    /// `snd_una` when retransmitting.
    pub(crate) snd_nxt: SeqNum,

    /// One past the last sequence number allocated to queued data (and the
    /// FIN, once the send side closes). The connection is fully drained
    /// when `snd_una` catches up with this.
    pub(crate) snd_nxt_list: SeqNum,

    /// The highest sequence number ever transmitted; bounds which ACKs are
    /// acceptable.
    max_sent: SeqNum,

    /// SND.WND: the peer's receive window, post-scaling.
    pub(crate) snd_wnd: u32,

    /// The peer's maximum segment size.
    pub(crate) mss: u16,

    /// Shift applied to the window field of the peer's ACKs. Zero when the
    /// peer negotiated no scaling.
    pub(crate) snd_wnd_scale: u8,

    /// The highest acknowledgment number we have sent to the peer.
    pub(crate) max_sent_ack: SeqNum,

    /// Set once the application closes the send side; the FIN is emitted
    /// when the write list drains.
    pub(crate) closed: bool,

    /// Unacknowledged and unsent bytes, starting at `snd_una`.
    write_list: VecDeque<u8>,

    /// Asserted by the retransmission timer; the driver dispatches it to
    /// [`Sender::retransmit_timer_expired`].
    pub(crate) resend_waker: Waker,
    resend_timer: Timer,
    timer_armed: bool,

    /// Current retransmission timeout, doubled per expiry.
    rto: Duration,
    retransmit_count: usize,
}

impl Sender {
    /// Builds the sender from the handshake's negotiated values: our `iss`,
    /// the peer's window (already scaled) and MSS, the peer's window-scale
    /// shift, and the acknowledgment number the handshake last sent.
    pub(crate) fn new(
        ep: Arc<Endpoint>,
        iss: SeqNum,
        snd_wnd: u32,
        mss: u16,
        snd_wnd_scale: i8,
        initial_ack: SeqNum,
    ) -> Self {
        let resend_waker = Waker::new();
        let resend_timer = Timer::new(resend_waker.clone());

        Self {
            ep,
            snd_una: iss + 1u32,
            snd_nxt: iss + 1u32,
            snd_nxt_list: iss + 1u32,
            max_sent: iss + 1u32,
            snd_wnd,
            mss,
            snd_wnd_scale: snd_wnd_scale.max(0) as u8,
            max_sent_ack: initial_ack,
            closed: false,
            write_list: VecDeque::new(),
            resend_waker,
            resend_timer,
            timer_armed: false,
            rto: INITIAL_RTO,
            retransmit_count: 0,
        }
    }

    /// Appends application bytes pulled off the endpoint's send queue and
    /// advances `snd_nxt_list` past them.
    pub(crate) fn append_to_write_list(&mut self, chunks: VecDeque<Vec<u8>>, bytes: usize) {
        for chunk in chunks {
            self.write_list.extend(chunk);
        }
        self.snd_nxt_list = self.snd_nxt_list + bytes;
    }

    /// Marks the send side closed and allocates the FIN's sequence number.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.snd_nxt_list = self.snd_nxt_list + 1u32;
    }

    /// Pushes out as much queued data as the peer's window and MSS allow,
    /// followed by the FIN once the send side is closed and drained. `ack`
    /// and `wnd` are the acknowledgment number and advertised window to
    /// carry.
    pub(crate) fn send_data(&mut self, ack: SeqNum, wnd: u32) {
        loop {
            let offset = (self.snd_nxt - self.snd_una) as usize;
            let available = self.write_list.len().saturating_sub(offset);
            let in_flight = (self.snd_nxt - self.snd_una) as u32;
            let usable_wnd = self.snd_wnd.saturating_sub(in_flight) as usize;

            if available == 0 || usable_wnd == 0 {
                break;
            }

            let len = available.min(usable_wnd).min(self.mss as usize);
            let payload: Vec<u8> = self
                .write_list
                .iter()
                .skip(offset)
                .take(len)
                .copied()
                .collect();

            if self
                .ep
                .send_raw(&payload, Flags::ACK | Flags::PSH, self.snd_nxt, ack, wnd)
                .is_err()
            {
                warn!("[{}] failed to transmit data segment", self.ep.id());
                break;
            }

            self.snd_nxt = self.snd_nxt + len;
            self.max_sent_ack = ack;
            if self.max_sent.before(self.snd_nxt) {
                self.max_sent = self.snd_nxt;
            }
        }

        // The FIN goes out once every queued byte has been transmitted.
        let all_data_sent = (self.snd_nxt - self.snd_una) as usize == self.write_list.len();
        if self.closed && all_data_sent && self.snd_nxt.before(self.snd_nxt_list) {
            debug!("[{}] sending FIN, seq {}", self.ep.id(), self.snd_nxt);

            if self
                .ep
                .send_raw(&[], Flags::FIN | Flags::ACK, self.snd_nxt, ack, wnd)
                .is_ok()
            {
                self.snd_nxt = self.snd_nxt + 1u32;
                self.max_sent_ack = ack;
                if self.max_sent.before(self.snd_nxt) {
                    self.max_sent = self.snd_nxt;
                }
            }
        }

        // Anything outstanding keeps the retransmission timer running.
        if self.snd_una != self.max_sent && !self.timer_armed {
            self.resend_timer.reset(self.rto);
            self.timer_armed = true;
        }
    }

    /// Consumes the acknowledgment and window fields of a received segment.
    /// The driver has already applied the window scale to `s.window`.
    pub(crate) fn handle_rcvd_segment(&mut self, s: &Segment) {
        self.snd_wnd = s.window;

        let ack = s.ack_number;

        // (RFC 793 3.9) SND.UNA < SEG.ACK =< SND.NXT: acceptable new ack.
        // Anything outside is a duplicate or acks data never sent.
        if !ack.after(self.snd_una) || ack.after(self.max_sent) {
            return;
        }

        let acked = (ack - self.snd_una) as usize;
        let data_acked = acked.min(self.write_list.len());
        self.write_list.drain(..data_acked);

        self.snd_una = ack;
        if self.snd_nxt.before(ack) {
            self.snd_nxt = ack;
        }

        // Forward progress resets the backoff.
        self.rto = INITIAL_RTO;
        self.retransmit_count = 0;

        if self.snd_una == self.max_sent {
            self.resend_timer.stop();
            self.timer_armed = false;
        } else {
            self.resend_timer.reset(self.rto);
        }
    }

    /// Sends a bare acknowledgment carrying `ack` and the advertised
    /// window `wnd`.
    pub(crate) fn send_ack(&mut self, ack: SeqNum, wnd: u32) {
        if self
            .ep
            .send_raw(&[], Flags::ACK, self.snd_nxt, ack, wnd)
            .is_ok()
        {
            self.max_sent_ack = ack;
        }
    }

    /// Handles an expiry of the retransmission timer: rewinds to `snd_una`
    /// and resends with doubled backoff. Returns `false` once the
    /// retransmission limit is exhausted and the connection should be
    /// reset.
    pub(crate) fn retransmit_timer_expired(&mut self, ack: SeqNum, wnd: u32) -> bool {
        self.timer_armed = false;

        // A late expiry can race the ack that drained the list.
        if self.snd_una == self.max_sent {
            return true;
        }

        self.retransmit_count += 1;
        if self.retransmit_count > MAX_RETRANSMIT_LIMIT {
            warn!(
                "[{}] retransmission limit reached with {} unacked",
                self.ep.id(),
                self.max_sent - self.snd_una
            );
            return false;
        }

        self.rto *= 2;

        debug!(
            "[{}] retransmission timeout, resending from {} (rto {:?})",
            self.ep.id(),
            self.snd_una,
            self.rto
        );

        self.snd_nxt = self.snd_una;
        self.send_data(ack, wnd);

        // Re-arm even if the window is closed, so a silent peer cannot
        // stall the connection forever.
        if !self.timer_armed {
            self.resend_timer.reset(self.rto);
            self.timer_armed = true;
        }

        true
    }

    /// Stops the retransmission timer. Called as the worker tears down.
    pub(crate) fn stop_timer(&mut self) {
        self.resend_timer.stop();
        self.timer_armed = false;
    }
}
