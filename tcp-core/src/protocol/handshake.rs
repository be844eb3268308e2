//! The TCP 3-way handshake state machine, as described in [RFC 793], with
//! [RFC 1323] MSS and window-scale option negotiation.
//!
//! A depiction of the states and transitions can be found in RFC 793,
//! page 23.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793
//! [RFC 1323]: https://www.rfc-editor.org/rfc/rfc1323

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use wake::{Sleeper, Waker};

use crate::seqnum::SeqNum;
use crate::{Error, Result};

use super::endpoint::{Endpoint, NOTIFY_CLOSE};
use super::segment::{Flags, Segment};
use super::timer::Timer;
use super::wire::OptionKind;
use super::{DEFAULT_TCP_MSS, MAX_SEGMENTS_PER_WAKE, MAX_WND_SCALE};

/// Wake-up sources multiplexed during the handshake.
const WAKER_FOR_RESEND: usize = 0;
const WAKER_FOR_NOTIFICATION: usize = 1;
const WAKER_FOR_NEW_SEGMENT: usize = 2;

/// The initial SYN retransmission interval. Doubled on every expiry.
const INITIAL_SYN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ceiling on the SYN retransmission interval; past it the handshake fails
/// with a timeout.
const MAX_SYN_TIMEOUT: Duration = Duration::from_secs(60);

/// Phases of the connection during the 3-way handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Our SYN is out; waiting for the peer's SYN (and ACK).
    SynSent,
    /// The peer's SYN is acknowledged; waiting for the ACK of ours.
    SynRcvd,
    /// Both SYNs acknowledged; the connection is synchronized.
    Completed,
}

/// Options parsed from a peer's SYN segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SynOptions {
    /// The peer's maximum segment size.
    pub(crate) mss: u16,
    /// The peer's window scale shift. Negative when the peer sent no
    /// window-scale option, which also disables scaling on our receive
    /// side.
    pub(crate) wnd_scale: i8,
}

/// State used during a TCP 3-way handshake.
///
/// Lives on the worker's stack for the duration of [`Handshake::execute`];
/// afterwards its negotiated values seed the sender and receiver and it is
/// discarded.
#[derive(Debug)]
pub(crate) struct Handshake {
    ep: Arc<Endpoint>,
    pub(crate) phase: Phase,
    active: bool,
    flags: Flags,
    pub(crate) ack_num: SeqNum,

    /// The initial send sequence number, as defined in RFC 793. Fixed
    /// across retransmissions of the initial SYN.
    pub(crate) iss: SeqNum,

    /// Our receive window in bytes.
    pub(crate) rcv_wnd: u32,

    /// The peer's advertised send window, post-scaling.
    pub(crate) snd_wnd: u32,

    /// The peer's maximum segment size.
    pub(crate) mss: u16,

    /// The peer's window scale. Negative means the peer does not support
    /// scaling.
    pub(crate) snd_wnd_scale: i8,

    /// Our window scale, derived once from the receive buffer size.
    pub(crate) rcv_wnd_scale: u8,
}

impl Handshake {
    /// Creates the handshake state for an active open with the given
    /// receive window.
    ///
    /// # Errors
    ///
    /// Fails only if the system RNG cannot produce an initial sequence
    /// number.
    pub(crate) fn new(ep: Arc<Endpoint>, rcv_wnd: u32) -> Result<Self> {
        let mut handshake = Self {
            ep,
            phase: Phase::SynSent,
            active: true,
            flags: Flags::SYN,
            ack_num: SeqNum::new(0),
            iss: SeqNum::new(0),
            rcv_wnd,
            snd_wnd: 0,
            mss: 0,
            snd_wnd_scale: -1,
            rcv_wnd_scale: find_wnd_scale(rcv_wnd),
        };
        handshake.reset_state()?;
        Ok(handshake)
    }

    /// Re-draws the initial sequence number and resets the per-attempt
    /// fields, leaving the handshake ready for a fresh SYN.
    fn reset_state(&mut self) -> Result<()> {
        self.phase = Phase::SynSent;
        self.flags = Flags::SYN;
        self.ack_num = SeqNum::new(0);
        self.mss = 0;
        self.snd_wnd_scale = -1;
        self.iss = random_iss()?;
        Ok(())
    }

    /// Resets the handshake to the SYN-RCVD state for a passive open: the
    /// listener has already received the peer's SYN (carrying `irs` and its
    /// options) and chosen `iss`.
    pub(crate) fn reset_to_syn_rcvd(
        &mut self,
        iss: SeqNum,
        irs: SeqNum,
        mss: u16,
        snd_wnd_scale: i8,
    ) {
        self.active = false;
        self.phase = Phase::SynRcvd;
        self.flags = Flags::SYN | Flags::ACK;
        self.iss = iss;
        self.ack_num = irs + 1u32;
        self.mss = mss;
        self.snd_wnd_scale = snd_wnd_scale;
    }

    /// The effective receive window scale: zero whenever the peer omitted
    /// the window-scale option, otherwise the scale derived from the
    /// receive buffer.
    pub(crate) fn effective_rcv_wnd_scale(&self) -> u8 {
        if self.snd_wnd_scale < 0 {
            0
        } else {
            self.rcv_wnd_scale
        }
    }

    /// Emits our opening segment: the SYN (or SYN|ACK) carrying the MSS and
    /// window-scale options.
    fn send_open_segment(&self) -> Result<()> {
        // Once the peer's SYN has shown it lacks window scaling, the option
        // is stripped from our SYN|ACK.
        let ws = if self.flags.contains(Flags::ACK) && self.snd_wnd_scale < 0 {
            -1
        } else {
            self.rcv_wnd_scale as i8
        };

        self.ep
            .send_syn(self.flags, self.iss, self.ack_num, self.rcv_wnd, ws)
    }

    /// Checks the ACK number, if present, of a segment received during the
    /// handshake.
    ///
    /// (RFC 793 p.36) A reset must be generated when the connection is in
    /// any non-synchronized state and an incoming segment acknowledges
    /// something not yet sent; the connection remains in the same state.
    fn check_ack(&self, s: &Segment) -> bool {
        if s.flag_is_set(Flags::ACK) && s.ack_number != self.iss + 1u32 {
            let ack = s.seq_number + s.logical_len();
            let _ = self
                .ep
                .send_raw(&[], Flags::RST | Flags::ACK, s.ack_number, ack, 0);
            return false;
        }

        true
    }

    /// Handles a segment received in the SYN-SENT state.
    fn syn_sent_state(&mut self, s: &Segment) -> Result<()> {
        // (RFC 793 p.37) In the SYN-SENT state, a reset is acceptable if
        // the ack field acknowledges the SYN.
        if s.flag_is_set(Flags::RST) {
            if s.flag_is_set(Flags::ACK) && s.ack_number == self.iss + 1u32 {
                warn!(
                    "[{}] (SYN_SENT) received acceptable RST: connection refused",
                    self.ep.id()
                );
                return Err(Error::ConnectionRefused);
            }
            return Ok(());
        }

        if !self.check_ack(s) {
            return Ok(());
        }

        // Only segments carrying a SYN matter here.
        if !s.flag_is_set(Flags::SYN) {
            return Ok(());
        }

        // Parse the SYN options; a malformed segment is dropped silently.
        let Some(options) = parse_syn_options(s.options()) else {
            debug!(
                "[{}] (SYN_SENT) dropping SYN with malformed options",
                self.ep.id()
            );
            return Ok(());
        };

        // Remember the sequence we will ack from now on.
        self.ack_num = s.seq_number + 1u32;
        self.flags |= Flags::ACK;
        self.mss = options.mss;
        self.snd_wnd_scale = options.wnd_scale;

        // A SYN|ACK completes the handshake once we acknowledge it.
        if s.flag_is_set(Flags::ACK) {
            self.phase = Phase::Completed;

            debug!(
                "[{}] (SYN_SENT) received SYN|ACK, sending ACK: SYN_SENT -> ESTABLISHED",
                self.ep.id()
            );

            let _ = self.ep.send_raw(
                &[],
                Flags::ACK,
                self.iss + 1u32,
                self.ack_num,
                self.rcv_wnd >> self.effective_rcv_wnd_scale(),
            );
            return Ok(());
        }

        // Simultaneous open: a SYN without an ACK. Acknowledge it, resend
        // our own SYN, and wait for it to be acknowledged in SYN-RCVD.
        self.phase = Phase::SynRcvd;

        debug!(
            "[{}] (SYN_SENT) received bare SYN, sending SYN|ACK: SYN_SENT -> SYN_RECEIVED",
            self.ep.id()
        );

        let _ = self.send_open_segment();
        Ok(())
    }

    /// Handles a segment received in the SYN-RCVD state.
    fn syn_rcvd_state(&mut self, s: &Segment) -> Result<()> {
        if s.flag_is_set(Flags::RST) {
            // (RFC 793 p.37) In the SYN-RCVD state, a reset is acceptable
            // if its sequence number is in the window.
            if s.seq_number.in_window(self.ack_num, self.rcv_wnd) {
                warn!(
                    "[{}] (SYN_RECEIVED) received acceptable RST: connection refused",
                    self.ep.id()
                );
                return Err(Error::ConnectionRefused);
            }
            return Ok(());
        }

        if !self.check_ack(s) {
            return Ok(());
        }

        if s.flag_is_set(Flags::SYN) && s.seq_number != self.ack_num - 1u32 {
            // A second SYN with a different sequence number: an incompatible
            // fresh connection attempt. Reset it and, if we opened actively,
            // restart our side with a new ISS and clean options.
            let ack = s.seq_number + s.logical_len();
            let seq = if s.flag_is_set(Flags::ACK) {
                s.ack_number
            } else {
                SeqNum::new(0)
            };
            let _ = self.ep.send_raw(&[], Flags::RST | Flags::ACK, seq, ack, 0);

            if !self.active {
                warn!(
                    "[{}] (SYN_RECEIVED) incompatible second SYN on passive open",
                    self.ep.id()
                );
                return Err(Error::InvalidEndpointState);
            }

            debug!(
                "[{}] (SYN_RECEIVED) incompatible second SYN: restarting with a fresh ISS",
                self.ep.id()
            );

            self.iss = random_iss()?;
            self.mss = 0;
            self.snd_wnd_scale = -1;

            let _ = self.send_open_segment();
            return Ok(());
        }

        // Our SYN was acknowledged: the handshake is completed.
        if s.flag_is_set(Flags::ACK) {
            debug!(
                "[{}] (SYN_RECEIVED) received ACK of SYN: SYN_RECEIVED -> ESTABLISHED",
                self.ep.id()
            );
            self.phase = Phase::Completed;
        }

        Ok(())
    }

    /// Goes through the segment queue and processes up to
    /// [`MAX_SEGMENTS_PER_WAKE`] segments.
    fn process_segments(&mut self) -> Result<()> {
        for _ in 0..MAX_SEGMENTS_PER_WAKE {
            let Some(s) = self.ep.segment_queue.dequeue() else {
                break;
            };

            self.snd_wnd = s.window;
            // The shift applies only once scaling has been confirmed, which
            // cannot have happened before the peer's first SYN.
            if !s.flag_is_set(Flags::SYN) && self.snd_wnd_scale > 0 {
                self.snd_wnd <<= self.snd_wnd_scale as u32;
            }

            match self.phase {
                Phase::SynSent => self.syn_sent_state(&s)?,
                Phase::SynRcvd => self.syn_rcvd_state(&s)?,
                Phase::Completed => {}
            }

            // Stop once the handshake completes; anything left belongs to
            // the main protocol loop.
            if self.phase == Phase::Completed {
                break;
            }
        }

        // If the queue is not empty, make sure we wake up again.
        if !self.ep.segment_queue.is_empty() {
            self.ep.new_segment_waker.assert();
        }

        Ok(())
    }

    /// Executes the TCP 3-way handshake: sends the opening segment and
    /// drives the state machine until it completes or fails.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionRefused`] on an acceptable RST from the peer.
    /// - [`Error::Timeout`] once retransmission intervals exceed 60 s.
    /// - [`Error::Aborted`] if the endpoint is closed mid-handshake.
    /// - [`Error::InvalidEndpointState`] when a passive open sees an
    ///   incompatible second SYN.
    pub(crate) fn execute(&mut self) -> Result<()> {
        let resend_waker = Waker::new();
        let resend_timer = Timer::new(resend_waker.clone());
        let mut timeout = INITIAL_SYN_TIMEOUT;
        resend_timer.reset(timeout);

        let mut sleeper = Sleeper::new();
        sleeper.add_waker(&resend_waker, WAKER_FOR_RESEND);
        sleeper.add_waker(&self.ep.notification_waker, WAKER_FOR_NOTIFICATION);
        sleeper.add_waker(&self.ep.new_segment_waker, WAKER_FOR_NEW_SEGMENT);

        // Send the initial SYN and loop until the handshake completes. The
        // ISS stays fixed across retransmissions of this SYN.
        let _ = self.send_open_segment();
        while self.phase != Phase::Completed {
            match sleeper.fetch(true) {
                Some(WAKER_FOR_RESEND) => {
                    timeout *= 2;
                    if timeout > MAX_SYN_TIMEOUT {
                        warn!(
                            "[{}] ({:?}) handshake retransmission limit reached",
                            self.ep.id(),
                            self.phase
                        );
                        return Err(Error::Timeout);
                    }
                    resend_timer.reset(timeout);
                    let _ = self.send_open_segment();
                }

                Some(WAKER_FOR_NOTIFICATION) => {
                    let n = self.ep.fetch_notifications();
                    if n & NOTIFY_CLOSE != 0 {
                        return Err(Error::Aborted);
                    }
                }

                Some(WAKER_FOR_NEW_SEGMENT) => self.process_segments()?,

                _ => {}
            }
        }

        Ok(())
    }
}

/// Draws four cryptographically random bytes and interprets them
/// little-endian as the initial send sequence number.
fn random_iss() -> Result<SeqNum> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| Error::Rng)?;
    Ok(SeqNum::new(u32::from_le_bytes(bytes)))
}

/// Determines the window scale to use for the given maximum window size.
pub(crate) fn find_wnd_scale(wnd: u32) -> u8 {
    if wnd < 0x10000 {
        return 0;
    }

    let mut max: u64 = 0xFFFF;
    let mut scale = 0;
    while (wnd as u64) > max && scale < MAX_WND_SCALE {
        scale += 1;
        max <<= 1;
    }

    scale
}

/// Parses the options received in a SYN segment and returns the relevant
/// ones. If no window-scale option is present, the scale is returned as -1,
/// because its absence means we cannot use window scaling on the receive
/// end either. `None` means the segment is malformed and must be dropped.
pub(crate) fn parse_syn_options(opts: &[u8]) -> Option<SynOptions> {
    // (RFC 1122 4.2.2.6) If an MSS option is not received at connection
    // setup, TCP MUST assume a default send MSS of 536.
    let mut mss = DEFAULT_TCP_MSS;
    let mut wnd_scale: i8 = -1;

    let limit = opts.len();
    let mut i = 0;
    while i < limit {
        match opts[i] {
            kind if kind == OptionKind::EOL as u8 => {
                i = limit;
            }
            kind if kind == OptionKind::NOP as u8 => {
                i += 1;
            }
            kind if kind == OptionKind::MSS as u8 => {
                if i + 4 > limit || opts[i + 1] != 4 {
                    return None;
                }
                mss = u16::from_be_bytes([opts[i + 2], opts[i + 3]]);
                if mss == 0 {
                    return None;
                }
                i += 4;
            }
            kind if kind == OptionKind::WindowScale as u8 => {
                if i + 3 > limit || opts[i + 1] != 3 {
                    return None;
                }
                wnd_scale = opts[i + 2].min(MAX_WND_SCALE) as i8;
                i += 3;
            }
            _ => {
                // Unrecognized option: skip over it by its length byte.
                if i + 2 > limit {
                    return None;
                }
                let len = opts[i + 1] as usize;
                if len < 2 || i + len > limit {
                    return None;
                }
                i += len;
            }
        }
    }

    Some(SynOptions { mss, wnd_scale })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(0x0000_FFFF => 0; "fits the bare window field")]
    #[test_case(0x0001_0000 => 1; "one past the field needs one shift")]
    #[test_case(0x7FFF_FFFF => 14; "huge windows cap at the RFC limit")]
    #[test_case(4096 => 0; "small windows need no scaling")]
    fn window_scale_derivation(wnd: u32) -> u8 {
        find_wnd_scale(wnd)
    }

    #[test]
    fn iss_draws_show_no_bit_bias() {
        const DRAWS: usize = 10_000;

        let mut ones = [0u32; 32];
        for _ in 0..DRAWS {
            let iss: u32 = random_iss().unwrap().into();
            for (bit, count) in ones.iter_mut().enumerate() {
                *count += (iss >> bit) & 1;
            }
        }

        for (bit, &count) in ones.iter().enumerate() {
            let ratio = count as f64 / DRAWS as f64;
            assert!(
                (0.45..=0.55).contains(&ratio),
                "bit {bit} set in {ratio} of draws"
            );
        }
    }

    #[test]
    fn parses_absent_options_to_defaults() {
        let options = parse_syn_options(&[]).unwrap();
        assert_eq!(options.mss, DEFAULT_TCP_MSS);
        assert_eq!(options.wnd_scale, -1);
    }

    #[test]
    fn parses_mss_and_window_scale() {
        // MSS 1460, NOP, WS 7, EOL.
        let raw = [2, 4, 0x05, 0xb4, 1, 3, 3, 7, 0];
        let options = parse_syn_options(&raw).unwrap();
        assert_eq!(options.mss, 1460);
        assert_eq!(options.wnd_scale, 7);
    }

    #[test]
    fn clamps_oversized_window_scale() {
        let raw = [3, 3, 30];
        let options = parse_syn_options(&raw).unwrap();
        assert_eq!(options.wnd_scale, MAX_WND_SCALE as i8);
    }

    #[test]
    fn skips_unknown_options_by_length() {
        // Timestamps (kind 8, len 10), then MSS.
        let raw = [8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 2, 4, 0x02, 0x00];
        let options = parse_syn_options(&raw).unwrap();
        assert_eq!(options.mss, 512);
    }

    #[test]
    fn rejects_malformed_options() {
        // MSS with a bad length byte.
        assert_eq!(parse_syn_options(&[2, 3, 5, 0xb4]), None);
        // MSS of zero.
        assert_eq!(parse_syn_options(&[2, 4, 0, 0]), None);
        // MSS truncated by the option region.
        assert_eq!(parse_syn_options(&[2, 4, 5]), None);
        // WS truncated.
        assert_eq!(parse_syn_options(&[3, 3]), None);
        // Unknown option with length below the minimum.
        assert_eq!(parse_syn_options(&[77, 1, 0, 0]), None);
        // Unknown option running past the region.
        assert_eq!(parse_syn_options(&[77, 12, 0, 0]), None);
    }

    #[test]
    fn option_encode_parse_round_trip() {
        use super::super::wire::TcpHeader;

        for mss in [1u16, 536, 1460, 65535] {
            for ws in 0..=MAX_WND_SCALE {
                let mut header = TcpHeader::new(1, 2, 0, 0);
                header.set_option_mss(mss).unwrap();
                header.set_option_window_scale(ws).unwrap();

                let parsed = parse_syn_options(header.options().as_slice()).unwrap();
                assert_eq!(parsed.mss, mss);
                assert_eq!(parsed.wnd_scale, ws as i8);
            }
        }
    }

    proptest! {
        /// Arbitrary byte strings either fail cleanly or parse without the
        /// cursor ever leaving the option region.
        #[test]
        fn parser_never_overreads(raw in proptest::collection::vec(any::<u8>(), 0..=40)) {
            // Indexing discipline is what's under test: any over-read
            // panics the case.
            let _ = parse_syn_options(&raw);
        }

        /// A parse that succeeds on a prefix is unaffected by bytes beyond
        /// an EOL terminator.
        #[test]
        fn eol_terminates_parsing(tail in proptest::collection::vec(any::<u8>(), 0..=16)) {
            let mut raw = vec![2u8, 4, 0x05, 0xb4, 0];
            raw.extend(&tail);
            let options = parse_syn_options(&raw).unwrap();
            prop_assert_eq!(options.mss, 1460);
        }
    }
}
