//! The main loop of an established TCP connection.
//!
//! Each connection is owned by a single worker thread running
//! [`protocol_main_loop`]. The worker multiplexes six event sources through
//! one sleeper: application writes, the application's close, arriving
//! segments, the retransmission timer, the post-close abort timer, and
//! control notifications. All protocol state is private to the worker
//! between fetches; the coarse work mutex is released only around the
//! blocking fetch, so control-plane code can observe a quiescent driver
//! exactly there.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use wake::{Sleeper, Waker};

use crate::seqnum::SeqNum;
use crate::waiter::EventMask;
use crate::{Error, Result};

use super::endpoint::{
    Endpoint, State, NOTIFY_CLOSE, NOTIFY_NON_ZERO_RECEIVE_WINDOW, NOTIFY_RECEIVE_WINDOW_CHANGED,
};
use super::handshake::Handshake;
use super::receiver::Receiver;
use super::segment::Flags;
use super::sender::Sender;
use super::timer::Timer;
use super::MAX_SEGMENTS_PER_WAKE;

/// Wake-up sources multiplexed by the established-state worker.
const WAKER_FOR_SND: usize = 0;
const WAKER_FOR_SND_CLOSE: usize = 1;
const WAKER_FOR_NEW_SEGMENT: usize = 2;
const WAKER_FOR_ABORT: usize = 3;
const WAKER_FOR_RESEND: usize = 4;
const WAKER_FOR_NOTIFICATION: usize = 5;

/// Grace period between a close request and the forced reset of a
/// connection that has not wound down on its own.
const CLOSE_ABORT_INTERVAL: Duration = Duration::from_secs(3);

/// Runs a connection from (optionally) handshake to terminal state. For an
/// active open (`passive` false, no engines), the worker executes the
/// 3-way handshake first; a passive open's handshake ran before the worker
/// started, and the caller hands in the seeded engines.
///
/// Whatever way the loop exits, waiters of both directions are notified,
/// timers stop, and endpoint cleanup runs if a close requested it.
pub(crate) fn protocol_main_loop(
    ep: Arc<Endpoint>,
    passive: bool,
    engines: Option<(Sender, Receiver)>,
) -> Result<()> {
    let result = run(&ep, passive, engines);

    ep.notify_waiters(EventMask::ALL);
    ep.complete_worker();

    result
}

fn run(ep: &Arc<Endpoint>, passive: bool, engines: Option<(Sender, Receiver)>) -> Result<()> {
    let (snd, rcv) = match engines {
        Some(engines) => engines,
        None if !passive => {
            let rcv_wnd = ep.receive_buffer_available();

            let handshake_result = Handshake::new(Arc::clone(ep), rcv_wnd)
                .and_then(|mut handshake| handshake.execute().map(|()| handshake));

            let handshake = match handshake_result {
                Ok(handshake) => handshake,
                Err(err) => return fail(ep, err),
            };

            // Transfer the handshake state to the connection. Receive
            // window scaling is disabled whenever the peer did not
            // negotiate it.
            let snd = Sender::new(
                Arc::clone(ep),
                handshake.iss,
                handshake.snd_wnd,
                handshake.mss,
                handshake.snd_wnd_scale,
                handshake.ack_num,
            );
            let rcv = Receiver::new(
                Arc::clone(ep),
                handshake.ack_num - 1u32,
                handshake.rcv_wnd,
                handshake.effective_rcv_wnd_scale(),
            );
            (snd, rcv)
        }
        None => return fail(ep, Error::InvalidEndpointState),
    };

    let mut worker = Worker {
        ep: Arc::clone(ep),
        snd,
        rcv,
        close_waker: Waker::new(),
        close_timer: None,
    };
    worker.run()
}

/// Records a terminal failure on the endpoint and propagates it.
fn fail(ep: &Endpoint, err: Error) -> Result<()> {
    ep.set_last_error(err);
    ep.set_hard_error(err);
    ep.set_state(State::Error);
    Err(err)
}

/// The worker-private half of a connection: the endpoint handle plus the
/// send and receive engines.
struct Worker {
    ep: Arc<Endpoint>,
    snd: Sender,
    rcv: Receiver,

    /// Asserted by the close timer once the post-close grace period runs
    /// out.
    close_waker: Waker,
    close_timer: Option<Timer>,
}

impl Worker {
    fn run(&mut self) -> Result<()> {
        self.ep.set_state(State::Connected);
        self.ep.notify_waiters(EventMask::WRITABLE);

        debug!("[{}] (ESTABLISHED) connection established", self.ep.id());

        let resend_waker = self.snd.resend_waker.clone();

        let mut sleeper = Sleeper::new();
        sleeper.add_waker(&self.ep.snd_waker, WAKER_FOR_SND);
        sleeper.add_waker(&self.ep.snd_close_waker, WAKER_FOR_SND_CLOSE);
        sleeper.add_waker(&self.ep.new_segment_waker, WAKER_FOR_NEW_SEGMENT);
        sleeper.add_waker(&self.close_waker, WAKER_FOR_ABORT);
        sleeper.add_waker(&resend_waker, WAKER_FOR_RESEND);
        sleeper.add_waker(&self.ep.notification_waker, WAKER_FOR_NOTIFICATION);

        // Run until both directions have completed: the peer's FIN has been
        // processed, our FIN is queued, and everything up to and including
        // it has been acknowledged.
        let ep = Arc::clone(&self.ep);
        let mut guard = ep.work_mu.lock().unwrap();
        while !self.rcv.closed
            || !self.snd.closed
            || self.snd.snd_una != self.snd.snd_nxt_list
        {
            drop(guard);
            let index = sleeper.fetch(true);
            guard = ep.work_mu.lock().unwrap();

            let keep_running = match index {
                Some(WAKER_FOR_SND) => self.handle_write(),
                Some(WAKER_FOR_SND_CLOSE) => self.handle_close(),
                Some(WAKER_FOR_NEW_SEGMENT) => self.handle_segments(),
                Some(WAKER_FOR_ABORT) => {
                    self.reset_connection(Error::ConnectionAborted);
                    false
                }
                Some(WAKER_FOR_RESEND) => {
                    let (ack, wnd) = self.ack_context();
                    if self.snd.retransmit_timer_expired(ack, wnd) {
                        true
                    } else {
                        self.reset_connection(Error::Timeout);
                        false
                    }
                }
                Some(WAKER_FOR_NOTIFICATION) => self.handle_notifications(),
                _ => true,
            };

            if !keep_running {
                self.snd.stop_timer();
                return Ok(());
            }
        }
        drop(guard);

        self.snd.stop_timer();
        self.ep.set_state(State::Closed);

        debug!("[{}] (CLOSED) connection closed cleanly", self.ep.id());

        Ok(())
    }

    /// The acknowledgment number and advertised window every outbound
    /// segment currently carries.
    fn ack_context(&self) -> (SeqNum, u32) {
        (self.rcv.rcv_nxt, self.rcv.advertised_window())
    }

    /// Moves application bytes from the endpoint's send queue onto the
    /// sender's write list and pushes out what the window allows.
    fn handle_write(&mut self) -> bool {
        // Nothing to do once the send side closed.
        if self.snd.closed {
            return true;
        }

        let (chunks, bytes) = self.ep.take_send_queue();
        self.snd.append_to_write_list(chunks, bytes);

        let (ack, wnd) = self.ack_context();
        self.snd.send_data(ack, wnd);

        true
    }

    /// Drains pending writes, closes the send side, and queues the FIN.
    fn handle_close(&mut self) -> bool {
        if self.snd.closed {
            return true;
        }

        self.handle_write();

        self.snd.close();
        if self.ep.state() == State::Connected {
            self.ep.set_state(State::Closing);
        }

        debug!("[{}] (FIN_WAIT) send side closed", self.ep.id());

        let (ack, wnd) = self.ack_context();
        self.snd.send_data(ack, wnd);

        true
    }

    /// Pulls up to [`MAX_SEGMENTS_PER_WAKE`] segments off the ingress queue
    /// and processes them. Returns `false` when a valid reset ends the
    /// connection; segments still queued at that point die with it.
    fn handle_segments(&mut self) -> bool {
        let mut check_requeue = true;
        for _ in 0..MAX_SEGMENTS_PER_WAKE {
            let Some(mut s) = self.ep.segment_queue.dequeue() else {
                check_requeue = false;
                break;
            };

            if s.flag_is_set(Flags::RST) {
                // (RFC 793 p.37) In all states except SYN-SENT, reset
                // segments are validated by checking their SEQ fields.
                if self.rcv.acceptable(s.seq_number, 0) {
                    warn!(
                        "[{}] (ESTABLISHED) received acceptable RST: connection reset",
                        self.ep.id()
                    );

                    self.ep.set_state(State::Error);
                    self.ep.set_hard_error(Error::ConnectionReset);
                    return false;
                }
            } else if s.flag_is_set(Flags::ACK) {
                // Reconstruct the true window from the 16-bit wire field.
                s.window <<= self.snd.snd_wnd_scale as u32;

                // (RFC 793 p.41) Once established, all segments must carry
                // current acknowledgment information; anything else was
                // discarded above.
                self.rcv.handle_rcvd_segment(&s);
                self.snd.handle_rcvd_segment(&s);
            }
        }

        // If the queue is not empty, make sure we wake up again.
        if check_requeue && !self.ep.segment_queue.is_empty() {
            self.ep.new_segment_waker.assert();
        }

        // Push out anything the batch's acks or window updates made
        // sendable; data segments double as acknowledgments.
        let (ack, wnd) = self.ack_context();
        self.snd.send_data(ack, wnd);

        // Acknowledge everything the batch advanced past.
        if self.rcv.rcv_nxt != self.snd.max_sent_ack {
            let (ack, wnd) = self.ack_context();
            self.snd.send_ack(ack, wnd);
        }

        true
    }

    /// Drains the notification bits posted by the upper layer.
    fn handle_notifications(&mut self) -> bool {
        let notifications = self.ep.fetch_notifications();

        if notifications & NOTIFY_NON_ZERO_RECEIVE_WINDOW != 0 {
            self.rcv.non_zero_window();
            let (ack, wnd) = self.ack_context();
            self.snd.send_ack(ack, wnd);
        }

        if notifications & NOTIFY_RECEIVE_WINDOW_CHANGED != 0 {
            self.rcv.pending_buf_size = self.ep.receive_buffer_size();
        }

        if notifications & NOTIFY_CLOSE != 0 && self.close_timer.is_none() {
            // Reset the connection if it has not wound down by the end of
            // the grace period.
            let timer = Timer::new(self.close_waker.clone());
            timer.reset(CLOSE_ABORT_INTERVAL);
            self.close_timer = Some(timer);
        }

        true
    }

    /// Sends a RST and puts the endpoint into the terminal error state.
    fn reset_connection(&mut self, err: Error) {
        warn!("[{}] resetting connection: {err}", self.ep.id());

        let _ = self.ep.send_raw(
            &[],
            Flags::RST | Flags::ACK,
            self.snd.snd_una,
            self.rcv.rcv_nxt,
            0,
        );

        self.ep.set_state(State::Error);
        self.ep.set_hard_error(err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;

    use crate::protocol::handshake::parse_syn_options;
    use crate::protocol::segment::{Flags, Segment};
    use crate::seqnum::SeqNum;
    use crate::testutil::{new_endpoint, wait_for, MockRoute};
    use crate::{Error, protocol::State};

    /// The peer's fixed ISS used throughout these scenarios.
    const PEER_ISS: u32 = 1000;

    /// Runs an active open against a scripted peer up to the established
    /// state. Returns the endpoint, the route, and our ISS.
    fn establish() -> (Arc<crate::protocol::Endpoint>, Arc<MockRoute>, SeqNum) {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let syn = route.next_segment();
        assert!(syn.flag_is_set(Flags::SYN));
        let iss = syn.seq_number;

        ep.deliver_segment(
            Segment::new(
                Flags::SYN | Flags::ACK,
                SeqNum::new(PEER_ISS),
                iss + 1u32,
                65535,
            )
            .with_options(&[2, 4, 0x05, 0xb4]),
        );

        let ack = route.next_segment();
        assert!(ack.flag_is_set(Flags::ACK));

        wait_for(|| ep.state() == State::Connected);
        (ep, route, iss)
    }

    #[test]
    fn active_open_clean_handshake() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        // The opening SYN advertises our MSS (MTU - 20) and a window scale
        // of zero for a 64 KiB buffer.
        let syn = route.next_segment();
        assert_eq!(syn.flags, Flags::SYN);
        assert_eq!(syn.window, 65535);
        let options = parse_syn_options(syn.options()).unwrap();
        assert_eq!(options.mss, 1460);
        assert_eq!(options.wnd_scale, 0);

        let iss = syn.seq_number;
        ep.deliver_segment(
            Segment::new(
                Flags::SYN | Flags::ACK,
                SeqNum::new(PEER_ISS),
                iss + 1u32,
                65535,
            )
            .with_options(&[2, 4, 0x05, 0xb4, 3, 3, 0, 1]),
        );

        // The handshake completes with a bare ACK of the peer's SYN.
        let ack = route.next_segment();
        assert_eq!(ack.flags, Flags::ACK);
        assert_eq!(ack.seq_number, iss + 1u32);
        assert_eq!(ack.ack_number, SeqNum::new(PEER_ISS + 1));

        wait_for(|| ep.state() == State::Connected);
        assert_eq!(ep.hard_error(), None);
    }

    #[test]
    fn simultaneous_open_transitions_to_syn_rcvd() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let syn = route.next_segment();
        let iss = syn.seq_number;

        // A bare SYN crossing ours on the wire.
        ep.deliver_segment(
            Segment::new(Flags::SYN, SeqNum::new(PEER_ISS), SeqNum::new(0), 65535)
                .with_options(&[2, 4, 0x05, 0xb4]),
        );

        // We acknowledge it with a SYN|ACK, retaining our ISS.
        let syn_ack = route.next_segment();
        assert_eq!(syn_ack.flags, Flags::SYN | Flags::ACK);
        assert_eq!(syn_ack.seq_number, iss);
        assert_eq!(syn_ack.ack_number, SeqNum::new(PEER_ISS + 1));
        assert_eq!(ep.state(), State::Connecting);

        // The peer's ACK of our SYN completes the handshake.
        ep.deliver_segment(Segment::new(
            Flags::ACK,
            SeqNum::new(PEER_ISS + 1),
            iss + 1u32,
            65535,
        ));
        wait_for(|| ep.state() == State::Connected);
    }

    #[test]
    fn handshake_rst_refuses_the_connection() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let syn = route.next_segment();
        ep.deliver_segment(Segment::new(
            Flags::RST | Flags::ACK,
            SeqNum::new(0),
            syn.seq_number + 1u32,
            0,
        ));

        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.hard_error(), Some(Error::ConnectionRefused));
        assert_matches!(ep.take_last_error(), Some(Error::ConnectionRefused));
    }

    #[test]
    fn handshake_rst_without_valid_ack_is_ignored() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let syn = route.next_segment();
        ep.deliver_segment(Segment::new(
            Flags::RST | Flags::ACK,
            SeqNum::new(0),
            syn.seq_number + 7u32,
            0,
        ));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(ep.state(), State::Connecting);
    }

    #[test]
    fn handshake_retransmits_the_same_iss() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let first = route.next_segment();

        // No reply: the SYN is retransmitted after roughly a second, with
        // the ISS unchanged.
        let start = Instant::now();
        let second = route.next_segment();
        let elapsed = start.elapsed();

        assert_eq!(second.flags, Flags::SYN);
        assert_eq!(second.seq_number, first.seq_number);
        assert!(elapsed >= Duration::from_millis(500), "retransmitted at {elapsed:?}");

        drop(ep);
    }

    #[test]
    fn close_during_handshake_aborts() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let _syn = route.next_segment();
        ep.close();

        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.hard_error(), Some(Error::Aborted));
    }

    #[test]
    fn established_rst_resets_the_connection() {
        let (ep, _route, _iss) = establish();

        ep.deliver_segment(Segment::new(
            Flags::RST,
            SeqNum::new(PEER_ISS + 1),
            SeqNum::new(0),
            0,
        ));

        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.hard_error(), Some(Error::ConnectionReset));
    }

    #[test]
    fn established_rst_outside_window_is_ignored() {
        let (ep, _route, _iss) = establish();

        // A sequence number far outside the receive window.
        ep.deliver_segment(Segment::new(
            Flags::RST,
            SeqNum::new(PEER_ISS) + 0x0010_0000u32,
            SeqNum::new(0),
            0,
        ));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(ep.state(), State::Connected);
    }

    #[test]
    fn established_rst_discards_rest_of_batch() {
        let (ep, _route, iss) = establish();

        // A reset with trailing segments: the driver exits at the reset and
        // never returns for the rest.
        ep.deliver_segment(Segment::new(
            Flags::RST,
            SeqNum::new(PEER_ISS + 1),
            SeqNum::new(0),
            0,
        ));
        ep.deliver_segment(
            Segment::new(Flags::ACK, SeqNum::new(PEER_ISS + 1), iss + 1u32, 65535)
                .with_payload(b"dead letters"),
        );

        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.read(), Err(Error::WouldBlock) | Err(Error::ClosedForReceive));
    }

    #[test]
    fn write_emits_data_and_consumes_acks() {
        let (ep, route, iss) = establish();

        ep.write(b"hello").unwrap();

        let data = route.next_segment();
        assert!(data.flag_is_set(Flags::ACK));
        assert_eq!(data.seq_number, iss + 1u32);
        assert_eq!(data.ack_number, SeqNum::new(PEER_ISS + 1));
        assert_eq!(data.payload, b"hello");

        // Acknowledge it so the retransmission timer stands down.
        ep.deliver_segment(Segment::new(
            Flags::ACK,
            SeqNum::new(PEER_ISS + 1),
            iss + 6u32,
            65535,
        ));

        // No retransmission should follow.
        assert!(route.try_next_segment(Duration::from_millis(1500)).is_none());
    }

    #[test]
    fn unacked_data_is_retransmitted() {
        let (ep, route, iss) = establish();

        ep.write(b"needs delivery").unwrap();

        let first = route.next_segment();
        let second = route.next_segment();

        assert_eq!(first.seq_number, iss + 1u32);
        assert_eq!(second.seq_number, iss + 1u32);
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn peer_data_is_delivered_and_acked() {
        let (ep, route, iss) = establish();

        ep.deliver_segment(
            Segment::new(
                Flags::ACK | Flags::PSH,
                SeqNum::new(PEER_ISS + 1),
                iss + 1u32,
                65535,
            )
            .with_payload(b"from peer"),
        );

        let ack = route.next_segment();
        assert!(ack.flag_is_set(Flags::ACK));
        assert_eq!(ack.ack_number, SeqNum::new(PEER_ISS + 1 + 9));

        wait_for(|| ep.read().is_ok() || ep.state() != State::Connected);
    }

    #[test]
    fn out_of_order_data_is_not_delivered() {
        let (ep, _route, iss) = establish();

        // A segment one byte past the expected sequence number.
        ep.deliver_segment(
            Segment::new(
                Flags::ACK | Flags::PSH,
                SeqNum::new(PEER_ISS + 2),
                iss + 1u32,
                65535,
            )
            .with_payload(b"early"),
        );

        thread::sleep(Duration::from_millis(100));
        assert_matches!(ep.read(), Err(Error::WouldBlock));
    }

    #[test]
    fn window_update_releases_buffered_data() {
        let (ep, route) = new_endpoint(65535);
        ep.connect().unwrap();

        let syn = route.next_segment();
        let iss = syn.seq_number;

        // The peer opens with a zero window.
        ep.deliver_segment(
            Segment::new(Flags::SYN | Flags::ACK, SeqNum::new(PEER_ISS), iss + 1u32, 0)
                .with_options(&[2, 4, 0x05, 0xb4]),
        );
        let _ack = route.next_segment();
        wait_for(|| ep.state() == State::Connected);

        // Writes park on the write list while the window is closed.
        ep.write(b"parked").unwrap();
        assert!(route.try_next_segment(Duration::from_millis(300)).is_none());

        // A window update releases them.
        ep.deliver_segment(Segment::new(
            Flags::ACK,
            SeqNum::new(PEER_ISS + 1),
            iss + 1u32,
            1024,
        ));
        let data = route.next_segment();
        assert_eq!(data.payload, b"parked");
        assert_eq!(data.seq_number, iss + 1u32);
    }

    #[test]
    fn orderly_close_walks_to_closed() {
        let (ep, route, iss) = establish();

        ep.write(b"last words").unwrap();
        let data = route.next_segment();
        assert_eq!(data.payload, b"last words");

        // Peer acks the data, then the application closes.
        ep.deliver_segment(Segment::new(
            Flags::ACK,
            SeqNum::new(PEER_ISS + 1),
            iss + 11u32,
            65535,
        ));
        ep.close();

        let fin = route.next_segment();
        assert!(fin.flag_is_set(Flags::FIN));
        assert_eq!(fin.seq_number, iss + 11u32);

        wait_for(|| ep.state() == State::Closing);

        // Peer acknowledges our FIN and sends its own.
        ep.deliver_segment(Segment::new(
            Flags::ACK | Flags::FIN,
            SeqNum::new(PEER_ISS + 1),
            iss + 12u32,
            65535,
        ));

        // Our side acknowledges the peer's FIN and the connection closes.
        let last_ack = route.next_segment();
        assert_eq!(last_ack.ack_number, SeqNum::new(PEER_ISS + 2));

        wait_for(|| ep.state() == State::Closed);
        assert_eq!(ep.hard_error(), None);
        assert_matches!(ep.read(), Err(Error::ClosedForReceive));
    }

    #[test]
    fn close_without_peer_fin_aborts_after_grace_period() {
        let (ep, route, _iss) = establish();

        ep.close();
        let fin = route.next_segment();
        assert!(fin.flag_is_set(Flags::FIN));

        // The peer never answers; after the grace period the worker resets.
        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.hard_error(), Some(Error::ConnectionAborted));

        // The reset went out on the wire.
        let rst = route.segments_seen()
            .into_iter()
            .find(|s| s.flag_is_set(Flags::RST));
        assert!(rst.is_some());
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let (ep, route, _iss) = establish();

        ep.close();
        let _fin = route.next_segment();
        assert_matches!(ep.write(b"too late"), Err(Error::ClosedForSend));
    }

    #[test]
    fn passive_worker_drives_preseeded_engines() {
        use crate::protocol::driver::protocol_main_loop;
        use crate::protocol::receiver::Receiver;
        use crate::protocol::sender::Sender;

        let (ep, route) = new_endpoint(65535);

        let iss = SeqNum::new(9000);
        let irs = SeqNum::new(PEER_ISS);
        let snd = Sender::new(Arc::clone(&ep), iss, 65535, 1460, -1, irs + 1u32);
        let rcv = Receiver::new(Arc::clone(&ep), irs, 65535, 0);

        let worker = {
            let ep = Arc::clone(&ep);
            thread::spawn(move || protocol_main_loop(ep, true, Some((snd, rcv))))
        };

        wait_for(|| ep.state() == State::Connected);

        ep.deliver_segment(Segment::new(
            Flags::RST,
            SeqNum::new(PEER_ISS + 1),
            SeqNum::new(0),
            0,
        ));

        wait_for(|| ep.state() == State::Error);
        assert_matches!(ep.hard_error(), Some(Error::ConnectionReset));
        worker.join().unwrap().unwrap();
        drop(route);
    }
}
