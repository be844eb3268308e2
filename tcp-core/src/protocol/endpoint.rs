//! The per-connection TCP endpoint.
//!
//! An [`Endpoint`] is shared between the upper layer, the demultiplexer, and
//! the connection's worker thread. All protocol state lives in the worker
//! (see [`super::driver`]); the upper layer interacts only through atomic
//! notification bits, short critical sections on the send and receive
//! buffers, and waker assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};
use wake::Waker;

use crate::route::Route;
use crate::seqnum::SeqNum;
use crate::waiter::{EventMask, WaiterQueue};
use crate::{Error, Result};

use super::driver;
use super::segment::{Flags, Segment};
use super::segment_queue::SegmentQueue;
use super::socket::ConnectionId;
use super::wire::TcpHeader;

/// Close was requested; the worker winds the connection down.
pub(crate) const NOTIFY_CLOSE: u32 = 1 << 0;

/// The application drained a previously-full receive buffer; the peer must
/// be told the window reopened.
pub(crate) const NOTIFY_NON_ZERO_RECEIVE_WINDOW: u32 = 1 << 1;

/// The receive buffer was resized; the receiver refreshes its pending
/// buffer size.
pub(crate) const NOTIFY_RECEIVE_WINDOW_CHANGED: u32 = 1 << 2;

/// Upper bound on queued, not-yet-processed inbound segments. Segments
/// arriving beyond it are dropped; the peer retransmits.
const SEGMENT_QUEUE_LEN: usize = 512;

/// Connection states published to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Endpoint exists but no connection attempt has started.
    Initial,
    /// The three-way handshake is in flight.
    Connecting,
    /// Data transfer in both directions.
    Connected,
    /// A close was requested; the worker is draining pending data.
    Closing,
    /// Both directions have shut down cleanly.
    Closed,
    /// Terminal failure. The hard-error slot holds the cause.
    Error,
}

/// Application bytes queued for the sender, and the send-side close latch.
/// The worker moves the chunks onto its write list in bulk.
struct SndQueue {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    closed: bool,
}

/// Worker lifecycle flags.
struct WorkerFlags {
    running: bool,
    cleanup: bool,
}

/// A TCP connection endpoint.
///
/// Create with [`Endpoint::new`], start with [`Endpoint::connect`], then
/// [`Endpoint::write`] / [`Endpoint::read`] / [`Endpoint::close`]. Readiness
/// changes are published through the waiter queue.
pub struct Endpoint {
    id: ConnectionId,
    route: Arc<dyn Route>,

    state: Mutex<State>,
    hard_error: Mutex<Option<Error>>,
    last_error: Mutex<Option<Error>>,

    /// Upper-layer readiness subscriptions.
    waiter_queue: WaiterQueue,

    /// Inbound segments awaiting the worker.
    pub(crate) segment_queue: SegmentQueue,

    /// Pending notification bits, drained by the worker with
    /// [`Endpoint::fetch_notifications`].
    notification_flags: AtomicU32,

    /// The send queue and its bookkeeping (the send-buffer mutex).
    snd_queue: Mutex<SndQueue>,

    /// In-order data delivered by the receiver, awaiting application reads
    /// (the receive-list mutex).
    rcv_list: Mutex<VecDeque<Vec<u8>>>,
    rcv_buf_size: AtomicU32,
    rcv_buf_used: AtomicU32,
    rcv_closed: AtomicBool,

    /// Serializes worker handlers against control-plane mutation. The
    /// worker holds it at all times except across its blocking fetch.
    pub(crate) work_mu: Mutex<()>,

    worker: Mutex<WorkerFlags>,

    /// Asserted by the demultiplexer when segments arrive.
    pub(crate) new_segment_waker: Waker,
    /// Asserted when the application queues bytes to send.
    pub(crate) snd_waker: Waker,
    /// Asserted when the application closes the send side.
    pub(crate) snd_close_waker: Waker,
    /// Asserted when notification bits are posted.
    pub(crate) notification_waker: Waker,
}

impl Endpoint {
    /// Creates an endpoint for the given connection identity and route, with
    /// a receive buffer of `rcv_buf_size` bytes.
    pub fn new(id: ConnectionId, route: Arc<dyn Route>, rcv_buf_size: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            route,
            state: Mutex::new(State::Initial),
            hard_error: Mutex::new(None),
            last_error: Mutex::new(None),
            waiter_queue: WaiterQueue::new(),
            segment_queue: SegmentQueue::new(SEGMENT_QUEUE_LEN),
            notification_flags: AtomicU32::new(0),
            snd_queue: Mutex::new(SndQueue {
                chunks: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            rcv_list: Mutex::new(VecDeque::new()),
            rcv_buf_size: AtomicU32::new(rcv_buf_size),
            rcv_buf_used: AtomicU32::new(0),
            rcv_closed: AtomicBool::new(false),
            work_mu: Mutex::new(()),
            worker: Mutex::new(WorkerFlags {
                running: false,
                cleanup: false,
            }),
            new_segment_waker: Waker::new(),
            snd_waker: Waker::new(),
            snd_close_waker: Waker::new(),
            notification_waker: Waker::new(),
        })
    }

    /// Returns the connection identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the current connection state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Returns the terminal error, if the connection has failed.
    pub fn hard_error(&self) -> Option<Error> {
        *self.hard_error.lock().unwrap()
    }

    /// Takes the most recent transient error, clearing the slot.
    pub fn take_last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().take()
    }

    /// Registers an upper-layer waker for the given readiness events.
    pub fn register_waiter(&self, waker: &Waker, mask: EventMask) {
        self.waiter_queue.register(waker, mask);
    }

    /// Initiates an active open: spawns the connection's worker thread,
    /// which runs the three-way handshake and then drives the established
    /// connection until it terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint has already been connected.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Initial {
                return Err(Error::InvalidEndpointState);
            }
            *state = State::Connecting;
        }
        self.worker.lock().unwrap().running = true;

        debug!("[{}] (CLOSED) active open: CLOSED -> SYN_SENT", self.id);

        let ep = Arc::clone(self);
        thread::spawn(move || {
            let _ = driver::protocol_main_loop(ep, false, None);
        });

        Ok(())
    }

    /// Queues application bytes for transmission and wakes the worker.
    /// The entire buffer is accepted; the sender paces it onto the wire
    /// within the peer's window.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not established or the send
    /// side has been closed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.state() {
            // Writes during Closing fall through to the send-side check
            // below and fail with the precise cause.
            State::Connected | State::Closing => {}
            State::Connecting => return Err(Error::WouldBlock),
            _ => return Err(Error::InvalidEndpointState),
        }

        {
            let mut snd = self.snd_queue.lock().unwrap();
            if snd.closed {
                return Err(Error::ClosedForSend);
            }
            snd.chunks.push_back(buf.to_vec());
            snd.bytes += buf.len();
        }

        self.snd_waker.assert();
        Ok(buf.len())
    }

    /// Reads one chunk of in-order data delivered by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WouldBlock`] when no data is ready, and
    /// [`Error::ClosedForReceive`] once the peer's FIN has been processed
    /// and the receive list drained.
    pub fn read(&self) -> Result<Vec<u8>> {
        let chunk = {
            let mut rcv_list = self.rcv_list.lock().unwrap();
            match rcv_list.pop_front() {
                Some(chunk) => chunk,
                None => {
                    if self.rcv_closed.load(Ordering::SeqCst) {
                        return Err(Error::ClosedForReceive);
                    }
                    return Err(Error::WouldBlock);
                }
            }
        };

        let before = self
            .rcv_buf_used
            .fetch_sub(chunk.len() as u32, Ordering::SeqCst);

        // If the advertised window had collapsed to zero, the drain reopened
        // it; the worker tells the peer.
        if before >= self.receive_buffer_size() {
            self.notify(NOTIFY_NON_ZERO_RECEIVE_WINDOW);
        }

        Ok(chunk)
    }

    /// Resizes the receive buffer and lets the worker pick up the new
    /// advertised window.
    pub fn set_receive_buffer_size(&self, size: u32) {
        self.rcv_buf_size.store(size, Ordering::SeqCst);
        self.notify(NOTIFY_RECEIVE_WINDOW_CHANGED);
    }

    /// Closes the endpoint: the send side emits a FIN after draining
    /// pending writes, and if the connection has not wound down within the
    /// abort interval the worker resets it. Resources are reclaimed when
    /// the worker exits.
    pub fn close(&self) {
        self.shutdown_write();
        self.worker.lock().unwrap().cleanup = true;
        self.notify(NOTIFY_CLOSE);
    }

    /// Closes only the send side: pending writes are drained, then a FIN is
    /// emitted. Further writes fail with [`Error::ClosedForSend`].
    pub fn shutdown_write(&self) {
        {
            let mut snd = self.snd_queue.lock().unwrap();
            if snd.closed {
                return;
            }
            snd.closed = true;
        }
        self.snd_close_waker.assert();
    }

    /// Hands an inbound segment to the connection. Called by demultiplexing
    /// code (and tests) for every segment addressed to this endpoint's
    /// 4-tuple.
    pub fn deliver_segment(&self, segment: Segment) {
        if !self.segment_queue.enqueue(segment) {
            warn!("[{}] ingress queue full: dropping segment", self.id);
            return;
        }
        self.new_segment_waker.assert();
    }

    /// Current receive buffer size in bytes.
    pub(crate) fn receive_buffer_size(&self) -> u32 {
        self.rcv_buf_size.load(Ordering::SeqCst)
    }

    /// Receive buffer space not yet consumed by queued data.
    pub(crate) fn receive_buffer_available(&self) -> u32 {
        self.receive_buffer_size()
            .saturating_sub(self.rcv_buf_used.load(Ordering::SeqCst))
    }

    /// Appends in-order payload for the application and signals readers.
    /// Called by the receiver on the worker thread.
    pub(crate) fn deliver_to_receive_list(&self, payload: Vec<u8>) {
        self.rcv_buf_used
            .fetch_add(payload.len() as u32, Ordering::SeqCst);
        self.rcv_list.lock().unwrap().push_back(payload);
        self.waiter_queue.notify(EventMask::READABLE);
    }

    /// Marks the receive side closed (peer FIN processed) and signals
    /// readers so they observe end-of-stream.
    pub(crate) fn mark_receive_closed(&self) {
        self.rcv_closed.store(true, Ordering::SeqCst);
        self.waiter_queue.notify(EventMask::READABLE);
    }

    /// Moves every queued send chunk out, returning the chunks and their
    /// total byte count. Runs under the send-buffer mutex; the worker is
    /// the only caller.
    pub(crate) fn take_send_queue(&self) -> (VecDeque<Vec<u8>>, usize) {
        let mut snd = self.snd_queue.lock().unwrap();
        let bytes = snd.bytes;
        snd.bytes = 0;
        (std::mem::take(&mut snd.chunks), bytes)
    }

    /// Posts notification bits and wakes the worker.
    pub(crate) fn notify(&self, bits: u32) {
        self.notification_flags.fetch_or(bits, Ordering::SeqCst);
        self.notification_waker.assert();
    }

    /// Reads and clears the pending notification bits.
    pub(crate) fn fetch_notifications(&self) -> u32 {
        self.notification_flags.swap(0, Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn set_hard_error(&self, err: Error) {
        *self.hard_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn set_last_error(&self, err: Error) {
        *self.last_error.lock().unwrap() = Some(err);
    }

    /// Notifies upper-layer waiters of readiness changes.
    pub(crate) fn notify_waiters(&self, mask: EventMask) {
        self.waiter_queue.notify(mask);
    }

    /// Called by the worker as it exits: marks it stopped and runs cleanup
    /// if a close requested it.
    pub(crate) fn complete_worker(&self) {
        let cleanup = {
            let mut worker = self.worker.lock().unwrap();
            worker.running = false;
            worker.cleanup
        };

        if cleanup {
            self.cleanup();
        }
    }

    /// Releases per-connection resources once the worker is gone.
    fn cleanup(&self) {
        while self.segment_queue.dequeue().is_some() {}
        let mut snd = self.snd_queue.lock().unwrap();
        snd.chunks.clear();
        snd.bytes = 0;
    }

    /// Sends a TCP segment to the peer with the given payload, flags, and
    /// sequence numbers. The advertised window is clamped to the 16-bit
    /// wire field; the receiver of a scaled connection reconstructs it.
    pub(crate) fn send_raw(
        &self,
        payload: &[u8],
        flags: Flags,
        seq: SeqNum,
        ack: SeqNum,
        wnd: u32,
    ) -> Result<()> {
        let mut header = TcpHeader::new(
            self.id.local.port,
            self.id.remote.port,
            seq.into(),
            wnd.min(0xFFFF) as u16,
        );
        header.set_flags(flags);
        header.set_ack_number(ack.into());

        self.send_header(header, payload)
    }

    /// Sends a SYN (or SYN|ACK) segment carrying the MSS and window-scale
    /// options. The MSS advertises the route MTU minus the minimum TCP
    /// header; the WS option is omitted when `rcv_wnd_scale` is negative
    /// (scaling disabled because the peer lacks it).
    pub(crate) fn send_syn(
        &self,
        flags: Flags,
        seq: SeqNum,
        ack: SeqNum,
        rcv_wnd: u32,
        rcv_wnd_scale: i8,
    ) -> Result<()> {
        let mss = self.route.mtu() - TcpHeader::MIN_HEADER_LEN;

        let mut header = TcpHeader::new(
            self.id.local.port,
            self.id.remote.port,
            seq.into(),
            rcv_wnd.min(0xFFFF) as u16,
        );
        header.set_flags(flags);
        header.set_ack_number(ack.into());
        header.set_option_mss(mss)?;
        if rcv_wnd_scale >= 0 {
            header.set_option_window_scale(rcv_wnd_scale as u8)?;
        }

        self.send_header(header, &[])
    }

    fn send_header(&self, mut header: TcpHeader, payload: &[u8]) -> Result<()> {
        header.set_checksum(self.id.local.addr, self.id.remote.addr, payload);

        let (raw, nbytes) = header.to_be_bytes();
        let mut packet = Vec::with_capacity(nbytes + payload.len());
        packet.extend_from_slice(&raw[..nbytes]);
        packet.extend_from_slice(payload);

        self.route.write_packet(&packet)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
