//! Shared helpers for the protocol tests: an in-memory route that captures
//! emitted segments, and polling utilities.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::segment::Segment;
use crate::protocol::socket::{ConnectionId, SocketAddr};
use crate::protocol::wire::TcpHeader;
use crate::protocol::Endpoint;
use crate::route::Route;
use crate::{Error, Result};

/// How long test helpers wait before declaring the worker stuck.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A route that captures every emitted packet for the test to inspect.
pub(crate) struct MockRoute {
    mtu: u16,
    id: ConnectionId,
    inner: Mutex<Inner>,
    cond: Condvar,
}

#[derive(Default)]
struct Inner {
    /// Raw packets not yet consumed by the test.
    queue: VecDeque<Vec<u8>>,
    /// Every packet ever emitted, parsed.
    seen: Vec<Segment>,
}

impl MockRoute {
    pub(crate) fn new(mtu: u16, id: ConnectionId) -> Self {
        Self {
            mtu,
            id,
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
        }
    }

    /// Returns the next emitted segment, verifying its checksum against the
    /// connection's address pair. Panics if none arrives in time.
    pub(crate) fn next_segment(&self) -> Segment {
        self.try_next_segment(TEST_TIMEOUT)
            .expect("no segment emitted before the test timeout")
    }

    /// Like [`MockRoute::next_segment`], but with a caller-chosen timeout
    /// and no panic.
    pub(crate) fn try_next_segment(&self, timeout: Duration) -> Option<Segment> {
        let deadline = Instant::now() + timeout;

        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(raw) = inner.queue.pop_front() {
                return Some(self.parse(&raw));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Every segment emitted so far, including already-consumed ones.
    pub(crate) fn segments_seen(&self) -> Vec<Segment> {
        self.inner.lock().unwrap().seen.clone()
    }

    fn parse(&self, raw: &[u8]) -> Segment {
        let header = TcpHeader::try_from(raw).expect("emitted an unparseable header");

        let payload = &raw[header.header_len()..];
        assert!(
            header.is_valid_checksum(self.id.local.addr, self.id.remote.addr, payload),
            "emitted segment carries a bad checksum"
        );
        assert_eq!(header.src_port(), self.id.local.port);
        assert_eq!(header.dst_port(), self.id.remote.port);

        Segment::parse(raw).expect("emitted an unparseable segment")
    }
}

impl Route for MockRoute {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(segment) = Segment::parse(packet) {
            inner.seen.push(segment);
        } else {
            return Err(Error::MalformedSegment);
        }

        inner.queue.push_back(packet.to_vec());
        self.cond.notify_all();
        Ok(())
    }
}

/// Builds an endpoint over a fresh mock route with an MTU of 1480 (so the
/// advertised MSS is 1460).
pub(crate) fn new_endpoint(rcv_wnd: u32) -> (Arc<Endpoint>, Arc<MockRoute>) {
    let id = ConnectionId {
        local: SocketAddr {
            addr: [192, 168, 0, 1],
            port: 8080,
        },
        remote: SocketAddr {
            addr: [192, 168, 0, 44],
            port: 443,
        },
    };

    let route = Arc::new(MockRoute::new(1480, id));
    let ep = Endpoint::new(id, Arc::clone(&route) as Arc<dyn Route>, rcv_wnd);
    (ep, route)
}

/// Polls `pred` until it holds, panicking past the test timeout.
pub(crate) fn wait_for(pred: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !pred() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
