//! The per-connection segment ingress queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use super::segment::Segment;

/// A bounded FIFO of inbound segments, filled by demultiplexing code and
/// drained by the connection's worker in batches.
pub struct SegmentQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    segments: VecDeque<Segment>,
    limit: usize,
}

impl SegmentQueue {
    /// Creates a queue holding at most `limit` segments.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                segments: VecDeque::new(),
                limit,
            }),
        }
    }

    /// Appends a segment, returning `false` (and dropping the segment) when
    /// the queue is full.
    pub fn enqueue(&self, segment: Segment) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.segments.len() >= inner.limit {
            return false;
        }
        inner.segments.push_back(segment);
        true
    }

    /// Removes and returns the oldest queued segment.
    pub fn dequeue(&self) -> Option<Segment> {
        self.inner.lock().unwrap().segments.pop_front()
    }

    /// Returns `true` if no segments are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().segments.is_empty()
    }
}

impl fmt::Debug for SegmentQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("SegmentQueue")
            .field("len", &inner.segments.len())
            .field("limit", &inner.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::seqnum::SeqNum;

    use super::super::segment::Flags;
    use super::*;

    fn segment(seq: u32) -> Segment {
        Segment::new(Flags::ACK, SeqNum::new(seq), SeqNum::new(0), 0)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = SegmentQueue::new(8);
        for seq in 0..4 {
            assert!(queue.enqueue(segment(seq)));
        }

        for seq in 0..4 {
            assert_eq!(queue.dequeue().unwrap().seq_number, SeqNum::new(seq));
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overflowing_segments_are_dropped() {
        let queue = SegmentQueue::new(2);
        assert!(queue.enqueue(segment(0)));
        assert!(queue.enqueue(segment(1)));
        assert!(!queue.enqueue(segment(2)));

        queue.dequeue().unwrap();
        assert!(queue.enqueue(segment(3)));
    }
}
