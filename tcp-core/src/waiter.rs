//! Readiness notification for upper-layer waiters.
//!
//! An endpoint publishes readability and writability changes through its
//! waiter queue. Upper-layer code registers a [`wake::Waker`] with the event
//! mask it cares about and multiplexes it on its own sleeper, the same way
//! the protocol driver multiplexes its internal event sources.

use std::fmt;
use std::sync::Mutex;

use wake::Waker;

/// Bitmask of readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    /// Data (or the peer's FIN) can be read from the endpoint.
    pub const READABLE: EventMask = EventMask(0b01);

    /// The endpoint accepts writes.
    pub const WRITABLE: EventMask = EventMask(0b10);

    /// Both directions at once.
    pub const ALL: EventMask = EventMask(0b11);

    /// Returns `true` if any event in `other` is also in `self`.
    pub fn intersects(self, other: EventMask) -> bool {
        let (EventMask(lhs), EventMask(rhs)) = (self, other);
        lhs & rhs != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, EventMask(rhs): EventMask) -> EventMask {
        let EventMask(lhs) = self;
        EventMask(lhs | rhs)
    }
}

/// A set of upper-layer waiters interested in an endpoint's readiness.
#[derive(Default)]
pub struct WaiterQueue {
    entries: Mutex<Vec<(Waker, EventMask)>>,
}

impl WaiterQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waker to be asserted whenever an event in `mask` fires.
    pub fn register(&self, waker: &Waker, mask: EventMask) {
        self.entries.lock().unwrap().push((waker.clone(), mask));
    }

    /// Asserts every registered waker whose mask intersects `mask`.
    pub fn notify(&self, mask: EventMask) {
        for (waker, interest) in self.entries.lock().unwrap().iter() {
            if interest.intersects(mask) {
                waker.assert();
            }
        }
    }
}

impl fmt::Debug for WaiterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterQueue")
            .field("waiters", &self.entries.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_matches_masks() {
        let queue = WaiterQueue::new();

        let readable = Waker::new();
        let writable = Waker::new();
        queue.register(&readable, EventMask::READABLE);
        queue.register(&writable, EventMask::WRITABLE);

        queue.notify(EventMask::READABLE);
        assert!(readable.is_asserted());
        assert!(!writable.is_asserted());

        readable.clear();

        queue.notify(EventMask::ALL);
        assert!(readable.is_asserted());
        assert!(writable.is_asserted());
    }
}
