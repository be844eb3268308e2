//! Edge-triggered wake-up notifications for worker threads sleeping on many
//! event sources at once.
//!
//! A [`Sleeper`] lets a single worker thread wait on any number of event
//! sources with O(1) cost per event, similar to an edge-triggered `epoll`
//! wait: each source of interest is registered once, and the worker then
//! repeatedly waits on all of them together.
//!
//! A [`Waker`] is one such source. It can be associated with at most one
//! sleeper, while a sleeper may own many wakers. The sleeper keeps a list of
//! asserted (ready) wakers; repeated calls to [`Sleeper::fetch`] drain this
//! list, and once it is empty the worker parks until a producer calls
//! [`Waker::assert`].
//!
//! Expected usage, with exactly one thread driving the sleeper:
//!
//! ```
//! use wake::{Sleeper, Waker};
//!
//! const TIMER: usize = 0;
//! const INGRESS: usize = 1;
//!
//! let timer = Waker::new();
//! let ingress = Waker::new();
//!
//! let mut sleeper = Sleeper::new();
//! sleeper.add_waker(&timer, TIMER);
//! sleeper.add_waker(&ingress, INGRESS);
//!
//! ingress.assert();
//!
//! match sleeper.fetch(true) {
//!     Some(TIMER) => { /* timer fired */ }
//!     Some(INGRESS) => { /* new input to process */ }
//!     _ => unreachable!(),
//! }
//! ```
//!
//! Notifications are edge-triggered: any number of [`Waker::assert`] calls
//! between two fetches collapse into a single wake-up, so the handler for a
//! waker must perform all work pending on that source (or re-assert the
//! waker to be woken again).
//!
//! All atomic transitions below use sequentially consistent ordering; the
//! producer/consumer park interlock depends on the stores and loads of the
//! shared list and the waiting slot being mutually ordered.

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

use std::collections::VecDeque;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};

/// `Waker` state: created, not asserted, not associated with a sleeper.
const UNBOUND: usize = 0;

/// `Waker` state: asserted. The next fetch on the owning sleeper (if any)
/// consumes the assertion.
///
/// Any other state value is a pointer obtained from
/// `Arc::into_raw::<SleeperCore>`, which is heap-allocated and therefore
/// never 0 or 1.
const ASSERTED: usize = 1;

/// Waiting slot: no consumer is waiting.
const IDLE: usize = 0;

/// Waiting slot: the consumer is preparing to park. A producer that claims
/// the slot while it holds this value aborts the park before it commits.
const PREPARING: usize = 1;

/// Waiting slot: the consumer has committed to parking. A producer that
/// claims the slot while it holds this value must unpark the thread.
const WAITING: usize = 2;

/// Shared-list sentinel stored by [`Sleeper::done`]. Producers observing it
/// return without enqueueing. Address 1 is unaligned for `WakerCore` and can
/// never be a real node.
const CLOSED: *mut WakerCore = 1 as *mut WakerCore;

/// Shared state of a waker, referenced by every clone of its handle and, one
/// reference count at a time, by the shared list of the sleeper it is queued
/// on.
struct WakerCore {
    /// One of [`UNBOUND`], [`ASSERTED`], or an owned
    /// `Arc::into_raw::<SleeperCore>` pointer to the bound sleeper.
    state: AtomicUsize,

    /// Link used to form the sleeper's shared list. Only meaningful while
    /// this waker is resident in one.
    next: AtomicPtr<WakerCore>,

    /// Value handed back by [`Sleeper::fetch`]. Written by
    /// [`Sleeper::add_waker`] before the binding is published.
    id: AtomicUsize,
}

impl WakerCore {
    fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNBOUND),
            next: AtomicPtr::new(ptr::null_mut()),
            id: AtomicUsize::new(0),
        }
    }
}

impl Drop for WakerCore {
    fn drop(&mut self) {
        // The state word may still own a reference count on the bound
        // sleeper. No other thread can reach this core anymore, so a plain
        // load suffices.
        release_binding(self.state.load(SeqCst));
    }
}

/// Releases the sleeper reference count held by a waker-state word, if the
/// word is a binding.
fn release_binding(state: usize) {
    if state != UNBOUND && state != ASSERTED {
        // SAFETY: any state word other than the two sentinels was produced
        // by `Arc::into_raw` on a `SleeperCore` and owns one count.
        unsafe { drop(Arc::from_raw(state as *const SleeperCore)) };
    }
}

/// A source of wake-up notifications.
///
/// A waker can be associated with at most one [`Sleeper`] at a time, and at
/// any given time is either asserted or not. Once asserted it remains so
/// until [`Waker::clear`] is called or a fetch on its sleeper consumes the
/// assertion.
///
/// Handles are cheap to clone and may be asserted concurrently from any
/// number of threads.
#[derive(Clone)]
pub struct Waker {
    core: Arc<WakerCore>,
}

impl Waker {
    /// Creates a detached waker. Associate it with a sleeper via
    /// [`Sleeper::add_waker`].
    pub fn new() -> Self {
        Self {
            core: Arc::new(WakerCore::new()),
        }
    }

    /// Moves the waker to the asserted state, if it is not asserted yet.
    /// When asserted, the waker causes its sleeper (if any) to wake up.
    ///
    /// Idempotent: asserting an already-asserted waker is a no-op, which
    /// also gives the edge-triggered coalescing behavior.
    pub fn assert(&self) {
        // Already asserted: done, without an interlocked operation.
        if self.core.state.load(SeqCst) == ASSERTED {
            return;
        }

        match self.core.state.swap(ASSERTED, SeqCst) {
            UNBOUND | ASSERTED => {}
            bound => {
                // SAFETY: a non-sentinel state word owns one count on the
                // bound sleeper; the swap transferred it to us.
                let sleeper = unsafe { Arc::from_raw(bound as *const SleeperCore) };
                sleeper.enqueue(self.core.clone());
            }
        }
    }

    /// Moves the waker to the non-asserted state, returning whether it was
    /// asserted beforehand.
    ///
    /// The waker is not removed from the ready list of a sleeper it may be
    /// queued on; the sleeper notices the missing assertion at fetch time
    /// and skips it.
    pub fn clear(&self) -> bool {
        // Not asserted: done, without an interlocked operation.
        if self.core.state.load(SeqCst) != ASSERTED {
            return false;
        }

        self.core
            .state
            .compare_exchange(ASSERTED, UNBOUND, SeqCst, SeqCst)
            .is_ok()
    }

    /// Returns whether the waker is currently asserted.
    pub fn is_asserted(&self) -> bool {
        self.core.state.load(SeqCst) == ASSERTED
    }
}

impl Default for Waker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker")
            .field("id", &self.core.id.load(SeqCst))
            .field("asserted", &self.is_asserted())
            .finish()
    }
}

/// Producer-visible half of a sleeper.
struct SleeperCore {
    /// Stack of asserted wakers. Producers push themselves onto the front
    /// atomically as they become asserted; each resident node holds one
    /// reference count. [`CLOSED`] once the sleeper is done.
    shared_list: AtomicPtr<WakerCore>,

    /// The park interlock slot: [`IDLE`], [`PREPARING`], or [`WAITING`].
    waiting: AtomicUsize,

    /// Handle of the consumer thread, published before [`WAITING`] is ever
    /// stored. Set exactly once; the single-consumer contract means it never
    /// needs to change.
    thread: OnceLock<Thread>,
}

impl SleeperCore {
    /// Pushes an asserted waker onto the shared list and wakes the consumer
    /// if it is parked or preparing to park. Called with one transferred
    /// reference count embodied in `core`.
    fn enqueue(&self, core: Arc<WakerCore>) {
        let node = Arc::into_raw(core) as *mut WakerCore;

        let mut head = self.shared_list.load(SeqCst);
        loop {
            if head == CLOSED {
                // The sleeper is done; nobody will fetch this.
                // SAFETY: `node` came from `Arc::into_raw` above and has not
                // been shared.
                unsafe { drop(Arc::from_raw(node)) };
                return;
            }

            // SAFETY: `node` is not yet visible to the consumer, so its link
            // can be written without contention.
            unsafe { (*node).next.store(head, SeqCst) };

            match self.shared_list.compare_exchange(head, node, SeqCst, SeqCst) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.wake();
    }

    /// Claims the waiting slot and unparks the consumer if it had committed
    /// to parking. Claiming a [`PREPARING`] slot is enough by itself: the
    /// consumer's commit CAS will fail and it will re-check the list.
    fn wake(&self) {
        loop {
            let waiting = self.waiting.load(SeqCst);
            if waiting == IDLE {
                return;
            }

            if self
                .waiting
                .compare_exchange(waiting, IDLE, SeqCst, SeqCst)
                .is_ok()
            {
                if waiting == WAITING {
                    // The consumer published its handle before committing.
                    if let Some(thread) = self.thread.get() {
                        thread.unpark();
                    }
                }
                return;
            }
        }
    }
}

impl Drop for SleeperCore {
    fn drop(&mut self) {
        release_chain(self.shared_list.swap(ptr::null_mut(), SeqCst));
    }
}

/// Releases the reference counts held by a drained shared-list chain.
fn release_chain(mut node: *mut WakerCore) {
    while !node.is_null() && node != CLOSED {
        // SAFETY: every non-sentinel node in a shared list owns one count.
        let core = unsafe { Arc::from_raw(node as *const WakerCore) };
        node = core.next.load(SeqCst);
    }
}

/// Receives wake-up notifications from any number of [`Waker`]s, parking the
/// calling thread when none are pending.
///
/// Exactly one thread may drive a sleeper; the `&mut self` receivers on
/// [`Sleeper::fetch`] and [`Sleeper::add_waker`] enforce this. It is that
/// restriction which allows the fast path to stay lock-free.
pub struct Sleeper {
    core: Arc<SleeperCore>,

    /// Asserted wakers drained from the shared list, in arrival order.
    /// Consumer-private, so no atomics are needed to walk it.
    local_list: VecDeque<Arc<WakerCore>>,
}

impl Sleeper {
    /// Creates a sleeper with no associated wakers.
    pub fn new() -> Self {
        Self {
            core: Arc::new(SleeperCore {
                shared_list: AtomicPtr::new(ptr::null_mut()),
                waiting: AtomicUsize::new(IDLE),
                thread: OnceLock::new(),
            }),
            local_list: VecDeque::new(),
        }
    }

    /// Associates the given waker with this sleeper. `id` is the value
    /// returned by [`Sleeper::fetch`] when woken by this waker.
    ///
    /// If the waker is already asserted it is queued immediately, so the
    /// assertion is not lost.
    pub fn add_waker(&mut self, waker: &Waker, id: usize) {
        waker.core.id.store(id, SeqCst);

        loop {
            let observed = waker.core.state.load(SeqCst);
            if observed == ASSERTED {
                self.core.enqueue(waker.core.clone());
                return;
            }

            let binding = Arc::into_raw(self.core.clone()) as usize;
            match waker
                .core
                .state
                .compare_exchange(observed, binding, SeqCst, SeqCst)
            {
                Ok(_) => {
                    // Binding a waker that was bound elsewhere is a caller
                    // error, but the displaced count must not leak.
                    release_binding(observed);
                    return;
                }
                Err(_) => {
                    // SAFETY: the CAS failed, so the count minted above was
                    // never published.
                    unsafe { drop(Arc::from_raw(binding as *const SleeperCore)) };
                }
            }
        }
    }

    /// Fetches the next wake-up notification.
    ///
    /// If a notification is pending, the id of one asserted waker is
    /// returned right away and that waker transitions back to the bound,
    /// non-asserted state. Otherwise, with `block` set the calling thread
    /// parks until a producer asserts; with `block` unset, `None` is
    /// returned.
    ///
    /// Wakers asserted between two drains of the shared list are returned in
    /// assertion order.
    pub fn fetch(&mut self, block: bool) -> Option<usize> {
        loop {
            if self.local_list.is_empty() && !self.refill(block) {
                return None;
            }

            let core = self
                .local_list
                .pop_front()
                .expect("refill returned with an empty local list");

            // Reassociate the waker with this sleeper. If it is still
            // asserted the notification is delivered; if it was cleared
            // since it queued itself, try the next one.
            let binding = Arc::into_raw(self.core.clone()) as usize;
            match core.state.swap(binding, SeqCst) {
                ASSERTED => return Some(core.id.load(SeqCst)),
                displaced => release_binding(displaced),
            }
        }
    }

    /// Moves the contents of the shared list into the local list, parking
    /// until the shared list is non-empty if `block` is set. Returns whether
    /// the local list is now non-empty.
    fn refill(&mut self, block: bool) -> bool {
        loop {
            let head = self.core.shared_list.load(SeqCst);
            if !head.is_null() {
                debug_assert!(head != CLOSED, "fetch called after done");
                break;
            }

            if !block {
                return false;
            }

            // Announce the upcoming park, then re-check the list: a
            // producer that enqueued before seeing the announcement is
            // caught here, one that enqueued after will claim the slot.
            self.core.waiting.store(PREPARING, SeqCst);
            if !self.core.shared_list.load(SeqCst).is_null() {
                self.core.waiting.store(IDLE, SeqCst);
                continue;
            }

            let _ = self.core.thread.set(thread::current());

            // Commit the park. A producer zeroing the slot in the window
            // since the re-check makes this fail, aborting the park.
            if self
                .core
                .waiting
                .compare_exchange(PREPARING, WAITING, SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }

            // Stale unpark tokens from earlier rounds only cost a spin.
            while self.core.waiting.load(SeqCst) == WAITING {
                thread::park();
            }
        }

        // Pull the shared list out and reverse it into the local list:
        // producers push in LIFO order, reversal restores arrival order.
        let mut node = self.core.shared_list.swap(ptr::null_mut(), SeqCst);
        while !node.is_null() {
            // SAFETY: every node in the shared list owns one count.
            let core = unsafe { Arc::from_raw(node as *const WakerCore) };
            node = core.next.load(SeqCst);
            self.local_list.push_front(core);
        }

        true
    }

    /// Consumes the sleeper. Producers asserting bound wakers afterwards
    /// observe the closed shared list and return without enqueueing.
    pub fn done(self) {
        // Drop does the work. Taking `self` by value (rather than `&mut`)
        // makes a subsequent fetch unrepresentable.
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        release_chain(self.core.shared_list.swap(CLOSED, SeqCst));
        self.local_list.clear();
    }
}

impl Default for Sleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sleeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleeper")
            .field("pending", &self.local_list.len())
            .finish()
    }
}
