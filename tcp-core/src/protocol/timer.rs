//! Waker-asserting one-shot timers.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wake::Waker;

/// A one-shot timer that asserts a [`Waker`] when it expires.
///
/// The timer starts disarmed. [`Timer::reset`] (re)arms it with a new
/// deadline, [`Timer::stop`] disarms it; both may race an in-flight
/// expiration, in which case the deadline check under the lock decides who
/// wins. Dropping the timer shuts the worker thread down.
pub struct Timer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl Timer {
    /// Creates a disarmed timer that asserts `waker` on expiration.
    pub fn new(waker: Waker) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }

                    match state.deadline {
                        None => {
                            state = shared.cond.wait(state).unwrap();
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now < deadline {
                                let (guard, _) = shared
                                    .cond
                                    .wait_timeout(state, deadline - now)
                                    .unwrap();
                                state = guard;
                                // A reset or stop may have replaced the
                                // deadline while we slept; loop and re-read.
                                continue;
                            }

                            state.deadline = None;
                            waker.assert();
                        }
                    }
                }
            })
        };

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Arms the timer to expire `after` from now, replacing any previous
    /// deadline.
    pub fn reset(&self, after: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        state.deadline = Some(Instant::now() + after);
        self.shared.cond.notify_one();
    }

    /// Disarms the timer. An expiration that has already asserted the waker
    /// is not recalled.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.deadline = None;
        self.shared.cond.notify_one();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("Timer")
            .field("armed", &state.deadline.is_some())
            .finish()
    }
}
