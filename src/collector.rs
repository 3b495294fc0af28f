//! The hand-off buffer between the platform reader and the dispatcher.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::event::Event;

/// Unbounded event queue with a producer side (the platform reader) and a
/// consumer side (the dispatcher). The stop flag shares the mutex so one
/// condition variable covers both wakeup reasons. The producer never blocks;
/// between dispatch ticks the queue is bounded only by the heap.
pub(crate) struct Collector {
    state: Mutex<State>,
    readable: Condvar,
}

#[derive(Default)]
struct State {
    queue: Vec<Event>,
    stopped: bool,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            readable: Condvar::new(),
        }
    }

    /// Append one event, waking the dispatcher if it is waiting.
    pub(crate) fn push(&self, event: Event) {
        let mut state = self.state.lock().expect("collector lock poisoned");
        state.queue.push(event);
        self.readable.notify_one();
    }

    /// Atomically swap the queue out and return it; order is preserved.
    pub(crate) fn drain(&self) -> Vec<Event> {
        let mut state = self.state.lock().expect("collector lock poisoned");
        std::mem::take(&mut state.queue)
    }

    /// Request shutdown and wake every waiter.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().expect("collector lock poisoned");
        state.stopped = true;
        self.readable.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().expect("collector lock poisoned").stopped
    }

    /// Block until at least one event is queued or shutdown was requested.
    /// Returns true when shutdown was requested.
    pub(crate) fn wait_ready(&self) -> bool {
        let mut state = self.state.lock().expect("collector lock poisoned");
        while state.queue.is_empty() && !state.stopped {
            state = self
                .readable
                .wait(state)
                .expect("collector lock poisoned");
        }
        state.stopped
    }

    /// Sleep out one batching window: up to `latency`, cut short only by
    /// shutdown. Returns true when shutdown was requested.
    pub(crate) fn wait_window(&self, latency: Duration) -> bool {
        let deadline = Instant::now() + latency;
        let mut state = self.state.lock().expect("collector lock poisoned");
        loop {
            if state.stopped {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return false;
            };
            state = self
                .readable
                .wait_timeout(state, remaining)
                .expect("collector lock poisoned")
                .0;
        }
    }
}
