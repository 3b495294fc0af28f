//! Lifecycle shared by the platform sources.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::collector::Collector;
use crate::event::{Event, EventType};

/// Diagnostic path carried by the startup-failure event.
pub(crate) const OPEN_FAILED: &str = "Failed to open directory.";

#[derive(Debug, Error)]
pub(crate) enum WatchError {
    #[error("filewatching backend error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[cfg(target_os = "linux")]
    #[error("inotify error: {0}")]
    Inotify(#[from] nix::Error),
    #[cfg(windows)]
    #[error("filewatching failed to start: {0}")]
    Setup(String),
}

const INIT: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;
const FAILED: u8 = 4;

/// The state machine every source drives: `Init -> Running -> Stopping ->
/// Stopped`, with the failure branch `Init -> Failed -> Stopped`.
/// `is_watching` is true only in `Running`, and once it turns false it
/// stays false for the instance's lifetime.
pub(crate) struct SourceState {
    state: AtomicU8,
}

impl SourceState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(INIT),
        }
    }

    pub(crate) fn is_watching(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// `Init -> Running`. Returns false when shutdown or failure won the
    /// race; the reader must unwind instead of entering its loop.
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(INIT, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Init | Running -> Stopping`. The reader observes this and exits.
    pub(crate) fn request_stop(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire);
        let _ = self
            .state
            .compare_exchange(INIT, STOPPING, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPING
    }

    /// Terminal transition once the reader has exited and native handles
    /// are released.
    pub(crate) fn stopped(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    /// Startup failure: emit the single FAILED event and leave `Running`
    /// unreachable.
    pub(crate) fn fail(&self, collector: &Collector) {
        self.die(collector, OPEN_FAILED);
    }

    /// The watch died; emit a FAILED event with `diagnostic` as its path.
    /// Used for startup failures and for unrecoverable mid-run errors.
    pub(crate) fn die(&self, collector: &Collector, diagnostic: &str) {
        debug!(diagnostic, "watch failed");
        self.state.store(FAILED, Ordering::Release);
        collector.push(Event::new(diagnostic, EventType::FAILED));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn watching_only_while_running() {
        let state = SourceState::new();
        assert!(!state.is_watching());
        assert!(state.start());
        assert!(state.is_watching());
        state.request_stop();
        assert!(!state.is_watching());
        state.stopped();
        assert!(!state.is_watching());
    }

    #[test]
    fn stop_request_beats_start() {
        let state = SourceState::new();
        state.request_stop();
        assert!(!state.start());
        assert!(state.stop_requested());
    }

    #[test]
    fn failure_emits_one_failed_event() {
        let collector = Collector::new();
        let state = SourceState::new();
        state.fail(&collector);
        state.stopped();

        let drained = collector.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].path.as_os_str(), OPEN_FAILED);
        assert_eq!(drained[0].kind, EventType::FAILED);
        assert!(!state.is_watching());
    }
}
