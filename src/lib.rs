//! Recursive filesystem watching with batched, root-relative events.
//!
//! A [`FileSystemWatcher`] observes one directory tree through the native
//! change API of the platform and delivers batches of [`Event`]s to a
//! callback. Within each latency window, events for the same path are
//! coalesced into one event whose [`EventType`] is the union of the
//! observed flags.
//!
//! Two threads run per watcher: a platform reader that blocks on the native
//! API and decodes its records, and a dispatcher that drains the shared
//! queue once per latency window and runs the callback. Dropping the
//! watcher stops and joins both; no callback runs after the drop returns.

#![deny(clippy::all)]

// windows -> ReadDirectoryChangesW, native recursive watch
// linux -> inotify, manual per-directory recursive bookkeeping
// macos -> FSEvents run loop, native recursive watch

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

mod collector;
mod dispatcher;
pub mod event;
#[cfg(target_os = "macos")]
mod fsevent;
#[cfg(target_os = "linux")]
mod inotify;
mod normalize;
mod source;
#[cfg(windows)]
mod windows;

pub use event::{buffer_overflow, created, deleted, failed, modified, renamed, Batch, Event,
                EventType};

use collector::Collector;
use dispatcher::Dispatcher;
#[cfg(target_os = "macos")]
use fsevent::{FsEventSource as PlatformSource, MIN_LATENCY};
#[cfg(target_os = "linux")]
use inotify::{InotifySource as PlatformSource, MIN_LATENCY};
use source::SourceState;
#[cfg(windows)]
use windows::{DirChangesSource as PlatformSource, MIN_LATENCY};

/// Watches a directory tree and delivers batches of root-relative change
/// events to a callback.
///
/// Construction starts the watch; dropping the watcher tears it down,
/// joining both internal threads. The callback runs on the dispatch thread
/// with no internal lock held, so it may block or even drop the watcher
/// without deadlocking.
pub struct FileSystemWatcher {
    source: PlatformSource,
    dispatcher: Dispatcher,
    state: Arc<SourceState>,
    root: PathBuf,
    latency: Duration,
}

impl FileSystemWatcher {
    /// Start watching `root`, delivering at most one batch per `latency`.
    ///
    /// The constructor itself does not fail: a root that does not exist or
    /// is not a directory surfaces as a single [`EventType::FAILED`] event
    /// in the first batch, after which [`is_watching`](Self::is_watching)
    /// returns false and no further events arrive.
    ///
    /// `latency` is both the coalescing window and the minimum interval
    /// between callback invocations. Values below the platform floor
    /// (20 ms; 1 s on macOS) are raised silently.
    pub fn new<F>(root: impl Into<PathBuf>, latency: Duration, callback: F) -> Self
    where
        F: FnMut(Batch) + Send + 'static,
    {
        let configured = root.into();
        // follow symlinks for the root only; if it cannot be resolved the
        // platform source reports the failure as an event
        let root = normalize::canonical_root(&configured).unwrap_or(configured);
        let latency = latency.max(MIN_LATENCY);
        debug!(root = %root.display(), ?latency, "starting filesystem watcher");

        let collector = Arc::new(Collector::new());
        let state = Arc::new(SourceState::new());
        let dispatcher = Dispatcher::spawn(collector.clone(), latency, Box::new(callback));
        let source = spawn_source(root.clone(), latency, collector, state.clone());

        Self {
            source,
            dispatcher,
            state,
            root,
            latency,
        }
    }

    /// True while the native watch is running and has not failed.
    pub fn is_watching(&self) -> bool {
        self.state.is_watching()
    }

    /// The watched root, canonicalized when it could be resolved.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The effective latency after platform flooring.
    pub fn latency(&self) -> Duration {
        self.latency
    }
}

impl Drop for FileSystemWatcher {
    fn drop(&mut self) {
        // reader first so nothing new is produced, then the dispatcher,
        // which flushes whatever is still queued
        self.source.shutdown();
        self.dispatcher.stop();
    }
}

#[cfg(target_os = "macos")]
fn spawn_source(
    root: PathBuf,
    latency: Duration,
    collector: Arc<Collector>,
    state: Arc<SourceState>,
) -> PlatformSource {
    // FSEvents batches on its own; hand it the same latency
    PlatformSource::spawn(root, latency, collector, state)
}

#[cfg(not(target_os = "macos"))]
fn spawn_source(
    root: PathBuf,
    _latency: Duration,
    collector: Arc<Collector>,
    state: Arc<SourceState>,
) -> PlatformSource {
    PlatformSource::spawn(root, collector, state)
}
