//! macOS backend built on Darwin's FSEvents API.
//!
//! FSEvents delivers per-path change flags through a stream callback that
//! runs on a Core Foundation run loop, often handing over many paths per
//! invocation. The stream here is created with a since-now event id and the
//! file-events and no-defer flags, scheduled on a dedicated run-loop thread,
//! and torn down by stopping that run loop from the outside.
//!
//! Paths arrive absolute and NFD-decomposed; the normalizer strips the root
//! prefix caselessly and leaves the byte content alone.
//!
//! For more information see the [FSEvents API reference][ref].
//!
//! [ref]: https://developer.apple.com/library/mac/documentation/Darwin/Reference/FSEvents_Ref/

#![allow(non_upper_case_globals)]

use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use tracing::{debug, trace, warn};

use crate::collector::Collector;
use crate::event::{Event, EventType};
use crate::normalize;
use crate::source::{SourceState, WatchError};

/// The API cannot be driven reliably below one second.
pub(crate) const MIN_LATENCY: Duration = Duration::from_secs(1);

bitflags::bitflags! {
  #[repr(C)]
  struct StreamFlags: u32 {
    const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
    const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
    const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
    const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
    const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
    const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
    const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
    const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
    const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
    const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
  }
}

/// Flags that mean "records were dropped somewhere, rescan": the stream
/// replayed history, the root itself changed, or a buffer gave out.
fn rescan_flags() -> StreamFlags {
    StreamFlags::MUST_SCAN_SUBDIRS
        | StreamFlags::USER_DROPPED
        | StreamFlags::KERNEL_DROPPED
        | StreamFlags::HISTORY_DONE
        | StreamFlags::ROOT_CHANGED
}

fn translate_flags(flags: StreamFlags) -> EventType {
    let mut kind = EventType::NOOP;
    if flags.intersects(rescan_flags()) {
        kind |= EventType::BUFFER_OVERFLOW;
    }
    if flags.contains(StreamFlags::ITEM_CREATED) {
        kind |= EventType::CREATED;
    }
    if flags.contains(StreamFlags::ITEM_REMOVED) {
        kind |= EventType::DELETED;
    }
    // FSEvents provides no way to associate the two sides of a rename;
    // both endpoints surface with this one flag
    if flags.contains(StreamFlags::ITEM_RENAMED) {
        kind |= EventType::RENAMED;
    }
    if flags.intersects(
        StreamFlags::ITEM_MODIFIED | StreamFlags::INODE_META_MOD | StreamFlags::ITEM_XATTR_MOD,
    ) {
        kind |= EventType::MODIFIED;
    }
    kind
}

/// State owned by the stream and handed to the C callback.
struct StreamContext {
    root: PathBuf,
    collector: Arc<Collector>,
}

// The stream retains the context until it is released in the reader's
// epilogue, then invokes this exactly once.
extern "C" fn release_context(info: *const libc::c_void) {
    // Safety: `info` is the `Box::into_raw` pointer from `run_stream`, and
    // no event callback can still be running once the invalidated stream
    // releases its context, so reclaiming the box here cannot race the
    // collector pushes in `callback_impl`.
    unsafe {
        drop(Box::from_raw(
            info as *const StreamContext as *mut StreamContext,
        ));
    }
}

extern "C" {
    /// True while the run loop sits idle in its wait state. Stopping the
    /// loop is only reliable once it has reached that state.
    fn CFRunLoopIsWaiting(runloop: cf::CFRunLoopRef) -> cf::Boolean;
}

pub(crate) struct FsEventSource {
    runloop: Option<(cf::CFRunLoopRef, JoinHandle<()>)>,
    state: Arc<SourceState>,
}

// The stored CFRunLoopRef keeps this type from being Send automatically.
// The source only ever uses it to stop the reader's run loop from whichever
// thread drops the watcher, run loops are usable from foreign threads, and
// the loop object outlives every caller of `shutdown` because the reader
// thread is joined before `shutdown` returns.
unsafe impl Send for FsEventSource {}

// Carries the reader's CFRunLoopRef back over the readiness channel; a
// bare raw pointer is not Send.
struct CFSendWrapper(cf::CFRunLoopRef);

unsafe impl Send for CFSendWrapper {}

impl FsEventSource {
    /// Spawn the run-loop thread and block until the stream started (or
    /// failed to). Open failure surfaces as a FAILED event rather than an
    /// error.
    pub(crate) fn spawn(
        root: PathBuf,
        latency: Duration,
        collector: Arc<Collector>,
        state: Arc<SourceState>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("treewatch fsevents".to_string())
            .spawn({
                let state = state.clone();
                move || run_stream(root, latency, collector, &state, &ready_tx)
            })
            .expect("failed to spawn fsevents thread");

        match ready_rx.recv() {
            Ok(Some(runloop)) => Self {
                runloop: Some((runloop.0, handle)),
                state,
            },
            _ => {
                let _ = handle.join();
                Self {
                    runloop: None,
                    state,
                }
            }
        }
    }

    /// Stop the run loop and wait for the thread; the thread's epilogue
    /// invalidates and releases the stream.
    pub(crate) fn shutdown(&mut self) {
        self.state.request_stop();
        if let Some((runloop, handle)) = self.runloop.take() {
            unsafe {
                while CFRunLoopIsWaiting(runloop) == 0 {
                    thread::yield_now();
                }
                cf::CFRunLoopStop(runloop);
            }
            let _ = handle.join();
        }
    }
}

fn run_stream(
    root: PathBuf,
    latency: Duration,
    collector: Arc<Collector>,
    state: &SourceState,
    ready: &mpsc::Sender<Option<CFSendWrapper>>,
) {
    let root = match open_root(&root) {
        Ok(root) => root,
        Err(err) => {
            debug!(root = %root.display(), "failed to open watch: {err}");
            state.fail(&collector);
            state.stopped();
            let _ = ready.send(None);
            return;
        }
    };

    unsafe {
        let paths = cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
        let mut cf_err: cf::CFErrorRef = ptr::null_mut();
        let cf_path = match root.to_str() {
            Some(root_str) => cf::str_path_to_cfstring_ref(root_str, &mut cf_err),
            None => ptr::null_mut(),
        };
        if cf_path.is_null() {
            if !cf_err.is_null() {
                cf::CFRelease(cf_err as cf::CFRef);
            }
            cf::CFRelease(paths);
            state.fail(&collector);
            state.stopped();
            let _ = ready.send(None);
            return;
        }
        cf::CFArrayAppendValue(paths, cf_path);
        cf::CFRelease(cf_path);

        // owned by the stream from here on; release_context frees it
        let context_info = Box::into_raw(Box::new(StreamContext {
            root: root.clone(),
            collector: collector.clone(),
        }));
        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context_info as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copy_description: None,
        };

        let stream = fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            callback,
            &stream_context,
            paths,
            fs::kFSEventStreamEventIdSinceNow,
            latency.as_secs_f64(),
            fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
        );
        cf::CFRelease(paths);

        let runloop = cf::CFRunLoopGetCurrent();
        fs::FSEventStreamScheduleWithRunLoop(stream, runloop, cf::kCFRunLoopDefaultMode);
        if fs::FSEventStreamStart(stream) == 0 {
            warn!("FSEventStream failed to start");
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
            state.fail(&collector);
            state.stopped();
            let _ = ready.send(None);
            return;
        }
        if !state.start() {
            // shutdown raced construction; unwind before entering the loop
            fs::FSEventStreamStop(stream);
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
            state.stopped();
            let _ = ready.send(None);
            return;
        }
        debug!(root = %root.display(), "fsevents watch running");
        let _ = ready.send(Some(CFSendWrapper(runloop)));

        // terminated by the CFRunLoopStop call in shutdown()
        cf::CFRunLoopRun();
        fs::FSEventStreamStop(stream);
        fs::FSEventStreamInvalidate(stream);
        fs::FSEventStreamRelease(stream);
    }
    state.stopped();
}

fn open_root(root: &Path) -> Result<PathBuf, WatchError> {
    let root = normalize::canonical_root(root)?;
    if !root.is_dir() {
        return Err(WatchError::NotADirectory(root));
    }
    Ok(root)
}

extern "C" fn callback(
    stream_ref: fs::FSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: *mut libc::c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }
}

/// Decode one bulk callback.
///
/// # Safety
///
/// Called from C; must not panic, as unwinding across FFI boundaries is
/// undefined behavior. Malformed records are skipped.
unsafe fn callback_impl(
    _stream_ref: fs::FSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: *mut libc::c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let event_paths = event_paths as *const *const libc::c_char;
    let context = &*(info as *const StreamContext);

    for index in 0..num_events {
        // keep the bytes exactly as delivered: decomposed names stay
        // decomposed
        let bytes = CStr::from_ptr(*event_paths.add(index)).to_bytes();
        let path = Path::new(OsStr::from_bytes(bytes));
        let flags = StreamFlags::from_bits_truncate(*event_flags.add(index));

        let mut kind = translate_flags(flags);
        if kind.is_empty() {
            trace!(?flags, "uninteresting stream flags, skipping");
            continue;
        }
        if kind.contains(EventType::RENAMED) {
            // the stream does not say which endpoint of the rename this
            // is; the current state of the path does
            if std::fs::symlink_metadata(path).is_ok() {
                kind |= EventType::CREATED;
            } else {
                kind |= EventType::DELETED;
            }
        }
        let Some(rel) = normalize::relativize(&context.root, path) else {
            trace!(path = %path.display(), "event outside the root, skipping");
            continue;
        };
        context.collector.push(Event::new(rel, kind));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn item_flags_translate_to_event_bits() {
        assert_eq!(
            translate_flags(StreamFlags::ITEM_CREATED),
            EventType::CREATED
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_REMOVED),
            EventType::DELETED
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_RENAMED),
            EventType::RENAMED
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_MODIFIED),
            EventType::MODIFIED
        );
        assert_eq!(
            translate_flags(StreamFlags::INODE_META_MOD),
            EventType::MODIFIED
        );
        assert_eq!(
            translate_flags(StreamFlags::ITEM_XATTR_MOD),
            EventType::MODIFIED
        );
    }

    #[test]
    fn drop_hints_translate_to_buffer_overflow() {
        for flags in [
            StreamFlags::MUST_SCAN_SUBDIRS,
            StreamFlags::KERNEL_DROPPED,
            StreamFlags::USER_DROPPED,
            StreamFlags::HISTORY_DONE,
            StreamFlags::ROOT_CHANGED,
        ] {
            assert_eq!(translate_flags(flags), EventType::BUFFER_OVERFLOW);
        }
    }

    #[test]
    fn combined_flags_union() {
        let kind =
            translate_flags(StreamFlags::ITEM_CREATED | StreamFlags::ITEM_RENAMED);
        assert_eq!(kind, EventType::CREATED | EventType::RENAMED);
    }
}
