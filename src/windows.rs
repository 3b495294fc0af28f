//! Windows backend built on `ReadDirectoryChangesW`.
//!
//! The directory handle is opened with backup semantics and overlapped I/O,
//! and one read at a time is kept in flight with `bWatchSubtree` set, so the
//! kernel does the recursion. The reader alternates between waiting on the
//! completion event or the stop event, decoding the returned records, and
//! re-issuing the read. Records carry paths relative to the watched
//! directory already, so no prefix stripping is needed here.
//!
//! A zero-byte completion means the kernel buffer overflowed and the
//! enumeration must be redone by the consumer; that becomes a
//! BUFFER_OVERFLOW event and the loop continues.

use std::ffi::OsString;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
    WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
};

use crate::collector::Collector;
use crate::event::{Event, EventType};
use crate::normalize;
use crate::source::{SourceState, WatchError};

pub(crate) const MIN_LATENCY: Duration = Duration::from_millis(20);

// in u32 units so FILE_NOTIFY_INFORMATION stays DWORD-aligned; 64 KiB total
const BUFFER_LEN: usize = 16 * 1024;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SECURITY;

/// Owned native handle. It is safe to move and signal handles across
/// threads; exclusive use is coordinated by the reader loop.
struct RawHandle(HANDLE);

unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl Drop for RawHandle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

pub(crate) struct DirChangesSource {
    stop_event: Option<Arc<RawHandle>>,
    reader: Option<JoinHandle<()>>,
    state: Arc<SourceState>,
}

impl DirChangesSource {
    /// Spawn the reader thread. The native open happens on that thread, so
    /// a root that vanished before construction completes surfaces as a
    /// FAILED event instead of an error.
    pub(crate) fn spawn(root: PathBuf, collector: Arc<Collector>, state: Arc<SourceState>) -> Self {
        let stop_event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if stop_event.is_null() {
            warn!("cannot create stop event: {}", unsafe { GetLastError() });
            state.fail(&collector);
            state.stopped();
            return Self {
                stop_event: None,
                reader: None,
                state,
            };
        }
        let stop_event = Arc::new(RawHandle(stop_event));
        let reader = thread::Builder::new()
            .name("treewatch rdcw".to_string())
            .spawn({
                let stop_event = stop_event.clone();
                let state = state.clone();
                move || read_loop(&root, &collector, &state, &stop_event)
            })
            .expect("failed to spawn directory-changes reader");
        Self {
            stop_event: Some(stop_event),
            reader: Some(reader),
            state,
        }
    }

    /// Ask the reader to exit, unblock its wait, and wait for it. The loop
    /// cancels its in-flight read itself; it owns the directory handle.
    pub(crate) fn shutdown(&mut self) {
        self.state.request_stop();
        if let Some(stop_event) = &self.stop_event {
            unsafe {
                SetEvent(stop_event.0);
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn open_root(root: &Path) -> Result<(RawHandle, RawHandle), WatchError> {
    let root = normalize::canonical_root(root)?;
    if !root.is_dir() {
        return Err(WatchError::NotADirectory(root));
    }
    let wide: Vec<u16> = root.as_os_str().encode_wide().chain(Some(0)).collect();
    let dir = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    };
    if dir == INVALID_HANDLE_VALUE {
        return Err(WatchError::Setup(format!(
            "CreateFileW failed with code {}",
            unsafe { GetLastError() }
        )));
    }
    let dir = RawHandle(dir);
    // auto-reset: one completed read arms exactly one wait
    let completion = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
    if completion.is_null() {
        return Err(WatchError::Setup(format!(
            "CreateEventW failed with code {}",
            unsafe { GetLastError() }
        )));
    }
    Ok((dir, RawHandle(completion)))
}

fn read_loop(root: &Path, collector: &Collector, state: &SourceState, stop_event: &RawHandle) {
    let (dir, completion) = match open_root(root) {
        Ok(handles) => handles,
        Err(err) => {
            debug!(root = %root.display(), "failed to open watch: {err}");
            state.fail(collector);
            state.stopped();
            return;
        }
    };
    if !state.start() {
        state.stopped();
        return;
    }
    debug!(root = %root.display(), "directory-changes watch running");

    let mut buffer = vec![0u32; BUFFER_LEN];
    loop {
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = completion.0;
        let issued = unsafe {
            ReadDirectoryChangesW(
                dir.0,
                buffer.as_mut_ptr().cast(),
                (buffer.len() * mem::size_of::<u32>()) as u32,
                1,
                NOTIFY_FILTER,
                ptr::null_mut(),
                &mut overlapped,
                None,
            )
        };
        if issued == 0 {
            warn!("ReadDirectoryChangesW failed: {}", unsafe {
                GetLastError()
            });
            state.die(collector, "Watch aborted by a directory read error.");
            break;
        }

        let handles = [completion.0, stop_event.0];
        let wait = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, INFINITE) };
        if wait == WAIT_OBJECT_0 + 1 {
            // shutdown: cancel the in-flight read and reap it before the
            // buffer and overlapped go out of scope
            unsafe {
                CancelIoEx(dir.0, &overlapped);
                let mut reaped = 0u32;
                GetOverlappedResult(dir.0, &overlapped, &mut reaped, 1);
            }
            break;
        }
        if wait != WAIT_OBJECT_0 {
            warn!("wait on change events failed: {}", unsafe {
                GetLastError()
            });
            state.die(collector, "Watch aborted by a wait error.");
            break;
        }

        let mut transferred = 0u32;
        let completed =
            unsafe { GetOverlappedResult(dir.0, &overlapped, &mut transferred, 0) };
        if completed == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_OPERATION_ABORTED {
                break;
            }
            warn!("overlapped read failed: {code}");
            state.die(collector, "Watch aborted by a read error.");
            break;
        }
        if transferred == 0 {
            // zero bytes back (ERROR_NOTIFY_ENUM_DIR): the kernel buffer
            // overflowed and records were lost
            warn!("change buffer overflowed");
            collector.push(Event::new(PathBuf::new(), EventType::BUFFER_OVERFLOW));
            continue;
        }
        decode_records(&buffer, transferred as usize, collector);
    }
    state.stopped();
}

/// Walk the variable-length `FILE_NOTIFY_INFORMATION` records returned by
/// one read.
fn decode_records(buffer: &[u32], len: usize, collector: &Collector) {
    let base = buffer.as_ptr().cast::<u8>();
    let mut offset = 0usize;
    loop {
        if offset + mem::size_of::<FILE_NOTIFY_INFORMATION>() > len {
            trace!("truncated change record, skipping the rest of the buffer");
            return;
        }
        // the kernel keeps every record DWORD-aligned within the buffer
        let record = unsafe { &*(base.add(offset).cast::<FILE_NOTIFY_INFORMATION>()) };
        let name_len = record.FileNameLength as usize / 2;
        let name = unsafe { slice::from_raw_parts(record.FileName.as_ptr(), name_len) };
        let path = PathBuf::from(OsString::from_wide(name));

        let kind = match record.Action {
            FILE_ACTION_ADDED => EventType::CREATED,
            FILE_ACTION_REMOVED => EventType::DELETED,
            FILE_ACTION_MODIFIED => EventType::MODIFIED,
            FILE_ACTION_RENAMED_OLD_NAME => EventType::DELETED | EventType::RENAMED,
            FILE_ACTION_RENAMED_NEW_NAME => EventType::CREATED | EventType::RENAMED,
            other => {
                trace!(action = other, "unknown change action, skipping record");
                EventType::NOOP
            }
        };
        if !kind.is_empty() {
            collector.push(Event::new(path, kind));
        }

        if record.NextEntryOffset == 0 {
            return;
        }
        offset += record.NextEntryOffset as usize;
    }
}
