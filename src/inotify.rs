//! Linux backend: one inotify instance plus explicit per-directory watch
//! bookkeeping.
//!
//! inotify has no recursive mode, so the reader maintains a bidirectional
//! table between watch descriptors and root-relative directory paths, and
//! the table changes while events stream in: a freshly created directory is
//! walked and watched immediately (everything the walk finds is synthesized
//! as CREATED, because entries can appear before the watch lands; the
//! duplicates collapse during coalescing), a directory that moved in is
//! watched without synthesis, and a directory that was deleted or moved
//! away takes its whole subtree's watches with it.
//!
//! Renames inside the tree need care: a watch descriptor follows the inode,
//! so a renamed directory keeps its descriptors. IN_MOVED_FROM and
//! IN_MOVED_TO share a kernel cookie; when both sides land in one read, the
//! subtree's bookkeeping is remapped to the new path and the descriptors
//! stay valid. A from-side whose to-side never shows up left the tree, and
//! its watches are dropped. The cookie itself is never surfaced.
//!
//! Shutdown is an eventfd in the poll set next to the inotify fd; arming it
//! returns the blocked reader immediately.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::collector::Collector;
use crate::event::{Event, EventType};
use crate::normalize;
use crate::source::{SourceState, WatchError};

pub(crate) const MIN_LATENCY: Duration = Duration::from_millis(20);

// AddWatchFlags ops are not const
fn dir_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_MOVE_SELF
        | AddWatchFlags::IN_Q_OVERFLOW
}

pub(crate) struct InotifySource {
    wakeup: Option<Arc<EventFd>>,
    reader: Option<JoinHandle<()>>,
    state: Arc<SourceState>,
}

impl InotifySource {
    /// Spawn the reader thread. The native open happens on that thread, so
    /// a root that vanished before construction completes surfaces as a
    /// FAILED event instead of an error.
    pub(crate) fn spawn(root: PathBuf, collector: Arc<Collector>, state: Arc<SourceState>) -> Self {
        let wakeup = match EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC) {
            Ok(fd) => Arc::new(fd),
            Err(err) => {
                warn!("cannot create shutdown eventfd: {err}");
                state.fail(&collector);
                state.stopped();
                return Self {
                    wakeup: None,
                    reader: None,
                    state,
                };
            }
        };
        let reader = thread::Builder::new()
            .name("treewatch inotify".to_string())
            .spawn({
                let wakeup = wakeup.clone();
                let state = state.clone();
                move || read_loop(&root, &collector, &state, &wakeup)
            })
            .expect("failed to spawn inotify reader");
        Self {
            wakeup: Some(wakeup),
            reader: Some(reader),
            state,
        }
    }

    /// Ask the reader to exit, unblock its poll, and wait for it.
    pub(crate) fn shutdown(&mut self) {
        self.state.request_stop();
        if let Some(wakeup) = &self.wakeup {
            if let Err(err) = wakeup.arm() {
                warn!("failed to signal shutdown eventfd: {err}");
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Watch descriptors and the relative directory paths they stand for. The
/// root itself maps to the empty relative path.
struct WatchTable {
    root: PathBuf,
    inotify: Inotify,
    by_wd: HashMap<WatchDescriptor, PathBuf>,
    by_path: HashMap<PathBuf, WatchDescriptor>,
}

impl WatchTable {
    fn open(root: &Path) -> Result<Self, WatchError> {
        let root = normalize::canonical_root(root)?;
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root));
        }
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        let mut table = Self {
            root,
            inotify,
            by_wd: HashMap::new(),
            by_path: HashMap::new(),
        };
        table.add_dir(PathBuf::new())?;
        table.watch_tree(Path::new(""), None);
        Ok(table)
    }

    /// Register a watch for one directory given by its relative path.
    /// Returns false when the directory was already watched.
    fn add_dir(&mut self, rel: PathBuf) -> Result<bool, WatchError> {
        if self.by_path.contains_key(&rel) {
            return Ok(false);
        }
        let wd = self.inotify.add_watch(&self.root.join(&rel), dir_mask())?;
        trace!(dir = %rel.display(), "watching directory");
        self.by_wd.insert(wd, rel.clone());
        self.by_path.insert(rel, wd);
        Ok(true)
    }

    /// Add watches for every directory at or below `rel`. With a collector,
    /// every entry the walk discovers below `rel` is synthesized as
    /// CREATED: entries can appear between a directory's creation and its
    /// watch registration, and the duplicates this produces merge away in
    /// coalescing. Failures on individual entries are skipped; they are
    /// races with concurrent deletion or permission holes, neither of which
    /// should kill the watch.
    fn watch_tree(&mut self, rel: &Path, synthesize: Option<&Collector>) {
        let base = self.root.join(rel);
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    trace!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            let Some(rel_entry) = normalize::relativize(&self.root, entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                if let Err(err) = self.add_dir(rel_entry.clone()) {
                    trace!(dir = %rel_entry.display(), "could not watch: {err}");
                    continue;
                }
            }
            if let Some(collector) = synthesize {
                if rel_entry != rel {
                    collector.push(Event::new(rel_entry, EventType::CREATED));
                }
            }
        }
    }

    /// Rename the bookkeeping for `old` and everything below it to live
    /// under `new`. The descriptors themselves stay valid; they follow the
    /// inodes.
    fn remap_subtree(&mut self, old: &Path, new: &Path) {
        let moved: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| path.starts_with(old))
            .cloned()
            .collect();
        for dir in moved {
            let suffix = dir.strip_prefix(old).expect("filtered by starts_with");
            let renamed = if suffix.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(suffix)
            };
            if let Some(wd) = self.by_path.remove(&dir) {
                trace!(from = %dir.display(), to = %renamed.display(), "remapping directory watch");
                self.by_wd.insert(wd, renamed.clone());
                self.by_path.insert(renamed, wd);
            }
        }
    }

    /// Drop the bookkeeping for `rel` and everything below it. The kernel
    /// retires descriptors of deleted directories on its own; rm_watch
    /// matters for directories that moved away but still exist elsewhere.
    fn remove_subtree(&mut self, rel: &Path) {
        let doomed: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| path.starts_with(rel))
            .cloned()
            .collect();
        for dir in doomed {
            if let Some(wd) = self.by_path.remove(&dir) {
                trace!(dir = %dir.display(), "dropping directory watch");
                self.by_wd.remove(&wd);
                let _ = self.inotify.rm_watch(wd);
            }
        }
    }
}

fn read_loop(root: &Path, collector: &Collector, state: &SourceState, wakeup: &EventFd) {
    let mut table = match WatchTable::open(root) {
        Ok(table) => table,
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
    debug!(
        root = %table.root.display(),
        directories = table.by_wd.len(),
        "inotify watch running"
    );

    // directory moves whose IN_MOVED_TO side has not shown up yet, keyed
    // by the kernel's rename cookie
    let mut pending_moves: Vec<(u32, PathBuf)> = Vec::new();
    while wait_readable(&table.inotify, wakeup, state) {
        match table.inotify.read_events() {
            Ok(events) => {
                for native in events {
                    decode(&mut table, native, collector, &mut pending_moves);
                }
                // a from-side still unpaired after the batch moved out of
                // the tree; its subtree is no longer ours to watch
                for (_, old) in pending_moves.drain(..) {
                    table.remove_subtree(&old);
                }
            }
            Err(Errno::EAGAIN) => continue,
            Err(err) => {
                warn!("inotify read failed: {err}");
                state.die(collector, "Watch aborted by an inotify read error.");
                break;
            }
        }
    }
    state.stopped();
}

/// Block until the inotify fd is readable. Returns false once shutdown was
/// signaled through the eventfd or the state machine.
fn wait_readable(inotify: &Inotify, wakeup: &EventFd, state: &SourceState) -> bool {
    loop {
        if state.stop_requested() {
            return false;
        }
        let mut fds = [
            PollFd::new(inotify.as_fd(), PollFlags::POLLIN),
            PollFd::new(wakeup.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {
                if fds[1].revents().is_some_and(|flags| !flags.is_empty()) {
                    return false;
                }
                if fds[0].revents().is_some_and(|flags| flags.intersects(PollFlags::POLLIN)) {
                    return true;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!("poll on inotify fd failed: {err}");
                return false;
            }
        }
    }
}

fn decode(
    table: &mut WatchTable,
    native: InotifyEvent,
    collector: &Collector,
    pending_moves: &mut Vec<(u32, PathBuf)>,
) {
    let mask = native.mask;
    if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
        // the kernel queue overflowed; tell the consumer to rescan the root
        warn!("inotify queue overflowed");
        collector.push(Event::new(PathBuf::new(), EventType::BUFFER_OVERFLOW));
        return;
    }

    let Some(dir) = table.by_wd.get(&native.wd).cloned() else {
        // events trail in after a subtree's bookkeeping was dropped, and
        // IN_IGNORED arrives once the kernel retires a descriptor
        trace!("event for retired watch descriptor, skipping");
        return;
    };
    let path = match &native.name {
        Some(name) => dir.join(name),
        None => dir,
    };
    let is_dir = mask.contains(AddWatchFlags::IN_ISDIR);

    if mask.contains(AddWatchFlags::IN_CREATE) {
        collector.push(Event::new(path.clone(), EventType::CREATED));
        if is_dir {
            table.watch_tree(&path, Some(collector));
        }
    } else if mask.contains(AddWatchFlags::IN_MOVED_TO) {
        collector.push(Event::new(
            path.clone(),
            EventType::CREATED | EventType::RENAMED,
        ));
        if is_dir {
            let paired = pending_moves
                .iter()
                .position(|(cookie, _)| *cookie == native.cookie);
            if let Some(index) = paired {
                // renamed inside the tree: keep the descriptors, move the
                // bookkeeping
                let (_, old) = pending_moves.swap_remove(index);
                table.remap_subtree(&old, &path);
            } else {
                // moved in from outside: entries that silently came along
                // are watched but not reported
                table.watch_tree(&path, None);
            }
        }
    } else if mask.contains(AddWatchFlags::IN_MOVED_FROM) {
        collector.push(Event::new(
            path.clone(),
            EventType::DELETED | EventType::RENAMED,
        ));
        if is_dir {
            // whether the subtree stays watched depends on the to-side of
            // this move, if one ever arrives
            pending_moves.push((native.cookie, path));
        }
    } else if mask.contains(AddWatchFlags::IN_DELETE) {
        // a deleted directory cleans its own descriptor up via
        // IN_DELETE_SELF
        collector.push(Event::new(path, EventType::DELETED));
    } else if mask.contains(AddWatchFlags::IN_DELETE_SELF) {
        collector.push(Event::new(path.clone(), EventType::DELETED));
        table.remove_subtree(&path);
    } else if mask.intersects(AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_ATTRIB) {
        collector.push(Event::new(path, EventType::MODIFIED));
    } else if mask.contains(AddWatchFlags::IN_MOVE_SELF) {
        // the move is reported through the parent's IN_MOVED_FROM when it
        // is visible inside the root
        trace!(dir = %path.display(), "watched directory moved");
    } else {
        trace!(?mask, "unhandled inotify mask, skipping record");
    }
}
