//! Filesystem sandbox and event recorder shared by the integration tests.
//!
//! The sandbox holds a temporary directory with a `watched` subdirectory
//! inside it; tests watch that subdirectory so that moves across the watch
//! boundary stay inside the sandbox. The recorder owns a watcher whose
//! callback appends every received event to a shared vector.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use treewatch::{Event, EventType, FileSystemWatcher};

#[cfg(target_os = "macos")]
pub const LATENCY: Duration = Duration::from_millis(1000);
#[cfg(not(target_os = "macos"))]
pub const LATENCY: Duration = Duration::from_millis(20);

/// How long to wait before inspecting received events: the latency window
/// plus platform slack.
#[cfg(target_os = "macos")]
pub const GRACE: Duration = Duration::from_millis(2050);
#[cfg(not(target_os = "macos"))]
pub const GRACE: Duration = Duration::from_millis(100);

pub const WATCHED: &str = "watched";

pub struct Sandbox {
    root: PathBuf,
    _tmp: tempfile::TempDir,
}

#[allow(dead_code)]
impl Sandbox {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("failed to create sandbox");
        let root = tmp
            .path()
            .canonicalize()
            .expect("failed to canonicalize sandbox");
        fs::create_dir(root.join(WATCHED)).expect("failed to create watched directory");
        Self { root, _tmp: tmp }
    }

    /// The directory the tests watch.
    pub fn watched(&self) -> PathBuf {
        self.root.join(WATCHED)
    }

    /// Absolute form of a sandbox-relative path.
    pub fn abs(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn create_file(&self, rel: impl AsRef<Path>) {
        fs::write(self.abs(&rel), b"").expect("failed to create file");
        assert!(self.abs(rel).exists());
    }

    pub fn modify_file(&self, rel: impl AsRef<Path>, content: &str) {
        assert!(self.abs(&rel).exists());
        fs::write(self.abs(rel), content).expect("failed to modify file");
    }

    pub fn create_dir(&self, rel: impl AsRef<Path>) {
        fs::create_dir(self.abs(&rel)).expect("failed to create directory");
    }

    pub fn remove(&self, rel: impl AsRef<Path>) {
        let path = self.abs(rel);
        if path.is_dir() {
            fs::remove_dir_all(&path).expect("failed to remove directory");
        } else {
            fs::remove_file(&path).expect("failed to remove file");
        }
        assert!(!path.exists());
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) {
        fs::rename(self.abs(from), self.abs(to)).expect("failed to rename");
    }
}

/// One expected event: a relative path, the flags that must be set, and the
/// flags that must not be. BUFFER_OVERFLOW and FAILED are implicitly
/// forbidden unless required.
pub struct ExpectedEvent {
    pub path: PathBuf,
    pub required: EventType,
    pub forbidden: EventType,
}

#[allow(dead_code)]
impl ExpectedEvent {
    pub fn new(path: impl Into<PathBuf>, required: EventType, forbidden: EventType) -> Self {
        let mut forbidden = forbidden;
        if !required.contains(EventType::BUFFER_OVERFLOW) {
            forbidden |= EventType::BUFFER_OVERFLOW;
        }
        if !required.contains(EventType::FAILED) {
            forbidden |= EventType::FAILED;
        }
        Self {
            path: path.into(),
            required,
            forbidden,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.path == self.path
            && event.kind.contains(self.required)
            && !event.kind.intersects(self.forbidden)
    }
}

pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    watcher: FileSystemWatcher,
}

#[allow(dead_code)]
impl Recorder {
    pub fn start(root: impl Into<PathBuf>) -> Self {
        Self::start_with_latency(root, LATENCY)
    }

    pub fn start_with_latency(root: impl Into<PathBuf>, latency: Duration) -> Self {
        let latency = latency.max(LATENCY);
        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let watcher = FileSystemWatcher::new(root, latency, move |batch| {
            sink.lock().expect("recorder lock").extend(batch);
        });
        // give the backend a moment to register its watches, otherwise
        // changes made right after this call can be missed
        std::thread::sleep(Duration::from_millis(10));
        Self { events, watcher }
    }

    /// Wait out the grace period, then take everything recorded so far.
    pub fn events_after_wait(&self) -> Vec<Event> {
        std::thread::sleep(GRACE);
        let events = std::mem::take(&mut *self.events.lock().expect("recorder lock"));
        for event in &events {
            eprintln!("received: {:?} {:?}", event.path, event.kind);
        }
        events
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_watching()
    }

    /// Drop the watcher but keep the recorded-event handle.
    pub fn into_events(self) -> Arc<Mutex<Vec<Event>>> {
        self.events
    }

    /// Check that every expectation matches some received event and that
    /// none of the `absent` paths appears at all.
    pub fn detected(&self, expected: &[ExpectedEvent], absent: &[&Path]) -> bool {
        let events = self.events_after_wait();
        let all_found = expected.iter().all(|expectation| {
            let found = events.iter().any(|event| expectation.matches(event));
            if !found {
                eprintln!(
                    "missing: {:?} with {:?} and without {:?}",
                    expectation.path, expectation.required, expectation.forbidden
                );
            }
            found
        });
        let none_forbidden = absent.iter().all(|path| {
            let found = events.iter().any(|event| event.path == *path);
            if found {
                eprintln!("unexpected event for: {:?}", path);
            }
            !found
        });
        all_found && none_forbidden
    }
}
