//! The delivery loop: drains the collector once per latency window,
//! coalesces the batch, and hands it to the user callback.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::trace;

use crate::collector::Collector;
use crate::event::{Batch, Event, EventType};

pub(crate) type Callback = Box<dyn FnMut(Batch) + Send>;

/// Owns the dispatch thread. The callback runs on that thread with no
/// internal lock held, so user code may block, push more filesystem
/// changes, or even drop the watcher.
pub(crate) struct Dispatcher {
    thread: Option<JoinHandle<()>>,
    final_flush: Arc<AtomicBool>,
    collector: Arc<Collector>,
}

impl Dispatcher {
    pub(crate) fn spawn(collector: Arc<Collector>, latency: Duration, callback: Callback) -> Self {
        let final_flush = Arc::new(AtomicBool::new(true));
        let thread = thread::Builder::new()
            .name("treewatch dispatch".to_string())
            .spawn({
                let collector = collector.clone();
                let final_flush = final_flush.clone();
                move || run(&collector, latency, callback, &final_flush)
            })
            .expect("failed to spawn dispatch thread");
        Self {
            thread: Some(thread),
            final_flush,
            collector,
        }
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// When called on the dispatch thread itself (the callback dropped the
    /// watcher) the join is skipped and the final flush suppressed, so no
    /// callback can run after this returns.
    pub(crate) fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread::current().id() == thread.thread().id() {
            self.final_flush.store(false, Ordering::Release);
            self.collector.stop();
            return;
        }
        self.collector.stop();
        let _ = thread.join();
    }
}

fn run(collector: &Collector, latency: Duration, mut callback: Callback, final_flush: &AtomicBool) {
    loop {
        if collector.wait_ready() {
            break;
        }
        // let the rest of the burst land before delivering
        collector.wait_window(latency);

        let batch = coalesce(collector.drain());
        if !batch.is_empty() {
            trace!(events = batch.len(), "dispatching batch");
            callback(batch);
        }
        // re-check after the window and the callback so shutdown is not
        // delayed by another full wait
        if collector.is_stopped() {
            break;
        }
    }

    // deliver whatever was queued before shutdown, unless the watcher was
    // dropped from inside the callback: nothing may run after that drop
    if final_flush.load(Ordering::Acquire) {
        let batch = coalesce(collector.drain());
        if !batch.is_empty() {
            trace!(events = batch.len(), "dispatching final batch");
            callback(batch);
        }
    }
}

/// Merge same-path events by flag union, keeping the first occurrence's
/// position. FAILED and BUFFER_OVERFLOW events pass through unmerged so
/// their diagnostic paths survive.
pub(crate) fn coalesce(batch: Vec<Event>) -> Vec<Event> {
    let mut merged: Vec<Event> = Vec::with_capacity(batch.len());
    let mut by_path: HashMap<PathBuf, usize> = HashMap::with_capacity(batch.len());
    for event in batch {
        if event
            .kind
            .intersects(EventType::FAILED | EventType::BUFFER_OVERFLOW)
        {
            merged.push(event);
            continue;
        }
        match by_path.entry(event.path.clone()) {
            Entry::Occupied(slot) => merged[*slot.get()].kind |= event.kind,
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(event);
            }
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;

    #[test]
    fn coalesce_merges_same_path_by_union() {
        let merged = coalesce(vec![
            Event::new("file", EventType::CREATED),
            Event::new("other", EventType::CREATED),
            Event::new("file", EventType::MODIFIED),
            Event::new("file", EventType::DELETED),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].path.as_os_str(), "file");
        assert_eq!(
            merged[0].kind,
            EventType::CREATED | EventType::MODIFIED | EventType::DELETED
        );
        assert_eq!(merged[1].path.as_os_str(), "other");
        assert_eq!(merged[1].kind, EventType::CREATED);
    }

    #[test]
    fn coalesce_keeps_first_occurrence_order() {
        let merged = coalesce(vec![
            Event::new("b", EventType::CREATED),
            Event::new("a", EventType::CREATED),
            Event::new("b", EventType::MODIFIED),
        ]);

        let paths: Vec<_> = merged.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("b"), PathBuf::from("a")]);
    }

    #[test]
    fn coalesce_never_merges_failures() {
        let merged = coalesce(vec![
            Event::new("Failed to open directory.", EventType::FAILED),
            Event::new("Failed to open directory.", EventType::FAILED),
            Event::new("", EventType::BUFFER_OVERFLOW),
            Event::new("", EventType::CREATED),
        ]);

        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0].kind, EventType::FAILED);
        assert_eq!(merged[1].kind, EventType::FAILED);
        assert_eq!(merged[2].kind, EventType::BUFFER_OVERFLOW);
        assert_eq!(merged[3].kind, EventType::CREATED);
    }

    #[test]
    fn events_are_delivered_after_one_window() {
        let collector = Arc::new(Collector::new());
        let delivered: Arc<Mutex<Vec<Batch>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut dispatcher = Dispatcher::spawn(
            collector.clone(),
            Duration::from_millis(10),
            Box::new(move |batch| sink.lock().unwrap().push(batch)),
        );

        collector.push(Event::new("file", EventType::CREATED));
        collector.push(Event::new("file", EventType::MODIFIED));
        std::thread::sleep(Duration::from_millis(50));

        {
            let delivered = delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].len(), 1);
            assert_eq!(
                delivered[0][0].kind,
                EventType::CREATED | EventType::MODIFIED
            );
        }
        dispatcher.stop();
    }

    #[test]
    fn stop_flushes_pending_events() {
        let collector = Arc::new(Collector::new());
        let delivered: Arc<Mutex<Vec<Batch>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut dispatcher = Dispatcher::spawn(
            collector.clone(),
            Duration::from_secs(60),
            Box::new(move |batch| sink.lock().unwrap().push(batch)),
        );

        collector.push(Event::new("file", EventType::CREATED));
        dispatcher.stop();

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0][0].path.as_os_str(), "file");
    }

    #[test]
    fn consecutive_deliveries_are_spaced_by_the_window() {
        let collector = Arc::new(Collector::new());
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = stamps.clone();
        let mut dispatcher = Dispatcher::spawn(
            collector.clone(),
            Duration::from_millis(20),
            Box::new(move |_| sink.lock().unwrap().push(Instant::now())),
        );

        for _ in 0..4 {
            collector.push(Event::new("file", EventType::MODIFIED));
            std::thread::sleep(Duration::from_millis(15));
        }
        std::thread::sleep(Duration::from_millis(60));
        dispatcher.stop();

        let stamps = stamps.lock().unwrap();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }
    }
}
