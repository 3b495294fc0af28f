//! The common event model every backend decodes into.

// bitflags! with a 0 value defined triggers this clippy error,
// but we want a named value for EventType::NOOP
#![allow(clippy::bad_bit_mask)]

use std::path::PathBuf;

bitflags::bitflags! {
    /// Bit-set describing what happened to one path within a coalescing
    /// window. Several flags may be set on a single event when changes were
    /// coalesced, or when the native source itself reported an ambiguous
    /// change.
    ///
    /// The numeric values are stable and must not be reordered.
    pub struct EventType: u16 {
        /// Reserved; no change.
        const NOOP = 0;
        /// The entry came into existence during the window.
        const CREATED = 1;
        /// The entry's content or metadata mutated.
        const MODIFIED = 2;
        /// The entry ceased to exist during the window.
        const DELETED = 4;
        /// The entry was one endpoint of a rename.
        const RENAMED = 8;
        /// The native source dropped events; the consumer must rescan.
        const BUFFER_OVERFLOW = 16;
        /// The watch could not start or died; the watcher will stop.
        const FAILED = 32;
    }
}

pub fn created(kind: EventType) -> bool {
    kind.contains(EventType::CREATED)
}

pub fn modified(kind: EventType) -> bool {
    kind.contains(EventType::MODIFIED)
}

pub fn deleted(kind: EventType) -> bool {
    kind.contains(EventType::DELETED)
}

pub fn renamed(kind: EventType) -> bool {
    kind.contains(EventType::RENAMED)
}

pub fn buffer_overflow(kind: EventType) -> bool {
    kind.contains(EventType::BUFFER_OVERFLOW)
}

pub fn failed(kind: EventType) -> bool {
    kind.contains(EventType::FAILED)
}

/// One filesystem change.
///
/// `path` is relative to the watched root; an empty path denotes the root
/// itself. Events carrying [`EventType::FAILED`] use the path as a
/// diagnostic string instead of a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: PathBuf,
    pub kind: EventType,
}

impl Event {
    pub(crate) fn new(path: impl Into<PathBuf>, kind: EventType) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// The events delivered by one callback invocation, in arrival order.
pub type Batch = Vec<Event>;
