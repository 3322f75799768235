//! Event and change types shared by the client pipeline.
//!
//! Watcher -> Coalescer -> Hash Filter -> wire
//! Using a bounded channel between the watcher thread and the pipeline.

use std::time::Duration;
use tokio::sync::mpsc;

/// Channel size for watcher -> pipeline (delivery batches)
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Default batch window, anchored to the first event of a burst
pub const DEFAULT_FRAME_WINDOW: Duration = Duration::from_secs(1);

/// Chunk size for streaming Add/Modify payloads to disk
pub const DATA_CHUNK_SIZE: usize = 32 * 1024; // 32KB

/// Maximum in-memory payload for Removed/Renamed (path + destination)
pub const MAX_SMALL_PAYLOAD: usize = 8 * 1024; // 8KB

// =============================================================================
// RawEvent: watcher -> Coalescer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Added,
    Removed,
    Modified,
    RenameFrom,
    RenameTo,
}

/// A filesystem notification, relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub name: String,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// One delivery from the notification source.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<RawEvent>,
    /// The source dropped events; the tree must be rescanned.
    pub overflowed: bool,
}

impl EventBatch {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            overflowed: false,
        }
    }

    pub fn overflow() -> Self {
        Self {
            events: Vec::new(),
            overflowed: true,
        }
    }
}

/// Sender half used by watcher implementations
pub type EventBatchSender = mpsc::Sender<EventBatch>;

/// Receiver half consumed by the pipeline
pub type EventBatchReceiver = mpsc::Receiver<EventBatch>;

pub fn event_channel() -> (EventBatchSender, EventBatchReceiver) {
    mpsc::channel(EVENT_CHANNEL_SIZE)
}

// =============================================================================
// Change: Coalescer -> Hash Filter
// =============================================================================

/// A change after rename pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(String),
    Modified(String),
    Removed(String),
    Renamed { from: String, to: String },
}

impl Change {
    /// Path whose current attributes decide whether the change is a directory.
    pub fn path(&self) -> &str {
        match self {
            Change::Added(p) | Change::Modified(p) | Change::Removed(p) => p,
            Change::Renamed { from, .. } => from,
        }
    }
}

/// One flushed batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub changes: Vec<Change>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Client-side counters for one run
#[derive(Debug, Default, Clone)]
pub struct SendStats {
    /// Frames flushed
    pub frames: u64,

    /// Messages written to the connection
    pub messages: u64,

    /// Payload bytes written
    pub bytes_sent: u64,

    /// Changes dropped by the hash filter
    pub skipped: u64,
}

/// Server-side counters for one connection
#[derive(Debug, Default, Clone)]
pub struct ServeStats {
    /// Files created or overwritten
    pub written: u64,

    /// Files removed
    pub removed: u64,

    /// Renames applied
    pub renamed: u64,

    /// Renames whose move failed (non-fatal)
    pub rename_failures: u64,

    /// Payload bytes written to disk
    pub bytes_written: u64,
}

// =============================================================================
// Tests
// =============================================================================
