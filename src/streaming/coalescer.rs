//! Change coalescer.
//!
//! Pairs rename notifications and batches changes into frames. The batch
//! window is fixed: it opens with the first event of a burst and is never
//! extended by later events.

use crate::streaming::channel::{Change, Frame, RawEvent, RawEventKind};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Pair renames within one delivery batch.
///
/// - `RenameFrom(old)` directly followed by `RenameTo(new)` becomes a rename.
/// - A lone `RenameFrom(old)` becomes `Removed(old)`.
/// - A lone `RenameTo(new)` becomes `Added(new)`.
pub fn pair_events(events: Vec<RawEvent>) -> Vec<Change> {
    let mut changes = Vec::with_capacity(events.len());
    let mut iter = events.into_iter().peekable();

    while let Some(event) = iter.next() {
        let change = match event.kind {
            RawEventKind::Added => Change::Added(event.name),
            RawEventKind::Modified => Change::Modified(event.name),
            RawEventKind::Removed => Change::Removed(event.name),
            RawEventKind::RenameTo => Change::Added(event.name),
            RawEventKind::RenameFrom => {
                match iter.next_if(|next| next.kind == RawEventKind::RenameTo) {
                    Some(to) => Change::Renamed {
                        from: event.name,
                        to: to.name,
                    },
                    None => Change::Removed(event.name),
                }
            }
        };
        changes.push(change);
    }

    changes
}

/// Accumulates changes until the batch deadline passes.
pub struct Coalescer {
    window: Duration,
    pending: Vec<Change>,
    deadline: Option<Instant>,
    frames: u64,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            deadline: None,
            frames: 0,
        }
    }

    /// Add one delivery batch of raw events.
    pub fn push(&mut self, events: Vec<RawEvent>, now: Instant) {
        self.extend(pair_events(events), now);
    }

    /// Add already-paired changes (initial scan, rescan).
    pub fn extend(&mut self, changes: impl IntoIterator<Item = Change>, now: Instant) {
        let was_empty = self.pending.is_empty();
        self.pending.extend(changes);
        if was_empty && !self.pending.is_empty() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When the pending batch must be flushed; `None` while nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take everything pending as the next frame.
    pub fn flush(&mut self) -> Option<Frame> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        self.frames += 1;
        Some(Frame {
            id: self.frames,
            changes: std::mem::take(&mut self.pending),
        })
    }
}

/// Drop changes whose path is currently a directory under `root`.
pub async fn drop_directories(frame: &mut Frame, root: &Path) {
    let mut kept = Vec::with_capacity(frame.changes.len());
    for change in frame.changes.drain(..) {
        let is_dir = tokio::fs::metadata(root.join(change.path()))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir {
            tracing::trace!("Ignoring directory {}", change.path());
        } else {
            kept.push(change);
        }
    }
    frame.changes = kept;
}
