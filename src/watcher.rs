//! Filesystem-change sources.
//!
//! The pipeline only sees [`EventSource`]: ordered delivery batches of
//! [`RawEvent`]s relative to the watched root. [`NotifySource`] backs it with
//! the platform watcher; [`ChannelSource`] lets tests feed synthetic events.

use crate::error::Result;
use crate::scan::relative_name;
use crate::streaming::channel::{
    event_channel, EventBatch, EventBatchReceiver, EventBatchSender, RawEvent, RawEventKind,
    EVENT_CHANNEL_SIZE,
};
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next delivery batch. `None` once the source is closed.
    async fn next_batch(&mut self) -> Option<EventBatch>;
}

/// Event source fed through a channel.
///
/// Everything already queued when the consumer wakes up is merged into one
/// delivery batch, so a rename reported as two notifications still pairs.
pub struct ChannelSource {
    rx: EventBatchReceiver,
}

impl ChannelSource {
    pub fn new() -> (EventBatchSender, Self) {
        let (tx, rx) = event_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_batch(&mut self) -> Option<EventBatch> {
        let mut batch = self.rx.recv().await?;
        while let Ok(more) = self.rx.try_recv() {
            batch.events.extend(more.events);
            batch.overflowed |= more.overflowed;
        }
        Some(batch)
    }
}

/// How long a rename source waits for its destination notification
pub const RENAME_PAIR_WAIT: Duration = Duration::from_millis(100);

/// Trackers of completed renames remembered for late `Both` notifications
const COMPLETED_TRACKERS: usize = 64;

/// Event source backed by the recommended platform watcher.
pub struct NotifySource {
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    translator: EventTranslator,
}

impl NotifySource {
    /// Watch `root` recursively. `root` should already be canonical.
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Receiver gone means the pipeline is shutting down
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        info!("Watching {}", root.display());
        Ok(Self {
            _watcher: watcher,
            rx,
            translator: EventTranslator::new(root),
        })
    }
}

#[async_trait]
impl EventSource for NotifySource {
    /// Drain everything queued. While a rename source is still unmatched,
    /// wait up to [`RENAME_PAIR_WAIT`] for its destination.
    ///
    /// Events are moved into the translator before every await, so a
    /// cancelled call loses nothing.
    async fn next_batch(&mut self) -> Option<EventBatch> {
        // A cancelled call may have left events in the translator
        if self.translator.is_empty() {
            let first = self.rx.recv().await?;
            self.translator.push(first);
        }

        loop {
            while let Ok(res) = self.rx.try_recv() {
                self.translator.push(res);
            }
            if !self.translator.awaiting_pair() {
                break;
            }
            match tokio::time::timeout(RENAME_PAIR_WAIT, self.rx.recv()).await {
                Ok(Some(res)) => self.translator.push(res),
                Ok(None) | Err(_) => break,
            }
        }

        Some(self.translator.take_batch())
    }
}

enum Slot {
    Event(RawEvent),
    Rename { from: String, to: Option<String> },
}

/// Turns notify events into raw events, joining the two halves of a rename.
///
/// Backends that report a rename as `From` and `To` with a shared tracker
/// (inotify also follows up with `Both`) deliver the halves as separate
/// callbacks. The translator matches them by tracker so they come out
/// adjacent, and drops the `Both` repeat of a rename already seen. A half
/// with no partner, a move into or out of the tree, stays a lone event.
pub struct EventTranslator {
    root: PathBuf,
    slots: Vec<Slot>,
    open: HashMap<usize, usize>,
    completed: VecDeque<usize>,
    overflowed: bool,
}

impl EventTranslator {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            slots: Vec::new(),
            open: HashMap::new(),
            completed: VecDeque::new(),
            overflowed: false,
        }
    }

    pub fn push(&mut self, res: notify::Result<Event>) {
        let event = match res {
            Ok(event) if event.need_rescan() => {
                self.overflowed = true;
                return;
            }
            Ok(event) => event,
            Err(e) => {
                warn!("Watcher error, rescanning: {}", e);
                self.overflowed = true;
                return;
            }
        };
        let tracker = event.attrs.tracker();

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for name in self.names(&event) {
                    match tracker {
                        Some(t) if !self.completed.contains(&t) => {
                            self.open.insert(t, self.slots.len());
                            self.slots.push(Slot::Rename {
                                from: name,
                                to: None,
                            });
                        }
                        _ => self
                            .slots
                            .push(Slot::Event(RawEvent::new(RawEventKind::RenameFrom, name))),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for name in self.names(&event) {
                    if let Some(t) = tracker {
                        if self.complete(t, &name) {
                            continue;
                        }
                        if !self.completed.contains(&t) {
                            self.remember(t);
                        }
                    }
                    self.slots
                        .push(Slot::Event(RawEvent::new(RawEventKind::RenameTo, name)));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let Some(t) = tracker {
                    if self.completed.contains(&t) {
                        return;
                    }
                }
                let from = event.paths.first().and_then(|p| relative_name(&self.root, p));
                let to = event.paths.get(1).and_then(|p| relative_name(&self.root, p));
                match (from, to) {
                    (Some(from), Some(to)) => {
                        if let Some(t) = tracker {
                            if self.complete(t, &to) {
                                return;
                            }
                            self.remember(t);
                        }
                        self.slots.push(Slot::Rename { from, to: Some(to) });
                    }
                    (Some(from), None) => self
                        .slots
                        .push(Slot::Event(RawEvent::new(RawEventKind::RenameFrom, from))),
                    (None, Some(to)) => self
                        .slots
                        .push(Slot::Event(RawEvent::new(RawEventKind::RenameTo, to))),
                    (None, None) => {}
                }
            }
            _ => {
                let events = map_event(&self.root, &event);
                self.slots.extend(events.into_iter().map(Slot::Event));
            }
        }
    }

    /// Nothing translated is waiting to be taken.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && !self.overflowed
    }

    /// A rename source is still waiting for its destination.
    pub fn awaiting_pair(&self) -> bool {
        !self.open.is_empty()
    }

    /// Emit everything translated so far. Unmatched sources become lone
    /// `RenameFrom` events.
    pub fn take_batch(&mut self) -> EventBatch {
        // A destination arriving after this is reported on its own
        let timed_out: Vec<usize> = self.open.drain().map(|(t, _)| t).collect();
        for t in timed_out {
            self.remember(t);
        }
        let mut events = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            match slot {
                Slot::Event(event) => events.push(event),
                Slot::Rename { from, to } => {
                    events.push(RawEvent::new(RawEventKind::RenameFrom, from));
                    if let Some(to) = to {
                        events.push(RawEvent::new(RawEventKind::RenameTo, to));
                    }
                }
            }
        }
        EventBatch {
            events,
            overflowed: std::mem::take(&mut self.overflowed),
        }
    }

    fn names(&self, event: &Event) -> Vec<String> {
        event
            .paths
            .iter()
            .filter_map(|p| relative_name(&self.root, p))
            .collect()
    }

    /// Attach `to` to the open source with tracker `t`.
    fn complete(&mut self, t: usize, to: &str) -> bool {
        let Some(index) = self.open.remove(&t) else {
            return false;
        };
        if let Some(Slot::Rename { to: slot_to, .. }) = self.slots.get_mut(index) {
            *slot_to = Some(to.to_string());
        }
        self.remember(t);
        true
    }

    fn remember(&mut self, t: usize) {
        if self.completed.len() == COMPLETED_TRACKERS {
            self.completed.pop_front();
        }
        self.completed.push_back(t);
    }
}

/// Translate a `notify::Event` into zero or more raw events, without
/// tracker matching.
///
/// `Both` carries the source and destination in one event and becomes an
/// adjacent `RenameFrom`/`RenameTo` pair.
pub fn map_event(root: &Path, event: &Event) -> Vec<RawEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => Some(RawEventKind::Added),
        EventKind::Remove(_) => Some(RawEventKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawEventKind::RenameFrom),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawEventKind::RenameTo),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let kinds = [RawEventKind::RenameFrom, RawEventKind::RenameTo];
            return event
                .paths
                .iter()
                .zip(kinds)
                .filter_map(|(p, kind)| relative_name(root, p).map(|name| RawEvent::new(kind, name)))
                .collect();
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Backend could not tell which side of the rename this is
            return event
                .paths
                .iter()
                .filter_map(|p| {
                    let kind = if p.exists() {
                        RawEventKind::Added
                    } else {
                        RawEventKind::Removed
                    };
                    relative_name(root, p).map(|name| RawEvent::new(kind, name))
                })
                .collect();
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(RawEventKind::Modified),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    };

    let Some(kind) = kind else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter_map(|p| relative_name(root, p))
        .map(|name| RawEvent::new(kind, name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::Change;
    use crate::streaming::coalescer::pair_events;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn test_map_basic_kinds() {
        let root = Path::new("/watch");
        let created = map_event(
            root,
            &event(EventKind::Create(CreateKind::File), &["/watch/a.txt"]),
        );
        assert_eq!(created, vec![RawEvent::new(RawEventKind::Added, "a.txt")]);

        let modified = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Any)),
                &["/watch/sub/b.txt"],
            ),
        );
        assert_eq!(
            modified,
            vec![RawEvent::new(RawEventKind::Modified, "sub/b.txt")]
        );

        let removed = map_event(
            root,
            &event(EventKind::Remove(RemoveKind::File), &["/watch/c.txt"]),
        );
        assert_eq!(removed, vec![RawEvent::new(RawEventKind::Removed, "c.txt")]);
    }

    #[test]
    fn test_map_rename_sides() {
        let root = Path::new("/watch");
        let from = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/watch/a.txt"],
            ),
        );
        let to = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                &["/watch/b.txt"],
            ),
        );
        let both = map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/watch/a.txt", "/watch/b.txt"],
            ),
        );

        assert_eq!(from, vec![RawEvent::new(RawEventKind::RenameFrom, "a.txt")]);
        assert_eq!(to, vec![RawEvent::new(RawEventKind::RenameTo, "b.txt")]);
        assert_eq!(
            both,
            vec![
                RawEvent::new(RawEventKind::RenameFrom, "a.txt"),
                RawEvent::new(RawEventKind::RenameTo, "b.txt"),
            ]
        );
    }

    fn rename(mode: RenameMode, paths: &[&str], tracker: usize) -> notify::Result<Event> {
        Ok(event(EventKind::Modify(ModifyKind::Name(mode)), paths).set_tracker(tracker))
    }

    fn renamed(from: &str, to: &str) -> Change {
        Change::Renamed {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn test_inotify_rename_sequence_is_one_rename() {
        let mut translator = EventTranslator::new(Path::new("/watch"));
        translator.push(rename(RenameMode::From, &["/watch/a.txt"], 7));
        assert!(translator.awaiting_pair());
        translator.push(rename(RenameMode::To, &["/watch/b.txt"], 7));
        assert!(!translator.awaiting_pair());
        translator.push(rename(
            RenameMode::Both,
            &["/watch/a.txt", "/watch/b.txt"],
            7,
        ));

        let batch = translator.take_batch();
        assert_eq!(pair_events(batch.events), vec![renamed("a.txt", "b.txt")]);
    }

    #[test]
    fn test_late_both_after_batch_is_dropped() {
        let mut translator = EventTranslator::new(Path::new("/watch"));
        translator.push(rename(RenameMode::From, &["/watch/a.txt"], 3));
        translator.push(rename(RenameMode::To, &["/watch/b.txt"], 3));
        let first = translator.take_batch();
        assert_eq!(pair_events(first.events), vec![renamed("a.txt", "b.txt")]);

        translator.push(rename(
            RenameMode::Both,
            &["/watch/a.txt", "/watch/b.txt"],
            3,
        ));
        assert!(translator.take_batch().events.is_empty());
    }

    #[test]
    fn test_interleaved_renames_pair_by_tracker() {
        let mut translator = EventTranslator::new(Path::new("/watch"));
        translator.push(rename(RenameMode::From, &["/watch/a.txt"], 1));
        translator.push(rename(RenameMode::From, &["/watch/c.txt"], 2));
        translator.push(rename(RenameMode::To, &["/watch/d.txt"], 2));
        translator.push(rename(RenameMode::To, &["/watch/b.txt"], 1));

        let batch = translator.take_batch();
        assert_eq!(
            pair_events(batch.events),
            vec![renamed("a.txt", "b.txt"), renamed("c.txt", "d.txt")]
        );
    }

    #[test]
    fn test_both_alone_is_one_rename() {
        let mut translator = EventTranslator::new(Path::new("/watch"));
        translator.push(rename(
            RenameMode::Both,
            &["/watch/x.txt", "/watch/y.txt"],
            9,
        ));
        assert!(!translator.awaiting_pair());
        assert_eq!(
            pair_events(translator.take_batch().events),
            vec![renamed("x.txt", "y.txt")]
        );
    }

    #[test]
    fn test_moves_across_the_root_stay_lone() {
        let mut translator = EventTranslator::new(Path::new("/watch"));

        // Moved out of the tree: the destination never shows up
        translator.push(rename(RenameMode::From, &["/watch/gone.txt"], 4));
        let out = translator.take_batch();
        assert_eq!(
            pair_events(out.events),
            vec![Change::Removed("gone.txt".to_string())]
        );
        // A straggling destination for it is reported on its own
        translator.push(rename(RenameMode::To, &["/watch/back.txt"], 4));
        assert_eq!(
            pair_events(translator.take_batch().events),
            vec![Change::Added("back.txt".to_string())]
        );

        // Moved into the tree
        translator.push(rename(RenameMode::To, &["/watch/new.txt"], 5));
        translator.push(rename(
            RenameMode::Both,
            &["/elsewhere/new.txt", "/watch/new.txt"],
            5,
        ));
        assert_eq!(
            pair_events(translator.take_batch().events),
            vec![Change::Added("new.txt".to_string())]
        );
    }

    #[test]
    fn test_translator_keeps_order_and_flags_rescan() {
        let mut translator = EventTranslator::new(Path::new("/watch"));
        translator.push(Ok(event(
            EventKind::Create(CreateKind::File),
            &["/watch/a.txt"],
        )));
        translator.push(Err(notify::Error::generic("queue overflow")));
        translator.push(Ok(event(
            EventKind::Remove(RemoveKind::File),
            &["/watch/b.txt"],
        )));

        let batch = translator.take_batch();
        assert!(batch.overflowed);
        assert_eq!(
            batch.events,
            vec![
                RawEvent::new(RawEventKind::Added, "a.txt"),
                RawEvent::new(RawEventKind::Removed, "b.txt"),
            ]
        );
        assert!(!translator.take_batch().overflowed);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_notify_source_reports_rename_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = std::fs::canonicalize(temp.path()).unwrap();
        std::fs::write(root.join("a.txt"), "content").unwrap();

        let mut source = NotifySource::new(&root).unwrap();
        std::fs::rename(root.join("a.txt"), root.join("b.txt")).unwrap();

        let mut changes = Vec::new();
        while let Ok(Some(batch)) =
            tokio::time::timeout(Duration::from_millis(500), source.next_batch()).await
        {
            changes.extend(pair_events(batch.events));
        }

        assert!(changes.contains(&renamed("a.txt", "b.txt")));
        assert!(!changes.contains(&Change::Removed("a.txt".to_string())));
        assert!(!changes.contains(&Change::Added("b.txt".to_string())));
    }

    #[test]
    fn test_map_ignores_metadata_and_outside_paths() {
        let root = Path::new("/watch");
        assert!(map_event(
            root,
            &event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)),
                &["/watch/a.txt"],
            ),
        )
        .is_empty());
        assert!(map_event(
            root,
            &event(EventKind::Create(CreateKind::File), &["/elsewhere/a.txt"]),
        )
        .is_empty());
    }

    #[tokio::test]
    async fn test_channel_source_merges_queued_batches() {
        let (tx, mut source) = ChannelSource::new();
        tx.send(EventBatch::new(vec![RawEvent::new(
            RawEventKind::RenameFrom,
            "a.txt",
        )]))
        .await
        .unwrap();
        tx.send(EventBatch::new(vec![RawEvent::new(
            RawEventKind::RenameTo,
            "b.txt",
        )]))
        .await
        .unwrap();

        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[1].kind, RawEventKind::RenameTo);

        drop(tx);
        assert!(source.next_batch().await.is_none());
    }
}
