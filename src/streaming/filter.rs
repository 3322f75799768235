//! Hash filter.
//!
//! Decides per change whether the content really changed, and keeps the
//! table of tracked files between frames.

use crate::digest::Digest;
use crate::streaming::channel::Change;
use crate::streaming::protocol::{Action, Message};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Last known state of a file that has been seen with content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: String,
    pub digest: Digest,
    pub last_frame: u64,
}

/// Tracked-file table plus the filtering rules.
pub struct HashFilter {
    root: PathBuf,
    files: HashMap<String, TrackedFile>,
}

impl HashFilter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&TrackedFile> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Evaluate one change within frame `frame`.
    ///
    /// Returns the message to send, or `None` when the change is a no-op.
    pub async fn filter(&mut self, change: &Change, frame: u64) -> Option<Message> {
        match change {
            Change::Added(path) => self.content_changed(path, Action::Added, frame).await,
            Change::Modified(path) => self.content_changed(path, Action::Modified, frame).await,
            Change::Removed(path) => self.removed(path).await,
            Change::Renamed { from, to } => self.renamed(from, to),
        }
    }

    async fn content_changed(&mut self, path: &str, action: Action, frame: u64) -> Option<Message> {
        let full_path = self.root.join(path);
        if !exists(&full_path).await {
            debug!("{} vanished before it could be hashed", path);
            return None;
        }

        if let Some(tracked) = self.files.get(path) {
            if tracked.last_frame == frame {
                debug!("{} already handled in frame {}", path, frame);
                return None;
            }
        }

        let data = match tokio::fs::read(&full_path).await {
            Ok(data) => data,
            Err(e) => {
                debug!("Skipping {}: {}", path, e);
                return None;
            }
        };
        let digest = Digest::of(&data);

        let tracked = self
            .files
            .entry(path.to_string())
            .or_insert_with(|| TrackedFile {
                path: path.to_string(),
                digest: Digest::ZERO,
                last_frame: 0,
            });
        tracked.last_frame = frame;

        if tracked.digest == digest {
            debug!("{} unchanged ({})", path, digest);
            return None;
        }
        tracked.digest = digest;

        info!("New hash on {} ({}), sending {} bytes", path, digest, data.len());
        Some(Message {
            action,
            digest,
            path: path.to_string(),
            payload: Bytes::from(data),
        })
    }

    async fn removed(&mut self, path: &str) -> Option<Message> {
        if exists(&self.root.join(path)).await {
            debug!("{} was recreated, not removing", path);
            return None;
        }

        let tracked = self.files.remove(path)?;
        info!("Removal of tracked file {}", path);
        Some(Message {
            action: Action::Removed,
            digest: tracked.digest,
            path: tracked.path,
            payload: Bytes::new(),
        })
    }

    fn renamed(&mut self, from: &str, to: &str) -> Option<Message> {
        let Some(mut tracked) = self.files.remove(from) else {
            debug!("Ignoring rename of untracked {} -> {}", from, to);
            return None;
        };

        info!("Moved {} -> {}", from, to);
        let msg = Message {
            action: Action::Renamed,
            digest: tracked.digest,
            path: from.to_string(),
            payload: Bytes::copy_from_slice(to.as_bytes()),
        };

        tracked.path = to.to_string();
        self.files.insert(to.to_string(), tracked);
        Some(msg)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
