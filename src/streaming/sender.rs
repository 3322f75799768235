//! Session sender for the watching side.
//!
//! Owns the connection and drives the client pipeline:
//! EventSource -> Coalescer -> Hash Filter -> connection.

use crate::error::Result;
use crate::scan::list_files;
use crate::streaming::channel::{Change, EventBatch, Frame, SendStats, DEFAULT_FRAME_WINDOW};
use crate::streaming::coalescer::{drop_directories, Coalescer};
use crate::streaming::filter::HashFilter;
use crate::streaming::protocol::write_message;
use crate::watcher::EventSource;
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

/// Session configuration
pub struct SessionConfig {
    /// Watched root (canonical)
    pub root: PathBuf,
    /// Batch window for coalescing changes
    pub frame_window: Duration,
    /// Queue every existing file as Added before watching
    pub initial_scan: bool,
}

impl SessionConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            frame_window: DEFAULT_FRAME_WINDOW,
            initial_scan: true,
        }
    }
}

/// One client connection and the pipeline state that feeds it
pub struct Session<W> {
    writer: W,
    coalescer: Coalescer,
    filter: HashFilter,
    initial_scan: bool,
    stats: SendStats,
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    pub fn new(config: SessionConfig, writer: W) -> Self {
        Self {
            writer,
            coalescer: Coalescer::new(config.frame_window),
            filter: HashFilter::new(config.root),
            initial_scan: config.initial_scan,
            stats: SendStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.filter.root()
    }

    pub fn filter(&self) -> &HashFilter {
        &self.filter
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.coalescer.pending_len()
    }

    /// Take one delivery batch from the event source.
    ///
    /// An overflowed batch also queues a full rescan. The pending frame is
    /// flushed here only if its deadline has already passed.
    pub async fn accept_batch(&mut self, batch: EventBatch) -> Result<()> {
        if batch.overflowed {
            info!("Watcher overflowed, rescanning {}", self.root().display());
            self.queue_rescan().await?;
        }
        self.coalescer.push(batch.events, Instant::now());

        if self.coalescer.is_due(Instant::now()) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Queue every file under the root as Added.
    pub async fn queue_initial_scan(&mut self) -> Result<()> {
        let files = scan(self.root()).await?;
        info!("Initial scan: {} files", files.len());
        self.coalescer
            .extend(files.into_iter().map(Change::Added), Instant::now());
        Ok(())
    }

    /// Queue a Modified for every file present and a Removed for every
    /// tracked file that is gone. The hash filter drops whatever did not
    /// actually change.
    pub async fn queue_rescan(&mut self) -> Result<()> {
        let files = scan(self.root()).await?;
        let present: HashSet<&str> = files.iter().map(String::as_str).collect();
        let gone: Vec<Change> = self
            .filter
            .tracked_paths()
            .filter(|p| !present.contains(p))
            .map(|p| Change::Removed(p.to_string()))
            .collect();

        let now = Instant::now();
        self.coalescer
            .extend(files.iter().cloned().map(Change::Modified), now);
        self.coalescer.extend(gone, now);
        Ok(())
    }

    /// Flush whatever is pending as one frame. Returns the number of
    /// messages sent.
    pub async fn flush(&mut self) -> Result<usize> {
        match self.coalescer.flush() {
            Some(frame) => self.send_frame(frame).await,
            None => Ok(0),
        }
    }

    /// Filter and send one frame, in order.
    pub async fn send_frame(&mut self, mut frame: Frame) -> Result<usize> {
        drop_directories(&mut frame, self.filter.root()).await;
        debug!("Frame {}: {} changes", frame.id, frame.changes.len());

        let mut sent = 0;
        for change in &frame.changes {
            let Some(msg) = self.filter.filter(change, frame.id).await else {
                self.stats.skipped += 1;
                continue;
            };
            write_message(&mut self.writer, &msg).await?;
            sent += 1;
            self.stats.messages += 1;
            self.stats.bytes_sent += msg.payload.len() as u64;
        }
        self.writer.flush().await?;

        self.stats.frames += 1;
        if sent > 0 {
            info!("Frame {}: sent {} of {} changes", frame.id, sent, frame.changes.len());
        }
        Ok(sent)
    }

    /// Run until the event source closes or `shutdown` completes.
    ///
    /// Pending changes are flushed before the connection is half-closed.
    /// Any send failure ends the session with an error.
    pub async fn run<S, F>(mut self, source: &mut S, shutdown: F) -> Result<SendStats>
    where
        S: EventSource + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.initial_scan {
            self.queue_initial_scan().await?;
        }

        loop {
            let deadline = self.coalescer.deadline();
            // Only polled while a deadline is armed
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                batch = source.next_batch() => match batch {
                    Some(batch) => self.accept_batch(batch).await?,
                    None => {
                        info!("Event source closed");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    self.flush().await?;
                }
                _ = &mut shutdown => {
                    info!("Shutting down, flushing {} pending changes", self.pending());
                    break;
                }
            }
        }

        self.finish().await
    }

    /// Flush pending changes and half-close the connection.
    pub async fn finish(mut self) -> Result<SendStats> {
        self.flush().await?;
        self.writer.shutdown().await?;
        Ok(self.stats)
    }
}

async fn scan(root: &Path) -> Result<Vec<String>> {
    let root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || list_files(&root))
        .await
        .map_err(io::Error::other)?;
    Ok(files)
}
