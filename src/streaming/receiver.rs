//! Apply handlers for the server side.
//!
//! Each handler checks every path it touches with the containment guard
//! before mutating anything.

use crate::containment::ContainmentGuard;
use crate::error::{Result, SyncError};
use crate::streaming::channel::{ServeStats, DATA_CHUNK_SIZE};
use crate::streaming::protocol::read_full;
use std::io;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

/// Receiver state for one connection
pub struct Receiver {
    guard: Arc<ContainmentGuard>,
    stats: ServeStats,
}

impl Receiver {
    pub fn new(guard: Arc<ContainmentGuard>) -> Self {
        Self {
            guard,
            stats: ServeStats::default(),
        }
    }

    pub fn stats(&self) -> &ServeStats {
        &self.stats
    }

    /// Create or truncate `path` and stream `size` payload bytes into it.
    ///
    /// The payload is copied in bounded chunks as it arrives. A failure part
    /// way through leaves a partially written file behind.
    pub async fn handle_write<R>(&mut self, path: &str, size: u64, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let wire_path = path.to_string();
        let file = self
            .exclusive(move |guard| {
                guard.prepare_parent(&wire_path)?;
                let target = guard.resolve(&wire_path)?;
                Ok(std::fs::File::create(target)?)
            })
            .await?;

        let mut file = File::from_std(file);
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            read_full(reader, &mut buf[..n]).await?;
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;

        info!("Wrote {} ({} bytes)", path, size);
        self.stats.written += 1;
        self.stats.bytes_written += size;
        Ok(())
    }

    /// Delete `path` if it exists. A symlink is removed, not its target.
    pub async fn handle_remove(&mut self, path: &str) -> Result<()> {
        let wire_path = path.to_string();
        let removed = self
            .exclusive(move |guard| {
                let target = guard.approve(&wire_path)?;
                Ok(std::fs::remove_file(target))
            })
            .await?;

        match removed {
            Ok(()) => {
                info!("Removed {}", path);
                self.stats.removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path, e),
        }
        Ok(())
    }

    /// Move `from` to `to`. Both ends must be inside the root; a failed move
    /// is logged and does not end the connection.
    pub async fn handle_rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (source, dest) = (from.to_string(), to.to_string());
        let moved = self
            .exclusive(move |guard| {
                let source = guard.approve(&source)?;
                guard.prepare_parent(&dest)?;
                let dest = guard.approve(&dest)?;
                Ok(std::fs::rename(source, dest))
            })
            .await?;

        match moved {
            Ok(()) => {
                info!("Renamed {} -> {}", from, to);
                self.stats.renamed += 1;
            }
            Err(e) => {
                warn!("Failed to move {} to {}: {}", from, to, e);
                self.stats.rename_failures += 1;
            }
        }
        Ok(())
    }

    /// Check and apply on a blocking thread, excluding other connections.
    async fn exclusive<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ContainmentGuard) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.guard);
        tokio::task::spawn_blocking(move || guard.exclusive(f))
            .await
            .map_err(|e| SyncError::Io(io::Error::other(e)))?
    }
}
