//! Client mode - runs when invoked as `dropsync watch <server> <dir>`

use crate::streaming::channel::SendStats;
use crate::streaming::sender::{Session, SessionConfig};
use crate::transport::tcp;
use crate::watcher::NotifySource;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufWriter;
use tracing::{error, info, warn};

/// Client configuration
pub struct ClientConfig {
    /// Server address, `host` or `host:port`
    pub server: String,
    /// Port used when `server` names none
    pub port: u16,
    /// Directory to watch (canonical)
    pub root: PathBuf,
    /// Batch window for coalescing changes
    pub frame_window: Duration,
    /// Send every existing file before watching
    pub initial_scan: bool,
}

/// Main client entry point
///
/// Connects, starts watching, and streams changes until Ctrl-C or until the
/// watcher goes away. Losing the connection is fatal; there is no reconnect.
pub async fn run_client(config: ClientConfig) -> Result<SendStats> {
    let stream = tcp::connect(&config.server, config.port).await?;
    info!(
        "Connected to {}. Watching directory {}",
        stream.peer_addr()?,
        config.root.display()
    );

    // Watch before scanning so nothing between the two is missed
    let mut source = NotifySource::new(&config.root)
        .with_context(|| format!("Cannot watch {}", config.root.display()))?;

    let session = Session::new(
        SessionConfig {
            root: config.root,
            frame_window: config.frame_window,
            initial_scan: config.initial_scan,
        },
        BufWriter::new(stream),
    );

    let stats = session
        .run(&mut source, shutdown_signal())
        .await
        .map_err(|e| {
            error!("Sync session failed: {}", e);
            e
        })
        .context("Sync session failed")?;

    info!(
        "Sent {} messages in {} frames ({} bytes, {} skipped)",
        stats.messages, stats.frames, stats.bytes_sent, stats.skipped
    );
    Ok(stats)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
