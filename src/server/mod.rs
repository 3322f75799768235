//! Server mode - runs when invoked as `dropsync serve <dir>`
//!
//! Reads one message at a time from each connection and applies it to the
//! served root. The protocol is one-way: nothing is ever written back.

use crate::containment::ContainmentGuard;
use crate::error::{Result, SyncError};
use crate::streaming::channel::{ServeStats, MAX_SMALL_PAYLOAD};
use crate::streaming::protocol::{read_header, read_path, read_small_payload, Action, Header};
use crate::streaming::Receiver;
use crate::transport::tcp;
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How a connection stopped being served
#[derive(Debug)]
pub enum ConnectionEnd {
    /// The peer closed the stream
    PeerClosed,
    /// A protocol, security or I/O error closed the connection
    Rejected(SyncError),
}

impl ConnectionEnd {
    /// Short classification for logs
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectionEnd::PeerClosed => "peer closed",
            ConnectionEnd::Rejected(e) if e.is_protocol() => "protocol violation",
            ConnectionEnd::Rejected(SyncError::OutsideRoot(_)) => "path outside root",
            ConnectionEnd::Rejected(_) => "I/O error",
        }
    }
}

/// Per-connection message loop.
///
/// ReadingHeader -> Dispatching -> ReadingHeader -> ... -> Closed. Any read
/// or validation failure closes the connection; there is no resynchronization.
#[derive(Clone)]
pub struct Dispatcher {
    guard: Arc<ContainmentGuard>,
}

impl Dispatcher {
    pub fn new(guard: Arc<ContainmentGuard>) -> Self {
        Self { guard }
    }

    /// Serve messages from `reader` until the peer disconnects or an error
    /// closes the connection.
    pub async fn serve<R>(&self, reader: &mut R) -> (ConnectionEnd, ServeStats)
    where
        R: AsyncRead + Unpin,
    {
        let mut receiver = Receiver::new(Arc::clone(&self.guard));

        let end = loop {
            let header = match read_header(reader).await {
                Ok(Some(header)) => header,
                Ok(None) => break ConnectionEnd::PeerClosed,
                Err(e) if e.is_clean_disconnect() => break ConnectionEnd::PeerClosed,
                Err(e) => break ConnectionEnd::Rejected(e),
            };
            debug!(
                "{:?} message: {} bytes, path {} bytes",
                header.action, header.full_size, header.path_size
            );

            match self.dispatch(&mut receiver, &header, reader).await {
                Ok(()) => {}
                Err(e) if e.is_clean_disconnect() => break ConnectionEnd::PeerClosed,
                Err(e) => break ConnectionEnd::Rejected(e),
            }
        };

        (end, receiver.stats().clone())
    }

    async fn dispatch<R>(&self, receiver: &mut Receiver, header: &Header, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let path = read_path(reader, header).await?;

        match header.action {
            Action::Added | Action::Modified => {
                receiver
                    .handle_write(&path, header.payload_size(), reader)
                    .await
            }
            Action::Removed => {
                if header.payload_size() != 0 {
                    return Err(SyncError::UnexpectedPayload(header.payload_size()));
                }
                receiver.handle_remove(&path).await
            }
            Action::Renamed => {
                let limit = MAX_SMALL_PAYLOAD.saturating_sub(path.len());
                let dest = read_small_payload(reader, header, limit).await?;
                let dest = String::from_utf8(dest.to_vec())
                    .map_err(|_| SyncError::InvalidUtf8("rename destination"))?;
                receiver.handle_rename(&path, &dest).await
            }
        }
    }
}

/// Server configuration
pub struct ServerConfig {
    /// Directory to replicate into (canonicalized by the caller)
    pub root: PathBuf,
    /// Listen address
    pub bind: String,
    /// Listen port
    pub port: u16,
}

/// Main server entry point
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let guard = ContainmentGuard::new(&config.root)
        .with_context(|| format!("Cannot serve {}", config.root.display()))?;
    let listener = tcp::listen(&config.bind, config.port).await?;

    info!(
        "Serving {} on {}",
        guard.root().display(),
        listener.local_addr()?
    );

    serve(listener, Arc::new(guard), shutdown_signal()).await
}

/// Accept connections until `shutdown` completes.
///
/// Each connection runs on its own task; tasks share only the read-only guard.
pub async fn serve<F>(listener: TcpListener, guard: Arc<ContainmentGuard>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept connection")?;
                info!("Connection received from {}", peer);
                let dispatcher = Dispatcher::new(Arc::clone(&guard));
                tokio::spawn(handle_connection(dispatcher, stream, peer));
            }
            _ = &mut shutdown => {
                info!("Shutting down server");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(dispatcher: Dispatcher, stream: TcpStream, peer: SocketAddr) {
    let mut reader = BufReader::new(stream);
    let (end, stats) = dispatcher.serve(&mut reader).await;

    match end {
        ConnectionEnd::PeerClosed => info!(
            "Connection from {} closed: {} written, {} removed, {} renamed ({} failed), {} bytes",
            peer,
            stats.written,
            stats.removed,
            stats.renamed,
            stats.rename_failures,
            stats.bytes_written
        ),
        ConnectionEnd::Rejected(ref e) => {
            warn!("Closing connection from {} ({}): {}", peer, end.reason(), e)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
