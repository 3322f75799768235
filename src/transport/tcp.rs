//! Plain TCP transport on the well-known port.

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 41218;

/// Split `host`, `host:port`, `[v6]` or `[v6]:port` into host and port.
///
/// A bare IPv6 address without brackets is taken as a host.
pub fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("Unterminated IPv6 address in {}", server))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, server)?,
            None if tail.is_empty() => default_port,
            None => anyhow::bail!("Invalid server address: {}", server),
        };
        return Ok((host.to_string(), port));
    }

    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port, server)?)),
        _ => Ok((server.to_string(), default_port)),
    }
}

fn parse_port(port: &str, server: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("Invalid port in server address: {}", server))
}

/// Connect to `server`, using `default_port` unless the address names one.
pub async fn connect(server: &str, default_port: u16) -> Result<TcpStream> {
    let (host, port) = split_host_port(server, default_port)?;
    debug!("Connecting to {}:{}", host, port);

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Listen on `bind:port`.
pub async fn listen(bind: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", bind, port))
}
