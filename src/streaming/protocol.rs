//! Wire codec for change messages.
//!
//! Unidirectional, no ACKs: the client writes messages, the server never
//! writes back.

use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire format: all multi-byte integers are little-endian.
/// Message format:
///   magic[4] | full_size:u64 | header_size:u32 | action:u32 | digest[20]
///   | path_size:u32 | path | payload
pub const MAGIC: [u8; 4] = *b"PID0";

/// Bytes from magic through path_size inclusive.
pub const FIXED_HEADER_SIZE: usize = 4 + 8 + 4 + 4 + DIGEST_LEN + 4;

/// Maximum path length accepted on the wire.
pub const MAX_PATH_SIZE: usize = 4096;

// =============================================================================
// Actions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Action {
    Added = 1,
    Removed = 2,
    Modified = 3,
    Renamed = 4,
}

impl Action {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Added),
            2 => Some(Self::Removed),
            3 => Some(Self::Modified),
            4 => Some(Self::Renamed),
            _ => None,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// One change on the wire.
///
/// `payload` is file content for Added/Modified, empty for Removed, and the
/// destination path (not null-terminated) for Renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub action: Action,
    pub digest: Digest,
    pub path: String,
    pub payload: Bytes,
}

impl Message {
    pub fn header_size(&self) -> u32 {
        (FIXED_HEADER_SIZE + self.path.len()) as u32
    }

    pub fn full_size(&self) -> u64 {
        self.header_size() as u64 + self.payload.len() as u64
    }

    /// Encode magic through path. The payload is written separately so large
    /// file contents are never copied into the header buffer.
    pub fn encode_header(&self) -> Result<Bytes> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > MAX_PATH_SIZE {
            return Err(SyncError::CapacityExceeded {
                what: "path",
                size: path_bytes.len() as u64,
                limit: MAX_PATH_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FIXED_HEADER_SIZE + path_bytes.len());
        buf.put_slice(&MAGIC);
        buf.put_u64_le(self.full_size());
        buf.put_u32_le(self.header_size());
        buf.put_u32_le(self.action as u32);
        buf.put_slice(self.digest.as_bytes());
        buf.put_u32_le(path_bytes.len() as u32);
        buf.put_slice(path_bytes);

        Ok(buf.freeze())
    }

    /// Encode the whole message into one buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.encode_header()?;
        let mut buf = BytesMut::with_capacity(header.len() + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a complete message held in memory.
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.remaining() < FIXED_HEADER_SIZE {
            return Err(SyncError::Disconnected);
        }
        let header = Header::decode(&bytes[..FIXED_HEADER_SIZE])?;
        bytes.advance(FIXED_HEADER_SIZE);

        let path_size = header.path_size as usize;
        if bytes.remaining() < path_size {
            return Err(SyncError::Disconnected);
        }
        let path = decode_utf8(bytes.copy_to_bytes(path_size), "path")?;

        let payload_size = header.payload_size() as usize;
        if bytes.remaining() < payload_size {
            return Err(SyncError::Disconnected);
        }
        let payload = bytes.copy_to_bytes(payload_size);

        Ok(Self {
            action: header.action,
            digest: header.digest,
            path,
            payload,
        })
    }
}

// =============================================================================
// Header
// =============================================================================

/// Fixed-size prefix of a message, as decoded by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub full_size: u64,
    pub header_size: u32,
    pub action: Action,
    pub digest: Digest,
    pub path_size: u32,
}

impl Header {
    /// Decode and validate the fixed prefix. `buf` must hold at least
    /// `FIXED_HEADER_SIZE` bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(SyncError::Disconnected);
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(SyncError::BadMagic(magic));
        }

        let full_size = buf.get_u64_le();
        let header_size = buf.get_u32_le();
        let action_raw = buf.get_u32_le();
        let mut digest = [0u8; DIGEST_LEN];
        buf.copy_to_slice(&mut digest);
        let path_size = buf.get_u32_le();

        if full_size < header_size as u64 {
            return Err(SyncError::SizeMismatch {
                full_size,
                header_size,
            });
        }
        let action = Action::from_u32(action_raw).ok_or(SyncError::UnknownAction(action_raw))?;

        if path_size as usize > MAX_PATH_SIZE {
            return Err(SyncError::CapacityExceeded {
                what: "path",
                size: path_size as u64,
                limit: MAX_PATH_SIZE,
            });
        }
        if header_size as u64 != FIXED_HEADER_SIZE as u64 + path_size as u64 {
            return Err(SyncError::HeaderSizeMismatch {
                header_size,
                path_size,
            });
        }

        Ok(Self {
            full_size,
            header_size,
            action,
            digest: Digest::from_bytes(digest),
            path_size,
        })
    }

    pub fn payload_size(&self) -> u64 {
        self.full_size - self.header_size as u64
    }
}

fn decode_utf8(bytes: Bytes, what: &'static str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| SyncError::InvalidUtf8(what))
}

// =============================================================================
// Stream reading/writing
// =============================================================================

/// Fill `buf` completely, looping over short reads.
///
/// End-of-stream before the buffer is full is reported as
/// `SyncError::Disconnected`.
pub async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(SyncError::Disconnected);
        }
        filled += n;
    }
    Ok(())
}

/// Read and validate the next header.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a message
/// boundary.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Header>> {
    let mut buf = [0u8; FIXED_HEADER_SIZE];

    let first = r.read(&mut buf).await?;
    if first == 0 {
        return Ok(None);
    }
    read_full(r, &mut buf[first..]).await?;

    Header::decode(&buf).map(Some)
}

/// Read the variable-length path that follows a header.
pub async fn read_path<R: AsyncRead + Unpin>(r: &mut R, header: &Header) -> Result<String> {
    let mut buf = vec![0u8; header.path_size as usize];
    read_full(r, &mut buf).await?;
    decode_utf8(Bytes::from(buf), "path")
}

/// Read a payload that must fit in memory, bounded by `limit` bytes.
pub async fn read_small_payload<R: AsyncRead + Unpin>(
    r: &mut R,
    header: &Header,
    limit: usize,
) -> Result<Bytes> {
    let size = header.payload_size();
    if size > limit as u64 {
        return Err(SyncError::CapacityExceeded {
            what: "payload",
            size,
            limit,
        });
    }
    let mut buf = vec![0u8; size as usize];
    read_full(r, &mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Write one message: header first, then payload.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    let header = msg.encode_header()?;
    w.write_all(&header).await?;
    if !msg.payload.is_empty() {
        w.write_all(&msg.payload).await?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
