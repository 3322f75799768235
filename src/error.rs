use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Wrong magic in header: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Inconsistent header: full_size {full_size} < header_size {header_size}")]
    SizeMismatch { full_size: u64, header_size: u32 },

    #[error("Inconsistent header: header_size {header_size} does not cover path of {path_size} bytes")]
    HeaderSizeMismatch { header_size: u32, path_size: u32 },

    #[error("Unknown action {0}")]
    UnknownAction(u32),

    #[error("{what} of {size} bytes exceeds the {limit} byte limit")]
    CapacityExceeded {
        what: &'static str,
        size: u64,
        limit: usize,
    },

    #[error("Unexpected payload of {0} bytes for a removal")]
    UnexpectedPayload(u64),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Path is not inside the sync root: {0}")]
    OutsideRoot(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Framing or header errors; the connection cannot be resynchronized.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SyncError::BadMagic(_)
                | SyncError::SizeMismatch { .. }
                | SyncError::HeaderSizeMismatch { .. }
                | SyncError::UnknownAction(_)
                | SyncError::CapacityExceeded { .. }
                | SyncError::UnexpectedPayload(_)
                | SyncError::InvalidUtf8(_)
        )
    }

    pub fn is_clean_disconnect(&self) -> bool {
        matches!(self, SyncError::Disconnected)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
