//! dropsync: one-way directory replication over TCP.
//!
//! The watching side batches filesystem changes, drops the ones whose
//! content did not change, and streams the rest as `PID0` messages. The
//! serving side applies them under its root and refuses any path that
//! resolves outside it.

pub mod config;
pub mod containment;
pub mod digest;
pub mod error;
pub mod scan;
pub mod server;
pub mod streaming;
pub mod sync;
pub mod transport;
pub mod watcher;

pub use error::{Result, SyncError};
