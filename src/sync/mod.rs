//! Watching side entry point.

pub mod client;

pub use client::{run_client, ClientConfig};
