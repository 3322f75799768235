//! Network transport.

pub mod tcp;
