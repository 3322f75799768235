//! Streaming change protocol.
//!
//! One-way pipeline from the watched directory to the served one:
//!
//! ```text
//! Client:                                              Server:
//! +-----------+   +-----------+   +--------+   TCP   +------------+
//! | Coalescer |-->|  Hash     |-->| Session|-------->| Dispatcher |--> Apply
//! | (1s frame)|   |  Filter   |   | Sender |  PID0   |  + Guard   |    handlers
//! +-----------+   +-----------+   +--------+         +------------+
//! ```
//!
//! Nothing flows back from the server; there are no acknowledgements.

pub mod channel;
pub mod coalescer;
pub mod filter;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    Change, EventBatch, Frame, RawEvent, RawEventKind, SendStats, ServeStats, DATA_CHUNK_SIZE,
    DEFAULT_FRAME_WINDOW, MAX_SMALL_PAYLOAD,
};
pub use coalescer::Coalescer;
pub use filter::{HashFilter, TrackedFile};
pub use protocol::{Action, Header, Message, FIXED_HEADER_SIZE, MAGIC, MAX_PATH_SIZE};
pub use receiver::Receiver;
pub use sender::{Session, SessionConfig};
