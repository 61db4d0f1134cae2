//! # Karfunkel Wire Protocol
//!
//! Types and codecs shared by the Karfunkel server and its clients.
//!
//! A connection carries a stream of *frames*. Each frame is one XML document
//! rooted at `<Karfunkel>` followed by a single [`END_OF_COMMAND`] byte. The
//! decoded form of a frame is a [`Command`], which bundles the requests,
//! responses and notifications sent by one peer at one time.
//!
//! ## Module Organization
//!
//! - [`command`]: the in-memory command model (requests, responses,
//!   notifications, statuses)
//! - [`schema`]: per-type parameter declarations with defaults
//! - [`transformer`]: the stateful XML codec that also correlates responses to
//!   the requests it previously encoded
//! - [`framing`]: reassembly of frames from an arbitrary byte stream
//!
//! ## Example
//!
//! ```rust
//! use protocol::{Command, Request, Transformer};
//!
//! let mut transformer = Transformer::default();
//! let mut command = Command::new();
//! command.requests.push(Request::new(1, "Hello").with_param("os", "linux"));
//!
//! let frame = transformer.encode(&command)?;
//! assert_eq!(frame.last(), Some(&protocol::END_OF_COMMAND));
//! # Ok::<(), protocol::ProtocolError>(())
//! ```

pub mod command;
pub mod error;
pub mod framing;
pub mod schema;
pub mod transformer;
mod xml;

pub use command::{
    ClientId, Command, Notification, Parameters, Request, RequestId, Response, Status,
};
pub use error::ProtocolError;
pub use framing::FrameBuffer;
pub use schema::{RequestSchema, SchemaTable};
pub use transformer::Transformer;

/// Byte terminating every frame on the wire. Never valid inside the XML text.
pub const END_OF_COMMAND: u8 = 0x00;

/// Name of the root element of every frame.
pub const ROOT_TAG: &str = "Karfunkel";

/// Default upper bound for a single frame, terminator included.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Request and notification type names understood by the core protocol.
pub mod kinds {
    /// Mandatory first request of every connection.
    pub const HELLO: &str = "Hello";
    /// Server-initiated liveness check.
    pub const PING: &str = "Ping";
    /// Graceful shutdown negotiation.
    pub const SHUTDOWN: &str = "Shutdown";
}
