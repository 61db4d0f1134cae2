//! # Karfunkel Server Library
//!
//! Karfunkel is the server every editor instance talks to. Editors connect
//! over TCP, exchange framed XML commands (see the `protocol` crate) and are
//! kept informed of shared state changes through broadcast notifications.
//!
//! ## Connection Lifecycle
//!
//! A new connection must send a single `Hello` request within the greet
//! timeout. Once authenticated it receives an id and a `Ping` request every
//! ping interval. A connection that stays silent from one `Ping` until the
//! liveness check that follows is dropped.
//!
//! ## Plugins
//!
//! Every request and response type is served by exactly one handler,
//! contributed by a [`Plugin`](plugin::Plugin). The built-in `core` plugin
//! (keepalive, shutdown negotiation, client listing) always loads first; the
//! rest are chosen by name in the configuration.
//!
//! ## Module Organization
//!
//! - [`server`]: the [`Karfunkel`] core holding the client registry, id
//!   generators, active project and the run state
//! - [`connection`]: the per-connection state machine
//! - [`client`] and [`client_manager`]: sessions and the registry of
//!   authenticated clients
//! - [`plugin`]: the registration table, dispatcher and handler contexts
//! - [`plugins`]: the plugins shipped with the server
//! - [`shutdown`]: bookkeeping for the graceful shutdown vote
//! - [`config`] and [`logging`]: ambient setup used by the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use karfunkel::{config::Config, Karfunkel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(Karfunkel::new(Config::default())?);
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod client;
pub mod client_manager;
pub mod config;
pub mod connection;
pub mod error;
pub mod ids;
pub mod logging;
pub mod plugin;
pub mod plugins;
pub mod project;
pub mod server;
pub mod shutdown;

pub use error::ServerError;
pub use server::{Karfunkel, RunState, ShutdownOutcome};

/// Version reported to clients in the handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Handlers run behind `catch_unwind`, so a poisoned lock only means a plugin
/// failed mid-update; the guarded state itself stays usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
