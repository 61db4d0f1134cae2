//! # Karfunkel Client Library
//!
//! A headless client for the Karfunkel server, the piece an editor embeds to
//! talk to it. It performs the handshake, numbers and sends requests, waits
//! for the responses to them and keeps the connection alive by answering the
//! server's keepalive `Ping` requests on its own.
//!
//! ## Shutdown Votes
//!
//! When any client asks the server to stop, every connected client is asked
//! for its consent with a `Shutdown` request. [`ShutdownPolicy`] decides what
//! this client answers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::Client;
//! use protocol::Parameters;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), client::ClientError> {
//!     let mut client = Client::connect("127.0.0.1:3141", "linux").await?;
//!     println!("connected as client {}", client.welcome().id);
//!
//!     let id = client.send_request("ClientList", Parameters::new()).await?;
//!     let response = client.wait_for_response(id, true).await?;
//!     println!("{} clients online", response.param("count").unwrap_or("0"));
//!
//!     client.close().await
//! }
//! ```

pub mod error;
pub mod network;

pub use error::ClientError;
pub use network::{Client, ShutdownPolicy, Welcome};
