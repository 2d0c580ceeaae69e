//! # mailwire
//!
//! A low-level IMAP client transport core: one long-lived connection that
//! multiplexes a duplex byte stream with an IMAP server into tagged
//! request/response exchanges.
//!
//! ## What it does
//!
//! - **Framing**: IMAP responses are CRLF-terminated lines that may embed
//!   binary literals announced inline (`{N}` / `{N+}`). The
//!   [`FrameScanner`] mixes line scanning with length-prefixed byte
//!   capture and yields complete response frames from arbitrarily chunked
//!   input.
//! - **Tagged exchanges**: [`ImapConnection::enqueue_command`] assigns
//!   each command a unique tag, serializes dispatch (one command on the
//!   wire at a time), collects the untagged responses the command claims
//!   and resolves with its tagged completion.
//! - **Continuation-driven sends**: requests with literals compile into
//!   multiple wire chunks; each chunk past the first is released by a
//!   server `+` prompt.
//! - **Priority insertion and prechecks**: a command can carry a deferred
//!   precheck that runs when it reaches the queue head and may enqueue
//!   preparatory commands ahead of it.
//! - **Compression**: after negotiating COMPRESS=DEFLATE,
//!   [`ImapConnection::enable_compression`] splices transparent DEFLATE
//!   into both directions, optionally on a worker task.
//! - **Timers**: every send arms a size-scaled response timeout; a
//!   drained queue reports idleness through the connection observer.
//!
//! ## What it does not do
//!
//! No mailbox model, no connection pooling, no reconnect policy and no
//! authentication flows. Higher layers build those on top of the generic
//! command primitive.
//!
//! ## Quick start
//!
//! ```ignore
//! use mailwire::{Config, ImapConnection, LoggingObserver, Request};
//!
//! #[tokio::main]
//! async fn main() -> mailwire::Result<()> {
//!     let config = Config::new("imap.example.com");
//!     let connection = ImapConnection::connect(config, LoggingObserver).await?;
//!
//!     let response = connection
//!         .enqueue_command(Request::new("CAPABILITY"), &["CAPABILITY"], Default::default())
//!         .await?;
//!     for capability in &response.payload["CAPABILITY"] {
//!         println!("{:?}", capability.attributes);
//!     }
//!
//!     connection.logout().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod connection;
mod error;
pub mod framing;
mod handler;
mod process;
mod queue;
mod splice;

pub use codec::{Attribute, CodeArg, Request, RequestAttribute, Response};
pub use connection::{
    CommandOptions, Config, ConfigBuilder, ImapConnection, ImapStream, PrecheckHandle, Security,
    Transport, TrustDecider,
};
pub use error::{CommandStatus, Error, Result};
pub use framing::FrameScanner;
pub use handler::{
    CollectingObserver, ConnectionEvent, ConnectionObserver, LoggingObserver, NoopObserver,
    UntaggedHandler,
};
pub use process::process;
pub use queue::{CommandId, Precheck};
pub use splice::DeflateEngine;
