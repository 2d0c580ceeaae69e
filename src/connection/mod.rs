//! Connection management and the public connection handle.
//!
//! [`ImapConnection`] is a cheap cloneable handle to the connection's
//! driver task. Commands enqueue through it and resolve with their tagged
//! completion response; lifecycle operations (`upgrade`, compression,
//! `close`, `logout`) are serialized through the same channel, so every
//! mutation of connection state happens on the driver task.

pub(crate) mod driver;

mod config;
mod stream;

pub use config::{Config, ConfigBuilder, Security, TrustDecider};
pub use stream::{connect, ImapStream, Transport};

use tokio::sync::{mpsc, oneshot};

use crate::codec::{Request, Response};
use crate::error::{Error, Result};
use crate::handler::ConnectionObserver;
use crate::queue::{CommandId, Precheck};

use driver::{Driver, Op};

/// Per-command options for [`ImapConnection::enqueue_command`].
#[derive(Default)]
pub struct CommandOptions {
    /// Insertion anchor: when the referenced command is still queued, the
    /// new command is inserted immediately before it and both tags gain a
    /// `.p` suffix. A dispatched or unknown anchor falls back to a tail
    /// append.
    pub ctx: Option<CommandId>,
    /// Deferred check run when the command reaches the queue head; may
    /// enqueue preparatory commands ahead of it via the handle it is
    /// given.
    pub precheck: Option<Precheck>,
    /// Send a bare CRLF if the server issues a continuation prompt after
    /// all compiled chunks have been sent (some servers prompt once more
    /// before reporting an error).
    pub error_response_expects_empty_line: bool,
}

impl std::fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandOptions")
            .field("ctx", &self.ctx)
            .field("has_precheck", &self.precheck.is_some())
            .field(
                "error_response_expects_empty_line",
                &self.error_response_expects_empty_line,
            )
            .finish()
    }
}

/// Handle given to a running precheck.
///
/// Carries the connection and the id of the command the precheck guards,
/// so preparatory commands can be enqueued ahead of it.
#[derive(Debug)]
pub struct PrecheckHandle {
    connection: ImapConnection,
    id: CommandId,
}

impl PrecheckHandle {
    pub(crate) fn new(connection: ImapConnection, id: CommandId) -> Self {
        Self { connection, id }
    }

    /// The connection the guarded command is queued on.
    #[must_use]
    pub fn connection(&self) -> &ImapConnection {
        &self.connection
    }

    /// The id of the guarded command, for use as a `ctx` anchor.
    #[must_use]
    pub fn command_id(&self) -> CommandId {
        self.id
    }

    /// Enqueues a preparatory command ahead of the guarded command and
    /// waits for its completion.
    ///
    /// # Errors
    ///
    /// Fails if the preparatory command fails or the connection closes.
    pub async fn enqueue_before(
        &self,
        request: Request,
        accept_untagged: &[&str],
    ) -> Result<Response> {
        self.connection
            .enqueue_command(
                request,
                accept_untagged,
                CommandOptions {
                    ctx: Some(self.id),
                    ..CommandOptions::default()
                },
            )
            .await
    }
}

/// A handle to one IMAP connection.
///
/// Clones share the same underlying connection. Dropping every handle
/// (and every in-flight command) shuts the driver down.
#[derive(Debug, Clone)]
pub struct ImapConnection {
    ops: mpsc::UnboundedSender<Op>,
}

impl ImapConnection {
    /// Opens the transport described by `config` and starts the
    /// connection driver.
    ///
    /// Completes when the socket is open, not when the server greeting
    /// arrives; the observer's `on_ready` reports the greeting.
    ///
    /// # Errors
    ///
    /// Fails if the TCP connection or TLS handshake fails or times out.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub async fn connect<O>(config: Config, observer: O) -> Result<Self>
    where
        O: ConnectionObserver,
    {
        let stream = stream::connect(&config).await?;
        Ok(Self::from_transport(stream, config, observer))
    }

    /// Starts the connection driver over an already-open transport.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_transport<T, O>(transport: T, config: Config, observer: O) -> Self
    where
        T: Transport,
        O: ConnectionObserver,
    {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(transport, config, observer, ops_tx.downgrade(), ops_rx);
        tokio::spawn(driver.run());
        Self { ops: ops_tx }
    }

    pub(crate) fn from_sender(ops: mpsc::UnboundedSender<Op>) -> Self {
        Self { ops }
    }

    /// Enqueues a command and resolves with its tagged completion.
    ///
    /// Untagged responses whose names appear in `accept_untagged` are
    /// collected while the command is in flight and attached to the
    /// completion response as its payload.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Command`] when the server completes the
    /// command with `NO` or `BAD`, and with [`Error::ConnectionClosed`]
    /// when the connection goes away before the completion arrives.
    pub async fn enqueue_command(
        &self,
        request: Request,
        accept_untagged: &[&str],
        options: CommandOptions,
    ) -> Result<Response> {
        let (responder, completion) = oneshot::channel();
        self.ops
            .send(Op::Enqueue {
                request,
                accept_untagged: accept_untagged
                    .iter()
                    .map(|name| (*name).to_string())
                    .collect(),
                options,
                responder,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        completion.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Registers a global handler for an untagged response name.
    ///
    /// The handler runs on the driver task for every matching untagged
    /// response the current command did not claim.
    ///
    /// # Errors
    ///
    /// Fails if the connection is already closed.
    pub fn set_handler<F>(&self, command: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Response) + Send + 'static,
    {
        self.ops
            .send(Op::SetHandler {
                command: command.to_string(),
                handler: Box::new(handler),
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Installs the DEFLATE splice.
    ///
    /// The caller must have negotiated COMPRESS=DEFLATE with the server
    /// first; from the completion of this call every byte in both
    /// directions is compressed.
    ///
    /// # Errors
    ///
    /// Fails if the connection is already closed.
    pub async fn enable_compression(&self) -> Result<()> {
        let (responder, done) = oneshot::channel();
        self.ops
            .send(Op::EnableCompression { responder })
            .map_err(|_| Error::ConnectionClosed)?;
        done.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Upgrades the transport to TLS in place (STARTTLS).
    ///
    /// # Errors
    ///
    /// Fails if the handshake fails; the connection is closed afterwards.
    pub async fn upgrade(&self) -> Result<()> {
        let (responder, done) = oneshot::channel();
        self.ops
            .send(Op::Upgrade { responder })
            .map_err(|_| Error::ConnectionClosed)?;
        done.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Tears the connection down.
    ///
    /// Idempotent and infallible: closing an already-closed connection is
    /// a no-op. Every outstanding command is rejected with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        let (responder, done) = oneshot::channel();
        if self.ops.send(Op::Close { responder }).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Enqueues `LOGOUT` and tears down once the server closes the
    /// socket.
    ///
    /// # Errors
    ///
    /// Currently infallible beyond connection loss, which it treats as
    /// completion.
    pub async fn logout(&self) -> Result<()> {
        let (responder, done) = oneshot::channel();
        if self.ops.send(Op::Logout { responder }).is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }
}
