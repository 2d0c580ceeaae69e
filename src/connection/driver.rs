//! Connection driver.
//!
//! One task owns everything mutable about a connection: the transport,
//! the framing scanner, the command queue, the current command, both
//! timers and the compression flag. Handles talk to it over an op
//! channel, the compression codec reports over the splice channel, and
//! timers are armed as deadlines the select loop sleeps on. Because all
//! state lives on this task there is nothing to lock.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::codec::{self, Request, Response};
use crate::error::{CommandStatus, Error, Result};
use crate::framing::FrameScanner;
use crate::handler::{ConnectionObserver, UntaggedHandler};
use crate::process::process;
use crate::queue::{CommandId, CommandQueue, QueuedCommand, SenderState};
use crate::splice::{CompressionSplice, SpliceOutput};

use super::config::Config;
use super::stream::Transport;
use super::{CommandOptions, ImapConnection, PrecheckHandle};

/// Operations sent from connection handles to the driver.
pub(crate) enum Op {
    Enqueue {
        request: Request,
        accept_untagged: Vec<String>,
        options: CommandOptions,
        responder: oneshot::Sender<Result<Response>>,
    },
    SetHandler {
        command: String,
        handler: UntaggedHandler,
    },
    EnableCompression {
        responder: oneshot::Sender<Result<()>>,
    },
    Upgrade {
        responder: oneshot::Sender<Result<()>>,
    },
    Close {
        responder: oneshot::Sender<()>,
    },
    Logout {
        responder: oneshot::Sender<Result<()>>,
    },
    PrecheckDone {
        id: CommandId,
        result: Result<()>,
    },
}

enum Tick {
    Op(Option<Op>),
    Read(std::io::Result<usize>),
    Splice(Option<SpliceOutput>),
    ResponseTimeout(Duration),
    IdleTimeout,
}

enum ContinuationAction {
    SendChunk(Vec<u8>),
    SendEmptyLine,
    Ignore,
}

pub(crate) struct Driver<T, O> {
    config: Config,
    stream: Option<T>,
    observer: O,
    ops_weak: mpsc::WeakUnboundedSender<Op>,
    ops_rx: mpsc::UnboundedReceiver<Op>,
    scanner: FrameScanner,
    queue: CommandQueue,
    current: Option<QueuedCommand>,
    state: SenderState,
    /// True while a precheck is outstanding and no enqueue has re-driven
    /// the sender in the meantime.
    restart_pending: bool,
    handlers: HashMap<String, UntaggedHandler>,
    splice: Option<CompressionSplice>,
    compressed: bool,
    connection_ready: bool,
    secure: bool,
    read_buf: BytesMut,
    response_deadline: Option<(Instant, Duration)>,
    idle_deadline: Option<Instant>,
    logout_waiters: Vec<oneshot::Sender<Result<()>>>,
    closed: bool,
}

impl<T, O> Driver<T, O>
where
    T: Transport,
    O: ConnectionObserver,
{
    pub(crate) fn new(
        stream: T,
        config: Config,
        observer: O,
        ops_weak: mpsc::WeakUnboundedSender<Op>,
        ops_rx: mpsc::UnboundedReceiver<Op>,
    ) -> Self {
        let secure = stream.is_secure();
        Self {
            config,
            stream: Some(stream),
            observer,
            ops_weak,
            ops_rx,
            scanner: FrameScanner::new(),
            queue: CommandQueue::new(),
            current: None,
            state: SenderState::Idle,
            restart_pending: false,
            handlers: HashMap::new(),
            splice: None,
            compressed: false,
            connection_ready: false,
            secure,
            read_buf: BytesMut::with_capacity(8 * 1024),
            response_deadline: None,
            idle_deadline: None,
            logout_waiters: Vec::new(),
            closed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(host = %self.config.host, secure = self.secure, "connection driver started");
        while !self.closed {
            match self.next_tick().await {
                Tick::Op(Some(op)) => self.handle_op(op).await,
                Tick::Op(None) => self.teardown().await,
                Tick::Read(Ok(0)) => self.handle_eof().await,
                Tick::Read(Ok(_)) => {
                    let chunk = self.read_buf.split().freeze();
                    self.handle_chunk(&chunk).await;
                }
                Tick::Read(Err(error)) => self.fatal(Error::Io(error)).await,
                Tick::Splice(Some(output)) => self.handle_splice_output(output).await,
                Tick::Splice(None) => {
                    self.fatal(Error::Compression("codec channel closed".to_string()))
                        .await;
                }
                Tick::ResponseTimeout(waited) => {
                    self.response_deadline = None;
                    self.fatal(Error::Timeout(waited)).await;
                }
                Tick::IdleTimeout => {
                    self.idle_deadline = None;
                    self.observer.on_idle();
                }
            }
        }
        tracing::debug!("connection driver stopped");
    }

    async fn next_tick(&mut self) -> Tick {
        let response_deadline = self.response_deadline;
        let idle_deadline = self.idle_deadline;
        tokio::select! {
            op = self.ops_rx.recv() => Tick::Op(op),
            output = recv_splice(&mut self.splice), if self.splice.is_some() => Tick::Splice(output),
            result = read_chunk(&mut self.stream, &mut self.read_buf) => Tick::Read(result),
            () = sleep_until_opt(response_deadline.map(|(at, _)| at)), if response_deadline.is_some() => {
                Tick::ResponseTimeout(response_deadline.map_or(Duration::ZERO, |(_, waited)| waited))
            }
            () = sleep_until_opt(idle_deadline), if idle_deadline.is_some() => Tick::IdleTimeout,
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Enqueue {
                request,
                accept_untagged,
                options,
                responder,
            } => {
                self.clear_idle();
                let id = self
                    .queue
                    .enqueue(request, accept_untagged, options, responder);
                tracing::trace!(?id, "command enqueued");
                if self.can_send() {
                    self.send_next().await;
                }
            }
            Op::SetHandler { command, handler } => {
                self.handlers.insert(command.to_ascii_uppercase(), handler);
            }
            Op::EnableCompression { responder } => {
                if !self.compressed {
                    self.splice = Some(CompressionSplice::start(self.config.offload_compression));
                    self.compressed = true;
                    tracing::debug!(
                        offload = self.config.offload_compression,
                        "compression enabled"
                    );
                }
                let _ = responder.send(Ok(()));
            }
            Op::Upgrade { responder } => self.handle_upgrade(responder).await,
            Op::Close { responder } => {
                self.teardown().await;
                let _ = responder.send(());
            }
            Op::Logout { responder } => {
                self.logout_waiters.push(responder);
                let (completion, _discarded) = oneshot::channel();
                self.clear_idle();
                self.queue.enqueue(
                    Request::new("LOGOUT"),
                    Vec::new(),
                    CommandOptions::default(),
                    completion,
                );
                if self.can_send() {
                    self.send_next().await;
                }
            }
            Op::PrecheckDone { id, result } => self.handle_precheck_done(id, result).await,
        }
    }

    async fn handle_upgrade(&mut self, responder: oneshot::Sender<Result<()>>) {
        let Some(stream) = self.stream.take() else {
            let _ = responder.send(Err(Error::ConnectionClosed));
            return;
        };
        let config = self.config.clone();
        match stream.upgrade_tls(&config).await {
            Ok(upgraded) => {
                self.secure = true;
                self.stream = Some(upgraded);
                tracing::debug!("transport upgraded to TLS");
                let _ = responder.send(Ok(()));
            }
            Err(error) => {
                let message = error.to_string();
                let _ = responder.send(Err(error));
                self.fatal(Error::ConnectionLost(message)).await;
            }
        }
    }

    /// Raw bytes arrived from the transport.
    async fn handle_chunk(&mut self, chunk: &[u8]) {
        // Any inbound byte cancels the response timer.
        self.response_deadline = None;
        tracing::trace!(len = chunk.len(), compressed = self.compressed, "S: recv");
        if self.compressed {
            if let Some(splice) = &mut self.splice {
                splice.inflate(chunk.to_vec());
            }
        } else {
            self.ingest(chunk).await;
        }
    }

    /// Feeds plaintext bytes to the scanner and routes every completed
    /// frame.
    async fn ingest(&mut self, bytes: &[u8]) {
        self.scanner.feed(bytes);
        loop {
            if self.closed {
                return;
            }
            match self.scanner.next_frame() {
                Ok(Some(frame)) => self.handle_frame(&frame).await,
                Ok(None) => return,
                Err(error) => {
                    self.fatal(error).await;
                    return;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let parsed = match codec::parse(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.fatal(error).await;
                return;
            }
        };
        let response = process(parsed);
        tracing::trace!(tag = %response.tag, command = %response.command, "S: frame");

        if !self.connection_ready {
            self.connection_ready = true;
            tracing::debug!("greeting received");
            self.observer.on_ready();
        }
        self.route(response).await;
    }

    async fn handle_splice_output(&mut self, output: SpliceOutput) {
        match output {
            SpliceOutput::Deflated(bytes) => {
                if let Err(error) = self.write_raw(&bytes).await {
                    self.fatal(error).await;
                }
            }
            SpliceOutput::Inflated(bytes) => self.ingest(&bytes).await,
            SpliceOutput::Failed(message) => self.fatal(Error::Compression(message)).await,
        }
    }

    async fn handle_eof(&mut self) {
        tracing::debug!("server closed the connection");
        if self.logout_waiters.is_empty() {
            self.fatal(Error::ConnectionLost("unexpected end of stream".to_string()))
                .await;
        } else {
            // Expected close after LOGOUT.
            self.teardown().await;
        }
    }

    /// Dispatches a processed response: continuation prompts first, then
    /// the current command's collectors, then global handlers, then
    /// tagged completion.
    async fn route(&mut self, mut response: Response) {
        if response.is_continuation() {
            self.handle_continuation().await;
            return;
        }

        if response.is_untagged() {
            let key = response.command.to_ascii_uppercase();
            if let Some(current) = &mut self.current {
                if current.accept_untagged.contains(&key) {
                    tracing::trace!(tag = %current.tag, command = %key, "collecting untagged response");
                    current.payload.entry(key).or_default().push(response);
                    return;
                }
            }
        }

        if self.current.is_none() {
            if response.is_untagged() {
                if !self.dispatch_global(&response) {
                    tracing::trace!(command = %response.command, "ignoring unclaimed untagged response");
                }
            } else {
                tracing::warn!(tag = %response.tag, "dropping tagged response with no command in flight");
            }
            // A running precheck owns the queue head even though nothing
            // is in flight; re-driving the sender here would dispatch the
            // guarded command before its preparatory inserts.
            if self.state != SenderState::Precheck {
                self.state = SenderState::Ready;
                self.send_next().await;
            }
            return;
        }

        if response.is_untagged() {
            // Untagged responses the current command did not claim fall
            // through to global handlers. The command stays in flight.
            if !self.dispatch_global(&response) {
                tracing::trace!(command = %response.command, "ignoring unclaimed untagged response");
            }
            return;
        }

        let tag_matches = self
            .current
            .as_ref()
            .is_some_and(|current| current.tag == response.tag);
        if !tag_matches {
            tracing::warn!(tag = %response.tag, "dropping response with unknown tag");
            return;
        }

        let Some(mut command) = self.current.take() else {
            return;
        };
        if command.payload.values().any(|bucket| !bucket.is_empty()) {
            response.payload = std::mem::take(&mut command.payload);
        }
        tracing::debug!(tag = %command.tag, status = %response.command, "command completed");
        command.complete(completion_result(response));
        self.state = SenderState::Ready;
        self.send_next().await;
    }

    async fn handle_continuation(&mut self) {
        let action = match &mut self.current {
            None => ContinuationAction::Ignore,
            Some(current) => {
                if let Some(mut chunk) = current.data.pop_front() {
                    if current.data.is_empty() {
                        chunk.extend_from_slice(b"\r\n");
                    }
                    tracing::trace!(tag = %current.tag, remaining = current.data.len(), "continuation prompt");
                    ContinuationAction::SendChunk(chunk)
                } else if current.error_response_expects_empty_line {
                    ContinuationAction::SendEmptyLine
                } else {
                    ContinuationAction::Ignore
                }
            }
        };
        match action {
            ContinuationAction::SendChunk(chunk) => {
                if let Err(error) = self.send_bytes(chunk).await {
                    self.fatal(error).await;
                }
            }
            ContinuationAction::SendEmptyLine => {
                if let Err(error) = self.send_bytes(b"\r\n".to_vec()).await {
                    self.fatal(error).await;
                }
            }
            ContinuationAction::Ignore => {
                tracing::trace!("ignoring continuation prompt without pending data");
            }
        }
    }

    fn dispatch_global(&mut self, response: &Response) -> bool {
        let key = response.command.to_ascii_uppercase();
        if let Some(handler) = self.handlers.get_mut(&key) {
            tracing::trace!(command = %key, "dispatching to global handler");
            handler(response);
            true
        } else {
            false
        }
    }

    fn can_send(&self) -> bool {
        self.state.can_send() && self.connection_ready && self.current.is_none() && !self.closed
    }

    /// Dispatches the queue head, runs its precheck first if it has one,
    /// or arms the idle timer if the queue is empty.
    async fn send_next(&mut self) {
        if !self.can_send() {
            return;
        }
        self.restart_pending = false;

        if self.queue.is_empty() {
            self.enter_idle();
            return;
        }
        self.clear_idle();

        if let Some((id, precheck)) = self.queue.detach_front_precheck() {
            let Some(ops) = self.ops_weak.upgrade() else {
                if let Some(command) = self.queue.remove(id) {
                    command.fail(Error::ConnectionClosed);
                }
                return;
            };
            self.state = SenderState::Precheck;
            self.restart_pending = true;
            tracing::trace!(?id, "running precheck");
            let handle = ImapConnection::from_sender(ops.clone());
            tokio::spawn(async move {
                let result = precheck(PrecheckHandle::new(handle, id)).await;
                let _ = ops.send(Op::PrecheckDone { id, result });
            });
            return;
        }

        let Some(mut command) = self.queue.pop_front() else {
            return;
        };
        self.state = SenderState::InFlight;
        command.data = codec::compile(&command.request).into();
        tracing::debug!(tag = %command.tag, "C: {}", codec::compile_for_log(&command.request));

        let mut first = command.data.pop_front().unwrap_or_default();
        if command.data.is_empty() {
            first.extend_from_slice(b"\r\n");
        }
        self.current = Some(command);
        if let Err(error) = self.send_bytes(first).await {
            self.fatal(error).await;
        }
    }

    async fn handle_precheck_done(&mut self, id: CommandId, result: Result<()>) {
        match result {
            Ok(()) => {
                // Anything enqueued during the precheck already re-drove
                // the sender and cleared the restart flag.
                if self.restart_pending {
                    self.restart_pending = false;
                    self.send_next().await;
                }
            }
            Err(error) => {
                tracing::debug!(?id, %error, "precheck failed");
                if let Some(command) = self.queue.remove(id) {
                    command.fail(error);
                }
                if self.restart_pending {
                    self.restart_pending = false;
                    self.send_next().await;
                }
            }
        }
    }

    /// Sends one wire chunk, arming the size-scaled response timer and
    /// routing through the splice when compression is active.
    async fn send_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.clear_idle();
        let waited = self.config.response_timeout(bytes.len());
        self.response_deadline = Some((Instant::now() + waited, waited));
        tracing::trace!(len = bytes.len(), compressed = self.compressed, "C: send");
        if self.compressed {
            match &mut self.splice {
                Some(splice) => {
                    splice.deflate(bytes);
                    Ok(())
                }
                None => Err(Error::Compression("splice not installed".to_string())),
            }
        } else {
            self.write_raw(&bytes).await
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    fn enter_idle(&mut self) {
        self.state = SenderState::Idle;
        self.idle_deadline = Some(Instant::now() + self.config.idle_delay);
        tracing::trace!("queue drained; idle timer armed");
    }

    fn clear_idle(&mut self) {
        self.idle_deadline = None;
    }

    /// Tears the connection down: cancels timers, rejects every
    /// outstanding command, removes the splice and closes the transport.
    /// Idempotent.
    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SenderState::Fatal;
        self.response_deadline = None;
        self.idle_deadline = None;
        self.restart_pending = false;

        if let Some(mut command) = self.current.take() {
            command.complete(Err(Error::ConnectionClosed));
        }
        for command in self.queue.drain() {
            command.fail(Error::ConnectionClosed);
        }

        self.compressed = false;
        self.splice = None;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        for waiter in self.logout_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        tracing::debug!("connection closed");
    }

    /// Fatal path: close first, then report.
    async fn fatal(&mut self, error: Error) {
        if self.closed {
            return;
        }
        tracing::error!(%error, "fatal connection error");
        self.teardown().await;
        self.observer.on_error(&error);
    }
}

fn completion_result(response: Response) -> Result<Response> {
    let status = if response.command.eq_ignore_ascii_case("NO") {
        Some(CommandStatus::No)
    } else if response.command.eq_ignore_ascii_case("BAD") {
        Some(CommandStatus::Bad)
    } else {
        None
    };
    match status {
        Some(status) => Err(Error::Command {
            status,
            message: response
                .human_readable
                .clone()
                .unwrap_or_else(|| "Error".to_string()),
            code: response.code.clone(),
        }),
        None => Ok(response),
    }
}

async fn recv_splice(splice: &mut Option<CompressionSplice>) -> Option<SpliceOutput> {
    match splice {
        Some(splice) => splice.output_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_chunk<T: Transport>(
    stream: &mut Option<T>,
    buf: &mut BytesMut,
) -> std::io::Result<usize> {
    match stream {
        Some(stream) => stream.read_buf(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_result_maps_ok() {
        let mut response = Response::new("W1", "OK");
        response.human_readable = Some("done".to_string());
        assert!(completion_result(response).is_ok());
    }

    #[test]
    fn test_completion_result_maps_no_and_bad() {
        let mut response = Response::new("W2", "NO");
        response.human_readable = Some("bad mailbox".to_string());
        response.code = Some("ALERT".to_string());
        let error = completion_result(response).unwrap_err();
        match error {
            Error::Command {
                status,
                message,
                code,
            } => {
                assert_eq!(status, CommandStatus::No);
                assert_eq!(message, "bad mailbox");
                assert_eq!(code.as_deref(), Some("ALERT"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let response = Response::new("W3", "bad");
        let error = completion_result(response).unwrap_err();
        match error {
            Error::Command {
                status, message, ..
            } => {
                assert_eq!(status, CommandStatus::Bad);
                // No text on the response falls back to a generic message.
                assert_eq!(message, "Error");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
