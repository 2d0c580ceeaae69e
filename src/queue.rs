//! Command queue.
//!
//! Commands wait here until the sender dispatches them. Each record owns
//! its tag, its compiled wire chunks (consumed one continuation prompt at
//! a time), the untagged responses it collects, and the one-shot channel
//! its completion resolves. Insertion is normally at the tail; a command
//! carrying a `ctx` anchor that is still queued is inserted immediately
//! before that anchor instead, and both tags gain a `.p` suffix.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;

use crate::codec::{Request, Response};
use crate::connection::{CommandOptions, PrecheckHandle};
use crate::error::{Error, Result};

/// Opaque identity of a queued command.
///
/// Used as the insertion anchor for priority enqueueing; prechecks receive
/// the id of the command they guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(u64);

/// Deferred check run when its command reaches the queue head.
///
/// A precheck may enqueue preparatory commands ahead of its own command by
/// passing the handle's id as the `ctx` anchor.
pub type Precheck = Box<
    dyn FnOnce(PrecheckHandle) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send,
>;

/// Sender states.
///
/// `Idle`, `Ready` and `Precheck` all permit dispatch; `InFlight` and
/// `Fatal` do not. The greeting gate is tracked separately on the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenderState {
    /// Queue empty; the idle timer may be armed.
    Idle,
    /// A response cleared the wire; the next command may go out.
    Ready,
    /// The head command's precheck is running.
    Precheck,
    /// A command is on the wire awaiting its tagged completion.
    InFlight,
    /// The connection is closed or errored.
    Fatal,
}

impl SenderState {
    pub(crate) fn can_send(self) -> bool {
        matches!(self, Self::Idle | Self::Ready | Self::Precheck)
    }
}

/// One queued (or in-flight) command.
pub(crate) struct QueuedCommand {
    pub(crate) id: CommandId,
    pub(crate) tag: String,
    pub(crate) request: Request,
    /// Compiled wire chunks, consumed front-to-back as the server emits
    /// continuation prompts. Filled at dispatch.
    pub(crate) data: VecDeque<Vec<u8>>,
    pub(crate) accept_untagged: BTreeSet<String>,
    pub(crate) payload: BTreeMap<String, Vec<Response>>,
    responder: Option<oneshot::Sender<Result<Response>>>,
    pub(crate) precheck: Option<Precheck>,
    pub(crate) error_response_expects_empty_line: bool,
}

impl QueuedCommand {
    /// Resolves the command's completion. Each command resolves at most
    /// once; later calls are no-ops.
    pub(crate) fn complete(&mut self, result: Result<Response>) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(result);
        }
    }

    pub(crate) fn fail(mut self, error: Error) {
        self.complete(Err(error));
    }
}

impl std::fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("command", &self.request.command)
            .field("pending_chunks", &self.data.len())
            .field("has_precheck", &self.precheck.is_some())
            .finish_non_exhaustive()
    }
}

/// FIFO command queue with tag assignment and priority insertion.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    queue: VecDeque<QueuedCommand>,
    tag_counter: u64,
    id_counter: u64,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues a command, assigning its tag and payload buckets.
    ///
    /// Returns the new command's id.
    pub(crate) fn enqueue(
        &mut self,
        mut request: Request,
        accept_untagged: Vec<String>,
        options: CommandOptions,
        responder: oneshot::Sender<Result<Response>>,
    ) -> CommandId {
        self.tag_counter += 1;
        self.id_counter += 1;
        let id = CommandId(self.id_counter);
        let tag = format!("W{}", self.tag_counter);
        request.tag.clone_from(&tag);

        let accept: BTreeSet<String> = accept_untagged
            .into_iter()
            .map(|name| name.to_ascii_uppercase())
            .collect();
        let payload = accept
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        let mut command = QueuedCommand {
            id,
            tag,
            request,
            data: VecDeque::new(),
            accept_untagged: accept,
            payload,
            responder: Some(responder),
            precheck: options.precheck,
            error_response_expects_empty_line: options.error_response_expects_empty_line,
        };

        let anchor_index = options
            .ctx
            .and_then(|ctx| self.queue.iter().position(|queued| queued.id == ctx));
        if let Some(index) = anchor_index {
            command.tag.push_str(".p");
            command.request.tag.clone_from(&command.tag);
            let anchor = &mut self.queue[index];
            anchor.tag.push_str(".p");
            anchor.request.tag.clone_from(&anchor.tag);
            self.queue.insert(index, command);
        } else {
            // An anchor that has already been dispatched (or never
            // existed) falls back to a plain tail append.
            self.queue.push_back(command);
        }

        id
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueuedCommand> {
        self.queue.pop_front()
    }

    /// Detaches the head command's precheck, if it has one.
    pub(crate) fn detach_front_precheck(&mut self) -> Option<(CommandId, Precheck)> {
        let head = self.queue.front_mut()?;
        let precheck = head.precheck.take()?;
        Some((head.id, precheck))
    }

    /// Removes a still-queued command by id.
    pub(crate) fn remove(&mut self, id: CommandId) -> Option<QueuedCommand> {
        let index = self.queue.iter().position(|queued| queued.id == id)?;
        self.queue.remove(index)
    }

    /// Drains the whole queue, e.g. at teardown.
    pub(crate) fn drain(&mut self) -> Vec<QueuedCommand> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn enqueue_simple(queue: &mut CommandQueue, command: &str) -> CommandId {
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new(command),
            Vec::new(),
            CommandOptions::default(),
            tx,
        )
    }

    #[test]
    fn test_tags_are_monotonic_and_unique() {
        let mut queue = CommandQueue::new();
        enqueue_simple(&mut queue, "A");
        enqueue_simple(&mut queue, "B");
        enqueue_simple(&mut queue, "C");

        let tags: Vec<String> = queue.drain().into_iter().map(|cmd| cmd.tag).collect();
        assert_eq!(tags, vec!["W1", "W2", "W3"]);
    }

    #[test]
    fn test_tag_is_written_into_request() {
        let mut queue = CommandQueue::new();
        enqueue_simple(&mut queue, "NOOP");
        let command = queue.pop_front().unwrap();
        assert_eq!(command.request.tag, "W1");
    }

    #[test]
    fn test_payload_buckets_are_precreated_uppercase() {
        let mut queue = CommandQueue::new();
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("CAPABILITY"),
            vec!["capability".to_string()],
            CommandOptions::default(),
            tx,
        );
        let command = queue.pop_front().unwrap();
        assert!(command.accept_untagged.contains("CAPABILITY"));
        assert_eq!(command.payload.get("CAPABILITY"), Some(&Vec::new()));
    }

    #[test]
    fn test_priority_insertion_suffixes_both_tags() {
        let mut queue = CommandQueue::new();
        let anchor = enqueue_simple(&mut queue, "MAIN");

        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("PREP"),
            Vec::new(),
            CommandOptions {
                ctx: Some(anchor),
                ..CommandOptions::default()
            },
            tx,
        );

        let first = queue.pop_front().unwrap();
        let second = queue.pop_front().unwrap();
        assert_eq!(first.tag, "W2.p");
        assert_eq!(first.request.command, "PREP");
        assert_eq!(first.request.tag, "W2.p");
        assert_eq!(second.tag, "W1.p");
        assert_eq!(second.request.tag, "W1.p");
    }

    #[test]
    fn test_priority_insertion_with_dispatched_anchor_appends() {
        let mut queue = CommandQueue::new();
        let anchor = enqueue_simple(&mut queue, "MAIN");
        let dispatched = queue.pop_front().unwrap();
        assert_eq!(dispatched.id, anchor);

        enqueue_simple(&mut queue, "OTHER");
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("LATE"),
            Vec::new(),
            CommandOptions {
                ctx: Some(anchor),
                ..CommandOptions::default()
            },
            tx,
        );

        let tags: Vec<String> = queue.drain().into_iter().map(|cmd| cmd.tag).collect();
        assert_eq!(tags, vec!["W2", "W3"]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = CommandQueue::new();
        enqueue_simple(&mut queue, "A");
        let id = enqueue_simple(&mut queue, "B");
        enqueue_simple(&mut queue, "C");

        let removed = queue.remove(id).unwrap();
        assert_eq!(removed.request.command, "B");
        assert!(queue.remove(id).is_none());

        let tags: Vec<String> = queue.drain().into_iter().map(|cmd| cmd.tag).collect();
        assert_eq!(tags, vec!["W1", "W3"]);
    }

    #[test]
    fn test_detach_front_precheck() {
        let mut queue = CommandQueue::new();
        let (tx, _rx) = oneshot::channel();
        let precheck: Precheck = Box::new(|_handle| Box::pin(async { Ok(()) }));
        let id = queue.enqueue(
            Request::new("MAIN"),
            Vec::new(),
            CommandOptions {
                precheck: Some(precheck),
                ..CommandOptions::default()
            },
            tx,
        );

        let (detached_id, _precheck) = queue.detach_front_precheck().unwrap();
        assert_eq!(detached_id, id);
        // Detaching is one-shot; the command stays queued.
        assert!(queue.detach_front_precheck().is_none());
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_completion_resolves_once() {
        let mut queue = CommandQueue::new();
        let (tx, mut rx) = oneshot::channel();
        queue.enqueue(Request::new("NOOP"), Vec::new(), CommandOptions::default(), tx);

        let mut command = queue.pop_front().unwrap();
        command.complete(Ok(Response::new("W1", "OK")));
        command.complete(Err(Error::ConnectionClosed));

        let result = rx.try_recv().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_sender_state_can_send() {
        assert!(SenderState::Idle.can_send());
        assert!(SenderState::Ready.can_send());
        assert!(SenderState::Precheck.can_send());
        assert!(!SenderState::InFlight.can_send());
        assert!(!SenderState::Fatal.can_send());
    }
}
