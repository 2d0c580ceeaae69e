//! Connection event observer and untagged response handlers.
//!
//! The connection reports its lifecycle through a [`ConnectionObserver`]:
//! one method per event, all defaulted to no-ops. Untagged server
//! responses that no in-flight command claims are dispatched to handlers
//! registered per response name via
//! [`ImapConnection::set_handler`](crate::ImapConnection::set_handler).

use std::sync::{Arc, Mutex};

use crate::codec::Response;
use crate::error::Error;

/// Handler for untagged responses the current command did not claim.
///
/// Keyed by uppercased response name (`EXISTS`, `CAPABILITY`, ...); the
/// handler sees the processed response.
pub type UntaggedHandler = Box<dyn FnMut(&Response) + Send>;

/// Observer for connection lifecycle events.
///
/// Runs on the connection's driver task; implementations should hand off
/// rather than block.
pub trait ConnectionObserver: Send + 'static {
    /// Called once, when the first server response has been parsed.
    fn on_ready(&mut self) {}

    /// Called when the command queue has been empty for the idle delay.
    fn on_idle(&mut self) {}

    /// Called after a fatal error; the connection has already been closed.
    fn on_error(&mut self, error: &Error) {
        let _ = error;
    }
}

/// An observer that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// An observer that logs events using tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_ready(&mut self) {
        tracing::debug!("connection ready");
    }

    fn on_idle(&mut self) {
        tracing::trace!("connection idle");
    }

    fn on_error(&mut self, error: &Error) {
        tracing::error!(%error, "connection failed");
    }
}

/// A connection lifecycle event recorded by [`CollectingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The first server response was parsed.
    Ready,
    /// The queue drained and stayed empty for the idle delay.
    Idle,
    /// A fatal error closed the connection.
    Error(String),
}

/// An observer that records events for later inspection.
///
/// The event log is shared, so a clone kept outside the connection reads
/// what the driver recorded. Mostly useful in tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingObserver {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl CollectingObserver {
    /// Creates an empty collecting observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded events.
    ///
    /// # Panics
    ///
    /// Panics if the event log mutex was poisoned.
    #[must_use]
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    fn push(&self, event: ConnectionEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

impl ConnectionObserver for CollectingObserver {
    fn on_ready(&mut self) {
        self.push(ConnectionEvent::Ready);
    }

    fn on_idle(&mut self) {
        self.push(ConnectionEvent::Idle);
    }

    fn on_error(&mut self, error: &Error) {
        self.push(ConnectionEvent::Error(error.to_string()));
    }
}
