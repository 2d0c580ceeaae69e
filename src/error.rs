//! Error types for the transport core.
//!
//! Errors split into two families: *fatal* errors that take the whole
//! connection down (transport failures, framing/parse failures, timeouts,
//! compression failures) and *local* errors that only fail an individual
//! command (`NO`/`BAD` completions, precheck failures).

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur on an IMAP connection.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// TLS trust configuration could not be built.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Response framing or grammar error.
    ///
    /// Once the inbound stream can no longer be interpreted the connection
    /// is torn down; there is no way to resynchronize.
    #[error("Protocol error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// Protocol violation or unexpected data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response arrived within the size-scaled socket timeout.
    #[error("Socket timed out after {0:?}")]
    Timeout(Duration),

    /// The server completed a command with `NO` or `BAD`.
    #[error("Server returned {status}: {message}")]
    Command {
        /// Whether the completion was `NO` or `BAD`.
        status: CommandStatus,
        /// Human-readable text from the completion response.
        message: String,
        /// Machine-readable response code (`[CODE ...]`), if present.
        code: Option<String>,
    },

    /// Invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection was closed while the operation was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection was lost unexpectedly.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The compression splice failed.
    #[error("Compression error: {0}")]
    Compression(String),
}

impl Error {
    /// Returns true if this error takes the whole connection down.
    ///
    /// Command-level failures (`NO`/`BAD`) are local to the command that
    /// triggered them; everything else is fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Command { .. })
    }

    /// Returns true if this error indicates the connection is dead.
    #[must_use]
    pub const fn is_connection_dead(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::Timeout(_)
                | Self::ConnectionClosed
                | Self::ConnectionLost(_)
        )
    }
}

/// Failure status of a tagged command completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The server returned `NO` (operational failure).
    No,
    /// The server returned `BAD` (protocol-level rejection).
    Bad,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::No => write!(f, "NO"),
            Self::Bad => write!(f, "BAD"),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failure_is_local() {
        let err = Error::Command {
            status: CommandStatus::No,
            message: "bad mailbox".to_string(),
            code: Some("ALERT".to_string()),
        };
        assert!(!err.is_fatal());
        assert!(!err.is_connection_dead());
        assert_eq!(err.to_string(), "Server returned NO: bad mailbox");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Timeout(Duration::from_secs(10)).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(
            Error::Parse {
                position: 3,
                message: "boom".to_string()
            }
            .is_fatal()
        );
        assert!(Error::Compression("worker died".to_string()).is_fatal());
    }

    #[test]
    fn test_connection_dead() {
        assert!(Error::ConnectionLost("EOF".to_string()).is_connection_dead());
        assert!(!Error::Protocol("odd".to_string()).is_connection_dead());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(CommandStatus::No.to_string(), "NO");
        assert_eq!(CommandStatus::Bad.to_string(), "BAD");
    }
}
