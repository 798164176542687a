//! Error types for MPD client operations

use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// The duty a physical connection serves for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Synchronous request/response commands
    Command,
    /// Standing `idle` watch on every subsystem
    IdleWatch,
    /// `idle message` watch interleaved with subscription commands
    SubscriptionMux,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command connection",
            Self::IdleWatch => "idle watcher",
            Self::SubscriptionMux => "subscription multiplexer",
        };
        f.write_str(name)
    }
}

/// A protocol error reported by the daemon on an `ACK` line
///
/// `ACK [<code>@<command_index>] {<command>} <message>`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("MPD error {code} at command {command_index} ({command}): {message}")]
pub struct AckError {
    pub code: u32,
    pub command_index: u32,
    pub command: String,
    pub message: String,
}

/// Errors that can occur when talking to an MPD server
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to open the TCP connection
    #[error("Failed to connect to MPD at {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a command
    #[error("Failed to send command to MPD: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Failed to read a response line
    #[error("Failed to receive response from MPD: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The server closed the connection
    #[error("Connection to MPD closed unexpectedly")]
    ConnectionClosed,

    /// The first line after connecting was not an `OK MPD` banner
    #[error("Unexpected greeting from server: {line:?}")]
    BadGreeting { line: String },

    /// The banner carried no `major.minor.patch` version
    #[error("Unknown MPD protocol version in greeting: {line:?}")]
    UnknownVersion { line: String },

    /// `password` was answered with something other than a bare `OK`
    #[error("Authentication failed: {line}")]
    AuthenticationFailed { line: String },

    /// The server answered with an `ACK` line
    #[error(transparent)]
    Ack(#[from] AckError),

    /// A response line did not match the expected grammar
    #[error("Invalid input: {line:?}")]
    Parse { line: String },

    /// A background loop died; it is not restarted
    #[error("MPD {role} terminated: {reason}")]
    LoopTerminated {
        role: ConnectionRole,
        reason: String,
    },

    /// The client has been closed
    #[error("MPD client is closed")]
    Closed,

    /// A background task did not stop in time during close
    #[error("Timed out waiting for the {role} to shut down")]
    ShutdownTimeout { role: ConnectionRole },
}

impl ClientError {
    /// Whether the socket failed: a write or read error, or end of stream.
    ///
    /// Protocol and parse errors leave the socket usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::SendFailed(_) | Self::ReceiveFailed(_) | Self::ConnectionClosed
        )
    }

    /// Whether the connection that produced this error is out of step with
    /// the daemon. A malformed line while framing a response leaves the
    /// rest of that response unread, so it counts along with transport
    /// failures.
    pub(crate) fn desyncs_connection(&self) -> bool {
        self.is_transport() || matches!(self, Self::Parse { .. })
    }

    /// The daemon's error if this is an `ACK`
    pub fn as_ack(&self) -> Option<&AckError> {
        match self {
            Self::Ack(ack) => Some(ack),
            _ => None,
        }
    }
}

/// First fatal error of a background loop, shared with everyone who waits on it
#[derive(Debug, Clone)]
pub(crate) struct LoopFailure {
    role: ConnectionRole,
    reason: Arc<OnceLock<String>>,
}

impl LoopFailure {
    pub(crate) fn new(role: ConnectionRole) -> Self {
        Self {
            role,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Record why the loop died; only the first call sticks
    pub(crate) fn record(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
    }

    /// `LoopTerminated` if the loop has died
    pub(crate) fn error(&self) -> Option<ClientError> {
        self.reason.get().map(|reason| ClientError::LoopTerminated {
            role: self.role,
            reason: reason.clone(),
        })
    }

    /// The error to hand a caller whose request was not answered
    pub(crate) fn error_or_closed(&self) -> ClientError {
        self.error().unwrap_or(ClientError::Closed)
    }
}
