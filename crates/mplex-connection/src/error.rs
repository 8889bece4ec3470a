//! Error types for multiplexed connections and streams

use mplex_proto::{FrameError, StreamId};
use thiserror::Error;

/// Violations of the framing protocol by the remote peer.
///
/// Every variant is fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("NEW frame for live stream {0}")]
    DuplicateStream(StreamId),

    #[error("Stream id {0} reused by remote")]
    StreamIdReused(StreamId),

    #[error("Initiator flag does not match id parity for stream {0}")]
    InitiatorMismatch(StreamId),

    #[error("NEW frame without initiator flag for stream {0}")]
    UnexpectedNew(StreamId),
}

impl From<FrameError> for ProtocolError {
    fn from(err: FrameError) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Connection-level errors
///
/// Also used as the terminal cause of a connection, which is why it is
/// `Clone`: the same cause is fanned out to every live stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Connection aborted: {0}")]
    Aborted(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No available stream IDs")]
    StreamIdsExhausted,
}

impl ConnectionError {
    /// Whether this cause came from the underlying transport going away
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transport(_) | ConnectionError::TransportClosed
        )
    }
}

/// Stream-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream reset by remote peer")]
    RemoteReset,

    #[error("Stream reset: {0}")]
    LocalReset(String),

    #[error("Stream write side closed")]
    WriteClosed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl StreamError {
    /// Whether the stream ended because of a reset (remote, local or cascade)
    pub fn is_reset(&self) -> bool {
        !matches!(self, StreamError::WriteClosed)
    }
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
