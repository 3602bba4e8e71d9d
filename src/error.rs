//! Client error taxonomy
//!
//! Broker rejections (non-success reason codes in acknowledgements) are not
//! errors; they travel inside the completed token's reason codes. Errors are
//! reserved for conditions that prevent an operation from reaching its
//! terminal acknowledgement.

use std::fmt;

use crate::persistence::PersistenceError;
use crate::protocol::{DecodeError, EncodeError, ProtocolError, ReasonCode};

/// Errors surfaced to callers through tokens or operation results
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Malformed wire bytes or a packet invalid in the current state.
    /// Fatal to the connection it occurred on.
    Protocol(ProtocolError),
    /// Transport connect/read/write failure
    Transport(String),
    /// Connect or operation deadline elapsed
    Timeout,
    /// Every configured server URI failed
    ServersUnavailable,
    /// The broker refused the connection in CONNACK
    ConnectionRefused(ReasonCode),
    /// All 65535 packet identifiers are in flight
    NoPacketIdsAvailable,
    /// Operation submitted while disconnected and buffering is disabled
    NotConnected,
    /// The offline buffer is at capacity
    BufferFull,
    /// The entry was evicted from the offline buffer by a newer submission
    BufferDiscarded,
    /// The client has been closed
    Closed,
    /// Invalid caller-supplied argument
    InvalidInput(&'static str),
    /// Durable store failure
    Persistence(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ServersUnavailable => write!(f, "no server URI could be reached"),
            Self::ConnectionRefused(rc) => write!(f, "connection refused: {}", rc),
            Self::NoPacketIdsAvailable => write!(f, "no packet identifiers available"),
            Self::NotConnected => write!(f, "client is not connected"),
            Self::BufferFull => write!(f, "offline buffer is full"),
            Self::BufferDiscarded => write!(f, "entry discarded from offline buffer"),
            Self::Closed => write!(f, "client is closed"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::Persistence(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Protocol(ProtocolError::Encode(e))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<PersistenceError> for ClientError {
    fn from(e: PersistenceError) -> Self {
        ClientError::Persistence(e.to_string())
    }
}
