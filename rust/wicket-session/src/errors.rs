//! Error types for the session layer.
//!
//! `CallError` covers everything a caller can see from `Client::call` or a
//! server stream; `ServerError` covers the narrow failure surface of the
//! server handle itself.

use std::fmt;
use std::io;
use std::time::Duration;

use wicket_wire::GrpcError;

/// Boxed error used at the typed-handler boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a transport stopped accepting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,

    /// The underlying data channel reported closure.
    Channel,
}

/// Errors surfaced to callers of the client API.
#[derive(Debug)]
pub enum CallError {
    /// The server answered with a non-zero `grpc-status`.
    Rpc(GrpcError),

    /// No response arrived within the call deadline.
    Timeout(Duration),

    /// The transport closed before the call completed.
    Closed(CloseReason),

    /// The underlying channel failed while sending.
    Io(io::Error),

    /// Failed to serialize the outgoing request envelope.
    Encode(serde_json::Error),

    /// The request headers carried no `x-request-id`.
    MissingRequestId,

    /// A unary response carried a number of messages other than one.
    MessageCount(usize),

    /// A typed codec failed to encode or decode a message body.
    Codec(BoxError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Rpc(e) => write!(f, "{e}"),
            CallError::Timeout(d) => {
                write!(f, "Request timeout after {}ms", d.as_millis())
            }
            CallError::Closed(CloseReason::Local) => write!(f, "Transport closed"),
            CallError::Closed(CloseReason::Channel) => write!(f, "DataChannel closed"),
            CallError::Io(e) => write!(f, "channel i/o error: {e}"),
            CallError::Encode(e) => write!(f, "request encode error: {e}"),
            CallError::MissingRequestId => {
                write!(f, "request headers are missing x-request-id")
            }
            CallError::MessageCount(n) => {
                write!(f, "unary response carried {n} messages, expected exactly 1")
            }
            CallError::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Rpc(e) => Some(e),
            CallError::Io(e) => Some(e),
            CallError::Encode(e) => Some(e),
            CallError::Codec(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Errors surfaced by the server handle.
#[derive(Debug)]
pub enum ServerError {
    /// The transport has already been closed.
    Closed,

    /// Failed to serialize an outgoing response envelope.
    Encode(serde_json::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Closed => write!(f, "Transport closed"),
            ServerError::Encode(e) => write!(f, "response encode error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Encode(e) => Some(e),
            ServerError::Closed => None,
        }
    }
}
