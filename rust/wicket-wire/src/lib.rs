#![deny(unsafe_code)]

//! Wire-level codec for wicket RPC.
//!
//! Everything in this crate is pure byte manipulation: no I/O, no async.
//! Both peers of a data channel must produce identical bytes for identical
//! values, since the two ends are commonly built with different language
//! toolchains.
//!
//! Layering, bottom up:
//!
//! - [`frame`] - the minimal binary unit: a flag byte plus a
//!   length-prefixed payload, carrying either message data or trailers.
//! - [`envelope`] - the unary request/response structures built out of
//!   frames, with JSON-encoded headers.
//! - [`stream`] - the per-message envelope used by server-streaming calls,
//!   layered over frames independently of the unary envelopes.
//! - [`status`] - the fixed 0-16 status code enumeration and the typed
//!   [`Status`] error carried by server handlers.
//!
//! All lengths on the wire are big-endian `u32`; all text is UTF-8.

mod error;
mod frame;
mod status;

pub mod envelope;
pub mod stream;

pub use envelope::{
    GRPC_MESSAGE, GRPC_STATUS, GrpcError, REQUEST_ID_HEADER, RequestEnvelope, ResponseEnvelope,
    error_from_trailers, header_get,
};
pub use error::DecodeError;
pub use frame::{
    FLAG_DATA, FLAG_TRAILER, Frame, decode_frames, encode_trailers, parse_trailers,
};
pub use status::{Status, StatusCode, status_name};
pub use stream::{StreamFlag, StreamMessage, is_stream_message};

/// Headers and trailers are both plain string-to-string mappings.
///
/// Header keys are preserved as written on the wire (case-sensitive), but
/// well-known keys like `x-request-id` are looked up case-insensitively.
/// Trailer keys are always lower-cased by the parser.
pub type Metadata = std::collections::HashMap<String, String>;
