//! Unary request/response envelopes built out of frames.
//!
//! A request is `[pathLen:u32be][path][headersLen:u32be][headers JSON]`
//! followed by exactly one DATA frame wrapping the message. A response is
//! `[headersLen:u32be][headers JSON]` followed by zero or more DATA frames
//! (one per message, in send order) and exactly one TRAILER frame.

use crate::frame::{Frame, decode_frames, parse_trailers};
use crate::{DecodeError, Metadata, StatusCode, status_name};

/// Reserved header carrying the caller-generated correlation token,
/// echoed from request to response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Reserved trailer key: integer status, required on every completed
/// response or stream end.
pub const GRPC_STATUS: &str = "grpc-status";

/// Reserved trailer key: optional human-readable error text.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Fallback error text when `grpc-message` is absent or empty.
const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Look up a header value by key, case-insensitively.
///
/// Header keys are case-sensitive on the wire but well-known keys are
/// matched by convention regardless of case. An exact match wins over a
/// case-insensitive one so lookups stay deterministic.
pub fn header_get<'a>(headers: &'a Metadata, key: &str) -> Option<&'a str> {
    if let Some(value) = headers.get(key) {
        return Some(value.as_str());
    }
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// A unary request: method path, headers, one serialized message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestEnvelope {
    /// Method path of the form `/<service>/<method>`, never empty.
    pub path: String,
    /// String-to-string header mapping, JSON-encoded on the wire.
    pub headers: Metadata,
    /// The already-serialized request message.
    pub message: Vec<u8>,
}

impl RequestEnvelope {
    /// Build a request for `path` carrying `message`.
    pub fn new(path: impl Into<String>, headers: Metadata, message: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            headers,
            message,
        }
    }

    /// Encode to wire bytes.
    ///
    /// Fails only if the header mapping cannot be serialized to JSON.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let headers = serde_json::to_vec(&self.headers)?;
        let frame = Frame::data(self.message.clone()).encode();

        let mut out = Vec::with_capacity(8 + self.path.len() + headers.len() + frame.len());
        out.extend_from_slice(&(self.path.len() as u32).to_be_bytes());
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&frame);
        Ok(out)
    }

    /// Decode from wire bytes.
    ///
    /// More than one DATA frame is tolerated and the first one's payload
    /// becomes the message; peers are expected to send exactly one, but
    /// decode does not enforce it so both ends of the channel agree on
    /// what a multi-frame request means.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 8 {
            return Err(DecodeError::TooShort {
                context: "request envelope",
                minimum: 8,
                available: bytes.len(),
            });
        }

        let path_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let path_end = 4 + path_len;
        if path_end + 4 > bytes.len() {
            return Err(DecodeError::LengthOverrun {
                context: "request path",
                declared: path_len,
                available: bytes.len().saturating_sub(8),
            });
        }
        let path = String::from_utf8(bytes[4..path_end].to_vec()).map_err(DecodeError::PathUtf8)?;

        let headers_len = u32::from_be_bytes([
            bytes[path_end],
            bytes[path_end + 1],
            bytes[path_end + 2],
            bytes[path_end + 3],
        ]) as usize;
        let headers_end = path_end + 4 + headers_len;
        if headers_end > bytes.len() {
            return Err(DecodeError::LengthOverrun {
                context: "request headers",
                declared: headers_len,
                available: bytes.len() - path_end - 4,
            });
        }
        let headers: Metadata = serde_json::from_slice(&bytes[path_end + 4..headers_end])
            .map_err(DecodeError::HeadersJson)?;

        let (frames, remaining) = decode_frames(&bytes[headers_end..]);
        if !remaining.is_empty() {
            return Err(DecodeError::TrailingBytes(remaining.len()));
        }
        if let Some(frame) = frames.iter().find(|f| !f.is_data() && !f.is_trailer()) {
            return Err(DecodeError::UnknownFrameFlag(frame.flag));
        }
        let message = frames
            .into_iter()
            .find(Frame::is_data)
            .ok_or(DecodeError::MissingDataFrame)?
            .data;

        Ok(Self {
            path,
            headers,
            message,
        })
    }
}

/// A unary response: headers, ordered messages, trailers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseEnvelope {
    /// String-to-string header mapping, JSON-encoded on the wire.
    pub headers: Metadata,
    /// Serialized response messages: zero, one, or many, in send order.
    pub messages: Vec<Vec<u8>>,
    /// Trailer mapping; a well-formed completed response always carries a
    /// `grpc-status` key parseable as an integer. Keys are lower-cased.
    pub trailers: Metadata,
}

impl ResponseEnvelope {
    /// A response carrying one message and OK trailers.
    pub fn ok(message: Vec<u8>) -> Self {
        let mut trailers = Metadata::new();
        trailers.insert(GRPC_STATUS.to_string(), "0".to_string());
        Self {
            headers: Metadata::new(),
            messages: vec![message],
            trailers,
        }
    }

    /// An error response: empty headers and messages, `grpc-status` and
    /// `grpc-message` trailers.
    pub fn error(code: StatusCode, message: &str) -> Self {
        let mut trailers = Metadata::new();
        trailers.insert(GRPC_STATUS.to_string(), code.code().to_string());
        trailers.insert(GRPC_MESSAGE.to_string(), message.to_string());
        Self {
            headers: Metadata::new(),
            messages: Vec::new(),
            trailers,
        }
    }

    /// Encode to wire bytes: headers, one DATA frame per message, one
    /// TRAILER frame.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let headers = serde_json::to_vec(&self.headers)?;

        let mut out = Vec::with_capacity(4 + headers.len());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&headers);
        for message in &self.messages {
            out.extend_from_slice(&Frame::data(message.clone()).encode());
        }
        out.extend_from_slice(&Frame::trailer(&self.trailers).encode());
        Ok(out)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 4 {
            return Err(DecodeError::TooShort {
                context: "response envelope",
                minimum: 4,
                available: bytes.len(),
            });
        }

        let headers_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let headers_end = 4 + headers_len;
        if headers_end > bytes.len() {
            return Err(DecodeError::LengthOverrun {
                context: "response headers",
                declared: headers_len,
                available: bytes.len() - 4,
            });
        }
        let headers: Metadata =
            serde_json::from_slice(&bytes[4..headers_end]).map_err(DecodeError::HeadersJson)?;

        let (frames, remaining) = decode_frames(&bytes[headers_end..]);
        if !remaining.is_empty() {
            return Err(DecodeError::TrailingBytes(remaining.len()));
        }

        let mut messages = Vec::new();
        let mut trailers = None;
        for frame in frames {
            if frame.is_data() {
                messages.push(frame.data);
            } else if frame.is_trailer() {
                if trailers.is_some() {
                    return Err(DecodeError::DuplicateTrailerFrame);
                }
                trailers = Some(parse_trailers(&frame.data));
            } else {
                return Err(DecodeError::UnknownFrameFlag(frame.flag));
            }
        }

        Ok(Self {
            headers,
            messages,
            trailers: trailers.ok_or(DecodeError::MissingTrailerFrame)?,
        })
    }

    /// Whether the trailers carry a non-OK status.
    ///
    /// True iff `grpc-status` parses as an integer and is not 0. A missing
    /// or non-numeric status counts as not-an-error; that masks malformed
    /// trailers as success, which is kept for compatibility with the other
    /// end of the wire.
    pub fn is_error(&self) -> bool {
        error_from_trailers(&self.trailers).is_some()
    }

    /// The error carried by the trailers, if any.
    pub fn grpc_error(&self) -> Option<GrpcError> {
        error_from_trailers(&self.trailers)
    }
}

/// Extract a [`GrpcError`] from a trailer mapping, if it carries one.
///
/// Returns `None` when `grpc-status` is missing, non-numeric, or 0. The
/// code falls back to UNKNOWN (2) if unparsable and the message falls back
/// to a fixed string when `grpc-message` is absent or empty.
pub fn error_from_trailers(trailers: &Metadata) -> Option<GrpcError> {
    let status: i32 = trailers.get(GRPC_STATUS)?.parse().ok()?;
    if status == 0 {
        return None;
    }
    let message = match trailers.get(GRPC_MESSAGE) {
        Some(m) if !m.is_empty() => m.clone(),
        _ => UNKNOWN_ERROR_MESSAGE.to_string(),
    };
    Some(GrpcError {
        code: status,
        message,
        trailers: trailers.clone(),
    })
}

/// A non-OK call outcome as seen by the caller.
///
/// Carries the full trailer mapping for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcError {
    /// Integer status from `grpc-status`.
    pub code: i32,
    /// Text from `grpc-message`, or a fixed fallback.
    pub message: String,
    /// The complete trailer mapping the error was parsed from.
    pub trailers: Metadata,
}

impl GrpcError {
    /// The status code, when it falls inside the known 0-16 range.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_code(self.code).unwrap_or(StatusCode::Unknown)
    }
}

impl std::fmt::Display for GrpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", status_name(self.code), self.code, self.message)
    }
}

impl std::error::Error for GrpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn request_round_trip() {
        let envelope = RequestEnvelope::new(
            "/svc/Echo",
            headers(&[("x-request-id", "req-1"), ("X-Custom", "Value")]),
            b"payload".to_vec(),
        );
        let decoded = RequestEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn request_decode_too_short() {
        assert!(matches!(
            RequestEnvelope::decode(&[0, 0, 0]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn request_decode_path_overrun() {
        let mut bytes = 1000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"shortpath");
        assert!(matches!(
            RequestEnvelope::decode(&bytes),
            Err(DecodeError::LengthOverrun { .. })
        ));
    }

    #[test]
    fn request_decode_bad_headers_json() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(b"/s/m");
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(b"not [a}");
        bytes.extend_from_slice(&Frame::data(b"m".to_vec()).encode());
        assert!(matches!(
            RequestEnvelope::decode(&bytes),
            Err(DecodeError::HeadersJson(_))
        ));
    }

    #[test]
    fn request_decode_partial_frame_is_malformed() {
        let envelope = RequestEnvelope::new("/s/m", Metadata::new(), b"payload".to_vec());
        let bytes = envelope.encode().unwrap();
        assert!(matches!(
            RequestEnvelope::decode(&bytes[..bytes.len() - 2]),
            Err(DecodeError::TrailingBytes(_))
        ));
    }

    #[test]
    fn request_decode_missing_data_frame() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(b"/s/m");
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"{}");
        assert!(matches!(
            RequestEnvelope::decode(&bytes),
            Err(DecodeError::MissingDataFrame)
        ));
    }

    #[test]
    fn request_decode_unknown_frame_flag() {
        let envelope = RequestEnvelope::new("/s/m", Metadata::new(), b"x".to_vec());
        let mut bytes = envelope.encode().unwrap();
        let mut bogus = Frame::data(b"y".to_vec());
        bogus.flag = 0x42;
        bytes.extend_from_slice(&bogus.encode());
        assert!(matches!(
            RequestEnvelope::decode(&bytes),
            Err(DecodeError::UnknownFrameFlag(0x42))
        ));
    }

    #[test]
    fn request_decode_takes_first_of_multiple_data_frames() {
        let envelope = RequestEnvelope::new("/s/m", Metadata::new(), b"first".to_vec());
        let mut bytes = envelope.encode().unwrap();
        bytes.extend_from_slice(&Frame::data(b"second".to_vec()).encode());
        let decoded = RequestEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message, b"first");
    }

    #[test]
    fn response_round_trip() {
        let envelope = ResponseEnvelope {
            headers: headers(&[("x-request-id", "req-9")]),
            messages: vec![b"one".to_vec(), b"two".to_vec()],
            trailers: headers(&[("grpc-status", "0")]),
        };
        let decoded = ResponseEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn response_with_no_messages_round_trips() {
        let envelope = ResponseEnvelope::error(StatusCode::NotFound, "x");
        let decoded = ResponseEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.messages.is_empty());
    }

    #[test]
    fn response_decode_requires_trailer_frame() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"{}");
        bytes.extend_from_slice(&Frame::data(b"m".to_vec()).encode());
        assert!(matches!(
            ResponseEnvelope::decode(&bytes),
            Err(DecodeError::MissingTrailerFrame)
        ));
    }

    #[test]
    fn response_decode_rejects_duplicate_trailer_frames() {
        let envelope = ResponseEnvelope::ok(b"m".to_vec());
        let mut bytes = envelope.encode().unwrap();
        bytes.extend_from_slice(&Frame::trailer(&Metadata::new()).encode());
        assert!(matches!(
            ResponseEnvelope::decode(&bytes),
            Err(DecodeError::DuplicateTrailerFrame)
        ));
    }

    #[test]
    fn error_response_round_trip() {
        let envelope = ResponseEnvelope::error(StatusCode::NotFound, "x");
        let decoded = ResponseEnvelope::decode(&envelope.encode().unwrap()).unwrap();

        assert!(decoded.is_error());
        let err = decoded.grpc_error().unwrap();
        assert_eq!(err.code, 5);
        assert_eq!(err.message, "x");
        assert_eq!(err.status(), StatusCode::NotFound);
        assert_eq!(status_name(err.code), "NOT_FOUND");
    }

    #[test]
    fn ok_response_is_not_an_error() {
        let envelope = ResponseEnvelope::ok(b"m".to_vec());
        assert!(!envelope.is_error());
        assert!(envelope.grpc_error().is_none());
    }

    #[test]
    fn missing_or_garbled_status_is_not_an_error() {
        let mut envelope = ResponseEnvelope::ok(Vec::new());
        envelope.trailers.remove(GRPC_STATUS);
        assert!(!envelope.is_error());

        envelope
            .trailers
            .insert(GRPC_STATUS.to_string(), "not-a-number".to_string());
        assert!(!envelope.is_error());
    }

    #[test]
    fn error_message_falls_back_when_absent() {
        let mut trailers = Metadata::new();
        trailers.insert(GRPC_STATUS.to_string(), "13".to_string());
        let err = error_from_trailers(&trailers).unwrap();
        assert_eq!(err.message, "Unknown error");
        assert_eq!(err.code, 13);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = headers(&[("X-Request-Id", "abc")]);
        assert_eq!(header_get(&h, "x-request-id"), Some("abc"));
        assert_eq!(header_get(&h, "X-Request-Id"), Some("abc"));
        assert_eq!(header_get(&h, "missing"), None);
    }
}
