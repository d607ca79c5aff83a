/// Error decoding a frame, envelope, or stream message.
#[derive(Debug)]
pub enum DecodeError {
    /// Fewer bytes than the fixed minimum for this structure.
    TooShort {
        /// Which structure was being decoded.
        context: &'static str,
        /// Minimum byte count the structure requires.
        minimum: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// A declared length field extends past the end of the buffer.
    LengthOverrun {
        /// Which field declared the length.
        context: &'static str,
        /// Declared length in bytes.
        declared: usize,
        /// Bytes actually available for it.
        available: usize,
    },
    /// Headers were not a JSON object of strings.
    HeadersJson(serde_json::Error),
    /// Path bytes were not valid UTF-8.
    PathUtf8(std::string::FromUtf8Error),
    /// Stream message request id bytes were not valid UTF-8.
    RequestIdUtf8(std::string::FromUtf8Error),
    /// A frame carried a flag byte that is neither DATA nor TRAILER.
    UnknownFrameFlag(u8),
    /// A stream message carried a flag byte that is neither DATA(0) nor END(1).
    UnknownStreamFlag(u8),
    /// Undecodable bytes left over after the last complete frame.
    ///
    /// A partial frame inside a unary envelope is malformed, not a
    /// streaming case: envelopes arrive as whole channel messages.
    TrailingBytes(usize),
    /// No DATA frame where at least one was required.
    MissingDataFrame,
    /// No TRAILER frame at the end of a response.
    MissingTrailerFrame,
    /// More than one TRAILER frame in a response.
    DuplicateTrailerFrame,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooShort {
                context,
                minimum,
                available,
            } => {
                write!(f, "{context}: need at least {minimum} bytes, have {available}")
            }
            DecodeError::LengthOverrun {
                context,
                declared,
                available,
            } => {
                write!(f, "{context}: declared length {declared} overruns buffer ({available} available)")
            }
            DecodeError::HeadersJson(e) => write!(f, "headers are not a JSON string map: {e}"),
            DecodeError::PathUtf8(e) => write!(f, "path is not valid UTF-8: {e}"),
            DecodeError::RequestIdUtf8(e) => write!(f, "request id is not valid UTF-8: {e}"),
            DecodeError::UnknownFrameFlag(flag) => write!(f, "unknown frame flag: {flag:#04x}"),
            DecodeError::UnknownStreamFlag(flag) => {
                write!(f, "unknown stream message flag: {flag:#04x}")
            }
            DecodeError::TrailingBytes(n) => write!(f, "{n} undecodable trailing bytes"),
            DecodeError::MissingDataFrame => write!(f, "no DATA frame in request"),
            DecodeError::MissingTrailerFrame => write!(f, "no TRAILER frame in response"),
            DecodeError::DuplicateTrailerFrame => write!(f, "more than one TRAILER frame"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::HeadersJson(e) => Some(e),
            DecodeError::PathUtf8(e) | DecodeError::RequestIdUtf8(e) => Some(e),
            _ => None,
        }
    }
}
