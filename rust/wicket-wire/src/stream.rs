//! The streaming-message envelope used by server-streaming calls.
//!
//! Layered directly over frames, independently of the unary envelopes:
//! each channel message is `[idLen:u32be][id][flag:u8][payload]`. A DATA
//! message's payload is one encoded DATA frame; an END message's payload
//! is one encoded TRAILER frame.

use crate::DecodeError;

/// Stream message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamFlag {
    /// Carries one encoded DATA frame.
    Data = 0,
    /// Terminates the stream; carries one encoded TRAILER frame.
    End = 1,
}

/// One message of a server-streaming call, correlated by request id.
///
/// Delivery order is production order: the channel is single and ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Correlation token tying this message to its originating call.
    pub request_id: String,
    pub flag: StreamFlag,
    /// Payload bytes: an encoded frame.
    pub data: Vec<u8>,
}

impl StreamMessage {
    /// A DATA message carrying an encoded frame.
    pub fn data(request_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            request_id: request_id.into(),
            flag: StreamFlag::Data,
            data,
        }
    }

    /// An END message carrying an encoded trailer frame.
    pub fn end(request_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            request_id: request_id.into(),
            flag: StreamFlag::End,
            data,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.request_id.len() + self.data.len());
        out.extend_from_slice(&(self.request_id.len() as u32).to_be_bytes());
        out.extend_from_slice(self.request_id.as_bytes());
        out.push(self.flag as u8);
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 5 {
            return Err(DecodeError::TooShort {
                context: "stream message",
                minimum: 5,
                available: bytes.len(),
            });
        }

        let id_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let id_end = 4 + id_len;
        if id_end >= bytes.len() {
            return Err(DecodeError::LengthOverrun {
                context: "stream request id",
                declared: id_len,
                available: bytes.len() - 5,
            });
        }
        let request_id =
            String::from_utf8(bytes[4..id_end].to_vec()).map_err(DecodeError::RequestIdUtf8)?;

        let flag = match bytes[id_end] {
            0 => StreamFlag::Data,
            1 => StreamFlag::End,
            other => return Err(DecodeError::UnknownStreamFlag(other)),
        };

        Ok(Self {
            request_id,
            flag,
            data: bytes[id_end + 1..].to_vec(),
        })
    }
}

/// Heuristically classify inbound bytes as a stream message.
///
/// The wire format has no explicit discriminant between a stream message
/// and a unary response envelope travelling on the same channel, so the
/// client guesses: true iff the first 4 bytes, read as a request id
/// length, fall in (0, 255], enough bytes remain for that id plus one flag
/// byte, and the flag byte is DATA(0) or END(1).
///
/// This is inherently ambiguous: a unary response whose headers-length
/// prefix happens to look like a short id length can be misclassified.
/// Changing it would break wire compatibility with existing peers, so the
/// ambiguity stays.
pub fn is_stream_message(bytes: &[u8]) -> bool {
    if bytes.len() < 5 {
        return false;
    }
    let id_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if id_len == 0 || id_len > 255 {
        return false;
    }
    let Some(&flag) = bytes.get(4 + id_len) else {
        return false;
    };
    flag == StreamFlag::Data as u8 || flag == StreamFlag::End as u8
}
