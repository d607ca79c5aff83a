//! The lowest wire layer: flag byte + u32be length + payload.

use crate::Metadata;

/// Frame flag for message data.
pub const FLAG_DATA: u8 = 0x00;

/// Frame flag for trailers (the grpc-web convention: high bit set).
pub const FLAG_TRAILER: u8 = 0x80;

/// Flag byte plus 4-byte big-endian length, preceding every payload.
pub(crate) const FRAME_HEADER_LEN: usize = 5;

/// A single wire frame.
///
/// The flag byte is carried through verbatim by [`decode_frames`]; only the
/// envelope layer decides whether an unexpected flag is an error, so the
/// frame scanner itself never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw flag byte ([`FLAG_DATA`] or [`FLAG_TRAILER`] for well-formed input).
    pub flag: u8,
    /// Frame payload. Always an owned copy, never a view into the input.
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a DATA frame wrapping message bytes.
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            flag: FLAG_DATA,
            data: bytes.into(),
        }
    }

    /// Create a TRAILER frame encoding a trailer mapping.
    pub fn trailer(trailers: &Metadata) -> Self {
        Self {
            flag: FLAG_TRAILER,
            data: encode_trailers(trailers),
        }
    }

    /// Whether this frame carries message data.
    pub fn is_data(&self) -> bool {
        self.flag == FLAG_DATA
    }

    /// Whether this frame carries trailers.
    pub fn is_trailer(&self) -> bool {
        self.flag == FLAG_TRAILER
    }

    /// Encode as flag byte, big-endian length, payload.
    ///
    /// The codec itself imposes no length ceiling; the practical limit is
    /// the channel's message-size ceiling.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.data.len());
        out.push(self.flag);
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Incrementally decode frames from a growing buffer.
///
/// Scans from offset 0 and returns every complete frame plus the remaining
/// tail: bytes that do not yet form a complete frame (fewer than 5 header
/// bytes, or a declared payload extending past the buffer end). Pure - feed
/// the returned remainder back in, prepended to newly arrived bytes, to
/// reassemble frames split across channel messages.
pub fn decode_frames(buffer: &[u8]) -> (Vec<Frame>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buffer.len() - offset >= FRAME_HEADER_LEN {
        let flag = buffer[offset];
        let len = u32::from_be_bytes([
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
            buffer[offset + 4],
        ]) as usize;
        let end = offset + FRAME_HEADER_LEN + len;
        if end > buffer.len() {
            break;
        }
        frames.push(Frame {
            flag,
            data: buffer[offset + FRAME_HEADER_LEN..end].to_vec(),
        });
        offset = end;
    }

    (frames, buffer[offset..].to_vec())
}

/// Encode a trailer mapping as `"key: value\r\n"` lines.
///
/// Entry order is not wire-significant; keys are emitted sorted so equal
/// mappings encode to equal bytes.
pub fn encode_trailers(trailers: &Metadata) -> Vec<u8> {
    let mut keys: Vec<&String> = trailers.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&trailers[key]);
        out.push_str("\r\n");
    }
    out.into_bytes()
}

/// Parse trailer text back into a mapping.
///
/// Splits on `\r\n`, skips blank lines, splits each line at the first `:`,
/// trims whitespace on both sides, and lower-cases the key. Lines without a
/// colon are silently skipped, not an error.
pub fn parse_trailers(bytes: &[u8]) -> Metadata {
    let text = String::from_utf8_lossy(bytes);
    let mut trailers = Metadata::new();

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        trailers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    trailers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::data(b"hello".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded[0], FLAG_DATA);
        assert_eq!(&encoded[1..5], &5u32.to_be_bytes());

        let (frames, remaining) = decode_frames(&encoded);
        assert_eq!(frames, vec![frame]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn empty_payload_frame() {
        let frame = Frame::data(Vec::new());
        let (frames, remaining) = decode_frames(&frame.encode());
        assert_eq!(frames, vec![frame]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn decode_empty_buffer() {
        let (frames, remaining) = decode_frames(&[]);
        assert!(frames.is_empty());
        assert!(remaining.is_empty());
    }

    #[test]
    fn decode_many_frames_in_one_buffer() {
        let mut buffer = Frame::data(b"one".to_vec()).encode();
        buffer.extend(Frame::data(b"two".to_vec()).encode());
        buffer.extend(Frame::trailer(&Metadata::new()).encode());

        let (frames, remaining) = decode_frames(&buffer);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, b"one");
        assert_eq!(frames[1].data, b"two");
        assert!(frames[2].is_trailer());
        assert!(remaining.is_empty());
    }

    #[test]
    fn partial_header_is_kept_as_remaining() {
        let encoded = Frame::data(b"payload".to_vec()).encode();
        let (frames, remaining) = decode_frames(&encoded[..4]);
        assert!(frames.is_empty());
        assert_eq!(remaining, &encoded[..4]);
    }

    #[test]
    fn partial_payload_is_kept_as_remaining() {
        let encoded = Frame::data(b"payload".to_vec()).encode();
        let (frames, remaining) = decode_frames(&encoded[..encoded.len() - 1]);
        assert!(frames.is_empty());
        assert_eq!(remaining, &encoded[..encoded.len() - 1]);
    }

    #[test]
    fn incremental_decode_at_every_split_point() {
        let mut whole = Frame::data(b"first".to_vec()).encode();
        whole.extend(Frame::data(b"second frame payload".to_vec()).encode());

        let (expected, _) = decode_frames(&whole);
        assert_eq!(expected.len(), 2);

        for split in 0..=whole.len() {
            let (mut frames, remaining) = decode_frames(&whole[..split]);
            let mut buffer = remaining;
            buffer.extend_from_slice(&whole[split..]);
            let (rest, remaining) = decode_frames(&buffer);
            frames.extend(rest);

            assert_eq!(frames, expected, "split at byte {split}");
            assert!(remaining.is_empty(), "split at byte {split}");
        }
    }

    #[test]
    fn trailers_round_trip() {
        let mut trailers = Metadata::new();
        trailers.insert("grpc-status".into(), "0".into());
        trailers.insert("grpc-message".into(), "all good".into());

        let parsed = parse_trailers(&encode_trailers(&trailers));
        assert_eq!(parsed, trailers);
    }

    #[test]
    fn parse_trailers_lowercases_keys_and_trims() {
        let parsed = parse_trailers(b"Grpc-Status:  5 \r\nX-Extra: v\r\n");
        assert_eq!(parsed.get("grpc-status").map(String::as_str), Some("5"));
        assert_eq!(parsed.get("x-extra").map(String::as_str), Some("v"));
    }

    #[test]
    fn parse_trailers_skips_blank_and_colonless_lines() {
        let parsed = parse_trailers(b"\r\nnot a header line\r\ngrpc-status: 0\r\n\r\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("grpc-status").map(String::as_str), Some("0"));
    }
}
