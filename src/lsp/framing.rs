//! LSP message framing layer
//!
//! Handles `Content-Length` framing as specified by the Language Server
//! Protocol base protocol:
//!
//! ```text
//! Content-Length: <length>\r\n
//! [other headers]\r\n
//! \r\n
//! <length bytes of UTF-8 JSON>
//! ```
//!
//! Malformed frames are reported to the caller and skipped; they never
//! poison the stream.

use crate::io::transport::Transport;
use tracing::{trace, warn};

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

/// Upper bound on a header block without a terminating blank line
const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Reasons a single frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Header block exceeds {max} bytes without terminator")]
    HeaderTooLarge { max: usize },

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,
}

/// Frame a JSON payload with a `Content-Length` header
///
/// The length is the payload's byte length, not its character count.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut framed = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    framed.extend_from_slice(payload.as_bytes());
    framed
}

/// Incremental decoder for `Content-Length` framed messages
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,

    /// Body bytes still to be thrown away after an oversized header
    discard_remaining: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next frame
    ///
    /// Returns `None` when more data is needed. `Some(Err(_))` means a frame
    /// was consumed but could not be decoded; decoding can continue.
    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        if self.discard_remaining > 0 {
            let n = self.discard_remaining.min(self.buffer.len());
            self.buffer.drain(..n);
            self.discard_remaining -= n;
            if self.discard_remaining > 0 {
                return None;
            }
        }

        let Some(header_end) = find_subsequence(&self.buffer, HEADER_SEPARATOR) else {
            if self.buffer.len() > MAX_HEADER_SIZE {
                self.buffer.clear();
                return Some(Err(FrameError::HeaderTooLarge {
                    max: MAX_HEADER_SIZE,
                }));
            }
            return None;
        };

        let content_start = header_end + HEADER_SEPARATOR.len();
        let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();

        let content_length = match parse_content_length(&header) {
            Ok(length) => length,
            Err(e) => {
                self.buffer.drain(..content_start);
                return Some(Err(e));
            }
        };

        if content_length > MAX_MESSAGE_SIZE {
            self.buffer.drain(..content_start);
            self.discard_remaining = content_length;
            return Some(Err(FrameError::MessageTooLarge {
                size: content_length,
                max: MAX_MESSAGE_SIZE,
            }));
        }

        let available = self.buffer.len() - content_start;
        if available < content_length {
            trace!(
                "FrameDecoder: Incomplete message - need {} more bytes",
                content_length - available
            );
            return None;
        }

        let body: Vec<u8> = self
            .buffer
            .drain(..content_start + content_length)
            .skip(content_start)
            .collect();

        trace!("FrameDecoder: Parsed complete message ({} bytes)", content_length);
        Some(String::from_utf8(body).map_err(|_| FrameError::InvalidUtf8))
    }
}

/// Parse `Content-Length` from a header block; header names are case-insensitive
fn parse_content_length(header: &str) -> Result<usize, FrameError> {
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }

    Err(FrameError::MissingContentLength)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// LSP framing wrapper around a byte transport
pub struct LspFraming<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    malformed_frames: u64,
}

impl<T: Transport> LspFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
            malformed_frames: 0,
        }
    }

    /// Frame and send one JSON message
    pub async fn send_message(&mut self, message: &str) -> Result<(), T::Error> {
        trace!(
            "LspFraming: Sending framed message ({} bytes content)",
            message.len()
        );
        self.transport.send(&encode_frame(message)).await
    }

    /// Receive the next well-formed message
    ///
    /// Malformed frames are logged, counted and skipped. Only transport
    /// failures are returned as errors. Cancel-safe: bytes already read stay
    /// buffered in the decoder.
    pub async fn receive_message(&mut self) -> Result<String, T::Error> {
        loop {
            while let Some(frame) = self.decoder.next_frame() {
                match frame {
                    Ok(message) => return Ok(message),
                    Err(e) => {
                        self.malformed_frames += 1;
                        warn!("Dropping malformed LSP frame: {}", e);
                    }
                }
            }

            let chunk = self.transport.receive().await?;
            self.decoder.push(&chunk);
        }
    }

    /// Number of frames dropped as malformed so far
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    pub async fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;

    #[test]
    fn test_encode_uses_byte_length() {
        let framed = encode_frame("{\"text\":\"é\"}");
        let text = String::from_utf8(framed).unwrap();
        // "é" is two bytes in UTF-8
        assert!(text.starts_with("Content-Length: 13\r\n\r\n"));
    }

    #[test]
    fn test_round_trip_preserves_payload() {
        let payloads = [
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            r#"{"jsonrpc":"2.0","method":"textDocument/didOpen","params":{"text":"val s = \"世界 🌍\""}}"#,
            "{}",
        ];

        let mut decoder = FrameDecoder::new();
        for payload in payloads {
            decoder.push(&encode_frame(payload));
        }

        for payload in payloads {
            assert_eq!(decoder.next_frame(), Some(Ok(payload.to_string())));
        }
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_partial_message_across_chunks() {
        let framed = encode_frame(r#"{"jsonrpc":"2.0","id":7,"result":null}"#);
        let mut decoder = FrameDecoder::new();

        // Split in the middle of the header and again in the body
        decoder.push(&framed[..10]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&framed[10..30]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&framed[30..]);

        assert_eq!(
            decoder.next_frame(),
            Some(Ok(r#"{"jsonrpc":"2.0","id":7,"result":null}"#.to_string()))
        );
    }

    #[test]
    fn test_extra_headers_and_case_insensitive_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(
            b"content-length: 2\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
        );
        assert_eq!(decoder.next_frame(), Some(Ok("{}".to_string())));
    }

    #[test]
    fn test_invalid_length_is_skipped_and_stream_recovers() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: abc\r\n\r\n");
        decoder.push(&encode_frame("{\"ok\":true}"));

        match decoder.next_frame() {
            Some(Err(FrameError::InvalidContentLength(value))) => assert_eq!(value, "abc"),
            other => panic!("Expected InvalidContentLength, got {:?}", other),
        }
        assert_eq!(decoder.next_frame(), Some(Ok("{\"ok\":true}".to_string())));
    }

    #[test]
    fn test_missing_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Type: text/plain\r\n\r\n");
        assert_eq!(
            decoder.next_frame(),
            Some(Err(FrameError::MissingContentLength))
        );
    }

    #[test]
    fn test_oversized_body_is_discarded() {
        let mut decoder = FrameDecoder::new();
        let oversized = MAX_MESSAGE_SIZE + 1;
        decoder.push(format!("Content-Length: {}\r\n\r\n", oversized).as_bytes());

        match decoder.next_frame() {
            Some(Err(FrameError::MessageTooLarge { size, max })) => {
                assert_eq!(size, oversized);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {:?}", other),
        }

        // Feed the oversized body in chunks, then a valid frame
        let chunk = vec![b'x'; 1024 * 1024];
        let mut remaining = oversized;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            decoder.push(&chunk[..n]);
            remaining -= n;
            assert_eq!(decoder.next_frame(), None);
        }
        decoder.push(&encode_frame("{}"));
        assert_eq!(decoder.next_frame(), Some(Ok("{}".to_string())));
    }

    #[test]
    fn test_invalid_utf8_body() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 2\r\n\r\n\xff\xfe");
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::InvalidUtf8)));
    }

    #[tokio::test]
    async fn test_framing_over_transport_skips_garbage() {
        let (transport, handle) = MockTransport::new();
        let mut framing = LspFraming::new(transport);

        framing.send_message("{\"id\":1}").await.unwrap();
        assert_eq!(
            handle.sent_messages(),
            vec![b"Content-Length: 8\r\n\r\n{\"id\":1}".to_vec()]
        );

        handle.push_inbound(b"Content-Length: nope\r\n\r\n".to_vec());
        handle.push_inbound(encode_frame("{\"id\":2}"));

        let message = framing.receive_message().await.unwrap();
        assert_eq!(message, "{\"id\":2}");
        assert_eq!(framing.malformed_frames(), 1);
    }
}
