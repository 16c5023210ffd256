//! Framed JSON-RPC transport.
//!
//! Encodes and decodes individual JSON-RPC messages across a byte stream.
//! Two framings are supported:
//! - Line-delimited JSON (one object per line), the MCP stdio default
//! - `Content-Length` headers followed by a JSON body (LSP-style)
//!
//! A framing error is terminal: once a reader returns `Err`, the stream is
//! considered corrupt and must not be read again.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use super::types::JsonRpcMessage;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Longest single header line accepted in `Content-Length` mode.
const MAX_HEADER_LINE: usize = 8 * 1024;

/// How messages are delimited on the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Line,
    ContentLength,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("stream ended in the middle of a frame")]
    Truncated,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize one message into a complete frame.
pub fn encode(message: &JsonRpcMessage, framing: Framing) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| FrameError::Malformed(format!("failed to serialize message: {e}")))?;

    Ok(match framing {
        Framing::Line => {
            let mut frame = body;
            frame.push(b'\n');
            frame
        }
        Framing::ContentLength => {
            let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
            frame.extend_from_slice(&body);
            frame
        }
    })
}

/// Decode a frame body into a JSON-RPC message.
fn decode(body: &[u8]) -> Result<JsonRpcMessage, FrameError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| FrameError::Malformed(format!("invalid JSON: {e}")))?;

    let Some(obj) = value.as_object() else {
        return Err(FrameError::Malformed("frame is not a JSON object".into()));
    };
    if !obj.contains_key("method") && !obj.contains_key("result") && !obj.contains_key("error") {
        return Err(FrameError::Malformed(
            "object is not a JSON-RPC request, notification, or response".into(),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| FrameError::Malformed(format!("invalid JSON-RPC message: {e}")))
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Reads framed messages from an async byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    max_frame: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self::with_limit(reader, framing, MAX_FRAME_BYTES)
    }

    /// Like [`FrameReader::new`] with a custom frame size limit.
    pub fn with_limit(reader: R, framing: Framing, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            framing,
            max_frame,
            buf: Vec::new(),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean end of stream (between frames).
    pub async fn read_next(&mut self) -> Result<Option<JsonRpcMessage>, FrameError> {
        match self.framing {
            Framing::Line => self.read_line_frame().await,
            Framing::ContentLength => self.read_length_frame().await,
        }
    }

    async fn read_line_frame(&mut self) -> Result<Option<JsonRpcMessage>, FrameError> {
        loop {
            self.buf.clear();
            let limit = self.max_frame as u64 + 1;
            let n = {
                let mut limited = (&mut self.inner).take(limit);
                limited.read_until(b'\n', &mut self.buf).await?
            };

            if n == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated {
                if self.buf.len() > self.max_frame {
                    return Err(FrameError::TooLarge {
                        size: self.buf.len(),
                        limit: self.max_frame,
                    });
                }
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            return decode(line).map(Some);
        }
    }

    async fn read_length_frame(&mut self) -> Result<Option<JsonRpcMessage>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            self.buf.clear();
            let n = {
                let mut limited = (&mut self.inner).take(MAX_HEADER_LINE as u64 + 1);
                limited.read_until(b'\n', &mut self.buf).await?
            };

            if n == 0 {
                return if saw_header {
                    Err(FrameError::Truncated)
                } else {
                    Ok(None)
                };
            }
            if self.buf.last() != Some(&b'\n') {
                if self.buf.len() > MAX_HEADER_LINE {
                    return Err(FrameError::Malformed("header line too long".into()));
                }
                return Err(FrameError::Truncated);
            }

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;

            let line = std::str::from_utf8(line)
                .map_err(|_| FrameError::Malformed("header is not valid UTF-8".into()))?;
            let Some((key, value)) = line.split_once(':') else {
                return Err(FrameError::Malformed(format!("bad header line: {line}")));
            };
            if key.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    FrameError::Malformed(format!("bad Content-Length value: {}", value.trim()))
                })?;
                content_length = Some(len);
            }
        }

        let len = content_length
            .ok_or_else(|| FrameError::Malformed("missing Content-Length header".into()))?;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                size: len,
                limit: self.max_frame,
            });
        }

        self.buf.clear();
        self.buf.resize(len, 0);
        match self.inner.read_exact(&mut self.buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncated)
            }
            Err(e) => return Err(e.into()),
        }

        decode(&self.buf).map(Some)
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Writes framed messages to an async byte stream, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self {
            inner: writer,
            framing,
        }
    }

    pub async fn write(&mut self, message: &JsonRpcMessage) -> Result<(), FrameError> {
        let frame = encode(message, self.framing)?;
        self.write_frame(&frame).await
    }

    /// Write a frame produced by [`encode`] with this writer's framing.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write half (the peer sees end of stream).
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::{JsonRpcNotification, JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn test_line_reader_skips_blank_lines() {
        let input: &[u8] = b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n  \n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n";
        let mut reader = FrameReader::new(input, Framing::Line);

        let first = reader.read_next().await.unwrap().unwrap();
        assert!(matches!(first, JsonRpcMessage::Response(r) if r.id == Some(RequestId::Number(1))));

        let second = reader.read_next().await.unwrap().unwrap();
        assert!(matches!(second, JsonRpcMessage::Notification(_)));

        assert!(reader.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_reader_unterminated_final_line() {
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"res";
        let mut reader = FrameReader::new(input, Framing::Line);
        assert!(matches!(
            reader.read_next().await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_line_reader_rejects_non_json() {
        let input: &[u8] = b"Starting server on stdio...\n";
        let mut reader = FrameReader::new(input, Framing::Line);
        assert!(matches!(
            reader.read_next().await,
            Err(FrameError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_line_reader_rejects_non_rpc_values() {
        let mut reader = FrameReader::new(&b"[1, 2, 3]\n"[..], Framing::Line);
        assert!(matches!(reader.read_next().await, Err(FrameError::Malformed(_))));

        let mut reader = FrameReader::new(&b"{\"hello\": \"world\"}\n"[..], Framing::Line);
        assert!(matches!(reader.read_next().await, Err(FrameError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_line_reader_enforces_limit() {
        let mut input = vec![b' '; 100];
        input.push(b'\n');
        let mut reader = FrameReader::with_limit(&input[..], Framing::Line, 64);
        assert!(matches!(
            reader.read_next().await,
            Err(FrameError::TooLarge { limit: 64, .. })
        ));
    }

    #[tokio::test]
    async fn test_content_length_write_then_read() {
        let mut writer = FrameWriter::new(Vec::new(), Framing::ContentLength);
        let req = JsonRpcMessage::Request(JsonRpcRequest::new(
            9,
            "tools/call",
            Some(serde_json::json!({"name": "hello_world", "arguments": {}})),
        ));
        let note = JsonRpcMessage::Notification(JsonRpcNotification::new(
            "notifications/initialized",
            None,
        ));
        writer.write(&req).await.unwrap();
        writer.write(&note).await.unwrap();

        let bytes = writer.into_inner();
        assert!(bytes.starts_with(b"Content-Length: "));

        let mut reader = FrameReader::new(&bytes[..], Framing::ContentLength);
        match reader.read_next().await.unwrap().unwrap() {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(9));
                assert_eq!(r.method, "tools/call");
            }
            other => panic!("expected request, got {other:?}"),
        }
        assert!(matches!(
            reader.read_next().await.unwrap(),
            Some(JsonRpcMessage::Notification(_))
        ));
        assert!(reader.read_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_length_truncated_body() {
        let input: &[u8] = b"Content-Length: 50\r\n\r\n{\"jsonrpc\":\"2.0\"";
        let mut reader = FrameReader::new(input, Framing::ContentLength);
        assert!(matches!(reader.read_next().await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn test_content_length_bad_headers() {
        let mut reader = FrameReader::new(
            &b"Content-Type: application/json\r\n\r\n{}"[..],
            Framing::ContentLength,
        );
        assert!(matches!(reader.read_next().await, Err(FrameError::Malformed(_))));

        let mut reader = FrameReader::new(
            &b"Content-Length: lots\r\n\r\n{}"[..],
            Framing::ContentLength,
        );
        assert!(matches!(reader.read_next().await, Err(FrameError::Malformed(_))));

        let oversized = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(oversized.as_bytes(), Framing::ContentLength);
        assert!(matches!(reader.read_next().await, Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_encode_line_frame() {
        let msg = JsonRpcMessage::Notification(JsonRpcNotification::new("ping", None));
        let frame = encode(&msg, Framing::Line).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
