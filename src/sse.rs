//! SSE framer/parser (component C).
//!
//! A pure incremental decoder of the Server-Sent Events wire format: `field:
//! value` lines grouped into events by blank lines, tolerant of CR, LF, and
//! CRLF line endings and of chunk boundaries landing mid-field or mid-event.
//! The teacher only ever *produces* SSE (`src/mcp/streamable_http.rs`'s
//! `axum::response::sse::Event`); this module is the consumption side the
//! spec needs for tee-ing upstream SSE bodies, built around the same
//! `bytes::Bytes` buffering idiom the pack's streaming HTTP clients use.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::jsonrpc::{self, JsonRpcShape};

/// One assembled SSE event. `data` has already had its multi-line `data:`
/// fields concatenated with `\n`, per the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

/// Incremental decoder. Feed it chunks with [`SseDecoder::push`] and drain
/// completed events with [`SseDecoder::next_event`]; call
/// [`SseDecoder::finish`] when the upstream body ends to recover (or
/// discard) a trailing partial event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    pending: PendingEvent,
}

#[derive(Debug, Default)]
struct PendingEvent {
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
    retry: Option<u64>,
    touched: bool,
}

impl PendingEvent {
    fn reset(&mut self) {
        *self = PendingEvent::default();
    }

    fn into_event(self) -> Option<SseEvent> {
        if !self.touched {
            return None;
        }
        Some(SseEvent {
            id: self.id,
            event: self.event,
            data: self.data_lines.join("\n"),
            retry: self.retry,
        })
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes from the upstream body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next fully-framed event out of the buffer, if a complete
    /// blank-line-terminated block is present. Returns `None` when more
    /// input is needed, not when the stream is over (see [`Self::finish`]).
    pub fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let line_end = find_line_end(&self.buf)?;
            let (line, consumed) = line_end;
            let raw_line = self.buf.split_to(consumed);
            self.buf.advance(0);
            let line_bytes = &raw_line[..line];
            let text = String::from_utf8_lossy(line_bytes);

            if text.is_empty() {
                if let Some(event) = std::mem::take(&mut self.pending).into_event() {
                    return Some(event);
                }
                continue;
            }

            self.apply_field(&text);
        }
    }

    fn apply_field(&mut self, line: &str) {
        self.pending.touched = true;
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.pending.id = Some(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "data" => self.pending.data_lines.push(value.to_string()),
            "retry" => self.pending.retry = value.parse().ok(),
            _ => {} // comment lines (leading ':') and unknown fields are ignored
        }
    }

    /// Call once the upstream body is exhausted. A trailing event with no
    /// closing blank line is still recoverable from an unterminated
    /// `data:`/`event:` block; per §5's cancellation contract, a premature
    /// close mid-field (no complete field line buffered) discards the
    /// partial event instead of fabricating one.
    pub fn finish(mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            if let Some(line_end) = find_line_end(&self.buf) {
                let (line, _) = line_end;
                let text = String::from_utf8_lossy(&self.buf[..line]).to_string();
                if !text.is_empty() {
                    self.apply_field(&text);
                }
            }
        }
        self.pending.into_event()
    }
}

/// Find the end of the next line, tolerating `\n`, `\r\n`, and bare `\r`.
/// Returns `(content_len, total_consumed)`.
fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &byte) in buf.iter().enumerate() {
        if byte == b'\n' {
            let content_len = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };
            return Some((content_len, i + 1));
        }
        if byte == b'\r' {
            // Only a line ending if not immediately followed by `\n` (that
            // case is handled above once the `\n` arrives); a lone `\r` at
            // the end of the buffer means "need more input".
            if i + 1 < buf.len() {
                if buf[i + 1] == b'\n' {
                    continue;
                }
                return Some((i, i + 1));
            }
            return None;
        }
    }
    None
}

/// Classification of a decoded SSE event's `data` payload, used by the proxy
/// engine to decide how to capture it (§4.C's second predicate).
#[derive(Debug, Clone)]
pub enum SseClassification {
    JsonRpc { shape: JsonRpcShape, value: Value },
    Opaque,
}

/// Attempt to parse `event.data` as a JSON-RPC message and classify it by
/// the presence of `id`/`result`/`error`, per §4.C.
pub fn classify_event(event: &SseEvent) -> SseClassification {
    match serde_json::from_str::<Value>(&event.data) {
        Ok(value) => match jsonrpc::classify(&value) {
            Some(shape) => SseClassification::JsonRpc { shape, value },
            None => SseClassification::Opaque,
        },
        Err(_) => SseClassification::Opaque,
    }
}
