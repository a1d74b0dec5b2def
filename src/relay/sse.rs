//! Incremental Server-Sent Events decoder for chat-completion streams.
//!
//! Bytes arrive in arbitrary chunks; events are split on newlines, only
//! `data:` lines matter, and `[DONE]` ends the stream.

use bytes::BytesMut;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// JSON payload of one `data:` line
    Data(String),
    /// The `[DONE]` marker
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed one chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = self.buffer.split();
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    // Multi-byte characters never straddle a line break, so a full line is valid UTF-8
    let line = std::str::from_utf8(raw).ok()?.trim();

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|data| !data.is_empty())?;

    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}
