//! Incremental server-sent-event parsing for upstream streams.
//!
//! Upstream bodies arrive as arbitrary byte chunks; the parser buffers
//! partial lines across chunks and surfaces complete `data:` payloads.
//! Comment lines and non-data fields are dropped; the `[DONE]` sentinel is
//! reported as a distinct frame so callers can terminate without peeking at
//! payload contents.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload of one `data:` line.
    Data(String),
    /// The `data: [DONE]` terminator.
    Done,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush a trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<SseFrame> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let value = line.strip_prefix("data:")?.trim_start();
    if value == "[DONE]" {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data(value.to_string()))
}
