//! SSE (Server-Sent Events) decoder for provider streaming responses.
//!
//! Both the OpenAI-compatible and Anthropic wire formats deliver streaming
//! output as `data: {...}` lines. This decoder handles the `data: ` prefix,
//! line buffering across TCP chunk boundaries, `event:` lines, empty
//! keep-alive lines, and the OpenAI `[DONE]` terminator.

use serde_json::Value;

/// Incremental SSE payload decoder.
///
/// Feed raw body bytes with [`decode`](Self::decode); complete `data:`
/// payloads come back as parsed JSON values.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any complete JSON payloads.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(line.trim()) {
                values.push(value);
            }
        }
        values
    }

    /// Drain whatever remains in the buffer (stream ended without a trailing
    /// newline).
    pub fn flush(&mut self) -> Vec<Value> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining.lines().filter_map(|l| parse_line(l.trim())).collect()
    }
}

fn parse_line(line: &str) -> Option<Value> {
    if line.is_empty() || line.starts_with("event:") {
        return None;
    }
    let data = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();
    if data == "[DONE]" {
        return None;
    }
    serde_json::from_str(data).ok()
}
