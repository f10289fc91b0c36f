use bytes::Bytes;
use serde::Serialize;

/// Sentinel payload terminating both upstream and downstream streams.
pub const DONE: &str = "[DONE]";

/// Incremental parser over an SSE byte stream.
///
/// The upstream only ever emits `data:` fields and comment lines, so the
/// parser yields the joined data payload of each frame and drops everything
/// else. Incomplete trailing input stays buffered until the next push.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_frame(&mut payloads);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            } else if line == "data" {
                self.data_lines.push(String::new());
            }
            // event/id/retry fields are not used by this upstream.
        }

        payloads
    }

    /// Flushes whatever is buffered when the connection ends without a final
    /// blank line.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        let mut payloads = Vec::new();
        self.finish_frame(&mut payloads);
        payloads
    }

    fn finish_frame(&mut self, payloads: &mut Vec<String>) {
        if self.data_lines.is_empty() {
            return;
        }
        payloads.push(self.data_lines.join("\n"));
        self.data_lines.clear();
    }
}

/// Serializes a value as a single `data: {json}\n\n` frame.
pub fn json_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Comment frame used to keep idle downstream connections open.
pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(b":\n\n")
}
