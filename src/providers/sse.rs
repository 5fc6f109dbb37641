//! Minimal server-sent-events parser for provider byte streams.
//!
//! Accumulates raw network bytes and yields complete `data:` payloads once
//! their line has fully arrived. Payloads split across TCP reads are buffered
//! until the trailing newline shows up.

#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the `data:` payloads completed by this read.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        if let Some(pos) = self.buffer.rfind('\n') {
            let complete = self.buffer[..=pos].to_string();
            self.buffer = self.buffer[pos + 1..].to_string();

            for line in complete.lines() {
                let line = line.trim_end_matches('\r');
                // Comments and non-data fields (event:, id:) are skipped.
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if let Some(data) = line.strip_prefix("data:") {
                    payloads.push(data.trim_start().to_string());
                }
            }
        }
        payloads
    }
}
