//! Incremental server-sent-events framing

/// Collects `data:` lines from arbitrary byte chunks and emits one payload
/// per blank-line-terminated event. Chunks may split lines or UTF-8
/// sequences anywhere.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }

    /// Emit a trailing event that never got its terminating blank line
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            if let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        if self.data_lines.is_empty() {
            return None;
        }
        let event = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut sse = SseAccumulator::new();
        assert!(sse.push(b"event: message\ndata: {\"a\"").is_empty());
        assert!(sse.push(b":1}\r\n").is_empty());
        let events = sse.push(b"\r\ndata: second\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_multibyte_split_and_multiline_data() {
        let mut sse = SseAccumulator::new();
        let payload = "data: héllo\ndata: wörld\n\n".as_bytes();
        let (a, b) = payload.split_at(8);
        assert!(sse.push(a).is_empty());
        assert_eq!(sse.push(b), vec!["héllo\nwörld".to_string()]);
    }

    #[test]
    fn test_comments_ignored_and_finish_flushes() {
        let mut sse = SseAccumulator::new();
        assert!(sse.push(b": keep-alive\n\n").is_empty());
        assert!(sse.push(b"data: [DONE]").is_empty());
        assert_eq!(sse.finish().as_deref(), Some("[DONE]"));
        assert!(sse.finish().is_none());
    }
}
