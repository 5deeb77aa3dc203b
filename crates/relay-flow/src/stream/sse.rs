//! Incremental parser for server-sent-event framing.
//!
//! The upstream event channel frames events as SSE records (`id:`, `event:`,
//! `data:` lines terminated by a blank line). The parser is fed raw chunks
//! and yields complete frames, carrying partial lines across chunk
//! boundaries. Comment lines (leading `:`) and unknown fields are ignored.

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `id:` field, when present.
    pub id: Option<String>,
    /// The `event:` field, when present.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk, returning any frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() && self.id.is_none() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        };
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_frame() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"id: 7\nevent: tool_call\ndata: {\"id\":\"7\"}\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].event.as_deref(), Some("tool_call"));
        assert_eq!(frames[0].data, "{\"id\":\"7\"}");
    }

    #[test]
    fn carries_partial_lines_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"id\":").is_empty());
        assert!(parser.push(b"\"42\"}\n").is_empty());
        let frames = parser.push(b"\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"id\":\"42\"}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keepalive\nretry: 3000\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn blank_line_without_fields_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\n\n").is_empty());
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: a\n\ndata: b\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }
}
