use bytes::Bytes;

/// One server-sent event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Upstream chunks may split events (and UTF-8
/// sequences) at arbitrary byte boundaries; bytes are accumulated and
/// consumed up to the last complete line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    scan_from: usize,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(offset) = self.buffer[self.scan_from..]
                .iter()
                .position(|byte| *byte == b'\n')
            else {
                self.scan_from = self.buffer.len();
                break;
            };
            let end = self.scan_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..=end);
            self.scan_from = 0;
            self.consume_line(line.trim_end_matches('\r'), &mut events);
        }

        events
    }

    /// Flush a trailing partial line and any half-built event at stream end.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
            self.scan_from = 0;
            self.consume_line(line.trim_end_matches('\r'), &mut events);
        }
        self.emit_pending(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.emit_pending(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn emit_pending(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        });
    }
}

/// Serialize an event back to wire form.
pub fn frame_event(event: &SseEvent) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// The OpenAI-dialect stream terminator.
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(&Bytes::from_static(b"data: {\"a\":")).is_empty());
        let events = parser.push(&Bytes::from_static(b"1}\n\ndata: [DONE]\n\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done_sentinel());
    }

    #[test]
    fn named_events_keep_their_name() {
        let mut parser = SseParser::new();
        let events = parser.push(&Bytes::from_static(
            b"event: message_start\ndata: {}\n\n",
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
    }

    #[test]
    fn comment_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(&Bytes::from_static(b": keepalive\n\ndata: x\n\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(&Bytes::from_static(b"data: a\ndata: b\n\n"));
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_partial_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(&Bytes::from_static(b"data: tail")).is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn frame_round_trips() {
        let event = SseEvent {
            event: Some("message_stop".to_string()),
            data: "{}".to_string(),
        };
        let framed = frame_event(&event);
        let mut parser = SseParser::new();
        let parsed = parser.push(&framed);
        assert_eq!(parsed, vec![event]);
    }
}
