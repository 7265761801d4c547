//! Incremental server-sent-event framing for streamed model replies.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Buffers partial input and yields events as their blank-line terminator
/// arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    /// A chunk ended on CR; its LF may open the next chunk.
    pending_cr: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut text = String::with_capacity(chunk.len() + 1);
        if std::mem::take(&mut self.pending_cr) {
            text.push('\r');
        }
        text.push_str(chunk);
        if text.ends_with('\r') {
            text.pop();
            self.pending_cr = true;
        }
        // CRLF, CR and LF all end a line.
        self.buffer
            .push_str(&text.replace("\r\n", "\n").replace('\r', "\n"));

        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_event(&block) {
                events.push(event);
            }
        }

        events
    }

    /// Parse whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.pending_cr = false;
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_event(&rest)
    }

    fn parse_event(text: &str) -> Option<SseEvent> {
        let mut event = None;
        let mut data = Vec::new();

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        if data.is_empty() {
            return None;
        }

        Some(SseEvent {
            event,
            data: data.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"a\":").is_empty());
        let events = parser.feed("1}\n\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn crlf_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keepalive\r\n\r\nevent: message\r\ndata: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn crlf_delimiter_split_between_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: x\r\n\r").is_empty());
        let first = parser.feed("\n");
        let second = parser.feed("data: y\r\n\r\n");

        let data: Vec<_> = first.into_iter().chain(second).map(|e| e.data).collect();
        assert_eq!(data, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn cr_only_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: a\r\rdata: b\r");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
        let events = parser.feed("\rdata: c\r\r");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "b");
        assert_eq!(parser.finish().map(|e| e.data), Some("c".to_string()));
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: tail").is_empty());
        assert_eq!(parser.finish().map(|e| e.data), Some("tail".to_string()));
        assert!(parser.finish().is_none());
    }
}
