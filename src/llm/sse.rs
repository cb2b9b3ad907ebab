//! Incremental decoder for `text/event-stream` bodies.
//!
//! Chunks from the network may split a line (or a UTF-8 sequence) anywhere,
//! so bytes are buffered until a newline arrives.

/// One meaningful event line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// `data:` payload.
    Data(String),
    /// `data: [DONE]` terminator.
    Done,
}

/// Buffers raw bytes and yields complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

/// Parse a single line. Comments, blank lines and non-data fields yield `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Data("{\"a\":2}".to_string())
            ]
        );
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"te").is_empty());
        let events = decoder.push(b"xt\":\"hi\"}\r\ndata: [DO");
        assert_eq!(events, vec![SseEvent::Data("{\"text\":\"hi\"}".to_string())]);
        assert_eq!(decoder.push(b"NE]\n"), vec![SseEvent::Done]);
    }

    #[test]
    fn test_multibyte_split() {
        let bytes = "data: héllo\n".as_bytes();
        let (head, tail) = bytes.split_at(8);
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec![SseEvent::Data("héllo".to_string())]);
    }

    #[test]
    fn test_ignores_comments_and_other_fields() {
        assert_eq!(parse_line(": keep-alive"), None);
        assert_eq!(parse_line("event: message"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("data:"), None);
        assert_eq!(parse_line("data:[DONE]"), Some(SseEvent::Done));
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(SseEvent::Data("tail".to_string())));
        assert_eq!(decoder.finish(), None);
    }
}
