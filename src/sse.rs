//! Minimal incremental server-sent-events decoder.
//!
//! Feeds on raw response-body chunks and yields complete events; field
//! handling follows the SSE wire format (`event:`, `data:`, `id:`,
//! comment lines, blank-line dispatch), tolerating CRLF line endings
//! and chunk boundaries that split lines or UTF-8 sequences.

/// One decoded event. `event_type` defaults to `"message"` when the
/// server sends no `event:` field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    event_type: String,
    data: String,
    id: Option<String>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one body chunk, returning every event completed by it.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.handle_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<Event> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line[0] == b':' {
            // comment
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.find(':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                // a single leading space is part of the delimiter
                (&line[..colon], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_ref(), ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            "id" => self.id = Some(value.to_string()),
            // "retry" and anything else is ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Event> {
        if self.data.is_empty() && self.event_type.is_empty() {
            return None;
        }
        let event = Event {
            event_type: if self.event_type.is_empty() {
                "message".to_string()
            } else {
                std::mem::take(&mut self.event_type)
            },
            data: std::mem::take(&mut self.data),
            id: self.id.clone(),
        };
        self.event_type.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_event() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b"event: put-object\ndata: {\"key\":\"f\"}\n\n");
        assert_eq!(
            events,
            vec![Event {
                event_type: "put-object".to_string(),
                data: "{\"key\":\"f\"}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn defaults_to_message_type() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b"data: hello\n\n");
        assert_eq!(events[0].event_type, "message");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b"event: e\ndata: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn handles_chunks_splitting_lines() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode(b"event: heart").is_empty());
        assert!(decoder.decode(b"beat\ndata: {}").is_empty());
        let events = decoder.decode(b"\n\n");
        assert_eq!(events[0].event_type, "heartbeat");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn tolerates_crlf_and_comments() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b": keepalive\r\nevent: e\r\ndata: d\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "e");
        assert_eq!(events[0].data, "d");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "a");
        assert_eq!(events[1].event_type, "b");
    }

    #[test]
    fn blank_lines_without_data_do_not_dispatch() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode(b"\n\n: comment\n\n").is_empty());
    }

    #[test]
    fn field_without_colon_is_a_name_with_empty_value() {
        let mut decoder = Decoder::new();
        let events = decoder.decode(b"data\n\n");
        // "data" alone appends an empty value; dispatch is suppressed
        // because nothing accumulated
        assert!(events.is_empty());
    }
}
