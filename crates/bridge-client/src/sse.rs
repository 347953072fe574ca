/// One decoded server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event { event: String, data: String },
    /// `: text` lines; the server uses them as heartbeats.
    Comment(String),
}

/// Incremental decoder: feed it raw chunks as they arrive, get complete frames back.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        // decode whole lines only, so a character split across chunks stays intact
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.feed_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame::Event {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: connected\ndata: {\"heart").is_empty());
        let frames = decoder.push(b"beatSecs\":30}\n\nevent: task\r\ndata: {}\r\n\r\n");
        assert_eq!(
            frames,
            vec![
                SseFrame::Event {
                    event: "connected".into(),
                    data: "{\"heartbeatSecs\":30}".into()
                },
                SseFrame::Event {
                    event: "task".into(),
                    data: "{}".into()
                },
            ]
        );
    }

    #[test]
    fn heartbeat_comments_are_reported() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.push(b":heartbeat\n\n"),
            vec![SseFrame::Comment("heartbeat".into())]
        );
    }

    #[test]
    fn multi_line_data_is_joined_and_default_event_is_message() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: a\ndata: b\nid: 7\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                event: "message".into(),
                data: "a\nb".into()
            }]
        );
    }

    #[test]
    fn multibyte_characters_split_across_chunks_survive() {
        let payload = "data: café ✓\n\n".as_bytes();
        let split = payload
            .iter()
            .position(|byte| *byte == 0xC3)
            .map(|at| at + 1)
            .unwrap();

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        assert_eq!(
            decoder.push(&payload[split..]),
            vec![SseFrame::Event {
                event: "message".into(),
                data: "café ✓".into()
            }]
        );
    }
}
