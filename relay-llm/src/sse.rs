//! Server-sent events: `event:`/`data:` lines separated by a blank line.

use crate::stream::Decoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Buffers raw bytes until a full event is available. Carriage returns are
/// dropped on arrival so `\r\n` framing behaves like `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(idx) = find_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..idx + 2).collect();
            if let Some(event) = parse_event(&raw[..idx]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&raw)
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;

    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        SseDecoder::push(self, bytes)
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        SseDecoder::finish(self).into_iter().collect()
    }
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data.trim().is_empty() {
        return None;
    }
    Some(SseEvent { event, data })
}

/// Parse one data payload, logging and skipping it when it is malformed.
pub(crate) fn parse_data<T: serde::de::DeserializeOwned>(provider: &str, data: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(
                provider,
                error = %e,
                data_len = data.len(),
                "skipping malformed stream line"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_reads_are_reassembled() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\n\ndata: {\"a\":2}\n\n");
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: message_start\r\ndata: {\"x\":true}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"x\":true}");
    }

    #[test]
    fn empty_and_comment_only_events_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\n\ndata: \n\n\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_done_sentinel());
    }

    #[test]
    fn trailing_event_is_flushed_on_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"tail\":1}").is_empty());
        let event = decoder.finish().expect("trailing event");
        assert_eq!(event.data, "{\"tail\":1}");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn multibyte_characters_split_across_reads_survive() {
        let mut decoder = SseDecoder::new();
        let payload = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).expect("multibyte start") + 1;
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events[0].data, "{\"t\":\"héllo\"}");
    }

    #[test]
    fn malformed_json_is_skipped_not_fatal() {
        assert!(parse_data::<serde_json::Value>("openai", "{not json").is_none());
        assert!(parse_data::<serde_json::Value>("openai", "{\"ok\":1}").is_some());
    }
}
