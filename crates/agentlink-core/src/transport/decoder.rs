//! Incremental decoding of line-structured backend output.
//!
//! Output arrives in arbitrary chunks. Bytes are buffered until a `\n`
//! terminates a line; only complete lines are decoded. Buffering bytes rather
//! than text keeps multi-byte characters intact across chunk boundaries.

use tracing::debug;

use crate::core::classify::ThinkingClassifier;
use crate::core::events::StreamEvent;
use crate::transport::protocol::BackendMessage;

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, without the
    /// terminator. The trailing fragment stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Drains the unterminated trailing fragment, if non-empty.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Turns raw output chunks into stream events.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineBuffer,
    classifier: ThinkingClassifier,
}

impl StreamDecoder {
    pub fn new(classifier: ThinkingClassifier) -> Self {
        Self {
            lines: LineBuffer::new(),
            classifier,
        }
    }

    /// Decodes every line completed by `chunk`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.lines
            .push(chunk)
            .iter()
            .flat_map(|line| self.decode_line(line))
            .collect()
    }

    /// Flushes the trailing fragment at end of stream.
    ///
    /// A fragment that starts a JSON object but does not parse is a
    /// half-written message and is dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let Some(line) = self.lines.finish() else {
            return Vec::new();
        };
        if line.trim_start().starts_with('{')
            && serde_json::from_str::<serde_json::Value>(&line).is_err()
        {
            debug!("Dropping truncated message at end of output: {line}");
            return Vec::new();
        }
        self.decode_line(&line)
    }

    /// Decodes one complete line.
    ///
    /// Structured lines map through the protocol; anything else is free text,
    /// classified as thinking or text with its newline restored.
    pub fn decode_line(&self, line: &str) -> Vec<StreamEvent> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        if let Some(message) = BackendMessage::parse_line(line) {
            return message.into_events();
        }

        let kind = self.classifier.classify(line);
        vec![StreamEvent::new(kind, format!("{line}\n"))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::StreamEventKind;

    const SCRIPT: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s-1"}"#,
        "\n",
        "Let me look around\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello wörld"}]}}"#,
        "\n",
        "\n",
        r#"{"type":"telemetry","n":1}"#,
        "\n",
        r#"{"type":"result","subtype":"success","result":"Done."}"#,
        "\n",
    );

    fn decode_in_chunks(input: &[u8], size: usize) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::default();
        let mut events = Vec::new();
        for chunk in input.chunks(size) {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn chunking_does_not_change_events() {
        let whole = decode_in_chunks(SCRIPT.as_bytes(), SCRIPT.len());
        for size in [1, 2, 3, 7, 64] {
            assert_eq!(decode_in_chunks(SCRIPT.as_bytes(), size), whole, "size {size}");
        }
    }

    #[test]
    fn script_maps_to_expected_kinds() {
        let events = decode_in_chunks(SCRIPT.as_bytes(), 5);
        let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Progress,
                StreamEventKind::Thinking,
                StreamEventKind::Text,
                StreamEventKind::Text,
                StreamEventKind::Text,
                StreamEventKind::Complete,
            ]
        );
        assert_eq!(events[1].content, "Let me look around\n");
        assert_eq!(events[2].content, "Hello wörld");
        assert_eq!(events[3].content, "{\"type\":\"telemetry\",\"n\":1}\n");
        assert_eq!(events[4].content, "Done.");
    }

    #[test]
    fn fragment_is_not_parsed_before_newline() {
        let mut decoder = StreamDecoder::default();
        assert!(decoder.push(br#"{"type":"result","subtype":"suc"#).is_empty());
        assert!(decoder.push(br#"cess","result":"ok"}"#).is_empty());
        let events = decoder.push(b"\n");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn trailing_fragment_is_flushed_at_eof() {
        let mut decoder = StreamDecoder::default();
        assert!(decoder.push(b"final words").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "final words\n");
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn truncated_json_fragment_is_dropped_at_eof() {
        let mut decoder = StreamDecoder::default();
        assert!(
            decoder
                .push(br#"{"type":"assistant","message":{"content":[{"type":"te"#)
                .is_empty()
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn complete_json_fragment_is_decoded_at_eof() {
        let mut decoder = StreamDecoder::default();
        assert!(decoder.push(br#"{"type":"result","subtype":"success","result":"ok"}"#).is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[test]
    fn crlf_lines_are_trimmed() {
        let mut lines = LineBuffer::new();
        assert_eq!(lines.push(b"a\r\nb\r\n"), vec!["a", "b"]);
        assert!(!lines.has_pending());
    }

    #[test]
    fn blank_lines_produce_nothing() {
        let decoder = StreamDecoder::default();
        assert!(decoder.decode_line("").is_empty());
        assert!(decoder.decode_line("   ").is_empty());
    }
}
