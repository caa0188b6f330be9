//! Decoding of the server-sent event stream returned by the chat endpoint.
//!
//! The server frames each event as a block of `data:` lines terminated by a
//! blank line. Blocks may be split across network chunks at any byte, so the
//! decoder buffers partial lines and only dispatches a block once its blank
//! line terminator has been seen.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tracing::debug;

use crate::api::{ChatResponse, StreamFrame};
use crate::core::transport::ByteStream;

/// Longest partial line kept while waiting for its newline.
pub const MAX_PENDING_LINE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

/// Incremental SSE decoder. Feed raw chunks with [`StreamDecoder::push`].
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    skipping_line: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `Done` or `Error` event was produced or the input ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = &line[..line.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if self.skipping_line {
                self.skipping_line = false;
                continue;
            }

            if let Some(event) = self.process_line(line) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finish();
                    break;
                }
            }
        }

        if self.buffer.len() > MAX_PENDING_LINE_BYTES {
            debug!(
                buffered_bytes = self.buffer.len(),
                "Dropping oversized stream line"
            );
            self.buffer.clear();
            self.skipping_line = true;
        }

        events
    }

    /// Marks the input as ended. A block without its terminator is dropped.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() || !self.data_lines.is_empty() {
            debug!(
                buffered_bytes = self.buffer.len(),
                pending_lines = self.data_lines.len(),
                "Discarding incomplete stream frame"
            );
        }
        self.buffer.clear();
        self.data_lines.clear();
        self.finished = true;
    }

    fn process_line(&mut self, line: &[u8]) -> Option<StreamEvent> {
        if line.is_empty() {
            return self.dispatch_block();
        }

        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "Dropping stream line with invalid UTF-8");
                return None;
            }
        };

        if line.starts_with(':') {
            return None;
        }

        if let Some(payload) = extract_data_payload(line) {
            self.data_lines.push(payload.to_string());
        }
        None
    }

    fn dispatch_block(&mut self) -> Option<StreamEvent> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        parse_payload(&payload)
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn parse_payload(payload: &str) -> Option<StreamEvent> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(StreamEvent::Done);
    }

    if let Ok(frame) = serde_json::from_str::<StreamFrame>(payload) {
        return match frame {
            StreamFrame::Delta { content } if content.is_empty() => None,
            StreamFrame::Delta { content } => Some(StreamEvent::TextDelta(content)),
            StreamFrame::Done => Some(StreamEvent::Done),
            StreamFrame::Error { message } if message.trim().is_empty() => {
                Some(StreamEvent::Error("unknown server error".to_string()))
            }
            StreamFrame::Error { message } => Some(StreamEvent::Error(message)),
        };
    }

    if let Ok(response) = serde_json::from_str::<ChatResponse>(payload) {
        let choice = response.choices.into_iter().next()?;
        if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
            return Some(StreamEvent::TextDelta(content));
        }
        return match choice.finish_reason.as_deref() {
            Some("stop") => Some(StreamEvent::Done),
            _ => None,
        };
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if value.get("error").is_some() {
            let message =
                extract_error_summary(&value).unwrap_or_else(|| format_api_error(payload));
            return Some(StreamEvent::Error(message));
        }
    }

    debug!(payload_len = payload.len(), "Dropping unrecognized stream frame");
    None
}

struct DecodeState {
    bytes: ByteStream,
    decoder: StreamDecoder,
    ready: VecDeque<StreamEvent>,
}

/// Lazily decodes a byte stream into events. The returned stream ends after
/// the first terminal event or when the bytes run out; dropping it closes the
/// underlying response.
pub fn decode_stream(bytes: ByteStream) -> impl Stream<Item = StreamEvent> + Send {
    let state = DecodeState {
        bytes,
        decoder: StreamDecoder::new(),
        ready: VecDeque::new(),
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((event, state));
            }
            if state.decoder.is_finished() {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.decoder.push(&chunk)),
                Some(Err(err)) => {
                    state.decoder.finish();
                    return Some((StreamEvent::Error(err.to_string()), state));
                }
                None => {
                    state.decoder.finish();
                    return None;
                }
            }
        }
    })
}

pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TransportError;

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk));
        }
        decoder.finish();
        events
    }

    fn deltas(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::TextDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    const SAMPLE: &str = concat!(
        "data: {\"type\":\"delta\",\"content\":\"Hi\"}\n\n",
        "data: {\"type\":\"delta\",\"content\":\" there\"}\n\n",
        "data: {\"type\":\"delta\",\"content\":\", caf\u{e9}\"}\n\n",
        "data: {\"type\":\"done\"}\n\n",
    );

    #[test]
    fn data_lines_accept_spacing_variants() {
        let events = decode_all(&[
            b"data: {\"type\":\"delta\",\"content\":\"Hello\"}\n\n",
            b"data:{\"type\":\"delta\",\"content\":\"World\"}\n\n",
            b"data:[DONE]\n\n",
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hello".into()),
                StreamEvent::TextDelta("World".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn rechunking_at_every_split_point_preserves_content() {
        let bytes = SAMPLE.as_bytes();
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            let events = decode_all(&[head, tail]);
            assert_eq!(deltas(&events), "Hi there, café", "split at {split}");
            assert_eq!(events.last(), Some(&StreamEvent::Done), "split at {split}");
        }

        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        let events = decode_all(&single_bytes);
        assert_eq!(deltas(&events), "Hi there, café");
    }

    #[test]
    fn frames_wait_for_blank_line_terminator() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder
            .push(b"data: {\"type\":\"delta\",\"content\":\"Hi\"}\n")
            .is_empty());
        assert_eq!(
            decoder.push(b"\n"),
            vec![StreamEvent::TextDelta("Hi".into())]
        );
    }

    #[test]
    fn crlf_delimiters_are_tolerated() {
        let events = decode_all(&[
            b"data: {\"type\":\"delta\",\"content\":\"Hi\"}\r\n\r\n",
            b"data: [DONE]\r\n\r\n",
        ]);
        assert_eq!(
            events,
            vec![StreamEvent::TextDelta("Hi".into()), StreamEvent::Done]
        );
    }

    #[test]
    fn multi_line_data_blocks_are_joined() {
        let events = decode_all(&[
            b"event: message\ndata: {\"type\":\"delta\",\ndata: \"content\":\"joined\"}\n\n",
        ]);
        assert_eq!(events, vec![StreamEvent::TextDelta("joined".into())]);
    }

    #[test]
    fn malformed_frames_are_dropped_without_failing() {
        let events = decode_all(&[
            b": keep-alive\n\n",
            b"data: {not json\n\n",
            b"data: {\"unexpected\":true}\n\n",
            b"data: \xff\xfe\n\n",
            b"data: {\"type\":\"delta\",\"content\":\"ok\"}\n\n",
        ]);
        assert_eq!(events, vec![StreamEvent::TextDelta("ok".into())]);
    }

    #[test]
    fn bytes_after_done_are_ignored() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.push(
            b"data: {\"type\":\"done\"}\n\ndata: {\"type\":\"delta\",\"content\":\"late\"}\n\n",
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.is_finished());
        assert!(decoder
            .push(b"data: {\"type\":\"delta\",\"content\":\"later\"}\n\n")
            .is_empty());
    }

    #[test]
    fn error_frame_terminates_decoding() {
        let events = decode_all(&[
            b"data: {\"type\":\"delta\",\"content\":\"Hi\"}\n\n",
            b"data: {\"type\":\"error\",\"message\":\"boom\"}\n\n",
            b"data: {\"type\":\"delta\",\"content\":\"ignored\"}\n\n",
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hi".into()),
                StreamEvent::Error("boom".into()),
            ]
        );
    }

    #[test]
    fn openai_style_chunks_and_errors_are_understood() {
        let events = decode_all(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":null}]}\n\n",
            b"data: {\"error\":{\"message\":\"internal   server error\"}}\n\n",
        ]);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hel".into()),
                StreamEvent::Error("internal server error".into()),
            ]
        );

        let events = decode_all(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        ]);
        assert_eq!(
            events,
            vec![StreamEvent::TextDelta("lo".into()), StreamEvent::Done]
        );
    }

    #[test]
    fn oversized_line_is_dropped_without_losing_later_frames() {
        let mut decoder = StreamDecoder::new();
        let mut huge = b"data: ".to_vec();
        huge.resize(MAX_PENDING_LINE_BYTES + 16, b'x');
        assert!(decoder.push(&huge).is_empty());
        assert!(decoder.push(b"more of the same line").is_empty());

        let events = decoder.push(b"xx\n\ndata: {\"type\":\"delta\",\"content\":\"ok\"}\n\n");
        assert_eq!(events, vec![StreamEvent::TextDelta("ok".into())]);
        assert!(!decoder.is_finished());
    }

    #[test]
    fn incomplete_trailing_frame_is_discarded() {
        let events = decode_all(&[
            b"data: {\"type\":\"delta\",\"content\":\"kept\"}\n\n",
            b"data: {\"type\":\"delta\",\"content\":\"lost\"}",
        ]);
        assert_eq!(events, vec![StreamEvent::TextDelta("kept".into())]);
    }

    #[tokio::test]
    async fn decode_stream_yields_events_lazily_and_stops_at_done() {
        let chunks: Vec<Result<Vec<u8>, TransportError>> = vec![
            Ok(b"data: {\"type\":\"delta\",\"content\":\"Hi\"}\n".to_vec()),
            Ok(b"\ndata: {\"type\":\"done\"}\n\n".to_vec()),
            Ok(b"data: {\"type\":\"delta\",\"content\":\"late\"}\n\n".to_vec()),
        ];
        let bytes: ByteStream = Box::pin(futures_util::stream::iter(chunks));
        let events: Vec<StreamEvent> = decode_stream(bytes).collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::TextDelta("Hi".into()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn transport_failure_mid_body_becomes_error_event() {
        let chunks: Vec<Result<Vec<u8>, TransportError>> = vec![
            Ok(b"data: {\"type\":\"delta\",\"content\":\"Hi\"}\n\n".to_vec()),
            Err(TransportError::Body("connection reset".into())),
        ];
        let bytes: ByteStream = Box::pin(futures_util::stream::iter(chunks));
        let events: Vec<StreamEvent> = decode_stream(bytes).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], StreamEvent::Error(msg) if msg.contains("connection reset")));
    }

    #[test]
    fn format_api_error_prettifies_json_with_summary() {
        let raw = r#"{"error":{"message":"model overloaded","type":"invalid_request_error"}}"#;
        let formatted = format_api_error(raw);

        let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
        assert_eq!(formatted, expected);
    }

    #[test]
    fn format_api_error_handles_xml_and_plaintext() {
        assert_eq!(
            format_api_error("<error>bad</error>"),
            "API Error:\n```xml\n<error>bad</error>\n```"
        );
        assert_eq!(
            format_api_error("api failure"),
            "API Error:\n```\napi failure\n```"
        );
        assert_eq!(format_api_error("  "), "API Error:\n```\n<empty>\n```");
    }
}
