//! Incremental decoding of a server-sent-events byte stream.
//!
//! The proxy delivers three kinds of frames: unnamed `message` frames with
//! JSON payloads, an `endpoint` frame whose data is a plain path, and a
//! `tools` frame carrying a JSON array. Frames are separated by a blank
//! line; a frame may span several transport chunks.

/// Accumulates raw transport chunks and yields complete event frames.
/// Bytes stay undecoded until a full frame is available: a multibyte
/// code point may arrive split across chunks, and the blank-line frame
/// separators are ASCII, so boundary search is safe on raw bytes.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until one is fully buffered.
    pub fn next_event_block(&mut self) -> Option<String> {
        let lf = find_subsequence(&self.buffer, b"\n\n");
        let crlf = find_subsequence(&self.buffer, b"\r\n\r\n");
        let (boundary, width) = match (lf, crlf) {
            (Some(lf), Some(crlf)) if crlf < lf => (crlf, 4),
            (Some(lf), _) => (lf, 2),
            (None, Some(crlf)) => (crlf, 4),
            (None, None) => return None,
        };
        let remaining = self.buffer.split_off(boundary + width);
        let event_block = std::mem::replace(&mut self.buffer, remaining);
        Some(String::from_utf8_lossy(&event_block).into_owned())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// One decoded frame: the `event:` name if any, and the joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

/// Decode a complete frame. Returns `None` for frames without any data
/// line (keepalive comments and the like).
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut name = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = field_value(line, "event") {
            name = Some(value.to_string());
        } else if let Some(value) = field_value(line, "data") {
            data_lines.push(value);
        }
        // id:, retry:, and comment lines are not used by the bridge.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        name,
        data: data_lines.join("\n"),
    })
}

/// `"data: x"` / `"data:x"` field syntax; one optional leading space is
/// part of the separator, further whitespace belongs to the value.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::{SseBuffer, SseEvent, parse_event};

    #[test]
    fn next_event_block_returns_complete_frames_only() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: first\n\npartial");

        assert_eq!(
            buffer.next_event_block().as_deref(),
            Some("data: first\n\n")
        );
        assert!(buffer.next_event_block().is_none());

        buffer.push_chunk(b"ly\n\n");
        assert_eq!(buffer.next_event_block().as_deref(), Some("partially\n\n"));
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let frame = "data: café\n\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = frame.len() - 3;

        let mut buffer = SseBuffer::new();
        buffer.push_chunk(&frame[..split]);
        assert!(buffer.next_event_block().is_none());

        buffer.push_chunk(&frame[split..]);
        let block = buffer.next_event_block().expect("complete frame");
        let event = parse_event(&block).expect("data line present");
        assert_eq!(event.data, "café");
    }

    #[test]
    fn next_event_block_accepts_crlf_separators() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"event: endpoint\r\ndata: /msg?s=abc\r\n\r\n");

        let block = buffer.next_event_block().expect("complete frame");
        let event = parse_event(&block).expect("data line present");
        assert_eq!(event.name.as_deref(), Some("endpoint"));
        assert_eq!(event.data, "/msg?s=abc");
    }

    #[test]
    fn parse_event_reads_name_and_joins_data_lines() {
        let event = parse_event("event: tools\ndata: [{\"name\":\ndata: \"echo\"}]\n\n");
        assert_eq!(
            event,
            Some(SseEvent {
                name: Some("tools".to_string()),
                data: "[{\"name\":\n\"echo\"}]".to_string(),
            })
        );
    }

    #[test]
    fn parse_event_defaults_to_unnamed_message() {
        let event = parse_event("data: {\"id\":7}\n\n").expect("data line present");
        assert_eq!(event.name, None);
        assert_eq!(event.data, "{\"id\":7}");
    }

    #[test]
    fn parse_event_skips_frames_without_data() {
        assert_eq!(parse_event(": keepalive\n\n"), None);
        assert_eq!(parse_event("event: ping\n\n"), None);
    }

    #[test]
    fn field_syntax_tolerates_missing_space() {
        let event = parse_event("data:tight\n\n").expect("data line present");
        assert_eq!(event.data, "tight");
    }
}
