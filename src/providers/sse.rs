//! Minimal Server-Sent Events framing shared by the adapters.
//!
//! Provider bodies arrive as arbitrary byte chunks; events are delimited by a
//! blank line. Each adapter feeds raw chunks in and drains complete `data:`
//! payloads out, then parses the payload JSON in its own wire format.

use bytes::BytesMut;

/// Incremental buffer that reassembles SSE events across chunk boundaries.
///
/// Bytes are buffered raw and decoded one complete event at a time. The event
/// delimiter is ASCII, so a multi-byte character split across two network
/// chunks is whole again by the time its event is decoded.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: BytesMut,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete event's data payload, if one is buffered. Multiple
    /// `data:` lines in one event are joined with newlines; comment and
    /// `event:` lines are dropped.
    pub fn next_data(&mut self) -> Option<String> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
            let block = self.buf.split_to(end + 2);
            let block = String::from_utf8_lossy(&block);
            if let Some(data) = extract_data(&block) {
                return Some(data);
            }
            // Block carried no data lines (comment or bare event); keep going.
        }
    }

    /// Data from a trailing block the upstream closed without terminating.
    pub fn finish(&mut self) -> Option<String> {
        let tail = self.buf.split();
        let tail = String::from_utf8_lossy(&tail);
        if tail.trim().is_empty() {
            return None;
        }
        extract_data(&tail)
    }
}

fn extract_data(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        match &mut data {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(rest);
            }
            None => data = Some(rest.to_string()),
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_events_across_chunk_boundaries() {
        let mut buf = SseBuffer::new();
        buf.push(b"data: {\"a\":");
        assert_eq!(buf.next_data(), None);
        buf.push(b"1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(buf.next_data().as_deref(), Some("{\"a\":1}"));
        assert_eq!(buf.next_data().as_deref(), Some("{\"b\":2}"));
        assert_eq!(buf.next_data(), None);
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let event = "data: café time\n\n".as_bytes();
        // Split between the two bytes of the 'é'.
        let split = event.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let (first, second) = event.split_at(split);

        let mut buf = SseBuffer::new();
        buf.push(first);
        assert_eq!(buf.next_data(), None);
        buf.push(second);
        assert_eq!(buf.next_data().as_deref(), Some("café time"));
    }

    #[test]
    fn skips_comment_and_event_lines() {
        let mut buf = SseBuffer::new();
        buf.push(b": keep-alive\n\nevent: ping\n\nevent: message\ndata: hello\n\n");
        assert_eq!(buf.next_data().as_deref(), Some("hello"));
        assert_eq!(buf.next_data(), None);
    }

    #[test]
    fn joins_multiline_data() {
        let mut buf = SseBuffer::new();
        buf.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(buf.next_data().as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn finish_drains_unterminated_tail() {
        let mut buf = SseBuffer::new();
        buf.push(b"data: done\n\ndata: tail");
        assert_eq!(buf.next_data().as_deref(), Some("done"));
        assert_eq!(buf.finish().as_deref(), Some("tail"));
        assert_eq!(buf.finish(), None);

        let mut empty = SseBuffer::new();
        assert_eq!(empty.finish(), None);
    }
}
