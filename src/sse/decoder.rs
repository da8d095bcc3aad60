//! Incremental decoder for the `text/event-stream` wire format.

use crate::error::{SyncError, SyncResult};

/// Longest line, and longest joined `data`, accepted by [`SseDecoder::new`].
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

/// One dispatched server-push frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// The `event:` name; `None` means the default `message` event.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseFrame {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// The event name, unless it is the default `message` event.
    pub fn named_event(&self) -> Option<&str> {
        self.event
            .as_deref()
            .filter(|name| !name.is_empty() && *name != "message")
    }
}

/// Accepts body chunks split at arbitrary byte boundaries and yields complete frames.
///
/// Lines end with `\n`, `\r\n` or a bare `\r`.
#[derive(Debug)]
pub struct SseDecoder {
    max_line: usize,
    line: Vec<u8>,
    /// The previous byte was a `\r`, so a following `\n` belongs to the same terminator.
    after_cr: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
    retry: Option<u64>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that fails once a line, or a frame's joined data, exceeds `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line,
            line: Vec::new(),
            after_cr: false,
            event: None,
            data: String::new(),
            has_data: false,
            id: None,
            retry: None,
        }
    }

    /// Feeds one body chunk. An oversized line or frame is an error, after
    /// which the connection should be dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> SyncResult<Vec<SseFrame>> {
        let mut frames = Vec::new();
        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => {
                    let line = std::mem::take(&mut self.line);
                    if let Some(frame) = self.process_line(&String::from_utf8_lossy(&line)) {
                        frames.push(frame);
                    }
                    if self.data.len() > self.max_line {
                        return Err(SyncError::Oversized(self.max_line));
                    }
                }
                _ => {
                    if self.line.len() >= self.max_line {
                        return Err(SyncError::Oversized(self.max_line));
                    }
                    self.line.push(byte);
                }
            }
        }
        Ok(frames)
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // heartbeat
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.id = Some(value.to_owned()),
            "retry" => self.retry = value.parse().ok(),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let retry = self.retry.take();
        let id = self.id.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data),
            id,
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b"event: notification\ndata: {\"type\":\"x\"}\nid: 7\n\n")
            .unwrap();
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("notification".into()),
                data: "{\"type\":\"x\"}".into(),
                id: Some("7".into()),
                retry: None,
            }]
        );
        assert_eq!(frames[0].named_event(), Some("notification"));
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").unwrap().is_empty());
        assert!(decoder.feed(b"ta: {\"type\":").unwrap().is_empty());
        assert!(decoder.feed(b"\"planning\"}\r\n").unwrap().is_empty());
        let frames = decoder.feed(b"\r\n").unwrap();
        assert_eq!(frames, vec![SseFrame::message("{\"type\":\"planning\"}")]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b": keep-alive\n\ndata: first\ndata:second\nretry: 2500\n\n")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "first\nsecond");
        assert_eq!(frames[0].retry, Some(2500));
        assert_eq!(frames[0].named_event(), None);
    }

    #[test]
    fn test_frames_without_data_are_not_dispatched() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: ping\n\n").unwrap().is_empty());
        let frames = decoder.feed(b"data: ok\n\n").unwrap();
        // The event name of the dropped frame does not leak into the next one.
        assert_eq!(frames, vec![SseFrame::message("ok")]);
    }

    #[test]
    fn test_bare_carriage_return_ends_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: meteo.alert\rdata: {}\r\r").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].named_event(), Some("meteo.alert"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn test_crlf_split_across_chunks_is_one_terminator() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: a\r").unwrap().is_empty());
        // The `\n` completes the previous `\r`; the blank line dispatches.
        assert!(decoder.feed(b"\n").unwrap().is_empty());
        let frames = decoder.feed(b"\r\n").unwrap();
        assert_eq!(frames, vec![SseFrame::message("a")]);
    }

    #[test]
    fn test_unterminated_line_is_bounded() {
        let mut decoder = SseDecoder::with_max_line(16);
        assert!(decoder.feed(b"data: 0123456789").unwrap().is_empty());
        let err = decoder.feed(b"abcdef").unwrap_err();
        assert!(matches!(err, SyncError::Oversized(16)));
    }

    #[test]
    fn test_oversized_frame_data_is_bounded() {
        let mut decoder = SseDecoder::with_max_line(16);
        assert!(decoder.feed(b"data: 0123456789\n").unwrap().is_empty());
        let err = decoder.feed(b"data: 0123456789\n").unwrap_err();
        assert!(matches!(err, SyncError::Oversized(16)));
    }
}
