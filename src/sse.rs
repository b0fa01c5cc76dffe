//! Server-Sent Events (SSE) stream processing.
//!
//! Provider byte streams arrive in arbitrary chunks: an event may be split
//! mid-keyword or mid UTF-8 sequence, and a single chunk may carry several
//! events. [`wrap_sse`] re-chunks such a stream into complete `data:`
//! payloads.
//!
//! SSE format:
//! ```text
//! event: message
//! data: {"key": "value"}
//!
//! : keep-alive comment
//! data: {"another": "event"}
//!
//! data: [DONE]
//! ```

use bytes::Bytes;
use futures::{Stream, StreamExt};

/// Incremental SSE decoder.
///
/// Works on raw bytes and only decodes complete lines, so UTF-8 sequences
/// split across chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Option<Vec<u8>>,
    done: bool,
}

/// One decoded SSE item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` end-of-stream marker.
    Done,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(pos) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let line = strip_cr(&self.buffer[consumed..end]).to_vec();
            consumed = end + 1;
            if let Some(event) = self.process_line(&line) {
                let is_done = event == SseEvent::Done;
                events.push(event);
                if is_done {
                    self.done = true;
                    break;
                }
            }
        }
        self.buffer.drain(..consumed);
        events
    }

    /// Flush what is left once the byte stream ended.
    pub fn finish(mut self) -> Vec<SseEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            events.extend(self.process_line(strip_cr(&line)));
        }
        events.extend(self.dispatch());
        events
    }

    fn process_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = parse_data_line(line) {
            let data = self.data.get_or_insert_with(Vec::new);
            if !data.is_empty() {
                data.push(b'\n');
            }
            data.extend_from_slice(value);
        }
        // Comments, `event:`, `id:` and `retry:` lines carry nothing we use.
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let data = self.data.take()?;
        let data = String::from_utf8_lossy(&data).into_owned();
        if is_done_marker(&data) {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data(data))
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Extract the value of a `data:` line, dropping a single leading space.
///
/// # Example
/// ```
/// use anotherai::sse::parse_data_line;
///
/// assert_eq!(parse_data_line(b"data: {\"a\":1}"), Some(&b"{\"a\":1}"[..]));
/// assert_eq!(parse_data_line(b"data:x"), Some(&b"x"[..]));
/// assert_eq!(parse_data_line(b"event: ping"), None);
/// ```
pub fn parse_data_line(line: &[u8]) -> Option<&[u8]> {
    if line == b"data" {
        return Some(&[]);
    }
    let value = line.strip_prefix(b"data:")?;
    Some(value.strip_prefix(b" ").unwrap_or(value))
}

/// Check if an SSE payload is the end-of-stream marker.
pub fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Re-chunk a byte stream into complete SSE `data:` payloads.
///
/// Payloads are yielded in order. The stream ends at `[DONE]` or when the
/// byte stream ends; a byte stream error is yielded once and ends the stream.
pub fn wrap_sse<S, E>(bytes: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Send,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.feed(&chunk) {
                        match event {
                            SseEvent::Data(data) => yield Ok(data),
                            SseEvent::Done => return,
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        for event in decoder.finish() {
            if let SseEvent::Data(data) = event {
                yield Ok(data);
            }
        }
    }
}
