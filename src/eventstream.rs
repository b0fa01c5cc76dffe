//! AWS event-stream framing, as used by Bedrock `converse-stream`.
//!
//! Each message is a binary frame:
//!
//! ```text
//! [total len: u32][headers len: u32][prelude crc: u32][headers][payload][message crc: u32]
//! ```
//!
//! Headers are `[name len: u8][name][value type: u8][value]`. Only string
//! header values are kept; Bedrock sends `:event-type`, `:message-type`
//! and `:exception-type` as strings. CRCs are not verified, TLS already
//! covers transport integrity.

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::TransportError;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
/// Frames above this size are treated as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame length {0}")]
    InvalidLength(usize),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("stream ended inside a frame ({0} bytes pending)")]
    Truncated(usize),
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        TransportError::Read(err.to_string())
    }
}

/// One decoded event-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStreamMessage {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `:event-type`, e.g. `contentBlockDelta`.
    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
    }

    /// `:exception-type` when the frame carries an error.
    pub fn exception_type(&self) -> Option<&str> {
        match self.header(":message-type") {
            Some("exception") | Some("error") => self
                .header(":exception-type")
                .or_else(|| self.header(":error-code")),
            _ => None,
        }
    }
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<EventStreamMessage>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while self.buffer.len() >= PRELUDE_LEN {
            let total = read_u32(&self.buffer[0..4]) as usize;
            if !(PRELUDE_LEN + CRC_LEN..=MAX_FRAME_LEN).contains(&total) {
                return Err(FrameError::InvalidLength(total));
            }
            if self.buffer.len() < total {
                break;
            }
            let frame = self.buffer.split_to(total).freeze();
            messages.push(decode_frame(frame)?);
        }
        Ok(messages)
    }

    /// Fail if the byte stream ended mid-frame.
    pub fn finish(self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated(self.buffer.len()))
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = bytes;
    buf.get_u32()
}

fn decode_frame(mut frame: Bytes) -> Result<EventStreamMessage, FrameError> {
    let total = frame.len();
    frame.advance(4);
    let headers_len = frame.get_u32() as usize;
    frame.advance(4);

    let payload_len = total
        .checked_sub(PRELUDE_LEN + CRC_LEN + headers_len)
        .ok_or(FrameError::InvalidLength(headers_len))?;

    let mut header_bytes = frame.split_to(headers_len);
    let payload = frame.split_to(payload_len);

    let mut headers = HashMap::new();
    while header_bytes.has_remaining() {
        let (name, value) = decode_header(&mut header_bytes)?;
        if let Some(value) = value {
            headers.insert(name, value);
        }
    }

    Ok(EventStreamMessage { headers, payload })
}

fn take(buf: &mut Bytes, len: usize, what: &str) -> Result<Bytes, FrameError> {
    if buf.remaining() < len {
        return Err(FrameError::InvalidHeader(format!("truncated {what}")));
    }
    Ok(buf.split_to(len))
}

fn decode_header(buf: &mut Bytes) -> Result<(String, Option<String>), FrameError> {
    let name_len = take(buf, 1, "name length")?.get_u8() as usize;
    let name = take(buf, name_len, "name")?;
    let name = String::from_utf8_lossy(&name).into_owned();
    let value_type = take(buf, 1, "value type")?.get_u8();

    let value = match value_type {
        0 | 1 => None,
        2 => take(buf, 1, "byte").map(|_| None)?,
        3 => take(buf, 2, "short").map(|_| None)?,
        4 => take(buf, 4, "int").map(|_| None)?,
        5 | 8 => take(buf, 8, "long").map(|_| None)?,
        9 => take(buf, 16, "uuid").map(|_| None)?,
        6 | 7 => {
            let len = take(buf, 2, "value length")?.get_u16() as usize;
            let value = take(buf, len, "value")?;
            (value_type == 7).then(|| String::from_utf8_lossy(&value).into_owned())
        }
        other => return Err(FrameError::InvalidHeader(format!("unknown value type {other}"))),
    };
    Ok((name, value))
}

/// Decode a byte stream into event-stream messages.
pub fn wrap_eventstream<S, E>(bytes: S) -> impl Stream<Item = Result<EventStreamMessage, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: From<FrameError> + Send,
{
    async_stream::try_stream! {
        let mut decoder = EventStreamDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for message in decoder.feed(&chunk)? {
                yield message;
            }
        }
        decoder.finish()?;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::BufMut;

    /// Encode a frame with string headers. CRCs are left zeroed.
    pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = BytesMut::new();
        for (name, value) in headers {
            header_bytes.put_u8(name.len() as u8);
            header_bytes.put_slice(name.as_bytes());
            header_bytes.put_u8(7);
            header_bytes.put_u16(value.len() as u16);
            header_bytes.put_slice(value.as_bytes());
        }
        let total = PRELUDE_LEN + header_bytes.len() + payload.len() + CRC_LEN;
        let mut frame = BytesMut::new();
        frame.put_u32(total as u32);
        frame.put_u32(header_bytes.len() as u32);
        frame.put_u32(0);
        frame.put_slice(&header_bytes);
        frame.put_slice(payload);
        frame.put_u32(0);
        frame.to_vec()
    }

    pub(crate) fn event(event_type: &str, payload: &str) -> Vec<u8> {
        encode_frame(
            &[(":message-type", "event"), (":event-type", event_type)],
            payload.as_bytes(),
        )
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = EventStreamDecoder::new();
        let messages = decoder.feed(&event("messageStart", "{\"role\":\"assistant\"}")).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_type(), Some("messageStart"));
        assert_eq!(messages[0].payload.as_ref(), b"{\"role\":\"assistant\"}");
        assert_eq!(messages[0].exception_type(), None);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let mut bytes = event("contentBlockDelta", "{\"a\":1}");
        bytes.extend(event("messageStop", "{}"));

        for split in 0..bytes.len() {
            let mut decoder = EventStreamDecoder::new();
            let mut messages = decoder.feed(&bytes[..split]).unwrap();
            messages.extend(decoder.feed(&bytes[split..]).unwrap());
            let types: Vec<_> = messages.iter().filter_map(|m| m.event_type()).collect();
            assert_eq!(types, vec!["contentBlockDelta", "messageStop"], "split at {split}");
        }
    }

    #[test]
    fn test_exception_frame() {
        let bytes = encode_frame(
            &[(":message-type", "exception"), (":exception-type", "throttlingException")],
            b"{\"message\":\"Too many requests\"}",
        );
        let messages = EventStreamDecoder::new().feed(&bytes).unwrap();
        assert_eq!(messages[0].exception_type(), Some("throttlingException"));
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = event("messageStop", "{}");
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.feed(&bytes[..bytes.len() - 3]).unwrap().is_empty());
        assert!(matches!(decoder.finish(), Err(FrameError::Truncated(_))));
    }

    #[test]
    fn test_invalid_length() {
        let mut decoder = EventStreamDecoder::new();
        let err = decoder.feed(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FrameError::InvalidLength(1));
    }
}
