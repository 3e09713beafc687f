//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message schema helpers and protocol codecs."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Newline-delimited JSON framing.
//!
//! Every frame is one JSON document followed by `\n`. Readers cap a single
//! frame at [`MAX_FRAME_BYTES`] so a misbehaving peer cannot grow a buffer
//! without bound.
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{MessagingError, Result};

/// Upper bound on a single encoded frame, delimiter included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Encode a value as a single newline-terminated frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one frame, tolerating surrounding whitespace and the delimiter.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(trim_ascii(bytes))?)
}

/// Encode and write one frame, returning the number of bytes put on the wire.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<usize>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(value)?;
    writer.write_all(&bytes).await?;
    Ok(bytes.len())
}

/// Buffered reader yielding one decoded frame at a time.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buffer: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader using [`MAX_FRAME_BYTES`] as the frame limit.
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_BYTES)
    }

    /// Wrap a reader with a custom frame limit.
    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buffer: Vec::with_capacity(512),
            limit: limit.max(1),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream and skips blank lines. A
    /// frame that fails to decode is consumed in full, so the caller may keep
    /// reading after a [`MessagingError::Json`]. [`MessagingError::FrameTooLarge`]
    /// leaves the stream misaligned and the connection should be dropped.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<(T, usize)>> {
        loop {
            self.buffer.clear();
            let budget = (self.limit as u64).saturating_add(1);
            let read = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.buffer)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if read > self.limit {
                return Err(MessagingError::FrameTooLarge { limit: self.limit });
            }
            let line = trim_ascii(&self.buffer);
            if line.is_empty() {
                continue;
            }
            let value = serde_json::from_slice(line)?;
            return Ok(Some((value, read)));
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, SensorType, SensorValue};
    use crate::Measurement;

    #[test]
    fn encoded_frame_is_single_line() {
        let message = Message::from(Measurement::new(
            SensorType::Humidity,
            SensorValue::Numeric(75.0),
        ));
        let bytes = encode_frame(&message).expect("encode");
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded: Message = decode_frame(&bytes).expect("decode");
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_reports_sizes() {
        let input = b"\n{\"message_type\":\"heartbeat\"}\r\n\n".to_vec();
        let mut reader = FrameReader::new(input.as_slice());
        let (message, size) = reader
            .next_frame::<Message>()
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(message, Message::Heartbeat);
        assert_eq!(size, "{\"message_type\":\"heartbeat\"}\r\n".len());
        assert!(reader.next_frame::<Message>().await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn malformed_frame_does_not_poison_stream() {
        let input = b"not json\n{\"message_type\":\"heartbeat\"}\n".to_vec();
        let mut reader = FrameReader::new(input.as_slice());
        let err = reader.next_frame::<Message>().await.unwrap_err();
        assert!(matches!(err, MessagingError::Json(_)));
        let (message, _) = reader
            .next_frame::<Message>()
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(message, Message::Heartbeat);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let input = vec![b'a'; 64];
        let mut reader = FrameReader::with_limit(input.as_slice(), 16);
        let err = reader.next_frame::<Message>().await.unwrap_err();
        assert!(matches!(err, MessagingError::FrameTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn final_frame_without_delimiter_is_accepted() {
        let input = b"{\"message_type\":\"heartbeat\"}".to_vec();
        let mut reader = FrameReader::new(input.as_slice());
        let frame = reader.next_frame::<Message>().await.expect("read");
        assert!(matches!(frame, Some((Message::Heartbeat, _))));
    }
}
