//! Newline framing for the skill/host byte stream.
//!
//! One message per line, built on tokio-util's `AnyDelimiterCodec`:
//!
//! - an over-long line is skipped instead of failing the stream
//! - a trailing `\r` is stripped
//! - an unterminated tail at end of stream is dropped
//! - outgoing text has its newlines escaped

use std::borrow::Cow;
use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

pub const DELIMITER: u8 = b'\n';

const ESCAPED_DELIMITER: &str = "\\n";

/// Largest accepted frame before it is discarded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that splits a byte stream on `\n` and frames outgoing text lines.
///
/// Decoded frames are raw bytes: UTF-8 and JSON validation belong to the
/// envelope layer so that a bad line never tears down the stream.
#[derive(Debug, Clone)]
pub struct LineCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: inner_codec(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn inner_codec(max_length: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(vec![DELIMITER], vec![DELIMITER], max_length)
}

fn into_io(e: AnyDelimiterCodecError) -> io::Error {
    match e {
        AnyDelimiterCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Replace every literal delimiter in `text` with its two-character escape.
///
/// Compact JSON never contains a raw newline (serde_json escapes them inside
/// strings), so for envelopes this is a no-op kept as a framing guarantee.
pub fn escape_delimiters(text: &str) -> Cow<'_, str> {
    if text.as_bytes().contains(&DELIMITER) {
        Cow::Owned(text.replace('\n', ESCAPED_DELIMITER))
    } else {
        Cow::Borrowed(text)
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(mut line)) => {
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    tracing::trace!(frame_bytes = line.len(), "Decoded frame");
                    return Ok(Some(line));
                }
                Ok(None) => return Ok(None),
                // The inner codec is now discarding up to the next delimiter.
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    tracing::warn!(
                        max_length = self.max_length,
                        "Frame exceeds maximum length, discarding until next delimiter"
                    );
                }
                Err(e) => return Err(into_io(e)),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if !buf.is_empty() {
            tracing::debug!(
                dropped_bytes = buf.len(),
                "Stream ended with an unterminated frame"
            );
            buf.clear();
        }
        self.inner = inner_codec(self.max_length);
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = escape_delimiters(&item);
        if line.len() > self.max_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds maximum of {}",
                    line.len(),
                    self.max_length
                ),
            ));
        }

        self.inner.encode(&*line, dst).map_err(into_io)
    }
}
