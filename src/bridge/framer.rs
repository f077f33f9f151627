//! Stream framer for tool stdout.
//!
//! Tools behind the bridge write JSON objects back to back with no delimiter
//! guarantee: a single read may hold half an object, several objects, or an
//! object split in the middle of a string escape. [`JsonObjectCodec`] turns
//! that byte stream into complete [`serde_json::Value`]s by tracking brace
//! depth, string mode and escapes across chunk boundaries.
//!
//! # Usage
//!
//! Use [`JsonObjectCodec`] with [`tokio_util::codec::FramedRead`] for the
//! inbound direction. The same codec encodes outbound values as compact
//! JSON followed by `\n`, which is what tools expect on stdin.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use stdio_bridge::bridge::framer::JsonObjectCodec;
//!
//! let values = FramedRead::new(child_stdout, JsonObjectCodec::new());
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Largest unfinished object the codec will buffer: 8 MiB.
///
/// An object still open past this size is discarded so a tool that never
/// closes its braces cannot grow the buffer without bound.
pub const MAX_OBJECT_BYTES: usize = 8 * 1024 * 1024;

/// Delimiter-free JSON object codec.
///
/// # Decoder
///
/// Bytes before the first `{` are discarded. From there the decoder scans
/// for the matching `}`; braces inside string literals are ignored and a
/// backslash-escaped quote does not end a string. The scan position is
/// kept between calls, so every byte is inspected once no matter how the
/// stream is chunked.
///
/// A balanced span that fails to parse is logged and dropped; decoding
/// continues with the bytes after it. Malformed input never surfaces as a
/// decoder error, only I/O failures do.
///
/// # Encoder
///
/// Values are written as compact JSON terminated by `\n`.
#[derive(Debug, Default)]
pub struct JsonObjectCodec {
    /// Buffer offset where the next scan resumes.
    cursor: usize,
    /// Whether the buffer currently starts with an open `{`.
    in_object: bool,
    /// Current brace nesting depth.
    depth: usize,
    /// Whether the scan is inside a string literal.
    in_string: bool,
    /// Whether the previous byte was a backslash inside a string.
    escaped: bool,
}

impl JsonObjectCodec {
    /// Create a codec with empty scan state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Continue scanning `src` from the saved cursor.
    ///
    /// Returns the index of the `}` closing the top-level object, or `None`
    /// when the object is still incomplete.
    fn scan(&mut self, src: &[u8]) -> Option<usize> {
        for (offset, &byte) in src[self.cursor..].iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.cursor + offset);
                    }
                }
                _ => {}
            }
        }

        self.cursor = src.len();
        None
    }
}

impl Decoder for JsonObjectCodec {
    type Item = Value;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if !self.in_object {
                let Some(start) = src.iter().position(|&b| b == b'{') else {
                    if src.iter().any(|b| !b.is_ascii_whitespace()) {
                        debug!(bytes = src.len(), "framer: discarding bytes outside any object");
                    }
                    src.clear();
                    return Ok(None);
                };
                if start > 0 {
                    debug!(bytes = start, "framer: skipping bytes before object start");
                    src.advance(start);
                }
                self.in_object = true;
            }

            let Some(end) = self.scan(&src[..]) else {
                if src.len() > MAX_OBJECT_BYTES {
                    warn!(
                        bytes = src.len(),
                        limit = MAX_OBJECT_BYTES,
                        "framer: unterminated object exceeds limit, discarding"
                    );
                    src.clear();
                    self.reset();
                }
                return Ok(None);
            };

            let span = src.split_to(end + 1);
            self.reset();

            match serde_json::from_slice::<Value>(&span) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => {
                    warn!(
                        error = %err,
                        raw = %String::from_utf8_lossy(&span),
                        "framer: dropping malformed object"
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }

        if !src.is_empty() {
            debug!(bytes = src.len(), "framer: discarding unterminated tail at eof");
            src.clear();
            self.reset();
        }
        Ok(None)
    }
}

impl Encoder<Value> for JsonObjectCodec {
    type Error = AppError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&item).map_err(|e| {
            AppError::Transport(format!("failed to serialise outbound message: {e}"))
        })?;

        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}
