//! Frame Codec Module
//!
//! Decodes the binary multi-message envelope pushed by the streaming service.
//! One websocket frame carries one or more messages laid out back to back:
//!
//! ```text
//! +------------+---------+-----+----------------+--------+-------------+-----------+
//! | message id | version | N   | reference id   | format | payload len | payload   |
//! | u64 LE     | u16     | u8  | N bytes ASCII  | u8     | u32 LE      | M bytes   |
//! +------------+---------+-----+----------------+--------+-------------+-----------+
//! ```
//!
//! Payload format `0` is UTF-8 JSON. Every other format is rejected.

use serde_json::Value;

/// Payload format byte for UTF-8 JSON.
pub const PAYLOAD_FORMAT_JSON: u8 = 0;

/// Envelope version written by [`FrameCodec::encode`].
pub const ENVELOPE_VERSION: u16 = 1;

const MESSAGE_ID_LEN: usize = 8;
const VERSION_LEN: usize = 2;
const REFERENCE_ID_LEN_LEN: usize = 1;
const FORMAT_LEN: usize = 1;
const PAYLOAD_LEN_LEN: usize = 4;

/// Frame codec errors. Every variant is fatal for the owning context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A length field pointed past the end of the buffer.
    #[error(
        "truncated frame: {field} needs {needed} bytes at offset {offset}, {available} available"
    )]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Offset of the field in the buffer.
        offset: usize,
        /// Bytes required.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// The payload format byte was not JSON.
    #[error("unsupported payload format {format} for reference id {reference_id}")]
    UnsupportedFormat {
        /// Format byte found.
        format: u8,
        /// Reference id of the offending message.
        reference_id: String,
    },

    /// The reference id bytes were not ASCII.
    #[error("reference id at offset {offset} is not ASCII")]
    InvalidReferenceId {
        /// Offset of the reference id.
        offset: usize,
    },

    /// The payload bytes were not valid JSON.
    #[error("payload for reference id {reference_id} is not valid JSON: {message}")]
    InvalidPayload {
        /// Reference id of the offending message.
        reference_id: String,
        /// Parser diagnostic.
        message: String,
    },

    /// A control message did not have the expected shape.
    #[error("malformed control message {reference_id}: {message}")]
    InvalidControl {
        /// Control reference id.
        reference_id: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Encoding: the reference id does not fit the one-byte length field.
    #[error("reference id of {0} bytes exceeds the 255-byte limit")]
    ReferenceIdTooLong(usize),

    /// Encoding: the payload does not fit the four-byte length field.
    #[error("payload of {0} bytes exceeds the u32 length limit")]
    PayloadTooLarge(usize),
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Monotonic id assigned by the server; echoed on reconnect.
    pub message_id: u64,
    /// Subscription or control reference id.
    pub reference_id: String,
    /// Parsed JSON payload.
    pub payload: Value,
}

impl StreamMessage {
    /// Whether this message is addressed to a reserved control reference id.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.reference_id.starts_with('_')
    }
}

/// Sequential reader over one frame buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                field,
                offset: self.offset,
                needed,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }
}

/// Binary envelope codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode every message in `data`, preserving order.
    ///
    /// The buffer must be consumed exactly; an empty buffer yields no messages.
    ///
    /// # Errors
    ///
    /// Returns an error if any length field reads past the end, the reference
    /// id is not ASCII, the format is not JSON, or the payload does not parse.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<StreamMessage>, CodecError> {
        let mut cursor = Cursor::new(data);
        let mut messages = Vec::new();

        while cursor.remaining() > 0 {
            let message_id = u64::from_le_bytes(cursor.take_array::<MESSAGE_ID_LEN>("message id")?);
            let _version = cursor.take("version", VERSION_LEN)?;

            let [ref_len] = cursor.take_array::<REFERENCE_ID_LEN_LEN>("reference id length")?;
            let ref_offset = cursor.offset;
            let ref_bytes = cursor.take("reference id", usize::from(ref_len))?;
            if !ref_bytes.is_ascii() {
                return Err(CodecError::InvalidReferenceId { offset: ref_offset });
            }
            let reference_id = String::from_utf8_lossy(ref_bytes).into_owned();

            let [format] = cursor.take_array::<FORMAT_LEN>("payload format")?;
            if format != PAYLOAD_FORMAT_JSON {
                return Err(CodecError::UnsupportedFormat {
                    format,
                    reference_id,
                });
            }

            let payload_len =
                u32::from_le_bytes(cursor.take_array::<PAYLOAD_LEN_LEN>("payload length")?);
            let payload_bytes = cursor.take("payload", payload_len as usize)?;
            let payload = serde_json::from_slice(payload_bytes).map_err(|e| {
                CodecError::InvalidPayload {
                    reference_id: reference_id.clone(),
                    message: e.to_string(),
                }
            })?;

            messages.push(StreamMessage {
                message_id,
                reference_id,
                payload,
            });
        }

        Ok(messages)
    }

    /// Encode messages into one frame using the same layout as [`decode`](Self::decode).
    ///
    /// # Errors
    ///
    /// Returns an error if a reference id exceeds 255 bytes or a payload
    /// exceeds `u32::MAX` bytes.
    pub fn encode(&self, messages: &[StreamMessage]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        for message in messages {
            let reference = message.reference_id.as_bytes();
            let ref_len = u8::try_from(reference.len())
                .map_err(|_| CodecError::ReferenceIdTooLong(reference.len()))?;
            let payload = message.payload.to_string().into_bytes();
            let payload_len = u32::try_from(payload.len())
                .map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;

            out.extend_from_slice(&message.message_id.to_le_bytes());
            out.extend_from_slice(&ENVELOPE_VERSION.to_le_bytes());
            out.push(ref_len);
            out.extend_from_slice(reference);
            out.push(PAYLOAD_FORMAT_JSON);
            out.extend_from_slice(&payload_len.to_le_bytes());
            out.extend_from_slice(&payload);
        }
        Ok(out)
    }
}
