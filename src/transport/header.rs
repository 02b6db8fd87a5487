//! Wire header codec
//!
//! Every frame on the stream starts with a header laid out as:
//!
//! ```text
//! offset  size  field
//!      0     2  version           (u16, big-endian)
//!      2     2  header_length     (u16, total header bytes incl. these 4)
//!      4     4  sequence_number   (u32)
//!      8     4  flags             (u32, 0 = publish, 1 = request, 2 = response)
//!     12     4  control_data      (u32, subscription id on delivery, else 0)
//!     16     4  payload_length    (u32)
//!     20   4+n  topic             (u32 length prefix + UTF-8 bytes)
//!      .   4+m  reply_topic       (optional, same encoding)
//! ```
//!
//! The first four bytes are the preamble: a reader that has only those can
//! tell how many header bytes follow. Whatever remains after the topic is
//! the reply topic.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, BytesMut};

use crate::utils::error::{Error, Result};

pub const PROTOCOL_VERSION: u16 = 1;
pub const PREAMBLE_LENGTH: usize = 4;
pub const FIXED_HEADER_LENGTH: usize = 20;
pub const MAX_TOPIC_LENGTH: usize = 128;
const STRING_PREFIX_LENGTH: usize = 4;
pub const MIN_HEADER_LENGTH: usize = FIXED_HEADER_LENGTH + STRING_PREFIX_LENGTH;
pub const MAX_HEADER_LENGTH: usize =
    FIXED_HEADER_LENGTH + 2 * (STRING_PREFIX_LENGTH + MAX_TOPIC_LENGTH);

/// Offset of `payload_length` within the fixed part of the header.
const PAYLOAD_LENGTH_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const REQUEST: MessageFlags = MessageFlags(1);
    pub const RESPONSE: MessageFlags = MessageFlags(2);

    pub const fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set. `NONE` is never contained.
    pub const fn contains(self, other: MessageFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MessageFlags::NONE => f.write_str("none"),
            MessageFlags::REQUEST => f.write_str("request"),
            MessageFlags::RESPONSE => f.write_str("response"),
            other => write!(f, "{:#x}", other.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u16,
    pub header_length: u16,
    pub sequence_number: u32,
    pub flags: MessageFlags,
    pub control_data: u32,
    pub payload_length: u32,
    pub topic: String,
    pub reply_topic: Option<String>,
}

impl WireHeader {
    /// A publish header for `topic` with every other field zeroed.
    pub fn new(topic: impl Into<String>) -> Self {
        let mut header = Self {
            version: PROTOCOL_VERSION,
            header_length: 0,
            sequence_number: 0,
            flags: MessageFlags::NONE,
            control_data: 0,
            payload_length: 0,
            topic: topic.into(),
            reply_topic: None,
        };
        header.refresh_length();
        header
    }

    pub fn with_reply_topic(mut self, reply_topic: impl Into<String>) -> Self {
        self.reply_topic = Some(reply_topic.into());
        self.refresh_length();
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: u32) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_control_data(mut self, control_data: u32) -> Self {
        self.control_data = control_data;
        self
    }

    pub fn with_payload_length(mut self, payload_length: u32) -> Self {
        self.payload_length = payload_length;
        self
    }

    pub fn is_request(&self) -> bool {
        self.flags.contains(MessageFlags::REQUEST)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MessageFlags::RESPONSE)
    }

    /// Number of bytes `encode` writes for this header.
    pub fn encoded_len(&self) -> usize {
        let reply = self
            .reply_topic
            .as_ref()
            .map_or(0, |r| STRING_PREFIX_LENGTH + r.len());
        FIXED_HEADER_LENGTH + STRING_PREFIX_LENGTH + self.topic.len() + reply
    }

    fn refresh_length(&mut self) {
        // saturates for oversized topics; validate() rejects those before encoding
        self.header_length = u16::try_from(self.encoded_len()).unwrap_or(u16::MAX);
    }

    /// Checks the header can be put on the wire.
    pub fn validate(&self) -> Result<()> {
        validate_topic("topic", &self.topic)?;
        if let Some(reply_topic) = &self.reply_topic {
            validate_topic("reply topic", reply_topic)?;
        }
        if self.is_request() && self.reply_topic.is_none() {
            return Err(Error::InvalidArgument(
                "request frame without a reply topic".to_string(),
            ));
        }
        Ok(())
    }

    /// Appends the encoded header to `dst`. `header_length` is recomputed
    /// from the topics rather than taken from the field.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        self.validate()?;
        let header_length = self.encoded_len();

        dst.reserve(header_length);
        dst.put_u16(self.version);
        dst.put_u16(header_length as u16);
        dst.put_u32(self.sequence_number);
        dst.put_u32(self.flags.bits());
        dst.put_u32(self.control_data);
        dst.put_u32(self.payload_length);
        put_string(dst, &self.topic);
        if let Some(reply_topic) = &self.reply_topic {
            put_string(dst, reply_topic);
        }
        Ok(())
    }

    /// Decodes a complete header. `src` must hold exactly `header_length`
    /// bytes, preamble included.
    pub fn decode(src: &[u8]) -> Result<WireHeader> {
        if src.len() < MIN_HEADER_LENGTH {
            return Err(Error::Decode(format!(
                "header of {} bytes is shorter than the minimum {MIN_HEADER_LENGTH}",
                src.len()
            )));
        }

        let mut buf = src;
        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(Error::Decode(format!(
                "unsupported protocol version {version}"
            )));
        }
        let header_length = buf.get_u16();
        if usize::from(header_length) != src.len() {
            return Err(Error::Decode(format!(
                "header_length {header_length} does not match {} header bytes",
                src.len()
            )));
        }
        let sequence_number = buf.get_u32();
        let flags = MessageFlags::from_bits(buf.get_u32());
        let control_data = buf.get_u32();
        let payload_length = buf.get_u32();
        let topic = get_string(&mut buf, "topic")?;
        let reply_topic = if buf.has_remaining() {
            Some(get_string(&mut buf, "reply topic")?)
        } else {
            None
        };
        if buf.has_remaining() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after reply topic",
                buf.remaining()
            )));
        }

        let header = WireHeader {
            version,
            header_length,
            sequence_number,
            flags,
            control_data,
            payload_length,
            topic,
            reply_topic,
        };
        if header.is_request() && header.reply_topic.is_none() {
            return Err(Error::Decode(
                "request frame without a reply topic".to_string(),
            ));
        }
        Ok(header)
    }

    /// Total header length announced by a 4-byte preamble.
    pub fn peek_header_length(preamble: &[u8]) -> Option<usize> {
        if preamble.len() < PREAMBLE_LENGTH {
            return None;
        }
        Some(usize::from(u16::from_be_bytes([preamble[2], preamble[3]])))
    }

    /// Payload length stored in the fixed part of a header, readable even
    /// when the topics that follow are malformed.
    pub fn peek_payload_length(header: &[u8]) -> Option<usize> {
        let field = header.get(PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4)?;
        let bytes: [u8; 4] = field.try_into().ok()?;
        usize::try_from(u32::from_be_bytes(bytes)).ok()
    }
}

/// Rejects empty topics and topics over `MAX_TOPIC_LENGTH` bytes.
pub fn validate_topic(what: &str, topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "{what} is {} bytes, limit is {MAX_TOPIC_LENGTH}",
            topic.len()
        )));
    }
    Ok(())
}

fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value.as_bytes());
}

fn get_string(buf: &mut &[u8], what: &str) -> Result<String> {
    if buf.remaining() < STRING_PREFIX_LENGTH {
        return Err(Error::Decode(format!("truncated {what} length")));
    }
    let len = buf.get_u32() as usize;
    if len > MAX_TOPIC_LENGTH {
        return Err(Error::Decode(format!(
            "{what} length {len} exceeds {MAX_TOPIC_LENGTH}"
        )));
    }
    if buf.remaining() < len {
        return Err(Error::Decode(format!("truncated {what}")));
    }
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Decode(format!("{what} is not UTF-8: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(value)
}
