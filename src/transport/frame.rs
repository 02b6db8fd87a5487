//! Frames and the incremental stream decoder
//!
//! A frame is one `WireHeader` followed by `payload_length` payload bytes.
//! `FrameDecoder` pulls frames out of a growing byte buffer in three steps:
//! the 4-byte preamble, the rest of the header, then the payload. Each step
//! waits until its byte count is fully buffered.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::document::Document;
use crate::transport::header::{
    MAX_HEADER_LENGTH, MIN_HEADER_LENGTH, PREAMBLE_LENGTH, WireHeader,
};
use crate::utils::error::{Error, Result};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: WireHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Pairs a header with its payload, setting `payload_length` to match.
    pub fn new(mut header: WireHeader, payload: Bytes) -> Self {
        header.payload_length = payload.len() as u32;
        Self { header, payload }
    }

    pub fn from_document(header: WireHeader, document: &Document) -> Result<Self> {
        Ok(Self::new(header, document.encode()?))
    }

    pub fn topic(&self) -> &str {
        &self.header.topic
    }

    /// Decodes the payload as a document.
    pub fn document(&self) -> Result<Document> {
        Document::decode(&self.payload)
    }

    /// Header and payload as one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        if self.header.payload_length as usize != self.payload.len() {
            return Err(Error::InvalidArgument(format!(
                "payload_length {} does not match {} payload bytes",
                self.header.payload_length,
                self.payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(self.header.encoded_len() + self.payload.len());
        self.header.encode(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for version and header_length
    ReadPreamble,
    /// Waiting for the rest of the header
    ReadHeader { header_length: usize },
    /// Waiting for the payload
    ReadPayload { payload_length: usize },
}

/// Incremental frame decoder, one per stream.
///
/// A header that is complete but malformed does not stop the decoder: its
/// payload is still consumed so the next frame starts on a boundary, and
/// `Error::Decode` is returned in place of that frame. Lengths that make the
/// stream impossible to follow yield `Error::Protocol`; the stream must be
/// dropped after that.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
    /// Decoded (or failed) header held while its payload arrives
    header: Option<Result<WireHeader>>,
    max_payload_length: usize,
}

impl FrameDecoder {
    pub fn new(max_payload_length: usize) -> Self {
        Self {
            state: ReadState::ReadPreamble,
            header: None,
            max_payload_length,
        }
    }

    /// True when no partial frame has been consumed.
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::ReadPreamble
    }

    /// Bytes still missing before the current step can complete.
    pub fn bytes_needed(&self, buffered: usize) -> usize {
        let wanted = match self.state {
            ReadState::ReadPreamble => PREAMBLE_LENGTH,
            ReadState::ReadHeader { header_length } => header_length,
            ReadState::ReadPayload { payload_length } => payload_length,
        };
        wanted.saturating_sub(buffered)
    }

    /// Takes the next complete frame off the front of `src`, or returns
    /// `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                ReadState::ReadPreamble => {
                    let Some(header_length) = WireHeader::peek_header_length(src) else {
                        return Ok(None);
                    };
                    if !(MIN_HEADER_LENGTH..=MAX_HEADER_LENGTH).contains(&header_length) {
                        return Err(Error::Protocol(format!(
                            "header_length {header_length} outside {MIN_HEADER_LENGTH}..={MAX_HEADER_LENGTH}"
                        )));
                    }
                    self.state = ReadState::ReadHeader { header_length };
                }
                ReadState::ReadHeader { header_length } => {
                    if src.len() < header_length {
                        return Ok(None);
                    }
                    let raw = src.split_to(header_length);
                    let payload_length = WireHeader::peek_payload_length(&raw).unwrap_or(0);
                    if payload_length > self.max_payload_length {
                        self.state = ReadState::ReadPreamble;
                        return Err(Error::Protocol(format!(
                            "payload_length {payload_length} exceeds {}",
                            self.max_payload_length
                        )));
                    }
                    self.header = Some(WireHeader::decode(&raw));
                    self.state = ReadState::ReadPayload { payload_length };
                }
                ReadState::ReadPayload { payload_length } => {
                    if src.len() < payload_length {
                        src.reserve(payload_length - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(payload_length).freeze();
                    self.state = ReadState::ReadPreamble;
                    let header = self
                        .header
                        .take()
                        .ok_or_else(|| Error::Protocol("payload without a header".to_string()))??;
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }
}

/// Drives a `FrameDecoder` from an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_payload_length: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            decoder: FrameDecoder::new(max_payload_length),
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the stream
    /// cleanly between frames; closing mid-frame is `ConnectionLost`.
    ///
    /// An `Error::Decode` skips one frame and the reader stays usable.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() && self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(Error::ConnectionLost(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream closed with {} bytes of a frame missing",
                        self.decoder.bytes_needed(self.buffer.len())
                    ),
                )));
            }
        }
    }
}
