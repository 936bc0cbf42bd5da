//! Stream header sent to every viewer before media
//!
//! ```text
//! struct { char magic[4] = "jsmp"; u16 width (BE); u16 height (BE); }
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Magic tag understood by JSMpeg players
pub const STREAM_MAGIC_BYTES: &[u8; 4] = b"jsmp";

/// Encoded header length
pub const HEADER_LEN: usize = 8;

/// Per-camera framing header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFrameHeader {
    pub width: u16,
    pub height: u16,
}

impl StreamFrameHeader {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Header for unknown dimensions; players ignore a zero size
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(STREAM_MAGIC_BYTES);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.freeze()
    }

    /// Parse a header, `None` on wrong length or magic
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != HEADER_LEN || &data[..4] != STREAM_MAGIC_BYTES {
            return None;
        }
        Some(Self {
            width: u16::from_be_bytes([data[4], data[5]]),
            height: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

impl From<(u16, u16)> for StreamFrameHeader {
    fn from((width, height): (u16, u16)) -> Self {
        Self::new(width, height)
    }
}
