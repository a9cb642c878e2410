//! Length-prefixed framing.
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────┐
//! │ length: i32 (LE, 4B) │ payload: `length` bytes │
//! └──────────────────────┴─────────────────────────┘
//! ```
//!
//! The prefix counts payload bytes only. [`FrameCodec`] is an explicit
//! two-state reassembler: it tolerates a prefix split across reads, a body
//! spread over any number of reads, and several frames packed into one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RccError;

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// No message in progress; the next four bytes are a prefix.
    AwaitingHeader,
    /// The prefix has been consumed; this many body bytes complete the frame.
    AwaitingBody(usize),
}

/// Encoder/decoder for `[i32 LE length][payload]` frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<usize>, RccError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let announced = src.get_i32_le();
        if announced < 0 {
            return Err(RccError::NegativeLength(announced));
        }
        let len = announced as usize;
        if len > self.max_frame_len {
            return Err(RccError::FrameTooLarge {
                size: len,
                max: self.max_frame_len,
            });
        }

        src.reserve(len);
        Ok(Some(len))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = RccError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            DecodeState::AwaitingHeader => match self.decode_header(src)? {
                Some(len) => {
                    self.state = DecodeState::AwaitingBody(len);
                    len
                }
                None => return Ok(None),
            },
            DecodeState::AwaitingBody(len) => len,
        };

        if src.len() < len {
            return Ok(None);
        }

        self.state = DecodeState::AwaitingHeader;
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = RccError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_len {
            return Err(RccError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_len,
            });
        }
        let prefix = encode_prefix(item.len())?;
        dst.reserve(PREFIX_LEN + item.len());
        dst.put_slice(&prefix);
        dst.put(item);
        Ok(())
    }
}

/// Encode a payload length as the 4-byte wire prefix.
pub fn encode_prefix(len: usize) -> Result<[u8; PREFIX_LEN], RccError> {
    let len = i32::try_from(len).map_err(|_| RccError::FrameTooLarge {
        size: len,
        max: i32::MAX as usize,
    })?;
    Ok(len.to_le_bytes())
}

// ── Tests ────────────────────────────────────────────────────────
