//! Length-prefixed wire framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Framing errors
///
/// Both variants mean the stream is corrupt: the protocol is not
/// self-framing past a bad prefix, so the caller must close the
/// connection rather than resynchronize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    Oversized(usize),

    #[error("Malformed frame length: {0}")]
    Malformed(usize),
}

/// One length-prefixed unit on the wire.
///
/// The prefix is a big-endian u32 that counts itself, so a frame occupies
/// `payload.len() + LENGTH_PREFIX_LEN` bytes on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Wrap a payload, enforcing the frame size ceiling.
    pub fn new(payload: Bytes) -> Result<Self, FrameError> {
        let total = payload.len() + crate::LENGTH_PREFIX_LEN;
        if total > crate::MAX_MESSAGE_SIZE {
            return Err(FrameError::Oversized(total));
        }
        Ok(Self { payload })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Total on-wire length including the prefix.
    pub fn total_len(&self) -> usize {
        self.payload.len() + crate::LENGTH_PREFIX_LEN
    }

    /// Encode as length prefix followed by the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_len());
        buf.put_u32(self.total_len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns Ok(Some(frame)) if a complete frame was consumed,
    /// Ok(None) if more data is needed,
    /// Err if the prefix violates the frame invariants.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < crate::LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&buf[..crate::LENGTH_PREFIX_LEN]);
        let payload_len = payload_len(prefix)?;

        if buf.len() < crate::LENGTH_PREFIX_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(crate::LENGTH_PREFIX_LEN);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame { payload }))
    }
}

/// Validate a standalone length prefix and return the payload length it
/// announces.
///
/// The read loop checks the prefix before pulling a single payload byte
/// off the stream, so an oversized frame never commits to a large read.
pub fn payload_len(prefix: [u8; 4]) -> Result<usize, FrameError> {
    let total = u32::from_be_bytes(prefix) as usize;
    if total < crate::MIN_FRAME_LEN {
        return Err(FrameError::Malformed(total));
    }
    if total > crate::MAX_MESSAGE_SIZE {
        return Err(FrameError::Oversized(total));
    }
    Ok(total - crate::LENGTH_PREFIX_LEN)
}
