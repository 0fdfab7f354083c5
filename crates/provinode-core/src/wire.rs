//! Outer wire framing for the scan stream.
//!
//! Every byte on the pinned stream is part of a frame:
//!
//! ```text
//! +--------------+----------------------+------------------+
//! | channel (u8) | length (u32, BE)     | payload          |
//! +--------------+----------------------+------------------+
//! ```
//!
//! Channels:
//!
//! - `0x01` handshake control (plaintext JSON, pre-session only)
//! - `0x02` legacy raw sample, refused in both directions; modern
//!   senders carry samples inside the sealed envelope
//! - `0x03` AEAD-sealed envelope (the inner `payload_channel`
//!   distinguishes control from sample traffic)
//!
//! The declared length is validated against [`MAX_WIRE_FRAME_SIZE`]
//! before any allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size for a single wire frame (16 MiB).
pub const MAX_WIRE_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header length: channel byte plus the big-endian length prefix.
const HEADER_LEN: usize = 5;

/// Wire framing errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame length exceeds [`MAX_WIRE_FRAME_SIZE`].
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// Channel byte is not part of the protocol.
    #[error("unknown wire channel: {0:#04x}")]
    UnknownChannel(u8),

    /// Legacy unencrypted sample channel is refused.
    #[error("legacy raw-sample channel 0x02 refused")]
    LegacyChannelRefused,
}

/// Wire channel discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireChannel {
    /// Plaintext handshake JSON.
    Handshake = 0x01,
    /// Legacy unencrypted sample frame (never sent or accepted).
    RawSample = 0x02,
    /// AEAD-sealed envelope JSON.
    Sealed = 0x03,
}

impl WireChannel {
    /// Parses a channel byte.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::LegacyChannelRefused`] for `0x02` and
    /// [`WireError::UnknownChannel`] for anything else outside the
    /// protocol.
    pub const fn try_from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(Self::Handshake),
            0x02 => Err(WireError::LegacyChannelRefused),
            0x03 => Ok(Self::Sealed),
            other => Err(WireError::UnknownChannel(other)),
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Channel the payload arrived on.
    pub channel: WireChannel,
    /// Frame payload.
    pub payload: Bytes,
}

impl WireFrame {
    /// Creates a frame on the given channel.
    #[must_use]
    pub const fn new(channel: WireChannel, payload: Bytes) -> Self {
        Self { channel, payload }
    }
}

/// Length-prefixed codec for [`WireFrame`].
#[derive(Debug, Default)]
pub struct WireFrameCodec {
    _private: (),
}

impl WireFrameCodec {
    /// Creates a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Decoder for WireFrameCodec {
    type Item = WireFrame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireFrame>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let channel_byte = src[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        // Validate before reserving or waiting for the body.
        if len > MAX_WIRE_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                len,
                max: MAX_WIRE_FRAME_SIZE,
            });
        }
        let channel = WireChannel::try_from_byte(channel_byte)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(WireFrame { channel, payload }))
    }
}

impl Encoder<WireFrame> for WireFrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: WireFrame, dst: &mut BytesMut) -> Result<(), WireError> {
        if frame.channel == WireChannel::RawSample {
            return Err(WireError::LegacyChannelRefused);
        }
        if frame.payload.len() > MAX_WIRE_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                len: frame.payload.len(),
                max: MAX_WIRE_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.channel as u8);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
