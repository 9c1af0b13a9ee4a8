//! Steady-state envelope framing.
//!
//! Wire format:
//! ```text
//! ┌────────────┬───────────────────┐
//! │ Length     │ Payload           │
//! │ (varint)   │ (Length bytes)    │
//! └────────────┴───────────────────┘
//! ```
//!
//! A length of zero carries no payload and ends the session.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::varint::{decode_varint, encode_varint, MAX_VARINT_LEN, MAX_VARINT_VALUE};

/// Default maximum envelope payload: 64 KiB.
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Payload that marks a keep-alive envelope when keep-alives are enabled.
pub const KEEP_ALIVE_PAYLOAD: [u8; 1] = [0x00];

/// The single-byte session-end envelope.
pub const END_OF_SESSION: [u8; 1] = [0x00];

/// One unit of steady-state traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// An application payload; never empty.
    Data(Bytes),
    /// Liveness probe; filtered before the message encoder.
    KeepAlive,
    /// The zero-length terminator.
    End,
}

impl Envelope {
    /// Wrap a payload.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Envelope::Data(payload.into())
    }

    /// Bytes this envelope occupies on the wire.
    pub fn wire_size(&self) -> usize {
        match self {
            Envelope::Data(payload) => {
                crate::varint::encoded_len(payload.len()) + payload.len()
            }
            Envelope::KeepAlive => 2,
            Envelope::End => 1,
        }
    }
}

/// Framing limits shared by readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest accepted payload. Default: 64 KiB.
    pub max_envelope_size: usize,
    /// Whether `[0x00]` payloads are keep-alives. Default: off.
    pub keep_alive: bool,
}

impl FrameConfig {
    /// Set the maximum envelope size, clamped to the varint range.
    pub fn with_max_envelope_size(mut self, max: usize) -> Self {
        self.max_envelope_size = max.min(MAX_VARINT_VALUE as usize);
        self
    }

    /// Enable or disable keep-alive recognition.
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            keep_alive: false,
        }
    }
}

/// Encode a data envelope into `dst`.
pub fn encode_envelope(payload: &[u8], max_size: usize, dst: &mut impl BufMut) -> Result<()> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > max_size {
        return Err(FrameError::EnvelopeTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }
    encode_varint(payload.len(), dst)?;
    dst.put_slice(payload);
    Ok(())
}

/// Decode one envelope from the front of `src`.
///
/// Returns `Ok(None)` if `src` does not hold a complete envelope yet. The
/// declared length is checked before any payload bytes are awaited.
pub fn decode_envelope(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Envelope>> {
    let Some((len, header)) = decode_varint(src)? else {
        return Ok(None);
    };
    let len = len as usize;

    if len == 0 {
        src.advance(header);
        return Ok(Some(Envelope::End));
    }
    if len > config.max_envelope_size {
        return Err(FrameError::EnvelopeTooLarge {
            size: len,
            max: config.max_envelope_size,
        });
    }

    let total = header + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(header);
    let payload = src.split_to(len).freeze();
    if config.keep_alive && payload.as_ref() == KEEP_ALIVE_PAYLOAD {
        return Ok(Some(Envelope::KeepAlive));
    }
    Ok(Some(Envelope::Data(payload)))
}

/// `tokio_util` codec for envelopes.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    config: FrameConfig,
}

impl EnvelopeCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn set_max_envelope_size(&mut self, max: usize) {
        self.config.max_envelope_size = max.min(MAX_VARINT_VALUE as usize);
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        decode_envelope(src, &self.config)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        match item {
            Envelope::Data(payload) => {
                dst.reserve(MAX_VARINT_LEN + payload.len());
                encode_envelope(&payload, self.config.max_envelope_size, dst)
            }
            Envelope::KeepAlive => {
                dst.put_u8(KEEP_ALIVE_PAYLOAD.len() as u8);
                dst.put_slice(&KEEP_ALIVE_PAYLOAD);
                Ok(())
            }
            Envelope::End => {
                dst.put_slice(&END_OF_SESSION);
                Ok(())
            }
        }
    }
}
