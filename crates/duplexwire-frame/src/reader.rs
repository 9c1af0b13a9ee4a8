use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::FramedRead;

use crate::codec::{EnvelopeCodec, Envelope, FrameConfig};
use crate::error::{FrameError, Result};

/// Reads complete envelopes from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get whole envelopes.
pub struct EnvelopeReader<R> {
    framed: FramedRead<R, EnvelopeCodec>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    /// Create a reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a reader with explicit configuration.
    pub fn with_config(inner: R, config: FrameConfig) -> Self {
        Self {
            framed: FramedRead::new(inner, EnvelopeCodec::new(config)),
        }
    }

    /// Create a reader that first decodes `leftover`, bytes already pulled
    /// off the stream while the preamble was being read.
    pub fn with_leftover(inner: R, config: FrameConfig, leftover: &[u8]) -> Self {
        let mut reader = Self::with_config(inner, config);
        reader.framed.read_buffer_mut().extend_from_slice(leftover);
        reader
    }

    /// Read the next envelope.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between envelopes and
    /// `Err(FrameError::ConnectionClosed)` when it ends mid-envelope.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>> {
        self.framed.next().await.transpose()
    }

    /// Read the next envelope, treating a missing terminator as an error.
    pub async fn expect_envelope(&mut self) -> Result<Envelope> {
        self.read_envelope()
            .await?
            .ok_or(FrameError::ConnectionClosed)
    }

    /// Read everything until the peer shuts down its write side, for the
    /// unframed Singleton reply. Fails once more than `max` bytes arrive.
    pub async fn read_to_end(mut self, max: usize) -> Result<Bytes> {
        let mut out = BytesMut::from(&self.framed.read_buffer()[..]);
        let mut chunk = [0u8; 4096];
        loop {
            if out.len() > max {
                return Err(FrameError::EnvelopeTooLarge {
                    size: out.len(),
                    max,
                });
            }
            let read = self.framed.get_mut().read(&mut chunk).await?;
            if read == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> &[u8] {
        self.framed.read_buffer()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        self.framed.get_ref()
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        self.framed.get_mut()
    }

    /// Consume the reader and return the inner stream. Buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.framed.into_inner()
    }

    /// Update the maximum envelope size for subsequent reads.
    pub fn set_max_envelope_size(&mut self, max: usize) {
        self.framed.decoder_mut().set_max_envelope_size(max);
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        self.framed.decoder().config()
    }
}
