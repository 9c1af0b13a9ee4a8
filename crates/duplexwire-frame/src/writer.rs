use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{FrameConfig, END_OF_SESSION, KEEP_ALIVE_PAYLOAD};
use crate::error::{FrameError, Result};
use crate::varint::encode_varint_array;

/// Writes complete envelopes to any `AsyncWrite` stream.
///
/// Every call flushes before returning, so a wrapped upgrade stream never
/// holds a finished envelope back.
pub struct EnvelopeWriter<W> {
    inner: W,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    /// Create a writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Write one data envelope.
    pub async fn write_envelope(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload);
        }
        if payload.len() > self.config.max_envelope_size {
            return Err(FrameError::EnvelopeTooLarge {
                size: payload.len(),
                max: self.config.max_envelope_size,
            });
        }

        let (header, used) = encode_varint_array(payload.len())?;
        self.inner.write_all(&header[..used]).await?;
        self.inner.write_all(payload).await?;
        self.flush().await
    }

    /// Write a keep-alive envelope.
    pub async fn write_keep_alive(&mut self) -> Result<()> {
        self.inner
            .write_all(&[KEEP_ALIVE_PAYLOAD.len() as u8])
            .await?;
        self.inner.write_all(&KEEP_ALIVE_PAYLOAD).await?;
        self.flush().await
    }

    /// Write the zero-length session terminator.
    pub async fn write_end(&mut self) -> Result<()> {
        self.inner.write_all(&END_OF_SESSION).await?;
        self.flush().await
    }

    /// Write bytes with no framing (Singleton replies, handshake responses).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.flush().await
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(FrameError::Io)
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            // The peer may already be gone; the session is over either way.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(FrameError::Io(err)),
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Update the maximum envelope size for subsequent writes.
    pub fn set_max_envelope_size(&mut self, max: usize) {
        self.config.max_envelope_size = max;
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
