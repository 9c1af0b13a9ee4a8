//! The single writer task that owns a connection's write half.
//!
//! Request tasks, callbacks and the read loop never touch the stream; they
//! queue [`Outbound`] items and this task serializes them onto the wire.

use std::sync::Arc;

use duplexwire_frame::{BufferPool, EnvelopeWriter, FrameError};
use duplexwire_session::{FaultCode, FramingMode, Message, MessageEncoder, MessageFault, PreambleFault};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::idle::SessionActivity;

/// Work for a connection's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    KeepAlive,
    /// Write a fault record in place of the next envelope, then close.
    Fault(PreambleFault),
    /// Write the session terminator, then close.
    End,
}

pub(crate) struct WriterTask<W> {
    connection_id: String,
    mode: FramingMode,
    writer: EnvelopeWriter<W>,
    encoder: Arc<dyn MessageEncoder>,
    pool: BufferPool,
    activity: Arc<SessionActivity>,
    /// Cancelled when the writer stops on an error.
    failed: CancellationToken,
}

impl<W: AsyncWrite + Unpin> WriterTask<W> {
    pub(crate) fn new(
        connection_id: String,
        mode: FramingMode,
        writer: EnvelopeWriter<W>,
        encoder: Arc<dyn MessageEncoder>,
        pool: BufferPool,
        activity: Arc<SessionActivity>,
        failed: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            mode,
            writer,
            encoder,
            pool,
            activity,
            failed,
        }
    }

    /// Drain `rx` until a closing item arrives or every sender is gone.
    /// The write side is shut down on every exit path, and the `failed`
    /// token fires if the writer stopped on an error.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Outbound>) -> Result<()> {
        let result = self.drain(&mut rx).await;
        rx.close();
        if let Err(err) = &result {
            warn!(connection_id = %self.connection_id, error = %err, "writer failed");
            self.failed.cancel();
        }
        if let Err(err) = self.writer.shutdown().await {
            debug!(connection_id = %self.connection_id, error = %err, "shutdown after write failed");
        }
        result
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<Outbound>) -> Result<()> {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Message(message) => {
                    if self.mode == FramingMode::Singleton {
                        // One unframed reply, then the session is over.
                        return self.write_singleton(&message).await;
                    }
                    self.write_message(&message).await?;
                }
                Outbound::KeepAlive => {
                    if self.mode != FramingMode::Singleton {
                        self.writer.write_keep_alive().await?;
                    }
                }
                Outbound::Fault(fault) => {
                    warn!(connection_id = %self.connection_id, fault = %fault, "closing with fault");
                    self.writer.write_raw(&fault.to_record()).await?;
                    return Ok(());
                }
                Outbound::End => {
                    if self.mode != FramingMode::Singleton {
                        self.writer.write_end().await?;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let mut buf = self.pool.get();
        if let Err(err) = self.encoder.encode(message, &mut buf) {
            warn!(
                connection_id = %self.connection_id,
                action = message.action(),
                error = %err,
                "reply could not be encoded"
            );
            let replacement = replacement_fault(message, format!("reply could not be encoded: {err}"));
            buf.clear();
            self.encoder.encode(&replacement, &mut buf)?;
        }
        match self.writer.write_envelope(&buf).await {
            Err(FrameError::EnvelopeTooLarge { size, max }) => {
                warn!(
                    connection_id = %self.connection_id,
                    action = message.action(),
                    size,
                    max,
                    "reply exceeds maximum envelope size"
                );
                let replacement = replacement_fault(
                    message,
                    format!("reply of {size} bytes exceeds maximum envelope size {max}"),
                );
                buf.clear();
                self.encoder.encode(&replacement, &mut buf)?;
                self.writer.write_envelope(&buf).await?;
            }
            result => result?,
        }
        self.activity.touch();
        Ok(())
    }

    async fn write_singleton(&mut self, message: &Message) -> Result<()> {
        let mut buf = self.pool.get();
        if let Err(err) = self.encoder.encode(message, &mut buf) {
            warn!(connection_id = %self.connection_id, error = %err, "reply could not be encoded");
            let replacement = replacement_fault(message, format!("reply could not be encoded: {err}"));
            buf.clear();
            self.encoder.encode(&replacement, &mut buf)?;
        }
        self.writer.write_raw(&buf).await?;
        self.activity.touch();
        Ok(())
    }
}

/// An `OperationFailed` fault correlated with the request `message` answers.
fn replacement_fault(message: &Message, reason: String) -> Message {
    let mut request = message.clone();
    request.headers.message_id = message.relates_to();
    request.fault_reply(&MessageFault::new(FaultCode::OperationFailed, reason))
}
