use std::time::Duration;

use crate::encoder::EncodingError;
use crate::fault::PreambleFault;
use crate::security::UpgradeError;

/// Errors surfaced by client-side session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] duplexwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] duplexwire_frame::FrameError),

    /// The server answered the preamble with a fault record.
    #[error("server rejected preamble: {0}")]
    Fault(PreambleFault),

    /// The stream upgrade failed.
    #[error("stream upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),

    /// A message could not be encoded or decoded.
    #[error("message encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Handshake failed for a reason not carried by a fault record.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server ended the session or closed the stream.
    #[error("server disconnected: {0}")]
    Disconnected(String),

    /// The operation is not available in the negotiated framing mode.
    #[error("{operation} is not available in {mode} mode")]
    WrongMode {
        operation: &'static str,
        mode: crate::preamble::FramingMode,
    },

    /// Operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Frame(duplexwire_frame::FrameError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
