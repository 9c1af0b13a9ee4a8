/// Errors from registration, hosting, and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] duplexwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] duplexwire_frame::FrameError),

    /// Message encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] duplexwire_session::EncodingError),

    /// A base address could not be registered.
    #[error("invalid base address '{address}': {reason}")]
    InvalidBaseAddress { address: String, reason: String },

    /// A service descriptor is inconsistent.
    #[error("invalid service '{service}': {reason}")]
    InvalidDescriptor { service: String, reason: String },

    /// The connection's writer is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The host is shutting down.
    #[error("host is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure reported by an operation. Converted into an `OperationFailed`
/// fault reply; the connection stays usable.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl OperationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        OperationError::Failed(reason.into())
    }
}
