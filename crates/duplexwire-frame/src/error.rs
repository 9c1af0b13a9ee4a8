/// Errors that can occur during record and envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A length prefix was not a valid varint.
    #[error("malformed varint: {0}")]
    InvalidVarint(&'static str),

    /// A length to encode exceeds the varint range.
    #[error("length {0} exceeds the encodable maximum (2^31-1)")]
    LengthOverflow(usize),

    /// An envelope exceeds the configured maximum size.
    #[error("envelope too large ({size} bytes, max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// A data envelope with no payload; length zero is reserved for session end.
    #[error("empty payload cannot be framed as data")]
    EmptyPayload,

    /// A preamble record exceeds its size limit.
    #[error("record too large ({size} bytes, max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// A text record is not valid UTF-8.
    #[error("record is not valid UTF-8")]
    InvalidUtf8,

    /// An I/O error occurred while reading or writing.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete record or envelope arrived.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the peer sent bytes that break the wire format, as opposed to
    /// the stream failing or ending.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidVarint(_)
                | FrameError::EnvelopeTooLarge { .. }
                | FrameError::RecordTooLarge { .. }
                | FrameError::InvalidUtf8
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
