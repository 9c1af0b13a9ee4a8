//! Fault records written in place of the preamble ack.

use std::fmt;

use bytes::BufMut;

/// Longest fault string accepted from the wire.
pub const MAX_FAULT_LEN: usize = 256;

/// How a fault is classified for logging and error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    /// A well-formed preamble asked for something this listener will not do.
    NegotiationRejected,
    /// The peer broke the wire format.
    ProtocolViolation,
}

/// A handshake fault with a fixed wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreambleFault {
    UnsupportedVersion,
    UnknownMode,
    UnsupportedMode,
    EndpointNotFound,
    ContentTypeMismatch,
    UnsupportedUpgrade,
    ServerTooBusy,
    EnvelopeTooLarge,
    ProtocolViolation,
}

impl PreambleFault {
    pub const ALL: [PreambleFault; 9] = [
        PreambleFault::UnsupportedVersion,
        PreambleFault::UnknownMode,
        PreambleFault::UnsupportedMode,
        PreambleFault::EndpointNotFound,
        PreambleFault::ContentTypeMismatch,
        PreambleFault::UnsupportedUpgrade,
        PreambleFault::ServerTooBusy,
        PreambleFault::EnvelopeTooLarge,
        PreambleFault::ProtocolViolation,
    ];

    /// The exact string carried in the fault record.
    pub fn as_str(self) -> &'static str {
        match self {
            PreambleFault::UnsupportedVersion => "UnsupportedVersion",
            PreambleFault::UnknownMode => "UnknownMode",
            PreambleFault::UnsupportedMode => "UnsupportedMode",
            PreambleFault::EndpointNotFound => "EndpointNotFound",
            PreambleFault::ContentTypeMismatch => "ContentTypeMismatch",
            PreambleFault::UnsupportedUpgrade => "UnsupportedUpgrade",
            PreambleFault::ServerTooBusy => "ServerTooBusy",
            PreambleFault::EnvelopeTooLarge => "EnvelopeTooLarge",
            PreambleFault::ProtocolViolation => "ProtocolViolation",
        }
    }

    /// Parse a fault string read from the wire.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|fault| fault.as_str() == value)
    }

    pub fn category(self) -> FaultCategory {
        match self {
            PreambleFault::EnvelopeTooLarge | PreambleFault::ProtocolViolation => {
                FaultCategory::ProtocolViolation
            }
            _ => FaultCategory::NegotiationRejected,
        }
    }

    /// Append the fault record (`[varint len][string]`) to `dst`.
    pub fn encode(self, dst: &mut impl BufMut) {
        let text = self.as_str().as_bytes();
        // Every fault string fits a one-byte varint.
        debug_assert!(text.len() < 0x80);
        dst.put_u8(text.len() as u8);
        dst.put_slice(text);
    }

    /// The fault record as owned bytes.
    pub fn to_record(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.as_str().len() + 1);
        self.encode(&mut out);
        out
    }
}

impl fmt::Display for PreambleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
