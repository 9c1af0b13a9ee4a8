//! The connection preamble.
//!
//! ```text
//! ┌─────────┬──────┬────────────┬────────────────┬───────────────┐
//! │ Version │ Mode │ Via record │ Content-type   │ Upgrade       │
//! │ (2B)    │ (1B) │            │ record         │ record        │
//! └─────────┴──────┴────────────┴────────────────┴───────────────┘
//! ```
//!
//! Records are `[varint len][bytes]`. An empty content type selects the
//! listener's default encoder; an empty upgrade record requests no upgrade.

use std::fmt;

use bytes::BufMut;
use duplexwire_frame::{encode_record, FrameError};
use url::Url;

/// Single-byte positive answer to a preamble.
pub const ACK: u8 = 0x00;

/// Record a client sends through an upgraded stream to resume the preamble.
pub const PREAMBLE_END: u8 = 0x0C;

/// Longest accepted via, in bytes.
pub const MAX_VIA_LEN: usize = 2048;

/// Longest accepted content-type or upgrade token, in bytes.
pub const MAX_TOKEN_LEN: usize = 256;

/// Protocol version carried in the first two preamble bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.major, self.minor]
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self {
            major: bytes[0],
            minor: bytes[1],
        }
    }

    /// A client at `self` may talk to a server whose minimum is `server_min`
    /// when the majors agree and the client minor is not older.
    pub fn is_compatible_with(self, server_min: ProtocolVersion) -> bool {
        self.major == server_min.major && self.minor >= server_min.minor
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (major, minor) = value
            .split_once('.')
            .ok_or_else(|| format!("invalid version '{value}': expected '<major>.<minor>'"))?;
        let major = major
            .parse::<u8>()
            .map_err(|_| format!("invalid version '{value}': non-numeric major"))?;
        let minor = minor
            .parse::<u8>()
            .map_err(|_| format!("invalid version '{value}': non-numeric minor"))?;
        Ok(Self { major, minor })
    }
}

/// How envelopes flow once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramingMode {
    /// One sized request, one unframed reply, then close.
    Singleton,
    /// Either side may send envelopes at any time.
    Duplex,
    /// Long-lived request/reply session over envelopes.
    SizedEnvelope,
}

impl FramingMode {
    pub const ALL: [FramingMode; 3] = [
        FramingMode::Singleton,
        FramingMode::Duplex,
        FramingMode::SizedEnvelope,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            FramingMode::Singleton => 0x01,
            FramingMode::Duplex => 0x02,
            FramingMode::SizedEnvelope => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FramingMode::Singleton),
            0x02 => Some(FramingMode::Duplex),
            0x03 => Some(FramingMode::SizedEnvelope),
            _ => None,
        }
    }

    /// Whether the preamble resumes with [`PREAMBLE_END`] after an upgrade.
    pub fn resumes_after_upgrade(self) -> bool {
        !matches!(self, FramingMode::Singleton)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FramingMode::Singleton => "singleton",
            FramingMode::Duplex => "duplex",
            FramingMode::SizedEnvelope => "sized-envelope",
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded preamble. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub version: ProtocolVersion,
    pub mode: FramingMode,
    pub via: Url,
    /// Empty selects the listener's default encoder.
    pub content_type: String,
    pub upgrade: Option<String>,
}

impl Preamble {
    pub fn new(mode: FramingMode, via: Url) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            mode,
            via,
            content_type: String::new(),
            upgrade: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_upgrade(mut self, upgrade: impl Into<String>) -> Self {
        self.upgrade = Some(upgrade.into());
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Append the wire form to `dst`, enforcing record limits.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), FrameError> {
        let via = self.via.as_str();
        check_len(via.len(), MAX_VIA_LEN)?;
        check_len(self.content_type.len(), MAX_TOKEN_LEN)?;
        let upgrade = self.upgrade.as_deref().unwrap_or("");
        check_len(upgrade.len(), MAX_TOKEN_LEN)?;

        dst.put_slice(&self.version.to_bytes());
        dst.put_u8(self.mode.as_byte());
        encode_record(via.as_bytes(), dst)?;
        encode_record(self.content_type.as_bytes(), dst)?;
        encode_record(upgrade.as_bytes(), dst)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(8 + self.via.as_str().len() + self.content_type.len());
        self.encode(&mut out)?;
        Ok(out)
    }
}

fn check_len(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::RecordTooLarge { size, max });
    }
    Ok(())
}
