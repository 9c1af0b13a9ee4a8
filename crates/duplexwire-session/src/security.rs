//! Stream upgrades and the security property they produce.
//!
//! The framing layer never inspects credentials. An upgrade provider runs its
//! own byte exchange over the raw stream and hands back a wrapped stream plus
//! a [`SecurityProperty`] that stays attached to the connection.

use std::fmt;

use async_trait::async_trait;
use duplexwire_frame::read_record_exact;
use duplexwire_transport::BoxedStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::preamble::{ACK, MAX_TOKEN_LEN};

/// Upgrade token of [`IdentityUpgrade`].
pub const IDENTITY_UPGRADE: &str = "application/x-duplexwire-identity";

/// Who is on the other end of an upgraded stream.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub authenticated: bool,
}

impl Principal {
    pub fn authenticated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authenticated: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            name: String::new(),
            authenticated: false,
        }
    }
}

// Principals are logged by name only.
impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("name", &self.name)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// Protection applied by the upgraded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionLevel {
    #[default]
    None,
    Sign,
    EncryptAndSign,
}

/// Opaque result of a successful upgrade, carried for the connection lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProperty {
    pub principal: Principal,
    pub protection: ProtectionLevel,
    /// Upgrade token that produced this property.
    pub upgrade: String,
}

/// Errors from an upgrade exchange.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("upgrade rejected: {0}")]
    Rejected(String),

    #[error("upgrade I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upgrade framing error: {0}")]
    Frame(#[from] duplexwire_frame::FrameError),
}

/// Server half of a stream upgrade.
#[async_trait]
pub trait StreamUpgradeProvider: Send + Sync {
    /// Token matched against the preamble's upgrade record.
    fn upgrade_type(&self) -> &str;

    /// Run the server side of the exchange over `stream`.
    async fn accept(
        &self,
        stream: BoxedStream,
    ) -> Result<(BoxedStream, SecurityProperty), UpgradeError>;
}

/// Client half of a stream upgrade.
#[async_trait]
pub trait StreamUpgradeInitiator: Send + Sync {
    fn upgrade_type(&self) -> &str;

    /// Run the client side of the exchange over `stream`.
    async fn initiate(
        &self,
        stream: BoxedStream,
    ) -> Result<(BoxedStream, SecurityProperty), UpgradeError>;
}

/// Asserted-identity upgrade for trusted local transports.
///
/// The client sends one name record; the server checks it against an optional
/// allow-list and answers with the ack byte. The stream itself is not
/// wrapped, so protection is [`ProtectionLevel::None`].
#[derive(Debug, Clone, Default)]
pub struct IdentityUpgrade {
    /// Name the client asserts (client side).
    pub identity: String,
    /// Names the server accepts; empty accepts any non-empty name.
    pub allowed: Vec<String>,
}

impl IdentityUpgrade {
    pub fn client(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            allowed: Vec::new(),
        }
    }

    pub fn server(allowed: Vec<String>) -> Self {
        Self {
            identity: String::new(),
            allowed,
        }
    }

    fn property(name: String) -> SecurityProperty {
        SecurityProperty {
            principal: Principal::authenticated(name),
            protection: ProtectionLevel::None,
            upgrade: IDENTITY_UPGRADE.to_string(),
        }
    }
}

#[async_trait]
impl StreamUpgradeProvider for IdentityUpgrade {
    fn upgrade_type(&self) -> &str {
        IDENTITY_UPGRADE
    }

    async fn accept(
        &self,
        mut stream: BoxedStream,
    ) -> Result<(BoxedStream, SecurityProperty), UpgradeError> {
        let name = read_record_exact(&mut stream, MAX_TOKEN_LEN).await?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| UpgradeError::Rejected("identity is not UTF-8".to_string()))?;
        if name.is_empty() {
            return Err(UpgradeError::Rejected("empty identity".to_string()));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|allowed| *allowed == name) {
            return Err(UpgradeError::Rejected(format!("identity '{name}' not allowed")));
        }

        stream.write_all(&[ACK]).await?;
        stream.flush().await?;
        Ok((stream, Self::property(name)))
    }
}

#[async_trait]
impl StreamUpgradeInitiator for IdentityUpgrade {
    fn upgrade_type(&self) -> &str {
        IDENTITY_UPGRADE
    }

    async fn initiate(
        &self,
        mut stream: BoxedStream,
    ) -> Result<(BoxedStream, SecurityProperty), UpgradeError> {
        let mut record = Vec::with_capacity(self.identity.len() + 2);
        duplexwire_frame::encode_record(self.identity.as_bytes(), &mut record)?;
        stream.write_all(&record).await?;
        stream.flush().await?;

        let mut answer = [0u8; 1];
        stream.read_exact(&mut answer).await?;
        if answer[0] != ACK {
            return Err(UpgradeError::Rejected(format!(
                "unexpected identity answer 0x{:02x}",
                answer[0]
            )));
        }
        Ok((stream, Self::property(self.identity.clone())))
    }
}
