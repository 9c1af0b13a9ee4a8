//! Per-connection negotiated state.
//!
//! A [`ConnectionBuilder`] collects what each handshake stage decides. Once
//! steady-state framing begins it is frozen into a [`ConnectionState`], which
//! owns the (possibly upgraded) stream, and a cloneable [`ConnectionInfo`]
//! that dispatch shares with every request on the connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use duplexwire_frame::{BufferPool, FrameConfig};
use duplexwire_transport::BoxedStream;
use url::Url;

use crate::encoder::MessageEncoder;
use crate::message::Message;
use crate::preamble::{FramingMode, ProtocolVersion};
use crate::security::SecurityProperty;

/// Immutable description of a negotiated connection.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub version: ProtocolVersion,
    pub mode: FramingMode,
    pub via: Url,
    pub encoder: Arc<dyn MessageEncoder>,
    pub security: Option<SecurityProperty>,
    pub frame: FrameConfig,
}

impl ConnectionInfo {
    /// Copy connection-scoped properties into an inbound message.
    pub fn stamp(&self, message: &mut Message) {
        message.properties.via = Some(self.via.clone());
        message.properties.security = self.security.clone();
        message.properties.connection_id = Some(self.id.clone());
    }

    pub fn content_type(&self) -> &str {
        self.encoder.content_type()
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .field("via", &self.via.as_str())
            .field("content_type", &self.content_type())
            .field("security", &self.security)
            .finish()
    }
}

/// A negotiated connection ready for steady-state framing.
pub struct ConnectionState {
    info: ConnectionInfo,
    stream: BoxedStream,
    /// Bytes read past the end of the handshake.
    buffered: Bytes,
    pool: BufferPool,
}

impl ConnectionState {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn mode(&self) -> FramingMode {
        self.info.mode
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    /// Release the stream for framing, with any bytes already read from it.
    pub fn into_parts(self) -> (BoxedStream, Bytes, ConnectionInfo, BufferPool) {
        (self.stream, self.buffered, self.info, self.pool)
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("info", &self.info)
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

/// Mutable handshake-time view of a connection.
///
/// Created once the preamble is decoded; later stages (the upgrade) fill in
/// the rest before [`ConnectionBuilder::freeze`].
pub(crate) struct ConnectionBuilder {
    pub(crate) id: String,
    pub(crate) version: ProtocolVersion,
    pub(crate) mode: FramingMode,
    pub(crate) via: Url,
    pub(crate) encoder: Arc<dyn MessageEncoder>,
    pub(crate) security: Option<SecurityProperty>,
}

impl ConnectionBuilder {
    pub(crate) fn new(
        id: impl Into<String>,
        version: ProtocolVersion,
        mode: FramingMode,
        via: Url,
        encoder: Arc<dyn MessageEncoder>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            mode,
            via,
            encoder,
            security: None,
        }
    }

    pub(crate) fn freeze(
        self,
        stream: BoxedStream,
        buffered: Bytes,
        frame: FrameConfig,
        pool: BufferPool,
    ) -> ConnectionState {
        ConnectionState {
            info: ConnectionInfo {
                id: self.id,
                version: self.version,
                mode: self.mode,
                via: self.via,
                encoder: self.encoder,
                security: self.security,
                frame,
            },
            stream,
            buffered,
            pool,
        }
    }
}
