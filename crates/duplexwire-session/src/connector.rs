use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duplexwire_frame::{Envelope, EnvelopeCodec, EnvelopeReader, EnvelopeWriter, FrameConfig};
use duplexwire_transport::{BoxedStream, TransportAddress};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tracing::debug;
use url::Url;

use crate::connection::ConnectionInfo;
use crate::encoder::EncoderRegistry;
use crate::error::{Result, SessionError};
use crate::fault::PreambleFault;
use crate::handshake::handshake_client;
use crate::message::Message;
use crate::preamble::{FramingMode, ProtocolVersion};
use crate::security::StreamUpgradeInitiator;

/// Client-side handshake and session options.
#[derive(Clone)]
pub struct ConnectOptions {
    pub via: Url,
    pub mode: FramingMode,
    pub version: ProtocolVersion,
    /// Empty requests the listener's default encoder, which must match the
    /// local registry's default.
    pub content_type: String,
    pub encoders: EncoderRegistry,
    pub upgrade: Option<Arc<dyn StreamUpgradeInitiator>>,
    /// Bound on the handshake.
    pub timeout: Duration,
    pub frame: FrameConfig,
}

impl ConnectOptions {
    pub fn new(via: Url, mode: FramingMode) -> Self {
        Self {
            via,
            mode,
            version: ProtocolVersion::CURRENT,
            content_type: String::new(),
            encoders: EncoderRegistry::new(),
            upgrade: None,
            timeout: Duration::from_secs(10),
            frame: FrameConfig::default(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_upgrade(mut self, initiator: Arc<dyn StreamUpgradeInitiator>) -> Self {
        self.upgrade = Some(initiator);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("via", &self.via.as_str())
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("content_type", &self.content_type)
            .field(
                "upgrade",
                &self.upgrade.as_ref().map(|initiator| initiator.upgrade_type()),
            )
            .field("timeout", &self.timeout)
            .field("frame", &self.frame)
            .finish()
    }
}

/// Connect to `address` and negotiate a Duplex or SizedEnvelope session.
pub async fn connect_to(address: &TransportAddress, options: ConnectOptions) -> Result<ClientSession> {
    let stream = address.connect().await?;
    connect(stream.into_boxed(), options).await
}

/// Negotiate a Duplex or SizedEnvelope session over an open stream.
pub async fn connect(stream: BoxedStream, options: ConnectOptions) -> Result<ClientSession> {
    if options.mode == FramingMode::Singleton {
        return Err(SessionError::WrongMode {
            operation: "connect",
            mode: options.mode,
        });
    }
    let state = handshake_client(stream, &options).await?;
    let (stream, _, info, _) = state.into_parts();
    Ok(ClientSession {
        framed: Framed::new(stream, EnvelopeCodec::new(info.frame.clone())),
        info,
        pending: VecDeque::new(),
        next_message_id: 1,
        server_ended: false,
    })
}

/// Perform a complete Singleton exchange: handshake, one request, one reply.
pub async fn call_singleton(
    stream: BoxedStream,
    options: ConnectOptions,
    message: Message,
) -> Result<Message> {
    if options.mode != FramingMode::Singleton {
        return Err(SessionError::WrongMode {
            operation: "call_singleton",
            mode: options.mode,
        });
    }
    let state = handshake_client(stream, &options).await?;
    let (stream, _, info, _) = state.into_parts();

    let mut payload = Vec::new();
    info.encoder.encode(&message, &mut payload)?;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut writer = EnvelopeWriter::with_config(write_half, info.frame.clone());
    writer.write_envelope(&payload).await?;

    let reader = EnvelopeReader::with_config(read_half, info.frame.clone());
    let body = reader.read_to_end(info.frame.max_envelope_size).await?;
    if body.is_empty() {
        return Err(SessionError::Disconnected(
            "server closed without a reply".to_string(),
        ));
    }
    let mut reply = info.encoder.decode(body)?;
    info.stamp(&mut reply);
    Ok(reply)
}

/// A negotiated client session.
pub struct ClientSession {
    framed: Framed<BoxedStream, EnvelopeCodec>,
    info: ConnectionInfo,
    /// Messages read while waiting for a correlated reply.
    pending: VecDeque<Message>,
    next_message_id: u64,
    server_ended: bool,
}

impl ClientSession {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn mode(&self) -> FramingMode {
        self.info.mode
    }

    /// Send a message without waiting for anything back.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        let mut payload = Vec::new();
        self.info.encoder.encode(&message, &mut payload)?;
        self.framed.send(Envelope::Data(Bytes::from(payload))).await?;
        Ok(())
    }

    /// Send a keep-alive envelope.
    pub async fn keep_alive(&mut self) -> Result<()> {
        self.framed.send(Envelope::KeepAlive).await?;
        Ok(())
    }

    /// Next inbound message, or `None` once the server has ended the session.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.read_message().await
    }

    /// Send `message` and wait for the reply that relates to it. Messages
    /// that arrive first (Duplex callbacks) stay queued for [`recv`].
    ///
    /// [`recv`]: ClientSession::recv
    pub async fn request(&mut self, mut message: Message) -> Result<Message> {
        let id = match message.message_id() {
            Some(id) => id,
            None => {
                let id = self.next_message_id;
                self.next_message_id += 1;
                message.headers.message_id = Some(id);
                id
            }
        };
        self.send(message).await?;

        loop {
            match self.read_message().await? {
                Some(reply) if reply.relates_to() == Some(id) => return Ok(reply),
                Some(other) => self.pending.push_back(other),
                None => {
                    return Err(SessionError::Disconnected(
                        "session ended before the reply arrived".to_string(),
                    ))
                }
            }
        }
    }

    /// End the session: write the terminator, wait for the server's, then
    /// shut down the write side.
    pub async fn close(mut self) -> Result<()> {
        self.framed.send(Envelope::End).await?;
        while !self.server_ended {
            match self.read_message().await {
                Ok(Some(message)) => {
                    debug!(action = message.action(), "discarding message received while closing");
                }
                Ok(None) => break,
                Err(SessionError::Disconnected(_)) => break,
                Err(err) => return Err(err),
            }
        }
        let mut stream = self.framed.into_inner();
        if let Err(err) = stream.shutdown().await {
            debug!(error = %err, "shutdown after close failed");
        }
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<Message>> {
        if self.server_ended {
            return Ok(None);
        }
        loop {
            match self.framed.next().await.transpose()? {
                Some(Envelope::Data(payload)) => {
                    let mut message = match self.info.encoder.decode(payload.clone()) {
                        Ok(message) => message,
                        // A listener that hits a framing fault mid-session
                        // answers with a bare fault record and closes.
                        Err(err) => match fault_record(&payload) {
                            Some(fault) => {
                                self.server_ended = true;
                                return Err(SessionError::Fault(fault));
                            }
                            None => return Err(err.into()),
                        },
                    };
                    self.info.stamp(&mut message);
                    return Ok(Some(message));
                }
                Some(Envelope::KeepAlive) => continue,
                Some(Envelope::End) => {
                    self.server_ended = true;
                    return Ok(None);
                }
                None => {
                    self.server_ended = true;
                    return Err(SessionError::Disconnected(
                        "stream closed without a session terminator".to_string(),
                    ));
                }
            }
        }
    }
}

fn fault_record(payload: &[u8]) -> Option<PreambleFault> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(PreambleFault::from_wire)
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("info", &self.info)
            .field("pending", &self.pending.len())
            .field("server_ended", &self.server_ended)
            .finish()
    }
}
