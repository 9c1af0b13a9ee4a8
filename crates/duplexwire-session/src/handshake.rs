use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duplexwire_frame::{read_record_exact, BufferPool, FrameConfig, FrameError, RecordReader};
use duplexwire_transport::{BoxedStream, RewindStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{ConnectionBuilder, ConnectionState};
use crate::connector::ConnectOptions;
use crate::encoder::{EncoderRegistry, MessageEncoder};
use crate::error::{Result, SessionError};
use crate::fault::{PreambleFault, MAX_FAULT_LEN};
use crate::preamble::{
    FramingMode, Preamble, ProtocolVersion, ACK, MAX_TOKEN_LEN, MAX_VIA_LEN, PREAMBLE_END,
};
use crate::security::{StreamUpgradeProvider, UpgradeError};

/// Upper bound on flushing a fault record before the stream is dropped.
const FAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Listener-side handshake configuration.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Oldest client version accepted (same major required).
    pub version: ProtocolVersion,
    /// Bound on the whole handshake, upgrade included.
    pub timeout: Duration,
    /// Framing modes this listener accepts.
    pub supported_modes: Vec<FramingMode>,
    pub encoders: EncoderRegistry,
    pub upgrades: Vec<Arc<dyn StreamUpgradeProvider>>,
    /// Framing limits applied once the handshake completes.
    pub frame: FrameConfig,
    pub pool: BufferPool,
}

impl HandshakeConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_modes(mut self, modes: &[FramingMode]) -> Self {
        self.supported_modes = modes.to_vec();
        self
    }

    pub fn with_encoders(mut self, encoders: EncoderRegistry) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn with_upgrade(mut self, provider: Arc<dyn StreamUpgradeProvider>) -> Self {
        self.upgrades.push(provider);
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    fn upgrade_provider(&self, token: &str) -> Option<Arc<dyn StreamUpgradeProvider>> {
        self.upgrades
            .iter()
            .find(|provider| provider.upgrade_type() == token)
            .cloned()
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            timeout: Duration::from_secs(10),
            supported_modes: FramingMode::ALL.to_vec(),
            encoders: EncoderRegistry::new(),
            upgrades: Vec::new(),
            frame: FrameConfig::default(),
            pool: BufferPool::new(),
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upgrades: Vec<&str> = self
            .upgrades
            .iter()
            .map(|provider| provider.upgrade_type())
            .collect();
        f.debug_struct("HandshakeConfig")
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("supported_modes", &self.supported_modes)
            .field("encoders", &self.encoders)
            .field("upgrades", &upgrades)
            .field("frame", &self.frame)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Why a server-side handshake stopped.
///
/// Every stage reports one of these; [`HandshakeFailure::wire_fault`] decides
/// what, if anything, goes back on the wire.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeFailure {
    /// Answered with a fault record.
    #[error("preamble fault: {0}")]
    Fault(PreambleFault),

    /// Upgrade provider failed; closed without a fault record.
    #[error("stream upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("transport failure during handshake: {0}")]
    Transport(FrameError),

    /// Peer closed the stream mid-handshake.
    #[error("connection closed during handshake")]
    Closed,

    #[error("handshake cancelled")]
    Cancelled,

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl HandshakeFailure {
    /// The fault record to send, if this failure is answered on the wire.
    pub fn wire_fault(&self) -> Option<PreambleFault> {
        match self {
            HandshakeFailure::Fault(fault) => Some(*fault),
            _ => None,
        }
    }
}

impl From<FrameError> for HandshakeFailure {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::EnvelopeTooLarge { .. } => {
                HandshakeFailure::Fault(PreambleFault::EnvelopeTooLarge)
            }
            err if err.is_protocol_violation() => {
                HandshakeFailure::Fault(PreambleFault::ProtocolViolation)
            }
            FrameError::ConnectionClosed => HandshakeFailure::Closed,
            FrameError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                HandshakeFailure::Closed
            }
            other => HandshakeFailure::Transport(other),
        }
    }
}

impl From<std::io::Error> for HandshakeFailure {
    fn from(err: std::io::Error) -> Self {
        HandshakeFailure::from(FrameError::Io(err))
    }
}

/// Maps a via and framing mode to a registered endpoint.
pub trait EndpointResolver<T> {
    fn resolve(&self, via: &Url, mode: FramingMode) -> Option<T>;
}

impl<T, F> EndpointResolver<T> for F
where
    F: Fn(&Url, FramingMode) -> Option<T>,
{
    fn resolve(&self, via: &Url, mode: FramingMode) -> Option<T> {
        self(via, mode)
    }
}

/// A completed server-side handshake.
pub struct Negotiated<T> {
    pub preamble: Preamble,
    pub endpoint: T,
    pub connection: ConnectionState,
}

struct DecodedPreamble<T> {
    preamble: Preamble,
    endpoint: T,
    encoder: Arc<dyn MessageEncoder>,
    upgrade: Option<Arc<dyn StreamUpgradeProvider>>,
}

/// Run the listener side of the handshake on a freshly accepted stream.
///
/// Faults are answered with a fault record and the stream is dropped; upgrade
/// failures, timeouts, cancellation and transport errors drop it silently.
pub async fn handshake_server<T, R>(
    stream: BoxedStream,
    connection_id: &str,
    config: &HandshakeConfig,
    resolver: &R,
    cancel: &CancellationToken,
) -> std::result::Result<Negotiated<T>, HandshakeFailure>
where
    R: EndpointResolver<T>,
{
    let deadline = Instant::now() + config.timeout;
    let mut reader = RecordReader::new(stream, config.pool.get());

    let decoded = guarded(
        cancel,
        deadline,
        config.timeout,
        read_preamble(&mut reader, config, resolver),
    )
    .await;
    let decoded = match decoded {
        Ok(decoded) => decoded,
        Err(failure) => return Err(reject(reader.get_mut(), failure, connection_id).await),
    };

    let DecodedPreamble {
        preamble,
        endpoint,
        encoder,
        upgrade,
    } = decoded;
    debug!(
        connection_id,
        via = %preamble.via,
        mode = %preamble.mode,
        content_type = encoder.content_type(),
        "preamble accepted"
    );

    guarded(cancel, deadline, config.timeout, async {
        write_flush(reader.get_mut(), &[ACK]).await
    })
    .await?;

    let mut builder = ConnectionBuilder::new(
        connection_id,
        preamble.version,
        preamble.mode,
        preamble.via.clone(),
        encoder,
    );

    let (stream, leftover) = reader.into_parts();
    let (stream, buffered) = match upgrade {
        None => (stream, leftover),
        Some(provider) => {
            let raw: BoxedStream = if leftover.is_empty() {
                stream
            } else {
                Box::new(RewindStream::new(leftover, stream))
            };
            let (mut upgraded, security) = guarded(cancel, deadline, config.timeout, async {
                provider.accept(raw).await.map_err(HandshakeFailure::Upgrade)
            })
            .await
            .inspect_err(|failure| {
                warn!(connection_id, upgrade = provider.upgrade_type(), error = %failure, "stream upgrade failed");
            })?;
            debug!(
                connection_id,
                upgrade = %security.upgrade,
                principal = %security.principal.name,
                "stream upgraded"
            );
            builder.security = Some(security);

            if preamble.mode.resumes_after_upgrade() {
                let resumed = guarded(
                    cancel,
                    deadline,
                    config.timeout,
                    resume_preamble(&mut upgraded),
                )
                .await;
                if let Err(failure) = resumed {
                    return Err(reject(&mut upgraded, failure, connection_id).await);
                }
            }
            (upgraded, Bytes::new())
        }
    };

    info!(connection_id, via = %preamble.via, mode = %preamble.mode, "session negotiated");
    let connection = builder.freeze(stream, buffered, config.frame.clone(), config.pool.clone());
    Ok(Negotiated {
        preamble,
        endpoint,
        connection,
    })
}

/// Answer a connection that will not be served (for example over the
/// connection limit) with `fault`.
///
/// The preamble is drained first so the fault is not lost to a reset caused
/// by unread bytes.
pub async fn refuse_connection(
    stream: BoxedStream,
    connection_id: &str,
    fault: PreambleFault,
    config: &HandshakeConfig,
) {
    let mut reader = RecordReader::new(stream, config.pool.get());
    let drained = tokio::time::timeout(config.timeout, async {
        reader.read_array::<3>().await?;
        reader.read_record(MAX_VIA_LEN).await?;
        reader.read_record(MAX_TOKEN_LEN).await?;
        reader.read_record(MAX_TOKEN_LEN).await?;
        Ok::<(), FrameError>(())
    })
    .await;
    if let Ok(Err(err)) = &drained {
        debug!(connection_id, error = %err, "preamble not fully drained before refusal");
    }
    reject(reader.get_mut(), HandshakeFailure::Fault(fault), connection_id).await;
}

async fn read_preamble<T, R>(
    reader: &mut RecordReader<BoxedStream>,
    config: &HandshakeConfig,
    resolver: &R,
) -> std::result::Result<DecodedPreamble<T>, HandshakeFailure>
where
    R: EndpointResolver<T>,
{
    let version = ProtocolVersion::from_bytes(reader.read_array::<2>().await?);
    if !version.is_compatible_with(config.version) {
        debug!(client = %version, server = %config.version, "incompatible version");
        return Err(HandshakeFailure::Fault(PreambleFault::UnsupportedVersion));
    }

    let mode_byte = reader.read_u8().await?;
    let mode = FramingMode::from_byte(mode_byte)
        .ok_or(HandshakeFailure::Fault(PreambleFault::UnknownMode))?;
    if !config.supported_modes.contains(&mode) {
        return Err(HandshakeFailure::Fault(PreambleFault::UnsupportedMode));
    }

    let via_text = reader.read_string(MAX_VIA_LEN).await?;
    let via = Url::parse(&via_text).map_err(|err| {
        debug!(via = %via_text, error = %err, "invalid via");
        HandshakeFailure::Fault(PreambleFault::EndpointNotFound)
    })?;
    let endpoint = resolver
        .resolve(&via, mode)
        .ok_or(HandshakeFailure::Fault(PreambleFault::EndpointNotFound))?;

    let content_type = reader.read_string(MAX_TOKEN_LEN).await?;
    let encoder = config
        .encoders
        .resolve(&content_type)
        .ok_or(HandshakeFailure::Fault(PreambleFault::ContentTypeMismatch))?;

    let upgrade_token = reader.read_string(MAX_TOKEN_LEN).await?;
    let upgrade = if upgrade_token.is_empty() {
        None
    } else {
        Some(
            config
                .upgrade_provider(&upgrade_token)
                .ok_or(HandshakeFailure::Fault(PreambleFault::UnsupportedUpgrade))?,
        )
    };

    let mut preamble = Preamble::new(mode, via)
        .with_version(version)
        .with_content_type(content_type);
    preamble.upgrade = upgrade.as_ref().map(|_| upgrade_token);

    Ok(DecodedPreamble {
        preamble,
        endpoint,
        encoder,
        upgrade,
    })
}

async fn resume_preamble(stream: &mut BoxedStream) -> std::result::Result<(), HandshakeFailure> {
    let record = stream.read_u8().await?;
    if record != PREAMBLE_END {
        debug!(record, "unexpected record after upgrade");
        return Err(HandshakeFailure::Fault(PreambleFault::ProtocolViolation));
    }
    write_flush(stream, &[ACK]).await
}

/// The single point where handshake failures become wire bytes.
async fn reject(
    stream: &mut BoxedStream,
    failure: HandshakeFailure,
    connection_id: &str,
) -> HandshakeFailure {
    match failure.wire_fault() {
        Some(fault) => {
            warn!(connection_id, fault = fault.as_str(), "rejecting preamble");
            let record = fault.to_record();
            let written = tokio::time::timeout(FAULT_FLUSH_TIMEOUT, async {
                write_flush(stream, &record).await?;
                stream.shutdown().await?;
                Ok::<(), HandshakeFailure>(())
            })
            .await;
            if !matches!(written, Ok(Ok(()))) {
                debug!(connection_id, "fault record could not be delivered");
            }
        }
        None => match &failure {
            HandshakeFailure::Timeout(_) => {
                warn!(connection_id, error = %failure, "handshake timed out")
            }
            HandshakeFailure::Cancelled | HandshakeFailure::Closed => {
                debug!(connection_id, error = %failure, "handshake abandoned")
            }
            _ => warn!(connection_id, error = %failure, "handshake failed"),
        },
    }
    failure
}

async fn guarded<T, F>(
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    fut: F,
) -> std::result::Result<T, HandshakeFailure>
where
    F: Future<Output = std::result::Result<T, HandshakeFailure>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandshakeFailure::Cancelled),
        outcome = tokio::time::timeout_at(deadline, fut) => {
            outcome.unwrap_or(Err(HandshakeFailure::Timeout(timeout)))
        }
    }
}

async fn write_flush(
    stream: &mut BoxedStream,
    bytes: &[u8],
) -> std::result::Result<(), HandshakeFailure> {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the client side of the handshake.
pub async fn handshake_client(
    stream: BoxedStream,
    options: &ConnectOptions,
) -> Result<ConnectionState> {
    tokio::time::timeout(options.timeout, client_handshake(stream, options))
        .await
        .map_err(|_| SessionError::Timeout(options.timeout))?
}

async fn client_handshake(
    mut stream: BoxedStream,
    options: &ConnectOptions,
) -> Result<ConnectionState> {
    let encoder = options
        .encoders
        .resolve(&options.content_type)
        .ok_or_else(|| {
            SessionError::HandshakeFailed(format!(
                "no local encoder for content type '{}'",
                options.content_type
            ))
        })?;

    let mut preamble = Preamble::new(options.mode, options.via.clone())
        .with_version(options.version)
        .with_content_type(options.content_type.clone());
    if let Some(initiator) = &options.upgrade {
        preamble = preamble.with_upgrade(initiator.upgrade_type());
    }

    stream.write_all(&preamble.to_bytes()?).await?;
    stream.flush().await?;
    read_answer(&mut stream).await?;
    debug!(via = %options.via, mode = %options.mode, "preamble acknowledged");

    let mut security = None;
    if let Some(initiator) = &options.upgrade {
        let (mut upgraded, property) = initiator.initiate(stream).await?;
        if options.mode.resumes_after_upgrade() {
            upgraded.write_all(&[PREAMBLE_END]).await?;
            upgraded.flush().await?;
            read_answer(&mut upgraded).await?;
        }
        stream = upgraded;
        security = Some(property);
    }

    let mut builder = ConnectionBuilder::new(
        "client",
        options.version,
        options.mode,
        options.via.clone(),
        encoder,
    );
    builder.security = security;
    Ok(builder.freeze(
        stream,
        Bytes::new(),
        options.frame.clone(),
        BufferPool::with_capacity(1, duplexwire_frame::DEFAULT_BUFFER_SIZE),
    ))
}

/// Read the server's answer: the ack byte, or a fault record.
async fn read_answer(stream: &mut BoxedStream) -> Result<()> {
    let first = match stream.read_u8().await {
        Ok(byte) => byte,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SessionError::Disconnected(
                "connection closed during handshake".to_string(),
            ))
        }
        Err(err) => return Err(err.into()),
    };
    if first == ACK {
        return Ok(());
    }

    let prefix = [first];
    let mut chained = (&prefix[..]).chain(&mut *stream);
    let record = read_record_exact(&mut chained, MAX_FAULT_LEN).await?;
    let text = String::from_utf8_lossy(&record);
    match PreambleFault::from_wire(&text) {
        Some(fault) => Err(SessionError::Fault(fault)),
        None => Err(SessionError::HandshakeFailed(format!(
            "unrecognized fault '{text}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::DuplexStream;

    use super::*;
    use crate::encoder::JSON_CONTENT_TYPE;
    use crate::security::IdentityUpgrade;

    fn small_config() -> HandshakeConfig {
        HandshakeConfig::default().with_pool(BufferPool::with_capacity(2, 256))
    }

    fn resolve_svc(via: &Url, _mode: FramingMode) -> Option<&'static str> {
        (via.path() == "/svc").then_some("svc")
    }

    fn pair() -> (DuplexStream, BoxedStream) {
        let (client, server) = tokio::io::duplex(4096);
        (client, Box::new(server))
    }

    fn preamble_bytes(mode: FramingMode, via: &str) -> Vec<u8> {
        Preamble::new(mode, Url::parse(via).unwrap())
            .to_bytes()
            .unwrap()
    }

    async fn server(
        stream: BoxedStream,
        config: HandshakeConfig,
    ) -> std::result::Result<Negotiated<&'static str>, HandshakeFailure> {
        handshake_server(
            stream,
            "conn-1",
            &config,
            &resolve_svc,
            &CancellationToken::new(),
        )
        .await
    }

    async fn read_all(mut client: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn sized_envelope_preamble_is_acked() {
        let (mut client, stream) = pair();
        let mut bytes = preamble_bytes(FramingMode::SizedEnvelope, "proto://host/svc");
        bytes.extend_from_slice(&[0x03, b'a', b'b', b'c']);
        client.write_all(&bytes).await.unwrap();

        let negotiated = server(stream, small_config()).await.unwrap();
        assert_eq!(negotiated.endpoint, "svc");
        assert_eq!(negotiated.preamble.mode, FramingMode::SizedEnvelope);
        assert_eq!(negotiated.connection.info().id, "conn-1");
        // Pipelined envelope bytes are handed to the framer.
        assert_eq!(negotiated.connection.buffered(), &[0x03, b'a', b'b', b'c']);

        assert_eq!(client.read_u8().await.unwrap(), ACK);
    }

    #[tokio::test]
    async fn unknown_mode_faults_before_via_is_read() {
        let (mut client, stream) = pair();
        // No via follows; the server must not wait for one.
        client.write_all(&[1, 0, 0x7F]).await.unwrap();

        let failure = server(stream, small_config()).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::UnknownMode));
        assert_eq!(read_all(client).await, PreambleFault::UnknownMode.to_record());
    }

    #[tokio::test]
    async fn incompatible_version_faults() {
        let (mut client, stream) = pair();
        client.write_all(&[2, 0, 3]).await.unwrap();
        let failure = server(stream, small_config()).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::UnsupportedVersion));
        assert_eq!(
            read_all(client).await,
            PreambleFault::UnsupportedVersion.to_record()
        );
    }

    #[tokio::test]
    async fn disabled_mode_faults() {
        let (mut client, stream) = pair();
        client
            .write_all(&preamble_bytes(FramingMode::Duplex, "proto://host/svc"))
            .await
            .unwrap();
        let config = small_config().with_modes(&[FramingMode::SizedEnvelope]);
        let failure = server(stream, config).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::UnsupportedMode));
    }

    #[tokio::test]
    async fn unmatched_and_invalid_via_fault_endpoint_not_found() {
        for via in ["proto://host/other", "not a uri"] {
            let (mut client, stream) = pair();
            let mut bytes = vec![1, 0, 3];
            duplexwire_frame::encode_record(via.as_bytes(), &mut bytes).unwrap();
            bytes.extend_from_slice(&[0, 0]);
            client.write_all(&bytes).await.unwrap();

            let failure = server(stream, small_config()).await.err().unwrap();
            assert_eq!(failure.wire_fault(), Some(PreambleFault::EndpointNotFound));
            assert_eq!(
                read_all(client).await,
                PreambleFault::EndpointNotFound.to_record()
            );
        }
    }

    #[tokio::test]
    async fn unknown_content_type_faults() {
        let (mut client, stream) = pair();
        let bytes = Preamble::new(
            FramingMode::SizedEnvelope,
            Url::parse("proto://host/svc").unwrap(),
        )
        .with_content_type("text/xml")
        .to_bytes()
        .unwrap();
        client.write_all(&bytes).await.unwrap();
        let failure = server(stream, small_config()).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::ContentTypeMismatch));
    }

    #[tokio::test]
    async fn unknown_upgrade_faults() {
        let (mut client, stream) = pair();
        let bytes = Preamble::new(
            FramingMode::SizedEnvelope,
            Url::parse("proto://host/svc").unwrap(),
        )
        .with_upgrade("application/tls")
        .to_bytes()
        .unwrap();
        client.write_all(&bytes).await.unwrap();
        let failure = server(stream, small_config()).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::UnsupportedUpgrade));
    }

    #[tokio::test]
    async fn malformed_via_length_is_protocol_violation() {
        let (mut client, stream) = pair();
        client
            .write_all(&[1, 0, 3, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01])
            .await
            .unwrap();
        let failure = server(stream, small_config()).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::ProtocolViolation));
    }

    #[tokio::test]
    async fn truncated_preamble_closes_without_fault() {
        let (mut client, stream) = pair();
        client.write_all(&[1, 0, 3, 10, b'p']).await.unwrap();
        client.shutdown().await.unwrap();
        let failure = server(stream, small_config()).await.err().unwrap();
        assert!(matches!(failure, HandshakeFailure::Closed));
        assert!(read_all(client).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_preamble_times_out() {
        let (client, stream) = pair();
        let config = small_config().with_timeout(Duration::from_secs(3));
        let failure = server(stream, config).await.err().unwrap();
        assert!(matches!(failure, HandshakeFailure::Timeout(_)));
        assert!(read_all(client).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_without_fault() {
        let (client, stream) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = handshake_server(stream, "conn-1", &small_config(), &resolve_svc, &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(failure, HandshakeFailure::Cancelled));
        assert!(read_all(client).await.is_empty());
    }

    #[tokio::test]
    async fn resolver_sees_mode_and_via() {
        let calls = AtomicUsize::new(0);
        let resolver = |via: &Url, mode: FramingMode| {
            calls.fetch_add(1, Ordering::SeqCst);
            (mode == FramingMode::Duplex && via.host_str() == Some("host")).then_some(7u32)
        };
        let (mut client, stream) = pair();
        client
            .write_all(&preamble_bytes(FramingMode::Duplex, "proto://host/any"))
            .await
            .unwrap();
        let negotiated = handshake_server(
            stream,
            "conn-2",
            &small_config(),
            &resolver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(negotiated.endpoint, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refuse_connection_writes_server_too_busy() {
        let (mut client, stream) = pair();
        client
            .write_all(&preamble_bytes(FramingMode::SizedEnvelope, "proto://host/svc"))
            .await
            .unwrap();
        refuse_connection(stream, "conn-9", PreambleFault::ServerTooBusy, &small_config()).await;
        assert_eq!(
            read_all(client).await,
            PreambleFault::ServerTooBusy.to_record()
        );
    }

    fn options(mode: FramingMode) -> ConnectOptions {
        ConnectOptions::new(Url::parse("proto://host/svc").unwrap(), mode)
    }

    #[tokio::test]
    async fn client_and_server_agree() {
        let (client, server_stream) = tokio::io::duplex(4096);
        let options = options(FramingMode::SizedEnvelope).with_content_type(JSON_CONTENT_TYPE);
        let (client_state, negotiated) = tokio::join!(
            handshake_client(Box::new(client), &options),
            server(Box::new(server_stream), small_config())
        );
        let client_state = client_state.unwrap();
        let negotiated = negotiated.unwrap();
        assert_eq!(client_state.info().content_type(), JSON_CONTENT_TYPE);
        assert_eq!(negotiated.connection.info().content_type(), JSON_CONTENT_TYPE);
        assert!(negotiated.connection.info().security.is_none());
    }

    #[tokio::test]
    async fn client_surfaces_fault() {
        let (client, server_stream) = tokio::io::duplex(4096);
        let options = ConnectOptions::new(
            Url::parse("proto://host/missing").unwrap(),
            FramingMode::SizedEnvelope,
        );
        let (client_state, _) = tokio::join!(
            handshake_client(Box::new(client), &options),
            server(Box::new(server_stream), small_config())
        );
        assert!(matches!(
            client_state,
            Err(SessionError::Fault(PreambleFault::EndpointNotFound))
        ));
    }

    #[tokio::test]
    async fn upgrade_with_resume_for_duplex() {
        let (client, server_stream) = tokio::io::duplex(4096);
        let config = small_config().with_upgrade(Arc::new(IdentityUpgrade::server(vec![
            "alice".to_string(),
        ])));
        let options = options(FramingMode::Duplex)
            .with_upgrade(Arc::new(IdentityUpgrade::client("alice")));

        let (client_state, negotiated) = tokio::join!(
            handshake_client(Box::new(client), &options),
            server(Box::new(server_stream), config)
        );
        let client_state = client_state.unwrap();
        let negotiated = negotiated.unwrap();

        let security = negotiated.connection.info().security.clone().unwrap();
        assert_eq!(security.principal.name, "alice");
        assert!(security.principal.authenticated);
        assert_eq!(
            negotiated.preamble.upgrade.as_deref(),
            Some(crate::security::IDENTITY_UPGRADE)
        );
        assert!(client_state.info().security.is_some());
    }

    #[tokio::test]
    async fn upgrade_for_singleton_skips_resume() {
        let (client, server_stream) = tokio::io::duplex(4096);
        let config = small_config().with_upgrade(Arc::new(IdentityUpgrade::server(Vec::new())));
        let options =
            options(FramingMode::Singleton).with_upgrade(Arc::new(IdentityUpgrade::client("bob")));

        let (client_state, negotiated) = tokio::join!(
            handshake_client(Box::new(client), &options),
            server(Box::new(server_stream), config)
        );
        assert!(client_state.is_ok());
        assert_eq!(negotiated.unwrap().connection.mode(), FramingMode::Singleton);
    }

    #[tokio::test]
    async fn rejected_upgrade_closes_without_fault() {
        let (client, server_stream) = tokio::io::duplex(4096);
        let config = small_config().with_upgrade(Arc::new(IdentityUpgrade::server(vec![
            "alice".to_string(),
        ])));
        let options = options(FramingMode::SizedEnvelope)
            .with_upgrade(Arc::new(IdentityUpgrade::client("mallory")));

        let (client_state, negotiated) = tokio::join!(
            handshake_client(Box::new(client), &options),
            server(Box::new(server_stream), config)
        );
        assert!(matches!(negotiated, Err(HandshakeFailure::Upgrade(_))));
        assert!(client_state.is_err());
        assert!(!matches!(client_state, Err(SessionError::Fault(_))));
    }

    #[tokio::test]
    async fn wrong_resume_record_is_protocol_violation() {
        let (mut client, stream) = pair();
        let config = small_config().with_upgrade(Arc::new(IdentityUpgrade::server(Vec::new())));
        let bytes = Preamble::new(
            FramingMode::SizedEnvelope,
            Url::parse("proto://host/svc").unwrap(),
        )
        .with_upgrade(crate::security::IDENTITY_UPGRADE)
        .to_bytes()
        .unwrap();
        client.write_all(&bytes).await.unwrap();
        let mut identity = Vec::new();
        duplexwire_frame::encode_record(b"carol", &mut identity).unwrap();
        client.write_all(&identity).await.unwrap();
        client.write_all(&[0x42]).await.unwrap();

        let failure = server(stream, config).await.err().unwrap();
        assert_eq!(failure.wire_fault(), Some(PreambleFault::ProtocolViolation));

        let mut expected = vec![ACK, ACK];
        expected.extend_from_slice(&PreambleFault::ProtocolViolation.to_record());
        assert_eq!(read_all(client).await, expected);
    }

    #[test]
    fn debug_lists_upgrade_tokens() {
        let config = small_config().with_upgrade(Arc::new(IdentityUpgrade::server(Vec::new())));
        let debug = format!("{config:?}");
        assert!(debug.contains(crate::security::IDENTITY_UPGRADE));
        assert!(debug.contains("application/x-duplexwire-binary"));
    }
}
