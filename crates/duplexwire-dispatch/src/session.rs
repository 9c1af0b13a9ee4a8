//! Steady-state session loops, one per framing mode.
//!
//! The read side runs on the connection's task; replies, callbacks and the
//! closing terminator all go through the writer task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use duplexwire_frame::{Envelope, EnvelopeReader, EnvelopeWriter, FrameError};
use duplexwire_session::{
    ConnectionInfo, ConnectionState, FaultCode, FramingMode, Message, PreambleFault,
};
use tokio::io::{AsyncRead, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authorization::Authorizer;
use crate::dispatcher::{fault_message, ChannelDispatcher};
use crate::idle::{IdleHandle, SessionActivity};
use crate::registry::Registration;
use crate::writer::{Outbound, WriterTask};

/// Upper bound on flushing the closing envelope or fault record.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Turned away before the handshake (connection limit).
    Refused,
    /// Handshake answered with a fault record.
    Fault(PreambleFault),
    /// Handshake stopped without a fault record (upgrade failure, timeout).
    HandshakeFailed(String),
    /// The Singleton exchange completed.
    Completed,
    /// The client sent the session terminator.
    ClientEnded,
    /// The stream ended without a terminator.
    PeerClosed,
    /// Idle close, operation timeout or host shutdown.
    Cancelled,
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Refused => f.write_str("refused"),
            CloseReason::Fault(fault) => write!(f, "fault {fault}"),
            CloseReason::HandshakeFailed(reason) => write!(f, "handshake failed: {reason}"),
            CloseReason::Completed => f.write_str("completed"),
            CloseReason::ClientEnded => f.write_str("client ended"),
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Cancelled => f.write_str("cancelled"),
            CloseReason::Transport(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

/// Per-session knobs taken from the host configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) outbound_queue: usize,
    pub(crate) keep_alive_interval: Option<Duration>,
}

enum Inbound {
    Message(Message),
    /// Keep-alive or an undecodable payload that was already answered.
    Skip,
    Closed(CloseReason),
}

struct InboundReader<R> {
    reader: EnvelopeReader<R>,
    info: ConnectionInfo,
    activity: Arc<SessionActivity>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    writer_failed: CancellationToken,
}

impl<R: AsyncRead + Unpin> InboundReader<R> {
    async fn next(&mut self) -> Inbound {
        let read = tokio::select! {
            biased;
            _ = self.writer_failed.cancelled() => {
                // Nothing can be answered any more; stop running operations.
                self.cancel.cancel();
                return Inbound::Closed(CloseReason::Transport("writer failed".to_string()));
            }
            _ = self.cancel.cancelled() => return Inbound::Closed(CloseReason::Cancelled),
            read = self.reader.read_envelope() => read,
        };
        let connection_id = self.info.id.as_str();
        match read {
            Ok(Some(Envelope::Data(payload))) => {
                self.activity.touch();
                debug!(connection_id, len = payload.len(), "envelope received");
                match self.info.encoder.decode(payload) {
                    Ok(message) => Inbound::Message(message),
                    Err(err) => {
                        warn!(connection_id, error = %err, "undecodable message");
                        let fault = fault_message(None, FaultCode::InvalidMessage, err.to_string());
                        if self.outbound.send(Outbound::Message(fault)).await.is_err() {
                            return Inbound::Closed(CloseReason::Transport(
                                "writer stopped".to_string(),
                            ));
                        }
                        Inbound::Skip
                    }
                }
            }
            Ok(Some(Envelope::KeepAlive)) => {
                debug!(connection_id, "keep-alive received");
                Inbound::Skip
            }
            Ok(Some(Envelope::End)) => Inbound::Closed(CloseReason::ClientEnded),
            Ok(None) | Err(FrameError::ConnectionClosed) => Inbound::Closed(CloseReason::PeerClosed),
            Err(FrameError::EnvelopeTooLarge { size, max }) => {
                warn!(connection_id, size, max, "envelope too large");
                Inbound::Closed(CloseReason::Fault(PreambleFault::EnvelopeTooLarge))
            }
            Err(err) if err.is_protocol_violation() => {
                warn!(connection_id, error = %err, "protocol violation");
                Inbound::Closed(CloseReason::Fault(PreambleFault::ProtocolViolation))
            }
            Err(err) => Inbound::Closed(CloseReason::Transport(err.to_string())),
        }
    }
}

/// Serve a negotiated connection until it ends.
pub(crate) async fn run_session(
    connection: ConnectionState,
    registration: Arc<Registration>,
    authorizer: Arc<dyn Authorizer>,
    idle: IdleHandle,
    cancel: CancellationToken,
    settings: &SessionSettings,
) -> CloseReason {
    let (stream, buffered, info, pool) = connection.into_parts();
    let (read_half, write_half) = tokio::io::split(stream);
    let activity = Arc::clone(idle.activity());

    let (tx, rx) = mpsc::channel(settings.outbound_queue.max(1));
    let writer_failed = CancellationToken::new();
    let writer = WriterTask::new(
        info.id.clone(),
        info.mode,
        EnvelopeWriter::with_config(write_half, info.frame.clone()),
        Arc::clone(&info.encoder),
        pool,
        Arc::clone(&activity),
        writer_failed.clone(),
    );
    let mut writer = tokio::spawn(writer.run(rx));

    let keep_alive = match settings.keep_alive_interval {
        Some(interval) if info.mode != FramingMode::Singleton && info.frame.keep_alive => Some(
            tokio::spawn(send_keep_alives(tx.clone(), interval, cancel.clone())),
        ),
        _ => None,
    };

    let dispatcher = Arc::new(ChannelDispatcher::bind(
        registration,
        info.clone(),
        authorizer,
        tx.clone(),
        cancel.clone(),
    ));
    let mut inbound: InboundReader<ReadHalf<_>> = InboundReader {
        reader: EnvelopeReader::with_leftover(read_half, info.frame.clone(), &buffered),
        info: info.clone(),
        activity: Arc::clone(&activity),
        outbound: tx.clone(),
        cancel: cancel.clone(),
        writer_failed,
    };

    let (reason, requests) = match info.mode {
        FramingMode::Singleton => serve_singleton(&mut inbound, &dispatcher).await,
        FramingMode::SizedEnvelope => serve_sequential(&mut inbound, &dispatcher).await,
        FramingMode::Duplex => serve_concurrent(&mut inbound, &dispatcher, &cancel).await,
    };

    if let Some(keep_alive) = keep_alive {
        keep_alive.abort();
    }
    drop(inbound);
    drop(dispatcher);

    let last = match &reason {
        CloseReason::Fault(fault) => Outbound::Fault(*fault),
        _ => Outbound::End,
    };
    let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        // The writer is already gone after a Singleton reply.
        let _ = tx.send(last).await;
        drop(tx);
        (&mut writer).await
    })
    .await;
    if flushed.is_err() {
        warn!(connection_id = %info.id, "writer did not finish, abandoning connection");
        writer.abort();
    }

    info!(
        connection_id = %info.id,
        via = %info.via,
        mode = %info.mode,
        requests,
        reason = %reason,
        "session closed"
    );
    drop(idle);
    reason
}

async fn serve_singleton<R: AsyncRead + Unpin>(
    inbound: &mut InboundReader<R>,
    dispatcher: &ChannelDispatcher,
) -> (CloseReason, u64) {
    match inbound.next().await {
        Inbound::Message(message) => {
            dispatcher
                .process(message, inbound.activity.begin_request())
                .await;
            (CloseReason::Completed, 1)
        }
        Inbound::Skip => (CloseReason::Completed, 0),
        Inbound::Closed(reason) => (reason, 0),
    }
}

async fn serve_sequential<R: AsyncRead + Unpin>(
    inbound: &mut InboundReader<R>,
    dispatcher: &ChannelDispatcher,
) -> (CloseReason, u64) {
    let mut requests = 0;
    loop {
        match inbound.next().await {
            Inbound::Message(message) => {
                requests += 1;
                dispatcher
                    .process(message, inbound.activity.begin_request())
                    .await;
            }
            Inbound::Skip => {}
            Inbound::Closed(reason) => return (reason, requests),
        }
    }
}

async fn serve_concurrent<R: AsyncRead + Unpin>(
    inbound: &mut InboundReader<R>,
    dispatcher: &Arc<ChannelDispatcher>,
    cancel: &CancellationToken,
) -> (CloseReason, u64) {
    let mut requests = 0;
    let mut tasks = JoinSet::new();
    let reason = loop {
        while let Some(finished) = tasks.try_join_next() {
            log_task_result(&inbound.info.id, finished);
        }
        match inbound.next().await {
            Inbound::Message(message) => {
                requests += 1;
                let dispatcher = Arc::clone(dispatcher);
                let in_flight = inbound.activity.begin_request();
                tasks.spawn(async move { dispatcher.process(message, in_flight).await });
            }
            Inbound::Skip => {}
            Inbound::Closed(reason) => break reason,
        }
    };

    // Let in-flight requests reply unless the session is being torn down.
    let torn_down = matches!(reason, CloseReason::Cancelled | CloseReason::Transport(_));
    if torn_down {
        tasks.abort_all();
    }
    loop {
        tokio::select! {
            finished = tasks.join_next() => match finished {
                Some(finished) => log_task_result(&inbound.info.id, finished),
                None => break,
            },
            _ = cancel.cancelled(), if !torn_down => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return (CloseReason::Cancelled, requests);
            }
        }
    }
    (reason, requests)
}

fn log_task_result(connection_id: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(connection_id, "request task panicked");
        }
    }
}

async fn send_keep_alives(
    outbound: mpsc::Sender<Outbound>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                // Skip a beat rather than queue behind real traffic.
                if let Err(mpsc::error::TrySendError::Closed(_)) = outbound.try_send(Outbound::KeepAlive) {
                    return;
                }
            }
        }
    }
}
