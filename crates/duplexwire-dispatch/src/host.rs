//! The service host: accept loop, connection limit and per-connection
//! handshake, resolution and session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use duplexwire_session::{
    handshake_server, refuse_connection, FramingMode, HandshakeConfig, HandshakeFailure,
    PreambleFault,
};
use duplexwire_transport::BoxedStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::authorization::{AllowAll, Authorizer};
use crate::cache::MruCache;
use crate::descriptor::ChannelShape;
use crate::error::Result;
use crate::idle::SessionIdleManager;
use crate::listener::SessionListener;
use crate::registry::{DispatcherRegistry, Registration};
use crate::session::{run_session, CloseReason, SessionSettings};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Service host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Handshake limits, supported modes, encoders, upgrades and the buffer
    /// pool shared by every connection.
    pub handshake: HandshakeConfig,
    /// Close sessions idle this long with nothing in flight. `None` disables.
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub max_connections: usize,
    /// Send keep-alive envelopes at this interval when keep-alive framing is
    /// enabled.
    pub keep_alive_interval: Option<Duration>,
    pub cache_high_watermark: usize,
    pub cache_low_watermark: usize,
    /// Depth of each connection's writer queue.
    pub outbound_queue: usize,
}

impl HostConfig {
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_cache_watermarks(mut self, high: usize, low: usize) -> Self {
        self.cache_high_watermark = high;
        self.cache_low_watermark = low;
        self
    }

    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            idle_timeout: Some(Duration::from_secs(120)),
            sweep_interval: Duration::from_secs(5),
            max_connections: 1024,
            keep_alive_interval: None,
            cache_high_watermark: 256,
            cache_low_watermark: 192,
            outbound_queue: 64,
        }
    }
}

/// Hosts registered services on accepted connections.
pub struct ServiceHost {
    registry: Arc<DispatcherRegistry>,
    config: HostConfig,
    authorizer: Arc<dyn Authorizer>,
    idle: SessionIdleManager,
    connections: Arc<Semaphore>,
    via_cache: Mutex<MruCache<(String, ChannelShape), usize>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new(registry: DispatcherRegistry, config: HostConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            idle: SessionIdleManager::new(config.idle_timeout),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            via_cache: Mutex::new(MruCache::new(
                config.cache_high_watermark,
                config.cache_low_watermark,
            )),
            authorizer: Arc::new(AllowAll),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn registry(&self) -> &DispatcherRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn idle_manager(&self) -> &SessionIdleManager {
        &self.idle
    }

    /// Cancelled when the host shuts down; every session holds a child.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Registration serving `via` for a connection in `mode`.
    pub fn resolve(&self, via: &Url, mode: FramingMode) -> Option<Arc<Registration>> {
        let shape = ChannelShape::for_mode(mode);
        let key = (via.as_str().to_string(), shape);
        if let Ok(mut cache) = self.via_cache.lock() {
            if let Some(index) = cache.get(&key) {
                return self.registry.get(index).cloned();
            }
        }

        let index = self.registry.lookup(via, shape)?;
        if let Ok(mut cache) = self.via_cache.lock() {
            cache.insert(key, index);
        }
        self.registry.get(index).cloned()
    }

    /// Run one accepted connection from handshake to close.
    pub async fn serve_connection(&self, stream: BoxedStream, connection_id: &str) -> CloseReason {
        let Ok(permit) = Arc::clone(&self.connections).try_acquire_owned() else {
            warn!(
                connection_id,
                max_connections = self.config.max_connections,
                "connection limit reached"
            );
            refuse_connection(
                stream,
                connection_id,
                PreambleFault::ServerTooBusy,
                &self.config.handshake,
            )
            .await;
            return CloseReason::Refused;
        };

        let cancel = self.shutdown.child_token();
        let resolver = |via: &Url, mode: FramingMode| self.resolve(via, mode);
        let negotiated = handshake_server(
            stream,
            connection_id,
            &self.config.handshake,
            &resolver,
            &cancel,
        )
        .await;
        let negotiated = match negotiated {
            Ok(negotiated) => negotiated,
            Err(HandshakeFailure::Fault(fault)) => return CloseReason::Fault(fault),
            Err(failure) => {
                debug!(connection_id, error = %failure, "handshake failed");
                return CloseReason::HandshakeFailed(failure.to_string());
            }
        };

        let idle = self.idle.register(connection_id, cancel.clone());
        let settings = SessionSettings {
            outbound_queue: self.config.outbound_queue,
            keep_alive_interval: self.config.keep_alive_interval,
        };
        let reason = run_session(
            negotiated.connection,
            negotiated.endpoint,
            Arc::clone(&self.authorizer),
            idle,
            cancel,
            &settings,
        )
        .await;
        drop(permit);
        reason
    }

    /// Accept connections until [`shutdown`](ServiceHost::shutdown), then
    /// wait for open sessions to close.
    pub async fn run(self: Arc<Self>, mut listener: SessionListener) -> Result<()> {
        info!(
            address = %listener.local_address(),
            endpoints = self.registry.len(),
            max_connections = self.config.max_connections,
            "service host listening"
        );

        let sweeper = self.config.idle_timeout.map(|_| {
            tokio::spawn(
                self.idle
                    .clone()
                    .run(self.config.sweep_interval, self.shutdown.clone()),
            )
        });

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((connection_id, stream)) => {
                        let host = Arc::clone(&self);
                        sessions.spawn(async move {
                            host.serve_connection(stream, &connection_id).await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(open_sessions = sessions.len(), "service host shutting down");
        while sessions.join_next().await.is_some() {}
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("endpoints", &self.registry.len())
            .field("config", &self.config)
            .field("available_connections", &self.connections.available_permits())
            .finish_non_exhaustive()
    }
}
