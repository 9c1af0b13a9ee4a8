use duplexwire_transport::{BoxedStream, TransportAddress, TransportListener};
use tracing::debug;

use crate::error::Result;

/// Accepts raw connections and names them for logging and idle tracking.
pub struct SessionListener {
    inner: TransportListener,
    next_connection_id: u64,
}

impl SessionListener {
    /// Bind to `address` (`tcp://`, `unix://` or `pipe://`).
    pub async fn bind(address: &TransportAddress) -> Result<Self> {
        Ok(Self::from_listener(TransportListener::bind(address).await?))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(inner: TransportListener) -> Self {
        Self {
            inner,
            next_connection_id: 1,
        }
    }

    /// Accept the next connection and assign an auto-generated id.
    pub async fn accept(&mut self) -> Result<(String, BoxedStream)> {
        let stream = self.inner.accept().await?;
        let id = format!("conn-{}", self.next_connection_id);
        self.next_connection_id += 1;
        debug!(connection_id = %id, peer = %stream.peer_description(), transport = stream.kind(), "accepted");
        Ok((id, stream.into_boxed()))
    }

    /// Address clients should connect to.
    pub fn local_address(&self) -> TransportAddress {
        self.inner.local_address()
    }
}
