use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::TransportStream;

/// TCP listener producing [`TransportStream`]s with Nagle disabled.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on `host:port`. Port `0` picks an ephemeral port.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::Bind {
                address: address.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<TransportStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(TransportStream::from_tcp(stream))
    }

    /// Connect to a listening TCP endpoint.
    pub async fn connect(address: &str) -> Result<TransportStream> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                source: e,
            })?;
        stream.set_nodelay(true)?;
        debug!(address, "connected to tcp endpoint");
        Ok(TransportStream::from_tcp(stream))
    }

    /// The bound local address (useful after binding port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
