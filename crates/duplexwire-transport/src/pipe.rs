use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::TransportStream;

/// Windows named pipe listener.
///
/// Each accepted connection consumes the current pipe instance; a fresh
/// instance is created before the connected one is handed out so clients
/// never observe a missing pipe.
pub struct NamedPipeListener {
    name: String,
    next: NamedPipeServer,
}

impl NamedPipeListener {
    /// Create the first instance of `\\.\pipe\<name>`.
    pub fn bind(name: &str) -> Result<Self> {
        let name = pipe_path(name);
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| TransportError::Bind {
                address: name.clone(),
                source: e,
            })?;
        info!(pipe = %name, "listening on named pipe");
        Ok(Self { name, next })
    }

    /// Wait for a client to connect to the current instance.
    pub async fn accept(&mut self) -> Result<TransportStream> {
        self.next.connect().await.map_err(TransportError::Accept)?;
        let fresh = ServerOptions::new()
            .create(&self.name)
            .map_err(TransportError::Accept)?;
        let connected = std::mem::replace(&mut self.next, fresh);
        debug!(pipe = %self.name, "accepted named pipe connection");
        Ok(TransportStream::from_pipe_server(connected))
    }

    /// Connect to a named pipe server.
    pub async fn connect(name: &str) -> Result<TransportStream> {
        let name = pipe_path(name);
        let client = ClientOptions::new()
            .open(&name)
            .map_err(|e| TransportError::Connect {
                address: name.clone(),
                source: e,
            })?;
        debug!(pipe = %name, "connected to named pipe");
        Ok(TransportStream::from_pipe_client(client))
    }

    /// Full pipe path.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn pipe_path(name: &str) -> String {
    if name.starts_with(r"\\") {
        name.to_string()
    } else {
        format!(r"\\.\pipe\{name}")
    }
}
