use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::tcp::TcpTransport;
use crate::traits::TransportStream;

/// Where a listener binds or a client connects.
///
/// Parsed from `tcp://host:port`, `unix:///path/to.sock`, or `pipe://name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    Tcp(String),
    Unix(PathBuf),
    Pipe(String),
}

impl TransportAddress {
    /// Open a client stream to this address.
    pub async fn connect(&self) -> Result<TransportStream> {
        match self {
            TransportAddress::Tcp(addr) => TcpTransport::connect(addr).await,
            #[cfg(unix)]
            TransportAddress::Unix(path) => crate::uds::UnixDomainSocket::connect(path).await,
            #[cfg(not(unix))]
            TransportAddress::Unix(_) => Err(TransportError::Unsupported("unix")),
            #[cfg(windows)]
            TransportAddress::Pipe(name) => crate::pipe::NamedPipeListener::connect(name).await,
            #[cfg(not(windows))]
            TransportAddress::Pipe(_) => Err(TransportError::Unsupported("pipe")),
        }
    }
}

impl FromStr for TransportAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("expected '<scheme>://<target>'"))?;
        if rest.is_empty() {
            return Err(invalid("empty target"));
        }

        match scheme {
            "tcp" => {
                if !rest.contains(':') {
                    return Err(invalid("tcp address requires a port"));
                }
                Ok(TransportAddress::Tcp(rest.to_string()))
            }
            "unix" => Ok(TransportAddress::Unix(PathBuf::from(rest))),
            "pipe" => {
                if rest.contains('/') {
                    return Err(invalid("pipe names must not contain '/'"));
                }
                Ok(TransportAddress::Pipe(rest.to_string()))
            }
            _ => Err(invalid("unknown scheme (expected tcp, unix, or pipe)")),
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
            TransportAddress::Unix(path) => write!(f, "unix://{}", path.display()),
            TransportAddress::Pipe(name) => write!(f, "pipe://{name}"),
        }
    }
}

/// A bound listener for any supported transport.
pub struct TransportListener {
    inner: ListenerInner,
}

enum ListenerInner {
    Tcp(TcpTransport),
    #[cfg(unix)]
    Unix(crate::uds::UnixDomainSocket),
    #[cfg(windows)]
    Pipe(crate::pipe::NamedPipeListener),
}

impl TransportListener {
    /// Bind a listener for `address`.
    pub async fn bind(address: &TransportAddress) -> Result<Self> {
        let inner = match address {
            TransportAddress::Tcp(addr) => ListenerInner::Tcp(TcpTransport::bind(addr).await?),
            #[cfg(unix)]
            TransportAddress::Unix(path) => {
                ListenerInner::Unix(crate::uds::UnixDomainSocket::bind(path)?)
            }
            #[cfg(not(unix))]
            TransportAddress::Unix(_) => return Err(TransportError::Unsupported("unix")),
            #[cfg(windows)]
            TransportAddress::Pipe(name) => {
                ListenerInner::Pipe(crate::pipe::NamedPipeListener::bind(name)?)
            }
            #[cfg(not(windows))]
            TransportAddress::Pipe(_) => return Err(TransportError::Unsupported("pipe")),
        };
        Ok(Self { inner })
    }

    /// Accept the next connection.
    pub async fn accept(&mut self) -> Result<TransportStream> {
        match &mut self.inner {
            ListenerInner::Tcp(listener) => listener.accept().await,
            #[cfg(unix)]
            ListenerInner::Unix(listener) => listener.accept().await,
            #[cfg(windows)]
            ListenerInner::Pipe(listener) => listener.accept().await,
        }
    }

    /// The address clients should connect to.
    pub fn local_address(&self) -> TransportAddress {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                TransportAddress::Tcp(listener.local_addr().to_string())
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                TransportAddress::Unix(listener.path().to_path_buf())
            }
            #[cfg(windows)]
            ListenerInner::Pipe(listener) => TransportAddress::Pipe(listener.name().to_string()),
        }
    }
}
