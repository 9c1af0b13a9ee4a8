use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::Result;

/// Any async byte stream that can be read and written from one owner.
///
/// Upgraded (security-wrapped) streams and in-memory test pipes implement
/// this as readily as sockets do.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncDuplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex stream handed between handshake stages.
pub type BoxedStream = Box<dyn AsyncDuplex>;

/// A connected transport stream: TCP, Unix domain socket, or named pipe.
pub struct TransportStream {
    inner: TransportStreamInner,
}

enum TransportStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
}

macro_rules! with_inner {
    ($self:expr, $stream:ident => $body:expr) => {
        match &mut $self.inner {
            TransportStreamInner::Tcp($stream) => $body,
            #[cfg(unix)]
            TransportStreamInner::Unix($stream) => $body,
            #[cfg(windows)]
            TransportStreamInner::PipeServer($stream) => $body,
            #[cfg(windows)]
            TransportStreamInner::PipeClient($stream) => $body,
        }
    };
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        with_inner!(this, stream => Pin::new(stream).poll_read(cx, buf))
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        with_inner!(this, stream => Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        with_inner!(this, stream => Pin::new(stream).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        with_inner!(this, stream => Pin::new(stream).poll_shutdown(cx))
    }
}

impl TransportStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: TransportStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: TransportStreamInner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe_server(
        pipe: tokio::net::windows::named_pipe::NamedPipeServer,
    ) -> Self {
        Self {
            inner: TransportStreamInner::PipeServer(pipe),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe_client(
        pipe: tokio::net::windows::named_pipe::NamedPipeClient,
    ) -> Self {
        Self {
            inner: TransportStreamInner::PipeClient(pipe),
        }
    }

    /// Transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            TransportStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            TransportStreamInner::Unix(_) => "unix",
            #[cfg(windows)]
            TransportStreamInner::PipeServer(_) | TransportStreamInner::PipeClient(_) => "pipe",
        }
    }

    /// Human-readable description of the remote end.
    pub fn peer_description(&self) -> String {
        match &self.inner {
            TransportStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            TransportStreamInner::Unix(_) => match self.peer_credentials() {
                Some((uid, _gid, pid)) => format!("unix:uid={uid},pid={pid}"),
                None => "unix:unknown".to_string(),
            },
            #[cfg(windows)]
            TransportStreamInner::PipeServer(_) | TransportStreamInner::PipeClient(_) => {
                "pipe".to_string()
            }
        }
    }

    /// Disable Nagle's algorithm on TCP streams. No-op for other transports.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        if let TransportStreamInner::Tcp(stream) = &self.inner {
            stream.set_nodelay(nodelay)?;
        }
        Ok(())
    }

    /// Erase the concrete stream type.
    pub fn into_boxed(self) -> BoxedStream {
        Box::new(self)
    }

    /// Get the credentials of a Unix domain socket peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            TransportStreamInner::Unix(stream) => stream.as_raw_fd(),
            TransportStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of a Unix domain socket peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("type", &self.kind())
            .finish()
    }
}
