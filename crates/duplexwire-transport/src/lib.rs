//! Async duplex transports for duplexwire.
//!
//! Provides a unified stream type over the supported connection-oriented
//! transports:
//! - TCP
//! - Unix domain sockets (Linux/macOS)
//! - Named pipes (Windows)
//!
//! This is the lowest layer of duplexwire. Everything above works against
//! [`AsyncDuplex`] / [`BoxedStream`], so upgraded streams and in-memory test
//! pipes are interchangeable with sockets.

pub mod address;
pub mod error;
pub mod rewind;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

#[cfg(windows)]
pub mod pipe;

pub use address::{TransportAddress, TransportListener};
pub use error::{Result, TransportError};
pub use rewind::RewindStream;
pub use tcp::TcpTransport;
pub use traits::{AsyncDuplex, BoxedStream, TransportStream};

#[cfg(unix)]
pub use uds::UnixDomainSocket;

#[cfg(windows)]
pub use pipe::NamedPipeListener;
