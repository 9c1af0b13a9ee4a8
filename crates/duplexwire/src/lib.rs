//! Session-framed messaging over stream transports.
//!
//! A connection opens with a preamble that negotiates version, framing mode,
//! endpoint, and content type, optionally upgrades the stream, and then
//! carries length-prefixed envelopes until either side sends the terminator.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP, Unix socket, and named pipe streams and listeners
//! - [`frame`]: varints, size-prefixed records, and the envelope codec
//! - [`session`]: preamble, handshake, message model, and the client connector
//! - [`dispatch`]: service registry, request pipeline, idle management, and
//!   the listening host (behind the `dispatch` feature)

/// Re-export transport types.
pub mod transport {
    pub use duplexwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use duplexwire_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use duplexwire_session::*;
}

/// Re-export dispatch types (requires `dispatch` feature).
#[cfg(feature = "dispatch")]
pub mod dispatch {
    pub use duplexwire_dispatch::*;
}
