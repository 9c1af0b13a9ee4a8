//! Session negotiation for duplexwire.
//!
//! A connection starts with a binary preamble (version, framing mode, via,
//! content type, optional upgrade). The listener answers with a single ack
//! byte or a fault record, optionally hands the stream to a security upgrade
//! provider, and then freezes the negotiated [`ConnectionState`] for
//! steady-state envelope framing. The client half lives in [`connector`].

pub mod connection;
pub mod connector;
pub mod encoder;
pub mod error;
pub mod fault;
pub mod handshake;
pub mod message;
pub mod preamble;
pub mod security;

pub use connection::{ConnectionInfo, ConnectionState};
pub use connector::{call_singleton, connect, connect_to, ClientSession, ConnectOptions};
pub use encoder::{
    BinaryMessageEncoder, EncoderRegistry, EncodingError, JsonMessageEncoder, MessageEncoder,
    BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE,
};
pub use error::{Result, SessionError};
pub use fault::{FaultCategory, PreambleFault};
pub use handshake::{
    handshake_client, handshake_server, refuse_connection, EndpointResolver, HandshakeConfig,
    HandshakeFailure, Negotiated,
};
pub use message::{FaultCode, Message, MessageFault, MessageHeaders, MessageProperties, FAULT_ACTION};
pub use preamble::{FramingMode, Preamble, ProtocolVersion, ACK, PREAMBLE_END};
pub use security::{
    IdentityUpgrade, Principal, ProtectionLevel, SecurityProperty, StreamUpgradeInitiator,
    StreamUpgradeProvider, UpgradeError, IDENTITY_UPGRADE,
};
