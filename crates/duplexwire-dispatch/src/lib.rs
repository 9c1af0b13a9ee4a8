//! Service hosting for duplexwire.
//!
//! Services are registered once at startup under a base address, with an
//! explicit [`ServiceDescriptor`] and an [`OperationInvoker`]. The
//! [`ServiceHost`] accepts connections, runs the session handshake, resolves
//! the preamble's via against the [`DispatcherRegistry`] and serves the
//! negotiated framing mode:
//!
//! - Singleton: one request, one unframed reply.
//! - SizedEnvelope: sequential request/reply over length-prefixed envelopes.
//! - Duplex: concurrent requests plus server-initiated callbacks.
//!
//! Every request passes through the same pipeline (action lookup,
//! authorization, concurrency gate, invocation under a timeout) and every
//! write goes through one writer task per connection. Idle sessions are
//! closed by the [`SessionIdleManager`].

pub mod authorization;
pub mod cache;
mod context;
pub mod descriptor;
mod dispatcher;
pub mod error;
pub mod host;
pub mod idle;
pub mod invoker;
pub mod listener;
pub mod registry;
mod session;
mod writer;

pub use authorization::{AllowAll, AuthorizationDecision, Authorizer, RequireAuthenticated};
pub use cache::MruCache;
pub use context::RequestState;
pub use descriptor::{
    ChannelShape, ChannelShapes, ConcurrencyMode, InstanceMode, OperationDescriptor,
    ServiceDescriptor,
};
pub use error::{DispatchError, OperationError, Result};
pub use host::{HostConfig, ServiceHost};
pub use idle::{IdleHandle, InFlightGuard, SessionActivity, SessionIdleManager};
pub use invoker::{CallbackSender, InvocationContext, OperationInvoker};
pub use listener::SessionListener;
pub use registry::{BaseAddress, DispatcherRegistry, Registration, RegistryBuilder};
pub use session::CloseReason;
