//! The seam between the pipeline and service code.

use async_trait::async_trait;
use duplexwire_session::{ConnectionInfo, Message, Principal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::descriptor::OperationDescriptor;
use crate::error::{DispatchError, OperationError, Result};
use crate::writer::Outbound;

/// Invokes service operations.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Run the operation described by `ctx.operation`. The returned message
    /// becomes the reply; it is discarded for one-way operations.
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        request: Message,
    ) -> std::result::Result<Message, OperationError>;
}

/// Everything an operation may know about its call.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub connection: ConnectionInfo,
    pub operation: OperationDescriptor,
    /// Present on Duplex connections.
    pub callbacks: Option<CallbackSender>,
    /// Cancelled when the connection closes or the call times out.
    pub cancel: CancellationToken,
}

impl InvocationContext {
    /// The authenticated caller, if the stream was upgraded.
    pub fn principal(&self) -> Option<&Principal> {
        self.connection
            .security
            .as_ref()
            .map(|security| &security.principal)
    }
}

/// Sends one-way messages to the peer of a Duplex connection.
#[derive(Debug, Clone)]
pub struct CallbackSender {
    tx: mpsc::Sender<Outbound>,
}

impl CallbackSender {
    pub(crate) fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue `message` on the connection's writer.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Outbound::Message(message))
            .await
            .map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Whether the connection's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
