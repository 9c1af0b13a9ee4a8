//! Per-request lifecycle.

use std::fmt;

use duplexwire_session::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};
use crate::idle::InFlightGuard;
use crate::writer::Outbound;

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Authorizing,
    Invoking,
    Replying,
    Closed,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Closed | RequestState::Aborted)
    }

    /// Whether `next` may follow `self`.
    pub fn can_advance(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Received, Authorizing) | (Received, Replying) | (Received, Closed) => true,
            (Authorizing, Invoking) | (Authorizing, Replying) | (Authorizing, Closed) => true,
            (Invoking, Replying) | (Invoking, Closed) => true,
            (Replying, Closed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Authorizing => "authorizing",
            RequestState::Invoking => "invoking",
            RequestState::Replying => "replying",
            RequestState::Closed => "closed",
            RequestState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request travelling through the pipeline. Holds the session's
/// in-flight count until it is replied to, closed or aborted.
pub(crate) struct RequestContext {
    connection_id: String,
    action: String,
    message_id: Option<u64>,
    state: RequestState,
    outbound: mpsc::Sender<Outbound>,
    _in_flight: InFlightGuard,
}

impl RequestContext {
    pub(crate) fn new(
        connection_id: &str,
        request: &Message,
        outbound: mpsc::Sender<Outbound>,
        in_flight: InFlightGuard,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            action: request.action().to_string(),
            message_id: request.message_id(),
            state: RequestState::Received,
            outbound,
            _in_flight: in_flight,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn message_id(&self) -> Option<u64> {
        self.message_id
    }

    pub(crate) fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance(next),
            "invalid request transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Queue `reply` on the writer and close the request.
    pub(crate) async fn reply(mut self, reply: Message) -> Result<()> {
        if self.state != RequestState::Replying {
            self.advance(RequestState::Replying);
        }
        let sent = self.outbound.send(Outbound::Message(reply)).await;
        self.state = RequestState::Closed;
        sent.map_err(|_| DispatchError::ConnectionClosed)
    }

    /// Close the request without a reply (one-way operations).
    pub(crate) fn complete(mut self) {
        self.advance(RequestState::Closed);
    }

    /// Abandon the request; nothing is written for it.
    pub(crate) fn abort(mut self, reason: &str) {
        warn!(
            connection_id = %self.connection_id,
            action = %self.action,
            state = %self.state,
            reason,
            "request aborted"
        );
        self.state = RequestState::Aborted;
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            // Dropped mid-pipeline: the task was cancelled with the session.
            debug!(
                connection_id = %self.connection_id,
                action = %self.action,
                state = %self.state,
                "request dropped before completion"
            );
            self.state = RequestState::Aborted;
        }
    }
}
