//! Application messages carried inside envelopes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::security::SecurityProperty;

/// Action stamped on fault replies.
pub const FAULT_ACTION: &str = "duplexwire:fault";

/// Addressing and correlation headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub action: String,
    pub to: String,
    pub message_id: Option<u64>,
    pub relates_to: Option<u64>,
    pub fault: bool,
}

/// Values copied from the connection into every inbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub via: Option<Url>,
    pub security: Option<SecurityProperty>,
    pub connection_id: Option<String>,
}

/// One request or reply. Owned by a single request/reply cycle.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: MessageHeaders,
    pub body: Bytes,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            headers: MessageHeaders {
                action: action.into(),
                ..MessageHeaders::default()
            },
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.headers.to = to.into();
        self
    }

    pub fn with_message_id(mut self, id: u64) -> Self {
        self.headers.message_id = Some(id);
        self
    }

    pub fn action(&self) -> &str {
        &self.headers.action
    }

    pub fn message_id(&self) -> Option<u64> {
        self.headers.message_id
    }

    pub fn relates_to(&self) -> Option<u64> {
        self.headers.relates_to
    }

    pub fn is_fault(&self) -> bool {
        self.headers.fault
    }

    /// A reply correlated with this message.
    pub fn reply(&self, action: impl Into<String>, body: impl Into<Bytes>) -> Message {
        let mut reply = Message::new(action, body);
        reply.headers.relates_to = self.headers.message_id;
        reply
    }

    /// A fault reply correlated with this message.
    pub fn fault_reply(&self, fault: &MessageFault) -> Message {
        let mut reply = self.reply(FAULT_ACTION, fault.to_body());
        reply.headers.fault = true;
        reply
    }

    /// Parse the body of a fault reply.
    pub fn fault_detail(&self) -> Option<MessageFault> {
        if !self.headers.fault {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

/// Application-level fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    OperationFailed,
    AccessDenied,
    ActionNotSupported,
    InvalidMessage,
}

/// Structured fault body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFault {
    pub code: FaultCode,
    pub reason: String,
}

impl MessageFault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn to_body(&self) -> Bytes {
        // A two-field struct of an enum and a string always serializes.
        serde_json::to_vec(self).map(Bytes::from).unwrap_or_default()
    }
}

impl std::fmt::Display for MessageFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.reason)
    }
}
