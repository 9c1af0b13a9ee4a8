//! Registration-time description of a service.

use std::fmt;
use std::time::Duration;

use duplexwire_session::FramingMode;

/// How invocations on one service instance may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// One invocation at a time per instance.
    #[default]
    Single,
    /// Invocations run concurrently.
    Multiple,
}

/// Which sessions share an instance (and its concurrency gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceMode {
    /// One instance for every session.
    #[default]
    Shared,
    /// One instance per connection.
    PerSession,
}

/// The message-exchange shape a channel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelShape {
    /// Request in, correlated reply out.
    Reply,
    /// Messages flow both ways at any time.
    Duplex,
}

impl ChannelShape {
    /// The shape a connection in `mode` can carry.
    pub fn for_mode(mode: FramingMode) -> Self {
        match mode {
            FramingMode::Singleton | FramingMode::SizedEnvelope => ChannelShape::Reply,
            FramingMode::Duplex => ChannelShape::Duplex,
        }
    }
}

impl fmt::Display for ChannelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelShape::Reply => f.write_str("reply"),
            ChannelShape::Duplex => f.write_str("duplex"),
        }
    }
}

/// A set of channel shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelShapes {
    reply: bool,
    duplex: bool,
}

impl ChannelShapes {
    pub const REPLY: ChannelShapes = ChannelShapes {
        reply: true,
        duplex: false,
    };
    pub const DUPLEX: ChannelShapes = ChannelShapes {
        reply: false,
        duplex: true,
    };
    pub const ALL: ChannelShapes = ChannelShapes {
        reply: true,
        duplex: true,
    };

    pub fn contains(self, shape: ChannelShape) -> bool {
        match shape {
            ChannelShape::Reply => self.reply,
            ChannelShape::Duplex => self.duplex,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.reply && !self.duplex
    }
}

impl From<ChannelShape> for ChannelShapes {
    fn from(shape: ChannelShape) -> Self {
        match shape {
            ChannelShape::Reply => ChannelShapes::REPLY,
            ChannelShape::Duplex => ChannelShapes::DUPLEX,
        }
    }
}

/// One operation of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    /// Action header value that selects this operation.
    pub action: String,
    /// One-way operations never produce a reply.
    pub one_way: bool,
}

impl OperationDescriptor {
    pub fn request_reply(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            one_way: false,
        }
    }

    pub fn one_way(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            one_way: true,
        }
    }
}

/// Explicit description of a service, supplied at registration.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub operations: Vec<OperationDescriptor>,
    pub concurrency: ConcurrencyMode,
    pub instance_mode: InstanceMode,
    /// Bound on a single invocation; exceeding it closes the connection.
    pub operation_timeout: Duration,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            concurrency: ConcurrencyMode::default(),
            instance_mode: InstanceMode::default(),
            operation_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_operation(mut self, operation: OperationDescriptor) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyMode) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_instance_mode(mut self, instance_mode: InstanceMode) -> Self {
        self.instance_mode = instance_mode;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// The operation selected by `action`.
    pub fn operation(&self, action: &str) -> Option<&OperationDescriptor> {
        self.operations
            .iter()
            .find(|operation| operation.action == action)
    }
}
