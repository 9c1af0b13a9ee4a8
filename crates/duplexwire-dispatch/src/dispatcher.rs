//! Per-connection channel dispatchers and the request pipeline.

use std::sync::Arc;

use duplexwire_session::{ConnectionInfo, FaultCode, Message, MessageFault};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::authorization::{AuthorizationDecision, Authorizer};
use crate::context::{RequestContext, RequestState};
use crate::descriptor::{ChannelShape, ConcurrencyMode, InstanceMode};
use crate::error::OperationError;
use crate::idle::InFlightGuard;
use crate::invoker::{CallbackSender, InvocationContext};
use crate::registry::Registration;
use crate::writer::Outbound;

/// What every channel dispatcher shares: the resolved registration and the
/// connection it serves.
pub(crate) struct Binding {
    registration: Arc<Registration>,
    /// Serializes invocations under `ConcurrencyMode::Single`.
    gate: Arc<Mutex<()>>,
    connection: ConnectionInfo,
    authorizer: Arc<dyn Authorizer>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

/// A registration bound to one connection, by channel shape.
pub(crate) enum ChannelDispatcher {
    Reply(Binding),
    Duplex {
        binding: Binding,
        callbacks: CallbackSender,
    },
}

impl ChannelDispatcher {
    pub(crate) fn bind(
        registration: Arc<Registration>,
        connection: ConnectionInfo,
        authorizer: Arc<dyn Authorizer>,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        let gate = match registration.descriptor.instance_mode {
            InstanceMode::Shared => Arc::clone(&registration.shared_gate),
            InstanceMode::PerSession => Arc::new(Mutex::new(())),
        };
        let shape = ChannelShape::for_mode(connection.mode);
        let binding = Binding {
            registration,
            gate,
            connection,
            authorizer,
            outbound,
            cancel,
        };
        match shape {
            ChannelShape::Reply => ChannelDispatcher::Reply(binding),
            ChannelShape::Duplex => {
                let callbacks = CallbackSender::new(binding.outbound.clone());
                ChannelDispatcher::Duplex { binding, callbacks }
            }
        }
    }

    pub(crate) fn shape(&self) -> ChannelShape {
        match self {
            ChannelDispatcher::Reply(_) => ChannelShape::Reply,
            ChannelDispatcher::Duplex { .. } => ChannelShape::Duplex,
        }
    }

    fn binding(&self) -> &Binding {
        match self {
            ChannelDispatcher::Reply(binding) => binding,
            ChannelDispatcher::Duplex { binding, .. } => binding,
        }
    }

    fn callbacks(&self) -> Option<&CallbackSender> {
        match self {
            ChannelDispatcher::Reply(_) => None,
            ChannelDispatcher::Duplex { callbacks, .. } => Some(callbacks),
        }
    }

    /// Run one inbound message through lookup, authorization and invocation,
    /// and queue whatever reply it produces.
    pub(crate) async fn process(&self, mut request: Message, in_flight: InFlightGuard) {
        let binding = self.binding();
        let connection_id = binding.connection.id.as_str();
        let mut ctx = RequestContext::new(connection_id, &request, binding.outbound.clone(), in_flight);
        binding.connection.stamp(&mut request);

        // Duplex traffic without a message id is fire-and-forget.
        let correlated = match self.shape() {
            ChannelShape::Reply => true,
            ChannelShape::Duplex => request.message_id().is_some(),
        };

        let descriptor = &binding.registration.descriptor;
        let Some(operation) = descriptor.operation(request.action()).cloned() else {
            debug!(connection_id, action = request.action(), "action not supported");
            let reason = format!("action '{}' is not supported by '{}'", request.action(), descriptor.name);
            return respond_with_fault(ctx, correlated, FaultCode::ActionNotSupported, reason).await;
        };
        let expects_reply = correlated && !operation.one_way;

        ctx.advance(RequestState::Authorizing);
        let principal = binding
            .connection
            .security
            .as_ref()
            .map(|security| &security.principal);
        if let AuthorizationDecision::Deny(reason) =
            binding.authorizer.authorize(principal, &operation).await
        {
            warn!(connection_id, operation = %operation.name, reason = %reason, "access denied");
            return respond_with_fault(ctx, expects_reply, FaultCode::AccessDenied, reason).await;
        }

        ctx.advance(RequestState::Invoking);
        let permit = match descriptor.concurrency {
            ConcurrencyMode::Multiple => None,
            ConcurrencyMode::Single => tokio::select! {
                guard = binding.gate.lock() => Some(guard),
                _ = binding.cancel.cancelled() => {
                    ctx.abort("connection closed while waiting for the service instance");
                    return;
                }
            },
        };

        let invocation = InvocationContext {
            connection: binding.connection.clone(),
            operation: operation.clone(),
            callbacks: self.callbacks().cloned(),
            cancel: binding.cancel.child_token(),
        };
        let invoke = binding.registration.invoker.invoke(&invocation, request);
        let outcome = tokio::select! {
            biased;
            _ = binding.cancel.cancelled() => {
                invocation.cancel.cancel();
                ctx.abort("connection closed during invocation");
                return;
            }
            outcome = tokio::time::timeout(descriptor.operation_timeout, invoke) => outcome,
        };
        drop(permit);

        match outcome {
            Ok(Ok(mut reply)) => {
                if !expects_reply {
                    ctx.complete();
                    return;
                }
                reply.headers.relates_to = ctx.message_id();
                if ctx.reply(reply).await.is_err() {
                    debug!(connection_id, operation = %operation.name, "reply dropped, connection closed");
                }
            }
            Ok(Err(err)) => {
                warn!(connection_id, operation = %operation.name, error = %err, "operation failed");
                let code = match err {
                    OperationError::InvalidRequest(_) => FaultCode::InvalidMessage,
                    OperationError::Failed(_) => FaultCode::OperationFailed,
                };
                respond_with_fault(ctx, expects_reply, code, err.to_string()).await;
            }
            Err(_) => {
                warn!(
                    connection_id,
                    operation = %operation.name,
                    timeout_ms = descriptor.operation_timeout.as_millis() as u64,
                    "operation timed out, closing connection"
                );
                invocation.cancel.cancel();
                ctx.abort("operation timed out");
                binding.cancel.cancel();
            }
        }
    }
}

/// A fault message correlated with `relates_to`.
pub(crate) fn fault_message(relates_to: Option<u64>, code: FaultCode, reason: impl Into<String>) -> Message {
    let mut request = Message::default();
    request.headers.message_id = relates_to;
    request.fault_reply(&MessageFault::new(code, reason))
}

async fn respond_with_fault(ctx: RequestContext, expects_reply: bool, code: FaultCode, reason: String) {
    if !expects_reply {
        ctx.complete();
        return;
    }
    let fault = fault_message(ctx.message_id(), code, reason);
    if ctx.reply(fault).await.is_err() {
        debug!("fault reply dropped, connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use duplexwire_session::{
        BinaryMessageEncoder, FramingMode, Principal, ProtectionLevel, ProtocolVersion,
        SecurityProperty,
    };
    use url::Url;

    use super::*;
    use crate::authorization::{AllowAll, RequireAuthenticated};
    use crate::descriptor::{ChannelShapes, OperationDescriptor, ServiceDescriptor};
    use crate::idle::{IdleHandle, SessionIdleManager};
    use crate::invoker::OperationInvoker;
    use crate::registry::DispatcherRegistry;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperationInvoker for Echo {
        async fn invoke(
            &self,
            ctx: &InvocationContext,
            request: Message,
        ) -> Result<Message, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match ctx.operation.name.as_str() {
                "Fail" => Err(OperationError::failed("boom")),
                "Slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(request.reply("slow", ""))
                }
                _ => Ok(request.reply(request.action(), request.body.clone())),
            }
        }
    }

    fn registry(invoker: Arc<Echo>) -> Arc<Registration> {
        let descriptor = ServiceDescriptor::new("echo")
            .with_operation(OperationDescriptor::request_reply("Echo", "echo"))
            .with_operation(OperationDescriptor::request_reply("Fail", "fail"))
            .with_operation(OperationDescriptor::request_reply("Slow", "slow"))
            .with_operation(OperationDescriptor::one_way("Notify", "notify"))
            .with_operation_timeout(Duration::from_secs(1));
        let registry = DispatcherRegistry::builder()
            .register("proto://host/svc", ChannelShapes::ALL, descriptor, invoker)
            .unwrap()
            .build();
        Arc::clone(registry.get(0).unwrap())
    }

    fn connection(mode: FramingMode, security: Option<SecurityProperty>) -> ConnectionInfo {
        ConnectionInfo {
            id: "conn-1".to_string(),
            version: ProtocolVersion::CURRENT,
            mode,
            via: Url::parse("proto://host/svc").unwrap(),
            encoder: Arc::new(BinaryMessageEncoder),
            security,
            frame: Default::default(),
        }
    }

    struct Harness {
        dispatcher: ChannelDispatcher,
        rx: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
        idle: IdleHandle,
        _manager: SessionIdleManager,
    }

    fn harness(mode: FramingMode, authorizer: Arc<dyn Authorizer>, invoker: Arc<Echo>) -> Harness {
        let manager = SessionIdleManager::new(None);
        let cancel = CancellationToken::new();
        let idle = manager.register("conn-1", cancel.clone());
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = ChannelDispatcher::bind(
            registry(invoker),
            connection(mode, None),
            authorizer,
            tx,
            cancel.clone(),
        );
        Harness {
            dispatcher,
            rx,
            cancel,
            idle,
            _manager: manager,
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            calls: AtomicUsize::new(0),
        })
    }

    impl Harness {
        async fn process(&mut self, message: Message) {
            let guard = self.idle.activity().begin_request();
            self.dispatcher.process(message, guard).await;
        }

        fn next_reply(&mut self) -> Option<Message> {
            match self.rx.try_recv() {
                Ok(Outbound::Message(message)) => Some(message),
                Ok(other) => panic!("unexpected outbound item: {other:?}"),
                Err(_) => None,
            }
        }
    }

    #[tokio::test]
    async fn request_gets_correlated_reply() {
        let mut h = harness(FramingMode::SizedEnvelope, Arc::new(AllowAll), echo());
        h.process(Message::new("echo", "ping").with_message_id(5)).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply.relates_to(), Some(5));
        assert_eq!(&reply.body[..], b"ping");
        assert_eq!(h.idle.activity().in_flight(), 0);
    }

    #[tokio::test]
    async fn unknown_action_is_faulted_without_invoking() {
        let invoker = echo();
        let mut h = harness(FramingMode::SizedEnvelope, Arc::new(AllowAll), Arc::clone(&invoker));
        h.process(Message::new("missing", "").with_message_id(1)).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply.fault_detail().unwrap().code, FaultCode::ActionNotSupported);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_request_is_not_invoked() {
        let invoker = echo();
        let mut h = harness(
            FramingMode::SizedEnvelope,
            Arc::new(RequireAuthenticated),
            Arc::clone(&invoker),
        );
        h.process(Message::new("echo", "x").with_message_id(2)).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply.fault_detail().unwrap().code, FaultCode::AccessDenied);
        assert_eq!(reply.relates_to(), Some(2));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn authenticated_principal_is_allowed() {
        let invoker = echo();
        let manager = SessionIdleManager::new(None);
        let cancel = CancellationToken::new();
        let idle = manager.register("conn-1", cancel.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let security = SecurityProperty {
            principal: Principal::authenticated("alice"),
            protection: ProtectionLevel::None,
            upgrade: "test".to_string(),
        };
        let dispatcher = ChannelDispatcher::bind(
            registry(Arc::clone(&invoker)),
            connection(FramingMode::SizedEnvelope, Some(security)),
            Arc::new(RequireAuthenticated),
            tx,
            cancel,
        );
        dispatcher
            .process(Message::new("echo", "x").with_message_id(1), idle.activity().begin_request())
            .await;
        match rx.try_recv() {
            Ok(Outbound::Message(reply)) => assert!(!reply.is_fault()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn operation_failure_becomes_fault_reply() {
        let mut h = harness(FramingMode::SizedEnvelope, Arc::new(AllowAll), echo());
        h.process(Message::new("fail", "").with_message_id(3)).await;
        let reply = h.next_reply().unwrap();
        let fault = reply.fault_detail().unwrap();
        assert_eq!(fault.code, FaultCode::OperationFailed);
        assert_eq!(fault.reason, "boom");
        assert!(!h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn one_way_operation_has_no_reply() {
        let invoker = echo();
        let mut h = harness(FramingMode::SizedEnvelope, Arc::new(AllowAll), Arc::clone(&invoker));
        h.process(Message::new("notify", "x").with_message_id(4)).await;
        assert!(h.next_reply().is_none());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplex_message_without_id_is_one_way() {
        let invoker = echo();
        let mut h = harness(FramingMode::Duplex, Arc::new(AllowAll), Arc::clone(&invoker));
        assert_eq!(h.dispatcher.shape(), ChannelShape::Duplex);
        h.process(Message::new("echo", "x")).await;
        assert!(h.next_reply().is_none());
        h.process(Message::new("missing", "x")).await;
        assert!(h.next_reply().is_none());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_connection() {
        let mut h = harness(FramingMode::SizedEnvelope, Arc::new(AllowAll), echo());
        h.process(Message::new("slow", "").with_message_id(6)).await;
        assert!(h.next_reply().is_none());
        assert!(h.cancel.is_cancelled());
        assert_eq!(h.idle.activity().in_flight(), 0);
    }
}
