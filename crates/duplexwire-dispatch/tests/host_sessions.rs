use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use duplexwire_dispatch::{
    AllowAll, Authorizer, ChannelShapes, CloseReason, ConcurrencyMode, DispatcherRegistry,
    HostConfig, InstanceMode, InvocationContext, OperationDescriptor, OperationError, OperationInvoker,
    RequireAuthenticated, ServiceDescriptor, ServiceHost, SessionListener,
};
use duplexwire_frame::{Envelope, EnvelopeReader, EnvelopeWriter, FrameConfig};
use duplexwire_session::{
    call_singleton, connect, connect_to, BinaryMessageEncoder, ConnectOptions, FaultCode,
    FramingMode, HandshakeConfig, IdentityUpgrade, Message, MessageEncoder, Preamble,
    PreambleFault, SessionError, ACK, JSON_CONTENT_TYPE,
};
use duplexwire_transport::{BoxedStream, TransportAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

const BASE: &str = "proto://host/svc";

#[derive(Default)]
struct Demo {
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl OperationInvoker for Demo {
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        request: Message,
    ) -> Result<Message, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.action() {
            "echo" | "notify" => Ok(request.reply("echo", request.body.clone())),
            "whoami" => {
                let name = ctx
                    .principal()
                    .map(|principal| principal.name.clone())
                    .unwrap_or_else(|| "anonymous".to_string());
                Ok(request.reply("whoami", name))
            }
            "fail" => Err(OperationError::failed("boom")),
            "bin" => Ok(request.reply("bin", vec![0xFF, 0x01])),
            "work" => {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(request.reply("work", ""))
            }
            "hold" => {
                self.started.notify_one();
                self.release.notified().await;
                Ok(request.reply("hold", "released"))
            }
            "subscribe" => {
                let callbacks = ctx
                    .callbacks
                    .as_ref()
                    .ok_or_else(|| OperationError::failed("callbacks need a duplex session"))?;
                callbacks
                    .send(Message::new("tick", request.body.clone()))
                    .await
                    .map_err(|err| OperationError::failed(err.to_string()))?;
                Ok(request.reply("subscribe", "subscribed"))
            }
            other => Err(OperationError::failed(format!("unexpected action {other}"))),
        }
    }
}

fn descriptor(concurrency: ConcurrencyMode) -> ServiceDescriptor {
    ["echo", "whoami", "fail", "bin", "work", "hold", "subscribe"]
        .into_iter()
        .fold(ServiceDescriptor::new("demo"), |descriptor, action| {
            descriptor.with_operation(OperationDescriptor::request_reply(action, action))
        })
        .with_operation(OperationDescriptor::one_way("notify", "notify"))
        .with_concurrency(concurrency)
        .with_operation_timeout(Duration::from_secs(3_600))
}

fn host_with(
    demo: &Arc<Demo>,
    concurrency: ConcurrencyMode,
    config: HostConfig,
    authorizer: Arc<dyn Authorizer>,
) -> Arc<ServiceHost> {
    let registry = DispatcherRegistry::builder()
        .register(BASE, ChannelShapes::ALL, descriptor(concurrency), Arc::clone(demo) as _)
        .unwrap()
        .build();
    Arc::new(ServiceHost::new(registry, config).with_authorizer(authorizer))
}

fn host_for(demo: &Arc<Demo>, descriptor: ServiceDescriptor) -> Arc<ServiceHost> {
    let registry = DispatcherRegistry::builder()
        .register(BASE, ChannelShapes::ALL, descriptor, Arc::clone(demo) as _)
        .unwrap()
        .build();
    Arc::new(ServiceHost::new(registry, HostConfig::default()))
}

fn host(demo: &Arc<Demo>) -> Arc<ServiceHost> {
    host_with(demo, ConcurrencyMode::Multiple, HostConfig::default(), Arc::new(AllowAll))
}

fn open(host: &Arc<ServiceHost>, connection_id: &str) -> (BoxedStream, JoinHandle<CloseReason>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let host = Arc::clone(host);
    let connection_id = connection_id.to_string();
    let task = tokio::spawn(async move { host.serve_connection(Box::new(server), &connection_id).await });
    (Box::new(client), task)
}

fn options(mode: FramingMode) -> ConnectOptions {
    ConnectOptions::new(Url::parse(BASE).unwrap(), mode)
}

#[tokio::test]
async fn sized_envelope_exchange_on_the_wire() {
    let demo = Arc::new(Demo::default());
    let host = host(&demo);
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let serving = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.serve_connection(Box::new(server), "conn-1").await })
    };

    let preamble = Preamble::new(FramingMode::SizedEnvelope, Url::parse(BASE).unwrap());
    client.write_all(&preamble.to_bytes().unwrap()).await.unwrap();
    let mut ack = [0u8; 1];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[0], ACK);

    let (read_half, write_half) = tokio::io::split(client);
    let mut writer = EnvelopeWriter::new(write_half);
    let mut reader = EnvelopeReader::new(read_half);

    let mut payload = Vec::new();
    BinaryMessageEncoder
        .encode(&Message::new("echo", "R").with_message_id(1), &mut payload)
        .unwrap();
    writer.write_envelope(&payload).await.unwrap();

    let Envelope::Data(reply) = reader.expect_envelope().await.unwrap() else {
        panic!("expected a reply envelope");
    };
    let reply = BinaryMessageEncoder.decode(reply).unwrap();
    assert_eq!(&reply.body[..], b"R");
    assert_eq!(reply.relates_to(), Some(1));

    writer.write_end().await.unwrap();
    assert_eq!(reader.expect_envelope().await.unwrap(), Envelope::End);
    assert_eq!(reader.read_envelope().await.unwrap(), None);

    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
    assert_eq!(demo.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_mode_is_answered_with_fault() {
    let host = host(&Arc::new(Demo::default()));
    let (mut client, serving) = open(&host, "conn-1");

    client.write_all(&[1, 0, 0x07]).await.unwrap();
    let mut answer = Vec::new();
    client.read_to_end(&mut answer).await.unwrap();

    assert_eq!(answer, PreambleFault::UnknownMode.to_record());
    assert_eq!(serving.await.unwrap(), CloseReason::Fault(PreambleFault::UnknownMode));
}

#[tokio::test]
async fn unregistered_via_is_endpoint_not_found() {
    let host = host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");

    let options = ConnectOptions::new(
        Url::parse("proto://host/other").unwrap(),
        FramingMode::SizedEnvelope,
    );
    let err = connect(client, options).await.unwrap_err();
    assert!(matches!(err, SessionError::Fault(PreambleFault::EndpointNotFound)));
    assert_eq!(
        serving.await.unwrap(),
        CloseReason::Fault(PreambleFault::EndpointNotFound)
    );
}

#[tokio::test]
async fn nested_via_resolves_to_registered_base() {
    let demo = Arc::new(Demo::default());
    let host = host(&demo);
    let (client, serving) = open(&host, "conn-1");

    let options = ConnectOptions::new(
        Url::parse("proto://host/svc/orders/42").unwrap(),
        FramingMode::SizedEnvelope,
    );
    let mut session = connect(client, options).await.unwrap();
    let reply = session.request(Message::new("echo", "nested")).await.unwrap();
    assert_eq!(&reply.body[..], b"nested");
    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

#[tokio::test]
async fn singleton_exchange() {
    let demo = Arc::new(Demo::default());
    let host = host(&demo);
    let (client, serving) = open(&host, "conn-1");

    let reply = call_singleton(
        client,
        options(FramingMode::Singleton),
        Message::new("echo", "once").with_message_id(7),
    )
    .await
    .unwrap();
    assert_eq!(&reply.body[..], b"once");
    assert_eq!(reply.relates_to(), Some(7));
    assert_eq!(serving.await.unwrap(), CloseReason::Completed);
}

#[tokio::test]
async fn operation_failure_keeps_session_usable() {
    let host = host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::SizedEnvelope)).await.unwrap();

    let fault = session.request(Message::new("fail", "")).await.unwrap();
    let detail = fault.fault_detail().unwrap();
    assert_eq!(detail.code, FaultCode::OperationFailed);
    assert_eq!(detail.reason, "boom");

    let unknown = session.request(Message::new("missing", "")).await.unwrap();
    assert_eq!(unknown.fault_detail().unwrap().code, FaultCode::ActionNotSupported);

    let reply = session.request(Message::new("echo", "still here")).await.unwrap();
    assert!(!reply.is_fault());
    assert_eq!(&reply.body[..], b"still here");

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

#[tokio::test]
async fn duplex_callbacks_reach_the_client() {
    let host = host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::Duplex)).await.unwrap();

    let reply = session.request(Message::new("subscribe", "payload")).await.unwrap();
    assert_eq!(&reply.body[..], b"subscribed");

    let callback = session.recv().await.unwrap().unwrap();
    assert_eq!(callback.action(), "tick");
    assert_eq!(&callback.body[..], b"payload");

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

#[tokio::test]
async fn one_way_duplex_message_gets_no_reply() {
    let demo = Arc::new(Demo::default());
    let host = host(&demo);
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::Duplex)).await.unwrap();

    session.send(Message::new("echo", "fire and forget")).await.unwrap();
    let reply = session.request(Message::new("echo", "answered")).await.unwrap();
    assert_eq!(&reply.body[..], b"answered");

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
    assert_eq!(demo.calls.load(Ordering::SeqCst), 2);
}

async fn max_overlap(concurrency: ConcurrencyMode) -> usize {
    let demo = Arc::new(Demo::default());
    let host = host_with(&demo, concurrency, HostConfig::default(), Arc::new(AllowAll));
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::Duplex)).await.unwrap();

    for id in 1..=4 {
        session
            .send(Message::new("work", "").with_message_id(id))
            .await
            .unwrap();
    }
    for _ in 0..4 {
        let reply = session.recv().await.unwrap().unwrap();
        assert!(!reply.is_fault());
    }
    session.close().await.unwrap();
    serving.await.unwrap();
    demo.max_active.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn single_concurrency_serializes_invocations() {
    assert_eq!(max_overlap(ConcurrencyMode::Single).await, 1);
}

#[tokio::test(start_paused = true)]
async fn multiple_concurrency_overlaps_invocations() {
    assert!(max_overlap(ConcurrencyMode::Multiple).await > 1);
}

async fn max_overlap_across_sessions(instance_mode: InstanceMode) -> usize {
    let demo = Arc::new(Demo::default());
    let host = host_for(
        &demo,
        descriptor(ConcurrencyMode::Single).with_instance_mode(instance_mode),
    );
    let (first, first_serving) = open(&host, "conn-1");
    let (second, second_serving) = open(&host, "conn-2");
    let mut first = connect(first, options(FramingMode::Duplex)).await.unwrap();
    let mut second = connect(second, options(FramingMode::Duplex)).await.unwrap();

    let (a, b) = tokio::join!(
        first.request(Message::new("work", "")),
        second.request(Message::new("work", "")),
    );
    assert!(!a.unwrap().is_fault());
    assert!(!b.unwrap().is_fault());

    first.close().await.unwrap();
    second.close().await.unwrap();
    first_serving.await.unwrap();
    second_serving.await.unwrap();
    demo.max_active.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn shared_instance_serializes_across_sessions() {
    assert_eq!(max_overlap_across_sessions(InstanceMode::Shared).await, 1);
}

#[tokio::test(start_paused = true)]
async fn per_session_instance_overlaps_across_sessions() {
    assert_eq!(max_overlap_across_sessions(InstanceMode::PerSession).await, 2);
}

#[tokio::test]
async fn unencodable_reply_is_faulted_and_session_continues() {
    let host = host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let options = options(FramingMode::SizedEnvelope).with_content_type(JSON_CONTENT_TYPE);
    let mut session = connect(client, options).await.unwrap();

    let reply = session.request(Message::new("bin", "")).await.unwrap();
    assert!(reply.is_fault());
    assert_eq!(reply.fault_detail().unwrap().code, FaultCode::OperationFailed);

    let reply = session.request(Message::new("echo", "still here")).await.unwrap();
    assert!(!reply.is_fault());
    assert_eq!(&reply.body[..], b"still here");

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

/// Accepts `budget` bytes of writes, then fails every write.
struct WriteBudget<S> {
    inner: S,
    budget: usize,
}

impl<S: AsyncRead + Unpin> AsyncRead for WriteBudget<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WriteBudget<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.budget == 0 {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let len = buf.len().min(self.budget);
        let written = std::task::ready!(Pin::new(&mut self.inner).poll_write(cx, &buf[..len]))?;
        self.budget -= written;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn write_failure_ends_the_connection() {
    let host = host(&Arc::new(Demo::default()));
    let (client, server) = tokio::io::duplex(64 * 1024);
    // Room for the handshake acknowledgement only.
    let server = WriteBudget { inner: server, budget: 1 };
    let serving = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.serve_connection(Box::new(server), "conn-1").await })
    };
    let mut session = connect(Box::new(client) as BoxedStream, options(FramingMode::Duplex))
        .await
        .unwrap();

    session.send(Message::new("echo", "lost").with_message_id(1)).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("connection should end after the writer fails")
        .unwrap();
    assert_eq!(reason, CloseReason::Transport("writer failed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_closed_by_sweep() {
    let config = HostConfig::default().with_idle_timeout(Some(Duration::from_secs(5)));
    let host = host_with(
        &Arc::new(Demo::default()),
        ConcurrencyMode::Multiple,
        config,
        Arc::new(AllowAll),
    );
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::SizedEnvelope)).await.unwrap();
    session.request(Message::new("echo", "warm up")).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(host.idle_manager().sweep().is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(host.idle_manager().sweep(), vec!["conn-1".to_string()]);

    assert!(session.recv().await.unwrap().is_none());
    assert_eq!(serving.await.unwrap(), CloseReason::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn in_flight_request_blocks_idle_close() {
    let demo = Arc::new(Demo::default());
    let config = HostConfig::default().with_idle_timeout(Some(Duration::from_secs(5)));
    let host = host_with(&demo, ConcurrencyMode::Multiple, config, Arc::new(AllowAll));
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::Duplex)).await.unwrap();

    session
        .send(Message::new("hold", "").with_message_id(1))
        .await
        .unwrap();
    demo.started.notified().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(host.idle_manager().sweep().is_empty());

    demo.release.notify_one();
    let reply = session.recv().await.unwrap().unwrap();
    assert_eq!(&reply.body[..], b"released");

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(host.idle_manager().sweep().len(), 1);
    assert!(session.recv().await.unwrap().is_none());
    assert_eq!(serving.await.unwrap(), CloseReason::Cancelled);
}

#[tokio::test]
async fn authorization_denial_is_a_fault_reply() {
    let demo = Arc::new(Demo::default());
    let host = host_with(
        &demo,
        ConcurrencyMode::Multiple,
        HostConfig::default(),
        Arc::new(RequireAuthenticated),
    );
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::SizedEnvelope)).await.unwrap();

    for _ in 0..2 {
        let reply = session.request(Message::new("echo", "x")).await.unwrap();
        assert_eq!(reply.fault_detail().unwrap().code, FaultCode::AccessDenied);
    }
    assert_eq!(demo.calls.load(Ordering::SeqCst), 0);

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

fn identity_host(demo: &Arc<Demo>) -> Arc<ServiceHost> {
    let handshake = HandshakeConfig::default()
        .with_upgrade(Arc::new(IdentityUpgrade::server(vec!["alice".to_string()])));
    host_with(
        demo,
        ConcurrencyMode::Multiple,
        HostConfig::default().with_handshake(handshake),
        Arc::new(RequireAuthenticated),
    )
}

#[tokio::test]
async fn identity_upgrade_authenticates_caller() {
    let host = identity_host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let options = options(FramingMode::SizedEnvelope)
        .with_upgrade(Arc::new(IdentityUpgrade::client("alice")));
    let mut session = connect(client, options).await.unwrap();

    let reply = session.request(Message::new("whoami", "")).await.unwrap();
    assert_eq!(&reply.body[..], b"alice");
    assert_eq!(
        reply.properties.security.as_ref().map(|security| security.principal.name.as_str()),
        Some("alice")
    );

    session.close().await.unwrap();
    assert_eq!(serving.await.unwrap(), CloseReason::ClientEnded);
}

#[tokio::test]
async fn rejected_upgrade_closes_without_fault() {
    let host = identity_host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let options = options(FramingMode::SizedEnvelope)
        .with_upgrade(Arc::new(IdentityUpgrade::client("mallory")));

    let err = connect(client, options).await.unwrap_err();
    assert!(!matches!(err, SessionError::Fault(_)), "unexpected fault: {err}");
    assert!(matches!(serving.await.unwrap(), CloseReason::HandshakeFailed(_)));
}

#[tokio::test]
async fn unsupported_upgrade_token_is_faulted() {
    let host = host(&Arc::new(Demo::default()));
    let (client, serving) = open(&host, "conn-1");
    let options = options(FramingMode::SizedEnvelope)
        .with_upgrade(Arc::new(IdentityUpgrade::client("alice")));

    let err = connect(client, options).await.unwrap_err();
    assert!(matches!(err, SessionError::Fault(PreambleFault::UnsupportedUpgrade)));
    assert_eq!(
        serving.await.unwrap(),
        CloseReason::Fault(PreambleFault::UnsupportedUpgrade)
    );
}

#[tokio::test]
async fn connection_limit_answers_server_too_busy() {
    let config = HostConfig::default().with_max_connections(1);
    let host = host_with(
        &Arc::new(Demo::default()),
        ConcurrencyMode::Multiple,
        config,
        Arc::new(AllowAll),
    );

    let (first, first_serving) = open(&host, "conn-1");
    let mut first = connect(first, options(FramingMode::SizedEnvelope)).await.unwrap();

    let (second, second_serving) = open(&host, "conn-2");
    let err = connect(second, options(FramingMode::SizedEnvelope)).await.unwrap_err();
    assert!(matches!(err, SessionError::Fault(PreambleFault::ServerTooBusy)));
    assert_eq!(second_serving.await.unwrap(), CloseReason::Refused);

    first.request(Message::new("echo", "ok")).await.unwrap();
    first.close().await.unwrap();
    assert_eq!(first_serving.await.unwrap(), CloseReason::ClientEnded);

    // The permit is released once the first session ends.
    let (third, third_serving) = open(&host, "conn-3");
    let third = connect(third, options(FramingMode::SizedEnvelope)).await.unwrap();
    third.close().await.unwrap();
    assert_eq!(third_serving.await.unwrap(), CloseReason::ClientEnded);
}

#[tokio::test]
async fn oversized_envelope_is_faulted_mid_session() {
    let handshake = HandshakeConfig::default()
        .with_frame_config(FrameConfig::default().with_max_envelope_size(128));
    let host = host_with(
        &Arc::new(Demo::default()),
        ConcurrencyMode::Multiple,
        HostConfig::default().with_handshake(handshake),
        Arc::new(AllowAll),
    );
    let (client, serving) = open(&host, "conn-1");
    let mut session = connect(client, options(FramingMode::SizedEnvelope)).await.unwrap();

    let err = session
        .request(Message::new("echo", vec![b'x'; 1024]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Fault(PreambleFault::EnvelopeTooLarge)));
    assert_eq!(
        serving.await.unwrap(),
        CloseReason::Fault(PreambleFault::EnvelopeTooLarge)
    );
}

#[tokio::test]
async fn host_run_serves_until_shutdown() {
    let demo = Arc::new(Demo::default());
    let host = host(&demo);
    let address: TransportAddress = "tcp://127.0.0.1:0".parse().unwrap();
    let listener = SessionListener::bind(&address).await.unwrap();
    let address = listener.local_address();
    let running = tokio::spawn(Arc::clone(&host).run(listener));

    let mut session = connect_to(&address, options(FramingMode::Duplex)).await.unwrap();
    let reply = session.request(Message::new("echo", "over tcp")).await.unwrap();
    assert_eq!(&reply.body[..], b"over tcp");

    host.shutdown();
    assert!(session.recv().await.unwrap().is_none());
    running.await.unwrap().unwrap();
}
