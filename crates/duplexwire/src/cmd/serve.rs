use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use duplexwire_dispatch::{
    ChannelShapes, ConcurrencyMode, DispatcherRegistry, HostConfig, InvocationContext,
    OperationDescriptor, OperationError, OperationInvoker, RequireAuthenticated,
    ServiceDescriptor, ServiceHost, SessionListener,
};
use duplexwire_frame::FrameConfig;
use duplexwire_session::{FramingMode, HandshakeConfig, IdentityUpgrade, Message};
use tracing::{info, warn};

use crate::cmd::{parse_address, parse_duration, parse_optional_duration, runtime, ServeArgs};
use crate::exit::{dispatch_error, CliError, CliResult, SUCCESS, USAGE};

/// The demo service: `echo`, `reverse`, and one-way `notify`.
struct EchoService;

#[async_trait]
impl OperationInvoker for EchoService {
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        request: Message,
    ) -> Result<Message, OperationError> {
        match request.action() {
            "echo" => Ok(request.reply("echo", request.body.clone())),
            "reverse" => Ok(request.reply("reverse", reverse_body(&request.body))),
            "notify" => {
                info!(
                    connection_id = %ctx.connection.id,
                    size = request.body.len(),
                    "notification received"
                );
                Ok(Message::new("notify", Bytes::new()))
            }
            other => Err(OperationError::failed(format!("unhandled action '{other}'"))),
        }
    }
}

fn echo_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("echo")
        .with_operation(OperationDescriptor::request_reply("Echo", "echo"))
        .with_operation(OperationDescriptor::request_reply("Reverse", "reverse"))
        .with_operation(OperationDescriptor::one_way("Notify", "notify"))
        .with_concurrency(ConcurrencyMode::Multiple)
}

/// Reverse text by character; anything that is not UTF-8 is reversed by byte.
fn reverse_body(body: &[u8]) -> Bytes {
    match std::str::from_utf8(body) {
        Ok(text) => Bytes::from(text.chars().rev().collect::<String>()),
        Err(_) => Bytes::from(body.iter().rev().copied().collect::<Vec<u8>>()),
    }
}

fn host_config(args: &ServeArgs) -> CliResult<HostConfig> {
    if args.max_connections == 0 {
        return Err(CliError::new(USAGE, "--max-connections must be greater than zero"));
    }
    if args.max_envelope_size == 0 {
        return Err(CliError::new(USAGE, "--max-envelope-size must be greater than zero"));
    }

    let mut frame = FrameConfig::default().with_max_envelope_size(args.max_envelope_size);
    let keep_alive = match &args.keep_alive {
        Some(interval) => {
            frame = frame.with_keep_alive(true);
            Some(parse_duration(interval)?)
        }
        None => None,
    };

    let mut handshake = HandshakeConfig::default().with_frame_config(frame);
    if let Some(modes) = &args.mode {
        let modes: Vec<FramingMode> = modes.iter().map(|mode| mode.framing_mode()).collect();
        handshake = handshake.with_modes(&modes);
    }
    if args.identity_upgrade {
        handshake = handshake.with_upgrade(Arc::new(IdentityUpgrade::server(args.allow.clone())));
    }

    Ok(HostConfig::default()
        .with_handshake(handshake)
        .with_idle_timeout(parse_optional_duration(&args.idle_timeout)?)
        .with_keep_alive_interval(keep_alive)
        .with_max_connections(args.max_connections))
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let config = host_config(&args)?;
    let registry = DispatcherRegistry::builder()
        .register(
            &args.base,
            ChannelShapes::ALL,
            echo_descriptor(),
            Arc::new(EchoService),
        )
        .map_err(|err| dispatch_error("registration failed", err))?
        .build();

    let mut host = ServiceHost::new(registry, config);
    if args.require_auth {
        host = host.with_authorizer(Arc::new(RequireAuthenticated));
    }
    let host = Arc::new(host);

    runtime()?.block_on(async move {
        let listener = SessionListener::bind(&address)
            .await
            .map_err(|err| dispatch_error("bind failed", err))?;
        info!(
            address = %listener.local_address(),
            base = %args.base,
            "echo service listening"
        );

        let shutdown = host.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(err) => warn!(error = %err, "signal handler unavailable, shutting down"),
            }
            shutdown.cancel();
        });

        Arc::clone(&host)
            .run(listener)
            .await
            .map_err(|err| dispatch_error("host failed", err))?;
        Ok::<_, CliError>(SUCCESS)
    })
}
