use std::fs;
use std::sync::Arc;
use std::time::Duration;

use duplexwire_frame::FrameConfig;
use duplexwire_session::{
    call_singleton, connect_to, ConnectOptions, FramingMode, IdentityUpgrade, Message,
};
use duplexwire_transport::TransportAddress;
use tracing::debug;
use url::Url;

use crate::cmd::{parse_address, parse_duration, runtime, CallArgs};
use crate::exit::{
    io_error, session_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
    USAGE,
};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let address = parse_address(&args.address)?;
    let via = Url::parse(&args.via)
        .map_err(|err| CliError::new(USAGE, format!("invalid --via '{}': {err}", args.via)))?;
    let timeout = parse_duration(&args.timeout)?;
    let body = resolve_body(&args)?;
    let mode = args.mode.framing_mode();

    let mut options = ConnectOptions::new(via, mode).with_timeout(timeout);
    if let Some(content_type) = &args.content_type {
        options = options.with_content_type(content_type.as_str());
    }
    if args.keep_alive {
        options = options.with_frame_config(FrameConfig::default().with_keep_alive(true));
    }
    if let Some(identity) = &args.identity {
        options = options.with_upgrade(Arc::new(IdentityUpgrade::client(identity.as_str())));
    }
    let request = Message::new(args.action.as_str(), body);

    let reply = runtime()?.block_on(async {
        tokio::time::timeout(timeout, exchange(&address, options, request))
            .await
            .map_err(|_| {
                CliError::new(TIMEOUT, format!("call timed out after {}", humanize(timeout)))
            })?
    })?;

    print_reply(&reply, &args.via, mode, format);
    if reply.is_fault() {
        return Ok(FAILURE);
    }
    Ok(SUCCESS)
}

async fn exchange(
    address: &TransportAddress,
    options: ConnectOptions,
    request: Message,
) -> CliResult<Message> {
    if options.mode == FramingMode::Singleton {
        let stream = address
            .connect()
            .await
            .map_err(|err| transport_error("connect failed", err))?;
        return call_singleton(stream.into_boxed(), options, request)
            .await
            .map_err(|err| session_error("call failed", err));
    }

    let mut session = connect_to(address, options)
        .await
        .map_err(|err| session_error("connect failed", err))?;
    debug!(
        mode = %session.mode(),
        via = %session.info().via,
        "session negotiated"
    );
    let reply = session
        .request(request)
        .await
        .map_err(|err| session_error("request failed", err))?;
    session
        .close()
        .await
        .map_err(|err| session_error("close failed", err))?;
    Ok(reply)
}

fn resolve_body(args: &CallArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

fn humanize(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
