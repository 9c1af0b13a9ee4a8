use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use duplexwire_frame::DEFAULT_MAX_ENVELOPE_SIZE;
use duplexwire_session::FramingMode;
use duplexwire_transport::TransportAddress;

use crate::exit::{transport_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

/// Base address the demo service registers under when none is given.
pub const DEFAULT_BASE: &str = "proto://localhost/echo";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the echo service until interrupted.
    Serve(ServeArgs),
    /// Send one request and print the reply.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Framing mode as spelled on the command line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Singleton,
    Sized,
    Duplex,
}

impl ModeArg {
    pub fn framing_mode(self) -> FramingMode {
        match self {
            ModeArg::Singleton => FramingMode::Singleton,
            ModeArg::Sized => FramingMode::SizedEnvelope,
            ModeArg::Duplex => FramingMode::Duplex,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (tcp://host:port, unix:///path, pipe://name).
    pub address: String,
    /// Base address the echo service is registered under.
    #[arg(long, default_value = DEFAULT_BASE, env = "DUPLEXWIRE_BASE")]
    pub base: String,
    /// Framing modes to accept (comma-separated). Default: all.
    #[arg(long, value_delimiter = ',')]
    pub mode: Option<Vec<ModeArg>>,
    /// Offer the identity upgrade.
    #[arg(long)]
    pub identity_upgrade: bool,
    /// Identities the upgrade accepts (comma-separated). Default: any.
    #[arg(long, value_delimiter = ',', requires = "identity_upgrade")]
    pub allow: Vec<String>,
    /// Deny calls from connections without an authenticated identity.
    #[arg(long, requires = "identity_upgrade")]
    pub require_auth: bool,
    /// Close sessions idle for this long (e.g. 30s, 500ms); "off" disables.
    #[arg(long, default_value = "120s")]
    pub idle_timeout: String,
    /// Send keep-alive envelopes at this interval (e.g. 10s).
    #[arg(long)]
    pub keep_alive: Option<String>,
    /// Concurrent connections before new ones are refused.
    #[arg(long, default_value_t = 1024)]
    pub max_connections: usize,
    /// Largest envelope accepted or sent, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_ENVELOPE_SIZE)]
    pub max_envelope_size: usize,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Address to connect to (tcp://host:port, unix:///path, pipe://name).
    pub address: String,
    /// Endpoint URI carried in the preamble.
    #[arg(long, default_value = DEFAULT_BASE, env = "DUPLEXWIRE_VIA")]
    pub via: String,
    /// Action header of the request.
    #[arg(long, default_value = "echo")]
    pub action: String,
    /// Request body as a string.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the request body from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Framing mode to negotiate.
    #[arg(long, value_enum, default_value = "sized")]
    pub mode: ModeArg,
    /// Content type to request (default: the listener's default encoder).
    #[arg(long)]
    pub content_type: Option<String>,
    /// Present this identity through the identity upgrade.
    #[arg(long)]
    pub identity: Option<String>,
    /// Filter keep-alive envelopes (match a listener started with --keep-alive).
    #[arg(long)]
    pub keep_alive: bool,
    /// Overall deadline for connect, request, and close (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_address(input: &str) -> CliResult<TransportAddress> {
    input
        .parse()
        .map_err(|err| transport_error("invalid address", err))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Like [`parse_duration`], with "off" meaning no limit.
pub fn parse_optional_duration(input: &str) -> CliResult<Option<Duration>> {
    if input.trim().eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    parse_duration(input).map(Some)
}

pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to start runtime: {err}")))
}
