//! Greet server over mutual TLS.
//!
//! Every call must carry the expected bearer token in its `token` header.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use secure_rpc::config::{RpcConfig, DEFAULT_PORT};
use secure_rpc::greet::GreetService;
use secure_rpc::protocol::auth::{AuthInterceptor, StaticTokenValidator};
use secure_rpc::service::Server;
use secure_rpc::transport::TlsServerConfig;
use secure_rpc::utils::logging;

#[derive(Parser)]
#[command(name = "greet-server")]
#[command(about = "Serve greet.GreetService over mutually authenticated TLS")]
struct Args {
    /// Listening port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Server certificate chain (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// Server private key (PEM)
    #[arg(long)]
    key: PathBuf,

    /// CA bundle used to verify client certificates; enables mutual TLS
    #[arg(long)]
    client_ca: Option<PathBuf>,

    /// Accept clients without a certificate even when a client CA is set
    #[arg(long, requires = "client_ca")]
    optional_client_auth: bool,

    /// Bearer token every call must present (defaults to the configured token)
    #[arg(long, env = "SECURE_RPC_TOKEN")]
    token: Option<String>,

    /// Milliseconds between GreetManyTimes responses
    #[arg(long, default_value_t = 1000)]
    stream_interval_ms: u64,

    /// TOML configuration file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RpcConfig::from_file(path),
        None => RpcConfig::from_env(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    config.server.address = format!("0.0.0.0:{}", args.port);
    if let Some(token) = &args.token {
        config.auth.token = token.clone();
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
    }

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: RpcConfig) -> secure_rpc::Result<()> {
    config.validate_strict()?;

    let mut tls = TlsServerConfig::new(args.cert, args.key);
    if let Some(client_ca) = args.client_ca {
        tls = tls
            .with_client_auth(client_ca)
            .require_client_auth(!args.optional_client_auth);
    }

    let validator = StaticTokenValidator::new(config.auth.token.clone());
    let service = GreetService::new(Duration::from_millis(args.stream_interval_ms)).into_service()?;

    let server = Server::builder(service)
        .tls(tls)
        .interceptor(AuthInterceptor::with_header(
            config.auth.header.clone(),
            Arc::new(validator),
        ))
        .config(config.server.clone())
        .transport(config.transport.clone())
        .build()?;

    info!(address = %config.server.address, "Starting greet server");
    server.serve(&config.server.address).await
}
