//! Greet client over mutual TLS.
//!
//! Runs one of the four Greet calls and prints the responses.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use secure_rpc::config::{RpcConfig, DEFAULT_TOKEN};
use secure_rpc::greet::{
    GreetRequest, GreetResponse, Greeter, GREET, GREET_EVERYONE, GREET_MANY_TIMES, LONG_GREET,
};
use secure_rpc::protocol::auth::StaticToken;
use secure_rpc::service::{CallOptions, Channel};
use secure_rpc::transport::TlsClientConfig;
use secure_rpc::utils::logging;
use secure_rpc::Status;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CallType {
    /// Unary
    Un,
    /// Server-side streaming
    Ss,
    /// Client-side streaming
    Cs,
    /// Bidirectional streaming
    Bs,
}

#[derive(Parser)]
#[command(name = "greet-client")]
#[command(about = "Call greet.GreetService over mutually authenticated TLS")]
struct Args {
    /// Server hostname or IP
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long)]
    port: u16,

    /// Trusted CA certificate (PEM)
    #[arg(long)]
    cacert: PathBuf,

    /// Client certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Name to verify the server certificate against instead of the host
    #[arg(long)]
    authority: Option<String>,

    /// Bearer token sent with every call
    #[arg(long, env = "SECURE_RPC_TOKEN", default_value = DEFAULT_TOKEN)]
    token: String,

    /// Which call to make
    #[arg(long, value_enum, default_value_t = CallType::Un)]
    call: CallType,

    /// Per-call deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match RpcConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
    }

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Client failed");
            ExitCode::FAILURE
        }
    }
}

fn request(first_name: &str, last_name: &str) -> GreetRequest {
    GreetRequest::new(Greeter::new(first_name, last_name))
}

async fn run(args: Args, config: RpcConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut tls = TlsClientConfig::new(args.cacert);
    if let (Some(cert), Some(key)) = (args.cert, args.key) {
        tls = tls.with_client_certificate(cert, key);
    }
    if let Some(authority) = args.authority {
        tls = tls.with_authority(authority);
    }

    let mut client_config = config.client.clone();
    if let Some(ms) = args.timeout_ms {
        client_config.call_timeout = Some(Duration::from_millis(ms));
    }

    let address = format!("{}:{}", args.host, args.port);
    let channel = Channel::builder(tls)
        .credentials(StaticToken::with_header(config.auth.header.clone(), args.token))
        .config(client_config)
        .transport(config.transport.clone())
        .open(&address)
        .await?;

    let outcome = match args.call {
        CallType::Un => do_unary(&channel).await,
        CallType::Ss => do_server_streaming(&channel).await,
        CallType::Cs => do_client_streaming(&channel).await,
        CallType::Bs => do_bidi_streaming(&channel).await,
    };

    channel.close(config.client.close_timeout).await;
    outcome.map_err(Into::into)
}

async fn do_unary(channel: &Channel) -> Result<(), Status> {
    info!("Starting to do a Unary RPC");
    let response: GreetResponse = channel
        .unary(&GREET, &request("John", "Doe"), CallOptions::new())
        .await?;
    println!("Response from Greet: {}", response.result);
    Ok(())
}

async fn do_server_streaming(channel: &Channel) -> Result<(), Status> {
    info!("Starting to do a Server Streaming RPC");
    let mut responses = channel
        .server_streaming::<_, GreetResponse>(&GREET_MANY_TIMES, &request("John", "Doe"), CallOptions::new())
        .await?;
    while let Some(response) = responses.message().await? {
        println!("Response from GreetManyTimes: {}", response.result);
    }
    Ok(())
}

async fn do_client_streaming(channel: &Channel) -> Result<(), Status> {
    info!("Starting to do a Client Streaming RPC");
    let mut call = channel
        .client_streaming::<GreetRequest, GreetResponse>(&LONG_GREET, CallOptions::new())
        .await?;
    for (first, last) in [("John", "Doe"), ("Jane", "Doe"), ("Mark", "Smith"), ("Lucy", "Brown")] {
        info!(first_name = first, "Sending request");
        call.send(&request(first, last)).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let response = call.close_and_recv().await?;
    println!("LongGreet response: {}", response.result);
    Ok(())
}

async fn do_bidi_streaming(channel: &Channel) -> Result<(), Status> {
    info!("Starting to do a BiDi Streaming RPC");
    let (mut sender, mut responses) = channel
        .bidi_streaming::<GreetRequest, GreetResponse>(&GREET_EVERYONE, CallOptions::new())
        .await?;

    let sending = tokio::spawn(async move {
        for (first, last) in [("John", "Doe"), ("Jane", "Doe"), ("Mark", "Smith"), ("Lucy", "Brown")] {
            info!(first_name = first, "Sending message");
            sender.send(&request(first, last)).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        sender.close_send().await;
        Ok::<_, Status>(())
    });

    while let Some(response) = responses.message().await? {
        println!("Received: {}", response.result);
    }
    match sending.await {
        Ok(result) => result,
        Err(e) => Err(Status::internal(format!("Sender task failed: {e}"))),
    }
}
