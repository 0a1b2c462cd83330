use anyhow::Context;
use callcore::net::TransportFactory;
use callcore::types::{CallId, LocalIdentity};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use peercall::media::NoMediaDevices;
use peercall::{CallConfig, CallCoordinator, CallStatusClient};
use peercall_tokio_transport::WebSocketSignalingFactory;
use peercall_ureq_http_client::UreqHttpClient;
use std::sync::Arc;

// Signaling utility for the call service.
//
// Usage:
//   peercall --token T --user-id U status CALL_ID   # print the server's call record
//   peercall --token T --user-id U listen           # log and decline incoming calls

#[derive(Parser, Debug)]
#[command(name = "peercall", version, about = "Peer-to-peer call signaling client")]
struct Cli {
    /// JSON config file; missing fields use defaults.
    #[arg(long, short)]
    config: Option<std::path::PathBuf>,

    #[arg(long, env = "PEERCALL_TOKEN")]
    token: String,

    #[arg(long, env = "PEERCALL_USER_ID")]
    user_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the status record of a call.
    Status { call_id: String },
    /// Stay connected and decline every incoming call.
    Listen,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => CallConfig::from_json_file(path)?,
        None => CallConfig::default(),
    };
    let identity = LocalIdentity::new(cli.user_id, cli.token);

    match cli.command {
        Command::Status { call_id } => {
            let client = CallStatusClient::new(
                Arc::new(UreqHttpClient::new()),
                config.api_base_url.clone(),
                identity,
            );
            let record = client
                .fetch_status(&CallId::new(call_id))
                .await
                .context("fetching call status")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Listen => listen(config, identity).await?,
    }
    Ok(())
}

async fn listen(config: CallConfig, identity: LocalIdentity) -> anyhow::Result<()> {
    let factory = WebSocketSignalingFactory::new(config.signaling_url.clone(), identity.clone());
    let (transport, events) = factory.create_transport().await?;
    info!("Listening for calls as {}", identity.user_id);

    let coordinator = CallCoordinator::start(
        config,
        Some(identity),
        transport.clone(),
        events,
        Arc::new(NoMediaDevices),
    );

    let mut incoming = coordinator.events().incoming_call.subscribe();
    let mut ended = coordinator.events().call_ended.subscribe();
    loop {
        tokio::select! {
            Ok(call) = incoming.recv() => {
                info!("{} call {} from {}", call.call_type, call.call_id, call.from);
                if let Err(e) = coordinator.reject_call().await {
                    warn!("Could not decline {}: {e}", call.call_id);
                }
            }
            Ok(call) = ended.recv() => {
                info!("Call {:?} closed ({:?})", call.call_id, call.reason);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let _ = coordinator.shutdown().await;
    transport.disconnect().await;
    Ok(())
}
