//! sockpuppet
//!
//! Runs the command server or sends a single request to one.
//! Configuration comes from `--config` or the `SOCKPUPPET_CONFIG` env var.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sockpuppet::{config::Config, Client, CommandKind, Dispatcher, Request, Server, SharedKey};

#[derive(Parser, Debug)]
#[command(name = "sockpuppet")]
#[command(about = "Encrypted point-to-point command channel")]
struct Args {
    /// Path to a JSON config file (defaults to SOCKPUPPET_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until an exit request, idle timeout or Ctrl-C
    Serve,
    /// Send one request
    Send {
        #[arg(long, value_enum)]
        kind: Kind,

        /// Request id (random UUID if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Sender identifier
        #[arg(long, default_value = "cli")]
        origin: String,

        /// Wait for and print the server's response
        #[arg(long)]
        reply: bool,
    },
    /// Print a freshly generated base64 key
    Keygen,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Exit,
    Info,
    Download,
    RunCommand,
    Collect,
    Monitor,
}

impl From<Kind> for CommandKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Exit => Self::Exit,
            Kind::Info => Self::Info,
            Kind::Download => Self::Download,
            Kind::RunCommand => Self::RunCommand,
            Kind::Collect => Self::Collect,
            Kind::Monitor => Self::Monitor,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Keygen => {
            println!("{}", SharedKey::generate().to_base64());
            Ok(())
        }
        Command::Serve => serve(&load_config(args.config.as_deref(), args.port)?).await,
        Command::Send {
            kind,
            id,
            origin,
            reply,
        } => {
            let config = load_config(args.config.as_deref(), args.port)?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            send(&config, Request::new(kind.into(), id, origin), reply).await
        }
    }
}

fn load_config(path: Option<&Path>, port: Option<u16>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env().context("Failed to load configuration")?,
    };
    if let Some(port) = port {
        config.port = port;
    }
    Ok(config)
}

async fn serve(config: &Config) -> Result<()> {
    // Command implementations are external; none are linked into this binary.
    let server = Server::from_config(config, Dispatcher::new(config.origin.clone()))?;
    server.start(true).await?;
    info!(addr = ?server.local_addr(), "Serving");

    tokio::select! {
        result = server.wait() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Ctrl-C received, stopping server");
            server.stop().await
        }
    }
}

async fn send(config: &Config, request: Request, reply: bool) -> Result<()> {
    let client = Client::new(config.addr(), config.codec()?).with_options(config.client_options());

    if reply {
        let response = client.request(&request).await?;
        println!(
            "{}",
            serde_json::json!({
                "origin": response.origin,
                "request_id": response.request_id,
                "attributes": response.attributes,
            })
        );
    } else {
        let bytes = client.send_request(&request).await?;
        info!(bytes, id = %request.id, "Request sent");
    }
    Ok(())
}
