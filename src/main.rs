//! PeerLink - demonstration server and client

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink::config::{self, Config};
use peerlink::{Client, Connection, ConnectionEvent, Envelope, Handler, Server};

/// PeerLink - find a peer on the LAN and talk to it
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(version = "0.1.0")]
#[command(about = "LAN peer discovery and message channels", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advertise a service and answer pings
    Serve {
        /// Service name to advertise
        #[arg(short, long)]
        service: Option<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Find a service, connect and exchange pings
    Ping {
        /// Service name to search for
        #[arg(short, long)]
        service: Option<String>,

        /// Number of pings
        #[arg(long, default_value_t = 3)]
        count: u32,

        /// Also open a back-channel and wait for the server's greeting
        #[arg(long)]
        back_channel: bool,
    },

    /// Print the endpoint of a service
    Discover {
        /// Service name to search for
        #[arg(short, long)]
        service: Option<String>,

        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { service, name } => {
            run_server(config, service, name).await?;
        }
        Commands::Ping {
            service,
            count,
            back_channel,
        } => {
            run_ping(config, service, count, back_channel).await?;
        }
        Commands::Discover { service, timeout } => {
            run_discovery(config, service, timeout).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Answers `ping` with `pong` and echoes everything else
struct PingHandler {
    name: String,
}

impl PingHandler {
    fn reply(&self, envelope: Envelope) -> Envelope {
        let id = if envelope.id == "ping" {
            "pong".to_string()
        } else {
            envelope.id
        };
        Envelope::new(id, self.name.clone(), envelope.payload)
    }
}

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
        tracing::debug!("{} from {}", envelope.id, connection.remote_addr());
        Some(self.reply(envelope))
    }
}

/// Run the discovery-enabled server
async fn run_server(
    config: Config,
    service: Option<String>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let service = service.unwrap_or(config.general.service.clone());
    let name = name.unwrap_or(config.general.name.clone());

    let mut server = Server::new(name.clone(), config.network.clone())
        .with_discovery_config(config.discovery.clone())
        .with_handler(PingHandler { name: name.clone() });
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    let addr = server.start(&service).await?;
    println!("Serving '{}' as '{}' on {}", service, name, addr);
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ConnectionEvent::Connected(conn) => {
                        println!("+ {} ({})", conn.peer_name().await, conn.remote_addr());
                    }
                    ConnectionEvent::Disconnected(conn) => {
                        println!("- {} ({})", conn.peer_name().await, conn.remote_addr());
                    }
                    ConnectionEvent::Error { connection, reason } => {
                        tracing::error!("{}: {}", connection.remote_addr(), reason);
                    }
                    ConnectionEvent::BackChannelReady { connection, back_channel } => {
                        println!("~ back-channel to {}", connection.peer_name().await);
                        let hello = Envelope::text("hello", name.clone(), "back-channel open");
                        if let Err(e) = back_channel.send(hello).await {
                            tracing::error!("Back-channel greeting failed: {}", e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    Ok(())
}

/// Discover, connect and ping
async fn run_ping(
    config: Config,
    service: Option<String>,
    count: u32,
    back_channel: bool,
) -> anyhow::Result<()> {
    let service = service.unwrap_or(config.general.service.clone());
    let client = Client::new(config.general.name.clone(), config.network.clone())
        .with_discovery_config(config.discovery.clone());

    let cancel = CancellationToken::new();
    let conn = tokio::select! {
        result = client.discover_and_connect(&service, &cancel) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Ok(());
        }
    };
    println!("Connected to {} ({})", conn.peer_name().await, conn.remote_addr());

    for i in 0..count {
        let started = std::time::Instant::now();
        let reply = conn
            .send_receive(Envelope::text("ping", client.name(), &i.to_string()))
            .await?;
        println!("{} from {} in {:?}", reply.id, reply.sender, started.elapsed());
    }

    if back_channel {
        let back = client.open_back_channel(&conn).await?;
        match tokio::time::timeout(Duration::from_secs(5), back.receive()).await {
            Ok(Ok(Some(envelope))) => {
                println!(
                    "Back-channel: {} from {}: {}",
                    envelope.id,
                    envelope.sender,
                    envelope.payload_str().unwrap_or("<binary>")
                );
            }
            Ok(Ok(None)) => println!("Back-channel closed"),
            Ok(Err(e)) => println!("Back-channel error: {}", e),
            Err(_) => println!("No message on the back-channel"),
        }
        back.close().await;
    }

    conn.close().await;
    Ok(())
}

/// Run service discovery
async fn run_discovery(
    config: Config,
    service: Option<String>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let service = service.unwrap_or(config.general.service.clone());
    println!("Searching for '{}' ({} seconds)...", service, timeout_secs);

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        deadline.cancel();
    });

    match peerlink::find_server(&config.discovery, &service, &cancel).await {
        Ok(addr) => println!("Found '{}' at {}", service, addr),
        Err(e) => println!("Not found: {}", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["peerlink", "ping", "--service", "T", "--count", "2"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_ping_handler_reply() {
        let handler = PingHandler { name: "T".into() };
        assert_eq!(
            handler.reply(Envelope::text("ping", "c1", "7")),
            Envelope::text("pong", "T", "7")
        );
        assert_eq!(
            handler.reply(Envelope::empty("status", "c1")),
            Envelope::empty("status", "T")
        );
    }
}
