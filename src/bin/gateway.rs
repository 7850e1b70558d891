//! Gateway binary

use clap::{Parser, Subcommand};
use connector_gateway::{common::hash_token, Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "connector-gateway")]
#[command(about = "WebSocket gateway for remote connectors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Instance ID (defaults to a random one)
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP + WebSocket
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Shared store URL, e.g. redis://127.0.0.1:6379
        #[arg(long)]
        redis: Option<String>,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the digest of a connector token for the token table
    HashToken {
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            redis,
            config,
        } => {
            // File and environment first, CLI has priority
            let mut gateway_config = GatewayConfig::load(config.as_deref())?;
            if let Some(id) = id {
                gateway_config.instance_id = id;
            }
            if let Some(bind) = bind {
                gateway_config.bind_addr = bind;
            }
            if redis.is_some() {
                gateway_config.redis_url = redis;
            }
            gateway_config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| gateway_config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Gateway::new(gateway_config).serve().await?;
        }
        Commands::HashToken { token } => {
            println!("{}", hash_token(&token));
        }
    }

    Ok(())
}
