//! Gateway binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use segmentation_gateway::common::{parse_duration, GatewayConfig, ShardBackend};
use segmentation_gateway::ops::reconcile::{self, Resolution};
use segmentation_gateway::shard::{PgShard, ShardSet};
use segmentation_gateway::Gateway;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "segmentd")]
#[command(about = "User segmentation gateway over sharded Postgres")]
#[command(version)]
struct Cli {
    /// Config file (TOML); falls back to $SEGMENTD_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Deadline for a single shard operation (e.g. 500ms, 5s)
        #[arg(long, value_parser = parse_duration)]
        shard_timeout: Option<Duration>,

        /// Segment cache TTL (e.g. 5m)
        #[arg(long, value_parser = parse_duration)]
        cache_ttl: Option<Duration>,
    },

    /// Apply the shard schema to every configured Postgres shard
    Migrate,

    /// Inspect or resolve prepared transactions left on shards
    Prepared {
        #[command(subcommand)]
        command: PreparedCommands,
    },
}

#[derive(Subcommand)]
enum PreparedCommands {
    /// List prepared transactions on every shard
    List,

    /// Commit or roll back one prepared transaction on every shard
    Resolve {
        /// Transaction id (tx_...)
        tx_id: String,

        /// commit | rollback
        resolution: Resolution,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        GatewayConfig::load_default(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            shard_timeout,
            cache_ttl,
        } => {
            // CLI flags have priority over the file
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.http.bind_addr = bind;
            }
            if let Some(timeout) = shard_timeout {
                config.shards.statement_timeout_ms = timeout.as_millis() as u64;
            }
            if let Some(ttl) = cache_ttl {
                config.cache.ttl_secs = ttl.as_secs();
            }
            config.validate()?;

            Gateway::new(config).serve().await?;
        }
        Commands::Migrate => migrate(&config).await?,
        Commands::Prepared { command } => {
            let timeout = config.shards.statement_timeout();
            let shards = ShardSet::from_config(&config.shards)?;
            match command {
                PreparedCommands::List => {
                    let prepared = reconcile::list_orphans(&shards, timeout).await?;
                    if prepared.is_empty() {
                        println!("no prepared transactions");
                    }
                    for tx in prepared {
                        println!(
                            "shard {:>3}  {}  prepared at {}",
                            tx.shard,
                            tx.tx_id,
                            tx.prepared_at.to_rfc3339()
                        );
                    }
                }
                PreparedCommands::Resolve { tx_id, resolution } => {
                    let report = reconcile::resolve(&shards, &tx_id, resolution, timeout).await?;
                    println!(
                        "{} {}: resolved on {:?}, absent on {:?}",
                        resolution, report.tx_id, report.resolved, report.missing
                    );
                }
            }
        }
    }

    Ok(())
}

async fn migrate(config: &GatewayConfig) -> anyhow::Result<()> {
    let shards = &config.shards;
    if shards.backend != ShardBackend::Postgres {
        anyhow::bail!("migrate needs the postgres shard backend");
    }
    for (index, endpoint) in shards.endpoints.iter().enumerate() {
        let dsn = endpoint.resolve_dsn()?;
        let shard = PgShard::connect_lazy(
            index,
            &endpoint.name,
            &dsn,
            1,
            shards.statement_timeout(),
        )?;
        shard
            .migrate()
            .await
            .with_context(|| format!("migrating shard {} ({})", index, endpoint.name))?;
    }
    tracing::info!(shards = shards.endpoints.len(), "migration complete");
    Ok(())
}
