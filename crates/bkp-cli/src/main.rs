use std::sync::Arc;

use anyhow::{Context, Result};
use bkp_monalisa::{MonAlisaClient, PassSource};
use bkp_storage::{PgStore, PoolConfig};
use bkp_sync::{build_scheduler, MonAlisaSynchronizer, SyncConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bkp-cli")]
#[command(about = "Bookkeeping MonAlisa synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization and print its summary.
    Sync,
    /// Synchronize periodically until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Print normalized MonAlisa records without touching the database.
    Fetch {
        #[arg(value_enum)]
        resource: Resource,
        /// Data pass version description, for `details`.
        description: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Resource {
    DataPasses,
    Details,
    SimulationPasses,
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("BKP_LOG_JSON", false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn synchronizer(config: &SyncConfig) -> Result<MonAlisaSynchronizer<MonAlisaClient, PgStore>> {
    let client = config
        .monalisa_client()
        .context("configuring MonAlisa client")?;
    let store = PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to database")?;
    Ok(MonAlisaSynchronizer::new(client, store))
}

/// Runs the scheduler until Ctrl-C. Returns at once when synchronization is disabled.
async fn schedule(config: &SyncConfig) -> Result<()> {
    if !config.enable_synchronization {
        warn!("MONALISA_ENABLE_SYNCHRONIZATION is not set; nothing to schedule");
        return Ok(());
    }
    let synchronizer = Arc::new(synchronizer(config).await?);
    let mut sched = build_scheduler(config, synchronizer)
        .await?
        .context("scheduler not built although synchronization is enabled")?;
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = synchronizer(&config).await?.synchronize().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => schedule(&config).await?,
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, PoolConfig::default())
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Fetch {
            resource,
            description,
        } => {
            let client = config
                .monalisa_client()
                .context("configuring MonAlisa client")?;
            let json = match resource {
                Resource::DataPasses => {
                    serde_json::to_string_pretty(&client.data_pass_versions().await?)?
                }
                Resource::SimulationPasses => {
                    serde_json::to_string_pretty(&client.simulation_passes().await?)?
                }
                Resource::Details => {
                    let description = description
                        .context("`fetch details` needs a data pass version description")?;
                    let details = client.data_pass_version_details(&description).await?;
                    serde_json::to_string_pretty(&details)?
                }
            };
            println!("{json}");
        }
    }

    Ok(())
}
