//! Operator binary: metadata migration and connectivity checks

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use gridbase::database::mask_url;
use gridbase::{Database, GridConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "gridbase")]
#[clap(about = "Gridbase - metadata schema and connectivity tooling")]
struct Args {
    /// Database connection URL (can also be set via GRIDBASE_DATABASE_URL env var)
    #[clap(long, env = "GRIDBASE_DATABASE_URL")]
    database_url: String,

    /// Maximum database connections in pool
    #[clap(long, default_value_t = 10, env = "GRIDBASE_MAX_CONNECTIONS")]
    max_connections: u32,

    /// Database connection timeout in seconds
    #[clap(long, default_value_t = 30, env = "GRIDBASE_CONNECTION_TIMEOUT")]
    connection_timeout_secs: u64,

    /// Log every SQL statement
    #[clap(long, env = "GRIDBASE_SQL_LOGGING")]
    sql_logging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the metadata tables and indexes when missing
    Migrate,
    /// Verify connectivity and read the metadata tables
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gridbase={},sea_orm=warn", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Database URL: {}", mask_url(&args.database_url));

    let config = GridConfig {
        max_connections: args.max_connections,
        min_connections: args.max_connections.min(5),
        connection_timeout_secs: args.connection_timeout_secs,
        enable_sql_logging: args.sql_logging,
        ..GridConfig::new(args.database_url)
    };
    let db = Database::connect(&config).await?;

    match args.command {
        Command::Migrate => {
            db.migrate().await?;
            tracing::info!("Migration finished");
        }
        Command::Check => {
            let tables = db.health_check().await?;
            tracing::info!("Database reachable ({:?}), {} tables registered", db.dialect(), tables);
        }
    }
    Ok(())
}
