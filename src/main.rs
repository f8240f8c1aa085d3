// ABOUTME: CLI entry point for sqlite-pg-sync
// ABOUTME: Resolves configuration and runs the replication driver until shutdown

use anyhow::Context;
use clap::Parser;
use sqlite_pg_sync::config::{load_env_file, ConfigOverrides, FileConfig, SyncConfig};
use sqlite_pg_sync::postgres::{PgConnector, SslMode};
use sqlite_pg_sync::profile::ProfileKind;
use sqlite_pg_sync::replication::{CheckpointStore, CycleOutcome, Extractor, ReplicationDriver};
use sqlite_pg_sync::timestamp::{format_watermark, TimeZoneMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sqlite-pg-sync")]
#[command(
    about = "Incrementally replicate daily SQLite partition files into PostgreSQL",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file; command-line and environment values override it
    #[arg(long, env = "SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Dotenv file to load POSTGRES_* secrets from; existing variables win
    #[arg(long, env = "SYNC_ENV_FILE")]
    env_file: Option<String>,
    /// Directory holding the daily partition files
    #[arg(long, env = "SQLITE_DB_DIR")]
    source_dir: Option<String>,
    /// strftime pattern mapping a date to a partition file name (default: %Y_%m_%d.db)
    #[arg(long)]
    partition_pattern: Option<String>,
    /// Source table to replicate (default: first table of the newest partition)
    #[arg(long)]
    source_table: Option<String>,
    /// Sink connection URL; replaces the discrete POSTGRES_* settings
    #[arg(long, env = "DATABASE_URL")]
    sink_url: Option<String>,
    #[arg(long, env = "POSTGRES_HOST")]
    pg_host: Option<String>,
    #[arg(long, env = "POSTGRES_PORT")]
    pg_port: Option<u16>,
    #[arg(long, env = "POSTGRES_DATABASE")]
    pg_database: Option<String>,
    #[arg(long, env = "POSTGRES_USER")]
    pg_user: Option<String>,
    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    pg_password: Option<String>,
    /// Sink schema (default: public)
    #[arg(long)]
    sink_schema: Option<String>,
    /// Sink table (default: the source table's name)
    #[arg(long)]
    sink_table: Option<String>,
    /// TLS mode for the sink connection
    #[arg(long, value_enum)]
    sslmode: Option<SslMode>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs", default_value_t = false)]
    allow_self_signed_certs: bool,
    /// Seconds to wait for the sink to accept a connection (default: 10)
    #[arg(long, env = "SYNC_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,
    /// Connection attempts per (re)connect before giving up (default: 3)
    #[arg(long, env = "SYNC_CONNECT_ATTEMPTS")]
    connect_attempts: Option<u32>,
    /// Watermark checkpoint file (default: ./data/last_successful_time.json)
    #[arg(long)]
    checkpoint_file: Option<String>,
    /// Watermark to start from when no valid checkpoint exists (default: now)
    #[arg(long)]
    initial_watermark: Option<String>,
    /// Seconds between replication cycles (default: 15)
    #[arg(long, env = "SYNC_INTERVAL")]
    interval: Option<u64>,
    /// Seconds to wait after the first failed cycle; doubles per failure (default: 1)
    #[arg(long, env = "SYNC_INITIAL_RETRY_DELAY")]
    initial_retry_delay: Option<u64>,
    /// Upper bound for the retry wait in seconds (default: 60)
    #[arg(long, env = "SYNC_MAX_RETRY_DELAY")]
    max_retry_delay: Option<u64>,
    /// Seconds between attempts to reopen a lost sink connection (default: 10)
    #[arg(long, env = "SYNC_RECONNECT_DELAY")]
    reconnect_delay: Option<u64>,
    /// Zone of watermarks, the wall clock and partition dates (default: local)
    #[arg(long, value_enum, env = "SYNC_TIME_ZONE")]
    time_zone: Option<TimeZoneMode>,
    /// Column layout of the source table
    #[arg(long, value_enum)]
    profile: Option<ProfileKind>,
    /// Identity column for the generic profile; requires --ordering-key
    #[arg(long)]
    identity_key: Option<String>,
    /// Ordering column for the generic profile; requires --identity-key
    #[arg(long)]
    ordering_key: Option<String>,
    /// Run a single replication cycle and exit
    #[arg(long)]
    once: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_dir: self.source_dir.clone(),
            partition_pattern: self.partition_pattern.clone(),
            source_table: self.source_table.clone(),
            profile: self.profile,
            identity_key: self.identity_key.clone(),
            ordering_key: self.ordering_key.clone(),
            sink_url: self.sink_url.clone(),
            pg_host: self.pg_host.clone(),
            pg_port: self.pg_port,
            pg_database: self.pg_database.clone(),
            pg_user: self.pg_user.clone(),
            pg_password: self.pg_password.clone(),
            sink_schema: self.sink_schema.clone(),
            sink_table: self.sink_table.clone(),
            sslmode: self.sslmode,
            allow_self_signed_certs: self.allow_self_signed_certs,
            checkpoint_path: self.checkpoint_file.clone(),
            initial_watermark: self.initial_watermark.clone(),
            interval_secs: self.interval,
            initial_retry_delay_secs: self.initial_retry_delay,
            max_retry_delay_secs: self.max_retry_delay,
            reconnect_delay_secs: self.reconnect_delay,
            connect_timeout_secs: self.connect_timeout,
            connect_attempts: self.connect_attempts,
            time_zone: self.time_zone,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    // Parse again so env-backed flags see the variables the file exported
    if let Some(env_file) = cli.env_file.clone().or_else(|| file.sink.env_file.clone()) {
        let path = load_env_file(&env_file)?;
        tracing::info!("Loaded environment from {}", path.display());
        cli = Cli::parse();
    }

    let config =
        SyncConfig::resolve(file, cli.overrides()).context("Invalid configuration")?;

    let source_table =
        sqlite_pg_sync::sqlite::discover_source_table(&config.layout, config.source_table.as_deref())
            .context("Failed to determine the source table")?;
    let driver_config = config.driver_config(&source_table);
    let profile = config.replication_profile();

    tracing::info!("Source: {} ({})", config.layout.dir().display(), config.layout.pattern());
    tracing::info!("Source table: {}", source_table);
    tracing::info!("Profile: {}", profile.name());
    tracing::info!("Sink table: {}", driver_config.sink_table);
    tracing::info!("Checkpoint file: {}", config.checkpoint_path.display());
    tracing::info!("Time zone: {:?}", config.time_zone);

    let connector = PgConnector::new(&config.sink)?;
    let extractor = Extractor::new(config.layout.clone(), source_table, profile)
        .with_time_zone(config.time_zone);
    let checkpoint = CheckpointStore::new(config.checkpoint_path.clone());
    let mut driver = ReplicationDriver::new(driver_config, extractor, checkpoint, connector);

    driver.initialize_checkpoint(config.initial_watermark)?;
    driver.connect().await?;

    if cli.once {
        tracing::info!("Running single replication cycle...");
        let report = driver.run_once().await?;

        println!();
        println!("========================================");
        println!("Replication cycle complete");
        println!("========================================");
        match report.outcome {
            CycleOutcome::NoNewData => println!("  No new records"),
            CycleOutcome::Loaded => {
                println!("  Partitions read: {}", report.partitions_read);
                println!("  Rows extracted: {}", report.rows_extracted);
                println!("  Rows inserted: {}", report.rows_inserted);
                println!("  Duplicates skipped: {}", report.duplicates());
            }
        }
        if report.partitions_skipped > 0 {
            println!("  Partitions skipped: {}", report.partitions_skipped);
        }
        println!("  Watermark: {}", format_watermark(&report.watermark_after));
        return Ok(());
    }

    tracing::info!("Press Ctrl+C to stop");
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received interrupt");
        let _ = ctrl_c_tx.send(());
    });

    #[cfg(unix)]
    {
        let term_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    tracing::info!("Received SIGTERM");
                    let _ = term_tx.send(());
                }
                Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
            }
        });
    }

    driver.run(shutdown_rx).await
}
