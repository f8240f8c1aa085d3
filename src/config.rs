// ABOUTME: Layered configuration - CLI and environment over TOML file over defaults
// ABOUTME: Validates everything once at startup into an immutable SyncConfig

use crate::postgres::{SinkSettings, SinkTable, SslMode};
use crate::profile::{KeyPolicy, ProfileKind, ReplicationProfile};
use crate::replication::DriverConfig;
use crate::sqlite::partition::{PartitionLayout, DEFAULT_PARTITION_PATTERN};
use crate::timestamp::TimeZoneMode;
use crate::utils::expand_home;
use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHECKPOINT_PATH: &str = "./data/last_successful_time.json";
const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_SINK_SCHEMA: &str = "public";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;
const DEFAULT_INITIAL_RETRY_SECS: u64 = 1;
const DEFAULT_MAX_RETRY_SECS: u64 = 60;
const DEFAULT_RECONNECT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Contents of the optional TOML config file. Every field is optional.
///
/// ```toml
/// [source]
/// dir = "~/telemetry"
/// table = "readings"
/// profile = "generic"
///
/// [sink]
/// host = "db.internal"
/// database = "metrics"
/// user = "sync"
/// password = "secret"
///
/// [sync]
/// interval_secs = 15
/// time_zone = "local"
///
/// [checkpoint]
/// path = "./data/last_successful_time.json"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    pub dir: Option<String>,
    pub pattern: Option<String>,
    pub table: Option<String>,
    pub profile: Option<ProfileKind>,
    pub identity_key: Option<String>,
    pub ordering_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSection {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub sslmode: Option<SslMode>,
    pub allow_self_signed_certs: Option<bool>,
    pub connect_timeout_secs: Option<u64>,
    pub connect_attempts: Option<u32>,
    /// Dotenv file holding the POSTGRES_* secrets
    pub env_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub interval_secs: Option<u64>,
    /// Zone of watermarks, the wall clock and partition dates
    pub time_zone: Option<TimeZoneMode>,
    pub initial_retry_delay_secs: Option<u64>,
    pub max_retry_delay_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSection {
    pub path: Option<String>,
    /// Watermark to start from when no valid checkpoint exists
    pub initial: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

/// Export the variables of a dotenv file into the process environment.
///
/// Variables that are already set keep their value. A configured file that
/// does not exist is an error.
pub fn load_env_file(raw: &str) -> Result<PathBuf> {
    let path = expand_home(raw)?;
    if !path.is_file() {
        bail!("Env file {} does not exist", path.display());
    }
    dotenvy::from_path(&path)
        .with_context(|| format!("Failed to load env file {}", path.display()))?;
    Ok(path)
}

/// Values given on the command line or through environment variables.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub source_dir: Option<String>,
    pub partition_pattern: Option<String>,
    pub source_table: Option<String>,
    pub profile: Option<ProfileKind>,
    pub identity_key: Option<String>,
    pub ordering_key: Option<String>,
    pub sink_url: Option<String>,
    pub pg_host: Option<String>,
    pub pg_port: Option<u16>,
    pub pg_database: Option<String>,
    pub pg_user: Option<String>,
    pub pg_password: Option<String>,
    pub sink_schema: Option<String>,
    pub sink_table: Option<String>,
    pub sslmode: Option<SslMode>,
    pub allow_self_signed_certs: bool,
    pub checkpoint_path: Option<String>,
    pub initial_watermark: Option<String>,
    pub interval_secs: Option<u64>,
    pub initial_retry_delay_secs: Option<u64>,
    pub max_retry_delay_secs: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub time_zone: Option<TimeZoneMode>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub layout: PartitionLayout,
    pub source_table: Option<String>,
    pub profile: ProfileKind,
    pub key_policy: KeyPolicy,
    pub sink: SinkSettings,
    pub sink_schema: String,
    pub sink_table: Option<String>,
    pub checkpoint_path: PathBuf,
    pub initial_watermark: Option<NaiveDateTime>,
    pub time_zone: TimeZoneMode,
    pub sync_interval: Duration,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub reconnect_delay: Duration,
}

impl SyncConfig {
    /// Merge overrides over the file config over defaults and validate.
    pub fn resolve(file: FileConfig, overrides: ConfigOverrides) -> Result<Self> {
        let FileConfig {
            source,
            sink,
            sync,
            checkpoint,
        } = file;

        let source_dir = overrides.source_dir.or(source.dir).context(
            "Missing source directory: set --source-dir, SQLITE_DB_DIR or [source] dir",
        )?;
        let pattern = overrides
            .partition_pattern
            .or(source.pattern)
            .unwrap_or_else(|| DEFAULT_PARTITION_PATTERN.to_string());
        let layout = PartitionLayout::new(expand_home(&source_dir)?, &pattern)?;

        let profile = overrides.profile.or(source.profile).unwrap_or_default();
        let key_policy = match (
            overrides.identity_key.or(source.identity_key),
            overrides.ordering_key.or(source.ordering_key),
        ) {
            (None, None) => KeyPolicy::NameHeuristic,
            (Some(identity), Some(ordering)) => {
                if profile != ProfileKind::Generic {
                    bail!("Explicit identity/ordering keys only apply to the generic profile");
                }
                KeyPolicy::Explicit { identity, ordering }
            }
            _ => bail!("Identity key and ordering key must be given together"),
        };

        let sink_url = overrides.sink_url.or(sink.url);
        let host = overrides.pg_host.or(sink.host);
        let database = overrides.pg_database.or(sink.database);
        let user = overrides.pg_user.or(sink.user);
        let password = overrides.pg_password.or(sink.password);
        let port = overrides.pg_port.or(sink.port).unwrap_or(DEFAULT_PG_PORT);

        let (host, database, user, password) = if sink_url.is_some() {
            (
                host.unwrap_or_default(),
                database.unwrap_or_default(),
                user.unwrap_or_default(),
                password.unwrap_or_default(),
            )
        } else {
            let mut missing = Vec::new();
            if host.is_none() {
                missing.push("POSTGRES_HOST");
            }
            if database.is_none() {
                missing.push("POSTGRES_DATABASE");
            }
            if user.is_none() {
                missing.push("POSTGRES_USER");
            }
            if password.is_none() {
                missing.push("POSTGRES_PASSWORD");
            }
            if !missing.is_empty() {
                bail!(
                    "Missing sink connection settings: {} (or give a full URL with --sink-url / DATABASE_URL)",
                    missing.join(", ")
                );
            }
            (
                host.unwrap_or_default(),
                database.unwrap_or_default(),
                user.unwrap_or_default(),
                password.unwrap_or_default(),
            )
        };

        let connect_timeout = Duration::from_secs(
            overrides
                .connect_timeout_secs
                .or(sink.connect_timeout_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        );
        let sink_settings = SinkSettings {
            url: sink_url,
            host,
            port,
            database,
            user,
            password,
            ssl_mode: overrides.sslmode.or(sink.sslmode).unwrap_or_default(),
            allow_self_signed_certs: overrides.allow_self_signed_certs
                || sink.allow_self_signed_certs.unwrap_or(false),
            connect_timeout,
            connect_attempts: overrides
                .connect_attempts
                .or(sink.connect_attempts)
                .unwrap_or(DEFAULT_CONNECT_ATTEMPTS),
        };

        let sink_schema = overrides
            .sink_schema
            .or(sink.schema)
            .unwrap_or_else(|| DEFAULT_SINK_SCHEMA.to_string());
        let sink_table = overrides.sink_table.or(sink.table);
        let source_table = overrides.source_table.or(source.table);
        for (label, value) in [
            ("sink schema", Some(&sink_schema)),
            ("sink table", sink_table.as_ref()),
            ("source table", source_table.as_ref()),
        ] {
            if value.map(|v| v.trim().is_empty()).unwrap_or(false) {
                bail!("The {} must not be empty", label);
            }
        }

        let checkpoint_path = expand_home(
            &overrides
                .checkpoint_path
                .or(checkpoint.path)
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_PATH.to_string()),
        )?;
        let time_zone = overrides.time_zone.or(sync.time_zone).unwrap_or_default();
        let initial_watermark = overrides
            .initial_watermark
            .or(checkpoint.initial)
            .map(|raw| {
                time_zone
                    .parse_instant(raw.trim())
                    .ok_or_else(|| anyhow!("Unrecognized timestamp '{}'", raw))
            })
            .transpose()
            .context("Invalid initial watermark")?;

        let sync_interval = positive_secs(
            "sync interval",
            overrides.interval_secs.or(sync.interval_secs),
            DEFAULT_SYNC_INTERVAL_SECS,
        )?;
        let initial_retry_delay = positive_secs(
            "initial retry delay",
            overrides
                .initial_retry_delay_secs
                .or(sync.initial_retry_delay_secs),
            DEFAULT_INITIAL_RETRY_SECS,
        )?;
        let max_retry_delay = positive_secs(
            "max retry delay",
            overrides.max_retry_delay_secs.or(sync.max_retry_delay_secs),
            DEFAULT_MAX_RETRY_SECS,
        )?;
        let reconnect_delay = positive_secs(
            "reconnect delay",
            overrides.reconnect_delay_secs.or(sync.reconnect_delay_secs),
            DEFAULT_RECONNECT_SECS,
        )?;
        if initial_retry_delay > max_retry_delay {
            bail!(
                "Initial retry delay ({:?}) must not exceed max retry delay ({:?})",
                initial_retry_delay,
                max_retry_delay
            );
        }

        Ok(Self {
            layout,
            source_table,
            profile,
            key_policy,
            sink: sink_settings,
            sink_schema,
            sink_table,
            checkpoint_path,
            initial_watermark,
            time_zone,
            sync_interval,
            initial_retry_delay,
            max_retry_delay,
            reconnect_delay,
        })
    }

    pub fn replication_profile(&self) -> ReplicationProfile {
        ReplicationProfile::from_kind(self.profile, self.key_policy.clone())
    }

    /// Driver settings for replicating `source_table`; the sink table defaults
    /// to the source table's name.
    pub fn driver_config(&self, source_table: &str) -> DriverConfig {
        let table = self
            .sink_table
            .clone()
            .unwrap_or_else(|| source_table.to_string());
        DriverConfig {
            sink_table: SinkTable::new(self.sink_schema.clone(), table),
            sync_interval: self.sync_interval,
            initial_retry_delay: self.initial_retry_delay,
            max_retry_delay: self.max_retry_delay,
            reconnect_delay: self.reconnect_delay,
            time_zone: self.time_zone,
        }
    }
}

fn positive_secs(label: &str, value: Option<u64>, default: u64) -> Result<Duration> {
    let secs = value.unwrap_or(default);
    if secs == 0 {
        bail!("The {} must be at least one second", label);
    }
    Ok(Duration::from_secs(secs))
}
