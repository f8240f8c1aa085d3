// ABOUTME: PostgreSQL sink connection and the traits the driver talks to
// ABOUTME: Opens TLS-capable connections with bounded retries and wraps the client

pub mod schema;
pub mod types;
pub mod writer;

use crate::profile::StreamSchema;
use crate::sqlite::reader::Record;
use crate::utils::{qualified_name, retry_with_backoff, strip_password_from_url};
use anyhow::{Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio_postgres::Client;
use types::SinkType;

/// Delay before the first extra connect attempt; doubles per attempt.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fully qualified sink relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTable {
    pub schema: String,
    pub name: String,
}

impl SinkTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted `"schema"."table"` for use in SQL.
    pub fn quoted(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }
}

impl fmt::Display for SinkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A live sink connection.
#[async_trait]
pub trait SinkHandle: Send {
    /// Make sure `table` exists with every stream column and the composite key.
    ///
    /// Returns the sink type of each stream column, in stream order.
    async fn reconcile(&mut self, table: &SinkTable, schema: &StreamSchema)
        -> Result<Vec<SinkType>>;

    /// Insert `records` in one transaction, skipping rows whose key exists.
    ///
    /// Returns the number of rows actually inserted.
    async fn load(
        &mut self,
        table: &SinkTable,
        schema: &StreamSchema,
        column_types: &[SinkType],
        records: &[Record],
    ) -> Result<u64>;

    /// Whether the underlying connection is known to be gone.
    fn is_closed(&self) -> bool;
}

/// Factory for sink handles.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    type Handle: SinkHandle;

    /// Open a new handle, giving up after a bounded number of attempts.
    async fn connect(&self) -> Result<Self::Handle>;

    /// Human readable target with secrets removed.
    fn describe(&self) -> String;
}

/// TLS negotiation mode for the sink connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl From<SslMode> for tokio_postgres::config::SslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require => tokio_postgres::config::SslMode::Require,
        }
    }
}

/// Connection settings for the PostgreSQL sink.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Full connection URL; takes precedence over the discrete fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
    pub allow_self_signed_certs: bool,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
}

/// Opens [`PgHandle`]s from fixed settings.
pub struct PgConnector {
    config: tokio_postgres::Config,
    tls: MakeTlsConnector,
    attempts: u32,
    description: String,
}

impl PgConnector {
    pub fn new(settings: &SinkSettings) -> Result<Self> {
        let (mut config, description) = match &settings.url {
            Some(url) => {
                let config = url
                    .parse::<tokio_postgres::Config>()
                    .context("Invalid sink connection URL")?;
                (config, strip_password_from_url(url))
            }
            None => {
                let mut config = tokio_postgres::Config::new();
                config
                    .host(&settings.host)
                    .port(settings.port)
                    .dbname(&settings.database)
                    .user(&settings.user)
                    .password(settings.password.as_bytes());
                let description = format!(
                    "postgresql://{}@{}:{}/{}",
                    settings.user, settings.host, settings.port, settings.database
                );
                (config, description)
            }
        };

        if config.get_connect_timeout().is_none() {
            config.connect_timeout(settings.connect_timeout);
        }
        if settings.url.is_none() || settings.ssl_mode != SslMode::Prefer {
            config.ssl_mode(settings.ssl_mode.into());
        }
        config.application_name("sqlite-pg-sync");

        if settings.allow_self_signed_certs {
            tracing::warn!("TLS certificate verification is disabled for the sink connection");
        }
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(settings.allow_self_signed_certs)
            .build()
            .context("Failed to build TLS connector")?;

        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
            attempts: settings.connect_attempts.max(1),
            description,
        })
    }
}

#[async_trait]
impl SinkConnector for PgConnector {
    type Handle = PgHandle;

    async fn connect(&self) -> Result<PgHandle> {
        let config = &self.config;
        let tls = &self.tls;
        let description = &self.description;

        let client = retry_with_backoff(
            move || {
                let tls = tls.clone();
                async move {
                    let (client, connection) = config
                        .connect(tls)
                        .await
                        .with_context(|| format!("Failed to connect to {}", description))?;

                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::warn!("Sink connection terminated: {}", e);
                        }
                    });

                    Ok(client)
                }
            },
            self.attempts - 1,
            CONNECT_RETRY_DELAY,
        )
        .await?;

        tracing::info!("Connected to sink {}", self.description);
        Ok(PgHandle { client })
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// A connected PostgreSQL client.
pub struct PgHandle {
    client: Client,
}

impl PgHandle {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SinkHandle for PgHandle {
    async fn reconcile(
        &mut self,
        table: &SinkTable,
        schema: &StreamSchema,
    ) -> Result<Vec<SinkType>> {
        schema::reconcile_table(&mut self.client, table, schema).await
    }

    async fn load(
        &mut self,
        table: &SinkTable,
        schema: &StreamSchema,
        column_types: &[SinkType],
        records: &[Record],
    ) -> Result<u64> {
        writer::load_records(&mut self.client, table, schema, column_types, records).await
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}
