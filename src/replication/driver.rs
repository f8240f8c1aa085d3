// ABOUTME: Replication driver - runs extract/reconcile/load/advance cycles forever
// ABOUTME: Owns the sink connection, the reconnect loop and exponential backoff

use super::backoff::Backoff;
use super::checkpoint::CheckpointStore;
use super::extractor::Extractor;
use crate::error::{classify_failure, FailureKind, SinkError};
use crate::postgres::{SinkConnector, SinkHandle, SinkTable};
use crate::timestamp::{format_watermark, next_watermark, TimeZoneMode};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Source of "now" for choosing the partition range.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Timing and target settings for the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub sink_table: SinkTable,
    /// Wait after a successful cycle
    pub sync_interval: Duration,
    /// First wait after a failed cycle; doubles per consecutive failure
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Fixed wait between attempts to reopen a lost sink connection
    pub reconnect_delay: Duration,
    /// Zone of the wall clock that bounds the partition range
    pub time_zone: TimeZoneMode,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sink_table: SinkTable::new("public", "synced_data"),
            sync_interval: Duration::from_secs(15),
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(10),
            time_zone: TimeZoneMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Extracting,
    Reconciling,
    Loading,
    CheckpointAdvance,
    Reconnecting,
}

/// The single sink connection, owned by the driver.
pub struct ConnectionHolder<H> {
    handle: Option<H>,
}

impl<H: SinkHandle> ConnectionHolder<H> {
    pub fn empty() -> Self {
        Self { handle: None }
    }

    /// Borrow the live handle, or fail with [`SinkError::NotConnected`].
    pub fn acquire(&mut self) -> Result<&mut H, SinkError> {
        match self.handle.as_mut() {
            Some(handle) if !handle.is_closed() => Ok(handle),
            _ => Err(SinkError::NotConnected),
        }
    }

    pub fn replace(&mut self, handle: H) {
        self.handle = Some(handle);
    }

    /// Drop the handle, closing the connection.
    pub fn close(&mut self) {
        self.handle = None;
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_closed()).unwrap_or(false)
    }

    /// True only for a handle that exists and reports its socket gone.
    pub fn is_closed(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_closed()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoNewData,
    Loaded,
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub partitions_read: usize,
    pub partitions_skipped: usize,
    pub rows_extracted: usize,
    pub rows_inserted: u64,
    pub watermark_before: NaiveDateTime,
    pub watermark_after: NaiveDateTime,
    pub duration_ms: u64,
}

impl CycleReport {
    /// Rows the sink already had.
    pub fn duplicates(&self) -> u64 {
        (self.rows_extracted as u64).saturating_sub(self.rows_inserted)
    }
}

/// Drives replication cycles against one sink connection.
///
/// Each cycle:
/// 1. Reads the watermark from the checkpoint store
/// 2. Extracts records at or after it from the partitions up to today
/// 3. Reconciles the sink table with the extracted schema
/// 4. Loads the records, ignoring rows the sink already has
/// 5. Persists `max(ordering) + 1µs` as the new watermark
///
/// The checkpoint only moves after a committed load, so a failure at any
/// step retries the same rows later.
pub struct ReplicationDriver<C: SinkConnector> {
    config: DriverConfig,
    extractor: Extractor,
    checkpoint: CheckpointStore,
    connector: C,
    connection: ConnectionHolder<C::Handle>,
    backoff: Backoff,
    state: DriverState,
    clock: Clock,
}

impl<C: SinkConnector> ReplicationDriver<C> {
    pub fn new(
        config: DriverConfig,
        extractor: Extractor,
        checkpoint: CheckpointStore,
        connector: C,
    ) -> Self {
        let backoff = Backoff::new(config.initial_retry_delay, config.max_retry_delay);
        let time_zone = config.time_zone;
        Self {
            config,
            extractor,
            checkpoint,
            connector,
            connection: ConnectionHolder::empty(),
            backoff,
            state: DriverState::Idle,
            clock: Arc::new(move || time_zone.now()),
        }
    }

    /// Replace the wall clock used to bound the partition range.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Open the initial sink connection.
    pub async fn connect(&mut self) -> Result<()> {
        let handle = self
            .connector
            .connect()
            .await
            .with_context(|| format!("Failed to connect to sink {}", self.connector.describe()))?;
        self.connection.replace(handle);
        Ok(())
    }

    /// Load the watermark at startup, seeding it when the file is missing or corrupt.
    ///
    /// The seed is the operator-supplied value or the current time, and is
    /// persisted immediately so later cycles always find a valid checkpoint.
    pub fn initialize_checkpoint(&self, seed: Option<NaiveDateTime>) -> Result<NaiveDateTime> {
        match self.checkpoint.load() {
            Ok(watermark) => {
                tracing::info!("Resuming from watermark {}", format_watermark(&watermark));
                Ok(watermark)
            }
            Err(e) if e.is_recoverable() => {
                let seed = seed.unwrap_or_else(|| (self.clock)());
                tracing::error!(
                    "{}; starting from {}",
                    e,
                    format_watermark(&seed)
                );
                self.checkpoint
                    .save(seed)
                    .context("Failed to persist initial watermark")?;
                Ok(seed)
            }
            Err(e) => Err(e).context("Failed to read checkpoint"),
        }
    }

    /// Run one extract/reconcile/load/advance cycle.
    ///
    /// No data is a successful no-op. Any error leaves the checkpoint as it was.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();

        self.state = DriverState::Extracting;
        let watermark = self.checkpoint.load().context("Failed to read checkpoint")?;
        let now = (self.clock)();
        let extractor = self.extractor.clone();
        let extraction =
            tokio::task::spawn_blocking(move || extractor.extract(watermark, now))
                .await
                .context("Extraction task failed")?;

        let mut report = CycleReport {
            outcome: CycleOutcome::NoNewData,
            partitions_read: extraction.partitions_read,
            partitions_skipped: extraction.partitions_skipped,
            rows_extracted: extraction.records.len(),
            rows_inserted: 0,
            watermark_before: watermark,
            watermark_after: watermark,
            duration_ms: 0,
        };

        let (Some(schema), Some(max_ordering)) =
            (extraction.schema.as_ref(), extraction.max_ordering())
        else {
            self.state = DriverState::Idle;
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        };

        self.state = DriverState::Reconciling;
        let table = &self.config.sink_table;
        let handle = self.connection.acquire()?;
        let column_types = handle
            .reconcile(table, schema)
            .await
            .with_context(|| format!("Failed to reconcile sink table {}", table))?;

        self.state = DriverState::Loading;
        let inserted = handle
            .load(table, schema, &column_types, &extraction.records)
            .await
            .with_context(|| format!("Failed to load {} rows into {}", extraction.records.len(), table))?;

        self.state = DriverState::CheckpointAdvance;
        let advanced = next_watermark(max_ordering).max(watermark);
        self.checkpoint
            .save(advanced)
            .context("Failed to persist watermark")?;

        self.state = DriverState::Idle;
        report.outcome = CycleOutcome::Loaded;
        report.rows_inserted = inserted;
        report.watermark_after = advanced;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Run a single cycle, connecting first if needed.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        if !self.connection.is_connected() {
            self.connect().await?;
        }
        let report = self.run_cycle().await;
        if report.is_err() {
            self.state = DriverState::Idle;
        }
        report
    }

    /// Run cycles until a shutdown signal arrives.
    ///
    /// Shutdown is honoured while waiting between cycles; a cycle in
    /// progress always runs to completion first.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting replication of '{}' into {} with sync_interval={:?}",
            self.extractor.source_table(),
            self.config.sink_table,
            self.config.sync_interval
        );

        loop {
            if !self.connection.is_connected() {
                self.connection.close();
                if !self.reconnect(&mut shutdown).await {
                    break;
                }
            }

            let delay = match self.run_cycle().await {
                Ok(report) => {
                    self.backoff.reset();
                    log_report(&report);
                    self.config.sync_interval
                }
                Err(e) => match classify_failure(&e, self.connection.is_closed()) {
                    FailureKind::ConnectionLost => {
                        tracing::error!("Lost sink connection: {:#}", e);
                        self.connection.close();
                        if !self.reconnect(&mut shutdown).await {
                            break;
                        }
                        self.config.sync_interval
                    }
                    FailureKind::Transient => {
                        let delay = self.backoff.next_delay();
                        tracing::error!("Replication cycle failed: {:#}; retrying in {:?}", e, delay);
                        delay
                    }
                },
            };

            self.state = DriverState::Idle;
            if !wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        self.connection.close();
        self.state = DriverState::Idle;
        tracing::info!("Replication stopped; sink connection closed");
        Ok(())
    }

    /// Reopen the sink connection with a fixed delay between attempts.
    ///
    /// Returns false if shutdown was requested before a connection was made.
    async fn reconnect(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        self.state = DriverState::Reconnecting;
        let mut attempt = 0u64;

        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(handle) => {
                    tracing::info!(
                        attempt,
                        "Reconnected to sink {}",
                        self.connector.describe()
                    );
                    self.connection.replace(handle);
                    self.state = DriverState::Idle;
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        "Reconnect failed: {:#}; next attempt in {:?}",
                        e,
                        self.config.reconnect_delay
                    );
                    if !wait_or_shutdown(self.config.reconnect_delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }
}

fn log_report(report: &CycleReport) {
    match report.outcome {
        CycleOutcome::NoNewData => tracing::info!(
            partitions_read = report.partitions_read,
            partitions_skipped = report.partitions_skipped,
            "No new records since {}",
            format_watermark(&report.watermark_before)
        ),
        CycleOutcome::Loaded => tracing::info!(
            partitions_read = report.partitions_read,
            partitions_skipped = report.partitions_skipped,
            rows_extracted = report.rows_extracted,
            rows_inserted = report.rows_inserted,
            duplicates = report.duplicates(),
            duration_ms = report.duration_ms,
            "Cycle complete; watermark advanced to {}",
            format_watermark(&report.watermark_after)
        ),
    }
}

/// Sleep for `delay`; false if shutdown arrived first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.recv() => {
            tracing::info!("Shutdown signal received");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::types::SinkType;
    use crate::profile::{KeyPolicy, ReplicationProfile, StreamSchema};
    use crate::sqlite::partition::{PartitionLayout, DEFAULT_PARTITION_PATTERN};
    use crate::sqlite::reader::Record;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;

    // 2024-05-01 00:00:00 UTC
    const DAY_START: f64 = 1_714_521_600.0;

    fn ts(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[derive(Default)]
    struct SinkState {
        columns: Vec<String>,
        rows: BTreeMap<(String, String), Vec<String>>,
        connects: usize,
        refuse_connects: usize,
        fail_loads: usize,
        drop_on_load: bool,
        loads_attempted: usize,
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<SinkState>>);

    impl MemorySink {
        fn with<R>(&self, f: impl FnOnce(&mut SinkState) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    struct MemoryHandle {
        sink: MemorySink,
        closed: bool,
    }

    #[async_trait]
    impl SinkHandle for MemoryHandle {
        async fn reconcile(
            &mut self,
            _table: &SinkTable,
            schema: &StreamSchema,
        ) -> Result<Vec<SinkType>> {
            self.sink.with(|state| {
                for column in &schema.columns {
                    if !state.columns.contains(&column.name) {
                        state.columns.push(column.name.clone());
                    }
                }
            });
            Ok(schema.columns.iter().map(|c| c.sink_type).collect())
        }

        async fn load(
            &mut self,
            _table: &SinkTable,
            schema: &StreamSchema,
            _column_types: &[SinkType],
            records: &[Record],
        ) -> Result<u64> {
            let drop_now = self.sink.with(|state| {
                state.loads_attempted += 1;
                std::mem::take(&mut state.drop_on_load)
            });
            if drop_now {
                self.closed = true;
                anyhow::bail!("connection reset by peer");
            }

            self.sink.with(|state| {
                if state.fail_loads > 0 {
                    state.fail_loads -= 1;
                    anyhow::bail!("deadlock detected");
                }
                let mut inserted = 0u64;
                for record in records {
                    let key = (
                        format!("{:?}", record.values[schema.identity]),
                        format!("{:?}", record.values[schema.ordering]),
                    );
                    if !state.rows.contains_key(&key) {
                        let payload = record.values.iter().map(|v| format!("{:?}", v)).collect();
                        state.rows.insert(key, payload);
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[async_trait]
    impl SinkConnector for MemorySink {
        type Handle = MemoryHandle;

        async fn connect(&self) -> Result<MemoryHandle> {
            self.with(|state| -> Result<()> {
                if state.refuse_connects > 0 {
                    state.refuse_connects -= 1;
                    anyhow::bail!("connection refused");
                }
                state.connects += 1;
                Ok(())
            })?;
            Ok(MemoryHandle {
                sink: self.clone(),
                closed: false,
            })
        }

        fn describe(&self) -> String {
            "memory://sink".to_string()
        }
    }

    fn write_rows(dir: &Path, day: &str, rows: &[(&str, f64, f64)]) {
        let conn = Connection::open(dir.join(day)).unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS readings (key TEXT, timestamp REAL, value REAL)",
            [],
        )
        .unwrap();
        for (key, offset, value) in rows {
            conn.execute(
                "INSERT INTO readings VALUES (?1, ?2, ?3)",
                rusqlite::params![key, DAY_START + offset, value],
            )
            .unwrap();
        }
    }

    fn fast_config() -> DriverConfig {
        DriverConfig {
            sink_table: SinkTable::new("public", "readings"),
            sync_interval: Duration::from_millis(5),
            initial_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(5),
            time_zone: TimeZoneMode::Utc,
        }
    }

    fn driver(dir: &Path, sink: &MemorySink) -> ReplicationDriver<MemorySink> {
        let extractor = Extractor::new(
            PartitionLayout::new(dir, DEFAULT_PARTITION_PATTERN).unwrap(),
            "readings".to_string(),
            ReplicationProfile::Generic {
                keys: KeyPolicy::NameHeuristic,
            },
        )
        .with_time_zone(TimeZoneMode::Utc);
        ReplicationDriver::new(
            fast_config(),
            extractor,
            CheckpointStore::new(dir.join("state/last_successful_time.json")),
            sink.clone(),
        )
        .with_clock(Arc::new(|| ts("2024-05-01 12:00:00")))
    }

    fn scenario_rows(dir: &Path) {
        // 00:00:00.5, 00:01:00 and 00:02:00
        write_rows(
            dir,
            "2024_05_01.db",
            &[("a", 0.5, 1.0), ("a", 60.0, 2.0), ("b", 120.0, 3.0)],
        );
    }

    fn stored_watermark(dir: &Path) -> NaiveDateTime {
        CheckpointStore::new(dir.join("state/last_successful_time.json"))
            .load()
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_cycle_loads_rows_and_advances_watermark() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Loaded);
        assert_eq!(report.rows_extracted, 3);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.watermark_after, ts("2024-05-01 00:02:00.000001"));
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:02:00.000001"));
        assert_eq!(driver.state(), DriverState::Idle);
        sink.with(|state| {
            assert_eq!(state.rows.len(), 3);
            assert_eq!(state.columns, vec!["key", "timestamp", "value"]);
        });
    }

    #[tokio::test]
    async fn test_immediate_rerun_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();
        driver.run_cycle().await.unwrap();
        let loads_before = sink.with(|state| state.loads_attempted);

        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::NoNewData);
        assert_eq!(report.watermark_after, report.watermark_before);
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:02:00.000001"));
        assert_eq!(sink.with(|state| state.loads_attempted), loads_before);
    }

    #[tokio::test]
    async fn test_replay_from_old_watermark_inserts_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();
        driver.run_cycle().await.unwrap();

        // Simulate a crash after commit but before the checkpoint write
        CheckpointStore::new(dir.path().join("state/last_successful_time.json"))
            .save(ts("2024-05-01 00:00:00"))
            .unwrap();
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Loaded);
        assert_eq!(report.rows_inserted, 0);
        assert_eq!(report.duplicates(), 3);
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:02:00.000001"));
        assert_eq!(sink.with(|state| state.rows.len()), 3);
    }

    #[tokio::test]
    async fn test_boundary_row_is_reextracted_but_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:01:00"))).unwrap();
        driver.connect().await.unwrap();
        let first = driver.run_cycle().await.unwrap();
        assert_eq!(first.rows_inserted, 2);

        write_rows(dir.path(), "2024_05_01.db", &[("c", 180.0, 4.0)]);
        let second = driver.run_cycle().await.unwrap();

        assert_eq!(second.rows_extracted, 1);
        assert_eq!(second.rows_inserted, 1);
        assert_eq!(second.watermark_after, ts("2024-05-01 00:03:00.000001"));
    }

    #[tokio::test]
    async fn test_rows_filed_under_previous_day_survive_midnight() {
        let dir = tempfile::tempdir().unwrap();
        // A producer behind UTC keeps writing 05-02 rows into its 05-01 file
        write_rows(dir.path(), "2024_05_01.db", &[("a", 86_400.0, 1.0)]);
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink)
            .with_clock(Arc::new(|| ts("2024-05-02 00:30:00")));

        driver.initialize_checkpoint(Some(ts("2024-05-01 20:00:00"))).unwrap();
        driver.connect().await.unwrap();
        let first = driver.run_cycle().await.unwrap();
        assert_eq!(first.rows_inserted, 1);
        assert_eq!(first.watermark_after, ts("2024-05-02 00:00:00.000001"));

        write_rows(dir.path(), "2024_05_01.db", &[("a", 90_000.0, 2.0)]);
        let second = driver.run_cycle().await.unwrap();

        assert_eq!(second.outcome, CycleOutcome::Loaded);
        assert_eq!(second.partitions_read, 1);
        assert_eq!(second.rows_inserted, 1);
        assert_eq!(second.watermark_after, ts("2024-05-02 01:00:00.000001"));
        assert_eq!(sink.with(|state| state.rows.len()), 2);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_watermark() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        sink.with(|state| state.fail_loads = 1);
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();

        let err = driver.run_cycle().await.unwrap_err();
        assert_eq!(classify_failure(&err, false), FailureKind::Transient);
        assert_eq!(driver.state(), DriverState::Loading);
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:00:00"));

        let report = driver.run_cycle().await.unwrap();
        assert_eq!(report.rows_inserted, 3);
    }

    #[tokio::test]
    async fn test_no_data_cycle_does_not_need_a_connection() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::NoNewData);
        assert_eq!(report.partitions_read, 0);
    }

    #[tokio::test]
    async fn test_cycle_without_connection_is_connection_lost() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        let err = driver.run_cycle().await.unwrap_err();

        assert_eq!(classify_failure(&err, false), FailureKind::ConnectionLost);
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:00:00"));
    }

    #[tokio::test]
    async fn test_initialize_checkpoint_seeds_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::default();
        let driver = driver(dir.path(), &sink);

        // Missing: falls back to the clock and persists it
        assert_eq!(driver.initialize_checkpoint(None).unwrap(), ts("2024-05-01 12:00:00"));
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 12:00:00"));

        // Valid: kept as is, seed ignored
        assert_eq!(
            driver.initialize_checkpoint(Some(ts("2020-01-01 00:00:00"))).unwrap(),
            ts("2024-05-01 12:00:00")
        );

        // Corrupt: replaced by the seed
        std::fs::write(dir.path().join("state/last_successful_time.json"), "{oops").unwrap();
        assert_eq!(
            driver.initialize_checkpoint(Some(ts("2024-04-30 00:00:00"))).unwrap(),
            ts("2024-04-30 00:00:00")
        );
        assert_eq!(stored_watermark(dir.path()), ts("2024-04-30 00:00:00"));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_mid_run_fails_cycle() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();
        std::fs::write(dir.path().join("state/last_successful_time.json"), "[]").unwrap();

        let err = driver.run_cycle().await.unwrap_err();
        assert_eq!(classify_failure(&err, false), FailureKind::Transient);
        assert_eq!(sink.with(|state| state.rows.len()), 0);
    }

    #[tokio::test]
    async fn test_run_reconnects_after_connection_drop_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        sink.with(|state| state.drop_on_load = true);
        let mut driver = driver(dir.path(), &sink);

        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();
        driver.connect().await.unwrap();
        // The first two reconnect attempts are refused
        sink.with(|state| state.refuse_connects = 2);

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let task = tokio::spawn(async move {
            driver.run(shutdown_rx).await.unwrap();
            driver
        });

        let mut loaded = false;
        for _ in 0..400 {
            if sink.with(|state| state.rows.len()) == 3 {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(()).unwrap();
        let driver = task.await.unwrap();

        assert!(loaded, "rows were never loaded after reconnecting");
        assert!(!driver.is_connected());
        sink.with(|state| {
            // initial connect plus one successful reconnect
            assert_eq!(state.connects, 2);
            assert_eq!(state.refuse_connects, 0);
            assert!(state.loads_attempted >= 2);
        });
        assert_eq!(stored_watermark(dir.path()), ts("2024-05-01 00:02:00.000001"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::default();
        sink.with(|state| state.refuse_connects = usize::MAX);
        let mut driver = driver(dir.path(), &sink);
        driver.initialize_checkpoint(None).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let task = tokio::spawn(async move {
            driver.run(shutdown_rx).await.unwrap();
            driver
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        let driver = task.await.unwrap();

        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(sink.with(|state| state.connects), 0);
    }

    #[tokio::test]
    async fn test_run_once_connects_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        scenario_rows(dir.path());
        let sink = MemorySink::default();
        let mut driver = driver(dir.path(), &sink);
        driver.initialize_checkpoint(Some(ts("2024-05-01 00:00:00"))).unwrap();

        let report = driver.run_once().await.unwrap();

        assert_eq!(report.rows_inserted, 3);
        assert_eq!(sink.with(|state| state.connects), 1);
    }

    #[test]
    fn test_connection_holder() {
        let sink = MemorySink::default();
        let mut holder: ConnectionHolder<MemoryHandle> = ConnectionHolder::empty();
        assert!(matches!(holder.acquire(), Err(SinkError::NotConnected)));
        assert!(!holder.is_closed());

        holder.replace(MemoryHandle {
            sink: sink.clone(),
            closed: false,
        });
        assert!(holder.is_connected());
        assert!(holder.acquire().is_ok());

        holder.replace(MemoryHandle { sink, closed: true });
        assert!(!holder.is_connected());
        assert!(holder.is_closed());
        assert!(holder.acquire().is_err());

        holder.close();
        assert!(!holder.is_closed());
    }
}
