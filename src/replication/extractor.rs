// ABOUTME: Pulls new records from every partition between the watermark and now
// ABOUTME: Skips unreadable or non-conformant partitions and merges rows by ordering key

use crate::error::PartitionError;
use crate::profile::{ReplicationProfile, StreamSchema};
use crate::sqlite::introspect::table_columns;
use crate::sqlite::open_partition;
use crate::sqlite::partition::{Partition, PartitionLayout};
use crate::sqlite::reader::{read_since, Record};
use crate::timestamp::TimeZoneMode;
use chrono::{Days, NaiveDateTime};

/// Result of one extraction pass.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Schema of the first conformant partition; `None` if none was usable
    pub schema: Option<StreamSchema>,
    /// Records sorted ascending by ordering key
    pub records: Vec<Record>,
    pub partitions_read: usize,
    pub partitions_skipped: usize,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_ordering(&self) -> Option<NaiveDateTime> {
        self.records.last().map(|r| r.ordering)
    }
}

/// Reads one source table across the daily partitions.
#[derive(Debug, Clone)]
pub struct Extractor {
    layout: PartitionLayout,
    source_table: String,
    profile: ReplicationProfile,
    time_zone: TimeZoneMode,
}

impl Extractor {
    pub fn new(layout: PartitionLayout, source_table: String, profile: ReplicationProfile) -> Self {
        Self {
            layout,
            source_table,
            profile,
            time_zone: TimeZoneMode::default(),
        }
    }

    /// Zone the watermark is expressed in and epoch values are read into.
    pub fn with_time_zone(mut self, time_zone: TimeZoneMode) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    /// Collect every record with ordering key at or after `watermark` from the
    /// partitions dated `watermark.date()` through `now.date()`, plus one day
    /// either side.
    ///
    /// The producer may date its files in a different zone than the
    /// watermark; the extra days cover any offset and the exact `>=` filter
    /// drops what they add. Partition failures are logged and counted; they
    /// never fail the pass.
    pub fn extract(&self, watermark: NaiveDateTime, now: NaiveDateTime) -> Extraction {
        let from = watermark.date();
        let to = now.date().max(from);
        let partitions = self.layout.locate(
            from.checked_sub_days(Days::new(1)).unwrap_or(from),
            to.checked_add_days(Days::new(1)).unwrap_or(to),
        );
        let mut extraction = Extraction::default();

        for partition in &partitions {
            match self.read_partition(partition, watermark, extraction.schema.as_ref()) {
                Ok((schema, records)) => {
                    tracing::debug!(
                        "Read {} new rows from {}",
                        records.len(),
                        partition.path.display()
                    );
                    if extraction.schema.is_none() {
                        extraction.schema = Some(schema);
                    }
                    extraction.records.extend(records);
                    extraction.partitions_read += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping partition {}: {}", partition.path.display(), e);
                    extraction.partitions_skipped += 1;
                }
            }
        }

        // Stable, so rows sharing an ordering value keep partition order
        extraction.records.sort_by_key(|r| r.ordering);
        extraction
    }

    fn read_partition(
        &self,
        partition: &Partition,
        watermark: NaiveDateTime,
        authoritative: Option<&StreamSchema>,
    ) -> Result<(StreamSchema, Vec<Record>), PartitionError> {
        let conn = open_partition(&partition.path)?;
        let columns = table_columns(&conn, &self.source_table)?;

        let schema = match authoritative {
            None => self
                .profile
                .resolve_schema(&columns)?
                .in_time_zone(self.time_zone),
            Some(schema) => {
                for expected in &schema.columns {
                    if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(&expected.name)) {
                        return Err(PartitionError::NonConformant {
                            reason: format!("column '{}' is missing", expected.name),
                        });
                    }
                }
                schema.clone()
            }
        };

        let read = read_since(&conn, &self.source_table, &schema, watermark)?;
        Ok((schema, read.records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::KeyPolicy;
    use crate::sqlite::partition::DEFAULT_PARTITION_PATTERN;
    use rusqlite::Connection;
    use std::path::Path;

    fn ts(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    fn write_partition(dir: &Path, name: &str, ddl: &str, rows: &[(&str, &str, f64)]) {
        let conn = Connection::open(dir.join(name)).unwrap();
        conn.execute(ddl, []).unwrap();
        for (key, at, value) in rows {
            conn.execute(
                "INSERT INTO readings (key, event_time, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, at, value],
            )
            .unwrap();
        }
    }

    const DDL: &str = "CREATE TABLE readings (key TEXT, event_time TEXT, value REAL)";

    fn extractor(dir: &Path) -> Extractor {
        Extractor::new(
            PartitionLayout::new(dir, DEFAULT_PARTITION_PATTERN).unwrap(),
            "readings".to_string(),
            ReplicationProfile::Generic {
                keys: KeyPolicy::NameHeuristic,
            },
        )
    }

    #[test]
    fn test_extract_merges_partitions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(
            dir.path(),
            "2024_05_02.db",
            DDL,
            &[("b", "2024-05-02 00:00:05", 3.0), ("a", "2024-05-02 00:00:01", 2.0)],
        );
        write_partition(
            dir.path(),
            "2024_05_01.db",
            DDL,
            &[("a", "2024-05-01 23:59:59", 1.0), ("a", "2024-05-01 08:00:00", 0.0)],
        );

        let extraction = extractor(dir.path())
            .extract(ts("2024-05-01 12:00:00"), ts("2024-05-02 18:00:00"));

        assert_eq!(extraction.partitions_read, 2);
        assert_eq!(extraction.partitions_skipped, 0);
        let order: Vec<NaiveDateTime> = extraction.records.iter().map(|r| r.ordering).collect();
        assert_eq!(
            order,
            vec![
                ts("2024-05-01 23:59:59"),
                ts("2024-05-02 00:00:01"),
                ts("2024-05-02 00:00:05"),
            ]
        );
        assert_eq!(extraction.max_ordering(), Some(ts("2024-05-02 00:00:05")));
        let schema = extraction.schema.unwrap();
        assert_eq!(schema.identity_column(), "key");
        assert_eq!(schema.ordering_column(), "event_time");
    }

    #[test]
    fn test_extract_skips_unreadable_and_nonconformant_partitions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2024_05_01.db"), vec![b'x'; 4096]).unwrap();
        write_partition(
            dir.path(),
            "2024_05_02.db",
            "CREATE TABLE readings (key TEXT, value REAL, event_time TEXT)",
            &[("a", "2024-05-02 00:00:01", 1.0)],
        );
        // Lacks the value column the authoritative schema expects
        let conn = Connection::open(dir.path().join("2024_05_03.db")).unwrap();
        conn.execute("CREATE TABLE readings (key TEXT, event_time TEXT)", [])
            .unwrap();
        conn.execute(
            "INSERT INTO readings VALUES ('z', '2024-05-03 00:00:00')",
            [],
        )
        .unwrap();

        let extraction = extractor(dir.path())
            .extract(ts("2024-05-01 00:00:00"), ts("2024-05-03 12:00:00"));

        assert_eq!(extraction.partitions_read, 1);
        assert_eq!(extraction.partitions_skipped, 2);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(
            extraction.schema.unwrap().column_names(),
            vec!["key", "value", "event_time"]
        );
    }

    #[test]
    fn test_extract_later_partition_uses_authoritative_column_order() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), "2024_05_01.db", DDL, &[("a", "2024-05-01 01:00:00", 1.0)]);
        write_partition(
            dir.path(),
            "2024_05_02.db",
            "CREATE TABLE readings (value REAL, extra TEXT, event_time TEXT, key TEXT)",
            &[("b", "2024-05-02 01:00:00", 2.0)],
        );

        let extraction = extractor(dir.path())
            .extract(ts("2024-05-01 00:00:00"), ts("2024-05-02 12:00:00"));

        assert_eq!(extraction.partitions_read, 2);
        let last = &extraction.records[1];
        assert_eq!(last.values.len(), 3);
        assert_eq!(last.values[0], rusqlite::types::Value::Text("b".to_string()));
        assert_eq!(last.values[2], rusqlite::types::Value::Real(2.0));
    }

    #[test]
    fn test_extract_empty_when_no_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let extraction = extractor(dir.path())
            .extract(ts("2024-05-01 00:00:00"), ts("2024-05-03 00:00:00"));

        assert!(extraction.is_empty());
        assert!(extraction.schema.is_none());
        assert_eq!(extraction.max_ordering(), None);
    }

    #[test]
    fn test_extract_reads_neighbouring_days_but_filters_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_partition(dir.path(), "2024_04_29.db", DDL, &[("a", "2024-05-01 09:00:00", 1.0)]);
        write_partition(dir.path(), "2024_04_30.db", DDL, &[("a", "2024-04-30 10:00:00", 1.0)]);
        write_partition(dir.path(), "2024_05_01.db", DDL, &[("a", "2024-05-01 10:00:00", 1.0)]);

        let extraction = extractor(dir.path())
            .extract(ts("2024-05-01 00:00:00"), ts("2024-05-01 23:00:00"));

        // 04_30 is opened as the day before the watermark; 04_29 is out of range
        assert_eq!(extraction.partitions_read, 2);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.max_ordering(), Some(ts("2024-05-01 10:00:00")));
    }

    #[test]
    fn test_extract_finds_rows_in_file_dated_by_producer_zone() {
        // A producer four hours behind UTC files its 20:00 and 21:00 local
        // readings under its own date, 2024-05-01, while in UTC they fall on 05-02.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024_05_01.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE readings (key TEXT, timestamp REAL, value REAL)", [])
            .unwrap();
        let midnight_utc = 1_714_608_000.0;
        conn.execute(
            "INSERT INTO readings VALUES ('a', ?1, 1.0)",
            [midnight_utc],
        )
        .unwrap();

        let extractor = extractor(dir.path()).with_time_zone(TimeZoneMode::Utc);
        let first = extractor.extract(ts("2024-05-01 20:00:00"), ts("2024-05-02 00:30:00"));
        assert_eq!(first.records.len(), 1);
        let watermark = crate::timestamp::next_watermark(first.max_ordering().unwrap());

        conn.execute(
            "INSERT INTO readings VALUES ('a', ?1, 2.0)",
            [midnight_utc + 3600.0],
        )
        .unwrap();

        let second = extractor.extract(watermark, ts("2024-05-02 02:00:00"));
        assert_eq!(second.partitions_read, 1);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.max_ordering(), Some(ts("2024-05-02 01:00:00")));
    }
}
