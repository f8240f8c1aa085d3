// ABOUTME: Reads records at or after the watermark from one partition
// ABOUTME: Pushes a coarse numeric filter into SQLite and applies the exact one in Rust

use crate::error::PartitionError;
use crate::profile::StreamSchema;
use crate::utils::quote_ident;
use chrono::NaiveDateTime;
use rusqlite::types::Value;
use rusqlite::Connection;

/// Slack subtracted from the pushed-down epoch bound. Float epochs can land a
/// hair under their rounded microsecond value; the exact comparison happens
/// after parsing.
const PUSHDOWN_SLACK_SECS: f64 = 0.001;

/// One source row, aligned with the stream's column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub values: Vec<Value>,
    pub ordering: NaiveDateTime,
}

/// Records read from one partition plus the rows that had to be dropped.
#[derive(Debug, Default)]
pub struct PartitionRead {
    pub records: Vec<Record>,
    pub skipped_unordered: usize,
    pub skipped_null_identity: usize,
}

/// Build the SELECT for a partition read.
///
/// Numeric ordering values below the bound are filtered in SQLite. Text
/// values always come back, since their format is only known after parsing.
fn build_select(table: &str, schema: &StreamSchema) -> String {
    let columns: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
    let ordering = quote_ident(schema.ordering_column());

    format!(
        "SELECT {} FROM {} \
         WHERE NOT (typeof({ord}) IN ('integer', 'real') AND {ord} < ?1) \
         ORDER BY {ord}",
        columns.join(", "),
        quote_ident(table),
        ord = ordering
    )
}

/// Read every row of `table` whose ordering value is at or after `watermark`.
///
/// Rows whose ordering value cannot be interpreted, or whose identity is
/// NULL, are dropped and counted; they could never be keyed in the sink.
pub fn read_since(
    conn: &Connection,
    table: &str,
    schema: &StreamSchema,
    watermark: NaiveDateTime,
) -> Result<PartitionRead, PartitionError> {
    let read_err = |source| PartitionError::Read {
        table: table.to_string(),
        source,
    };

    let query = build_select(table, schema);
    let time_zone = schema.time_zone;
    let bound = time_zone.to_epoch_seconds(&watermark) - PUSHDOWN_SLACK_SECS;
    let width = schema.columns.len();

    let mut stmt = conn.prepare(&query).map_err(read_err)?;
    let mut rows = stmt.query([bound]).map_err(read_err)?;

    let mut out = PartitionRead::default();
    while let Some(row) = rows.next().map_err(read_err)? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(row.get::<_, Value>(idx).map_err(read_err)?);
        }

        let Some(ordering) = time_zone.ordering_value(&values[schema.ordering]) else {
            out.skipped_unordered += 1;
            continue;
        };
        if ordering < watermark {
            continue;
        }
        if matches!(values[schema.identity], Value::Null) {
            out.skipped_null_identity += 1;
            continue;
        }

        out.records.push(Record { values, ordering });
    }

    if out.skipped_unordered > 0 {
        tracing::warn!(
            "Skipped {} rows in '{}' with an unreadable '{}' value",
            out.skipped_unordered,
            table,
            schema.ordering_column()
        );
    }
    if out.skipped_null_identity > 0 {
        tracing::warn!(
            "Skipped {} rows in '{}' with NULL '{}'",
            out.skipped_null_identity,
            table,
            schema.identity_column()
        );
    }

    Ok(out)
}
