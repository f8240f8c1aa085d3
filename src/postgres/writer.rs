// ABOUTME: Idempotent bulk loader for the sink table
// ABOUTME: Uses INSERT ... ON CONFLICT DO NOTHING in chunks inside one transaction

use super::types::{convert_value, SinkType, SinkValue};
use super::SinkTable;
use crate::profile::StreamSchema;
use crate::sqlite::reader::Record;
use crate::timestamp::format_watermark;
use crate::utils::quote_ident;
use anyhow::{bail, Context, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

/// Build a conflict-ignoring insert for `num_rows` rows.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("key", "ts", "value")
/// VALUES ($1, $2, $3), ($4, $5, $6)
/// ON CONFLICT ("key", "ts") DO NOTHING
/// ```
pub(crate) fn build_insert_query(
    table: &SinkTable,
    columns: &[String],
    key_columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_keys: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
        table.quoted(),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quoted_keys.join(", ")
    )
}

/// Rows per statement for a table of `num_cols` columns.
pub(crate) fn rows_per_statement(num_cols: usize) -> usize {
    std::cmp::max(1, MAX_PARAMS / std::cmp::max(1, num_cols))
}

/// Convert records to sink values.
///
/// Key columns must convert cleanly, since a NULL or mangled key would break
/// idempotent replay. Other columns that cannot be converted are stored as
/// NULL; the count per column is returned for logging.
pub(crate) fn convert_records(
    schema: &StreamSchema,
    column_types: &[SinkType],
    records: &[Record],
) -> Result<(Vec<Vec<SinkValue>>, Vec<usize>)> {
    if column_types.len() != schema.columns.len() {
        bail!(
            "Column type count {} does not match stream width {}",
            column_types.len(),
            schema.columns.len()
        );
    }

    let mut nulled = vec![0usize; column_types.len()];
    let mut rows = Vec::with_capacity(records.len());

    for record in records {
        let mut row = Vec::with_capacity(column_types.len());
        for (idx, (value, ty)) in record.values.iter().zip(column_types).enumerate() {
            match convert_value(value, *ty, schema.time_zone) {
                Ok(converted) => row.push(converted),
                Err(e) if schema.is_key_index(idx) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Key column '{}' of row at {} cannot be stored as {}",
                            schema.columns[idx].name,
                            format_watermark(&record.ordering),
                            ty.sql_name()
                        )
                    });
                }
                Err(e) => {
                    tracing::debug!(
                        "Storing NULL for '{}': {}",
                        schema.columns[idx].name,
                        e
                    );
                    nulled[idx] += 1;
                    row.push(SinkValue::Null(*ty));
                }
            }
        }
        rows.push(row);
    }

    Ok((rows, nulled))
}

/// Insert `records` into `table`, ignoring rows whose key already exists.
///
/// All chunks run inside one transaction, so a failure leaves nothing behind.
/// Returns the number of rows actually inserted.
pub async fn load_records(
    client: &mut Client,
    table: &SinkTable,
    schema: &StreamSchema,
    column_types: &[SinkType],
    records: &[Record],
) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }

    let (rows, nulled) = convert_records(schema, column_types, records)?;
    for (idx, count) in nulled.iter().enumerate() {
        if *count > 0 {
            tracing::warn!(
                "{} values in column '{}' could not be converted to {} and were stored as NULL",
                count,
                schema.columns[idx].name,
                column_types[idx].sql_name()
            );
        }
    }

    let columns = schema.column_names();
    let key_columns = schema.key_columns();
    let batch_size = rows_per_statement(columns.len());

    let tx = client
        .transaction()
        .await
        .context("Failed to begin load transaction")?;

    let mut inserted = 0u64;
    for chunk in rows.chunks(batch_size) {
        let query = build_insert_query(table, &columns, &key_columns, chunk.len());

        let owned: Vec<Box<dyn ToSql + Sync + Send>> = chunk
            .iter()
            .flat_map(|row| row.iter().cloned().map(SinkValue::into_param))
            .collect();
        let params: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        inserted += tx
            .execute(&query, &params)
            .await
            .with_context(|| format!("Failed to insert batch into {}", table))?;
    }

    tx.commit()
        .await
        .with_context(|| format!("Failed to commit load into {}", table))?;

    let offered = records.len() as u64;
    if inserted == 0 {
        tracing::info!("All {} rows already present in {}", offered, table);
    } else if inserted < offered {
        tracing::warn!(
            "Inserted {} of {} rows into {}; {} duplicates skipped",
            inserted,
            offered,
            table,
            offered - inserted
        );
    } else {
        tracing::info!("Inserted {} rows into {}", inserted, table);
    }

    Ok(inserted)
}
