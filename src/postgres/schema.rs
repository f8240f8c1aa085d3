// ABOUTME: Sink table reconciliation: create on first sight, add columns later
// ABOUTME: Runs in one transaction and never alters or drops existing columns

use super::types::SinkType;
use super::SinkTable;
use crate::error::SinkError;
use crate::profile::{StreamColumn, StreamSchema};
use crate::utils::quote_ident;
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio_postgres::{Client, Transaction};

/// Build the `CREATE TABLE` statement for a new sink table.
///
/// ```sql
/// CREATE TABLE "public"."readings" ("key" TEXT, "timestamp" DOUBLE PRECISION, ...,
///   PRIMARY KEY ("key", "timestamp"))
/// ```
pub(crate) fn build_create_table(table: &SinkTable, schema: &StreamSchema) -> String {
    let column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.sink_type.sql_name()))
        .collect();
    let key_columns: Vec<String> = schema.key_columns().iter().map(|c| quote_ident(c)).collect();

    format!(
        "CREATE TABLE {} ({}, PRIMARY KEY ({}))",
        table.quoted(),
        column_defs.join(", "),
        key_columns.join(", ")
    )
}

pub(crate) fn build_add_column(table: &SinkTable, column: &StreamColumn) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table.quoted(),
        quote_ident(&column.name),
        column.sink_type.sql_name()
    )
}

/// Columns of the stream that the sink table does not have yet.
pub(crate) fn missing_columns<'a>(
    schema: &'a StreamSchema,
    existing: &HashMap<String, String>,
) -> Vec<&'a StreamColumn> {
    schema
        .columns
        .iter()
        .filter(|c| !existing.contains_key(&c.name))
        .collect()
}

/// Effective sink type of every stream column, in stream order.
///
/// Existing columns keep the type the table already has.
pub(crate) fn effective_types(
    schema: &StreamSchema,
    existing: &HashMap<String, String>,
) -> Vec<SinkType> {
    schema
        .columns
        .iter()
        .map(|c| match existing.get(&c.name) {
            Some(data_type) => SinkType::from_information_schema(data_type),
            None => c.sink_type,
        })
        .collect()
}

/// Ensure the sink table matches the stream, creating or extending it.
///
/// Everything happens in one transaction; any error rolls it back,
/// including losing a race with another process creating the same table.
pub async fn reconcile_table(
    client: &mut Client,
    table: &SinkTable,
    schema: &StreamSchema,
) -> Result<Vec<SinkType>> {
    let tx = client
        .transaction()
        .await
        .context("Failed to begin reconciliation transaction")?;

    let existing = get_table_columns(&tx, table).await?;

    let column_types = if existing.is_empty() {
        tracing::info!(
            "Creating sink table {} with primary key ({}, {})",
            table,
            schema.identity_column(),
            schema.ordering_column()
        );
        tx.batch_execute(&build_create_table(table, schema))
            .await
            .with_context(|| format!("Failed to create sink table {}", table))?;
        schema.columns.iter().map(|c| c.sink_type).collect()
    } else {
        verify_primary_key(&tx, table, schema).await?;

        for column in missing_columns(schema, &existing) {
            tracing::info!(
                "Adding column {} {} to {}",
                column.name,
                column.sink_type.sql_name(),
                table
            );
            tx.batch_execute(&build_add_column(table, column))
                .await
                .with_context(|| format!("Failed to add column '{}' to {}", column.name, table))?;
        }

        effective_types(schema, &existing)
    };

    tx.commit()
        .await
        .with_context(|| format!("Failed to commit reconciliation of {}", table))?;

    Ok(column_types)
}

/// Column name to `information_schema` data type; empty when the table is absent.
async fn get_table_columns(
    tx: &Transaction<'_>,
    table: &SinkTable,
) -> Result<HashMap<String, String>> {
    let rows = tx
        .query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}", table))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let dtype: String = row.get(1);
            (name, dtype)
        })
        .collect())
}

/// The conflict rule only works if the table's primary key is exactly
/// (identity, ordering).
async fn verify_primary_key(
    tx: &Transaction<'_>,
    table: &SinkTable,
    schema: &StreamSchema,
) -> Result<()> {
    let rows = tx
        .query(
            "SELECT a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE i.indisprimary
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to get primary key for {}", table))?;

    let actual: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
    let expected = schema.key_columns();

    if actual.len() != expected.len() || !expected.iter().all(|c| actual.contains(c)) {
        return Err(SinkError::PrimaryKeyMismatch {
            table: table.to_string(),
            expected: expected.join(", "),
            actual: actual.join(", "),
        }
        .into());
    }

    Ok(())
}
