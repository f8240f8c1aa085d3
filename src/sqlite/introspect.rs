// ABOUTME: SQLite table and column discovery for a partition
// ABOUTME: Lists user tables and reads column declarations in native order

use crate::error::PartitionError;
use crate::utils::quote_ident;
use rusqlite::Connection;
use std::path::Path;

/// A source column as declared in the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Declared type lexeme, empty when the column was declared without one
    pub declared_type: String,
}

/// List all user tables in a SQLite database
///
/// Queries sqlite_master for user-created tables, excluding the `sqlite_*`
/// system tables. Returned sorted by name.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, PartitionError> {
    let read_err = |source| PartitionError::Read {
        table: "sqlite_master".to_string(),
        source,
    };

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type='table' \
             AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .map_err(read_err)?;

    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(read_err)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(read_err)?;

    Ok(tables)
}

/// Resolve the table to replicate from a partition.
///
/// Uses `configured` when given, otherwise the first user table by name.
pub fn resolve_table(
    conn: &Connection,
    path: &Path,
    configured: Option<&str>,
) -> Result<String, PartitionError> {
    if let Some(table) = configured {
        return Ok(table.to_string());
    }

    list_tables(conn)?
        .into_iter()
        .next()
        .ok_or_else(|| PartitionError::NoTable {
            path: path.to_path_buf(),
        })
}

/// Read the columns of `table` in declaration order.
///
/// A table that does not exist in this partition is non-conformant.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnSpec>, PartitionError> {
    let read_err = |source| PartitionError::Read {
        table: table.to_string(),
        source,
    };

    let query = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&query).map_err(read_err)?;

    // table_info columns: cid, name, type, notnull, dflt_value, pk
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnSpec {
                name: row.get(1)?,
                declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })
        .map_err(read_err)?
        .collect::<Result<Vec<ColumnSpec>, _>>()
        .map_err(read_err)?;

    if columns.is_empty() {
        return Err(PartitionError::NonConformant {
            reason: format!("table '{}' not found", table),
        });
    }

    Ok(columns)
}
