// ABOUTME: SQLite source access for daily partition files
// ABOUTME: Opens partitions read-only and exposes locating, introspection and reading

pub mod introspect;
pub mod partition;
pub mod reader;

use crate::error::PartitionError;
use crate::utils::sanitize_identifier;
use anyhow::{Context, Result};
use partition::PartitionLayout;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// How long to wait on a partition that the producer still has locked.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a partition file read-only.
///
/// Partitions are written by another process, so the connection never
/// creates the file and never takes a write lock.
pub fn open_partition(path: &Path) -> Result<Connection, PartitionError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| PartitionError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|source| PartitionError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(conn)
}

/// Pick the source table to replicate.
///
/// A configured name wins. Otherwise the first user table of the newest
/// existing partition is used, so a fresh day's file decides the stream.
pub fn discover_source_table(layout: &PartitionLayout, configured: Option<&str>) -> Result<String> {
    if let Some(table) = configured {
        return Ok(table.to_string());
    }

    let partitions = layout.list_existing()?;
    let newest = partitions.last().with_context(|| {
        format!(
            "No partitions matching '{}' found in {}",
            layout.pattern(),
            layout.dir().display()
        )
    })?;

    let conn = open_partition(&newest.path)?;
    let table = introspect::resolve_table(&conn, &newest.path, None)?;
    tracing::info!(
        "Discovered source table '{}' in {}",
        sanitize_identifier(&table),
        newest.path.display()
    );
    Ok(table)
}
