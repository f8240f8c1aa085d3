// ABOUTME: Typed errors for the checkpoint, partitions and the sink connection
// ABOUTME: Classifies cycle failures into reconnect vs backoff handling

use std::path::PathBuf;
use thiserror::Error;

/// Why the persisted watermark could not be read.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint file {} does not exist", path.display())]
    Missing { path: PathBuf },

    #[error("checkpoint file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint file {} could not be accessed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    /// Missing and corrupt files are recoverable by seeding a fresh watermark.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Missing { .. } | Self::Corrupt { .. })
    }
}

/// A single partition could not contribute to a cycle.
///
/// These never fail a cycle on their own; the extractor logs them and moves
/// to the next partition.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("failed to open partition {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("partition {} contains no user tables", path.display())]
    NoTable { path: PathBuf },

    #[error("partition does not match the replication layout: {reason}")]
    NonConformant { reason: String },

    #[error("failed to read table '{table}': {source}")]
    Read {
        table: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Sink-side failures the driver needs to recognise by kind.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink connection is not established")]
    NotConnected,

    #[error("sink table {table} has primary key ({actual}), expected ({expected})")]
    PrimaryKeyMismatch {
        table: String,
        expected: String,
        actual: String,
    },
}

/// How the driver should react to a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The sink connection is gone; reconnect with the fixed delay.
    ConnectionLost,
    /// Anything else; retry from the unchanged watermark after backoff.
    Transient,
}

/// Decide whether a failed cycle lost the sink connection.
///
/// `handle_closed` is the handle's own view of its socket, which catches
/// drops that surfaced as a generic query error.
pub fn classify_failure(err: &anyhow::Error, handle_closed: bool) -> FailureKind {
    if handle_closed {
        return FailureKind::ConnectionLost;
    }

    for cause in err.chain() {
        if let Some(SinkError::NotConnected) = cause.downcast_ref::<SinkError>() {
            return FailureKind::ConnectionLost;
        }
        if let Some(pg) = cause.downcast_ref::<tokio_postgres::Error>() {
            if pg.is_closed() {
                return FailureKind::ConnectionLost;
            }
            let io_caused = std::error::Error::source(pg)
                .map(|src| src.is::<std::io::Error>())
                .unwrap_or(false);
            if io_caused {
                return FailureKind::ConnectionLost;
            }
        }
    }

    FailureKind::Transient
}
