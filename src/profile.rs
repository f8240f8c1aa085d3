// ABOUTME: Replication profiles and key policies for source partitions
// ABOUTME: Resolves introspected columns into the stream schema used by a cycle

use crate::error::PartitionError;
use crate::postgres::types::{map_declared_type, SinkType};
use crate::sqlite::introspect::ColumnSpec;
use crate::timestamp::TimeZoneMode;
use serde::Deserialize;

/// Name fragments that mark a column as the ordering key.
const ORDERING_HINTS: &[&str] = &["time", "date"];
/// Exact names that mark a column as the identity key.
const IDENTITY_NAMES: &[&str] = &["key", "id", "register", "name"];
/// Name fragments that mark a column as the identity key.
const IDENTITY_HINTS: &[&str] = &["key", "register"];

/// Profile selector as it appears on the command line and in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    /// Any table; columns and keys discovered per partition
    #[default]
    Generic,
    /// Fixed key/timestamp/type/value readings with epoch-second timestamps
    Telemetry,
    /// Fixed start_date/end_date/price/volume bars
    PriceBars,
}

/// How the identity and ordering columns are chosen for generic partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Infer both keys from column names.
    NameHeuristic,
    /// Use the named columns, matched case-insensitively.
    Explicit { identity: String, ordering: String },
}

/// One column of the replicated stream, with the type it gets in the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamColumn {
    pub name: String,
    pub declared_type: String,
    pub sink_type: SinkType,
}

/// Column list of a stream plus the positions of its two key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    pub columns: Vec<StreamColumn>,
    pub identity: usize,
    pub ordering: usize,
    /// Zone in which epoch values and offset-qualified text are read
    pub time_zone: TimeZoneMode,
}

impl StreamSchema {
    pub fn in_time_zone(mut self, time_zone: TimeZoneMode) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn identity_column(&self) -> &str {
        &self.columns[self.identity].name
    }

    pub fn ordering_column(&self) -> &str {
        &self.columns[self.ordering].name
    }

    /// Primary key columns in constraint order.
    pub fn key_columns(&self) -> [String; 2] {
        [
            self.identity_column().to_string(),
            self.ordering_column().to_string(),
        ]
    }

    pub fn is_key_index(&self, idx: usize) -> bool {
        idx == self.identity || idx == self.ordering
    }
}

/// The closed set of source shapes the engine knows how to replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationProfile {
    Generic { keys: KeyPolicy },
    Telemetry,
    PriceBars,
}

struct FixedColumn {
    name: &'static str,
    declared_type: &'static str,
    sink_type: SinkType,
}

const TELEMETRY_COLUMNS: &[FixedColumn] = &[
    FixedColumn {
        name: "key",
        declared_type: "TEXT",
        sink_type: SinkType::Text,
    },
    FixedColumn {
        name: "timestamp",
        declared_type: "REAL",
        sink_type: SinkType::Double,
    },
    FixedColumn {
        name: "type",
        declared_type: "TEXT",
        sink_type: SinkType::Text,
    },
    FixedColumn {
        name: "value",
        declared_type: "REAL",
        sink_type: SinkType::Double,
    },
];

const PRICE_BAR_COLUMNS: &[FixedColumn] = &[
    FixedColumn {
        name: "start_date",
        declared_type: "TEXT",
        sink_type: SinkType::Text,
    },
    FixedColumn {
        name: "end_date",
        declared_type: "TEXT",
        sink_type: SinkType::Text,
    },
    FixedColumn {
        name: "price",
        declared_type: "REAL",
        sink_type: SinkType::Real,
    },
    FixedColumn {
        name: "volume",
        declared_type: "REAL",
        sink_type: SinkType::Real,
    },
];

impl ReplicationProfile {
    pub fn from_kind(kind: ProfileKind, keys: KeyPolicy) -> Self {
        match kind {
            ProfileKind::Generic => Self::Generic { keys },
            ProfileKind::Telemetry => Self::Telemetry,
            ProfileKind::PriceBars => Self::PriceBars,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Generic { .. } => "generic",
            Self::Telemetry => "telemetry",
            Self::PriceBars => "price-bars",
        }
    }

    /// Build the stream schema for a partition with the given columns.
    ///
    /// Fails with [`PartitionError::NonConformant`] when a key cannot be
    /// resolved or a fixed profile column is absent.
    pub fn resolve_schema(&self, columns: &[ColumnSpec]) -> Result<StreamSchema, PartitionError> {
        match self {
            Self::Generic { keys } => resolve_generic(columns, keys),
            // identity key, ordering timestamp
            Self::Telemetry => resolve_fixed(columns, TELEMETRY_COLUMNS, 0, 1),
            // identity end_date, ordering start_date
            Self::PriceBars => resolve_fixed(columns, PRICE_BAR_COLUMNS, 1, 0),
        }
    }
}

fn resolve_generic(columns: &[ColumnSpec], keys: &KeyPolicy) -> Result<StreamSchema, PartitionError> {
    if columns.is_empty() {
        return Err(PartitionError::NonConformant {
            reason: "table has no columns".to_string(),
        });
    }

    let (identity, ordering) = match keys {
        KeyPolicy::NameHeuristic => {
            let ordering = find_ordering_heuristic(columns).ok_or_else(|| {
                PartitionError::NonConformant {
                    reason: "no column name contains 'time' or 'date'".to_string(),
                }
            })?;
            let identity = find_identity_heuristic(columns, ordering).ok_or_else(|| {
                PartitionError::NonConformant {
                    reason: "no identity column (key, id, register, name)".to_string(),
                }
            })?;
            (identity, ordering)
        }
        KeyPolicy::Explicit { identity, ordering } => {
            let ordering_idx = find_named(columns, ordering)?;
            let identity_idx = find_named(columns, identity)?;
            if identity_idx == ordering_idx {
                return Err(PartitionError::NonConformant {
                    reason: format!("identity and ordering both resolve to '{}'", identity),
                });
            }
            (identity_idx, ordering_idx)
        }
    };

    let columns = columns
        .iter()
        .map(|c| StreamColumn {
            name: c.name.clone(),
            declared_type: c.declared_type.clone(),
            sink_type: map_declared_type(&c.declared_type),
        })
        .collect();

    Ok(StreamSchema {
        columns,
        identity,
        ordering,
        time_zone: TimeZoneMode::default(),
    })
}

fn resolve_fixed(
    columns: &[ColumnSpec],
    fixed: &[FixedColumn],
    identity: usize,
    ordering: usize,
) -> Result<StreamSchema, PartitionError> {
    let mut resolved = Vec::with_capacity(fixed.len());
    for column in fixed {
        find_named(columns, column.name)?;
        resolved.push(StreamColumn {
            name: column.name.to_string(),
            declared_type: column.declared_type.to_string(),
            sink_type: column.sink_type,
        });
    }

    Ok(StreamSchema {
        columns: resolved,
        identity,
        ordering,
        time_zone: TimeZoneMode::default(),
    })
}

fn find_named(columns: &[ColumnSpec], wanted: &str) -> Result<usize, PartitionError> {
    columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| PartitionError::NonConformant {
            reason: format!("column '{}' not found", wanted),
        })
}

fn find_ordering_heuristic(columns: &[ColumnSpec]) -> Option<usize> {
    columns.iter().position(|c| {
        let lower = c.name.to_lowercase();
        ORDERING_HINTS.iter().any(|hint| lower.contains(hint))
    })
}

fn find_identity_heuristic(columns: &[ColumnSpec], ordering: usize) -> Option<usize> {
    columns.iter().enumerate().position(|(idx, c)| {
        if idx == ordering {
            return false;
        }
        let lower = c.name.to_lowercase();
        IDENTITY_NAMES.contains(&lower.as_str())
            || IDENTITY_HINTS.iter().any(|hint| lower.contains(hint))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(defs: &[(&str, &str)]) -> Vec<ColumnSpec> {
        defs.iter()
            .map(|(name, ty)| ColumnSpec {
                name: name.to_string(),
                declared_type: ty.to_string(),
            })
            .collect()
    }

    fn generic() -> ReplicationProfile {
        ReplicationProfile::Generic {
            keys: KeyPolicy::NameHeuristic,
        }
    }

    #[test]
    fn test_heuristic_picks_first_matches() {
        let columns = cols(&[
            ("register", "TEXT"),
            ("timestamp", "REAL"),
            ("value", "REAL"),
            ("update_date", "TEXT"),
        ]);
        let schema = generic().resolve_schema(&columns).unwrap();

        assert_eq!(schema.identity_column(), "register");
        assert_eq!(schema.ordering_column(), "timestamp");
        assert_eq!(schema.columns.len(), 4);
        assert_eq!(schema.columns[1].sink_type, SinkType::Double);
    }

    #[test]
    fn test_heuristic_matches_key_fragments_case_insensitively() {
        let columns = cols(&[("SensorKey", "TEXT"), ("EventTime", "INTEGER")]);
        let schema = generic().resolve_schema(&columns).unwrap();

        assert_eq!(schema.key_columns(), ["SensorKey".to_string(), "EventTime".to_string()]);
    }

    #[test]
    fn test_heuristic_does_not_reuse_ordering_column_as_identity() {
        // "date_key" matches both rules; it is taken as ordering and the
        // identity falls through to "id".
        let columns = cols(&[("date_key", "TEXT"), ("id", "INTEGER")]);
        let schema = generic().resolve_schema(&columns).unwrap();

        assert_eq!(schema.ordering_column(), "date_key");
        assert_eq!(schema.identity_column(), "id");
    }

    #[test]
    fn test_heuristic_rejects_partition_without_ordering() {
        let columns = cols(&[("id", "INTEGER"), ("value", "REAL")]);
        let err = generic().resolve_schema(&columns).unwrap_err();
        assert!(matches!(err, PartitionError::NonConformant { .. }));
    }

    #[test]
    fn test_heuristic_rejects_partition_without_identity() {
        let columns = cols(&[("timestamp", "REAL"), ("value", "REAL")]);
        assert!(generic().resolve_schema(&columns).is_err());
    }

    #[test]
    fn test_explicit_policy() {
        let profile = ReplicationProfile::Generic {
            keys: KeyPolicy::Explicit {
                identity: "device".to_string(),
                ordering: "seen_at".to_string(),
            },
        };
        let columns = cols(&[("Device", "TEXT"), ("reading", "REAL"), ("SEEN_AT", "TEXT")]);
        let schema = profile.resolve_schema(&columns).unwrap();

        assert_eq!(schema.identity, 0);
        assert_eq!(schema.ordering, 2);

        let missing = cols(&[("device", "TEXT"), ("reading", "REAL")]);
        assert!(profile.resolve_schema(&missing).is_err());
    }

    #[test]
    fn test_explicit_policy_rejects_same_column() {
        let profile = ReplicationProfile::Generic {
            keys: KeyPolicy::Explicit {
                identity: "ts".to_string(),
                ordering: "TS".to_string(),
            },
        };
        assert!(profile.resolve_schema(&cols(&[("ts", "TEXT")])).is_err());
    }

    #[test]
    fn test_telemetry_profile_projects_fixed_columns() {
        let columns = cols(&[
            ("extra", "TEXT"),
            ("value", "REAL"),
            ("type", "TEXT"),
            ("timestamp", "REAL"),
            ("key", "TEXT"),
        ]);
        let schema = ReplicationProfile::Telemetry.resolve_schema(&columns).unwrap();

        assert_eq!(schema.column_names(), vec!["key", "timestamp", "type", "value"]);
        assert_eq!(schema.identity_column(), "key");
        assert_eq!(schema.ordering_column(), "timestamp");

        let partial = cols(&[("key", "TEXT"), ("timestamp", "REAL")]);
        assert!(ReplicationProfile::Telemetry.resolve_schema(&partial).is_err());
    }

    #[test]
    fn test_price_bars_profile_keys() {
        let columns = cols(&[
            ("start_date", "TEXT"),
            ("end_date", "TEXT"),
            ("price", "REAL"),
            ("volume", "REAL"),
        ]);
        let schema = ReplicationProfile::PriceBars.resolve_schema(&columns).unwrap();

        assert_eq!(schema.identity_column(), "end_date");
        assert_eq!(schema.ordering_column(), "start_date");
        assert_eq!(schema.columns[2].sink_type, SinkType::Real);
        assert!(schema.is_key_index(0));
        assert!(!schema.is_key_index(3));
    }
}
