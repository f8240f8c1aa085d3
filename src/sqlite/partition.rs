// ABOUTME: Maps calendar days to partition files and back
// ABOUTME: Enumerates the existing daily partitions for a date range

use anyhow::{bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

pub const DEFAULT_PARTITION_PATTERN: &str = "%Y_%m_%d.db";

/// A daily partition that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// Directory plus file-name pattern that addresses one file per day.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    dir: PathBuf,
    pattern: String,
}

impl PartitionLayout {
    /// Create a layout, rejecting patterns that cannot address days uniquely.
    ///
    /// The pattern must be a plain file name whose formatting parses back to
    /// the same date, which rules out patterns missing the year, month or day.
    pub fn new(dir: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            bail!("Partition pattern must not be empty");
        }
        if pattern.contains('/') || pattern.contains('\\') {
            bail!("Partition pattern '{}' must be a file name, not a path", pattern);
        }
        if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
            bail!("Partition pattern '{}' is not a valid date format", pattern);
        }

        let probes = [
            NaiveDate::from_ymd_opt(1999, 11, 3),
            NaiveDate::from_ymd_opt(2024, 2, 29),
            NaiveDate::from_ymd_opt(2031, 12, 31),
        ];
        for probe in probes.into_iter().flatten() {
            let name = probe.format(pattern).to_string();
            let parsed = NaiveDate::parse_from_str(&name, pattern).with_context(|| {
                format!(
                    "Partition pattern '{}' does not encode a full date (year, month and day)",
                    pattern
                )
            })?;
            if parsed != probe {
                bail!(
                    "Partition pattern '{}' maps {} to '{}', which reads back as {}",
                    pattern,
                    probe,
                    name,
                    parsed
                );
            }
        }

        Ok(Self {
            dir: dir.into(),
            pattern: pattern.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn file_name(&self, date: NaiveDate) -> String {
        date.format(&self.pattern).to_string()
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(self.file_name(date))
    }

    /// Inverse of [`file_name`](Self::file_name); `None` for foreign files.
    pub fn parse_file_name(&self, name: &str) -> Option<NaiveDate> {
        let date = NaiveDate::parse_from_str(name, &self.pattern).ok()?;
        (self.file_name(date) == name).then_some(date)
    }

    /// Existing partitions for every day in `[from, to]`, ascending.
    ///
    /// Days without a file are skipped. An inverted range yields nothing.
    pub fn locate(&self, from: NaiveDate, to: NaiveDate) -> Vec<Partition> {
        if from > to {
            return Vec::new();
        }

        from.iter_days()
            .take_while(|day| *day <= to)
            .filter_map(|date| {
                let path = self.path_for(date);
                if path.is_file() {
                    Some(Partition { date, path })
                } else {
                    tracing::debug!("No partition for {} at {}", date, path.display());
                    None
                }
            })
            .collect()
    }

    /// Every partition file in the directory, ascending by date.
    pub fn list_existing(&self) -> Result<Vec<Partition>> {
        let entries = std::fs::read_dir(&self.dir).with_context(|| {
            format!("Failed to read partition directory {}", self.dir.display())
        })?;

        let mut partitions = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("Failed to read entry in {}", self.dir.display())
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(date) = self.parse_file_name(name) {
                partitions.push(Partition { date, path });
            }
        }

        partitions.sort_by_key(|p| p.date);
        Ok(partitions)
    }
}
