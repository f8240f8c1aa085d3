// ABOUTME: Durable storage for the replication watermark
// ABOUTME: JSON file replaced atomically via temp file, fsync and rename

use crate::error::CheckpointError;
use crate::timestamp::{format_watermark, parse_watermark};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// On-disk shape of the checkpoint file.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    /// Older deployments wrote the camel-cased key
    #[serde(alias = "lastSuccessFullTime")]
    last_successful_time: String,
}

/// Reads and writes the single watermark value.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted watermark.
    ///
    /// The store never substitutes a default; the caller decides how to
    /// recover from [`CheckpointError::Missing`] or [`CheckpointError::Corrupt`].
    pub fn load(&self) -> Result<NaiveDateTime, CheckpointError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let file: CheckpointFile =
            serde_json::from_str(&contents).map_err(|e| CheckpointError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        parse_watermark(&file.last_successful_time).map_err(|e| CheckpointError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the persisted watermark.
    ///
    /// Writes a temp file next to the target, syncs it, then renames it over
    /// the target. A crash leaves either the old or the new value.
    pub fn save(&self, watermark: NaiveDateTime) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let contents = serde_json::to_string_pretty(&CheckpointFile {
            last_successful_time: format_watermark(&watermark),
        })
        .context("Failed to serialize checkpoint")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(contents.as_bytes())
            .context("Failed to write checkpoint temp file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync checkpoint temp file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace checkpoint {}", self.path.display()))?;

        Ok(())
    }
}
