//! Control surface of the local data engine.
//!
//! `SnapshotSource` turns the raw command results of an [`EngineControl`]
//! into typed outcomes: a flush either succeeds or fails the run, a full
//! snapshot yields a [`SnapshotHandle`] carrying the engine-assigned id.

pub(crate) mod nodetool;
pub(crate) mod snapshot_id;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{BackupError, Result};

/// Directory (relative to a table directory) holding incremental backups.
pub const INCREMENTAL_DIR: &str = "backups";
/// Directory (relative to a table directory) holding tagged snapshots.
pub const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Full,
    Incremental,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Full => "full",
            SnapshotKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SnapshotKind::Full),
            "incremental" => Ok(SnapshotKind::Incremental),
            other => Err(BackupError::Config(format!(
                "snapshot type must be 'full' or 'incremental', got '{}'",
                other
            ))),
        }
    }
}

/// Identity of the on-disk files a run backs up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub node: String,
    pub kind: SnapshotKind,
    pub snapshot_id: Option<String>,
    pub data_directory: PathBuf,
}

impl SnapshotHandle {
    /// Path of the snapshot files relative to a table directory.
    pub fn table_suffix(&self) -> PathBuf {
        match (&self.kind, &self.snapshot_id) {
            (SnapshotKind::Full, Some(id)) => Path::new(SNAPSHOTS_DIR).join(id),
            _ => PathBuf::from(INCREMENTAL_DIR),
        }
    }
}

/// Captured result of one engine command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    fn describe_failure(&self) -> String {
        let status = self
            .status_code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        if self.stderr.trim().is_empty() {
            status
        } else {
            format!("{}: {}", status, self.stderr.trim())
        }
    }
}

/// Commands the backup needs from the data engine.
///
/// An `Err` means the command could not be run at all; a command that ran
/// and failed is reported through [`CommandOutput::status_code`].
pub trait EngineControl: Send + Sync {
    fn flush(&self) -> AnyResult<CommandOutput>;
    fn create_snapshot(&self) -> AnyResult<CommandOutput>;
    fn clear_snapshot(&self, snapshot_id: &str) -> AnyResult<CommandOutput>;
}

pub struct SnapshotSource {
    engine: Box<dyn EngineControl>,
    node: String,
    data_directory: PathBuf,
}

impl SnapshotSource {
    pub fn new(engine: Box<dyn EngineControl>, node: impl Into<String>, data_directory: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            node: node.into(),
            data_directory: data_directory.into(),
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Flushes memtables to disk. Must succeed before any file discovery.
    pub fn flush(&self) -> Result<()> {
        info!("Flushing memtables on node {}", self.node);
        let output = self
            .engine
            .flush()
            .map_err(|e| BackupError::Flush(format!("{:#}", e)))?;
        if !output.success() {
            return Err(BackupError::Flush(output.describe_failure()));
        }
        info!("Memtables flushed to disk");
        Ok(())
    }

    pub fn snapshot(&self, kind: SnapshotKind) -> Result<SnapshotHandle> {
        let snapshot_id = match kind {
            SnapshotKind::Incremental => {
                info!("Incremental backup selected, using the '{}' directories", INCREMENTAL_DIR);
                None
            }
            SnapshotKind::Full => {
                info!("Requesting snapshot on node {}", self.node);
                let output = self
                    .engine
                    .create_snapshot()
                    .map_err(|e| BackupError::Snapshot(format!("{:#}", e)))?;
                if !output.success() {
                    return Err(BackupError::Snapshot(output.describe_failure()));
                }
                let id = snapshot_id::extract_snapshot_id(&output.stdout_lines).ok_or_else(|| {
                    BackupError::Snapshot(format!(
                        "could not find a snapshot id in the command output: {:?}",
                        output.stdout_lines
                    ))
                })?;
                info!("Snapshot created with id {}", id);
                Some(id)
            }
        };

        Ok(SnapshotHandle {
            node: self.node.clone(),
            kind,
            snapshot_id,
            data_directory: self.data_directory.clone(),
        })
    }

    /// Removes the on-disk snapshot. Incremental handles have nothing to clear.
    pub fn clear(&self, handle: &SnapshotHandle) -> Result<()> {
        let id = match (&handle.kind, &handle.snapshot_id) {
            (SnapshotKind::Full, Some(id)) => id,
            _ => return Ok(()),
        };
        let output = self
            .engine
            .clear_snapshot(id)
            .map_err(|e| BackupError::Snapshot(format!("{:#}", e)))?;
        if !output.success() {
            return Err(BackupError::Snapshot(format!(
                "failed to clear snapshot {}: {}",
                id,
                output.describe_failure()
            )));
        }
        info!("Snapshot {} cleared from disk", id);
        Ok(())
    }
}
