use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backup::upload::UploadFailure;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Flush failed: {0}")]
    Flush(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("Failed to read {}: {source}", .path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Table {keyspace}.{table} has no snapshot directory at {}", .expected.display())]
    MissingSnapshotDir {
        keyspace: String,
        table: String,
        expected: PathBuf,
    },

    #[error("{} of {total} file uploads failed: {}", .failures.len(), summarize_failures(.failures))]
    Upload {
        failures: Vec<UploadFailure>,
        total: usize,
    },

    #[error("Upload stage timed out after {}s", .0.as_secs())]
    UploadTimedOut(Duration),

    #[error("Failed to persist metadata to {key}: {cause}")]
    MetadataPersist { key: String, cause: String },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

fn summarize_failures(failures: &[UploadFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.local_path.display(), f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, BackupError>;
