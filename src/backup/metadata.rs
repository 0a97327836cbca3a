// snapshottool/src/backup/metadata.rs
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::engine::SnapshotKind;
use crate::errors::Result;

/// Object name of the metadata document, stored next to the keyspace folders.
pub const METADATA_FILE_NAME: &str = "backup_metadata.json";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Success,
}

/// Record persisted as `backup_metadata.json`.
///
/// Starts out `pending`; the only transition is [`BackupRecord::mark_success`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    snapshot_type: SnapshotKind,
    snapshot_date: String,
    node: String,
    keyspaces: BTreeMap<String, Vec<String>>,
    status: BackupStatus,
    #[serde(skip)]
    bucket: String,
}

impl BackupRecord {
    pub fn new(
        node: impl Into<String>,
        snapshot_type: SnapshotKind,
        date: NaiveDate,
        bucket: impl Into<String>,
        keyspaces: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            snapshot_type,
            snapshot_date: date.format(DATE_FORMAT).to_string(),
            node: node.into(),
            keyspaces,
            status: BackupStatus::Pending,
            bucket: bucket.into(),
        }
    }

    pub fn mark_success(&mut self) {
        self.status = BackupStatus::Success;
    }

    pub fn status(&self) -> BackupStatus {
        self.status
    }

    pub fn snapshot_type(&self) -> SnapshotKind {
        self.snapshot_type
    }

    #[cfg(test)]
    pub fn snapshot_date(&self) -> &str {
        &self.snapshot_date
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn keyspaces(&self) -> &BTreeMap<String, Vec<String>> {
        &self.keyspaces
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `<date>/<node>/<type>`, the folder every object of this run lives in.
    pub fn remote_base(&self) -> String {
        format!("{}/{}/{}", self.snapshot_date, self.node, self.snapshot_type)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    #[cfg(test)]
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
