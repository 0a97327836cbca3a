// snapshottool/src/backup/logic.rs
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::metadata::{BackupRecord, METADATA_FILE_NAME};
use super::s3_upload::ObjectStore;
use super::upload::{UploadCoordinator, UploadSettings};
use crate::catalog::{self, CatalogFilter};
use crate::engine::{SnapshotKind, SnapshotSource};
use crate::errors::{BackupError, Result};
use crate::notify::{Notifier, Severity};

/// Stages of one backup run, in execution order.
///
/// `Failed` can follow any stage before `Done`; nothing runs after it, so a
/// failure at or after `Uploading` leaves the local snapshot in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Idle,
    Flushing,
    Snapshotting,
    Cataloging,
    PersistingPending,
    Uploading,
    PersistingSuccess,
    ClearingSnapshot,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub remote_base: String,
    pub files_uploaded: usize,
    pub keyspaces: usize,
}

pub struct BackupOrchestrator {
    source: SnapshotSource,
    store: Arc<dyn ObjectStore>,
    notifier: Box<dyn Notifier>,
    filter: CatalogFilter,
    settings: UploadSettings,
    kind: SnapshotKind,
    bucket: String,
    date: NaiveDate,
    stage: BackupStage,
}

impl BackupOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: SnapshotSource,
        store: Arc<dyn ObjectStore>,
        notifier: Box<dyn Notifier>,
        filter: CatalogFilter,
        settings: UploadSettings,
        kind: SnapshotKind,
        bucket: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            filter,
            settings,
            kind,
            bucket: bucket.into(),
            date,
            stage: BackupStage::Idle,
        }
    }

    #[cfg(test)]
    pub fn stage(&self) -> BackupStage {
        self.stage
    }

    /// Runs every stage in order, stopping at the first failure.
    pub async fn run(&mut self) -> Result<BackupSummary> {
        self.notifier.send(
            "Backup started",
            &format!("{} backup to bucket {}", self.kind, self.bucket),
            Severity::Normal,
        );

        match self.execute().await {
            Ok(summary) => {
                self.advance(BackupStage::Done);
                self.notifier.send(
                    "Backup finished",
                    &format!(
                        "{} files from {} keyspaces uploaded to {}/{}",
                        summary.files_uploaded, summary.keyspaces, self.bucket, summary.remote_base
                    ),
                    Severity::Success,
                );
                Ok(summary)
            }
            Err(e) => {
                let failed_in = self.stage;
                self.stage = BackupStage::Failed;
                error!("Backup failed during {:?}: {}", failed_in, e);
                self.notifier.send(
                    "Backup failed",
                    &format!("stage {:?}: {}", failed_in, e),
                    Severity::Failure,
                );
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> Result<BackupSummary> {
        self.advance(BackupStage::Flushing);
        self.source.flush()?;

        self.advance(BackupStage::Snapshotting);
        let handle = self.source.snapshot(self.kind)?;

        self.advance(BackupStage::Cataloging);
        let inventory = catalog::build_inventory(self.source.data_directory(), &handle, &self.filter)?;
        info!("Cataloged {} files for upload", inventory.file_count());
        if !inventory.skipped_directories().is_empty() {
            warn!(
                "{} directories inside snapshots are not part of this backup",
                inventory.skipped_directories().len()
            );
        }

        let mut record = BackupRecord::new(
            handle.node.clone(),
            self.kind,
            self.date,
            self.bucket.clone(),
            inventory.keyspace_map(),
        );
        let remote_base = record.remote_base();
        let metadata_key = format!("{}/{}", remote_base, METADATA_FILE_NAME);

        self.advance(BackupStage::PersistingPending);
        self.persist(&record, &metadata_key).await?;

        self.advance(BackupStage::Uploading);
        let files_uploaded = UploadCoordinator::new(Arc::clone(&self.store), &self.settings)
            .run(&inventory, &remote_base)
            .await?;

        self.advance(BackupStage::PersistingSuccess);
        record.mark_success();
        self.persist(&record, &metadata_key).await?;

        self.advance(BackupStage::ClearingSnapshot);
        self.source.clear(&handle)?;

        Ok(BackupSummary {
            remote_base,
            files_uploaded,
            keyspaces: record.keyspaces().len(),
        })
    }

    async fn persist(&self, record: &BackupRecord, key: &str) -> Result<()> {
        let body = record.to_json()?;
        self.store
            .put_object(body, key)
            .await
            .map_err(|e| BackupError::MetadataPersist {
                key: key.to_string(),
                cause: format!("{:#}", e),
            })?;
        info!(
            "Metadata for {} {} backup saved to {}/{} with status {:?}",
            record.node(),
            record.snapshot_type(),
            record.bucket(),
            key,
            record.status()
        );
        Ok(())
    }

    fn advance(&mut self, next: BackupStage) {
        info!("Backup stage {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }
}
