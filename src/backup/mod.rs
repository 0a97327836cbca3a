pub(crate) mod logic; // Stage sequencing and failure handling
pub(crate) mod metadata;
pub(crate) mod progress;
pub(crate) mod s3_upload; // Object store trait and its S3 implementation
pub(crate) mod upload; // Bounded-concurrency upload of the inventory

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::CatalogFilter;
use crate::config::BackupConfig;
use crate::engine::SnapshotSource;
use crate::engine::nodetool::NodetoolControl;
use crate::notify::LogNotifier;
use logic::{BackupOrchestrator, BackupSummary};
use s3_upload::{S3ObjectStore, TransferOptions};
use upload::UploadSettings;

/// Public entry point for the backup process.
/// Builds the engine, storage and notification collaborators from the
/// configuration and runs one backup to completion.
pub async fn run_backup_flow(backup_config: &BackupConfig) -> Result<BackupSummary> {
    let engine = NodetoolControl::new(&backup_config.bin_dir)
        .context("Failed to locate the nodetool command")?;
    let source = SnapshotSource::new(
        Box::new(engine),
        backup_config.node.clone(),
        backup_config.data_dir.clone(),
    );

    let store = S3ObjectStore::connect(&backup_config.s3, backup_config.upload.max_attempts).await;

    let settings = UploadSettings {
        workers: backup_config.upload.workers,
        transfer: TransferOptions {
            chunk_size: backup_config.upload.chunk_size,
            part_concurrency: backup_config.upload.part_concurrency,
            storage_class: backup_config.upload.storage_class.clone(),
        },
        timeout: backup_config.upload.timeout_secs.map(Duration::from_secs),
        report_progress: backup_config.upload.report_progress,
    };

    let mut orchestrator = BackupOrchestrator::new(
        source,
        Arc::new(store),
        Box::new(LogNotifier),
        CatalogFilter::default().restricted_to(backup_config.keyspaces.as_deref()),
        settings,
        backup_config.snapshot_kind,
        backup_config.s3.bucket_name.clone(),
        Local::now().date_naive(),
    );

    let summary = orchestrator.run().await?;
    Ok(summary)
}
