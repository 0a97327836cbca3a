//! Bounded-concurrency upload of every file in a [`FileInventory`].
//!
//! Every task runs to completion before the result is decided: a failed file
//! never short-circuits the rest, so the returned failure set is exact.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::progress::UploadProgress;
use super::s3_upload::{ObjectStore, TransferOptions};
use crate::catalog::FileInventory;
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local_path: PathBuf,
    pub remote_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub cause: String,
}

impl UploadFailure {
    fn new(task: &UploadTask, cause: String) -> Self {
        Self {
            local_path: task.local_path.clone(),
            remote_key: task.remote_key.clone(),
            cause,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Files uploading at the same time.
    pub workers: usize,
    pub transfer: TransferOptions,
    /// Upper bound for the whole upload stage.
    pub timeout: Option<Duration>,
    pub report_progress: bool,
}

/// `<remote_base>/<keyspace>/<table>/<file name>` for every inventoried file.
pub fn plan_uploads(inventory: &FileInventory, remote_base: &str) -> Vec<UploadTask> {
    inventory
        .files()
        .map(|(keyspace, table, path)| {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            UploadTask {
                local_path: path.to_path_buf(),
                remote_key: format!("{}/{}/{}/{}", remote_base, keyspace, table, file_name),
            }
        })
        .collect()
}

pub struct UploadCoordinator<'a> {
    store: Arc<dyn ObjectStore>,
    settings: &'a UploadSettings,
}

impl<'a> UploadCoordinator<'a> {
    pub fn new(store: Arc<dyn ObjectStore>, settings: &'a UploadSettings) -> Self {
        Self { store, settings }
    }

    /// Uploads the whole inventory and returns the number of files sent.
    pub async fn run(&self, inventory: &FileInventory, remote_base: &str) -> Result<usize> {
        let tasks = plan_uploads(inventory, remote_base);
        let total = tasks.len();
        info!(
            "Starting upload of {} files with {} workers",
            total, self.settings.workers
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut handles: Vec<(UploadTask, JoinHandle<std::result::Result<(), String>>)> =
            Vec::with_capacity(total);
        for task in tasks {
            let handle = tokio::spawn(upload_one(
                Arc::clone(&self.store),
                Arc::clone(&semaphore),
                task.clone(),
                self.settings.transfer.clone(),
                self.settings.report_progress,
            ));
            handles.push((task, handle));
        }

        // Handles before this index have already been joined.
        let mut settled = 0;
        let barrier = async {
            let mut failures = Vec::new();
            for (task, handle) in handles.iter_mut() {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(cause)) => failures.push(UploadFailure::new(task, cause)),
                    Err(join_err) => {
                        failures.push(UploadFailure::new(task, format!("upload task did not finish: {}", join_err)))
                    }
                }
                settled += 1;
            }
            failures
        };

        let outcome = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, barrier).await.ok(),
            None => Some(barrier.await),
        };

        let Some(failures) = outcome else {
            let outstanding = &mut handles[settled..];
            for (_, handle) in outstanding.iter() {
                handle.abort();
            }
            for (_, handle) in outstanding.iter_mut() {
                let _ = handle.await;
            }
            self.store.wait_for_cleanup().await;
            let limit = self.settings.timeout.unwrap_or_default();
            warn!(
                "Upload stage exceeded {}s, {} outstanding uploads cancelled",
                limit.as_secs(),
                outstanding.len()
            );
            return Err(BackupError::UploadTimedOut(limit));
        };

        if failures.is_empty() {
            info!("Uploaded all {} files", total);
            Ok(total)
        } else {
            Err(BackupError::Upload { failures, total })
        }
    }
}

async fn upload_one(
    store: Arc<dyn ObjectStore>,
    semaphore: Arc<Semaphore>,
    task: UploadTask,
    transfer: TransferOptions,
    report_progress: bool,
) -> std::result::Result<(), String> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| format!("upload slot unavailable: {}", e))?;

    let progress = if report_progress {
        let size = tokio::fs::metadata(&task.local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Some(Arc::new(UploadProgress::new(&task.local_path, size)))
    } else {
        None
    };

    debug!("Uploading {} to {}", task.local_path.display(), task.remote_key);
    match store
        .upload_file(&task.local_path, &task.remote_key, &transfer, progress.clone())
        .await
    {
        Ok(()) => {
            if let Some(progress) = progress {
                debug!("Sent {} bytes of {}", progress.transferred(), task.local_path.display());
            }
            Ok(())
        }
        Err(e) => {
            warn!("Failed to upload {}: {:#}", task.local_path.display(), e);
            Err(format!("{:#}", e))
        }
    }
}
