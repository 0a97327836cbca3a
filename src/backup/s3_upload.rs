// snapshottool/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::progress::UploadProgress;
use crate::config::S3Config;

/// S3 refuses multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Per-file transfer settings handed to the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Files larger than this go through multipart upload, in parts of this size.
    pub chunk_size: u64,
    /// Parts of one file uploaded at the same time.
    pub part_concurrency: usize,
    pub storage_class: String,
}

/// Object storage operations the backup relies on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads one local file to `remote_key`.
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_key: &str,
        options: &TransferOptions,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<()>;

    /// Writes a small in-memory object, replacing any previous version.
    async fn put_object(&self, body: Vec<u8>, remote_key: &str) -> Result<()>;

    /// Waits for cleanup started by uploads that were cancelled mid-transfer.
    async fn wait_for_cleanup(&self) {}
}

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Aborts an unfinished multipart upload.
///
/// Dropping the guard while armed (for example when the upload task is
/// cancelled) hands the abort to `tracker`, so already stored parts are
/// released even though the upload future never resumes.
pub(crate) struct MultipartCleanup {
    abort: Option<CleanupFuture>,
    tracker: TaskTracker,
}

impl MultipartCleanup {
    pub fn new(tracker: TaskTracker, abort: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            abort: Some(Box::pin(abort)),
            tracker,
        }
    }

    /// The upload completed; nothing left to clean up.
    pub fn disarm(mut self) {
        self.abort = None;
    }

    pub async fn abort_now(mut self) {
        if let Some(abort) = self.abort.take() {
            abort.await;
        }
    }
}

impl Drop for MultipartCleanup {
    fn drop(&mut self) {
        let Some(abort) = self.abort.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                self.tracker.spawn_on(abort, &handle);
            }
            Err(_) => warn!("No runtime available, multipart upload left unfinished"),
        }
    }
}

/// [`ObjectStore`] backed by an S3-compatible service.
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
    cleanup: TaskTracker,
}

impl S3ObjectStore {
    pub async fn connect(s3_config: &S3Config, max_attempts: u32) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(s3_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &s3_config.access_key_id,
                &s3_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .retry_config(aws_config::retry::RetryConfig::standard().with_max_attempts(max_attempts));
        if let Some(endpoint) = &s3_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // Custom endpoints (MinIO, Spaces, Ceph) generally expect path-style addressing.
        let client_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(s3_config.endpoint_url.is_some())
            .build();

        Self {
            client: s3::Client::from_conf(client_config),
            bucket: s3_config.bucket_name.clone(),
            folder_prefix: s3_config.folder_prefix.clone(),
            cleanup: TaskTracker::new(),
        }
    }

    fn object_key(&self, remote_key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), remote_key),
            None => remote_key.to_string(),
        }
    }

    async fn upload_single(
        &self,
        local_path: &Path,
        key: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", local_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::from(options.storage_class.as_str()))
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to upload file {} to S3 bucket {} with key {}",
                    local_path.display(),
                    self.bucket,
                    key
                )
            })?;
        Ok(())
    }

    async fn upload_multipart(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        options: &TransferOptions,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<()> {
        let part_count = size.div_ceil(options.chunk_size);
        if part_count > MAX_PARTS {
            anyhow::bail!(
                "{} needs {} parts of {} bytes, more than the {} S3 allows; raise the chunk size",
                local_path.display(),
                part_count,
                options.chunk_size,
                MAX_PARTS
            );
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::from(options.storage_class.as_str()))
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload for key {}", key))?;
        let upload_id = created
            .upload_id()
            .context("S3 did not return a multipart upload id")?
            .to_string();

        let cleanup = MultipartCleanup::new(self.cleanup.clone(), {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            async move {
                match client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    Ok(_) => info!("Aborted multipart upload {} for {}", upload_id, key),
                    Err(e) => warn!("Failed to abort multipart upload {} for {}: {}", upload_id, key, e),
                }
            }
        });

        let parts = match self
            .upload_parts(local_path, key, &upload_id, size, options, progress)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                cleanup.abort_now().await;
                return Err(e);
            }
        };

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload for key {}", key));
        match completed {
            Ok(_) => {
                cleanup.disarm();
                Ok(())
            }
            Err(e) => {
                cleanup.abort_now().await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
        options: &TransferOptions,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<Vec<CompletedPart>> {
        let semaphore = Arc::new(Semaphore::new(options.part_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        let mut offset = 0u64;
        let mut part_number = 1i32;
        while offset < size {
            let length = options.chunk_size.min(size - offset);
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("Part upload semaphore closed")?;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let path: PathBuf = local_path.to_path_buf();
            let progress = progress.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let body = ByteStream::read_from()
                    .path(&path)
                    .offset(offset)
                    .length(Length::Exact(length))
                    .build()
                    .await
                    .with_context(|| format!("Failed to read part {} of {}", part_number, path.display()))?;

                let output = client
                    .upload_part()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .with_context(|| format!("Failed to upload part {} of key {}", part_number, key))?;

                if let Some(progress) = &progress {
                    progress.record(length);
                }

                Ok::<_, anyhow::Error>(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                )
            });

            offset += length;
            part_number += 1;
        }

        let mut parts = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            parts.push(joined.context("Part upload task failed to complete")??);
        }
        parts.sort_by_key(|part| part.part_number());
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_key: &str,
        options: &TransferOptions,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<()> {
        let key = self.object_key(remote_key);
        let size = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("Failed to stat {}", local_path.display()))?
            .len();
        debug!("Uploading {} ({} bytes) to {}", local_path.display(), size, key);

        if size <= options.chunk_size {
            self.upload_single(local_path, &key, options).await?;
            if let Some(progress) = &progress {
                progress.record(size);
            }
        } else {
            self.upload_multipart(local_path, &key, size, options, progress)
                .await?;
        }
        Ok(())
    }

    async fn put_object(&self, body: Vec<u8>, remote_key: &str) -> Result<()> {
        let key = self.object_key(remote_key);
        info!("Saving object to S3, remote path - {}", key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("Failed to put object {} in bucket {}", key, self.bucket))?;
        Ok(())
    }

    async fn wait_for_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory store recording every call in a shared event log.
    ///
    /// Uploads whose key ends with one of `failing` return an error; every
    /// upload sleeps for `delay` so concurrent calls overlap. With
    /// `multipart` set, each upload holds a [`MultipartCleanup`] that logs
    /// `abort <key>` if the upload never finishes.
    pub(crate) struct FakeStore {
        pub events: Arc<Mutex<Vec<String>>>,
        pub objects: Mutex<Vec<(String, Vec<u8>)>>,
        pub failing: HashSet<String>,
        pub delay: Duration,
        pub fail_puts: bool,
        /// Rejects only metadata documents carrying this status.
        pub fail_status: Option<&'static str>,
        pub multipart: bool,
        cleanup: TaskTracker,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeStore {
        pub fn new(events: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                events,
                objects: Mutex::new(Vec::new()),
                failing: HashSet::new(),
                delay: Duration::from_millis(5),
                fail_puts: false,
                fail_status: None,
                multipart: false,
                cleanup: TaskTracker::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn failing_on(mut self, file_name: &str) -> Self {
            self.failing.insert(file_name.to_string());
            self
        }

        pub fn uploaded_keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| e.strip_prefix("upload ").map(str::to_string))
                .collect();
            keys.sort();
            keys
        }

        pub fn last_object(&self, key: &str) -> Option<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, body)| body.clone())
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn upload_file(
            &self,
            local_path: &Path,
            remote_key: &str,
            _options: &TransferOptions,
            progress: Option<Arc<UploadProgress>>,
        ) -> Result<()> {
            let cleanup = self.multipart.then(|| {
                let events = Arc::clone(&self.events);
                let key = remote_key.to_string();
                MultipartCleanup::new(self.cleanup.clone(), async move {
                    events.lock().unwrap().push(format!("abort {}", key));
                })
            });

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(cleanup) = cleanup {
                cleanup.disarm();
            }

            if self.failing.iter().any(|name| remote_key.ends_with(name.as_str())) {
                anyhow::bail!("connection reset while uploading {}", local_path.display());
            }
            if let Some(progress) = progress {
                progress.record(1);
            }
            self.events.lock().unwrap().push(format!("upload {}", remote_key));
            Ok(())
        }

        async fn put_object(&self, body: Vec<u8>, remote_key: &str) -> Result<()> {
            if self.fail_puts {
                anyhow::bail!("access denied for {}", remote_key);
            }
            let status = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_default();
            if self.fail_status == Some(status.as_str()) {
                anyhow::bail!("access denied for {}", remote_key);
            }
            self.events
                .lock()
                .unwrap()
                .push(format!("put {} {}", remote_key, status));
            self.objects.lock().unwrap().push((remote_key.to_string(), body));
            Ok(())
        }

        async fn wait_for_cleanup(&self) {
            self.cleanup.close();
            self.cleanup.wait().await;
            self.cleanup.reopen();
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Future<Output = ()> + Send + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        (events, async move { log.lock().unwrap().push("abort".to_string()) })
    }

    #[tokio::test]
    async fn test_dropped_cleanup_aborts_upload() {
        let tracker = TaskTracker::new();
        let (events, abort) = recorder();

        drop(MultipartCleanup::new(tracker.clone(), abort));
        tracker.close();
        tracker.wait().await;

        assert_eq!(*events.lock().unwrap(), vec!["abort"]);
    }

    #[tokio::test]
    async fn test_disarmed_cleanup_does_nothing() {
        let tracker = TaskTracker::new();
        let (events, abort) = recorder();

        MultipartCleanup::new(tracker.clone(), abort).disarm();
        tracker.close();
        tracker.wait().await;

        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_upload_task_aborts_upload() {
        let tracker = TaskTracker::new();
        let (events, abort) = recorder();
        let cleanup = MultipartCleanup::new(tracker.clone(), abort);

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cleanup.disarm();
        });
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tracker.close();
        tracker.wait().await;

        assert_eq!(*events.lock().unwrap(), vec!["abort"]);
    }
}
