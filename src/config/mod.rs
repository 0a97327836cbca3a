// snapshottool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::SnapshotKind;

const DEFAULT_DATA_DIR: &str = "/var/lib/cassandra/data";
const DEFAULT_BIN_DIR: &str = "/bin";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
/// S3 rejects multipart parts below 5 MiB (except the last one).
const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
const DEFAULT_PART_CONCURRENCY: usize = 10;
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonCassandraConfig {
    pub data_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonUploadOptions {
    pub chunk_size: Option<u64>,
    pub part_concurrency: Option<usize>,
    pub workers: Option<usize>,
    pub storage_class: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub report_progress: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub node: Option<String>,
    pub snapshot_type: Option<String>,
    pub log_level: Option<String>,
    pub keyspaces: Option<serde_json::Value>,
    pub cassandra: Option<JsonCassandraConfig>,
    pub upload: Option<JsonUploadOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub part_concurrency: usize,
    pub workers: usize,
    pub storage_class: String,
    pub timeout_secs: Option<u64>,
    pub max_attempts: u32,
    pub report_progress: bool,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub node: String,
    pub snapshot_kind: SnapshotKind,
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub keyspaces: Option<Vec<String>>,
    pub upload: UploadConfig,
    pub s3: S3Config,
}

/// Builds the backup configuration, reading fallbacks from the process environment.
pub fn load_backup_config_from_json(
    raw_config: &RawJsonConfig,
    snapshot_type_override: Option<&str>,
) -> Result<BackupConfig> {
    resolve_backup_config(raw_config, snapshot_type_override, |key| {
        env::var(key).ok().filter(|v| !v.is_empty())
    })
}

fn resolve_backup_config(
    raw_config: &RawJsonConfig,
    snapshot_type_override: Option<&str>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<BackupConfig> {
    let node = non_empty(raw_config.node.as_ref())
        .or_else(|| env_lookup("HOSTNAME"))
        .context("node must be set in config.json or through the HOSTNAME environment variable")?;

    let snapshot_kind: SnapshotKind = snapshot_type_override
        .or(raw_config.snapshot_type.as_deref())
        .unwrap_or("full")
        .parse()?;

    let cassandra = raw_config.cassandra.clone().unwrap_or_default();

    Ok(BackupConfig {
        node,
        snapshot_kind,
        data_dir: cassandra.data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        bin_dir: cassandra.bin_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_BIN_DIR)),
        keyspaces: parse_keyspace_list(&raw_config.keyspaces)?,
        upload: resolve_upload_config(raw_config.upload.as_ref())?,
        s3: resolve_s3_config(raw_config.s3_storage.as_ref(), &env_lookup)?,
    })
}

fn resolve_upload_config(raw: Option<&JsonUploadOptions>) -> Result<UploadConfig> {
    let raw = raw.cloned().unwrap_or_default();

    let chunk_size = raw.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size < MIN_CHUNK_SIZE {
        anyhow::bail!(
            "upload.chunk_size must be at least {} bytes, got {}",
            MIN_CHUNK_SIZE,
            chunk_size
        );
    }

    let part_concurrency = at_least_one("upload.part_concurrency", raw.part_concurrency, DEFAULT_PART_CONCURRENCY)?;
    let workers = at_least_one("upload.workers", raw.workers, DEFAULT_WORKERS)?;
    let max_attempts = at_least_one("upload.max_attempts", raw.max_attempts.map(|v| v as usize), DEFAULT_MAX_ATTEMPTS as usize)? as u32;

    if raw.timeout_secs == Some(0) {
        anyhow::bail!("upload.timeout_secs must be greater than zero when set");
    }

    Ok(UploadConfig {
        chunk_size,
        part_concurrency,
        workers,
        storage_class: non_empty(raw.storage_class.as_ref()).unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
        timeout_secs: raw.timeout_secs,
        max_attempts,
        report_progress: raw.report_progress.unwrap_or(false),
    })
}

fn resolve_s3_config(
    raw: Option<&JsonS3StorageConfig>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Result<S3Config> {
    let raw = raw.cloned().unwrap_or_default();

    let bucket_name = non_empty(raw.bucket_name.as_ref())
        .context("s3_storage.bucket_name must be set in config.json")?;

    let access_key_id = non_empty(raw.access_key_id.as_ref()).or_else(|| env_lookup("AWS_ACCESS_KEY_ID"));
    let secret_access_key =
        non_empty(raw.secret_access_key.as_ref()).or_else(|| env_lookup("AWS_SECRET_ACCESS_KEY"));
    let (Some(access_key_id), Some(secret_access_key)) = (access_key_id, secret_access_key) else {
        anyhow::bail!(
            "Please specify both the AWS access key and secret key (s3_storage or AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)"
        );
    };

    let endpoint_url = non_empty(raw.endpoint_url.as_ref());
    if let Some(endpoint) = &endpoint_url {
        url::Url::parse(endpoint)
            .with_context(|| format!("Invalid s3_storage.endpoint_url: {}", endpoint))?;
    }

    Ok(S3Config {
        bucket_name,
        region: non_empty(raw.region.as_ref()).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_key_id,
        secret_access_key,
        endpoint_url,
        folder_prefix: non_empty(raw.folder_prefix.as_ref())
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty()),
    })
}

/// Parses the keyspace restriction list.
/// Accepts an array of names or a comma-separated string.
fn parse_keyspace_list(keyspaces: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    let names: Vec<String> = match keyspaces {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::String(list)) => list.split(',').map(|s| s.trim().to_string()).collect(),
        Some(value) if value.is_array() => serde_json::from_value(value.clone())
            .context("Failed to parse keyspaces as an array of names")?,
        Some(_) => {
            return Err(anyhow::anyhow!(
                "keyspaces must be either an array of keyspace names or a comma-separated string"
            ));
        }
    };

    let names: Vec<String> = names.into_iter().filter(|n| !n.is_empty()).collect();
    if names.is_empty() {
        Ok(None)
    } else {
        Ok(Some(names))
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

fn at_least_one(name: &str, value: Option<usize>, default: usize) -> Result<usize> {
    match value {
        Some(0) => Err(anyhow::anyhow!("{} must be at least 1", name)),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}
