//! Cassandra Snapshot Backup Tool
//!
//! Flushes the local node, snapshots it and ships the snapshot files to object storage

// snapshottool/src/main.rs
mod backup;
mod catalog;
mod config;
mod engine;
mod errors;
mod notify;
mod utils;

use anyhow::{Context, Result};
use config::{RawJsonConfig, load_backup_config_from_json};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

const CONFIG_PATH_ENV: &str = "SNAPSHOTTOOL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();

    // Expects config.json in the working directory unless SNAPSHOTTOOL_CONFIG points elsewhere.
    let config_path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let raw_config = RawJsonConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    utils::logger::init(raw_config.log_level())?;

    // Optional first argument: snapshot type ("full" or "incremental").
    let snapshot_type = env::args().nth(1).map(|arg| arg.trim().to_string());
    let backup_config = load_backup_config_from_json(&raw_config, snapshot_type.as_deref())
        .context("Failed to load backup configuration from JSON")?;

    println!(
        "🚀 Starting {} backup of node {}...",
        backup_config.snapshot_kind, backup_config.node
    );
    let summary = backup::run_backup_flow(&backup_config)
        .await
        .context("Backup process failed")?;

    info!(
        "Uploaded {} files from {} keyspaces to {}/{}",
        summary.files_uploaded, summary.keyspaces, backup_config.s3.bucket_name, summary.remote_base
    );
    Ok(())
}
