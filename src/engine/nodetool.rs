// snapshottool/src/engine/nodetool.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{CommandOutput, EngineControl};
use crate::utils::find_nodetool_executable;

const FLUSH_ARG: &str = "flush";
const SNAPSHOT_ARG: &str = "snapshot";
const CLEAR_SNAPSHOT_ARG: &str = "clearsnapshot";

/// Drives the data engine through its `nodetool` binary.
pub struct NodetoolControl {
    nodetool: PathBuf,
}

impl NodetoolControl {
    pub fn new(bin_dir: &Path) -> Result<Self> {
        let nodetool = find_nodetool_executable(bin_dir)?;
        debug!("Using nodetool at {}", nodetool.display());
        Ok(Self { nodetool })
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!("Running {} {}", self.nodetool.display(), args.join(" "));
        let output = Command::new(&self.nodetool)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {} {}", self.nodetool.display(), args.join(" ")))?;

        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout_lines: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl EngineControl for NodetoolControl {
    fn flush(&self) -> Result<CommandOutput> {
        self.run(&[FLUSH_ARG])
    }

    fn create_snapshot(&self) -> Result<CommandOutput> {
        self.run(&[SNAPSHOT_ARG])
    }

    fn clear_snapshot(&self, snapshot_id: &str) -> Result<CommandOutput> {
        self.run(&[CLEAR_SNAPSHOT_ARG, "-t", snapshot_id])
    }
}
