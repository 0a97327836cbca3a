pub mod logger;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use which::which;

const NODETOOL_COMMAND: &str = "nodetool";

/// Finds the nodetool executable, preferring the configured bin directory over PATH.
pub fn find_nodetool_executable(bin_dir: &Path) -> Result<PathBuf> {
    let candidate = bin_dir.join(NODETOOL_COMMAND);
    if candidate.is_file() {
        return Ok(candidate);
    }
    which(NODETOOL_COMMAND).with_context(|| {
        format!(
            "nodetool executable not found in {} or in PATH. Please ensure the database tools are installed.",
            bin_dir.display()
        )
    })
}
