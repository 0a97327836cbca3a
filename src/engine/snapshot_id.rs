// Extraction of the snapshot id from `nodetool snapshot` output.
//
// Newer nodetool versions print the id on a labelled line; older ones only
// put it inside brackets on the request line. The positional rule is kept as
// a last resort for outputs matching neither.
use std::sync::LazyLock;

use regex::Regex;

static SNAPSHOT_DIRECTORY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Snapshot directory:\s*(\S+)").ok());

static SNAPSHOT_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"snapshot name \[([^\]\s]+)\]").ok());

pub fn extract_snapshot_id(stdout_lines: &[String]) -> Option<String> {
    let patterns = [SNAPSHOT_DIRECTORY.as_ref(), SNAPSHOT_NAME.as_ref()];
    for pattern in patterns.into_iter().flatten() {
        let found = stdout_lines
            .iter()
            .find_map(|line| pattern.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        if found.is_some() {
            return found;
        }
    }
    positional_snapshot_id(stdout_lines)
}

/// Third space-separated token of the second line.
fn positional_snapshot_id(stdout_lines: &[String]) -> Option<String> {
    stdout_lines
        .get(1)?
        .split(' ')
        .nth(2)
        .map(|token| token.trim_end().to_string())
        .filter(|token| !token.is_empty())
}
