//! Discovery of snapshot files on disk.
//!
//! The data directory is laid out as `<keyspace>/<table>/`, with the files of
//! a run living in `snapshots/<id>` (full) or `backups` (incremental) below
//! each table directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::engine::SnapshotHandle;
use crate::errors::{BackupError, Result};

const EXCLUDED_KEYSPACES: &[&str] = &["system_traces"];
const EXCLUDED_SYSTEM_TABLES: &[&str] = &[
    "schema_triggers",
    "compaction_history",
    "hints",
    "paxos",
    "peer_events",
    "range_xfers",
    "batchlog",
];

/// Keyspaces and tables left out of the inventory.
#[derive(Debug, Clone)]
pub struct CatalogFilter {
    excluded_keyspaces: BTreeSet<String>,
    excluded_tables: BTreeMap<String, BTreeSet<String>>,
    only_keyspaces: Option<BTreeSet<String>>,
}

impl Default for CatalogFilter {
    fn default() -> Self {
        let mut excluded_tables = BTreeMap::new();
        excluded_tables.insert(
            "system".to_string(),
            EXCLUDED_SYSTEM_TABLES.iter().map(|t| t.to_string()).collect(),
        );
        Self {
            excluded_keyspaces: EXCLUDED_KEYSPACES.iter().map(|k| k.to_string()).collect(),
            excluded_tables,
            only_keyspaces: None,
        }
    }
}

impl CatalogFilter {
    /// Restricts the catalog to the given keyspaces. Exclusions still apply.
    pub fn restricted_to(mut self, keyspaces: Option<&[String]>) -> Self {
        self.only_keyspaces = keyspaces.map(|ks| ks.iter().cloned().collect());
        self
    }

    pub fn keeps_keyspace(&self, keyspace: &str) -> bool {
        if self.excluded_keyspaces.contains(keyspace) {
            return false;
        }
        self.only_keyspaces
            .as_ref()
            .is_none_or(|only| only.contains(keyspace))
    }

    pub fn keeps_table(&self, keyspace: &str, table: &str) -> bool {
        !self
            .excluded_tables
            .get(keyspace)
            .is_some_and(|tables| tables.contains(table))
    }
}

/// keyspace -> table -> files of the current snapshot, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInventory {
    keyspaces: BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>,
    /// Directories found inside snapshot directories; their contents are not uploaded.
    skipped: Vec<PathBuf>,
}

impl FileInventory {
    /// keyspace -> table names, as recorded in the backup metadata.
    pub fn keyspace_map(&self) -> BTreeMap<String, Vec<String>> {
        self.keyspaces
            .iter()
            .map(|(keyspace, tables)| (keyspace.clone(), tables.keys().cloned().collect()))
            .collect()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str, &Path)> {
        self.keyspaces.iter().flat_map(|(keyspace, tables)| {
            tables.iter().flat_map(move |(table, files)| {
                files
                    .iter()
                    .map(move |file| (keyspace.as_str(), table.as_str(), file.as_path()))
            })
        })
    }

    pub fn skipped_directories(&self) -> &[PathBuf] {
        &self.skipped
    }

    pub fn file_count(&self) -> usize {
        self.keyspaces
            .values()
            .flat_map(|tables| tables.values())
            .map(Vec::len)
            .sum()
    }
}

/// Walks `data_directory` and collects the files belonging to `handle`.
///
/// Any unreadable directory aborts the walk, and so does a table without the
/// expected snapshot sub-directory: a partial inventory is never returned.
pub fn build_inventory(
    data_directory: &Path,
    handle: &SnapshotHandle,
    filter: &CatalogFilter,
) -> Result<FileInventory> {
    info!(
        "Generating data directory structure from path - {}",
        data_directory.display()
    );
    let suffix = handle.table_suffix();
    let mut keyspaces = BTreeMap::new();
    let mut skipped = Vec::new();

    for keyspace_entry in list_directory(data_directory)? {
        let keyspace = entry_name(&keyspace_entry);
        if !keyspace_entry.file_type().is_dir() || !filter.keeps_keyspace(&keyspace) {
            debug!("Skipping keyspace entry {}", keyspace);
            continue;
        }

        let mut tables = BTreeMap::new();
        for table_entry in list_directory(keyspace_entry.path())? {
            let table = entry_name(&table_entry);
            if !table_entry.file_type().is_dir() || !filter.keeps_table(&keyspace, &table) {
                debug!("Skipping table entry {}.{}", keyspace, table);
                continue;
            }

            let snapshot_dir = table_entry.path().join(&suffix);
            if !snapshot_dir.is_dir() {
                return Err(BackupError::MissingSnapshotDir {
                    keyspace,
                    table,
                    expected: snapshot_dir,
                });
            }

            let mut files = Vec::new();
            for entry in list_directory(&snapshot_dir)? {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                } else if entry.file_type().is_dir() {
                    warn!(
                        "Skipping directory {} in snapshot of {}.{}, its files are not backed up",
                        entry.path().display(),
                        keyspace,
                        table
                    );
                    skipped.push(entry.into_path());
                }
            }
            debug!("{}.{}: {} files", keyspace, table, files.len());
            tables.insert(table, files);
        }
        keyspaces.insert(keyspace, tables);
    }

    info!("Finished generating data directory structure");
    Ok(FileInventory { keyspaces, skipped })
}

fn list_directory(dir: &Path) -> Result<Vec<DirEntry>> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                BackupError::Discovery {
                    path,
                    source: e.into(),
                }
            })
        })
        .collect()
}

fn entry_name(entry: &DirEntry) -> String {
    entry.file_name().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SnapshotKind;
    use std::fs;
    use tempfile::TempDir;

    fn handle(data_dir: &Path, kind: SnapshotKind) -> SnapshotHandle {
        SnapshotHandle {
            node: "node1".to_string(),
            kind,
            snapshot_id: match kind {
                SnapshotKind::Full => Some("20240101".to_string()),
                SnapshotKind::Incremental => None,
            },
            data_directory: data_dir.to_path_buf(),
        }
    }

    fn write_files(dir: &Path, names: &[&str]) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        for name in names {
            fs::write(dir.join(name), b"data")?;
        }
        Ok(())
    }

    #[test]
    fn test_full_snapshot_inventory() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("ks1/t1/snapshots/20240101"), &["sstable_b", "sstable_a"])?;
        // Live files next to the snapshot are not part of it.
        write_files(&root.join("ks1/t1"), &["live-Data.db"])?;

        let inventory = build_inventory(root, &handle(root, SnapshotKind::Full), &CatalogFilter::default())?;

        let files: Vec<_> = inventory.files().map(|(k, t, p)| (k.to_string(), t.to_string(), p.to_path_buf())).collect();
        assert_eq!(
            files,
            vec![
                ("ks1".to_string(), "t1".to_string(), root.join("ks1/t1/snapshots/20240101/sstable_a")),
                ("ks1".to_string(), "t1".to_string(), root.join("ks1/t1/snapshots/20240101/sstable_b")),
            ]
        );
        assert_eq!(inventory.keyspace_map().get("ks1"), Some(&vec!["t1".to_string()]));
        Ok(())
    }

    #[test]
    fn test_excluded_keyspace_is_omitted() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("ks1/t1/snapshots/20240101"), &["a"])?;
        write_files(&root.join("system_traces/events/snapshots/20240101"), &["b"])?;

        let inventory = build_inventory(root, &handle(root, SnapshotKind::Full), &CatalogFilter::default())?;

        assert!(inventory.keyspace_map().contains_key("ks1"));
        assert!(!inventory.keyspace_map().contains_key("system_traces"));
        assert_eq!(inventory.file_count(), 1);
        Ok(())
    }

    #[test]
    fn test_excluded_system_tables_are_omitted() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("system/local/snapshots/20240101"), &["a"])?;
        // Excluded tables need no snapshot directory at all.
        fs::create_dir_all(root.join("system/hints"))?;
        fs::create_dir_all(root.join("system/paxos"))?;

        let inventory = build_inventory(root, &handle(root, SnapshotKind::Full), &CatalogFilter::default())?;

        assert_eq!(inventory.keyspace_map().get("system"), Some(&vec!["local".to_string()]));
        Ok(())
    }

    #[test]
    fn test_keyspace_restriction() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("ks1/t1/backups"), &["a"])?;
        write_files(&root.join("ks2/t1/backups"), &["b"])?;

        let only = vec!["ks2".to_string()];
        let filter = CatalogFilter::default().restricted_to(Some(&only));
        let inventory = build_inventory(root, &handle(root, SnapshotKind::Incremental), &filter)?;

        assert!(!inventory.keyspace_map().contains_key("ks1"));
        assert!(inventory.keyspace_map().contains_key("ks2"));
        Ok(())
    }

    #[test]
    fn test_missing_snapshot_directory_is_error() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("ks1/t1/snapshots/20240101"), &["a"])?;
        fs::create_dir_all(root.join("ks1/t2"))?;

        let result = build_inventory(root, &handle(root, SnapshotKind::Full), &CatalogFilter::default());

        match result {
            Err(BackupError::MissingSnapshotDir { keyspace, table, .. }) => {
                assert_eq!(keyspace, "ks1");
                assert_eq!(table, "t2");
            }
            other => panic!("expected missing snapshot directory, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_missing_data_directory_is_discovery_error() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let missing = data_dir.path().join("nope");

        let result = build_inventory(&missing, &handle(&missing, SnapshotKind::Full), &CatalogFilter::default());

        assert!(matches!(result, Err(BackupError::Discovery { .. })));
        Ok(())
    }

    #[test]
    fn test_nested_directories_in_snapshot_are_not_files() -> anyhow::Result<()> {
        let data_dir = TempDir::new()?;
        let root = data_dir.path();
        write_files(&root.join("ks1/t1/backups"), &["a"])?;
        fs::create_dir_all(root.join("ks1/t1/backups/.idx"))?;

        let inventory = build_inventory(root, &handle(root, SnapshotKind::Incremental), &CatalogFilter::default())?;

        assert_eq!(inventory.file_count(), 1);
        assert_eq!(inventory.skipped_directories(), &[root.join("ks1/t1/backups/.idx")]);
        Ok(())
    }
}
