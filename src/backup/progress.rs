//! Byte-level progress of a single file upload.
//!
//! Multipart uploads report completed parts from several tasks at once, so
//! the byte counter sits behind a mutex owned by the file's progress object.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

#[derive(Debug)]
pub struct UploadProgress {
    path: PathBuf,
    total_bytes: u64,
    transferred: Mutex<u64>,
}

impl UploadProgress {
    pub fn new(path: impl Into<PathBuf>, total_bytes: u64) -> Self {
        Self {
            path: path.into(),
            total_bytes,
            transferred: Mutex::new(0),
        }
    }

    /// Adds `bytes` to the counter and returns the new total.
    pub fn record(&self, bytes: u64) -> u64 {
        let mut transferred = self.transferred.lock().unwrap_or_else(|e| e.into_inner());
        *transferred += bytes;
        info!(
            "{}  {} / {} ({:.2}%)",
            self.path.display(),
            format_bytes(*transferred),
            format_bytes(self.total_bytes),
            percent(*transferred, self.total_bytes)
        );
        *transferred
    }

    pub fn transferred(&self) -> u64 {
        *self.transferred.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64) * 100.0
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_accumulates() {
        let progress = UploadProgress::new("/tmp/sstable", 100);
        assert_eq!(progress.record(40), 40);
        assert_eq!(progress.record(60), 100);
        assert_eq!(progress.transferred(), 100);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let progress = Arc::new(UploadProgress::new("/tmp/sstable", 8 * 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = Arc::clone(&progress);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        progress.record(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(progress.transferred(), 8000);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_percent_of_empty_file() {
        assert_eq!(percent(0, 0), 100.0);
        assert!((percent(1, 4) - 25.0).abs() < 0.01);
    }
}
