//! Per-test log destinations

use chrono::Local;
use std::path::{Path, PathBuf};

/// Compute the log destination for a test.
///
/// Format: `{directory}/{yyyy-mm-dd_hh-mm-ss}_{test_id}.log`, so a sorted
/// directory listing reads chronologically.
pub fn test_log_path(directory: &Path, test_id: &str) -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    directory.join(format!("{stamp}_{test_id}.log"))
}

pub fn ensure_log_directory(directory: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(directory)
}
