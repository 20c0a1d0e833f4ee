//! Scanner module for discovering the intake directory tree.
//!
//! Walks the intake root once at startup (and every newly created subtree
//! afterwards) to find directories that need a watch, and optionally intake
//! files that were already waiting before the pipeline came up.

use crate::classify::IntakeRules;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Recursively lists every directory under `root`, `root` included.
///
/// Directories are returned in walk order, parents before children.
/// Unreadable entries below the root are logged and skipped; only a root
/// that cannot be read at all is an error.
pub fn discover_directories(root: &Path) -> io::Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(root)?;
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut dirs = Vec::new();
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => dirs.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "skipping unreadable entry during discovery"),
        }
    }

    Ok(dirs)
}

/// Lists intake files already present under `root`.
///
/// A file qualifies under the same rules the event classifier applies to
/// creation events: not a placeholder, and carrying the intake extension.
pub fn discover_intake_files(root: &Path, rules: &IntakeRules) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !rules.is_placeholder(path) && rules.has_intake_extension(path))
        .collect()
}
