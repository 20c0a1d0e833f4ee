//! Startup checks module for media-relay
//!
//! Verifies the four directories the pipeline bridges before any stage starts:
//! - every path must be configured
//! - every path must be an existing directory

use crate::config::PathsConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("Required path `{name}` is not configured")]
    MissingPath { name: &'static str },

    #[error("Required path `{name}` ({}) is not an existing directory", .path.display())]
    NotADirectory { name: &'static str, path: PathBuf },
}

/// The validated directories the pipeline runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    pub intake_root: PathBuf,
    pub drop_off: PathBuf,
    pub completed: PathBuf,
    pub media_root: PathBuf,
}

fn require(name: &'static str, path: &Option<PathBuf>) -> Result<PathBuf, StartupError> {
    path.clone().ok_or(StartupError::MissingPath { name })
}

/// Check that a configured path is an existing directory
pub fn check_directory(name: &'static str, path: &Path) -> Result<(), StartupError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(StartupError::NotADirectory {
            name,
            path: path.to_path_buf(),
        })
    }
}

/// Resolve the configured paths without touching the filesystem.
///
/// Paths are reported in pipeline order: intake root, drop-off, completed,
/// media root.
pub fn resolve_paths(paths: &PathsConfig) -> Result<PipelinePaths, StartupError> {
    Ok(PipelinePaths {
        intake_root: require("intake_root", &paths.intake_root)?,
        drop_off: require("drop_off", &paths.drop_off)?,
        completed: require("completed", &paths.completed)?,
        media_root: require("media_root", &paths.media_root)?,
    })
}

/// Run all startup checks in order
///
/// Returns the validated paths on success.
pub fn check_required_paths(paths: &PathsConfig) -> Result<PipelinePaths, StartupError> {
    let resolved = resolve_paths(paths)?;
    check_directory("intake_root", &resolved.intake_root)?;
    check_directory("drop_off", &resolved.drop_off)?;
    check_directory("completed", &resolved.completed)?;
    check_directory("media_root", &resolved.media_root)?;
    Ok(resolved)
}
