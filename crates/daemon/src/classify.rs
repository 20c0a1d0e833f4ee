//! Classifier module for routing filesystem watch events.
//!
//! Every creation event is either discarded, fed back to the registrar as a
//! new directory to watch, or handed to the intake mover as a request file.
//! Removal events are forwarded so the registrar can prune its watched set.

use crate::registrar::{WatchEvent, WatchEventKind};
use std::path::{Path, PathBuf};

/// Where a watch event should go next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Newly created directory that needs a watch.
    WatchDirectory(PathBuf),
    /// Request file for the intake mover.
    Intake(PathBuf),
    /// Path that disappeared; prune it if it was a watched directory.
    Prune(PathBuf),
    /// Nothing to do.
    Discard(DiscardReason),
}

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Freshly created "New ..." item that has not been renamed yet.
    Placeholder,
    /// The path vanished (or became unreadable) before it could be stat'ed.
    StatFailed,
    /// A regular file without the intake extension.
    NotIntake,
    /// Event kind the pipeline does not act on.
    IgnoredKind,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::Placeholder => write!(f, "placeholder"),
            DiscardReason::StatFailed => write!(f, "stat_failed"),
            DiscardReason::NotIntake => write!(f, "not_intake"),
            DiscardReason::IgnoredKind => write!(f, "ignored_kind"),
        }
    }
}

/// Name-based filters applied to created paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeRules {
    /// Lowercased extension including the leading dot, e.g. `.torrent`.
    extension: String,
    /// Lowercased placeholder prefix, e.g. `new `.
    placeholder_prefix: String,
}

impl IntakeRules {
    /// Builds rules from a configured extension (with or without the leading
    /// dot) and placeholder prefix. Both are compared case-insensitively.
    pub fn new(extension: &str, placeholder_prefix: &str) -> Self {
        let extension = extension.trim_start_matches('.').to_lowercase();
        Self {
            extension: format!(".{}", extension),
            placeholder_prefix: placeholder_prefix.to_lowercase(),
        }
    }

    /// The normalized intake extension, leading dot included.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// True when the base name starts with the placeholder prefix and does
    /// not carry the intake extension.
    ///
    /// The prefix carries its trailing separator, so `New Folder` matches
    /// while `Newfoundland.avi` does not. Request files are never
    /// placeholders: `New Movie (2020).torrent` is a real request.
    pub fn is_placeholder(&self, path: &Path) -> bool {
        if self.placeholder_prefix.is_empty() || self.has_intake_extension(path) {
            return false;
        }
        path.file_name()
            .map(|name| {
                name.to_string_lossy()
                    .to_lowercase()
                    .starts_with(&self.placeholder_prefix)
            })
            .unwrap_or(false)
    }

    /// Checks if a path carries the intake extension (case-insensitive).
    pub fn has_intake_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()) == self.extension)
            .unwrap_or(false)
    }
}

/// Classifies a single watch event.
///
/// Placeholders are rejected on name alone, before the path is stat'ed.
/// A failed stat is an expected race with deletion and simply discards the
/// event.
pub async fn classify_event(event: &WatchEvent, rules: &IntakeRules) -> Route {
    match event.kind {
        WatchEventKind::Created => {}
        WatchEventKind::Removed => return Route::Prune(event.path.clone()),
        WatchEventKind::Other => return Route::Discard(DiscardReason::IgnoredKind),
    }

    if rules.is_placeholder(&event.path) {
        return Route::Discard(DiscardReason::Placeholder);
    }

    let metadata = match tokio::fs::metadata(&event.path).await {
        Ok(metadata) => metadata,
        Err(_) => return Route::Discard(DiscardReason::StatFailed),
    };

    if metadata.is_dir() {
        Route::WatchDirectory(event.path.clone())
    } else if rules.has_intake_extension(&event.path) {
        Route::Intake(event.path.clone())
    } else {
        Route::Discard(DiscardReason::NotIntake)
    }
}
