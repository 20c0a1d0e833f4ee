//! Pipeline counters.
//!
//! A single snapshot shared across stages, serializable to JSON for the
//! shutdown report.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters describing what the pipeline has done since startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    /// Directories currently registered with the watch backend
    pub directories_watched: usize,
    /// Request files relocated into the drop-off directory
    pub intake_moved: u64,
    /// Request files that could not be relocated before the timeout
    pub intake_failed: u64,
    /// Active files matched to a completed artifact
    pub matched: u64,
    /// Active files evicted without ever matching
    pub abandoned: u64,
    /// Completed artifacts moved into the media library
    pub finalized: u64,
    /// Finalize requests that were dropped
    pub finalize_failed: u64,
}

impl PipelineStats {
    /// Serializes the snapshot as a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Shared stats state for concurrent access across pipeline stages
pub type SharedStats = Arc<RwLock<PipelineStats>>;

/// Create a new shared stats instance
pub fn new_shared_stats() -> SharedStats {
    Arc::new(RwLock::new(PipelineStats::default()))
}
