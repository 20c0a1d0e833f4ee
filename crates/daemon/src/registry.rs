//! Registry of requests handed to the external consumer but not yet completed.
//!
//! The registry is plain owned data. The completion matcher task holds the
//! only instance; the intake mover hands entries over through a queue, so no
//! stage ever reads or writes the map concurrently with another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// A request awaiting its completed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFile {
    /// File name of the request as it sits in the drop-off directory
    pub base_name: String,
    /// Where the request originally appeared under the intake root
    pub origin_path: PathBuf,
    /// When the request was handed off
    pub registered_at: Instant,
}

impl ActiveFile {
    pub fn new(base_name: impl Into<String>, origin_path: impl Into<PathBuf>) -> Self {
        Self {
            base_name: base_name.into(),
            origin_path: origin_path.into(),
            registered_at: Instant::now(),
        }
    }
}

/// Active files keyed by base name. A later insert for the same name wins.
#[derive(Debug, Default)]
pub struct ActiveFileRegistry {
    entries: HashMap<String, ActiveFile>,
}

impl ActiveFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, returning the one it replaced.
    pub fn insert(&mut self, file: ActiveFile) -> Option<ActiveFile> {
        self.entries.insert(file.base_name.clone(), file)
    }

    pub fn remove(&mut self, base_name: &str) -> Option<ActiveFile> {
        self.entries.remove(base_name)
    }

    pub fn get(&self, base_name: &str) -> Option<&ActiveFile> {
        self.entries.get(base_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Base names in lexicographic order.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes and returns every entry registered more than `ttl` before `now`.
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> Vec<ActiveFile> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|file| now.saturating_duration_since(file.registered_at) > ttl)
            .map(|file| file.base_name.clone())
            .collect();

        let mut evicted: Vec<ActiveFile> = expired
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .collect();
        evicted.sort_by(|a, b| a.base_name.cmp(&b.base_name));
        evicted
    }
}
