//! Completion matcher: pairs in-flight requests with finished artifacts.
//!
//! On every tick the completed-output directory is listed and each active
//! request is compared against the entries by word tokens. A request matches
//! an entry when all of its tokens appear among the entry's tokens, so
//! release tags and quality suffixes on the completed side are ignored.

use crate::registry::{ActiveFile, ActiveFileRegistry};
use crate::stats::SharedStats;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lowercased alphanumeric word tokens of a name.
pub type TokenSet = BTreeSet<String>;

/// A matched request on its way to the finalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    /// Base name of the original request file
    pub original_name: String,
    /// Where the request originally appeared under the intake root
    pub origin_path: PathBuf,
    /// Name of the matching entry in the completed-output directory
    pub completed_name: String,
}

/// Splits a name into lowercase tokens on every run of non-alphanumeric
/// characters. Empty tokens are dropped.
pub fn tokenize(name: &str) -> TokenSet {
    name.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drops everything from the last `.` onwards.
pub fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Tokens of an active request: its base name without the extension.
pub fn request_tokens(base_name: &str) -> TokenSet {
    tokenize(strip_extension(base_name))
}

/// True iff every request token appears among the candidate's tokens.
pub fn tokens_match(request: &TokenSet, candidate: &TokenSet) -> bool {
    request.is_subset(candidate)
}

/// Matches active requests against completed entry names.
///
/// Active requests are visited in base-name order and completed names in
/// lexicographic order, so the first candidate that satisfies the subset
/// rule is deterministic. An entry claimed by one request is not offered to
/// another in the same pass. A request whose name yields no tokens has the
/// empty token set, which is a subset of every entry's tokens, so it takes
/// the first unclaimed entry. Matched requests are removed from the registry.
pub fn find_matches(
    registry: &mut ActiveFileRegistry,
    completed_names: &[String],
) -> Vec<FinalizeRequest> {
    let mut candidates: Vec<(&String, TokenSet)> = completed_names
        .iter()
        .map(|name| (name, tokenize(name)))
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(b.0));

    let mut claimed = vec![false; candidates.len()];
    let mut requests = Vec::new();

    for name in registry.sorted_names() {
        let tokens = request_tokens(&name);
        debug!(active = %name, tokens = ?tokens, "looking for completion");

        let found = candidates
            .iter()
            .enumerate()
            .find(|(idx, (_, candidate))| !claimed[*idx] && tokens_match(&tokens, candidate));

        if let Some((idx, (completed_name, _))) = found {
            claimed[idx] = true;
            if let Some(active) = registry.remove(&name) {
                requests.push(FinalizeRequest {
                    original_name: active.base_name,
                    origin_path: active.origin_path,
                    completed_name: (*completed_name).clone(),
                });
            }
        }
    }

    requests
}

/// Lists entry names in the completed-output directory.
pub async fn list_completed(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Settings for the completion matcher stage.
#[derive(Debug, Clone)]
pub struct MatcherSettings {
    pub completed_dir: PathBuf,
    pub poll_interval: Duration,
    /// Abandon requests unmatched for this long; `None` keeps them forever.
    pub active_ttl: Option<Duration>,
}

/// Owner of the active-file registry.
pub struct CompletionMatcher {
    settings: MatcherSettings,
    registry: ActiveFileRegistry,
}

impl CompletionMatcher {
    pub fn new(settings: MatcherSettings) -> Self {
        Self {
            settings,
            registry: ActiveFileRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ActiveFileRegistry {
        &self.registry
    }

    /// Accepts a request handed off by the intake mover.
    pub fn activate(&mut self, file: ActiveFile) {
        debug!(active = %file.base_name, origin = %file.origin_path.display(), "request is active");
        if let Some(previous) = self.registry.insert(file) {
            debug!(active = %previous.base_name, origin = %previous.origin_path.display(), "replaced earlier request with the same name");
        }
    }

    /// One poll of the completed-output directory.
    ///
    /// A listing failure skips the tick. Expired requests are evicted
    /// before matching.
    pub async fn tick(&mut self, stats: &SharedStats) -> Vec<FinalizeRequest> {
        if let Some(ttl) = self.settings.active_ttl {
            let abandoned = self.registry.evict_expired(std::time::Instant::now(), ttl);
            if !abandoned.is_empty() {
                for file in &abandoned {
                    warn!(
                        active = %file.base_name,
                        origin = %file.origin_path.display(),
                        "abandoning request that never completed"
                    );
                }
                stats.write().await.abandoned += abandoned.len() as u64;
            }
        }

        if self.registry.is_empty() {
            return Vec::new();
        }

        let completed = match list_completed(&self.settings.completed_dir).await {
            Ok(names) => names,
            Err(e) => {
                warn!(dir = %self.settings.completed_dir.display(), error = %e, "unable to read completed directory");
                return Vec::new();
            }
        };

        let requests = find_matches(&mut self.registry, &completed);
        for request in &requests {
            info!(active = %request.original_name, completed = %request.completed_name, "found completed match");
        }
        if !requests.is_empty() {
            stats.write().await.matched += requests.len() as u64;
        }
        requests
    }

    /// Runs the matcher until cancelled.
    ///
    /// Finalize requests are handed over one at a time; while the finalizer
    /// is busy the matcher waits, so a slow finalize delays the next tick.
    pub async fn run(
        mut self,
        mut active: mpsc::Receiver<ActiveFile>,
        finalize: mpsc::Sender<FinalizeRequest>,
        stats: SharedStats,
        cancel: CancellationToken,
    ) {
        info!("completion matcher starting up");
        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intake_open = true;

        'outer: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                file = active.recv(), if intake_open => match file {
                    Some(file) => self.activate(file),
                    None => intake_open = false,
                },
                _ = ticker.tick() => {
                    for request in self.tick(&stats).await {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            sent = finalize.send(request) => {
                                if sent.is_err() {
                                    warn!("finalizer is gone; stopping matcher");
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
        }
        info!(pending = self.registry.len(), "completion matcher stopped");
    }
}
