//! Intake mover: relocates request files into the drop-off directory.
//!
//! Each request file gets its own task so a file still being written (and
//! therefore failing to rename) never holds up the ones behind it. A moved
//! request is handed to the completion matcher as an [`ActiveFile`].

use crate::registry::ActiveFile;
use crate::relocate::{move_with_timeout, MoveError, MovePolicy};
use crate::stats::SharedStats;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors from moving a single request file.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{} has no file name", .path.display())]
    NoFileName { path: PathBuf },

    #[error("{} has a file name that is not valid UTF-8", .path.display())]
    NonUtf8Name { path: PathBuf },

    #[error(transparent)]
    Move(#[from] MoveError),
}

/// Settings for the intake mover.
#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub drop_off: PathBuf,
    pub move_policy: MovePolicy,
}

/// Moves one request file into the drop-off directory under its base name.
///
/// The base name is the last component as split by [`Path::file_name`], so
/// the platform's separators are honored. Names that are not valid UTF-8
/// are rejected before anything moves: the active entry is keyed and
/// matched by its name as text.
///
/// On success returns the entry to register as active. The source stays in
/// place when the move times out; it is not retried later.
pub async fn consume(
    file: &Path,
    settings: &IntakeSettings,
    cancel: &CancellationToken,
) -> Result<ActiveFile, IntakeError> {
    let name = file.file_name().ok_or_else(|| IntakeError::NoFileName {
        path: file.to_path_buf(),
    })?;
    let base_name = name
        .to_str()
        .ok_or_else(|| IntakeError::NonUtf8Name {
            path: file.to_path_buf(),
        })?
        .to_string();

    let target = settings.drop_off.join(name);
    let attempts = move_with_timeout(file, &target, settings.move_policy, cancel).await?;
    debug!(path = %file.display(), attempts, "intake move succeeded");

    Ok(ActiveFile::new(base_name, file))
}

/// Dispatcher that spawns one [`consume`] task per request file.
pub struct IntakeMover {
    settings: Arc<IntakeSettings>,
    active: mpsc::Sender<ActiveFile>,
    stats: SharedStats,
    tasks: JoinSet<()>,
}

impl IntakeMover {
    pub fn new(settings: IntakeSettings, active: mpsc::Sender<ActiveFile>, stats: SharedStats) -> Self {
        Self {
            settings: Arc::new(settings),
            active,
            stats,
            tasks: JoinSet::new(),
        }
    }

    /// Number of moves still in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Starts moving `file` in its own task.
    pub fn spawn(&mut self, file: PathBuf, cancel: CancellationToken) {
        let settings = self.settings.clone();
        let active = self.active.clone();
        let stats = self.stats.clone();

        self.tasks.spawn(async move {
            match consume(&file, &settings, &cancel).await {
                Ok(entry) => {
                    info!(path = %file.display(), drop_off = %settings.drop_off.display(), "moved to drop-off");
                    stats.write().await.intake_moved += 1;
                    let name = entry.base_name.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            warn!(active = %name, "shutdown before request became active");
                        }
                        sent = active.send(entry) => {
                            if sent.is_err() {
                                warn!(active = %name, "completion matcher is gone; request not tracked");
                            }
                        }
                    }
                }
                Err(IntakeError::Move(MoveError::Cancelled { .. })) => {
                    info!(path = %file.display(), "intake move interrupted by shutdown");
                }
                Err(e) => {
                    error!(path = %file.display(), error = %e, "failed to move request to drop-off");
                    stats.write().await.intake_failed += 1;
                }
            }
        });
    }

    /// Dispatches request files until cancelled or the queue closes, then
    /// waits for in-flight moves to finish.
    pub async fn run(mut self, mut files: mpsc::Receiver<PathBuf>, cancel: CancellationToken) {
        info!("intake mover starting up");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "intake task panicked");
                    }
                }
                file = files.recv() => match file {
                    Some(file) => self.spawn(file, cancel.child_token()),
                    None => break,
                },
            }
        }

        debug!(in_flight = self.in_flight(), "waiting for intake moves");
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "intake task panicked");
            }
        }
        info!("intake mover stopped");
    }
}
