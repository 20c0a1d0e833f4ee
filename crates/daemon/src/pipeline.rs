//! Pipeline startup, stage wiring and shutdown for media-relay
//!
//! One task per stage (registrar, classifier, intake mover, completion
//! matcher, finalizer), connected by bounded queues:
//!
//! ```text
//! watch events -> classifier -> intake mover -> matcher -> finalizer
//!                     |
//!                     +-> registrar (watch / prune)
//! ```

use crate::category::KeywordCategorizer;
use crate::classify::{classify_event, IntakeRules, Route};
use crate::config::{Config, ConfigError};
use crate::finalize::{Finalizer, FinalizerSettings};
use crate::intake::{IntakeMover, IntakeSettings};
use crate::matcher::{CompletionMatcher, MatcherSettings};
use crate::registrar::{
    NotifyBackend, Registrar, RegistrarCommand, RegistrarError, WatchBackend, WatchEvent,
};
use crate::relocate::MovePolicy;
use crate::scan::discover_intake_files;
use crate::startup::{check_required_paths, PipelinePaths, StartupError};
use crate::stats::{PipelineStats, SharedStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// The intake tree could not be watched
    #[error("Watch setup failed: {0}")]
    Registrar(#[from] RegistrarError),

    /// The platform watcher could not be created
    #[error("Filesystem watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

/// Everything the stages need, with durations resolved.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub paths: PipelinePaths,
    pub rules: IntakeRules,
    pub intake_move: MovePolicy,
    pub finalize_move: MovePolicy,
    pub poll_interval: Duration,
    pub active_ttl: Option<Duration>,
    pub tv_keywords: Vec<String>,
    pub movie_keywords: Vec<String>,
    pub queue_capacity: usize,
    pub sweep_on_startup: bool,
}

impl PipelineSettings {
    /// Validates the configured paths and converts the rest of the config.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let paths = check_required_paths(&config.paths)?;
        let backoff = Duration::from_secs(config.intake.retry_backoff_secs);
        let active_ttl = match config.matcher.active_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            paths,
            rules: IntakeRules::new(&config.intake.extension, &config.intake.placeholder_prefix),
            intake_move: MovePolicy::new(Duration::from_secs(config.intake.move_timeout_secs), backoff),
            finalize_move: MovePolicy::new(
                Duration::from_secs(config.finalize.move_timeout_secs),
                backoff,
            ),
            poll_interval: Duration::from_secs(config.matcher.poll_interval_secs.max(1)),
            active_ttl,
            tv_keywords: config.finalize.tv_keywords.clone(),
            movie_keywords: config.finalize.movie_keywords.clone(),
            queue_capacity: config.pipeline.queue_capacity.max(1),
            sweep_on_startup: config.intake.sweep_on_startup,
        })
    }
}

/// A running pipeline.
pub struct Pipeline {
    stats: SharedStats,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Starts the pipeline on the platform watcher.
    pub fn start_with_notify(settings: PipelineSettings) -> Result<Self, PipelineError> {
        let (events_tx, events_rx) = mpsc::channel(settings.queue_capacity);
        let backend = NotifyBackend::new(events_tx)?;
        Self::start(settings, backend, events_rx)
    }

    /// Starts every stage.
    ///
    /// `events` must carry the events of `backend`'s registrations. The
    /// intake root is discovered and registered before any stage runs;
    /// failing to watch it is the only fatal error.
    pub fn start<B: WatchBackend>(
        settings: PipelineSettings,
        backend: B,
        events: mpsc::Receiver<WatchEvent>,
    ) -> Result<Self, PipelineError> {
        let paths = settings.paths.clone();

        let mut registrar = Registrar::new(backend);
        let watched = registrar.bootstrap(&paths.intake_root)?;
        info!(
            intake_root = %paths.intake_root.display(),
            drop_off = %paths.drop_off.display(),
            completed = %paths.completed.display(),
            media_root = %paths.media_root.display(),
            directories = watched,
            "pipeline starting"
        );

        let stats: SharedStats = Arc::new(RwLock::new(PipelineStats {
            directories_watched: registrar.watched().len(),
            ..PipelineStats::default()
        }));
        let cancel = CancellationToken::new();
        let capacity = settings.queue_capacity;

        let (registrar_tx, registrar_rx) = mpsc::unbounded_channel();
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        let (active_tx, active_rx) = mpsc::channel(capacity);
        let (finalize_tx, finalize_rx) = mpsc::channel(1);

        let mut tasks = Vec::new();

        tasks.push((
            "registrar",
            tokio::spawn(registrar.run(registrar_rx, stats.clone(), cancel.child_token())),
        ));

        if settings.sweep_on_startup {
            tasks.push((
                "sweep",
                tokio::spawn(sweep_existing(
                    paths.intake_root.clone(),
                    settings.rules.clone(),
                    intake_tx.clone(),
                    cancel.child_token(),
                )),
            ));
        }

        tasks.push((
            "classifier",
            tokio::spawn(run_classifier(
                events,
                settings.rules.clone(),
                registrar_tx,
                intake_tx,
                cancel.child_token(),
            )),
        ));

        let mover = IntakeMover::new(
            IntakeSettings {
                drop_off: paths.drop_off.clone(),
                move_policy: settings.intake_move,
            },
            active_tx,
            stats.clone(),
        );
        tasks.push(("intake", tokio::spawn(mover.run(intake_rx, cancel.child_token()))));

        let matcher = CompletionMatcher::new(MatcherSettings {
            completed_dir: paths.completed.clone(),
            poll_interval: settings.poll_interval,
            active_ttl: settings.active_ttl,
        });
        tasks.push((
            "matcher",
            tokio::spawn(matcher.run(active_rx, finalize_tx, stats.clone(), cancel.child_token())),
        ));

        let finalizer = Finalizer::new(
            FinalizerSettings {
                intake_root: paths.intake_root.clone(),
                completed_dir: paths.completed.clone(),
                media_root: paths.media_root.clone(),
                move_policy: settings.finalize_move,
            },
            Arc::new(KeywordCategorizer::new(&settings.tv_keywords, &settings.movie_keywords)),
        );
        tasks.push((
            "finalizer",
            tokio::spawn(finalizer.run(finalize_rx, stats.clone(), cancel.child_token())),
        ));

        Ok(Self {
            stats,
            cancel,
            tasks,
        })
    }

    /// Get the shared stats
    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Signals every stage to stop, waits for them, and returns the final
    /// counters. In-flight moves are interrupted rather than run to their
    /// timeout.
    pub async fn shutdown(self) -> PipelineStats {
        info!("pipeline shutting down");
        self.cancel.cancel();
        for (stage, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!(stage, error = %e, "stage panicked");
            }
        }
        let snapshot = self.stats.read().await.clone();
        info!("pipeline stopped");
        snapshot
    }
}

/// Routes watch events until cancelled or the event stream ends.
async fn run_classifier(
    mut events: mpsc::Receiver<WatchEvent>,
    rules: IntakeRules,
    registrar: mpsc::UnboundedSender<RegistrarCommand>,
    intake: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) {
    info!("classifier starting up");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    warn!("watch event stream closed");
                    break;
                }
            },
        };

        match classify_event(&event, &rules).await {
            Route::WatchDirectory(dir) => {
                debug!(path = %dir.display(), "new directory");
                if registrar.send(RegistrarCommand::Watch(dir)).is_err() {
                    break;
                }
            }
            Route::Prune(path) => {
                if registrar.send(RegistrarCommand::Prune(path)).is_err() {
                    break;
                }
            }
            Route::Intake(file) => {
                info!(path = %file.display(), "new request file");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = intake.send(file) => if sent.is_err() { break },
                }
            }
            Route::Discard(reason) => {
                debug!(path = %event.path.display(), %reason, "ignoring event");
            }
        }
    }
    info!("classifier stopped");
}

/// Feeds request files already sitting in the intake tree to the mover.
async fn sweep_existing(
    root: PathBuf,
    rules: IntakeRules,
    intake: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) {
    let found = match tokio::task::spawn_blocking(move || discover_intake_files(&root, &rules)).await {
        Ok(found) => found,
        Err(e) => {
            error!(error = %e, "startup sweep failed");
            return;
        }
    };
    info!(count = found.len(), "sweeping existing request files");

    for file in found {
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = intake.send(file) => if sent.is_err() { return },
        }
    }
}
