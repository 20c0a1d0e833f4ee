//! Watch registrar: owns the filesystem watch and the set of watched directories.
//!
//! The registrar is the only writer of [`WatchedDirectorySet`]. It registers
//! the intake tree at startup, then reacts to directory creations and
//! removals routed to it by the classifier.

use crate::scan::discover_directories;
use crate::stats::SharedStats;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Kind of a path-level watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The path was created or moved into a watched directory.
    Created,
    /// The path was deleted or moved out of a watched directory.
    Removed,
    /// Writes, metadata changes, access.
    Other,
}

/// A single event delivered by the watch collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

/// The watch primitive rejected a path.
#[derive(Debug, Error)]
#[error("failed to watch {}: {source}", .path.display())]
pub struct WatchRegistrationError {
    pub path: PathBuf,
    #[source]
    pub source: notify::Error,
}

/// Errors that stop the registrar from bootstrapping.
#[derive(Debug, Error)]
pub enum RegistrarError {
    /// The intake root could not be walked.
    #[error("failed to discover intake root {}: {source}", .path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The intake root itself could not be watched.
    #[error("intake root is not watchable: {0}")]
    RootWatch(#[from] WatchRegistrationError),
}

/// Something that can watch individual directories.
///
/// Implementations deliver their events out of band (see
/// [`NotifyBackend::new`]); the registrar only manages registrations.
pub trait WatchBackend: Send + 'static {
    fn register(&mut self, path: &Path) -> Result<(), WatchRegistrationError>;
    fn unregister(&mut self, path: &Path) -> Result<(), WatchRegistrationError>;
}

/// [`WatchBackend`] over the platform watcher picked by `notify`.
pub struct NotifyBackend {
    watcher: notify::RecommendedWatcher,
}

impl NotifyBackend {
    /// Creates the platform watcher and bridges its callback thread into
    /// `events`. The bridge blocks when the queue is full so event order
    /// is preserved.
    pub fn new(events: mpsc::Sender<WatchEvent>) -> Result<Self, notify::Error> {
        let watcher = notify::RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for watch_event in translate_event(event) {
                        if events.blocking_send(watch_event).is_err() {
                            // pipeline is shutting down
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )?;
        Ok(Self { watcher })
    }
}

impl WatchBackend for NotifyBackend {
    fn register(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchRegistrationError {
                path: path.to_path_buf(),
                source,
            })
    }

    fn unregister(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
        self.watcher
            .unwatch(path)
            .map_err(|source| WatchRegistrationError {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Maps a `notify` event to path-level create/remove events.
///
/// Renames are split: the old name is a removal and the new name a
/// creation, which is how a file moved into a watched directory shows up.
pub fn translate_event(event: notify::Event) -> Vec<WatchEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Remove(_) => WatchEventKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEventKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut out = Vec::with_capacity(2);
            if let Some(from) = paths.next() {
                out.push(WatchEvent {
                    path: from,
                    kind: WatchEventKind::Removed,
                });
            }
            if let Some(to) = paths.next() {
                out.push(WatchEvent {
                    path: to,
                    kind: WatchEventKind::Created,
                });
            }
            return out;
        }
        _ => WatchEventKind::Other,
    };

    event
        .paths
        .into_iter()
        .map(|path| WatchEvent { path, kind })
        .collect()
}

/// Absolute directory paths currently registered with the watch backend.
#[derive(Debug, Default, Clone)]
pub struct WatchedDirectorySet {
    dirs: HashSet<PathBuf>,
}

impl WatchedDirectorySet {
    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    fn insert(&mut self, path: PathBuf) -> bool {
        self.dirs.insert(path)
    }

    /// Removes `path` and every member below it, returning what was removed.
    fn remove_subtree(&mut self, path: &Path) -> Vec<PathBuf> {
        let removed: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        for dir in &removed {
            self.dirs.remove(dir);
        }
        removed
    }
}

/// Requests routed to the registrar task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarCommand {
    /// A directory appeared; watch it and everything below it.
    Watch(PathBuf),
    /// A path disappeared; stop watching it if it was a directory we knew.
    Prune(PathBuf),
}

/// Owner of the watch backend and the watched-directory set.
pub struct Registrar<B: WatchBackend> {
    backend: B,
    watched: WatchedDirectorySet,
}

impl<B: WatchBackend> Registrar<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            watched: WatchedDirectorySet::default(),
        }
    }

    pub fn watched(&self) -> &WatchedDirectorySet {
        &self.watched
    }

    /// Registers a single directory.
    ///
    /// Returns `Ok(false)` without touching the backend when the path is
    /// already watched, so repeated registration never duplicates watches.
    pub fn register(&mut self, path: &Path) -> Result<bool, WatchRegistrationError> {
        if self.watched.contains(path) {
            return Ok(false);
        }
        self.backend.register(path)?;
        self.watched.insert(path.to_path_buf());
        Ok(true)
    }

    /// Stops watching a single directory.
    ///
    /// The path stays in the watched set when the backend refuses, since
    /// its watch is still live.
    pub fn unregister(&mut self, path: &Path) -> Result<bool, WatchRegistrationError> {
        if !self.watched.contains(path) {
            return Ok(false);
        }
        self.backend.unregister(path)?;
        self.watched.dirs.remove(path);
        Ok(true)
    }

    /// Walks the intake root and registers every directory in it.
    ///
    /// Failing to watch the root is fatal; any other directory that cannot
    /// be registered is logged and skipped.
    pub fn bootstrap(&mut self, root: &Path) -> Result<usize, RegistrarError> {
        let dirs = discover_directories(root).map_err(|source| RegistrarError::Discovery {
            path: root.to_path_buf(),
            source,
        })?;
        info!(root = %root.display(), directories = dirs.len(), "discovered intake tree");

        let mut added = 0;
        for dir in dirs {
            match self.register(&dir) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) if dir.as_path() == root => return Err(RegistrarError::RootWatch(e)),
                Err(e) => warn!(error = %e, "skipping directory"),
            }
        }
        Ok(added)
    }

    /// Registers a newly created directory and its whole subtree.
    pub fn register_tree(&mut self, dir: &Path) -> usize {
        let dirs = match discover_directories(dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "new directory vanished before it could be watched");
                return 0;
            }
        };

        let mut added = 0;
        for dir in dirs {
            match self.register(&dir) {
                Ok(true) => {
                    debug!(path = %dir.display(), "watching new directory");
                    added += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "skipping directory"),
            }
        }
        added
    }

    /// Drops a removed directory and its descendants from the watched set.
    ///
    /// The platform usually discards the watch itself when a directory is
    /// deleted, so backend errors here are only logged at debug level.
    pub fn prune(&mut self, path: &Path) -> usize {
        let removed = self.watched.remove_subtree(path);
        for dir in &removed {
            if let Err(e) = self.backend.unregister(dir) {
                debug!(error = %e, "unwatch after removal");
            }
        }
        if !removed.is_empty() {
            info!(path = %path.display(), count = removed.len(), "stopped watching removed directory");
        }
        removed.len()
    }

    /// Serves registrar commands until cancelled or the queue closes.
    ///
    /// The command queue is unbounded: registering a watch can wait on the
    /// backend's event thread, which may itself be waiting on the classifier.
    /// Dropping the registrar at the end closes the watch backend.
    ///
    /// Each command walks the filesystem and calls into the watch backend,
    /// both blocking, so it runs on the blocking pool with the registrar
    /// moved in and handed back.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<RegistrarCommand>,
        stats: SharedStats,
        cancel: CancellationToken,
    ) {
        info!("registrar starting up");
        let mut registrar = self;
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let applied = tokio::task::spawn_blocking(move || {
                registrar.apply(&command);
                registrar
            })
            .await;

            registrar = match applied {
                Ok(registrar) => registrar,
                Err(e) => {
                    error!(error = %e, "registrar command panicked; watches are lost");
                    return;
                }
            };

            stats.write().await.directories_watched = registrar.watched.len();
        }
        info!("registrar stopped");
    }

    /// Applies a single command synchronously.
    pub fn apply(&mut self, command: &RegistrarCommand) -> usize {
        match command {
            RegistrarCommand::Watch(dir) => self.register_tree(dir),
            RegistrarCommand::Prune(path) => self.prune(path),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Backend that records calls and rejects a configurable set of paths.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingBackend {
        pub registered: Arc<Mutex<Vec<PathBuf>>>,
        pub unregistered: Arc<Mutex<Vec<PathBuf>>>,
        pub reject: Arc<Mutex<HashSet<PathBuf>>>,
    }

    impl RecordingBackend {
        pub(crate) fn rejecting(path: &Path) -> Self {
            let backend = Self::default();
            backend.reject.lock().unwrap().insert(path.to_path_buf());
            backend
        }

        pub(crate) fn registered(&self) -> Vec<PathBuf> {
            self.registered.lock().unwrap().clone()
        }
    }

    impl WatchBackend for RecordingBackend {
        fn register(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
            if self.reject.lock().unwrap().contains(path) {
                return Err(WatchRegistrationError {
                    path: path.to_path_buf(),
                    source: notify::Error::generic("permission denied"),
                });
            }
            self.registered.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn unregister(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
            if self.reject.lock().unwrap().contains(path) {
                return Err(WatchRegistrationError {
                    path: path.to_path_buf(),
                    source: notify::Error::generic("permission denied"),
                });
            }
            self.unregistered.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingBackend;
    use super::*;
    use crate::stats::new_shared_stats;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_intake_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for dir in ["tv", "movies", "music"] {
            fs::create_dir_all(temp_dir.path().join(dir)).unwrap();
        }
        temp_dir
    }

    #[test]
    fn test_translate_create_and_remove() {
        let create = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/intake/a.torrent"));
        assert_eq!(
            translate_event(create),
            vec![WatchEvent {
                path: PathBuf::from("/intake/a.torrent"),
                kind: WatchEventKind::Created,
            }]
        );

        let remove = notify::Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/intake/tv"));
        assert_eq!(translate_event(remove)[0].kind, WatchEventKind::Removed);

        let write = notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/intake/a.torrent"));
        assert_eq!(translate_event(write)[0].kind, WatchEventKind::Other);
    }

    #[test]
    fn test_translate_rename_both() {
        let rename = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/intake/New Folder"))
            .add_path(PathBuf::from("/intake/movies"));
        let events = translate_event(rename);
        assert_eq!(
            events,
            vec![
                WatchEvent {
                    path: PathBuf::from("/intake/New Folder"),
                    kind: WatchEventKind::Removed,
                },
                WatchEvent {
                    path: PathBuf::from("/intake/movies"),
                    kind: WatchEventKind::Created,
                },
            ]
        );
    }

    #[test]
    fn test_translate_rename_into_watched_dir() {
        let moved_in = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/intake/movies/x.torrent"));
        assert_eq!(translate_event(moved_in)[0].kind, WatchEventKind::Created);
    }

    #[test]
    fn test_bootstrap_registers_every_directory() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::default();
        let mut registrar = Registrar::new(backend.clone());

        let added = registrar.bootstrap(temp_dir.path()).unwrap();

        assert_eq!(added, 4);
        assert_eq!(registrar.watched().len(), 4);
        assert!(registrar.watched().contains(temp_dir.path()));
        assert_eq!(backend.registered().len(), 4);
    }

    #[test]
    fn test_bootstrap_twice_does_not_duplicate() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::default();
        let mut registrar = Registrar::new(backend.clone());

        registrar.bootstrap(temp_dir.path()).unwrap();
        let added_again = registrar.bootstrap(temp_dir.path()).unwrap();

        assert_eq!(added_again, 0);
        assert_eq!(backend.registered().len(), 4);
    }

    #[test]
    fn test_bootstrap_root_rejection_is_fatal() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::rejecting(temp_dir.path());
        let mut registrar = Registrar::new(backend);

        let result = registrar.bootstrap(temp_dir.path());
        assert!(matches!(result, Err(RegistrarError::RootWatch(_))));
    }

    #[test]
    fn test_bootstrap_child_rejection_is_skipped() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::rejecting(&temp_dir.path().join("music"));
        let mut registrar = Registrar::new(backend);

        let added = registrar.bootstrap(temp_dir.path()).unwrap();
        assert_eq!(added, 3);
        assert!(!registrar.watched().contains(&temp_dir.path().join("music")));
    }

    #[test]
    fn test_bootstrap_missing_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut registrar = Registrar::new(RecordingBackend::default());
        let result = registrar.bootstrap(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(RegistrarError::Discovery { .. })));
    }

    #[test]
    fn test_register_tree_picks_up_nested_directories() {
        let temp_dir = make_intake_tree();
        let mut registrar = Registrar::new(RecordingBackend::default());
        registrar.bootstrap(temp_dir.path()).unwrap();

        let nested = temp_dir.path().join("movies/2020/Some Film");
        fs::create_dir_all(&nested).unwrap();
        let added = registrar.register_tree(&temp_dir.path().join("movies/2020"));

        assert_eq!(added, 2);
        assert!(registrar.watched().contains(&nested));
    }

    #[test]
    fn test_prune_removes_subtree() {
        let temp_dir = make_intake_tree();
        fs::create_dir_all(temp_dir.path().join("tv/Show/Season 1")).unwrap();
        let backend = RecordingBackend::default();
        let mut registrar = Registrar::new(backend.clone());
        registrar.bootstrap(temp_dir.path()).unwrap();
        assert_eq!(registrar.watched().len(), 6);

        let removed = registrar.prune(&temp_dir.path().join("tv"));

        assert_eq!(removed, 3);
        assert_eq!(registrar.watched().len(), 3);
        assert_eq!(backend.unregistered.lock().unwrap().len(), 3);
        // Unknown paths (plain files) are a no-op
        assert_eq!(registrar.prune(&temp_dir.path().join("movies/x.torrent")), 0);
    }

    #[test]
    fn test_unregister_failure_keeps_path_watched() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::default();
        let mut registrar = Registrar::new(backend.clone());
        registrar.bootstrap(temp_dir.path()).unwrap();

        let tv = temp_dir.path().join("tv");
        backend.reject.lock().unwrap().insert(tv.clone());

        assert!(registrar.unregister(&tv).is_err());
        assert!(registrar.watched().contains(&tv));

        backend.reject.lock().unwrap().clear();
        assert!(registrar.unregister(&tv).unwrap());
        assert!(!registrar.watched().contains(&tv));
    }

    #[test]
    fn test_apply_commands() {
        let temp_dir = make_intake_tree();
        let mut registrar = Registrar::new(RecordingBackend::default());
        registrar.bootstrap(temp_dir.path()).unwrap();

        let nested = temp_dir.path().join("docs/nature");
        fs::create_dir_all(&nested).unwrap();
        let docs = temp_dir.path().join("docs");

        assert_eq!(registrar.apply(&RegistrarCommand::Watch(docs.clone())), 2);
        assert!(registrar.watched().contains(&nested));
        assert_eq!(registrar.apply(&RegistrarCommand::Prune(docs)), 2);
        assert!(!registrar.watched().contains(&nested));
    }

    #[test]
    fn test_unregister_unknown_path() {
        let mut registrar = Registrar::new(RecordingBackend::default());
        assert!(!registrar.unregister(Path::new("/not/watched")).unwrap());
    }

    #[tokio::test]
    async fn test_run_serves_commands_until_cancelled() {
        let temp_dir = make_intake_tree();
        let backend = RecordingBackend::default();
        let mut registrar = Registrar::new(backend.clone());
        registrar.bootstrap(temp_dir.path()).unwrap();

        let stats = new_shared_stats();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(registrar.run(rx, stats.clone(), cancel.clone()));

        let new_dir = temp_dir.path().join("documentaries");
        fs::create_dir(&new_dir).unwrap();
        tx.send(RegistrarCommand::Watch(new_dir.clone())).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stats.read().await.directories_watched != 5 {
            assert!(tokio::time::Instant::now() < deadline, "registrar never applied command");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.registered().contains(&new_dir));

        cancel.cancel();
        // Shutdown does not depend on the command queue being drained
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("registrar did not stop")
            .unwrap();
    }
}
