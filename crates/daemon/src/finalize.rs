//! Finalizer: files completed artifacts into the media library.
//!
//! The destination mirrors where the request was dropped: a request at
//! `<intake>/movies/x.torrent` is finalized under `<media>/movies/`. Single
//! completed files are moved as-is; completed directories are handled
//! according to the request's [`Category`].

use crate::category::{Categorizer, Category};
use crate::matcher::{strip_extension, FinalizeRequest};
use crate::relocate::{move_with_timeout, MoveError, MovePolicy};
use crate::stats::SharedStats;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The origin path cannot be rebased onto the media root.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("{} is not under intake root {}", .origin.display(), .intake_root.display())]
    NotUnderIntakeRoot { origin: PathBuf, intake_root: PathBuf },

    #[error("{} sits directly in the intake root and has no category directory", .origin.display())]
    Uncategorized { origin: PathBuf },

    #[error("{} escapes the intake root", .origin.display())]
    Traversal { origin: PathBuf },
}

/// Errors that drop a finalize request.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Cannot determine destination: {0}")]
    Destination(#[from] DestinationError),

    #[error("Failed to create {}: {source}", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Completed directory {completed} is of unknown category")]
    UnknownCategory { completed: String },

    #[error("Finalizing {category} directories is not supported yet ({completed})")]
    UnsupportedCategory { category: Category, completed: String },

    #[error("Unable to read completed directory {}: {source}", .path.display())]
    ListDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Completed directory {} contains no files", .path.display())]
    EmptyDirectory { path: PathBuf },

    #[error("Failed to move completed artifact: {0}")]
    Move(#[from] MoveError),
}

/// Computes the library directory for a request.
///
/// Strips `intake_root` and the file name from `origin` and rebases the
/// remainder onto `media_root`. The result is always strictly below
/// `media_root`: origins directly in the intake root, or with `..`
/// components, are rejected.
pub fn final_destination(
    intake_root: &Path,
    media_root: &Path,
    origin: &Path,
) -> Result<PathBuf, DestinationError> {
    let relative = origin
        .strip_prefix(intake_root)
        .map_err(|_| DestinationError::NotUnderIntakeRoot {
            origin: origin.to_path_buf(),
            intake_root: intake_root.to_path_buf(),
        })?;

    let category_dir = relative
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| DestinationError::Uncategorized {
            origin: origin.to_path_buf(),
        })?;

    if category_dir
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(DestinationError::Traversal {
            origin: origin.to_path_buf(),
        });
    }

    Ok(media_root.join(category_dir))
}

/// A regular file inside a completed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Picks the largest file; equal sizes go to the lexicographically
/// smallest name so the choice never depends on listing order.
pub fn select_largest(entries: &[FileEntry]) -> Option<&FileEntry> {
    entries
        .iter()
        .max_by(|a, b| a.size.cmp(&b.size).then_with(|| b.name.cmp(&a.name)))
}

/// Name the selected file takes in the library: the request's base name
/// with the selected file's extension.
pub fn library_name(original_name: &str, selected: &str) -> String {
    let stem = strip_extension(original_name);
    match Path::new(selected).extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem.to_string(),
    }
}

/// Lists the regular files directly inside `dir`.
pub async fn list_files(dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if metadata.is_file() {
            files.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
    }
    Ok(files)
}

/// Settings for the finalizer stage.
#[derive(Debug, Clone)]
pub struct FinalizerSettings {
    pub intake_root: PathBuf,
    pub completed_dir: PathBuf,
    pub media_root: PathBuf,
    pub move_policy: MovePolicy,
}

/// Serial consumer of finalize requests.
pub struct Finalizer {
    settings: FinalizerSettings,
    categorizer: Arc<dyn Categorizer>,
}

impl Finalizer {
    pub fn new(settings: FinalizerSettings, categorizer: Arc<dyn Categorizer>) -> Self {
        Self {
            settings,
            categorizer,
        }
    }

    /// Works out which file to move and where.
    ///
    /// Creates the destination directory as a side effect. A failed stat of
    /// the completed entry is logged and the entry is treated as a single
    /// file, leaving the move to report the real failure.
    pub async fn plan(&self, request: &FinalizeRequest) -> Result<(PathBuf, PathBuf), FinalizeError> {
        let completed_path = self.settings.completed_dir.join(&request.completed_name);

        let is_dir = match tokio::fs::metadata(&completed_path).await {
            Ok(metadata) => metadata.is_dir(),
            Err(e) => {
                warn!(path = %completed_path.display(), error = %e, "error stat'ing completed entry");
                false
            }
        };

        let destination = final_destination(
            &self.settings.intake_root,
            &self.settings.media_root,
            &request.origin_path,
        )?;
        debug!(path = %destination.display(), "ensure directory exists");
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|source| FinalizeError::CreateDirectory {
                path: destination.clone(),
                source,
            })?;

        if !is_dir {
            let target = destination.join(&request.completed_name);
            return Ok((completed_path, target));
        }

        let request_path = request
            .origin_path
            .strip_prefix(&self.settings.intake_root)
            .unwrap_or(&request.origin_path);
        let category = self.categorizer.categorize(request_path);
        debug!(completed = %request.completed_name, %category, "completed entry is a directory");

        match category {
            Category::Movies => {
                let files = list_files(&completed_path).await.map_err(|source| {
                    FinalizeError::ListDirectory {
                        path: completed_path.clone(),
                        source,
                    }
                })?;
                let largest = select_largest(&files).ok_or_else(|| FinalizeError::EmptyDirectory {
                    path: completed_path.clone(),
                })?;
                let source = completed_path.join(&largest.name);
                let target = destination.join(library_name(&request.original_name, &largest.name));
                Ok((source, target))
            }
            Category::Tv => Err(FinalizeError::UnsupportedCategory {
                category,
                completed: request.completed_name.clone(),
            }),
            Category::Unknown => Err(FinalizeError::UnknownCategory {
                completed: request.completed_name.clone(),
            }),
        }
    }

    /// Finalizes one request, returning where the artifact ended up.
    pub async fn finalize(
        &self,
        request: &FinalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FinalizeError> {
        let (source, target) = self.plan(request).await?;
        info!(src = %source.display(), dst = %target.display(), "moving completed artifact");
        move_with_timeout(&source, &target, self.settings.move_policy, cancel).await?;
        Ok(target)
    }

    /// Processes requests one at a time until cancelled or the queue closes.
    ///
    /// A failed request is logged and dropped; it is not retried.
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<FinalizeRequest>,
        stats: SharedStats,
        cancel: CancellationToken,
    ) {
        info!("finalizer starting up");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match self.finalize(&request, &cancel).await {
                Ok(target) => {
                    info!(request = %request.original_name, dst = %target.display(), "finalized");
                    stats.write().await.finalized += 1;
                }
                Err(FinalizeError::Move(MoveError::Cancelled { .. })) => {
                    warn!(request = %request.original_name, "finalize interrupted by shutdown");
                    break;
                }
                Err(e) => {
                    error!(request = %request.original_name, completed = %request.completed_name, error = %e, "failed to finalize");
                    stats.write().await.finalize_failed += 1;
                }
            }
        }
        info!("finalizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::KeywordCategorizer;
    use crate::stats::new_shared_stats;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Dirs {
        _temp: TempDir,
        intake: PathBuf,
        completed: PathBuf,
        media: PathBuf,
    }

    fn make_dirs() -> Dirs {
        let temp = TempDir::new().unwrap();
        let intake = temp.path().join("watch");
        let completed = temp.path().join("complete");
        let media = temp.path().join("media");
        for dir in [&intake, &completed, &media] {
            fs::create_dir_all(dir).unwrap();
        }
        Dirs {
            _temp: temp,
            intake,
            completed,
            media,
        }
    }

    fn finalizer_for(dirs: &Dirs) -> Finalizer {
        Finalizer::new(
            FinalizerSettings {
                intake_root: dirs.intake.clone(),
                completed_dir: dirs.completed.clone(),
                media_root: dirs.media.clone(),
                move_policy: MovePolicy::new(Duration::from_millis(50), Duration::from_millis(10)),
            },
            Arc::new(KeywordCategorizer::default()),
        )
    }

    fn write_file(path: &Path, size: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![b'x'; size]).unwrap();
    }

    fn request(dirs: &Dirs, original: &str, category: &str, completed: &str) -> FinalizeRequest {
        FinalizeRequest {
            original_name: original.to_string(),
            origin_path: dirs.intake.join(category).join(original),
            completed_name: completed.to_string(),
        }
    }

    #[test]
    fn test_final_destination() {
        let dest = final_destination(
            Path::new("/r/"),
            Path::new("/m/"),
            Path::new("/r/movies/x.torrent"),
        )
        .unwrap();
        assert_eq!(dest, PathBuf::from("/m/movies/"));
    }

    #[test]
    fn test_final_destination_nested() {
        let dest = final_destination(
            Path::new("this/thing/here/"),
            Path::new("that/thing/there/"),
            Path::new("this/thing/here/videos/homeMovies/dance.avi"),
        )
        .unwrap();
        assert_eq!(dest, PathBuf::from("that/thing/there/videos/homeMovies/"));
    }

    #[test]
    fn test_final_destination_rejections() {
        assert!(matches!(
            final_destination(Path::new("/r"), Path::new("/m"), Path::new("/elsewhere/x.torrent")),
            Err(DestinationError::NotUnderIntakeRoot { .. })
        ));
        assert!(matches!(
            final_destination(Path::new("/r"), Path::new("/m"), Path::new("/r/x.torrent")),
            Err(DestinationError::Uncategorized { .. })
        ));
        assert!(matches!(
            final_destination(Path::new("/r"), Path::new("/m"), Path::new("/r/movies/../../x.torrent")),
            Err(DestinationError::Traversal { .. })
        ));
    }

    #[test]
    fn test_select_largest() {
        let entries = vec![
            FileEntry { name: "a.nfo".into(), size: 10 },
            FileEntry { name: "b.mkv".into(), size: 999 },
            FileEntry { name: "c.txt".into(), size: 5 },
        ];
        assert_eq!(select_largest(&entries).unwrap().name, "b.mkv");
        assert!(select_largest(&[]).is_none());
    }

    #[test]
    fn test_select_largest_tie_prefers_smallest_name() {
        let entries = vec![
            FileEntry { name: "z.mkv".into(), size: 7 },
            FileEntry { name: "m.mkv".into(), size: 7 },
        ];
        assert_eq!(select_largest(&entries).unwrap().name, "m.mkv");
    }

    #[test]
    fn test_library_name() {
        assert_eq!(library_name("file.torrent", "file.avi"), "file.avi");
        assert_eq!(library_name("New Movie (2020).torrent", "nm.2020.mkv"), "New Movie (2020).mkv");
        assert_eq!(library_name("film.torrent", "README"), "film");
    }

    #[tokio::test]
    async fn test_finalize_single_file() {
        let dirs = make_dirs();
        File::create(dirs.completed.join("file.avi")).unwrap();

        let target = finalizer_for(&dirs)
            .finalize(&request(&dirs, "file.torrent", "movies", "file.avi"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(target, dirs.media.join("movies/file.avi"));
        assert!(target.exists());
        assert!(!dirs.completed.join("file.avi").exists());
    }

    #[tokio::test]
    async fn test_finalize_movie_directory_moves_largest() {
        let dirs = make_dirs();
        let completed_dir = dirs.completed.join("fileDir");
        fs::create_dir_all(&completed_dir).unwrap();
        write_file(&completed_dir.join("sample.avi"), 10);
        write_file(&completed_dir.join("feature.avi"), 999);
        write_file(&completed_dir.join("info.nfo"), 5);
        fs::create_dir(completed_dir.join("Subs")).unwrap();

        let target = finalizer_for(&dirs)
            .finalize(&request(&dirs, "file.torrent", "movies", "fileDir"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(target, dirs.media.join("movies/file.avi"));
        assert_eq!(fs::metadata(&target).unwrap().len(), 999);
        assert!(completed_dir.join("sample.avi").exists());
    }

    #[tokio::test]
    async fn test_finalize_tv_directory_is_unsupported() {
        let dirs = make_dirs();
        let completed_dir = dirs.completed.join("Show.S01");
        fs::create_dir_all(&completed_dir).unwrap();
        write_file(&completed_dir.join("e01.mkv"), 10);

        let result = finalizer_for(&dirs)
            .finalize(&request(&dirs, "Show S01.torrent", "tv", "Show.S01"), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(FinalizeError::UnsupportedCategory { category: Category::Tv, .. })
        ));
        assert!(completed_dir.join("e01.mkv").exists());
    }

    #[tokio::test]
    async fn test_finalize_unknown_category_directory() {
        let dirs = make_dirs();
        fs::create_dir_all(dirs.completed.join("Album")).unwrap();

        let result = finalizer_for(&dirs)
            .finalize(&request(&dirs, "Album.torrent", "music", "Album"), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FinalizeError::UnknownCategory { .. })));
    }

    #[tokio::test]
    async fn test_finalize_empty_movie_directory() {
        let dirs = make_dirs();
        fs::create_dir_all(dirs.completed.join("Film")).unwrap();

        let result = finalizer_for(&dirs)
            .finalize(&request(&dirs, "Film.torrent", "movies", "Film"), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FinalizeError::EmptyDirectory { .. })));
    }

    #[tokio::test]
    async fn test_finalize_missing_completed_entry_times_out() {
        let dirs = make_dirs();

        let result = finalizer_for(&dirs)
            .finalize(&request(&dirs, "gone.torrent", "movies", "gone.mkv"), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(FinalizeError::Move(MoveError::TimedOut { .. }))));
    }

    #[tokio::test]
    async fn test_run_counts_outcomes() {
        let dirs = make_dirs();
        File::create(dirs.completed.join("good.mkv")).unwrap();

        let stats = new_shared_stats();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(finalizer_for(&dirs).run(rx, stats.clone(), cancel.clone()));

        tx.send(request(&dirs, "good.torrent", "movies", "good.mkv")).await.unwrap();
        tx.send(request(&dirs, "bad.torrent", "movies", "bad.mkv")).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("finalizer did not drain")
            .unwrap();

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.finalized, 1);
        assert_eq!(snapshot.finalize_failed, 1);
        assert!(dirs.media.join("movies/good.mkv").exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_destination_is_strictly_below_media_root(
            category in prop::collection::vec("[a-zA-Z0-9 _-]{1,10}", 1..4),
            file in "[a-zA-Z0-9 _-]{1,10}\\.torrent",
        ) {
            let intake = Path::new("/srv/intake");
            let media = Path::new("/srv/media");
            let origin = intake.join(category.join("/")).join(&file);

            let dest = final_destination(intake, media, &origin).unwrap();

            prop_assert!(dest.starts_with(media));
            prop_assert_ne!(dest.as_path(), media);
            prop_assert_eq!(dest, media.join(category.join("/")));
        }

        #[test]
        fn prop_largest_selection_ignores_order(
            sizes in prop::collection::vec(0u64..10_000, 1..8),
            rotate in 0usize..8,
        ) {
            let entries: Vec<FileEntry> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| FileEntry { name: format!("f{}.mkv", i), size: *size })
                .collect();
            let mut shuffled = entries.clone();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);
            shuffled.reverse();

            let a = select_largest(&entries).unwrap();
            let b = select_largest(&shuffled).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.size, *sizes.iter().max().unwrap());
        }
    }
}
