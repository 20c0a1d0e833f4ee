//! Relocation module for timeout-bounded atomic file moves.
//!
//! Both the intake mover and the finalizer relocate files with a plain
//! rename, retried on a fixed backoff until a deadline passes. A rename is
//! atomic for anyone watching the destination directory; a copy is never
//! attempted.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that can occur while relocating a file.
#[derive(Debug, Error)]
pub enum MoveError {
    /// Every attempt failed until the retry budget ran out.
    #[error("moving {} to {} timed out after {attempts} attempts ({elapsed:?}): {source}", .src.display(), .dst.display())]
    TimedOut {
        src: PathBuf,
        dst: PathBuf,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: io::Error,
    },

    /// Shutdown was requested while waiting to retry.
    #[error("moving {} was cancelled", .src.display())]
    Cancelled { src: PathBuf },
}

/// How long and how often to retry a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePolicy {
    /// Stop retrying once this much time has elapsed.
    pub timeout: Duration,
    /// Wait between attempts.
    pub backoff: Duration,
}

impl MovePolicy {
    pub fn new(timeout: Duration, backoff: Duration) -> Self {
        Self { timeout, backoff }
    }
}

/// Renames `src` to `dst`, retrying until the policy's timeout elapses.
///
/// At least one attempt is always made. The last attempt happens no later
/// than the deadline, and the error it produced is returned inside
/// [`MoveError::TimedOut`]. Waiting between attempts is interrupted by
/// `cancel`.
///
/// Returns the number of attempts it took.
pub async fn move_with_timeout(
    src: &Path,
    dst: &Path,
    policy: MovePolicy,
    cancel: &CancellationToken,
) -> Result<u32, MoveError> {
    debug!(src = %src.display(), dst = %dst.display(), "moving");
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match tokio::fs::rename(src, dst).await {
            Ok(()) => return Ok(attempts),
            Err(e) => e,
        };

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(MoveError::TimedOut {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                attempts,
                elapsed,
                source: error,
            });
        }

        debug!(src = %src.display(), attempt = attempts, error = %error, "move failed, retrying");
        let wait = policy.backoff.min(policy.timeout - elapsed);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(MoveError::Cancelled { src: src.to_path_buf() });
            }
            _ = sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn fast_policy(timeout_ms: u64) -> MovePolicy {
        MovePolicy::new(Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_move_file() {
        let temp_dir = TempDir::new().unwrap();
        let start_file = temp_dir.path().join("fileOne");
        let end_file = temp_dir.path().join("fileTwo");
        let mut file = File::create(&start_file).unwrap();
        file.write_all(b"payload").unwrap();
        drop(file);

        let attempts = move_with_timeout(&start_file, &end_file, fast_policy(1000), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempts, 1);
        assert!(!start_file.exists(), "source should be gone");
        assert_eq!(fs::read_to_string(&end_file).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_move_missing_source_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let start_file = temp_dir.path().join("fileOne");
        let end_file = temp_dir.path().join("fileTwo");

        let result = move_with_timeout(&start_file, &end_file, fast_policy(50), &CancellationToken::new()).await;

        match result {
            Err(MoveError::TimedOut { attempts, source, .. }) => {
                assert!(attempts > 1, "should retry before giving up");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!end_file.exists(), "never moved, destination should not exist");
    }

    #[tokio::test]
    async fn test_move_succeeds_once_source_appears() {
        let temp_dir = TempDir::new().unwrap();
        let start_file = temp_dir.path().join("late");
        let end_file = temp_dir.path().join("moved");

        let creator = {
            let start_file = start_file.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(40)).await;
                File::create(&start_file).unwrap();
            })
        };

        let attempts = move_with_timeout(&start_file, &end_file, fast_policy(5000), &CancellationToken::new())
            .await
            .unwrap();
        creator.await.unwrap();

        assert!(attempts > 1);
        assert!(end_file.exists());
    }

    #[tokio::test]
    async fn test_move_is_cancellable() {
        let temp_dir = TempDir::new().unwrap();
        let start_file = temp_dir.path().join("missing");
        let end_file = temp_dir.path().join("never");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let policy = MovePolicy::new(Duration::from_secs(60), Duration::from_secs(5));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            move_with_timeout(&start_file, &end_file, policy, &cancel),
        )
        .await
        .expect("cancellation should interrupt the backoff");

        assert!(matches!(result, Err(MoveError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_move_into_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let start_file = temp_dir.path().join("fileOne");
        File::create(&start_file).unwrap();
        let end_file = temp_dir.path().join("no/such/dir/fileOne");

        let result = move_with_timeout(&start_file, &end_file, fast_policy(30), &CancellationToken::new()).await;

        assert!(matches!(result, Err(MoveError::TimedOut { .. })));
        assert!(start_file.exists(), "source stays where it was");
    }
}
