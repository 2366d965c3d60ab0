// =============================================================================
// Singleton guard — at most one evaluator process at a time
// =============================================================================
//
// The evaluator takes a non-blocking exclusive advisory lock on a dedicated
// lock file and holds it for the process lifetime, so two sweeps can never
// interleave even if the scheduler fires twice. This is independent of the
// store's per-transaction lock.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

/// Holds the process-level lock; released when dropped (or when the process
/// exits, however it exits).
pub struct SingletonGuard {
    _file: std::fs::File,
    path: PathBuf,
}

impl SingletonGuard {
    /// Try to become the single running evaluator. Returns `Ok(None)` when
    /// another instance already holds the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open singleton lock {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Stamp the pid for operator diagnostics; the lock itself is
                // what guards, the content is informational.
                let _ = file.set_len(0);
                let _ = write!(file, "{}", std::process::id());

                debug!(path = %path.display(), "singleton lock acquired");
                Ok(Some(Self {
                    _file: file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                warn!(
                    path = %path.display(),
                    "another evaluator instance is already running"
                );
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| {
                format!("failed to acquire singleton lock {}", path.display())
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evaluator.lock");

        let first = SingletonGuard::acquire(&path).unwrap();
        assert!(first.is_some());

        let second = SingletonGuard::acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = SingletonGuard::acquire(&path).unwrap();
        assert!(third.is_some());
    }
}
