use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::StateError;

/// Exclusive, run-scoped lock held for as long as one orchestrator drives
/// the run. Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
    run_id: String,
}

impl RunLock {
    /// Take the lock without waiting; a second holder gets `StateError::Locked`.
    pub fn acquire(path: &Path, run_id: &str) -> Result<Self, StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = fs2::lock_contended_error();
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == contended.raw_os_error()
            {
                return Err(StateError::Locked {
                    run_id: run_id.to_string(),
                });
            }
            return Err(io_err(e));
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        tracing::debug!(run_id, path = %path.display(), "Acquired run lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/state.lock");
        let first = RunLock::acquire(&path, "abcd1234").unwrap();
        assert_eq!(first.run_id(), "abcd1234");

        let err = RunLock::acquire(&path, "abcd1234").unwrap_err();
        assert!(matches!(err, StateError::Locked { .. }));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.lock");
        drop(RunLock::acquire(&path, "abcd1234").unwrap());
        let again = RunLock::acquire(&path, "abcd1234").unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn test_locks_are_per_run() {
        let dir = tempdir().unwrap();
        let _a = RunLock::acquire(&dir.path().join("a/state.lock"), "a").unwrap();
        let _b = RunLock::acquire(&dir.path().join("b/state.lock"), "b").unwrap();
    }
}
