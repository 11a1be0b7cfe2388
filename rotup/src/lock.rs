//! Cross-process exclusion between a cron run and an interactive one.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;

static LOCK_FILE: &str = "rotup.lock";

/// Held for the whole run, released when dropped.
pub struct RunLock {
    path: PathBuf,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl RunLock {
    /// Take the lock file in `dir` without blocking.
    pub fn acquire(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        let path = dir.join(LOCK_FILE);

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => Ok(Self { path, _lock: lock }),
                Err((_file, e)) => Err(anyhow::anyhow!(
                    "Another rotup run holds {} ({e})",
                    path.display()
                )),
            }
        }
        #[cfg(not(unix))]
        {
            Ok(Self { path, _file: file })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::RunLock;

    #[test]
    fn test_exclusive_lock() {
        let tmp = tempfile::tempdir().unwrap();

        let first = RunLock::acquire(tmp.path()).expect("First lock should succeed");
        assert!(RunLock::acquire(tmp.path()).is_err());

        drop(first);
        let again = RunLock::acquire(tmp.path()).unwrap();
        assert!(again.path().ends_with("rotup.lock"));
    }
}
