use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nix::fcntl::{Flock, FlockArg};

/// Singleton pid file. The file is removed on clean shutdown, so its
/// presence at startup means the previous instance died uncleanly and the
/// queue state cannot be trusted.
pub struct LockFile {
    lock: Option<Flock<std::fs::File>>,
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock. Returns the guard and whether the previous
    /// instance exited abnormally. Fails when another instance holds the
    /// lock.
    pub fn acquire(path: &Path) -> anyhow::Result<(LockFile, bool)> {
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("cannot open lock file {}", path.display()))?;
        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
                bail!(
                    "another instance already holds the lock file {}",
                    path.display()
                );
            }
            Err((_, err)) => {
                bail!("cannot lock {}: {err}", path.display());
            }
        };
        lock.set_len(0)
            .with_context(|| format!("cannot truncate {}", path.display()))?;
        writeln!(&mut *lock, "{}", std::process::id())
            .with_context(|| format!("cannot write pid to {}", path.display()))?;
        lock.flush().ok();
        Ok((
            LockFile {
                lock: Some(lock),
                path: path.to_path_buf(),
            },
            existed,
        ))
    }

    /// Remove the file and drop the lock; only called on clean shutdown.
    pub fn release(mut self) {
        let _ = std::fs::remove_file(&self.path);
        self.lock.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lock_reports_clean_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let (lock, unclean) = LockFile::acquire(&path).unwrap();
        assert!(!unclean);
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn leftover_file_reports_unclean_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        {
            let (_lock, unclean) = LockFile::acquire(&path).unwrap();
            assert!(!unclean);
            // dropped without release(): the file stays behind
        }
        assert!(path.exists());
        let (lock, unclean) = LockFile::acquire(&path).unwrap();
        assert!(unclean);
        lock.release();
    }

    #[test]
    fn second_instance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let (lock, _) = LockFile::acquire(&path).unwrap();
        assert!(LockFile::acquire(&path).is_err());
        lock.release();
    }
}
