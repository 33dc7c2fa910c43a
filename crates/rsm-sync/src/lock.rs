//! Exclusive advisory lock that keeps two pipeline runs off the same database.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("run lock {0} is held by another process")]
    Held(PathBuf),
    #[error("opening run lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the whole run; the lock is released when the guard drops.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Non-blocking; fails with [`LockError::Held`] if another run owns the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(path = %path.display(), "run lock busy");
                return Err(LockError::Held(path));
            }
            Err(err) => return Err(io_err(err)),
        }

        // pid of the holder, for operators looking at a stuck lock
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;

        info!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "unlocking run lock");
        }
        debug!(path = %self.path.display(), "run lock released");
    }
}

/// `state.db` → `state.db.lock`, `state` → `state.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut lock_path = db_path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}
