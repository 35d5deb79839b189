use crate::StoreError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Identity written into an exclusively held lock file, reported on contention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub token: String,
    pub pid: u32,
    pub acquired_at: String,
}

/// Advisory lock on one `(layer, environment)` pair.
///
/// Acquisition never blocks: a held lock is reported as
/// [`StoreError::LockContention`]. The lock is released on drop.
pub struct LayerLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(content.trim()).ok()
}

fn contention(file: &mut File, layer: &str, environment: &str) -> StoreError {
    let holder = read_holder(file).map(|h| format!("token {} pid {}", h.token, h.pid));
    StoreError::LockContention {
        layer: layer.to_owned(),
        environment: environment.to_owned(),
        holder,
    }
}

impl LayerLock {
    /// Take the exclusive lock, recording `token` as the holder.
    pub fn try_exclusive(
        path: &Path,
        layer: &str,
        environment: &str,
        token: &str,
    ) -> Result<Self, StoreError> {
        let mut file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(contention(&mut file, layer, environment));
        }

        let holder = LockHolder {
            token: token.to_owned(),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
        file.sync_data()?;
        debug!("locked {environment}/{layer} exclusively ({token})");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            exclusive: true,
        })
    }

    /// Take a shared lock. Any number of readers may hold it, but no exclusive holder.
    pub fn try_shared(path: &Path, layer: &str, environment: &str) -> Result<Self, StoreError> {
        let mut file = open_lock_file(path)?;
        if file.try_lock_shared().is_err() {
            return Err(contention(&mut file, layer, environment));
        }
        debug!("locked {environment}/{layer} shared");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            exclusive: false,
        })
    }

    /// Whether nobody holds the lock right now.
    pub fn is_free(path: &Path) -> Result<bool, StoreError> {
        if !path.exists() {
            return Ok(true);
        }
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_ok() {
            let _ = file.unlock();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for LayerLock {
    fn drop(&mut self) {
        if self.exclusive {
            let _ = self.file.set_len(0);
        }
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_fails_fast_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("03-database.lock");

        let _held = LayerLock::try_exclusive(&path, "03-database", "dev", "run-a").unwrap();
        match LayerLock::try_exclusive(&path, "03-database", "dev", "run-b") {
            Err(StoreError::LockContention {
                layer,
                environment,
                holder,
            }) => {
                assert_eq!(layer, "03-database");
                assert_eq!(environment, "dev");
                assert!(holder.unwrap().contains("run-a"));
            }
            Ok(_) => panic!("second exclusive lock must not succeed"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.lock");
        {
            let _lock = LayerLock::try_exclusive(&path, "l", "dev", "run-a").unwrap();
            assert!(!LayerLock::is_free(&path).unwrap());
        }
        assert!(LayerLock::is_free(&path).unwrap());
        assert!(LayerLock::try_exclusive(&path, "l", "dev", "run-b").is_ok());
    }

    #[test]
    fn shared_locks_coexist_but_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01-core.lock");

        let a = LayerLock::try_shared(&path, "01-core", "dev").unwrap();
        let b = LayerLock::try_shared(&path, "01-core", "dev").unwrap();
        assert!(!a.is_exclusive());
        assert!(LayerLock::try_exclusive(&path, "01-core", "dev", "run-c").is_err());

        drop(a);
        drop(b);
        let exclusive = LayerLock::try_exclusive(&path, "01-core", "dev", "run-c").unwrap();
        assert!(LayerLock::try_shared(&path, "01-core", "dev").is_err());
        assert_eq!(exclusive.path(), path.as_path());
    }

    #[test]
    fn missing_lock_file_is_free() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LayerLock::is_free(&dir.path().join("nothing.lock")).unwrap());
    }
}
