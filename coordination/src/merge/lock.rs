//! `MergeLock`: filesystem-level advisory mutex held for the duration of a
//! multi-task merge, serializing report writes against the same target
//! file (§5, §6).

use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct MergeLock {
    path: PathBuf,
}

impl MergeLock {
    /// Blocks (polling) until the lock file can be created exclusively, up
    /// to `timeout`. Returns `None` on timeout.
    pub async fn acquire(merge_dir: &Path, timeout: Duration) -> Option<Self> {
        let path = merge_dir.join(".merge.lock");
        let start = tokio::time::Instant::now();
        loop {
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Some(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > timeout {
                        return None;
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_acquire_waits_until_first_is_dropped() {
        let dir = tempdir().unwrap();
        let lock_one = MergeLock::acquire(dir.path(), Duration::from_secs(1)).await.unwrap();
        let dir_path = dir.path().to_path_buf();
        let handle = tokio::spawn(async move { MergeLock::acquire(&dir_path, Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(lock_one);
        let second = handle.await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_if_never_released() {
        let dir = tempdir().unwrap();
        let _lock = MergeLock::acquire(dir.path(), Duration::from_secs(1)).await.unwrap();
        let result = MergeLock::acquire(dir.path(), Duration::from_millis(150)).await;
        assert!(result.is_none());
    }
}
