//! File-backed record log.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The record log of a device, kept in one file.
///
/// The file is created on first open, parent directories included, and
/// stays under an exclusive `fs2` lock until the backend drops. A second
/// open of the same file, from any process, fails with
/// [`StorageError::Locked`].
///
/// ```no_run
/// use tillsync_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut log = FileBackend::open(Path::new("data/till.db")).unwrap();
/// log.append(b"batch").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileBackend {
    /// Opens, creating if missing, and locks the log at `path`.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "record log opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        if let Err(e) = FileExt::unlock(&*self.file.get_mut()) {
            debug!(path = %self.path.display(), error = %e, "explicit unlock failed");
        }
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> StorageResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn append(&mut self, batch: &[u8]) -> StorageResult<u64> {
        let before = self.size;
        if !batch.is_empty() {
            self.file.get_mut().write_all(batch)?;
            self.size += batch.len() as u64;
        }
        Ok(before)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.get_mut().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_data()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }

    fn clear(&mut self) -> StorageResult<()> {
        let file = self.file.get_mut();
        file.set_len(0)?;
        file.sync_all()?;
        self.size = 0;
        debug!(path = %self.path.display(), "record log cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn batches_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("till.db");

        {
            let mut log = FileBackend::open(&path).unwrap();
            log.append(b"customer:42").unwrap();
            log.sync().unwrap();
        }

        let mut log = FileBackend::open(&path).unwrap();
        assert_eq!(log.size().unwrap(), 11);
        assert_eq!(log.append(b"|sale:7").unwrap(), 11);
        assert_eq!(log.load().unwrap(), b"customer:42|sale:7");
    }

    #[test]
    fn one_owner_at_a_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("till.db");

        let owner = FileBackend::open(&path).unwrap();
        assert!(matches!(
            FileBackend::open(&path),
            Err(StorageError::Locked(_))
        ));
        drop(owner);
        assert!(FileBackend::open(&path).is_ok());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pos").join("data").join("till.db");

        let log = FileBackend::open(&path).unwrap();
        assert_eq!(log.path(), path);
        assert!(path.exists());
    }

    #[test]
    fn clear_then_append_starts_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("till.db");

        let mut log = FileBackend::open(&path).unwrap();
        log.append(b"stale records").unwrap();
        log.clear().unwrap();
        assert_eq!(log.append(b"fresh").unwrap(), 0);
        assert_eq!(log.load().unwrap(), b"fresh");
    }
}
