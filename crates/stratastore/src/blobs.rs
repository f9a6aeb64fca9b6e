//! External blob files
//!
//! Large values live as flat files under `data/`, named by the lowercased
//! hex of the SHA-256 of the key. Deletion renames into `trash/` first
//! (cheap, atomic) and unlinks later in a background sweep.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub(crate) struct BlobStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    trash_seq: AtomicU64,
}

impl BlobStore {
    pub fn open(root: &Path) -> io::Result<Self> {
        let data_dir = root.join("data");
        let trash_dir = root.join("trash");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;
        Ok(Self {
            data_dir,
            trash_dir,
            trash_seq: AtomicU64::new(0),
        })
    }

    /// Flat-file name for a key: lowercased hex of its SHA-256.
    ///
    /// Collisions are negligible for cache purposes; on one, the last writer
    /// wins and the manifest stays the source of truth.
    pub fn filename_for(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    /// Write through a temp sibling and an atomic rename, so a reader of a
    /// replaced blob observes old or new content, never a torn file.
    pub fn write(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        let tmp = self.data_dir.join(format!("{}.tmp", filename));
        if let Err(err) = fs::write(&tmp, data) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        match fs::rename(&tmp, self.path_for(filename)) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }

    pub fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(filename))
    }

    /// Schedule a blob for deletion: rename into `trash/` under a unique
    /// name. The actual unlink happens in [`BlobStore::sweep_trash`].
    pub fn discard(&self, filename: &str) {
        let seq = self.trash_seq.fetch_add(1, Ordering::Relaxed);
        let dest = self.trash_dir.join(format!("{}.{}", filename, seq));
        match fs::rename(self.path_for(filename), &dest) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(filename, error = %err, "rename to trash failed; unlinking in place");
                let _ = fs::remove_file(self.path_for(filename));
            }
        }
    }

    /// Unlink everything under `trash/`. Returns the number of files removed.
    pub fn sweep_trash(&self) -> usize {
        let entries = match fs::read_dir(&self.trash_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "cannot read trash directory");
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %entry.path().display(), error = %err, "trash unlink failed"),
            }
        }
        if removed > 0 {
            debug!(removed, "swept trash");
        }
        removed
    }

    /// File names currently present under `data/`, stale temp files included.
    pub fn data_files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(files)
    }

    /// Remove an orphaned data file outright (startup reconciliation only).
    pub fn remove_data_file(&self, filename: &str) {
        if let Err(err) = fs::remove_file(self.path_for(filename)) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(filename, error = %err, "orphan unlink failed");
            }
        }
    }
}
