//! Disk cache tier
//!
//! Hybrid store: the SQLite manifest tracks every entry and holds small
//! values inline; larger values go to external files under `data/`. Count,
//! cost, age and free-disk-space budgets are enforced in batches by a trim
//! loop; one worker thread runs async operations, trims and trash sweeps.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::blobs::BlobStore;
use crate::error::{Error, Result};
use crate::manifest::{EntryRecord, Manifest};

/// Rows examined per eviction batch.
const TRIM_BATCH: usize = 16;

/// Configuration for [`DiskCache`]. Limits default to unlimited.
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// Maximum number of entries kept.
    pub count_limit: u64,
    /// Maximum total value bytes kept.
    pub cost_limit: u64,
    /// Maximum entry age; `None` means unlimited.
    pub age_limit: Option<Duration>,
    /// Evict until at least this many bytes stay free on the volume.
    /// Zero disables the floor.
    pub free_disk_space_limit: u64,
    /// Period of the background trim loop. Zero disables the loop.
    pub auto_trim_interval: Duration,
    /// Values at most this many bytes are stored inline in the manifest;
    /// larger values go to external files.
    pub inline_threshold: usize,
    /// Write access times on every read instead of batching them.
    pub eager_access_updates: bool,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: None,
            free_disk_space_limit: 0,
            auto_trim_interval: Duration::from_secs(60),
            inline_threshold: 20 * 1024,
            eager_access_updates: false,
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct DiskShared {
    manifest: Mutex<Manifest>,
    blobs: BlobStore,
    config: DiskCacheConfig,
    root: PathBuf,
    trim_queued: AtomicBool,
    shutdown: Mutex<bool>,
    timer_signal: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    // Held for the lifetime of the instance; guards single ownership of the
    // directory.
    _lock_file: File,
}

impl DiskShared {
    fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let now = unix_now();
        let filename = {
            let mut manifest = self.manifest.lock();
            match manifest.get(key)? {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(rec) => {
                    manifest.touch(key, now)?;
                    match (rec.filename, rec.inline_data) {
                        (None, Some(data)) => {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(Some(data));
                        }
                        (Some(filename), _) => filename,
                        (None, None) => {
                            // Inconsistent row; purge it.
                            manifest.delete(key)?;
                            self.misses.fetch_add(1, Ordering::Relaxed);
                            return Ok(None);
                        }
                    }
                }
            }
        };

        // File read happens outside the manifest lock.
        match self.blobs.read(&filename) {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(data))
            }
            Err(err) => {
                warn!(key, error = %err, "external blob unreadable; dropping entry");
                {
                    let mut manifest = self.manifest.lock();
                    let _ = manifest.delete(key);
                }
                self.blobs.discard(&filename);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn get_extended_blocking(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Ok(None);
        }
        let mut manifest = self.manifest.lock();
        Ok(manifest.get(key)?.and_then(|rec| rec.extended_data))
    }

    fn set_blocking(&self, key: &str, value: &[u8], extended: Option<&[u8]>) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let now = unix_now();

        if value.len() <= self.config.inline_threshold {
            let prev = {
                let mut manifest = self.manifest.lock();
                let prev = manifest.filename_of(key)?;
                manifest.upsert(&EntryRecord {
                    key: key.to_string(),
                    filename: None,
                    size: value.len() as u64,
                    inline_data: Some(value.to_vec()),
                    modification_time: now,
                    last_access_time: now,
                    extended_data: extended.map(<[u8]>::to_vec),
                })?;
                prev
            };
            // Replacing an external entry with an inline one strands its file.
            if let Some(Some(stale)) = prev {
                self.blobs.discard(&stale);
            }
            return Ok(());
        }

        // External: write the blob first, outside the lock, then commit the
        // row. Same-key replacements reuse the filename, so no stale file is
        // left either way.
        let filename = BlobStore::filename_for(key);
        self.blobs.write(&filename, value)?;
        let upserted = {
            let mut manifest = self.manifest.lock();
            manifest.upsert(&EntryRecord {
                key: key.to_string(),
                filename: Some(filename.clone()),
                size: value.len() as u64,
                inline_data: None,
                modification_time: now,
                last_access_time: now,
                extended_data: extended.map(<[u8]>::to_vec),
            })
        };
        if let Err(err) = upserted {
            // No partial state: drop the blob we just wrote.
            self.blobs.discard(&filename);
            return Err(err);
        }
        Ok(())
    }

    fn remove_blocking(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let deleted = self.manifest.lock().delete(key)?;
        if let Some(Some(filename)) = deleted {
            self.blobs.discard(&filename);
        }
        Ok(())
    }

    fn clear_blocking(&self) -> Result<()> {
        self.manifest.lock().delete_all()?;
        match self.blobs.data_files() {
            Ok(files) => {
                for file in files {
                    self.blobs.discard(&file);
                }
            }
            Err(err) => warn!(error = %err, "cannot enumerate data files on clear"),
        }
        Ok(())
    }

    /// Batched clear with a progress tick per deleted batch. The callback
    /// runs with no lock held.
    fn clear_with_progress(&self, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let total = {
            let mut manifest = self.manifest.lock();
            manifest.flush_access()?;
            manifest.count()?
        };
        let mut removed = 0u64;
        loop {
            let victims = {
                let mut manifest = self.manifest.lock();
                let batch = manifest.lru_batch(TRIM_BATCH)?;
                for victim in &batch {
                    manifest.delete(&victim.key)?;
                }
                batch
            };
            if victims.is_empty() {
                break;
            }
            removed += victims.len() as u64;
            for victim in victims {
                if let Some(filename) = victim.filename {
                    self.blobs.discard(&filename);
                }
            }
            progress(removed, total);
        }
        // Stragglers: rows written mid-clear and stale temp files.
        self.clear_blocking()
    }

    fn contains_blocking(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        match self.manifest.lock().contains(key) {
            Ok(present) => present,
            Err(err) => {
                warn!(key, error = %err, "contains query failed");
                false
            }
        }
    }

    fn flush_blocking(&self) -> Result<()> {
        let mut manifest = self.manifest.lock();
        manifest.flush_access()?;
        manifest.checkpoint()
    }

    fn trim_to_count(&self, limit: u64) -> Result<()> {
        loop {
            let (evicted_rows, discards) = {
                let mut manifest = self.manifest.lock();
                manifest.flush_access()?;
                let count = manifest.count()?;
                if count <= limit {
                    return Ok(());
                }
                let need = (count - limit).min(TRIM_BATCH as u64) as usize;
                let mut evicted_rows = 0usize;
                let mut discards = Vec::new();
                for victim in manifest.lru_batch(need)? {
                    manifest.delete(&victim.key)?;
                    evicted_rows += 1;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    if let Some(filename) = victim.filename {
                        discards.push(filename);
                    }
                }
                (evicted_rows, discards)
            };
            for filename in discards {
                self.blobs.discard(&filename);
            }
            if evicted_rows == 0 {
                return Ok(());
            }
        }
    }

    fn trim_to_cost(&self, limit: u64) -> Result<()> {
        loop {
            let (evicted_rows, discards) = {
                let mut manifest = self.manifest.lock();
                manifest.flush_access()?;
                let mut total = manifest.total_size()?;
                if total <= limit {
                    return Ok(());
                }
                let mut evicted_rows = 0usize;
                let mut discards = Vec::new();
                for victim in manifest.lru_batch(TRIM_BATCH)? {
                    if total <= limit {
                        break;
                    }
                    manifest.delete(&victim.key)?;
                    total = total.saturating_sub(victim.size);
                    evicted_rows += 1;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    if let Some(filename) = victim.filename {
                        discards.push(filename);
                    }
                }
                (evicted_rows, discards)
            };
            for filename in discards {
                self.blobs.discard(&filename);
            }
            if evicted_rows == 0 {
                return Ok(());
            }
        }
    }

    fn trim_to_age(&self, age: Duration) -> Result<()> {
        let cutoff = unix_now() - age.as_secs() as i64;
        let (deleted, filenames) = {
            let mut manifest = self.manifest.lock();
            manifest.flush_access()?;
            manifest.delete_older_than(cutoff)?
        };
        self.evictions.fetch_add(deleted as u64, Ordering::Relaxed);
        for filename in filenames {
            self.blobs.discard(&filename);
        }
        Ok(())
    }

    /// Evict until the volume keeps at least `floor` free bytes. Trash is
    /// swept between batches so evictions actually return space.
    fn trim_free_space(&self, floor: u64) -> Result<()> {
        if floor == 0 {
            return Ok(());
        }
        loop {
            let available = fs2::available_space(&self.root)?;
            if available >= floor {
                return Ok(());
            }
            let victims = {
                let mut manifest = self.manifest.lock();
                manifest.flush_access()?;
                let batch = manifest.lru_batch(TRIM_BATCH)?;
                for victim in &batch {
                    manifest.delete(&victim.key)?;
                }
                batch
            };
            if victims.is_empty() {
                return Ok(());
            }
            for victim in victims {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(filename) = victim.filename {
                    self.blobs.discard(&filename);
                }
            }
            self.blobs.sweep_trash();
        }
    }

    /// One timed maintenance pass. Failures are logged, never propagated.
    fn trim_pass(&self) {
        if let Err(err) = self.trim_to_cost(self.config.cost_limit) {
            warn!(error = %err, "cost trim failed");
        }
        if let Err(err) = self.trim_to_count(self.config.count_limit) {
            warn!(error = %err, "count trim failed");
        }
        if let Some(age) = self.config.age_limit {
            if let Err(err) = self.trim_to_age(age) {
                warn!(error = %err, "age trim failed");
            }
        }
        if let Err(err) = self.trim_free_space(self.config.free_disk_space_limit) {
            warn!(error = %err, "free-space trim failed");
        }
        self.blobs.sweep_trash();
    }

    fn total_count(&self) -> u64 {
        match self.manifest.lock().count() {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "count query failed");
                0
            }
        }
    }

    fn total_cost(&self) -> u64 {
        match self.manifest.lock().total_size() {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "size query failed");
                0
            }
        }
    }
}

/// Persistent on-disk cache tier.
///
/// All methods are thread-safe. Synchronous methods may block on I/O; the
/// `_async` variants return immediately and invoke their callback on the
/// tier's background worker thread.
pub struct DiskCache {
    shared: Arc<DiskShared>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl DiskCache {
    /// Open or create a cache rooted at `root` with default configuration.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(root, DiskCacheConfig::default())
    }

    /// Open or create a cache rooted at `root`.
    ///
    /// Takes an advisory exclusive lock on the directory; a second live
    /// instance on the same path fails with [`Error::Locked`]. Reconciles
    /// the manifest with the file store before returning: rows whose blob is
    /// missing are dropped, files without a row are removed, and pending
    /// trash is swept in the background.
    pub fn with_config(root: impl AsRef<Path>, config: DiskCacheConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(root.join(".lock"))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::Locked(root));
        }

        let mut manifest = Manifest::open(&root.join("manifest.db"), config.eager_access_updates)?;
        let blobs = BlobStore::open(&root)?;

        // Reconcile index and file store.
        let mut dropped_rows = 0;
        for (key, filename) in manifest.rows_with_files()? {
            if !blobs.path_for(&filename).exists() {
                manifest.delete(&key)?;
                dropped_rows += 1;
            }
        }
        let known: HashSet<String> = manifest.external_filenames()?.into_iter().collect();
        let mut orphans = 0;
        for file in blobs.data_files()? {
            if !known.contains(&file) {
                blobs.remove_data_file(&file);
                orphans += 1;
            }
        }
        if dropped_rows > 0 || orphans > 0 {
            debug!(dropped_rows, orphans, root = %root.display(), "reconciled disk cache");
        }

        let interval = config.auto_trim_interval;
        let shared = Arc::new(DiskShared {
            manifest: Mutex::new(manifest),
            blobs,
            config,
            root,
            trim_queued: AtomicBool::new(false),
            shutdown: Mutex::new(false),
            timer_signal: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            _lock_file: lock_file,
        });

        let (jobs, job_rx) = channel::<Job>();
        let worker = thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                job();
            }
        });

        // Empty leftover trash off the open path.
        let sweep_shared = Arc::clone(&shared);
        let _ = jobs.send(Box::new(move || {
            sweep_shared.blobs.sweep_trash();
        }));

        let timer = (!interval.is_zero()).then(|| {
            let shared = Arc::clone(&shared);
            let jobs = jobs.clone();
            thread::spawn(move || loop {
                {
                    let mut shutdown = shared.shutdown.lock();
                    if *shutdown {
                        break;
                    }
                    let _ = shared.timer_signal.wait_for(&mut shutdown, interval);
                    if *shutdown {
                        break;
                    }
                }
                // Coalesce: skip the tick if a pass is already queued.
                if !shared.trim_queued.swap(true, Ordering::AcqRel) {
                    let pass = Arc::clone(&shared);
                    let _ = jobs.send(Box::new(move || {
                        pass.trim_pass();
                        pass.trim_queued.store(false, Ordering::Release);
                    }));
                }
            })
        });

        Ok(Self {
            shared,
            jobs: Some(jobs),
            worker: Some(worker),
            timer,
        })
    }

    fn submit(&self, job: Job) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(job).is_err() {
                warn!("disk worker unavailable; dropping job");
            }
        }
    }

    /// Directory this cache owns.
    pub fn path(&self) -> &Path {
        &self.shared.root
    }

    /// Whether the key has an entry. Does not refresh recency.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.contains_blocking(key)
    }

    /// Read a value. Missing keys and unreadable entries return `Ok(None)`;
    /// an unreadable external blob also drops its row.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shared.get_blocking(key)
    }

    /// Read the opaque caller metadata stored alongside a value.
    pub fn get_extended(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.shared.get_extended_blocking(key)
    }

    /// Read an entry's manifest row as stored: routing, sizes, timestamps
    /// and metadata. Does not refresh recency and does not read blob files.
    pub fn entry(&self, key: &str) -> Result<Option<EntryRecord>> {
        if key.is_empty() {
            return Ok(None);
        }
        self.shared.manifest.lock().get(key)
    }

    /// Write a value; inline or external per the configured threshold.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.shared.set_blocking(key, value, None)
    }

    /// Write a value together with opaque caller metadata.
    pub fn set_with_extended(
        &self,
        key: &str,
        value: &[u8],
        extended: Option<&[u8]>,
    ) -> Result<()> {
        self.shared.set_blocking(key, value, extended)
    }

    /// Delete an entry; its external blob (if any) moves to trash.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.shared.remove_blocking(key)
    }

    /// Delete every entry.
    pub fn clear(&self) -> Result<()> {
        self.shared.clear_blocking()?;
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            shared.blobs.sweep_trash();
        }));
        Ok(())
    }

    /// [`DiskCache::clear`] with progress reporting: `progress(removed,
    /// total)` is invoked after each deleted batch, with no lock held.
    pub fn clear_with_progress<P>(&self, mut progress: P) -> Result<()>
    where
        P: FnMut(u64, u64),
    {
        let result = self.shared.clear_with_progress(&mut progress);
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            shared.blobs.sweep_trash();
        }));
        result
    }

    /// Flush batched access-time updates and checkpoint the WAL.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush_blocking()
    }

    /// Evict oldest-first until at most `count` entries remain.
    pub fn trim_to_count(&self, count: u64) -> Result<()> {
        self.shared.trim_to_count(count)
    }

    /// Evict oldest-first until the stored bytes are at most `cost`.
    pub fn trim_to_cost(&self, cost: u64) -> Result<()> {
        self.shared.trim_to_cost(cost)
    }

    /// Delete every entry last accessed more than `age` ago.
    pub fn trim_to_age(&self, age: Duration) -> Result<()> {
        self.shared.trim_to_age(age)
    }

    /// Number of stored entries.
    pub fn total_count(&self) -> u64 {
        self.shared.total_count()
    }

    /// Total stored value bytes.
    pub fn total_cost(&self) -> u64 {
        self.shared.total_cost()
    }

    /// Lookups that found a readable entry.
    pub fn hits(&self) -> u64 {
        self.shared.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    pub fn misses(&self) -> u64 {
        self.shared.misses.load(Ordering::Relaxed)
    }

    /// Entries removed by trimming.
    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    /// Async [`DiskCache::get`]; the callback runs on the worker thread.
    pub fn get_async<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(Result<Option<Vec<u8>>>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let key = key.to_string();
        self.submit(Box::new(move || callback(shared.get_blocking(&key))));
    }

    /// Async [`DiskCache::set`]; the callback runs on the worker thread.
    pub fn set_async<F>(&self, key: &str, value: Vec<u8>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let key = key.to_string();
        self.submit(Box::new(move || {
            callback(shared.set_blocking(&key, &value, None))
        }));
    }

    /// Async [`DiskCache::remove`]; the callback runs on the worker thread.
    pub fn remove_async<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let key = key.to_string();
        self.submit(Box::new(move || callback(shared.remove_blocking(&key))));
    }

    /// Async [`DiskCache::clear`]; the callback runs on the worker thread.
    pub fn clear_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            let result = shared.clear_blocking();
            shared.blobs.sweep_trash();
            callback(result)
        }));
    }

    /// Async [`DiskCache::clear_with_progress`]; both callbacks run on the
    /// worker thread, the completion callback last.
    pub fn clear_with_progress_async<P, F>(&self, mut progress: P, completion: F)
    where
        P: FnMut(u64, u64) + Send + 'static,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            let result = shared.clear_with_progress(&mut progress);
            shared.blobs.sweep_trash();
            completion(result)
        }));
    }

    /// Async [`DiskCache::trim_to_count`]; errors are logged.
    pub fn trim_to_count_async<F>(&self, count: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            if let Err(err) = shared.trim_to_count(count) {
                warn!(error = %err, "async count trim failed");
            }
            callback()
        }));
    }

    /// Async [`DiskCache::trim_to_cost`]; errors are logged.
    pub fn trim_to_cost_async<F>(&self, cost: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            if let Err(err) = shared.trim_to_cost(cost) {
                warn!(error = %err, "async cost trim failed");
            }
            callback()
        }));
    }

    /// Async [`DiskCache::trim_to_age`]; errors are logged.
    pub fn trim_to_age_async<F>(&self, age: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.submit(Box::new(move || {
            if let Err(err) = shared.trim_to_age(age) {
                warn!(error = %err, "async age trim failed");
            }
            callback()
        }));
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.timer_signal.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        // Disconnect the queue so the worker drains and exits.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let mut manifest = self.shared.manifest.lock();
        if let Err(err) = manifest.flush_access() {
            warn!(error = %err, "final access flush failed");
        }
        if let Err(err) = manifest.checkpoint() {
            warn!(error = %err, "final checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn quiet_config() -> DiskCacheConfig {
        DiskCacheConfig {
            auto_trim_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn small_threshold_config(threshold: usize) -> DiskCacheConfig {
        DiskCacheConfig {
            inline_threshold: threshold,
            auto_trim_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_inline_set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("a", b"small value").unwrap();

        assert_eq!(cache.get("a").unwrap().unwrap(), b"small value");
        assert!(cache.contains("a"));
        assert_eq!(cache.total_count(), 1);
        assert_eq!(cache.total_cost(), 11);
    }

    #[test]
    fn test_inline_row_shape() {
        let dir = TempDir::new().unwrap();
        let payload = vec![b'v'; 100];
        {
            let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();
            cache.set("a", &payload).unwrap();
        }

        let conn = Connection::open(dir.path().join("manifest.db")).unwrap();
        let (filename, inline_len, size): (Option<String>, i64, i64) = conn
            .query_row(
                "SELECT filename, LENGTH(inline_data), size FROM manifest WHERE key = 'a'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();

        assert_eq!(filename, None);
        assert_eq!(inline_len, 100);
        assert_eq!(size, 100);
    }

    #[test]
    fn test_external_routing_creates_hashed_file() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();
        let payload = vec![b'x'; 500];

        cache.set("big", &payload).unwrap();

        let filename = BlobStore::filename_for("big");
        assert!(dir.path().join("data").join(&filename).exists());
        assert_eq!(cache.get("big").unwrap().unwrap(), payload);

        let conn = Connection::open(dir.path().join("manifest.db")).unwrap();
        let (row_filename, inline, size): (Option<String>, Option<Vec<u8>>, i64) = conn
            .query_row(
                "SELECT filename, inline_data, size FROM manifest WHERE key = 'big'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(row_filename, Some(filename));
        assert_eq!(inline, None);
        assert_eq!(size, 500);
    }

    #[test]
    fn test_default_threshold_routes_large_values_externally() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("small", &vec![b'a'; 20 * 1024]).unwrap();
        cache.set("large", &vec![b'b'; 20 * 1024 + 1]).unwrap();

        assert!(!dir
            .path()
            .join("data")
            .join(BlobStore::filename_for("small"))
            .exists());
        assert!(dir
            .path()
            .join("data")
            .join(BlobStore::filename_for("large"))
            .exists());
    }

    #[test]
    fn test_replace_external_with_inline_discards_file() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("k", &vec![b'x'; 500]).unwrap();
        let blob_path = dir.path().join("data").join(BlobStore::filename_for("k"));
        assert!(blob_path.exists());

        cache.set("k", b"tiny").unwrap();

        assert!(!blob_path.exists());
        assert_eq!(cache.get("k").unwrap().unwrap(), b"tiny");
        assert_eq!(cache.total_count(), 1);
    }

    #[test]
    fn test_remove_deletes_row_and_file() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("k", &vec![b'x'; 500]).unwrap();
        cache.remove("k").unwrap();

        assert!(!cache.contains("k"));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(!dir.path().join("data").join(BlobStore::filename_for("k")).exists());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let payload = vec![b'p'; 300];

        {
            let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();
            cache.set("inline", b"abc").unwrap();
            cache.set("external", &payload).unwrap();
        }

        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();
        assert_eq!(cache.get("inline").unwrap().unwrap(), b"abc");
        assert_eq!(cache.get("external").unwrap().unwrap(), payload);
    }

    #[test]
    fn test_orphan_file_removed_on_startup() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();
            cache.set("keep", b"v").unwrap();
        }

        let orphan = dir.path().join("data").join("feedface");
        fs::write(&orphan, b"stray").unwrap();

        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();
        assert!(!orphan.exists());
        assert!(cache.contains("keep"));
    }

    #[test]
    fn test_row_with_missing_file_dropped_on_startup() {
        let dir = TempDir::new().unwrap();
        {
            let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();
            cache.set("gone", &vec![b'x'; 500]).unwrap();
        }

        fs::remove_file(dir.path().join("data").join(BlobStore::filename_for("gone"))).unwrap();

        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();
        assert!(!cache.contains("gone"));
    }

    #[test]
    fn test_unreadable_blob_degrades_to_miss_and_drops_row() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("k", &vec![b'x'; 500]).unwrap();
        fs::remove_file(dir.path().join("data").join(BlobStore::filename_for("k"))).unwrap();

        assert_eq!(cache.get("k").unwrap(), None);
        assert!(!cache.contains("k"));
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_trash_swept_on_startup() {
        let dir = TempDir::new().unwrap();
        {
            let _cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();
        }
        let leftover = dir.path().join("trash").join("deadbeef.0");
        fs::write(&leftover, b"junk").unwrap();

        let _cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();
        // The sweep runs on the worker; give it a moment.
        for _ in 0..50 {
            if !leftover.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!leftover.exists());
    }

    #[test]
    fn test_second_instance_on_same_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        let second = DiskCache::with_config(dir.path(), quiet_config());
        assert!(matches!(second, Err(Error::Locked(_))));
    }

    #[test]
    fn test_trim_to_count_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("a", b"1").unwrap();
        cache.set("b", b"2").unwrap();
        cache.set("c", b"3").unwrap();

        cache.trim_to_count(2).unwrap();

        assert_eq!(cache.total_count(), 2);
        // Same-second writes evict in insertion order.
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_trim_to_cost_respects_budget() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        for i in 0..5 {
            cache.set(&format!("k{}", i), &vec![b'x'; 100]).unwrap();
        }

        cache.trim_to_cost(250).unwrap();

        assert!(cache.total_cost() <= 250);
        assert!(cache.contains("k4"));
    }

    #[test]
    fn test_trim_to_age_removes_stale_entries() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("stale", &vec![b'x'; 500]).unwrap();
        thread::sleep(Duration::from_millis(2100));
        cache.set("fresh", b"new").unwrap();

        cache.trim_to_age(Duration::from_secs(1)).unwrap();

        assert!(!cache.contains("stale"));
        assert!(cache.contains("fresh"));
        assert!(!dir
            .path()
            .join("data")
            .join(BlobStore::filename_for("stale"))
            .exists());
    }

    #[test]
    fn test_clear_empties_store() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("a", b"1").unwrap();
        cache.set("b", &vec![b'x'; 500]).unwrap();

        cache.clear().unwrap();

        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
        assert!(!cache.contains("a"));
        assert!(fs::read_dir(dir.path().join("data")).unwrap().next().is_none());
    }

    #[test]
    fn test_clear_with_progress_reports_batches() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        for i in 0..40 {
            cache.set(&format!("k{}", i), b"v").unwrap();
        }
        cache.set("ext", &vec![b'x'; 500]).unwrap();

        let mut ticks = Vec::new();
        cache
            .clear_with_progress(|removed, total| ticks.push((removed, total)))
            .unwrap();

        // 41 entries in batches of 16: three partial ticks plus the final one.
        assert_eq!(ticks, vec![(16, 41), (32, 41), (41, 41)]);
        assert_eq!(cache.total_count(), 0);
        assert!(!dir
            .path()
            .join("data")
            .join(BlobStore::filename_for("ext"))
            .exists());
    }

    #[test]
    fn test_clear_with_progress_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        let mut ticks = 0;
        cache.clear_with_progress(|_, _| ticks += 1).unwrap();

        assert_eq!(ticks, 0);
    }

    #[test]
    fn test_entry_exposes_row_shape() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), small_threshold_config(64)).unwrap();

        cache.set("small", b"abc").unwrap();
        cache.set("large", &vec![b'x'; 500]).unwrap();

        let small = cache.entry("small").unwrap().unwrap();
        assert_eq!(small.filename, None);
        assert_eq!(small.inline_data.as_deref(), Some(b"abc".as_ref()));
        assert_eq!(small.size, 3);

        let large = cache.entry("large").unwrap().unwrap();
        assert_eq!(large.filename, Some(BlobStore::filename_for("large")));
        assert_eq!(large.inline_data, None);
        assert_eq!(large.size, 500);
        assert!(large.modification_time > 0);

        assert!(cache.entry("missing").unwrap().is_none());
    }

    #[test]
    fn test_extended_data_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache
            .set_with_extended("k", b"value", Some(b"metadata"))
            .unwrap();

        assert_eq!(cache.get_extended("k").unwrap().unwrap(), b"metadata");
        assert_eq!(cache.get("k").unwrap().unwrap(), b"value");
        assert_eq!(cache.get_extended("unset").unwrap(), None);
    }

    #[test]
    fn test_empty_key_is_neutral() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("", b"ignored").unwrap();
        assert!(!cache.contains(""));
        assert_eq!(cache.get("").unwrap(), None);
        assert_eq!(cache.total_count(), 0);
        cache.remove("").unwrap();
    }

    #[test]
    fn test_async_set_then_get_callback() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        let (tx, rx) = mpsc::channel();
        cache.set_async("k", b"async value".to_vec(), move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        let (tx, rx) = mpsc::channel();
        cache.get_async("k", move |result| {
            tx.send(result.unwrap()).unwrap();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(),
            b"async value"
        );

        let (tx, rx) = mpsc::channel();
        cache.get_async("missing", move |result| {
            tx.send(result.unwrap()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), None);
    }

    #[test]
    fn test_async_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("a", b"1").unwrap();
        cache.set("b", b"2").unwrap();

        let (tx, rx) = mpsc::channel();
        cache.remove_async("a", move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!cache.contains("a"));

        let (tx, rx) = mpsc::channel();
        cache.clear_async(move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_auto_trim_loop_enforces_count_limit() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(
            dir.path(),
            DiskCacheConfig {
                count_limit: 2,
                auto_trim_interval: Duration::from_millis(30),
                ..Default::default()
            },
        )
        .unwrap();

        for i in 0..6 {
            cache.set(&format!("k{}", i), b"v").unwrap();
        }

        for _ in 0..100 {
            if cache.total_count() <= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.total_count() <= 2);
    }

    #[test]
    fn test_flush_succeeds() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::with_config(dir.path(), quiet_config()).unwrap();

        cache.set("k", b"v").unwrap();
        cache.get("k").unwrap();
        cache.flush().unwrap();
    }
}
