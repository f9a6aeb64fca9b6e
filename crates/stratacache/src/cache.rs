//! Two-tier cache facade
//!
//! Read-through / write-through composition of the memory and disk tiers:
//! hits in memory return immediately; disk hits are decoded and promoted
//! into memory; writes go to memory first, then to disk. Every synchronous
//! method has an `_async` counterpart that returns immediately and invokes
//! its completion callback on the facade's background worker.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stratamem::MemoryCache;
use stratastore::DiskCache;
use tracing::debug;

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::worker::Worker;

/// Two-tier key-value cache.
///
/// Values live in memory behind shared handles (`Arc`); the disk tier holds
/// their encoded bytes. One live instance owns the cache directory; opening
/// a second instance on the same path fails.
pub struct Cache<C: Codec> {
    inner: Arc<CacheInner<C>>,
    worker: Worker,
}

struct CacheInner<C: Codec> {
    name: String,
    path: PathBuf,
    memory: MemoryCache<Arc<C::Value>>,
    disk: DiskCache,
    codec: C,
}

impl<C: Codec> CacheInner<C> {
    fn contains(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        // A memory hit short-circuits the disk lookup.
        self.memory.contains(key) || self.disk.contains(key)
    }

    fn get(&self, key: &str) -> Result<Option<Arc<C::Value>>> {
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }
        match self.disk.get(key)? {
            Some(bytes) => {
                let value = Arc::new(self.codec.decode(&bytes).map_err(Error::Codec)?);
                // Promote so the next lookup is served from memory.
                self.memory.set_with_cost(key, Arc::clone(&value), bytes.len());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: C::Value) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let bytes = self.codec.encode(&value).map_err(Error::Codec)?;
        self.memory
            .set_with_cost(key, Arc::new(value), bytes.len());
        self.disk.set(key, &bytes)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        self.memory.remove(key);
        self.disk.remove(key)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.memory.clear();
        self.disk.clear()?;
        Ok(())
    }

    fn clear_with_progress<P: FnMut(u64, u64)>(&self, progress: P) -> Result<()> {
        self.memory.clear();
        self.disk.clear_with_progress(progress)?;
        Ok(())
    }
}

/// Conventional per-user cache directory: `$XDG_CACHE_HOME`, falling back to
/// `$HOME/.cache`.
fn default_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| PathBuf::from(home).join(".cache"))
}

impl<C: Codec> Cache<C> {
    /// Open a cache in the conventional per-user cache directory, under
    /// `name`.
    pub fn with_name(name: &str, codec: C, config: CacheConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        let dir = default_cache_dir().ok_or(Error::CacheDir)?;
        Self::with_path(dir.join(name), codec, config)
    }

    /// Open a cache rooted at `path`, creating the directory as needed.
    ///
    /// The path must have a single live owner; a second instance fails with
    /// a lock error from the disk tier.
    pub fn with_path(path: impl AsRef<Path>, codec: C, config: CacheConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let memory = MemoryCache::with_config(config.memory);
        let disk = DiskCache::with_config(&path, config.disk)?;
        debug!(name = %name, path = %path.display(), "opened two-tier cache");

        Ok(Self {
            inner: Arc::new(CacheInner {
                name,
                path,
                memory,
                disk,
                codec,
            }),
            worker: Worker::new(),
        })
    }

    /// The cache name (final path component).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The directory backing the disk tier.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The underlying memory tier.
    pub fn memory(&self) -> &MemoryCache<Arc<C::Value>> {
        &self.inner.memory
    }

    /// The underlying disk tier.
    pub fn disk(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// Whether the key is present in either tier.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    /// Read a value: memory first, then disk with promotion into memory.
    pub fn get(&self, key: &str) -> Result<Option<Arc<C::Value>>> {
        self.inner.get(key)
    }

    /// Write a value through both tiers (memory, then disk).
    pub fn set(&self, key: &str, value: C::Value) -> Result<()> {
        self.inner.set(key, value)
    }

    /// Delete a key from both tiers.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }

    /// Empty both tiers.
    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    /// [`Cache::clear`] with progress reporting. The memory tier is emptied
    /// first; `progress(removed, total)` then ticks per deleted batch of
    /// disk entries, with no lock held.
    pub fn clear_with_progress<P>(&self, progress: P) -> Result<()>
    where
        P: FnMut(u64, u64),
    {
        self.inner.clear_with_progress(progress)
    }

    /// Host signal: memory pressure. Forwarded to the memory tier.
    pub fn on_low_memory(&self) {
        self.inner.memory.on_low_memory();
    }

    /// Host signal: application backgrounded. Forwarded to the memory tier.
    pub fn on_background(&self) {
        self.inner.memory.on_background();
    }

    /// Async [`Cache::contains`]; the callback runs on the facade worker.
    pub fn contains_async<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(String, bool) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.worker.submit(Box::new(move || {
            let present = inner.contains(&key);
            callback(key, present);
        }));
    }

    /// Async [`Cache::get`]; missing keys yield `Ok(None)`.
    pub fn get_async<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(String, Result<Option<Arc<C::Value>>>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.worker.submit(Box::new(move || {
            let result = inner.get(&key);
            callback(key, result);
        }));
    }

    /// Async [`Cache::set`]; the callback receives the write outcome.
    pub fn set_async<F>(&self, key: &str, value: C::Value, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.worker.submit(Box::new(move || {
            callback(inner.set(&key, value));
        }));
    }

    /// Async [`Cache::remove`].
    pub fn remove_async<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(String, Result<()>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.worker.submit(Box::new(move || {
            let result = inner.remove(&key);
            callback(key, result);
        }));
    }

    /// Async [`Cache::clear`].
    pub fn clear_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.worker.submit(Box::new(move || {
            callback(inner.clear());
        }));
    }

    /// Async [`Cache::clear_with_progress`]; both callbacks run on the
    /// facade worker, `end` last with the overall outcome.
    pub fn clear_with_progress_async<P, F>(&self, progress: P, end: F)
    where
        P: FnMut(u64, u64) + Send + 'static,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.worker.submit(Box::new(move || {
            end(inner.clear_with_progress(progress));
        }));
    }
}
