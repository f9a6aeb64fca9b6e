//! Memory cache tier
//!
//! Cost-, count- and age-bounded concurrent LRU built on [`LruIndex`], with a
//! background trim loop, host pressure hooks, and controlled release of
//! evicted values.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::lru::{Evicted, LruIndex};
use crate::release::{MainThreadExecutor, ReleasePool};

/// Host pressure callback; receives the tier it was registered on.
///
/// Invoked after the clear triggered by the corresponding signal. Calling
/// back into the cache from the invoking thread is not supported; such calls
/// are detected best-effort and return neutral results.
pub type PressureCallback<V> = Arc<dyn Fn(&MemoryCache<V>) + Send + Sync>;

/// Configuration for [`MemoryCache`]. Limits default to unlimited.
///
/// Limits are advisory: an over-limit insert evicts immediately, but age
/// trimming happens on the background tick.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries kept.
    pub count_limit: usize,
    /// Maximum total cost kept.
    pub cost_limit: usize,
    /// Maximum entry age; `None` means unlimited.
    pub age_limit: Option<Duration>,
    /// Period of the background trim loop. Zero disables the loop.
    pub auto_trim_interval: Duration,
    /// Clear the tier when the host reports memory pressure.
    pub clear_on_low_memory: bool,
    /// Clear the tier when the host moves to the background.
    pub clear_on_background: bool,
    /// Route final release of evicted values through the registered
    /// main-thread executor. Falls back to the release thread when no
    /// executor is registered.
    pub release_on_main_thread: bool,
    /// Hand evicted values to the release thread instead of dropping them on
    /// the caller thread.
    pub release_asynchronously: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: usize::MAX,
            cost_limit: usize::MAX,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
            clear_on_low_memory: true,
            clear_on_background: true,
            release_on_main_thread: false,
            release_asynchronously: true,
        }
    }
}

/// Point-in-time copy of the tier's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries removed by limit trimming.
    pub evictions: u64,
    /// Inserts and replacements.
    pub inserts: u64,
}

struct Shared<V> {
    index: Mutex<LruIndex<V>>,
    config: MemoryCacheConfig,
    release: ReleasePool<V>,
    main_thread: RwLock<Option<MainThreadExecutor>>,
    low_memory_cb: RwLock<Option<PressureCallback<V>>>,
    background_cb: RwLock<Option<PressureCallback<V>>>,
    shutdown: Mutex<bool>,
    trim_signal: Condvar,
    pressure_active: AtomicBool,
    pressure_thread: Mutex<Option<ThreadId>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

impl<V: Send + 'static> Shared<V> {
    /// Destroy evicted entries according to the release configuration.
    /// Never called with the index lock held.
    fn dispatch_release(&self, batch: Vec<Evicted<V>>) {
        if batch.is_empty() {
            return;
        }
        if self.config.release_on_main_thread {
            if let Some(exec) = self.main_thread.read().clone() {
                exec(Box::new(move || drop(batch)));
                return;
            }
        }
        if self.config.release_asynchronously {
            self.release.submit(batch);
        } else {
            drop(batch);
        }
    }

    fn trim_to_count(&self, count: usize) {
        let mut batch = Vec::new();
        {
            let mut index = self.index.lock();
            while index.len() > count {
                match index.pop_tail() {
                    Some(evicted) => {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        batch.push(evicted);
                    }
                    None => break,
                }
            }
        }
        self.dispatch_release(batch);
    }

    fn trim_to_cost(&self, cost: usize) {
        let mut batch = Vec::new();
        {
            let mut index = self.index.lock();
            while index.total_cost() > cost {
                match index.pop_tail() {
                    Some(evicted) => {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        batch.push(evicted);
                    }
                    None => break,
                }
            }
        }
        self.dispatch_release(batch);
    }

    fn trim_to_age(&self, age: Duration) {
        let mut batch = Vec::new();
        {
            let mut index = self.index.lock();
            // Access times increase toward the head, so the first tail entry
            // inside the budget ends the pass.
            while let Some(accessed) = index.tail_accessed() {
                if accessed.elapsed() <= age {
                    break;
                }
                match index.pop_tail() {
                    Some(evicted) => {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        batch.push(evicted);
                    }
                    None => break,
                }
            }
        }
        self.dispatch_release(batch);
    }

    fn trim_pass(&self) {
        self.trim_to_cost(self.config.cost_limit);
        self.trim_to_count(self.config.count_limit);
        if let Some(age) = self.config.age_limit {
            self.trim_to_age(age);
        }
    }

    fn is_reentrant(&self) -> bool {
        if !self.pressure_active.load(Ordering::Acquire) {
            return false;
        }
        *self.pressure_thread.lock() == Some(thread::current().id())
    }
}

/// Guard marking the current thread as inside a pressure callback.
struct PressureGuard<'a, V> {
    shared: &'a Shared<V>,
}

impl<'a, V> PressureGuard<'a, V> {
    fn enter(shared: &'a Shared<V>) -> Self {
        *shared.pressure_thread.lock() = Some(thread::current().id());
        shared.pressure_active.store(true, Ordering::Release);
        Self { shared }
    }
}

impl<V> Drop for PressureGuard<'_, V> {
    fn drop(&mut self) {
        self.shared.pressure_active.store(false, Ordering::Release);
        *self.shared.pressure_thread.lock() = None;
    }
}

/// Concurrent in-memory LRU tier.
///
/// All methods are thread-safe. One mutex guards the index and counters;
/// value destructors never run under it.
pub struct MemoryCache<V> {
    shared: Arc<Shared<V>>,
    trimmer: Option<JoinHandle<()>>,
}

impl<V: Send + 'static> MemoryCache<V> {
    /// Create a tier with default (unlimited) configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    /// Create a tier and start its background trimmer (unless the trim
    /// interval is zero).
    pub fn with_config(config: MemoryCacheConfig) -> Self {
        let interval = config.auto_trim_interval;
        let shared = Arc::new(Shared {
            index: Mutex::new(LruIndex::new()),
            config,
            release: ReleasePool::new(),
            main_thread: RwLock::new(None),
            low_memory_cb: RwLock::new(None),
            background_cb: RwLock::new(None),
            shutdown: Mutex::new(false),
            trim_signal: Condvar::new(),
            pressure_active: AtomicBool::new(false),
            pressure_thread: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        });

        let trimmer = (!interval.is_zero()).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || loop {
                {
                    let mut shutdown = shared.shutdown.lock();
                    if *shutdown {
                        break;
                    }
                    let _ = shared.trim_signal.wait_for(&mut shutdown, interval);
                    if *shutdown {
                        break;
                    }
                }
                shared.trim_pass();
            })
        });

        Self { shared, trimmer }
    }

    /// Whether the key is present. Does not refresh recency.
    pub fn contains(&self, key: &str) -> bool {
        if key.is_empty() || self.shared.is_reentrant() {
            return false;
        }
        self.shared.index.lock().contains(key)
    }

    /// Insert or replace with cost 0.
    pub fn set(&self, key: &str, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert or replace; on replace the old cost is subtracted. Evicts from
    /// the tail if the insert pushed the tier over its count or cost limit.
    pub fn set_with_cost(&self, key: &str, value: V, cost: usize) {
        if key.is_empty() || self.shared.is_reentrant() {
            return;
        }
        let mut batch = Vec::new();
        {
            let mut index = self.shared.index.lock();
            if let Some(replaced) = index.insert(key, value, cost) {
                batch.push(replaced);
            }
            self.shared.inserts.fetch_add(1, Ordering::Relaxed);
            while !index.is_empty()
                && (index.len() > self.shared.config.count_limit
                    || index.total_cost() > self.shared.config.cost_limit)
            {
                match index.pop_tail() {
                    Some(evicted) => {
                        self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                        batch.push(evicted);
                    }
                    None => break,
                }
            }
        }
        self.shared.dispatch_release(batch);
    }

    /// Remove a key. The value is released per the release configuration.
    pub fn remove(&self, key: &str) {
        if key.is_empty() || self.shared.is_reentrant() {
            return;
        }
        let removed = self.shared.index.lock().remove(key);
        if let Some(evicted) = removed {
            self.shared.dispatch_release(vec![evicted]);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if self.shared.is_reentrant() {
            return;
        }
        let batch = self.shared.index.lock().drain();
        self.shared.dispatch_release(batch);
    }

    /// Evict tail-first until at most `count` entries remain.
    pub fn trim_to_count(&self, count: usize) {
        if self.shared.is_reentrant() {
            return;
        }
        self.shared.trim_to_count(count);
    }

    /// Evict tail-first until the total cost is at most `cost`.
    pub fn trim_to_cost(&self, cost: usize) {
        if self.shared.is_reentrant() {
            return;
        }
        self.shared.trim_to_cost(cost);
    }

    /// Evict every entry whose last access is older than `age`.
    pub fn trim_to_age(&self, age: Duration) {
        if self.shared.is_reentrant() {
            return;
        }
        self.shared.trim_to_age(age);
    }

    /// Number of live entries.
    pub fn total_count(&self) -> usize {
        self.shared.index.lock().len()
    }

    /// Sum of the costs of live entries.
    pub fn total_cost(&self) -> usize {
        self.shared.index.lock().total_cost()
    }

    /// Lookups that found a live entry.
    pub fn hits(&self) -> u64 {
        self.shared.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    pub fn misses(&self) -> u64 {
        self.shared.misses.load(Ordering::Relaxed)
    }

    /// Entries removed by limit trimming.
    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }

    /// Inserts and replacements.
    pub fn inserts(&self) -> u64 {
        self.shared.inserts.load(Ordering::Relaxed)
    }

    /// Hit ratio in `[0.0, 1.0]`; 0.0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Copy all counters at once.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            inserts: self.inserts(),
        }
    }

    /// The configuration this tier was built with.
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.shared.config
    }

    /// Register the executor used when `release_on_main_thread` is set.
    pub fn set_main_thread_executor(&self, exec: Option<MainThreadExecutor>) {
        *self.shared.main_thread.write() = exec;
    }

    /// Register a callback invoked after a low-memory clear.
    pub fn set_low_memory_callback(&self, cb: Option<PressureCallback<V>>) {
        *self.shared.low_memory_cb.write() = cb;
    }

    /// Register a callback invoked after a backgrounding clear.
    pub fn set_background_callback(&self, cb: Option<PressureCallback<V>>) {
        *self.shared.background_cb.write() = cb;
    }

    /// Host signal: memory pressure. Clears the tier (if configured), then
    /// invokes the registered callback.
    pub fn on_low_memory(&self) {
        if self.shared.config.clear_on_low_memory {
            debug!("clearing memory tier on low-memory signal");
            self.clear();
        }
        let cb = self.shared.low_memory_cb.read().clone();
        if let Some(cb) = cb {
            let _guard = PressureGuard::enter(&self.shared);
            cb(self);
        }
    }

    /// Host signal: application moved to the background. Clears the tier
    /// (if configured), then invokes the registered callback.
    pub fn on_background(&self) {
        if self.shared.config.clear_on_background {
            debug!("clearing memory tier on background signal");
            self.clear();
        }
        let cb = self.shared.background_cb.read().clone();
        if let Some(cb) = cb {
            let _guard = PressureGuard::enter(&self.shared);
            cb(self);
        }
    }
}

impl<V: Clone + Send + 'static> MemoryCache<V> {
    /// Look up a value; refreshes its access time and moves it to the front.
    pub fn get(&self, key: &str) -> Option<V> {
        if key.is_empty() || self.shared.is_reentrant() {
            return None;
        }
        let mut index = self.shared.index.lock();
        match index.get(key) {
            Some(value) => {
                let value = value.clone();
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl<V: Send + 'static> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.trim_signal.notify_all();
        if let Some(handle) = self.trimmer.take() {
            let _ = handle.join();
        }
    }
}
