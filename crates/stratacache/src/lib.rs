//! # stratacache
//!
//! Two-tier key-value cache: a fast, bounded in-memory LRU tier
//! ([`stratamem`]) over a larger persistent disk tier ([`stratastore`]).
//!
//! ## Behavior
//! - **Read-through**: `get` serves memory hits immediately; on a miss the
//!   disk tier is consulted and a hit is promoted into memory.
//! - **Write-through**: `set` writes to memory, then to disk.
//! - **Codec seam**: the cache never serializes values itself; a [`Codec`]
//!   supplied at construction converts values to and from bytes.
//! - **Async API**: every operation has an `_async` variant that returns
//!   immediately and completes on a background worker.
//!
//! ```no_run
//! use stratacache::{BytesCodec, Cache, CacheConfig};
//!
//! let cache = Cache::with_name("thumbnails", BytesCodec, CacheConfig::default())?;
//! cache.set("a", b"bytes".to_vec())?;
//! assert!(cache.contains("a"));
//! # Ok::<(), stratacache::Error>(())
//! ```

#![warn(missing_docs)]

mod cache;
mod codec;
mod config;
mod error;
mod worker;

pub use cache::Cache;
pub use codec::{BytesCodec, Codec, CodecError};
pub use config::{CacheConfig, DiskCacheConfig, MemoryCacheConfig};
pub use error::{Error, Result};

pub use stratamem::{MainThreadExecutor, MemoryCache, StatsSnapshot};
pub use stratastore::{DiskCache, EntryRecord};
