//! # stratastore
//!
//! Persistent on-disk key-value cache tier.
//!
//! ## Layout
//! - `manifest.db`: SQLite index of every entry (WAL, `synchronous=NORMAL`);
//!   values up to the inline threshold live directly in their row
//! - `data/`: external blob files, named by the hex SHA-256 of the key
//! - `trash/`: blobs pending deletion; swept by the background worker
//! - `.lock`: advisory lock enforcing one live owner per directory
//!
//! Startup reconciles the index with the file store: rows whose blob is
//! missing are dropped and files without a row are removed as orphans.

#![warn(missing_docs)]

mod blobs;
mod error;
mod manifest;
mod store;

pub use error::{Error, Result};
pub use manifest::EntryRecord;
pub use store::{DiskCache, DiskCacheConfig};
