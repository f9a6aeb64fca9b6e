//! SQLite-backed metadata index
//!
//! One table tracks every entry: small values inline in the row, large
//! values as external files referenced by `filename`. Exactly one of the two
//! is set per row. WAL journaling with `synchronous=NORMAL`; the schema
//! version lives in `PRAGMA user_version`.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};

/// Schema version recorded in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

/// Deferred access-time updates buffered before a batched write.
const ACCESS_FLUSH_THRESHOLD: usize = 64;

/// One manifest row.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    /// Cache key; primary.
    pub key: String,
    /// External blob file name, or `None` for inline rows.
    pub filename: Option<String>,
    /// Value size in bytes.
    pub size: u64,
    /// Inline value bytes; mutually exclusive with `filename`.
    pub inline_data: Option<Vec<u8>>,
    /// Unix seconds of the last write.
    pub modification_time: i64,
    /// Unix seconds of the last read or write.
    pub last_access_time: i64,
    /// Opaque caller metadata; not interpreted.
    pub extended_data: Option<Vec<u8>>,
}

/// Candidate row for eviction, in ascending access-time order.
pub(crate) struct LruVictim {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

pub(crate) struct Manifest {
    conn: Connection,
    pending_access: Vec<(String, i64)>,
    eager_access: bool,
}

impl Manifest {
    /// Open or create the index, running schema migration if needed.
    pub fn open(path: &Path, eager_access: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => Self::migrate(&conn)?,
            SCHEMA_VERSION => {}
            other => return Err(Error::UnsupportedVersion(other)),
        }

        Ok(Self {
            conn,
            pending_access: Vec::new(),
            eager_access,
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS manifest (
                 key               TEXT PRIMARY KEY,
                 filename          TEXT,
                 size              INTEGER NOT NULL DEFAULT 0,
                 inline_data       BLOB,
                 modification_time INTEGER NOT NULL,
                 last_access_time  INTEGER NOT NULL,
                 extended_data     BLOB
             );
             CREATE INDEX IF NOT EXISTS idx_manifest_last_access
                 ON manifest(last_access_time);
             PRAGMA user_version = 1;",
        )?;
        debug!(version = SCHEMA_VERSION, "created manifest schema");
        Ok(())
    }

    /// Insert or replace a row.
    pub fn upsert(&mut self, rec: &EntryRecord) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO manifest
                 (key, filename, size, inline_data,
                  modification_time, last_access_time, extended_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                 filename = excluded.filename,
                 size = excluded.size,
                 inline_data = excluded.inline_data,
                 modification_time = excluded.modification_time,
                 last_access_time = excluded.last_access_time,
                 extended_data = excluded.extended_data",
        )?;
        stmt.execute(params![
            rec.key,
            rec.filename,
            rec.size as i64,
            rec.inline_data,
            rec.modification_time,
            rec.last_access_time,
            rec.extended_data,
        ])?;
        Ok(())
    }

    /// Fetch a row. Does not refresh its access time.
    pub fn get(&mut self, key: &str) -> Result<Option<EntryRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, filename, size, inline_data,
                    modification_time, last_access_time, extended_data
             FROM manifest WHERE key = ?1",
        )?;
        let rec = stmt
            .query_row(params![key], |row| {
                Ok(EntryRecord {
                    key: row.get(0)?,
                    filename: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    inline_data: row.get(3)?,
                    modification_time: row.get(4)?,
                    last_access_time: row.get(5)?,
                    extended_data: row.get(6)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    /// Refresh a row's access time, eagerly or via the batched buffer.
    pub fn touch(&mut self, key: &str, now: i64) -> Result<()> {
        if self.eager_access {
            let mut stmt = self
                .conn
                .prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")?;
            stmt.execute(params![now, key])?;
            return Ok(());
        }
        self.pending_access.push((key.to_string(), now));
        if self.pending_access.len() >= ACCESS_FLUSH_THRESHOLD {
            self.flush_access()?;
        }
        Ok(())
    }

    /// Apply buffered access-time updates in one transaction.
    pub fn flush_access(&mut self) -> Result<()> {
        if self.pending_access.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_access);
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")?;
            for (key, now) in &pending {
                stmt.execute(params![now, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// `None`: no row. `Some(None)`: inline row. `Some(Some(f))`: external.
    pub fn filename_of(&mut self, key: &str) -> Result<Option<Option<String>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT filename FROM manifest WHERE key = ?1")?;
        let filename = stmt
            .query_row(params![key], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(filename)
    }

    /// Delete a row, reporting its external filename (if the row existed and
    /// was external) so the caller can discard the blob.
    pub fn delete(&mut self, key: &str) -> Result<Option<Option<String>>> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE key = ?1 RETURNING filename")?;
        let filename = stmt
            .query_row(params![key], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(filename)
    }

    pub fn delete_all(&mut self) -> Result<()> {
        self.pending_access.clear();
        self.conn.execute("DELETE FROM manifest", [])?;
        Ok(())
    }

    pub fn contains(&mut self, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM manifest WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |_| Ok(())).optional()?.is_some())
    }

    pub fn count(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM manifest")?
            .query_row([], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn total_size(&mut self) -> Result<u64> {
        let total: i64 = self
            .conn
            .prepare_cached("SELECT COALESCE(SUM(size), 0) FROM manifest")?
            .query_row([], |row| row.get(0))?;
        Ok(total as u64)
    }

    /// Next eviction victims: oldest access first. Ties (same second) break
    /// by insertion order so eviction stays deterministic.
    pub fn lru_batch(&mut self, limit: usize) -> Result<Vec<LruVictim>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, filename, size FROM manifest
             ORDER BY last_access_time ASC, rowid ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LruVictim {
                key: row.get(0)?,
                filename: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut batch = Vec::with_capacity(limit);
        for row in rows {
            batch.push(row?);
        }
        Ok(batch)
    }

    /// Delete every row last accessed before `cutoff`. Returns the number of
    /// rows removed and the external filenames that now need discarding.
    pub fn delete_older_than(&mut self, cutoff: i64) -> Result<(usize, Vec<String>)> {
        let mut filenames = Vec::new();
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT filename FROM manifest
                 WHERE last_access_time < ?1 AND filename IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            for row in rows {
                filenames.push(row?);
            }
        }
        let deleted = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE last_access_time < ?1")?
            .execute(params![cutoff])?;
        Ok((deleted, filenames))
    }

    /// All external filenames referenced by the index.
    pub fn external_filenames(&mut self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT filename FROM manifest WHERE filename IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut filenames = Vec::new();
        for row in rows {
            filenames.push(row?);
        }
        Ok(filenames)
    }

    /// All (key, filename) pairs for rows that reference external blobs.
    pub fn rows_with_files(&mut self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, filename FROM manifest WHERE filename IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Short WAL checkpoint; issued on flush and shutdown.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}
