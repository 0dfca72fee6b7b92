//! Embedded persistent store for transactions, hooks and indexed-file metadata.
//!
//! The whole database lives in an in-memory SQLite connection. Mutations only
//! touch memory and mark the store dirty; [`Store::flush`] exports the full
//! image to `<path>.tmp` and renames it over the live file, so the live file
//! is always either the previous image or the next one.
//!
//! A writable store holds an exclusive advisory lock on `<path>.lock` for its
//! whole lifetime: there is exactly one writer per data file.

use crate::cache::{
    CacheCounters, CachedValue, QueryCache, RecordKind, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, STATS_KEY,
};
use crate::fsutil::{self, lock};
use crate::{ActlogError, Result};
use actlog_types::{
    Hook, HookAuthor, HookDocumentation, HookValidation, IndexedFile, MarketplaceInfo, Prompt,
    PromptType, Transaction, TransactionContext, TransactionMetadata, TransactionResult,
};
use rusqlite::backup::Progress;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Most keywords honoured by [`Store::search_text`].
const MAX_SEARCH_TERMS: usize = 8;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    prompt_raw TEXT NOT NULL,
    prompt_type TEXT NOT NULL,
    context TEXT NOT NULL,
    success INTEGER NOT NULL,
    output TEXT,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    tools_used TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_transactions_session
    ON transactions(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_transactions_timestamp
    ON transactions(timestamp);

CREATE TABLE IF NOT EXISTS hooks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    triggers TEXT NOT NULL DEFAULT '[]',
    rag_query TEXT,
    documentation TEXT NOT NULL DEFAULT '{}',
    validation TEXT,
    author TEXT NOT NULL DEFAULT '{}',
    downloads INTEGER NOT NULL DEFAULT 0,
    rating REAL NOT NULL DEFAULT 0.0,
    updated_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_hooks_downloads ON hooks(downloads);

CREATE TABLE IF NOT EXISTS indexed_files (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    indexed_at INTEGER NOT NULL,
    size INTEGER NOT NULL,
    chunks_count INTEGER NOT NULL
);
"#;

const TX_COLUMNS: &str = "id, timestamp, session_id, prompt_raw, prompt_type, context, success, \
                          output, error, duration_ms, tools_used, metadata";

const HOOK_COLUMNS: &str = "id, name, description, version, triggers, rag_query, documentation, \
                            validation, author, downloads, rating, updated_at";

/// Tuning knobs for an open store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Record counts and image size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub transaction_count: u64,
    pub hook_count: u64,
    pub indexed_file_count: u64,
    /// Size of the exported image in bytes.
    pub byte_size: u64,
    /// Greatest `indexedAt` over all indexed files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_index_time: Option<i64>,
}

struct StoreInner {
    conn: Connection,
    cache: QueryCache,
    /// Held for the store's lifetime; closing the file releases the lock.
    writer_lock: Option<File>,
}

/// The store handle. Share it as `Arc<Store>`.
pub struct Store {
    inner: Mutex<StoreInner>,
    path: PathBuf,
    read_only: bool,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl Store {
    /// Open the store at `path` for writing, with default options.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open the store at `path` for writing.
    ///
    /// Loads the existing image if there is one. Fails with
    /// [`ActlogError::CorruptStore`] when the file cannot be read as a store and
    /// with [`ActlogError::StoreLocked`] when another process holds it.
    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let writer_lock = acquire_writer_lock(path)?;
        let existed = path.exists();
        let conn = load_image(path)?;
        let store = Self::from_parts(conn, path, false, Some(writer_lock), options)?;
        // A brand new store is written out on the first flush.
        store.dirty.store(!existed, Ordering::Release);

        info!(target: "actlog::store", "Opened store at {} ({})", path.display(),
            if existed { "loaded" } else { "new" });
        Ok(store)
    }

    /// Load a read-only snapshot of the image at `path`.
    ///
    /// Takes no lock and never flushes; mutations fail with
    /// [`ActlogError::ReadOnly`]. A missing file yields an empty snapshot.
    pub fn open_snapshot(path: &Path) -> Result<Self> {
        let conn = load_image(path)?;
        Self::from_parts(conn, path, true, None, StoreOptions::default())
    }

    fn from_parts(
        conn: Connection,
        path: &Path,
        read_only: bool,
        writer_lock: Option<File>,
        options: StoreOptions,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.set_prepared_statement_cache_capacity(32);
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                cache: QueryCache::new(options.cache_capacity, options.cache_ttl),
                writer_lock,
            }),
            path: path.to_path_buf(),
            read_only,
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether there are mutations not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hit/miss counts of the read cache since open.
    pub fn cache_counters(&self) -> CacheCounters {
        self.lock_raw().cache.counters()
    }

    fn lock_raw(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        if self.is_closed() {
            return Err(ActlogError::StoreClosed);
        }
        Ok(self.lock_raw())
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, StoreInner>> {
        if self.read_only {
            return Err(ActlogError::ReadOnly);
        }
        self.lock()
    }

    fn mark_mutated(&self, inner: &mut StoreInner, kind: RecordKind) {
        self.dirty.store(true, Ordering::Release);
        inner.cache.invalidate(kind);
    }

    /// Serve `key` from the cache or run `query` and memoize its result.
    fn cached_read<T: Clone>(
        &self,
        key: String,
        unwrap: fn(CachedValue) -> Option<T>,
        wrap: fn(T) -> CachedValue,
        query: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock()?;
        if let Some(hit) = inner.cache.get(&key).and_then(unwrap) {
            return Ok(hit);
        }
        let value = query(&inner.conn)?;
        inner.cache.insert(key, wrap(value.clone()));
        Ok(value)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Insert a transaction. Returns `false` when the id already exists.
    pub fn put_transaction(&self, tx: &Transaction, embedding: Option<&[f32]>) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let inserted = {
            let mut stmt = inner.conn.prepare_cached(&format!(
                "INSERT INTO transactions ({}, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                TX_COLUMNS
            ))?;
            let outcome = stmt.execute(params![
                tx.id,
                tx.timestamp,
                tx.session_id,
                tx.prompt.raw,
                tx.prompt.kind.as_str(),
                serde_json::to_string(&tx.context)?,
                tx.result.success,
                tx.result.output,
                tx.result.error,
                i64::try_from(tx.result.duration_ms).unwrap_or(i64::MAX),
                serde_json::to_string(&tx.result.tools_used)?,
                serde_json::to_string(&tx.metadata)?,
                embedding.map(encode_embedding),
            ]);
            match outcome {
                Ok(_) => true,
                Err(e) if is_constraint_violation(&e) => false,
                Err(e) => return Err(e.into()),
            }
        };

        if inserted {
            self.mark_mutated(&mut inner, RecordKind::Transaction);
        } else {
            debug!(target: "actlog::store", "Transaction {} already stored", tx.id);
        }
        Ok(inserted)
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        self.cached_read(
            RecordKind::Transaction.key("get", format_args!("{}", id)),
            |v| match v {
                CachedValue::Transaction(t) => Some(t),
                _ => None,
            },
            CachedValue::Transaction,
            |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM transactions WHERE id = ?1",
                    TX_COLUMNS
                ))?;
                Ok(stmt.query_row(params![id], row_to_transaction).optional()?)
            },
        )
    }

    /// Embedding stored alongside a transaction, if any.
    pub fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare_cached("SELECT embedding FROM transactions WHERE id = ?1")?;
        let blob: Option<Option<Vec<u8>>> = stmt.query_row(params![id], |row| row.get(0)).optional()?;
        Ok(blob.flatten().map(|bytes| decode_embedding(&bytes)))
    }

    /// Delete a transaction by id. Returns whether a record was removed.
    pub fn delete_transaction(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let removed = inner
            .conn
            .prepare_cached("DELETE FROM transactions WHERE id = ?1")?
            .execute(params![id])?;
        if removed > 0 {
            self.mark_mutated(&mut inner, RecordKind::Transaction);
        }
        Ok(removed > 0)
    }

    /// Transactions of one session, newest first.
    pub fn list_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        self.cached_read(
            RecordKind::Transaction.key("session", format_args!("{}:{}", limit, session_id)),
            unwrap_transactions,
            CachedValue::Transactions,
            |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM transactions WHERE session_id = ?1 \
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
                    TX_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![session_id, limit as i64], row_to_transaction)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
    }

    /// Transactions with `start <= timestamp <= end`, newest first.
    pub fn list_by_time_range(
        &self,
        start: i64,
        end: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        self.cached_read(
            RecordKind::Transaction.key(
                "range",
                format_args!("{}:{}:{}:{}", start, end, limit, offset),
            ),
            unwrap_transactions,
            CachedValue::Transactions,
            |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM transactions WHERE timestamp BETWEEN ?1 AND ?2 \
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?3 OFFSET ?4",
                    TX_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        params![start, end, limit as i64, offset as i64],
                        row_to_transaction,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
    }

    /// Keyword search over prompt text and result output, newest first.
    ///
    /// Every whitespace-separated keyword must occur (case-insensitively, as a
    /// substring) in either field. A blank query matches nothing.
    pub fn search_text(&self, query: &str, limit: usize) -> Result<Vec<Transaction>> {
        let terms: Vec<&str> = query.split_whitespace().take(MAX_SEARCH_TERMS).collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        self.cached_read(
            RecordKind::Transaction.key("search", format_args!("{}:{}", limit, terms.join(" "))),
            unwrap_transactions,
            CachedValue::Transactions,
            |conn| {
                let clauses: Vec<String> = (1..=terms.len())
                    .map(|i| {
                        format!(
                            "(prompt_raw LIKE ?{i} ESCAPE '\\' OR COALESCE(output, '') LIKE ?{i} ESCAPE '\\')"
                        )
                    })
                    .collect();
                let sql = format!(
                    "SELECT {} FROM transactions WHERE {} \
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?{}",
                    TX_COLUMNS,
                    clauses.join(" AND "),
                    terms.len() + 1
                );

                let mut values: Vec<Value> = terms
                    .iter()
                    .map(|t| Value::Text(format!("%{}%", escape_like(t))))
                    .collect();
                values.push(Value::Integer(limit as i64));

                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), row_to_transaction)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Insert a hook. Returns `false` when the id or the name is taken.
    pub fn put_hook(&self, hook: &Hook) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let inserted = {
            let mut stmt = inner.conn.prepare_cached(&format!(
                "INSERT INTO hooks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                HOOK_COLUMNS
            ))?;
            let values = hook_values(hook)?;
            match stmt.execute(params_from_iter(values.iter())) {
                Ok(_) => true,
                Err(e) if is_constraint_violation(&e) => false,
                Err(e) => return Err(e.into()),
            }
        };

        if inserted {
            self.mark_mutated(&mut inner, RecordKind::Hook);
        } else {
            debug!(target: "actlog::store", "Hook {} ({}) already stored", hook.id, hook.name);
        }
        Ok(inserted)
    }

    pub fn get_hook(&self, id: &str) -> Result<Option<Hook>> {
        self.cached_read(
            RecordKind::Hook.key("get", format_args!("{}", id)),
            unwrap_hook,
            CachedValue::Hook,
            |conn| {
                let mut stmt =
                    conn.prepare_cached(&format!("SELECT {} FROM hooks WHERE id = ?1", HOOK_COLUMNS))?;
                Ok(stmt.query_row(params![id], row_to_hook).optional()?)
            },
        )
    }

    pub fn get_hook_by_name(&self, name: &str) -> Result<Option<Hook>> {
        self.cached_read(
            RecordKind::Hook.key("name", format_args!("{}", name)),
            unwrap_hook,
            CachedValue::Hook,
            |conn| {
                let mut stmt = conn
                    .prepare_cached(&format!("SELECT {} FROM hooks WHERE name = ?1", HOOK_COLUMNS))?;
                Ok(stmt.query_row(params![name], row_to_hook).optional()?)
            },
        )
    }

    /// All hooks, most downloaded first.
    pub fn list_hooks(&self) -> Result<Vec<Hook>> {
        self.cached_read(
            RecordKind::Hook.key("list", format_args!("")),
            |v| match v {
                CachedValue::Hooks(h) => Some(h),
                _ => None,
            },
            CachedValue::Hooks,
            |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM hooks ORDER BY downloads DESC, name ASC",
                    HOOK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_hook)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            },
        )
    }

    /// Overwrite every field of the hook with `hook.id`.
    ///
    /// Returns `false` when no hook has that id or the new name is taken.
    pub fn update_hook(&self, hook: &Hook) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let updated = {
            let mut stmt = inner.conn.prepare_cached(
                "UPDATE hooks SET name = ?2, description = ?3, version = ?4, triggers = ?5, \
                 rag_query = ?6, documentation = ?7, validation = ?8, author = ?9, \
                 downloads = ?10, rating = ?11, updated_at = ?12 WHERE id = ?1",
            )?;
            let values = hook_values(hook)?;
            match stmt.execute(params_from_iter(values.iter())) {
                Ok(n) => n > 0,
                Err(e) if is_constraint_violation(&e) => false,
                Err(e) => return Err(e.into()),
            }
        };

        if updated {
            self.mark_mutated(&mut inner, RecordKind::Hook);
        }
        Ok(updated)
    }

    pub fn delete_hook(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let removed = inner
            .conn
            .prepare_cached("DELETE FROM hooks WHERE id = ?1")?
            .execute(params![id])?;
        if removed > 0 {
            self.mark_mutated(&mut inner, RecordKind::Hook);
        }
        Ok(removed > 0)
    }

    // =========================================================================
    // Indexed files
    // =========================================================================

    /// Insert or replace the metadata for `file.path`.
    pub fn upsert_indexed_file(&self, file: &IndexedFile) -> Result<()> {
        let mut inner = self.lock_for_write()?;
        inner
            .conn
            .prepare_cached(
                "INSERT INTO indexed_files (path, hash, indexed_at, size, chunks_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(path) DO UPDATE SET hash = excluded.hash, \
                 indexed_at = excluded.indexed_at, size = excluded.size, \
                 chunks_count = excluded.chunks_count",
            )?
            .execute(params![
                file.path,
                file.hash,
                file.indexed_at,
                file.size as i64,
                file.chunks_count as i64,
            ])?;
        self.mark_mutated(&mut inner, RecordKind::IndexedFile);
        Ok(())
    }

    pub fn get_indexed_file(&self, path: &str) -> Result<Option<IndexedFile>> {
        self.cached_read(
            RecordKind::IndexedFile.key("get", format_args!("{}", path)),
            |v| match v {
                CachedValue::IndexedFile(f) => Some(f),
                _ => None,
            },
            CachedValue::IndexedFile,
            |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT path, hash, indexed_at, size, chunks_count FROM indexed_files WHERE path = ?1",
                )?;
                let file = stmt
                    .query_row(params![path], |row| {
                        Ok(IndexedFile {
                            path: row.get("path")?,
                            hash: row.get("hash")?,
                            indexed_at: row.get("indexed_at")?,
                            size: row.get::<_, i64>("size")?.max(0) as u64,
                            chunks_count: row.get::<_, i64>("chunks_count")?.max(0) as u32,
                        })
                    })
                    .optional()?;
                Ok(file)
            },
        )
    }

    pub fn delete_indexed_file(&self, path: &str) -> Result<bool> {
        let mut inner = self.lock_for_write()?;
        let removed = inner
            .conn
            .prepare_cached("DELETE FROM indexed_files WHERE path = ?1")?
            .execute(params![path])?;
        if removed > 0 {
            self.mark_mutated(&mut inner, RecordKind::IndexedFile);
        }
        Ok(removed > 0)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> Result<StoreStats> {
        self.cached_read(
            STATS_KEY.to_string(),
            |v| match v {
                CachedValue::Stats(s) => Some(s),
                _ => None,
            },
            CachedValue::Stats,
            |conn| {
                let count = |table: &str| -> Result<u64> {
                    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
                    Ok(n.max(0) as u64)
                };
                let byte_size: i64 = conn.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                    [],
                    |row| row.get(0),
                )?;
                let last_index_time: Option<i64> =
                    conn.query_row("SELECT MAX(indexed_at) FROM indexed_files", [], |row| row.get(0))?;

                Ok(StoreStats {
                    transaction_count: count("transactions")?,
                    hook_count: count("hooks")?,
                    indexed_file_count: count("indexed_files")?,
                    byte_size: byte_size.max(0) as u64,
                    last_index_time,
                })
            },
        )
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Write the full image to disk via temp-file + rename.
    ///
    /// On failure the store stays dirty so the next cycle retries.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Err(ActlogError::ReadOnly);
        }
        let inner = self.lock()?;
        self.flush_locked(&inner.conn)
    }

    /// Flush only when there are unflushed mutations. Returns whether it wrote.
    pub fn flush_if_dirty(&self) -> Result<bool> {
        if self.read_only || !self.is_dirty() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn flush_locked(&self, conn: &Connection) -> Result<()> {
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        let tmp = fsutil::temp_path_for(&self.path);

        let outcome = write_image(conn, &tmp).and_then(|()| fsutil::replace_file(&tmp, &self.path));
        match outcome {
            Ok(()) => {
                debug!(target: "actlog::store", "Flushed store image to {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                if was_dirty {
                    self.dirty.store(true, Ordering::Release);
                }
                let _ = fsutil::remove_if_exists(&tmp);
                error!(target: "actlog::store", "Flush of {} failed: {}", self.path.display(), e);
                Err(e)
            }
        }
    }

    /// Flush and release the store. Further calls fail with `StoreClosed`.
    ///
    /// Calling it again is a no-op. If the final flush fails the store stays
    /// open so the caller can retry.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock_raw();
        if self.is_closed() {
            return Ok(());
        }
        if !self.read_only {
            self.flush_locked(&inner.conn)?;
        }
        self.closed.store(true, Ordering::Release);
        inner.cache.clear();
        inner.writer_lock = None;
        info!(target: "actlog::store", "Closed store at {}", self.path.display());
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.read_only || self.is_closed() || !self.is_dirty() {
            return;
        }
        warn!(target: "actlog::store", "Store dropped without close, flushing {}", self.path.display());
        if let Err(e) = self.close() {
            error!(target: "actlog::store", "Final flush on drop failed: {}", e);
        }
    }
}

/// Move a corrupt data file aside so a fresh store can be created.
///
/// Returns the path the file was moved to.
pub fn quarantine_corrupt(path: &Path) -> Result<PathBuf> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{}", actlog_types::now_ms()));
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    warn!(target: "actlog::store", "Quarantined corrupt store {} as {}", path.display(), target.display());
    Ok(target)
}

fn acquire_writer_lock(path: &Path) -> Result<File> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    let lock_path = path.with_file_name(name);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    if !lock::try_exclusive(&file)? {
        return Err(ActlogError::StoreLocked(path.to_path_buf()));
    }
    Ok(file)
}

/// Load the image at `path` into a fresh in-memory connection.
fn load_image(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    if !path.exists() {
        return Ok(conn);
    }

    conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)
        .map_err(|e| ActlogError::corrupt(path, e))?;

    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| ActlogError::corrupt(path, e))?;
    if verdict != "ok" {
        return Err(ActlogError::corrupt(path, verdict));
    }
    Ok(conn)
}

/// Export the full image of `conn` to `tmp`, synced to disk.
fn write_image(conn: &Connection, tmp: &Path) -> Result<()> {
    // Leftovers of an interrupted flush would be opened as the backup target.
    for stale in [tmp.to_path_buf(), journal_path(tmp)] {
        fsutil::remove_if_exists(&stale).map_err(|e| ActlogError::write_failure(&stale, e))?;
    }

    conn.backup(DatabaseName::Main, tmp, None)
        .map_err(|e| ActlogError::write_failure(tmp, e))?;
    File::open(tmp)
        .and_then(|f| f.sync_all())
        .map_err(|e| ActlogError::write_failure(tmp, e))?;
    Ok(())
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("-journal");
    path.with_file_name(name)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn unwrap_transactions(v: CachedValue) -> Option<Vec<Transaction>> {
    match v {
        CachedValue::Transactions(t) => Some(t),
        _ => None,
    }
}

fn unwrap_hook(v: CachedValue) -> Option<Option<Hook>> {
    match v {
        CachedValue::Hook(h) => Some(h),
        _ => None,
    }
}

/// Decode a JSON text column.
fn json_column<T: DeserializeOwned>(row: &Row, name: &str) -> rusqlite::Result<T> {
    let text: String = row.get(name)?;
    serde_json::from_str(&text).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    let prompt_type: String = row.get("prompt_type")?;
    let duration_ms: i64 = row.get("duration_ms")?;
    let context: TransactionContext = json_column(row, "context")?;
    let tools_used: Vec<String> = json_column(row, "tools_used")?;
    let metadata: TransactionMetadata = json_column(row, "metadata")?;

    Ok(Transaction {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        session_id: row.get("session_id")?,
        prompt: Prompt {
            raw: row.get("prompt_raw")?,
            kind: PromptType::from_str_lossy(&prompt_type),
        },
        context,
        result: TransactionResult {
            success: row.get("success")?,
            output: row.get("output")?,
            error: row.get("error")?,
            duration_ms: duration_ms.max(0) as u64,
            tools_used,
        },
        metadata,
    })
}

fn hook_values(hook: &Hook) -> Result<Vec<Value>> {
    let validation = match &hook.validation {
        Some(v) => Value::Text(serde_json::to_string(v)?),
        None => Value::Null,
    };
    Ok(vec![
        Value::Text(hook.id.clone()),
        Value::Text(hook.name.clone()),
        Value::Text(hook.description.clone()),
        Value::Text(hook.version.clone()),
        Value::Text(serde_json::to_string(&hook.triggers)?),
        hook.rag_query.clone().map(Value::Text).unwrap_or(Value::Null),
        Value::Text(serde_json::to_string(&hook.documentation)?),
        validation,
        Value::Text(serde_json::to_string(&hook.author)?),
        Value::Integer(hook.marketplace.downloads as i64),
        Value::Real(hook.marketplace.rating),
        Value::Integer(hook.marketplace.updated_at),
    ])
}

fn row_to_hook(row: &Row) -> rusqlite::Result<Hook> {
    let validation: Option<String> = row.get("validation")?;
    let validation: Option<HookValidation> = match validation {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let documentation: HookDocumentation = json_column(row, "documentation")?;
    let author: HookAuthor = json_column(row, "author")?;
    let downloads: i64 = row.get("downloads")?;

    Ok(Hook {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        version: row.get("version")?,
        triggers: json_column(row, "triggers")?,
        rag_query: row.get("rag_query")?,
        documentation,
        validation,
        author,
        marketplace: MarketplaceInfo {
            downloads: downloads.max(0) as u64,
            rating: row.get("rating")?,
            updated_at: row.get("updated_at")?,
        },
    })
}
