//! Persistent store shared by every context
//!
//! Each context opens its own connection to the same SQLite file. WAL mode
//! lets readers in one context proceed while another commits, and the busy
//! timeout serializes writers across processes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{
    params, Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior,
};

use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::journal::ChangeJournal;
use crate::schema::{AppSchema, SCHEMA_VERSION};

/// One context's connection to the shared store.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the store file described by `config`.
    pub fn open(config: &StoreConfig, schema: &AppSchema) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.path)
            .map_err(|e| SyncError::Storage(format!("open {}: {}", config.path.display(), e)))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| SyncError::Storage(format!("busy_timeout: {}", e)))?;
        let store = Self::init_with_connection(conn, Some(config.path.clone()), schema)?;
        tracing::info!("Opened store at {:?}", config.path);
        Ok(store)
    }

    /// Open a store at `path` with default settings.
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = StoreConfig {
            path: path.to_path_buf(),
            ..StoreConfig::default()
        };
        Self::open(&config, &AppSchema::default())
    }

    /// Private in-memory store (single context only, for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("open_in_memory: {}", e)))?;
        Self::init_with_connection(conn, None, &AppSchema::default())
    }

    fn init_with_connection(
        mut conn: Connection,
        path: Option<PathBuf>,
        schema: &AppSchema,
    ) -> Result<Self> {
        Self::init_schema(&mut conn, schema)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn init_schema(conn: &mut Connection, schema: &AppSchema) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )
        .map_err(|e| SyncError::Storage(format!("pragmas: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SyncError::Storage(format!("begin schema tx: {}", e)))?;
        tx.execute_batch(&schema.create_tables())
            .map_err(|e| SyncError::Storage(format!("init_schema: {}", e)))?;
        let recorded: Option<u32> = tx
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| SyncError::Storage(format!("schema_version: {}", e)))?;
        match recorded {
            None => {
                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(|e| SyncError::Storage(format!("record schema_version: {}", e)))?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(SyncError::Storage(format!(
                    "store schema version {} is newer than supported {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }
        tx.commit()
            .map_err(|e| SyncError::Storage(format!("commit schema: {}", e)))?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Storage(e.to_string()))
    }

    /// Run a raw statement, returning the number of rows changed.
    ///
    /// Nothing is journaled: views will not hear about writes made here.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(sql, params)
            .map_err(|e| SyncError::Storage(format!("execute: {} (sql: {})", e, sql)))
    }

    /// Run a batch of raw statements without parameters.
    pub fn execute_all(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| SyncError::Storage(format!("execute_all: {}", e)))
    }

    /// Read every row of a query through `map`.
    pub fn get_all<T, P, F>(&self, sql: &str, params: P, mut map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| SyncError::Storage(format!("prepare query: {} (sql: {})", e, sql)))?;
        let rows = stmt
            .query_map(params, |row| map(row))
            .map_err(|e| SyncError::Storage(format!("query: {}", e)))?
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|e| SyncError::Storage(format!("row: {}", e)))?;
        Ok(rows)
    }

    /// Read at most one row.
    pub fn get_optional<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.lock()?;
        conn.query_row(sql, params, map)
            .optional()
            .map_err(|e| SyncError::Storage(format!("query_row: {}", e)))
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    ///
    /// Anything `f` writes, journal entries included, becomes visible to
    /// other contexts atomically or not at all.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`) so a writer that
    /// reads before writing waits out the busy timeout instead of failing
    /// with `SQLITE_BUSY` when another context committed in between.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SyncError::Storage(format!("begin tx: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| SyncError::Storage(format!("commit: {}", e)))?;
        Ok(value)
    }

    /// Run `f` against the change journal.
    pub fn with_journal<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ChangeJournal<'_>) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&ChangeJournal::new(&conn))
    }

    /// Latest journal sequence number visible to this connection.
    pub fn journal_head(&self) -> Result<u64> {
        self.with_journal(|j| j.head())
    }

    /// Schema version recorded in the store.
    pub fn schema_version(&self) -> Result<u32> {
        self.get_optional("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, u32>(0)
        })?
        .ok_or_else(|| SyncError::Storage("schema_version missing".into()))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}
