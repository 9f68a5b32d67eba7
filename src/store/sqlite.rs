//! SQLite Record Store
//!
//! Reads draw from a bounded pool of connections so they run in parallel;
//! SQLite's own locking keeps them consistent with the replication layer
//! writing underneath a read-only replica. On the primary a single writer
//! connection, opened at startup, serializes inserts.
//!
//! Pooled connections are opened on first use, so a replica whose database
//! has not been replicated yet still starts and reports the failure per
//! request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};

use super::{Record, RecordId, RecordStore, StoreMode};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::topology::NodeRole;

/// VM instructions between cancellation checks
const PROGRESS_INTERVAL: i32 = 1000;

const CREATE_SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS records (id INTEGER PRIMARY KEY, value TEXT NOT NULL)";

/// Record store backed by a local SQLite database
pub struct SqliteStore {
    /// Read connections, opened on demand
    readers: Pool<SqliteConnectionManager>,
    /// Write connection; only a read-write store has one
    writer: Option<Arc<Mutex<Connection>>>,
    /// Access mode
    mode: StoreMode,
    /// Data source connections are opened with
    dsn: String,
}

/// Connection a single call runs on
enum Handle {
    Reader(Pool<SqliteConnectionManager>),
    Writer(Arc<Mutex<Connection>>),
}

/// Turn a data source name into a read-only SQLite URI
pub fn read_only_dsn(dsn: &str) -> String {
    let uri = if dsn.starts_with("file:") {
        dsn.to_string()
    } else {
        format!("file:{}", dsn)
    };
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{}{}mode=ro", uri, separator)
}

fn open_flags(mode: StoreMode) -> OpenFlags {
    match mode {
        StoreMode::ReadWrite => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        }
        StoreMode::ReadOnly => {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        }
    }
}

impl SqliteStore {
    /// Open the store in the given mode.
    ///
    /// A read-write store opens its writer immediately. Read connections,
    /// and every connection of a read-only store, are opened on first use.
    pub fn open(config: &DatabaseConfig, mode: StoreMode) -> Result<Self> {
        let dsn = match mode {
            StoreMode::ReadWrite => config.dsn.clone(),
            StoreMode::ReadOnly => read_only_dsn(&config.dsn),
        };
        let flags = open_flags(mode);
        let busy_timeout = config.busy_timeout();

        let writer = match mode {
            StoreMode::ReadWrite => {
                let conn = Connection::open_with_flags(&dsn, flags)?;
                conn.busy_timeout(busy_timeout)?;
                Some(Arc::new(Mutex::new(conn)))
            }
            StoreMode::ReadOnly => None,
        };

        let manager = SqliteConnectionManager::file(&dsn)
            .with_flags(flags)
            .with_init(move |conn| conn.busy_timeout(busy_timeout));
        let readers = Pool::builder()
            .max_size(config.max_readers.max(1))
            .min_idle(Some(0))
            .connection_timeout(config.connect_timeout())
            .build_unchecked(manager);

        tracing::debug!(
            "Opened record store {} ({}, up to {} readers)",
            dsn,
            mode,
            config.max_readers
        );

        Ok(Self {
            readers,
            writer,
            mode,
            dsn,
        })
    }

    /// Open the store the way a node with `role` needs it.
    ///
    /// The primary opens read-write and creates the schema if missing.
    /// Replicas open read-only and rely on replication for the schema.
    pub fn open_for_role(config: &DatabaseConfig, role: NodeRole) -> Result<Self> {
        let store = Self::open(config, StoreMode::from(role))?;
        if role == NodeRole::Primary {
            store.ensure_schema()?;
        }
        Ok(store)
    }

    /// Create the records table if it does not exist
    pub fn ensure_schema(&self) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::Internal("read-only record store cannot create the schema".into()))?;
        let conn = writer
            .lock()
            .map_err(|_| Error::Internal("record store connection poisoned".into()))?;
        conn.execute_batch(CREATE_SCHEMA)?;
        Ok(())
    }

    /// Get the access mode
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Get the data source the store was opened with
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Close the store, reporting any error SQLite raises closing the writer.
    ///
    /// Read connections close as the pool drops.
    pub fn close(self) -> Result<()> {
        drop(self.readers);

        let Some(writer) = self.writer else {
            return Ok(());
        };
        let conn = Arc::try_unwrap(writer)
            .map_err(|_| Error::Internal("record store still in use".into()))?
            .into_inner()
            .map_err(|_| Error::Internal("record store connection poisoned".into()))?;
        conn.close().map_err(|(_, e)| Error::Database(e))
    }

    /// Run a read on a pooled connection
    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(Handle::Reader(self.readers.clone()), op).await
    }

    /// Run a write on the writer connection.
    ///
    /// A read-only store has no writer; the write goes to a read connection
    /// and SQLite refuses it.
    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = match &self.writer {
            Some(writer) => Handle::Writer(Arc::clone(writer)),
            None => Handle::Reader(self.readers.clone()),
        };
        self.call(handle, op).await
    }

    /// Run a statement on the blocking pool.
    ///
    /// If the returned future is dropped, the statement is interrupted at
    /// its next progress check, or skipped if it has not started.
    async fn call<T, F>(&self, handle: Handle, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = CancelOnDrop::new();
        let cancelled = guard.flag();

        let result = tokio::task::spawn_blocking(move || {
            if cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }

            match handle {
                Handle::Reader(pool) => {
                    let conn = pool.get()?;
                    run_interruptible(&conn, cancelled, op)
                }
                Handle::Writer(writer) => {
                    let conn = writer
                        .lock()
                        .map_err(|_| Error::Internal("record store connection poisoned".into()))?;
                    run_interruptible(&conn, cancelled, op)
                }
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("record store task failed: {}", e)))?;

        drop(guard);
        result
    }
}

fn run_interruptible<T, F>(conn: &Connection, cancelled: Arc<AtomicBool>, op: F) -> Result<T>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
{
    if cancelled.load(Ordering::Acquire) {
        return Err(Error::Cancelled);
    }

    conn.progress_handler(PROGRESS_INTERVAL, Some(move || cancelled.load(Ordering::Acquire)));
    let result = op(conn);
    conn.progress_handler(0, None::<fn() -> bool>);

    result.map_err(map_sqlite_error)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn records(&self) -> Result<Vec<Record>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT id, value FROM records ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                let value = row.get_ref(1)?.as_bytes().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                })?;
                Ok(Record {
                    id: row.get(0)?,
                    value: value.to_vec(),
                })
            })?;

            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn insert(&self, value: &[u8]) -> Result<RecordId> {
        let value = value.to_vec();
        self.write(move |conn| {
            // Bound as TEXT without UTF-8 validation so the bytes are kept verbatim.
            conn.execute(
                "INSERT INTO records (value) VALUES (?1)",
                params![ToSqlOutput::Borrowed(ValueRef::Text(&value))],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }
}

/// Raises a shared flag when the owning future goes away
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
}

impl CancelOnDrop {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Release);
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::OperationInterrupted => {
            Error::Cancelled
        }
        other => Error::Database(other),
    }
}
