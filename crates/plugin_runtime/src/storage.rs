//! SQLite-backed storage handles.
//!
//! A [`StorageHandle`] owns one writer connection and, for file-backed stores,
//! a read-only connection that observes WAL snapshots. Writes are serialized
//! through the writer; [`StorageHandle::with_transaction`] wraps a closure in a
//! transaction that commits on success and rolls back on any error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use rusqlite::types::Value as SqlValue;

/// A result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store `{0}` is closed")]
    Closed(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Raised by transaction closures to abort the transaction.
    #[error("{0}")]
    Aborted(String),
}

impl StorageError {
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into())
    }
}

/// Where a store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory => f.write_str(":memory:"),
        }
    }
}

struct StorageInner {
    location: StoreLocation,
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    closed: AtomicBool,
}

/// Shared handle to a project or system store.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<StorageInner>,
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageHandle")
            .field("location", &self.inner.location)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StorageHandle {
    /// Opens (creating if needed) a file-backed store in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        writer.pragma_update(None, "foreign_keys", "ON")?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        debug!(path = %path.display(), "opened store");
        Ok(Self::from_parts(
            StoreLocation::File(path.to_path_buf()),
            writer,
            Some(reader),
        ))
    }

    /// Opens a private in-memory store. Reads go through the writer.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self::from_parts(StoreLocation::Memory, writer, None))
    }

    fn from_parts(location: StoreLocation, writer: Connection, reader: Option<Connection>) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                location,
                writer: Mutex::new(writer),
                reader: reader.map(Mutex::new),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Marks the handle closed. Later operations fail with [`StorageError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(location = %self.inner.location, "closed store");
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed(self.inner.location.to_string()))
        } else {
            Ok(())
        }
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.ensure_open()?;
        // A poisoned lock only means a panic mid-statement; sqlite already
        // rolled the statement back, so the connection is still usable.
        Ok(self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.ensure_open()?;
        match &self.inner.reader {
            Some(reader) => Ok(reader.lock().unwrap_or_else(PoisonError::into_inner)),
            None => self.writer(),
        }
    }

    /// Executes a single statement and returns the number of changed rows.
    pub fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StorageError> {
        let conn = self.writer()?;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    /// Executes a batch of parameterless statements.
    pub fn exec_batch(&self, sql: &str) -> Result<(), StorageError> {
        let conn = self.writer()?;
        Ok(conn.execute_batch(sql)?)
    }

    /// Runs a query against the committed state of the store.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        let conn = self.reader()?;
        run_query(&conn, sql, params)
    }

    pub fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StorageError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Runs `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err` or panics.
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut conn = self.writer().map_err(E::from)?;
        let tx = conn
            .transaction()
            .map_err(|e| E::from(StorageError::from(e)))?;
        let scope = Tx { tx };
        match f(&scope) {
            Ok(value) => {
                scope
                    .tx
                    .commit()
                    .map_err(|e| E::from(StorageError::from(e)))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = scope.tx.rollback() {
                    debug!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// A live transaction handed to [`StorageHandle::with_transaction`] closures.
pub struct Tx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Tx<'_> {
    pub fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize, StorageError> {
        Ok(self.tx.execute(sql, params_from_iter(params.iter()))?)
    }

    pub fn exec_batch(&self, sql: &str) -> Result<(), StorageError> {
        Ok(self.tx.execute_batch(sql)?)
    }

    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        run_query(&self.tx, sql, params)
    }

    pub fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StorageError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.tx.last_insert_rowid()
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::new();
        for (idx, name) in names.iter().enumerate() {
            map.insert(name.clone(), column_to_json(row.get_ref(idx)?));
        }
        out.push(map);
    }
    Ok(out)
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}

/// Converts a JSON scalar into a bindable SQL value. Arrays and objects are
/// stored as their JSON text.
pub fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Shorthand for building text parameters.
pub fn text(value: impl Into<String>) -> SqlValue {
    SqlValue::Text(value.into())
}

/// Reads an integer column from a row produced by [`StorageHandle::query`].
pub fn row_i64(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

/// Reads a text column from a row produced by [`StorageHandle::query`].
pub fn row_str<'r>(row: &'r Row, column: &str) -> Option<&'r str> {
    row.get(column).and_then(Value::as_str)
}
