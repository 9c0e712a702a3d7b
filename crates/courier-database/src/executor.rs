//! Async SQLite executor using a dedicated background thread.
//!
//! All statements for one [`AsyncDatabase`] run on a single thread in FIFO
//! order. Only SQL and light row mapping belong inside [`AsyncDatabase::call`]
//! or [`AsyncDatabase::transaction`]; adapter calls and other network I/O must
//! happen between them, never inside.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//!
//! // Business write and its outbox row commit or roll back together.
//! db.transaction(|uow| {
//!     queries::insert_booking(uow, &booking)?;
//!     store.enqueue(uow, event)
//! })
//! .await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::ops::Deref;
use std::path::Path;
use tracing::{debug, info};

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Explicit transaction handed to code that must write atomically with the
/// caller's own rows.
///
/// Opened with `BEGIN IMMEDIATE`, so the write lock is taken up front and a
/// competing connection waits (up to `busy_timeout`) instead of reading a
/// snapshot that is about to change. Dropping without [`commit`](Self::commit)
/// rolls back.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> UnitOfWork<'conn> {
    pub fn begin(conn: &'conn mut Connection) -> DatabaseResult<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Self { tx })
    }

    pub fn commit(self) -> DatabaseResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> DatabaseResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

impl Deref for UnitOfWork<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// Run `f` inside a [`UnitOfWork`], committing on `Ok` and rolling back on `Err`.
pub fn run_in_transaction<T, E, F>(conn: &mut Connection, f: F) -> Result<T, E>
where
    F: FnOnce(&UnitOfWork<'_>) -> Result<T, E>,
    E: From<DatabaseError>,
{
    let uow = UnitOfWork::begin(conn)?;
    let value = f(&uow)?;
    uow.commit()?;
    Ok(value)
}

/// Async SQLite database with a dedicated executor thread.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: tokio_rusqlite::Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (creating if needed) the database at `path` and run pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening async database");

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, path_str).await
    }

    /// Private in-memory database. Each call gets a fresh schema.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Self::initialize(conn, ":memory:".to_string()).await
    }

    async fn initialize(conn: tokio_rusqlite::Connection, path: String) -> DatabaseResult<Self> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            Ok(migrations::run_migrations(conn))
        })
        .await
        .map_err(from_tokio_rusqlite)??;

        info!(path = %path, "Async database initialized");
        Ok(Self { conn, path })
    }

    /// Execute a closure on the executor thread.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.conn.call(move |conn| Ok(f(conn))).await {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure inside an immediate transaction on the executor thread.
    ///
    /// The error type is the caller's so domain errors raised inside `f` roll
    /// the transaction back and come out unchanged.
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DatabaseError> + Send + 'static,
    {
        match self
            .conn
            .call(move |conn| Ok(run_in_transaction(conn, f)))
            .await
        {
            Ok(inner) => inner,
            Err(e) => Err(E::from(from_tokio_rusqlite(e))),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Wait for queued work, then stop the executor thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
