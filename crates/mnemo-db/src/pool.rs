use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mnemo_common::{Error, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::sync::RwLock;
use tracing::info;

use crate::migrations::MIGRATIONS;

const POOL_SIZE: u32 = 5;
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Counters exposed for diagnostics; mirrors what the pool has handed out
/// since startup.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub checkouts: u64,
    pub checkout_errors: u64,
    pub idle_connections: u32,
    pub max_connections: u32,
}

/// Shared handle to the SQLite database.
///
/// All access goes through a fixed-size pool of connections; callers block in
/// `spawn_blocking` when the pool is exhausted, so the async scheduler never
/// stalls on disk. `optimize` takes the write side of the quiesce gate to
/// drain in-flight operations before compacting.
#[derive(Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
    quiesce: Arc<RwLock<()>>,
    checkouts: Arc<AtomicU64>,
    checkout_errors: Arc<AtomicU64>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("opening database at {}", db_path.display());
        let manager = SqliteConnectionManager::file(db_path).with_init(configure_connection);
        Self::build(manager)
    }

    /// Single-connection pool over a shared in-memory database. Used by
    /// tests; a larger pool would see independent empty databases.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(configure_connection);
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .connection_timeout(CHECKOUT_TIMEOUT)
            .build(manager)
            .map_err(|e| Error::Connection(format!("failed to build pool: {e}")))?;
        let db = Self {
            pool,
            quiesce: Arc::new(RwLock::new(())),
            checkouts: Arc::new(AtomicU64::new(0)),
            checkout_errors: Arc::new(AtomicU64::new(0)),
        };
        db.migrate_blocking()?;
        Ok(db)
    }

    fn build(manager: SqliteConnectionManager) -> Result<Self> {
        let pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CHECKOUT_TIMEOUT)
            // Broken connections are detected at checkout and replaced.
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| Error::Connection(format!("failed to build pool: {e}")))?;

        let db = Self {
            pool,
            quiesce: Arc::new(RwLock::new(())),
            checkouts: Arc::new(AtomicU64::new(0)),
            checkout_errors: Arc::new(AtomicU64::new(0)),
        };
        db.migrate_blocking()?;
        Ok(db)
    }

    fn migrate_blocking(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Connection(format!("failed to check out connection: {e}")))?;
        for migration in MIGRATIONS {
            conn.execute_batch(migration.sql)
                .map_err(|e| Error::Connection(format!("migration {} failed: {e}", migration.name)))?;
        }
        Ok(())
    }

    /// Run a closure against a pooled connection on the blocking thread pool.
    /// Holding the read side of the quiesce gate keeps `optimize` out until
    /// the operation finishes.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _gate = self.quiesce.read().await;
        let pool = self.pool.clone();
        let checkouts = self.checkouts.clone();
        let checkout_errors = self.checkout_errors.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| {
                checkout_errors.fetch_add(1, Ordering::Relaxed);
                Error::Connection(format!("failed to check out connection: {e}"))
            })?;
            checkouts.fetch_add(1, Ordering::Relaxed);
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Connection(format!("database task failed: {e}")))?
    }

    /// Run a closure inside an explicit transaction. Any error rolls the
    /// transaction back before it propagates.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::Connection(format!("failed to begin transaction: {e}")))?;
            let value = f(&tx)?;
            tx.commit()
                .map_err(|e| Error::Connection(format!("failed to commit transaction: {e}")))?;
            Ok(value)
        })
        .await
    }

    /// Compact storage and refresh query planner statistics. Waits for every
    /// in-flight operation to drain first.
    pub async fn optimize(&self) -> Result<()> {
        let _drain = self.quiesce.write().await;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| Error::Connection(format!("failed to check out connection: {e}")))?;
            conn.execute_batch("VACUUM; ANALYZE;")
                .map_err(|e| Error::Connection(format!("optimize failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Connection(format!("database task failed: {e}")))?
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkout_errors: self.checkout_errors.load(Ordering::Relaxed),
            idle_connections: state.idle_connections,
            max_connections: self.pool.max_size(),
        }
    }
}

fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Map a rusqlite failure to the storage error taxonomy, preserving the
/// offending statement for query errors.
pub(crate) fn map_sql_error(statement: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Integrity(e.to_string())
        }
        _ => Error::query(statement, e.to_string()),
    }
}
