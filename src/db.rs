use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Ordered migrations; the index + 1 is the schema version they produce.
const MIGRATIONS: &[(&str, &str)] = &[(
    "create_tables",
    include_str!("../migrations/2026-10-01-000000_create_tables/up.sql"),
)];

/// Default busy timeout when none is configured.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outcome of an insert used as a claim on a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller inserted the row and owns the side effect
    Claimed,
    /// The unique key already existed
    AlreadyClaimed,
}

/// Database manager for handling connections and operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) a file-backed database pool
    pub fn open(path: &Path, max_connections: u32, busy_timeout: Duration) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| CoreError::InvalidConfig(format!("cannot create {}: {e}", parent.display())))?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| configure(conn, busy_timeout));
        let pool = Pool::builder().max_size(max_connections.max(1)).build(manager)?;

        let database = Self { pool };
        database.run_migrations()?;
        info!(path = %path.display(), "database opened");
        Ok(database)
    }

    /// Open with default pool settings
    pub fn open_default(path: &Path) -> Result<Self> {
        Self::open(path, 8, DEFAULT_BUSY_TIMEOUT)
    }

    /// Single-connection in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let manager =
            SqliteConnectionManager::memory().with_init(|conn| configure(conn, DEFAULT_BUSY_TIMEOUT));
        // Every in-memory connection is its own database, so the pool must hold exactly one.
        let pool = Pool::builder().max_size(1).build(manager)?;
        let database = Self { pool };
        database.run_migrations()?;
        Ok(database)
    }

    /// Run pending migrations tracked by `PRAGMA user_version`
    fn run_migrations(&self) -> Result<()> {
        let conn = self.get_connection()?;
        let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (index, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = index as u32 + 1;
            if version <= current {
                continue;
            }
            debug!(version, name, "applying migration");
            conn.execute_batch(sql)?;
            conn.pragma_update(None, "user_version", version)?;
        }

        let target = MIGRATIONS.len() as u32;
        if current > target {
            return Err(CoreError::InvalidConfig(format!(
                "database schema v{current} is newer than supported v{target}"
            )));
        }
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside an immediate (write-locking) transaction and commit on success.
    ///
    /// Taking the write lock up front means concurrent writers queue on the busy
    /// timeout instead of failing when a read transaction tries to upgrade.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Configure SQLite pragmas on every pooled connection.
fn configure(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
}

/// Map an insert result onto a claim, treating a unique violation as "already claimed".
pub fn claim_from_insert(result: rusqlite::Result<usize>) -> Result<Claim> {
    match result {
        Ok(0) => Ok(Claim::AlreadyClaimed),
        Ok(_) => Ok(Claim::Claimed),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Ok(Claim::AlreadyClaimed)
        }
        Err(other) => Err(other.into()),
    }
}

/// Store an instant as epoch milliseconds
#[must_use]
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Read an instant stored as epoch milliseconds
#[must_use]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
