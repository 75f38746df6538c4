//! SQLite connection pool
//!
//! Every pooled connection is initialized with foreign keys on and the
//! configured busy timeout. File databases run in WAL mode so readers do
//! not block the single writer.

use crate::core::error::{Result, StoreError};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{backup::Backup, Connection, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;

const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(50);

pub type PooledSqlite = PooledConnection<SqliteConnectionManager>;

/// Pooled access to one SQLite database
#[derive(Clone)]
pub struct DatabaseManager {
    pool: Pool<SqliteConnectionManager>,
    location: PathBuf,
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}

impl DatabaseManager {
    /// Open (or create) a database file with up to `pool_size` connections
    pub fn new(path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        if pool_size == 0 {
            return Err(StoreError::InvalidInput("pool size must be positive".into()));
        }
        ensure_parent(path)?;

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )
        });

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(POOL_CHECKOUT_TIMEOUT)
            .build(manager)?;
        Ok(Self {
            pool,
            location: path.to_path_buf(),
        })
    }

    /// Private in-memory database
    ///
    /// Each in-memory connection is a separate database, so the pool holds one.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(POOL_CHECKOUT_TIMEOUT)
            .build(manager)?;
        Ok(Self {
            pool,
            location: PathBuf::from(":memory:"),
        })
    }

    pub fn connection(&self) -> Result<PooledSqlite> {
        Ok(self.pool.get()?)
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connection()?;
        f(&conn)
    }

    /// Run `f` inside a transaction, committing only when it returns `Ok`
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Copy the live database to `target` with the online backup API
    pub fn backup(&self, target: &Path) -> Result<()> {
        ensure_parent(target)?;
        let source = self.connection()?;
        let mut destination = Connection::open(target)?;
        Backup::new(&source, &mut destination)?.run_to_completion(
            BACKUP_PAGES_PER_STEP,
            BACKUP_STEP_PAUSE,
            None,
        )?;
        Ok(())
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn max_connections(&self) -> u32 {
        self.pool.max_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_manager(dir: &TempDir) -> DatabaseManager {
        DatabaseManager::new(&dir.path().join("nested/library.db"), 3, Duration::from_secs(2))
            .unwrap()
    }

    fn count(manager: &DatabaseManager) -> i64 {
        manager
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM probe", [], |r| r.get(0))?))
            .unwrap()
    }

    fn create_probe(manager: &DatabaseManager) {
        manager
            .with_conn(|conn| Ok(conn.execute_batch("CREATE TABLE probe (v INTEGER)")?))
            .unwrap();
    }

    #[test]
    fn test_file_pool_creates_parent_and_uses_wal() {
        let dir = TempDir::new().unwrap();
        let manager = file_manager(&dir);
        assert_eq!(manager.max_connections(), 3);
        let mode: String = manager
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_zero_pool_rejected() {
        let dir = TempDir::new().unwrap();
        let err = DatabaseManager::new(&dir.path().join("x.db"), 0, Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.error_type(), "InvalidInput");
    }

    #[test]
    fn test_in_memory_single_connection() {
        let manager = DatabaseManager::new_in_memory().unwrap();
        assert_eq!(manager.max_connections(), 1);
        assert_eq!(manager.location(), Path::new(":memory:"));
        let fk: i64 = manager
            .with_conn(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_transaction_commits_or_rolls_back() {
        let manager = DatabaseManager::new_in_memory().unwrap();
        create_probe(&manager);

        manager
            .transaction(|tx| Ok(tx.execute("INSERT INTO probe (v) VALUES (1)", [])?))
            .unwrap();
        let failed: Result<()> = manager.transaction(|tx| {
            tx.execute("INSERT INTO probe (v) VALUES (2)", [])?;
            Err(StoreError::InvalidInput("abort".into()))
        });
        assert!(failed.is_err());
        assert_eq!(count(&manager), 1);
    }

    #[test]
    fn test_backup_copies_rows() {
        let dir = TempDir::new().unwrap();
        let manager = file_manager(&dir);
        create_probe(&manager);
        manager
            .with_conn(|conn| Ok(conn.execute("INSERT INTO probe (v) VALUES (7)", [])?))
            .unwrap();

        let target = dir.path().join("backups/copy.db");
        manager.backup(&target).unwrap();

        let copy = Connection::open(&target).unwrap();
        let v: i64 = copy.query_row("SELECT v FROM probe", [], |r| r.get(0)).unwrap();
        assert_eq!(v, 7);
    }
}
