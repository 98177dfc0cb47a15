use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::config::DatabaseConfig;
use crate::error::BacksmithError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the shared SQLite store.
///
/// The database file is opened by several independent OS processes (both
/// privileged services and the unprivileged CLI), so every pooled connection
/// carries a busy timeout and all writes go through `BEGIN IMMEDIATE`.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> Result<Self, BacksmithError> {
        Self::open_path(
            Path::new(&config.path),
            config.busy_timeout(),
            config.pool_size,
        )
    }

    pub fn open_path(
        db_path: &Path,
        busy_timeout: Duration,
        pool_size: u32,
    ) -> Result<Self, BacksmithError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        let db = Database { pool };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, BacksmithError> {
        Ok(self.pool.get()?)
    }

    /// Run `func` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back on error.
    ///
    /// The write lock is taken up front so concurrent writers queue on the
    /// busy timeout instead of failing at commit time.
    pub fn immediate_transaction<T, F>(conn: &Connection, func: F) -> Result<T, BacksmithError>
    where
        F: FnOnce(&Connection) -> Result<T, BacksmithError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match func(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    fn ensure_schema(conn: &Connection) -> Result<(), BacksmithError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(BacksmithError::Error(format!(
                    "Database schema version {} is not supported (expected {})",
                    v, SCHEMA_VERSION
                )))
            }
            None => return Err(BacksmithError::Error("Schema version missing".into())),
        }

        Ok(())
    }
}
