use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::MemKeeperError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "memkeeper.db";
const POOL_MAX_SIZE: u32 = 8;

/// Pragmas applied to every pooled connection.
/// WAL lets readers proceed while a writer holds the IMMEDIATE lock, and the busy
/// timeout makes writers from other processes wait instead of failing outright.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA busy_timeout = 5000;
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
";

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the SQLite database backing the job queue and the outcome log.
///
/// Cheap to clone: clones share the underlying connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database file inside `db_folder`
    pub fn connect(db_folder: &Path) -> Result<Self, MemKeeperError> {
        if !db_folder.exists() {
            fs::create_dir_all(db_folder)?;
        }

        if !db_folder.is_dir() {
            return Err(MemKeeperError::Error(format!(
                "Database folder '{}' is not a directory",
                db_folder.display()
            )));
        }

        Self::open(&db_folder.join(DB_FILENAME))
    }

    /// Open (creating if needed) the database at an explicit file path
    pub fn open(db_path: &Path) -> Result<Self, MemKeeperError> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));

        let pool = Pool::builder().max_size(POOL_MAX_SIZE).build(manager)?;

        let db = Self {
            pool,
            path: db_path.to_path_buf(),
        };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;

        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a pooled connection
    pub fn get_connection(&self) -> Result<DbConnection, MemKeeperError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`.
    ///
    /// The IMMEDIATE lock is the database-wide write lock: every read that `f` makes
    /// is consistent with the writes it makes, even against writers in other processes.
    /// Any error returned by `f` rolls the transaction back.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, MemKeeperError>
    where
        F: FnOnce(&Connection) -> Result<T, MemKeeperError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn get_meta_value_locked(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<String>, MemKeeperError> {
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(value)
    }

    pub fn set_meta_value_locked(
        conn: &Connection,
        key: &str,
        value: &str,
    ) -> Result<(), MemKeeperError> {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            [key, value],
        )?;

        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<(), MemKeeperError> {
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

        let stored_version = Self::get_meta_value_locked(conn, "schema_version")?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(MemKeeperError::Error(format!(
                "Schema version mismatch: database is at version {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(MemKeeperError::Error("Schema version missing".to_string())),
        }
    }
}
