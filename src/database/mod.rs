pub mod migrations;
pub mod schema;

use crate::error::AppError;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default location of the database file
pub fn default_database_path() -> PathBuf {
    PathBuf::from("./data/fieldsync.db")
}

/// Shared handle to the local database.
///
/// rusqlite connections are not `Sync`, so the connection sits behind a
/// mutex. The lock is never held across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (and creates if needed) the database file with its full schema
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        log::info!("Opened database at {}", path.display());
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AppError> {
        schema::init_schema(&conn)?;
        photo_store::init_photo_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| AppError::Consistency("Database mutex poisoned".to_string()))?;
        f(&guard)
    }

    /// Like `with_conn`, with everything `f` writes committed atomically
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        self.with_conn(|conn| in_transaction(conn, f))
    }
}

/// Runs `f` inside a transaction, or inside the caller's one if already open
pub fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, AppError>,
) -> Result<T, AppError> {
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
