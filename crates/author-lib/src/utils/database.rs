// Thread store connection
// One SQLite connection shared by the repository and the event relay

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::schema;

/// Database file name
#[cfg(debug_assertions)]
pub const DATABASE_FILE: &str = "author-dev.db";

#[cfg(not(debug_assertions))]
pub const DATABASE_FILE: &str = "author.db";

const IN_MEMORY: &str = ":memory:";

/// Pragmas applied to on-disk stores. WAL keeps history readable while a turn commits.
const FILE_PRAGMAS: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA busy_timeout=5000;
    PRAGMA synchronous=NORMAL;
    PRAGMA foreign_keys=ON;
"#;

const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create the store at `path`, creating parent directories
    pub fn new(path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                format!("Failed to create database directory {}: {}", parent.display(), e)
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| format!("Failed to open database {}: {}", path.display(), e))?;
        Self::prepare(conn, path, FILE_PRAGMAS)
    }

    /// Private store that disappears with the handle
    pub fn new_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory database: {}", e))?;
        Self::prepare(conn, PathBuf::from(IN_MEMORY), MEMORY_PRAGMAS)
    }

    fn prepare(conn: Connection, path: PathBuf, pragmas: &str) -> Result<Self, String> {
        conn.execute_batch(pragmas)
            .map_err(|e| format!("Failed to configure database: {}", e))?;
        schema::run_migrations(&conn)?;
        log::debug!("[Database] Ready at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }

    /// Exclusive access to the connection. A panicked holder never poisons the store.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the connection; `f` converts its own errors
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Connection) -> Result<T, String>,
    {
        f(&self.lock())
    }

    /// Run `f` inside an immediate transaction
    ///
    /// The write lock is taken up front so two hosts appending to the same
    /// store serialize instead of failing at commit. Any error rolls back.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Connection) -> Result<T, String>,
    {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| format!("Failed to start transaction: {}", e))?;

        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| format!("Failed to commit transaction: {}", e))?;
        Ok(value)
    }

    pub fn schema_version(&self) -> Result<i32, String> {
        schema::get_version(&self.lock())
    }
}

/// Open the store at `path`; `:memory:` selects a private in-memory store
pub fn open_database(path: &Path) -> Result<Database, String> {
    if path.as_os_str() == IN_MEMORY {
        Database::new_in_memory()
    } else {
        Database::new(path.to_path_buf())
    }
}
