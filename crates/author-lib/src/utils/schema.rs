// Thread store schema
// Versioned migrations, each applied atomically and recorded in schema_version

use rusqlite::{params, Connection};

pub const CURRENT_VERSION: i32 = 2;

struct Migration {
    version: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Threads and messages",
        sql: r#"
            CREATE TABLE threads (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                activity_seq INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_threads_project ON threads(project_id);

            -- seq is the replay order; timestamps may tie
            CREATE TABLE messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                project_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system', 'tool-invocation', 'tool-result')),
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX idx_messages_thread ON messages(thread_id, seq);
        "#,
    },
    Migration {
        version: 2,
        description: "Recency index for thread listing",
        sql: r#"
            CREATE INDEX idx_threads_recency
                ON threads(project_id, activity_seq DESC);
        "#,
    },
];

/// Bring the schema up to `CURRENT_VERSION`
pub fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            description TEXT
        );
        "#,
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))?;

    let applied = get_version(conn)?;
    if applied > CURRENT_VERSION {
        return Err(format!(
            "Database schema v{} is newer than this build (v{})",
            applied, CURRENT_VERSION
        ));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        apply(conn, migration)?;
    }
    Ok(())
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), String> {
    log::info!(
        "[Database] Migrating to v{}: {}",
        migration.version,
        migration.description
    );

    // Caller holds the only handle, so an unchecked transaction is safe here
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("Failed to start migration v{}: {}", migration.version, e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;
    tx.execute(
        "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
        params![migration.version, migration.description],
    )
    .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;
    tx.commit()
        .map_err(|e| format!("Failed to commit migration v{}: {}", migration.version, e))
}

/// Highest applied migration, 0 for a fresh store
pub fn get_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to get schema version: {}", e))
}
