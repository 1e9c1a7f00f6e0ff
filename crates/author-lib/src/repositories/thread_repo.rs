// Thread Repository
// Session store: threads and their append-only message history

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::models::thread::{Message, MessageRole, Thread};
use crate::utils::database::Database;

/// Repository for thread and message data access
#[derive(Clone)]
pub struct ThreadRepository {
    db: Database,
}

impl ThreadRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Insert a new thread
    pub fn create_thread(&self, thread: &Thread) -> Result<(), String> {
        self.db.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO threads (id, project_id, name, created_at, last_activity, activity_seq, message_count)
                VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(activity_seq), 0) + 1 FROM threads), ?6)
                "#,
                params![
                    thread.id,
                    thread.project_id,
                    thread.name,
                    format_timestamp(&thread.created_at),
                    format_timestamp(&thread.last_activity),
                    thread.message_count,
                ],
            )
            .map_err(|e| format!("Failed to create thread: {}", e))?;
            Ok(())
        })
    }

    /// Get a thread by ID
    pub fn get_thread(&self, id: &str) -> Result<Option<Thread>, String> {
        self.db.with_connection(|conn| {
            let result = conn.query_row(
                r#"
                SELECT id, project_id, name, created_at, last_activity, message_count
                FROM threads
                WHERE id = ?1
                "#,
                params![id],
                ThreadRow::from_row,
            );

            match result {
                Ok(row) => Ok(Some(row.into_thread()?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(format!("Failed to get thread: {}", e)),
            }
        })
    }

    /// List a project's threads, most recently active first
    pub fn list_threads(&self, project_id: &str) -> Result<Vec<Thread>, String> {
        self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, project_id, name, created_at, last_activity, message_count
                    FROM threads
                    WHERE project_id = ?1
                    ORDER BY activity_seq DESC
                    "#,
                )
                .map_err(|e| format!("Failed to prepare statement: {}", e))?;

            let rows = stmt
                .query_map(params![project_id], ThreadRow::from_row)
                .map_err(|e| format!("Failed to query threads: {}", e))?;

            let mut threads = Vec::new();
            for row in rows {
                let row = row.map_err(|e| format!("Failed to read row: {}", e))?;
                threads.push(row.into_thread()?);
            }
            Ok(threads)
        })
    }

    /// Rename a thread. Returns false if it does not exist.
    pub fn rename_thread(&self, id: &str, name: &str) -> Result<bool, String> {
        self.db.with_connection(|conn| {
            let rows = conn
                .execute(
                    "UPDATE threads SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )
                .map_err(|e| format!("Failed to rename thread: {}", e))?;
            Ok(rows > 0)
        })
    }

    /// Delete a thread and all of its messages
    pub fn delete_thread(&self, id: &str) -> Result<bool, String> {
        self.db.with_transaction(|conn| {
            // Cascade covers this too; explicit delete keeps it independent of the pragma
            conn.execute("DELETE FROM messages WHERE thread_id = ?1", params![id])
                .map_err(|e| format!("Failed to delete thread messages: {}", e))?;
            let rows = conn
                .execute("DELETE FROM threads WHERE id = ?1", params![id])
                .map_err(|e| format!("Failed to delete thread: {}", e))?;
            Ok(rows > 0)
        })
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Append messages atomically
    ///
    /// Each touched thread gets its count incremented and becomes the most
    /// recently active one. Fails without writing anything if a thread is missing.
    pub fn append_messages(&self, messages: &[Message]) -> Result<(), String> {
        if messages.is_empty() {
            return Ok(());
        }

        self.db.with_transaction(|conn| {
            let mut touched: BTreeMap<&str, (i64, DateTime<Utc>)> = BTreeMap::new();

            for message in messages {
                insert_message(conn, message)?;
                let entry = touched
                    .entry(message.thread_id.as_str())
                    .or_insert((0, message.timestamp));
                entry.0 += 1;
                if message.timestamp > entry.1 {
                    entry.1 = message.timestamp;
                }
            }

            for (thread_id, (count, latest)) in touched {
                let rows = conn
                    .execute(
                        r#"
                        UPDATE threads
                        SET message_count = message_count + ?1,
                            last_activity = MAX(last_activity, ?2),
                            activity_seq = (SELECT COALESCE(MAX(activity_seq), 0) + 1 FROM threads)
                        WHERE id = ?3
                        "#,
                        params![count, format_timestamp(&latest), thread_id],
                    )
                    .map_err(|e| format!("Failed to update thread activity: {}", e))?;
                if rows == 0 {
                    return Err(format!("Thread not found: {}", thread_id));
                }
            }
            Ok(())
        })
    }

    /// Messages of a thread in insertion order
    ///
    /// With `limit`, only the most recent `limit` messages are returned,
    /// still oldest first.
    pub fn get_messages(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<Message>, String> {
        self.db.with_connection(|conn| {
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, thread_id, project_id, role, content, timestamp FROM (
                        SELECT seq, id, thread_id, project_id, role, content, timestamp
                        FROM messages
                        WHERE thread_id = ?1
                        ORDER BY seq DESC
                        LIMIT ?2
                    )
                    ORDER BY seq ASC
                    "#,
                )
                .map_err(|e| format!("Failed to prepare statement: {}", e))?;

            let rows = stmt
                .query_map(params![thread_id, limit], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        thread_id: row.get(1)?,
                        project_id: row.get(2)?,
                        role: row.get(3)?,
                        content: row.get(4)?,
                        timestamp: row.get(5)?,
                    })
                })
                .map_err(|e| format!("Failed to query messages: {}", e))?;

            let mut messages = Vec::new();
            for row in rows {
                let row = row.map_err(|e| format!("Failed to read row: {}", e))?;
                messages.push(row.into_message()?);
            }
            Ok(messages)
        })
    }

    pub fn count_messages(&self, thread_id: &str) -> Result<i64, String> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .map_err(|e| format!("Failed to count messages: {}", e))
        })
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<(), String> {
    conn.execute(
        r#"
        INSERT INTO messages (id, thread_id, project_id, role, content, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            message.id,
            message.thread_id,
            message.project_id,
            message.role.as_str(),
            message.content,
            format_timestamp(&message.timestamp),
        ],
    )
    .map_err(|e| format!("Failed to save message: {}", e))?;
    Ok(())
}

/// Fixed-width RFC 3339 so string order matches time order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp {}: {}", raw, e))
}

// ============================================================================
// Row types
// ============================================================================

struct ThreadRow {
    id: String,
    project_id: String,
    name: String,
    created_at: String,
    last_activity: String,
    message_count: i64,
}

impl ThreadRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
            last_activity: row.get(4)?,
            message_count: row.get(5)?,
        })
    }

    fn into_thread(self) -> Result<Thread, String> {
        Ok(Thread {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            created_at: parse_timestamp(&self.created_at)?,
            last_activity: parse_timestamp(&self.last_activity)?,
            message_count: self.message_count,
        })
    }
}

struct MessageRow {
    id: String,
    thread_id: String,
    project_id: String,
    role: String,
    content: String,
    timestamp: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, String> {
        Ok(Message {
            id: self.id,
            thread_id: self.thread_id,
            project_id: self.project_id,
            role: self.role.parse::<MessageRole>()?,
            content: self.content,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}
