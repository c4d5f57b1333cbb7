use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::llm::Message;
use relayloop_core::config::AgentMode;

const SCHEMA_VERSION: i32 = 2;

/// Persisted session metadata. A session with `parent_id = None` is a root
/// (parent); a session with `Some(parent_id)` is a child and its `agent_mode`
/// must be `Child`. Children never themselves have children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    pub model: String,
    pub parent_id: Option<String>,
    pub agent_mode: AgentMode,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// A lifecycle fact persisted against a session: tool dispatch, agent state
/// transitions, delegation bookkeeping. Distinct from `event_bus::SessionEvent`,
/// which is the live pub/sub fact — this is its durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEventRecord {
    pub session_id: String,
    pub event_type: String,
    pub tool_name: Option<String>,
    pub agent_state: Option<String>,
    pub message: Option<String>,
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

/// Full contents of a loaded session: its record plus the ordered message log.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub record: SessionRecord,
    pub messages: Vec<Message>,
}

/// Persistence boundary the engine consumes. Session creation is strict
/// (errors propagate); event logging is best-effort (the reference
/// implementation still propagates rusqlite errors, but callers treat a
/// failure to log an event as non-fatal to the turn in progress).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_session(
        &self,
        id: &str,
        title: &str,
        model: &str,
        parent_id: Option<&str>,
        agent_mode: AgentMode,
    ) -> Result<()>;

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()>;

    async fn load_session(&self, id: &str) -> Result<Option<LoadedSession>>;

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>>;

    async fn update_session_title(&self, id: &str, title: &str) -> Result<()>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    async fn log_session_event(&self, event: &SessionEventRecord) -> Result<()>;

    async fn get_session_events(&self, session_id: &str) -> Result<Vec<SessionEventRecord>>;

    async fn get_session_hierarchy(&self, id: &str) -> Result<Option<SessionRecord>>;

    async fn get_child_sessions(&self, parent_id: &str) -> Result<Vec<String>>;
}

/// Reference `Storage` implementation, backed by `rusqlite` with the
/// `bundled` feature (kept over the `sqlx`/postgres stack seen in one stale
/// crate — see DESIGN.md).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(agent_name: &str) -> Result<Self> {
        let db_path = resolve_db_path(agent_name)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open session DB: {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.migrate()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);

        if version < SCHEMA_VERSION {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id          TEXT PRIMARY KEY,
                    title       TEXT NOT NULL DEFAULT '',
                    model       TEXT NOT NULL DEFAULT '',
                    parent_id   TEXT,
                    agent_mode  TEXT NOT NULL DEFAULT 'parent',
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id              INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id      TEXT NOT NULL,
                    role            TEXT NOT NULL,
                    content         TEXT,
                    reasoning_content TEXT,
                    tool_calls_json TEXT,
                    tool_call_id    TEXT,
                    timestamp_ms    INTEGER NOT NULL,
                    FOREIGN KEY (session_id) REFERENCES sessions(id)
                );

                CREATE TABLE IF NOT EXISTS session_events (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id   TEXT NOT NULL,
                    event_type   TEXT NOT NULL,
                    tool_name    TEXT,
                    agent_state  TEXT,
                    message      TEXT,
                    metadata_json TEXT NOT NULL DEFAULT '{}',
                    timestamp_ms INTEGER NOT NULL,
                    FOREIGN KEY (session_id) REFERENCES sessions(id)
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
                CREATE INDEX IF NOT EXISTS idx_events_session ON session_events(session_id, id);
                CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
                ",
            )?;
            conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        }

        Ok(())
    }
}

fn row_to_record(
    id: String,
    title: String,
    model: String,
    parent_id: Option<String>,
    agent_mode: String,
    created_at_ms: i64,
    updated_at_ms: i64,
) -> SessionRecord {
    // A row with no parent_id predates the agent_mode column's invariant or was
    // created as a root session; either way it is a parent.
    let agent_mode = match agent_mode.as_str() {
        "child" if parent_id.is_some() => AgentMode::Child,
        _ => AgentMode::Parent,
    };
    SessionRecord {
        id,
        title,
        model,
        parent_id,
        agent_mode,
        created_at_ms,
        updated_at_ms,
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(
        &self,
        id: &str,
        title: &str,
        model: &str,
        parent_id: Option<&str>,
        agent_mode: AgentMode,
    ) -> Result<()> {
        let now = now_ms();
        let mode_str = match agent_mode {
            AgentMode::Parent => "parent",
            AgentMode::Child => "child",
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, title, model, parent_id, agent_mode, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, title, model, parent_id, mode_str, now, now],
        )?;
        Ok(())
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let role = match message.role {
            crate::llm::Role::System => "system",
            crate::llm::Role::User => "user",
            crate::llm::Role::Assistant => "assistant",
            crate::llm::Role::Tool => "tool",
        };
        let tool_calls_json = message
            .tool_calls
            .as_ref()
            .map(|tc| serde_json::to_string(tc).unwrap_or_default());
        let now = now_ms();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, reasoning_content, tool_calls_json, tool_call_id, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                role,
                message.content,
                message.reasoning_content,
                tool_calls_json,
                message.tool_call_id,
                now,
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET updated_at_ms = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(())
    }

    async fn load_session(&self, id: &str) -> Result<Option<LoadedSession>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, title, model, parent_id, agent_mode, created_at_ms, updated_at_ms
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(row_to_record(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .ok();

        let Some(record) = record else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT role, content, reasoning_content, tool_calls_json, tool_call_id
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map(params![id], |row| {
                let role_str: String = row.get(0)?;
                let role = match role_str.as_str() {
                    "system" => crate::llm::Role::System,
                    "user" => crate::llm::Role::User,
                    "assistant" => crate::llm::Role::Assistant,
                    _ => crate::llm::Role::Tool,
                };
                let tool_calls_json: Option<String> = row.get(3)?;
                let tool_calls = tool_calls_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok());
                Ok(Message {
                    role,
                    content: row.get(1)?,
                    reasoning_content: row.get(2)?,
                    tool_call_id: row.get(4)?,
                    tool_calls,
                    image_urls: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(LoadedSession { record, messages }))
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, model, parent_id, agent_mode, created_at_ms, updated_at_ms
             FROM sessions ORDER BY updated_at_ms DESC LIMIT ?1",
        )?;
        let sessions = stmt
            .query_map(params![limit as i64], |row| {
                Ok(row_to_record(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    async fn update_session_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET title = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![title, now_ms(), id],
        )?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        conn.execute("DELETE FROM session_events WHERE session_id = ?1", params![id])?;
        conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    async fn log_session_event(&self, event: &SessionEventRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO session_events (session_id, event_type, tool_name, agent_state, message, metadata_json, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.session_id,
                event.event_type,
                event.tool_name,
                event.agent_state,
                event.message,
                serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                event.timestamp_ms,
            ],
        )?;
        Ok(())
    }

    async fn get_session_events(&self, session_id: &str) -> Result<Vec<SessionEventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, event_type, tool_name, agent_state, message, metadata_json, timestamp_ms
             FROM session_events WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![session_id], |row| {
                let metadata_json: String = row.get(5)?;
                Ok(SessionEventRecord {
                    session_id: row.get(0)?,
                    event_type: row.get(1)?,
                    tool_name: row.get(2)?,
                    agent_state: row.get(3)?,
                    message: row.get(4)?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                    timestamp_ms: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn get_session_hierarchy(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, title, model, parent_id, agent_mode, created_at_ms, updated_at_ms
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(row_to_record(
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .ok();
        Ok(record)
    }

    async fn get_child_sessions(&self, parent_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE parent_id = ?1 ORDER BY created_at_ms ASC")?;
        let ids = stmt
            .query_map(params![parent_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

fn resolve_db_path(agent_name: &str) -> Result<PathBuf> {
    Ok(relayloop_core::paths::session_db_path(agent_name))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}
