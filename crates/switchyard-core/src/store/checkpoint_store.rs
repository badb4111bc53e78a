use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{EngineError, Result};
use crate::llm::ChatMessage;
use crate::scope::ScopedResource;

/// Conversation state persisted after every invocation of a thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Assistant holding control when the last invocation finished.
    #[serde(default)]
    pub active_assistant: Option<String>,
}

/// Checkpoints for one compiled graph, partitioned by `scope` (the workflow id).
///
/// The underlying database is shared by every graph, so releasing a store
/// only marks this handle as retired; it keeps reading and writing.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
    scope: String,
    closed: Arc<AtomicBool>,
}

impl CheckpointStore {
    /// Attach to the database and verify it is usable.
    pub async fn open(db: Database, scope: impl Into<String>) -> Result<Self> {
        db.with_conn_async(|conn| conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |_| Ok(())))
            .await?;
        Ok(Self {
            db,
            scope: scope.into(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn load_latest(&self, thread_id: &str) -> Result<Option<ThreadState>> {
        let scope = self.scope.clone();
        let tid = thread_id.to_string();
        let raw: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT state FROM checkpoints WHERE scope = ?1 AND thread_id = ?2
                     ORDER BY seq DESC LIMIT 1",
                    rusqlite::params![scope, tid],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        raw.map(|s| serde_json::from_str(&s).map_err(EngineError::from))
            .transpose()
    }

    /// Append a new checkpoint for the thread; returns its sequence number.
    pub async fn save(&self, thread_id: &str, state: &ThreadState) -> Result<i64> {
        let scope = self.scope.clone();
        let tid = thread_id.to_string();
        let json = serde_json::to_string(state)?;
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints
                     WHERE scope = ?1 AND thread_id = ?2",
                    rusqlite::params![scope, tid],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO checkpoints (scope, thread_id, seq, state, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![scope, tid, seq, json, now],
                )?;
                Ok(seq)
            })
            .await
    }

    pub async fn list_threads(&self) -> Result<Vec<String>> {
        let scope = self.scope.clone();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT thread_id FROM checkpoints WHERE scope = ?1
                     GROUP BY thread_id ORDER BY MAX(created_at) DESC, thread_id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![scope], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        let scope = self.scope.clone();
        let tid = thread_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM checkpoints WHERE scope = ?1 AND thread_id = ?2",
                    rusqlite::params![scope, tid],
                )
            })
            .await
    }
}

#[async_trait]
impl ScopedResource for CheckpointStore {
    fn label(&self) -> String {
        format!("checkpoint store '{}'", self.scope)
    }

    async fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("[CheckpointStore] Released handle for '{}'", self.scope);
        }
    }
}
