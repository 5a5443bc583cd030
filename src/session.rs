//! Session and Turn Persistence
//!
//! A session is an ordered log of turns belonging to one user. Turns
//! within a session are strictly serialized: each turn must acquire the
//! session's lock before any stage runs, and lock acquisition is bounded
//! so a wedged turn fails fast instead of queueing forever. Sessions for
//! different users, and different sessions of one user, never contend.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::TurnError;

/// Terminal state of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

/// One persisted turn. Immutable once inserted.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub id: String,
    pub session_id: String,
    /// Position within the session, 1-based, assigned at persist time.
    pub seq: i64,
    pub user_text: String,
    pub response_text: String,
    pub status: TurnStatus,
    pub intent: String,
    pub plan_json: String,
    pub tool_results_json: String,
    /// Stage transitions the turn went through, in order.
    pub stages: Vec<String>,
    pub created_at: i64,
}

/// Everything the orchestrator hands over for persistence.
#[derive(Debug)]
pub struct TurnDraft<'a> {
    pub session_id: &'a str,
    pub user_text: &'a str,
    pub response_text: &'a str,
    pub status: TurnStatus,
    pub intent: &'a str,
    pub plan_json: String,
    pub tool_results_json: String,
    pub stages: &'a [String],
}

/// SQLite-backed session store plus the in-process per-session locks.
pub struct SessionStore {
    conn: Mutex<Connection>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

impl SessionStore {
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, lock_timeout)
    }

    pub fn open_in_memory(lock_timeout: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, lock_timeout)
    }

    fn with_connection(conn: Connection, lock_timeout: Duration) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS turns (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                user_text TEXT NOT NULL,
                response_text TEXT NOT NULL,
                status TEXT NOT NULL,
                intent TEXT NOT NULL,
                plan TEXT NOT NULL,
                tool_results TEXT NOT NULL,
                stages TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                UNIQUE (session_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: Mutex::new(HashMap::new()),
            lock_timeout,
        })
    }

    /// Create the session row if it does not exist yet.
    pub fn ensure_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, user_id) VALUES (?1, ?2)",
            params![session_id, user_id],
        )?;
        Ok(())
    }

    /// Acquire the session's turn lock, waiting at most the configured
    /// timeout. Holding the returned guard serializes the whole turn.
    pub async fn acquire(&self, session_id: &str) -> Result<OwnedMutexGuard<()>, TurnError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            // Drop entries no turn currently holds or waits on, so the
            // map stays bounded by the number of in-flight sessions
            // rather than every session id ever seen.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(
                locks
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        match tokio::time::timeout(self.lock_timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(TurnError::SessionLockTimeout(self.lock_timeout)),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Persist a finished turn, assigning the next sequence number in its
    /// session. Must be called while the session lock is held.
    pub fn record_turn(&self, draft: TurnDraft<'_>) -> Result<TurnRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let stages_json = serde_json::to_string(draft.stages)?;
        let conn = self.conn.lock().unwrap();

        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE session_id = ?1",
            params![draft.session_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO turns (id, session_id, seq, user_text, response_text, status,
                                intent, plan, tool_results, stages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                draft.session_id,
                seq,
                draft.user_text,
                draft.response_text,
                draft.status.as_str(),
                draft.intent,
                draft.plan_json,
                draft.tool_results_json,
                stages_json
            ],
        )?;

        debug!(session_id = draft.session_id, seq, status = draft.status.as_str(), "turn recorded");
        Ok(TurnRecord {
            id,
            session_id: draft.session_id.to_string(),
            seq,
            user_text: draft.user_text.to_string(),
            response_text: draft.response_text.to_string(),
            status: draft.status,
            intent: draft.intent.to_string(),
            plan_json: draft.plan_json,
            tool_results_json: draft.tool_results_json,
            stages: draft.stages.to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// All turns of a session in sequence order.
    pub fn turns(&self, session_id: &str) -> Result<Vec<TurnRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, seq, user_text, response_text, status, intent, plan, tool_results,
                    stages, created_at
             FROM turns WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let rows: Vec<TurnRecord> = stmt
            .query_map(params![session_id], |row| {
                let status: String = row.get(4)?;
                let stages_json: String = row.get(8)?;
                Ok(TurnRecord {
                    id: row.get(0)?,
                    session_id: session_id.to_string(),
                    seq: row.get(1)?,
                    user_text: row.get(2)?,
                    response_text: row.get(3)?,
                    status: TurnStatus::from_str(&status),
                    intent: row.get(5)?,
                    plan_json: row.get(6)?,
                    tool_results_json: row.get(7)?,
                    stages: serde_json::from_str(&stages_json).unwrap_or_default(),
                    created_at: row.get(9)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory(Duration::from_millis(100)).unwrap()
    }

    fn draft<'a>(
        session_id: &'a str,
        user_text: &'a str,
        response_text: &'a str,
        status: TurnStatus,
        stages: &'a [String],
    ) -> TurnDraft<'a> {
        TurnDraft {
            session_id,
            user_text,
            response_text,
            status,
            intent: "general.chat",
            plan_json: "{}".to_string(),
            tool_results_json: "[]".to_string(),
            stages,
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_per_session() {
        let s = store();
        s.ensure_session("s1", "u1").unwrap();
        s.ensure_session("s2", "u1").unwrap();

        let a = s.record_turn(draft("s1", "hi", "hello", TurnStatus::Completed, &[])).unwrap();
        let b = s.record_turn(draft("s1", "bye", "later", TurnStatus::Completed, &[])).unwrap();
        let c = s.record_turn(draft("s2", "hey", "hi", TurnStatus::Completed, &[])).unwrap();

        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(c.seq, 1);
    }

    #[tokio::test]
    async fn test_turns_come_back_in_order() {
        let s = store();
        s.ensure_session("s1", "u1").unwrap();
        let stages = vec!["received".to_string()];
        s.record_turn(draft("s1", "first", "1", TurnStatus::Completed, &stages)).unwrap();
        s.record_turn(draft("s1", "second", "2", TurnStatus::Failed, &[])).unwrap();

        let turns = s.turns("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_text, "first");
        assert_eq!(turns[0].stages, vec!["received".to_string()]);
        assert_eq!(turns[0].intent, "general.chat");
        assert_eq!(turns[1].status, TurnStatus::Failed);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_session() {
        let s = Arc::new(store());
        let guard = s.acquire("s1").await.unwrap();

        // Second acquisition of the same session must time out while the
        // first guard is held.
        let err = s.acquire("s1").await.unwrap_err();
        assert!(matches!(err, TurnError::SessionLockTimeout(_)));

        drop(guard);
        assert!(s.acquire("s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_contend() {
        let s = store();
        let _g1 = s.acquire("s1").await.unwrap();
        assert!(s.acquire("s2").await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_session_locks_are_evicted() {
        let s = store();
        for i in 0..50 {
            let guard = s.acquire(&format!("s{}", i)).await.unwrap();
            drop(guard);
        }

        // The next acquisition sweeps out every idle entry; only the
        // session being acquired remains tracked.
        let _guard = s.acquire("fresh").await.unwrap();
        assert_eq!(s.tracked_locks(), 1);
    }

    #[tokio::test]
    async fn test_eviction_spares_held_locks() {
        let s = store();
        let _held = s.acquire("busy").await.unwrap();
        drop(s.acquire("idle-1").await.unwrap());
        drop(s.acquire("idle-2").await.unwrap());

        let _other = s.acquire("other").await.unwrap();
        assert_eq!(s.tracked_locks(), 2);

        // The held session still serializes after the sweep.
        assert!(matches!(
            s.acquire("busy").await.unwrap_err(),
            TurnError::SessionLockTimeout(_)
        ));
    }
}
