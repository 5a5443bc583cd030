//! Per-turn user feedback.
//!
//! Clients can rate any completed turn; ratings feed offline quality
//! review and are never read back into the live pipeline.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FeedbackEntry {
    pub turn_id: String,
    pub user_id: String,
    pub session_id: String,
    /// 1-5
    pub rating: i64,
    pub notes: Option<String>,
    pub created_at: i64,
}

pub struct FeedbackStore {
    conn: Mutex<Connection>,
}

impl FeedbackStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS feedback (
                turn_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                rating INTEGER NOT NULL,
                notes TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_user ON feedback(user_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a rating for a turn, attributed to the user and session
    /// that produced it. Re-rating the same turn overwrites.
    pub fn record(
        &self,
        turn_id: &str,
        user_id: &str,
        session_id: &str,
        rating: i64,
        notes: Option<&str>,
    ) -> Result<()> {
        anyhow::ensure!((1..=5).contains(&rating), "rating must be 1-5, got {}", rating);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO feedback (turn_id, user_id, session_id, rating, notes)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(turn_id) DO UPDATE SET
                rating = excluded.rating,
                notes = excluded.notes,
                created_at = unixepoch()
            "#,
            params![turn_id, user_id, session_id, rating, notes],
        )?;
        Ok(())
    }

    pub fn get(&self, turn_id: &str) -> Result<Option<FeedbackEntry>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT user_id, session_id, rating, notes, created_at
                 FROM feedback WHERE turn_id = ?1",
                params![turn_id],
                |row| {
                    Ok(FeedbackEntry {
                        turn_id: turn_id.to_string(),
                        user_id: row.get(0)?,
                        session_id: row.get(1)?,
                        rating: row.get(2)?,
                        notes: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read_back() {
        let store = FeedbackStore::open_in_memory().unwrap();
        store.record("t1", "u1", "s1", 4, Some("helpful")).unwrap();

        let entry = store.get("t1").unwrap().unwrap();
        assert_eq!(entry.rating, 4);
        assert_eq!(entry.notes.as_deref(), Some("helpful"));
        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.session_id, "s1");
    }

    #[test]
    fn test_rerating_overwrites() {
        let store = FeedbackStore::open_in_memory().unwrap();
        store.record("t1", "u1", "s1", 2, None).unwrap();
        store.record("t1", "u1", "s1", 5, Some("better on reread")).unwrap();
        assert_eq!(store.get("t1").unwrap().unwrap().rating, 5);
    }

    #[test]
    fn test_rating_out_of_range_rejected() {
        let store = FeedbackStore::open_in_memory().unwrap();
        assert!(store.record("t1", "u1", "s1", 0, None).is_err());
        assert!(store.record("t1", "u1", "s1", 6, None).is_err());
    }
}
