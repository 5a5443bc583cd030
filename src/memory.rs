//! Per-User Memory Store
//!
//! Short-term memory is a rolling window of recent turns; long-term memory
//! is a capped set of durable facts keyed by fact name, evicted
//! oldest-first. Both persist in SQLite so they survive restarts and are
//! shared across all sessions of one user. Rapport and trust scores
//! (0-100) track the relationship over time.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// A durable fact about a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub key: String,
    pub text: String,
    pub created_at: i64,
}

/// One short-term memory entry (one exchange).
#[derive(Debug, Clone)]
pub struct Exchange {
    pub user_text: String,
    pub assistant_text: String,
    pub created_at: i64,
}

/// Compact view of a user's memory, consumed by the classifier, planner
/// and synthesizer.
#[derive(Debug, Clone, Default)]
pub struct MemorySummary {
    pub recent: Vec<Exchange>,
    pub facts: Vec<Fact>,
    pub rapport: i64,
    pub trust: i64,
}

impl MemorySummary {
    /// Render for inclusion in a model prompt.
    pub fn render(&self) -> String {
        let mut s = String::new();
        if !self.facts.is_empty() {
            s.push_str("Known about the user:\n");
            for fact in &self.facts {
                s.push_str(&format!("- {}: {}\n", fact.key, fact.text));
            }
        }
        if !self.recent.is_empty() {
            s.push_str("Recent conversation:\n");
            for ex in &self.recent {
                s.push_str(&format!("User: {}\nAssistant: {}\n", ex.user_text, ex.assistant_text));
            }
        }
        s.push_str(&format!("Rapport: {}/100, Trust: {}/100\n", self.rapport, self.trust));
        s
    }

    /// Look up a fact by key.
    pub fn fact(&self, key: &str) -> Option<&Fact> {
        self.facts.iter().find(|f| f.key == key)
    }
}

/// Memory store with SQLite backend.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    short_term_capacity: usize,
    long_term_capacity: usize,
}

impl MemoryStore {
    /// Open or create the memory database.
    pub fn open(path: &Path, short_term_capacity: usize, long_term_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, short_term_capacity, long_term_capacity)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(short_term_capacity: usize, long_term_capacity: usize) -> Result<Self> {
        Self::with_connection(
            Connection::open_in_memory()?,
            short_term_capacity,
            long_term_capacity,
        )
    }

    fn with_connection(
        conn: Connection,
        short_term_capacity: usize,
        long_term_capacity: usize,
    ) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS short_term (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                user_text TEXT NOT NULL,
                assistant_text TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_short_term_user ON short_term(user_id, id);

            CREATE TABLE IF NOT EXISTS long_term (
                user_id TEXT NOT NULL,
                fact_key TEXT NOT NULL,
                fact_text TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, fact_key)
            );

            CREATE TABLE IF NOT EXISTS profile (
                user_id TEXT PRIMARY KEY,
                rapport INTEGER NOT NULL DEFAULT 0,
                trust INTEGER NOT NULL DEFAULT 0,
                interaction_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            short_term_capacity,
            long_term_capacity,
        })
    }

    /// Record one completed exchange in the short-term window, evicting
    /// the oldest entries beyond capacity, and update relationship scores.
    pub fn append_turn(&self, user_id: &str, user_text: &str, assistant_text: &str) -> Result<()> {
        let (rapport_delta, trust_delta) = sentiment_deltas(user_text);
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO short_term (user_id, user_text, assistant_text) VALUES (?1, ?2, ?3)",
            params![user_id, user_text, assistant_text],
        )?;
        conn.execute(
            "DELETE FROM short_term
             WHERE user_id = ?1 AND id NOT IN (
                 SELECT id FROM short_term WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![user_id, self.short_term_capacity],
        )?;

        conn.execute(
            r#"
            INSERT INTO profile (user_id, rapport, trust, interaction_count)
            VALUES (?1, MAX(0, MIN(100, ?2)), MAX(0, MIN(100, ?3)), 1)
            ON CONFLICT(user_id) DO UPDATE SET
                rapport = MAX(0, MIN(100, rapport + ?2)),
                trust = MAX(0, MIN(100, trust + ?3)),
                interaction_count = interaction_count + 1
            "#,
            params![user_id, rapport_delta, trust_delta],
        )?;

        Ok(())
    }

    /// Insert or update a durable fact. A new key at capacity evicts the
    /// oldest fact first; an existing key updates in place.
    pub fn promote(&self, user_id: &str, key: &str, text: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();

        let exists: Option<i64> = conn
            .query_row(
                "SELECT created_at FROM long_term WHERE user_id = ?1 AND fact_key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()?;

        if exists.is_none() {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM long_term WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            if count as usize >= self.long_term_capacity {
                conn.execute(
                    "DELETE FROM long_term WHERE user_id = ?1 AND fact_key = (
                         SELECT fact_key FROM long_term WHERE user_id = ?1
                         ORDER BY created_at ASC, fact_key ASC LIMIT 1
                     )",
                    params![user_id],
                )?;
            }
        }

        conn.execute(
            r#"
            INSERT INTO long_term (user_id, fact_key, fact_text, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(user_id, fact_key) DO UPDATE SET
                fact_text = excluded.fact_text,
                updated_at = excluded.updated_at
            "#,
            params![user_id, key, text, now],
        )?;

        debug!(user_id, key, "fact promoted to long-term memory");
        Ok(())
    }

    /// Compact view: recent short-term entries, all long-term facts,
    /// relationship scores.
    pub fn summarize(&self, user_id: &str) -> Result<MemorySummary> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT user_text, assistant_text, created_at
             FROM short_term WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let recent: Vec<Exchange> = stmt
            .query_map(params![user_id], |row| {
                Ok(Exchange {
                    user_text: row.get(0)?,
                    assistant_text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn.prepare(
            "SELECT fact_key, fact_text, created_at
             FROM long_term WHERE user_id = ?1 ORDER BY created_at ASC, fact_key ASC",
        )?;
        let facts: Vec<Fact> = stmt
            .query_map(params![user_id], |row| {
                Ok(Fact {
                    key: row.get(0)?,
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let (rapport, trust) = conn
            .query_row(
                "SELECT rapport, trust FROM profile WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((0, 0));

        Ok(MemorySummary {
            recent,
            facts,
            rapport,
            trust,
        })
    }

    /// Number of long-term facts for a user.
    pub fn fact_count(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM long_term WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "happy", "excellent", "wonderful", "love", "amazing", "perfect", "thank",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "hate", "awful", "horrible", "angry", "frustrated", "annoyed", "problem",
];

/// Relationship score deltas from one user message. Positive sentiment
/// raises rapport by 2 and trust by 1; negative lowers rapport by 1.
fn sentiment_deltas(text: &str) -> (i64, i64) {
    let lower = text.to_lowercase();
    let positive = POSITIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    let negative = NEGATIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();

    if positive > negative {
        (2, 1)
    } else if negative > positive {
        (-1, 0)
    } else {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory(3, 4).unwrap()
    }

    #[test]
    fn test_short_term_window_evicts_oldest() {
        let s = store();
        for i in 0..5 {
            s.append_turn("u1", &format!("message {}", i), "ok").unwrap();
        }
        let summary = s.summarize("u1").unwrap();
        assert_eq!(summary.recent.len(), 3);
        assert_eq!(summary.recent[0].user_text, "message 2");
        assert_eq!(summary.recent[2].user_text, "message 4");
    }

    #[test]
    fn test_long_term_evicts_oldest_first() {
        let s = store();
        for i in 0..4 {
            s.promote("u1", &format!("fact{}", i), "v").unwrap();
            // Distinct created_at so eviction order is deterministic.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        s.promote("u1", "fact4", "v").unwrap();
        assert_eq!(s.fact_count("u1").unwrap(), 4);
        let summary = s.summarize("u1").unwrap();
        assert!(summary.fact("fact0").is_none());
        assert!(summary.fact("fact4").is_some());
    }

    #[test]
    fn test_promote_existing_key_updates_in_place() {
        let s = store();
        s.promote("u1", "name", "Alex").unwrap();
        s.promote("u1", "name", "Alexandra").unwrap();
        assert_eq!(s.fact_count("u1").unwrap(), 1);
        let summary = s.summarize("u1").unwrap();
        assert_eq!(summary.fact("name").unwrap().text, "Alexandra");
    }

    #[test]
    fn test_users_are_isolated() {
        let s = store();
        s.promote("u1", "name", "Alex").unwrap();
        assert!(s.summarize("u2").unwrap().facts.is_empty());
    }

    #[test]
    fn test_rapport_moves_with_sentiment() {
        let s = store();
        s.append_turn("u1", "this is great, thank you", "glad to help").unwrap();
        let summary = s.summarize("u1").unwrap();
        assert_eq!(summary.rapport, 2);
        assert_eq!(summary.trust, 1);

        s.append_turn("u1", "that was terrible", "sorry").unwrap();
        let summary = s.summarize("u1").unwrap();
        assert_eq!(summary.rapport, 1);
    }

    #[test]
    fn test_rapport_clamped_to_range() {
        let s = store();
        for _ in 0..60 {
            s.append_turn("u1", "great thank you", "ok").unwrap();
        }
        let summary = s.summarize("u1").unwrap();
        assert_eq!(summary.rapport, 100);
        assert!(summary.trust <= 100);
    }

    #[test]
    fn test_summary_render_mentions_facts() {
        let s = store();
        s.promote("u1", "name", "Alex").unwrap();
        let rendered = s.summarize("u1").unwrap().render();
        assert!(rendered.contains("name: Alex"));
    }
}
