//! Budget Ledger
//!
//! Per-user, per-day monetary ledger gating all paid actions.
//! SQLite-backed; `reserve` is an atomic check-and-increment against the
//! configured ceiling, `release` rolls back a reservation after a failed
//! action.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Cost-tracking gate. The running total for a period is monotonically
/// non-decreasing except for explicit `release`, and never exceeds the
/// ceiling after any successful `reserve`.
pub struct BudgetLedger {
    conn: Mutex<Connection>,
    ceiling_usd: f64,
}

/// Snapshot of one (user, period) ledger row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: String,
    pub period_key: String,
    pub total_usd: f64,
}

impl BudgetLedger {
    /// Open or create the ledger database.
    pub fn open(db_path: &Path, ceiling_usd: f64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, ceiling_usd)
    }

    /// In-memory ledger, used by tests.
    pub fn open_in_memory(ceiling_usd: f64) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ceiling_usd)
    }

    fn with_connection(conn: Connection, ceiling_usd: f64) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS ledger (
                user_id TEXT NOT NULL,
                period_key TEXT NOT NULL,
                total_usd REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, period_key)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            ceiling_usd,
        })
    }

    pub fn ceiling_usd(&self) -> f64 {
        self.ceiling_usd
    }

    /// Current UTC billing-period key. Rows key on it, so the total resets
    /// at the period boundary without any sweeper.
    fn period_key() -> String {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Atomically reserve `cost_usd` for the current period.
    ///
    /// Returns `true` iff the resulting total stays within the ceiling;
    /// on `false` the ledger is unchanged.
    pub fn reserve(&self, user_id: &str, cost_usd: f64) -> Result<bool> {
        self.reserve_in_period(user_id, &Self::period_key(), cost_usd)
    }

    fn reserve_in_period(&self, user_id: &str, period: &str, cost_usd: f64) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current: f64 = tx
            .query_row(
                "SELECT total_usd FROM ledger WHERE user_id = ?1 AND period_key = ?2",
                params![user_id, period],
                |row| row.get(0),
            )
            .unwrap_or(0.0);

        if current + cost_usd > self.ceiling_usd {
            debug!(user_id, current, cost_usd, "budget reservation refused");
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO ledger (user_id, period_key, total_usd)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, period_key) DO UPDATE SET
                total_usd = total_usd + excluded.total_usd
            "#,
            params![user_id, period, cost_usd],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Roll back a reservation after the action it paid for failed.
    /// The total floors at zero.
    pub fn release(&self, user_id: &str, cost_usd: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE ledger SET total_usd = MAX(0, total_usd - ?3)
             WHERE user_id = ?1 AND period_key = ?2",
            params![user_id, Self::period_key(), cost_usd],
        )?;
        Ok(())
    }

    /// Spend recorded for the user in the current period.
    pub fn spent(&self, user_id: &str) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        let total = conn
            .query_row(
                "SELECT total_usd FROM ledger WHERE user_id = ?1 AND period_key = ?2",
                params![user_id, Self::period_key()],
                |row| row.get(0),
            )
            .unwrap_or(0.0);
        Ok(total)
    }

    /// Remaining headroom for the user in the current period.
    pub fn headroom(&self, user_id: &str) -> Result<f64> {
        Ok((self.ceiling_usd - self.spent(user_id)?).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_ceiling() {
        let ledger = BudgetLedger::open_in_memory(1.0).unwrap();
        assert!(ledger.reserve("u1", 0.4).unwrap());
        assert!(ledger.reserve("u1", 0.6).unwrap());
        assert!((ledger.spent("u1").unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_over_ceiling_leaves_ledger_unchanged() {
        let ledger = BudgetLedger::open_in_memory(1.0).unwrap();
        assert!(ledger.reserve("u1", 0.9).unwrap());
        assert!(!ledger.reserve("u1", 0.2).unwrap());
        assert!((ledger.spent("u1").unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_release_rolls_back() {
        let ledger = BudgetLedger::open_in_memory(1.0).unwrap();
        assert!(ledger.reserve("u1", 0.9).unwrap());
        ledger.release("u1", 0.5).unwrap();
        assert!(ledger.reserve("u1", 0.5).unwrap());
    }

    #[test]
    fn test_release_floors_at_zero() {
        let ledger = BudgetLedger::open_in_memory(1.0).unwrap();
        ledger.release("u1", 5.0).unwrap();
        assert_eq!(ledger.spent("u1").unwrap(), 0.0);
    }

    #[test]
    fn test_users_are_independent() {
        let ledger = BudgetLedger::open_in_memory(0.5).unwrap();
        assert!(ledger.reserve("u1", 0.5).unwrap());
        assert!(ledger.reserve("u2", 0.5).unwrap());
        assert!(!ledger.reserve("u1", 0.01).unwrap());
    }

    #[test]
    fn test_periods_are_independent() {
        let ledger = BudgetLedger::open_in_memory(1.0).unwrap();
        assert!(ledger.reserve_in_period("u1", "2026-08-22", 1.0).unwrap());
        // Yesterday's spend does not count against today.
        assert!(ledger.reserve_in_period("u1", "2026-08-23", 1.0).unwrap());
    }
}
