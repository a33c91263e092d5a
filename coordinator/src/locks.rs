//! Mutual exclusion over named external resources
//!
//! This is the primitive for resources the coordinator does not own (a
//! rate-limited API an executor must serialize on, for example). Task
//! claiming does not go through here; the store's own compare-and-swap is
//! the stronger built-in guarantee.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{now_ms, SessionDb};

pub struct LockManager {
    db: Arc<SessionDb>,
}

impl LockManager {
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self { db }
    }

    /// Try to take a lock; true if held by `agent_id` afterwards
    ///
    /// Atomic: at most one of any set of concurrent callers gets `true` for
    /// a resource another agent holds. Re-acquiring a lock you already hold
    /// also returns true.
    pub fn acquire(&self, resource_id: &str, agent_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO locks (resource_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![resource_id, agent_id, now_ms()],
        )?;
        if inserted == 1 {
            return Ok(true);
        }

        let holder: Option<String> = conn
            .query_row(
                "SELECT holder FROM locks WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder.as_deref() == Some(agent_id))
    }

    /// Release a lock; a no-op unless `agent_id` is the holder
    pub fn release(&self, resource_id: &str, agent_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM locks WHERE resource_id = ?1 AND holder = ?2",
            params![resource_id, agent_id],
        )?;
        Ok(())
    }

    /// Drop a lock regardless of holder (supervisor crash recovery only)
    pub fn force_release(&self, resource_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM locks WHERE resource_id = ?1",
            params![resource_id],
        )?;
        Ok(())
    }

    /// Current holder of a resource, if locked
    pub fn holder(&self, resource_id: &str) -> Result<Option<String>> {
        let conn = self.db.conn();
        let holder = conn
            .query_row(
                "SELECT holder FROM locks WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }

    /// Locks whose holder's heartbeat is older than the staleness window
    ///
    /// Candidates for supervisor force-release. A lock held by an agent the
    /// registry has never seen counts as stale too.
    pub fn stale_locks(&self, window: Duration) -> Result<Vec<String>> {
        let cutoff = now_ms() - window.as_millis() as i64;
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT l.resource_id FROM locks l
             LEFT JOIN agents a ON a.agent_id = l.holder
             WHERE a.last_heartbeat IS NULL OR a.last_heartbeat < ?1
             ORDER BY l.resource_id",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }
}
