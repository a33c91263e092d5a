//! Durable point-to-point and broadcast messaging between named agents
//!
//! Messages are immutable once written. `receive` returns unread mail and
//! marks it read inside one transaction, so a crash can never strand a
//! message that was returned but still flagged unread. A crashed agent that
//! never receives simply leaves its mail queued; nothing expires.
//!
//! The agent registry (ids, roles, heartbeats) lives here too: broadcast
//! fan-out and stall detection both need it.

use anyhow::Result;
use chrono::Local;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

use coordinator_sdk::{AgentRole, Message, MessagePayload, BROADCAST};

use crate::store::{now_ms, SessionDb};

/// A registered agent with its last observed heartbeat
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub agent_id: String,
    pub role: AgentRole,
    pub last_heartbeat_ms: i64,
}

pub struct Mailbox {
    db: Arc<SessionDb>,
}

impl Mailbox {
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self { db }
    }

    /// Register an agent (or refresh its registration) with a fresh heartbeat
    pub fn register_agent(&self, agent_id: &str, role: AgentRole) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR REPLACE INTO agents (agent_id, role, last_heartbeat)
             VALUES (?1, ?2, ?3)",
            params![agent_id, role.as_str(), now_ms()],
        )?;
        Ok(())
    }

    /// Refresh an agent's liveness timestamp
    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE agents SET last_heartbeat = ?1 WHERE agent_id = ?2",
            params![now_ms(), agent_id],
        )?;
        Ok(())
    }

    /// All registered agents
    pub fn agents(&self) -> Result<Vec<AgentInfo>> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare("SELECT agent_id, role, last_heartbeat FROM agents ORDER BY agent_id")?;
        let rows = stmt
            .query_map([], |row| {
                let role: String = row.get(1)?;
                Ok(AgentInfo {
                    agent_id: row.get(0)?,
                    role: AgentRole::parse(&role).unwrap_or(AgentRole::Worker),
                    last_heartbeat_ms: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Agents whose heartbeat is older than the staleness window
    pub fn stale_agents(&self, window: Duration) -> Result<Vec<String>> {
        let cutoff = now_ms() - window.as_millis() as i64;
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare("SELECT agent_id FROM agents WHERE last_heartbeat < ?1 ORDER BY agent_id")?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Send a message to one agent, or to `BROADCAST` ("*")
    ///
    /// Broadcast fans out to every agent registered at send time except the
    /// sender; agents registered later do not see earlier broadcasts.
    pub fn send(&self, from: &str, to: &str, payload: &MessagePayload) -> Result<()> {
        let payload_json = serde_json::to_string(payload)?;
        let now = Local::now().to_rfc3339();

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        if to == BROADCAST {
            let recipients: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT agent_id FROM agents WHERE agent_id != ?1 ORDER BY agent_id",
                )?;
                let rows = stmt
                    .query_map(params![from], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for recipient in recipients {
                tx.execute(
                    "INSERT INTO messages (from_agent, to_agent, payload, timestamp, read_status)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                    params![from, recipient, payload_json, now],
                )?;
            }
        } else {
            tx.execute(
                "INSERT INTO messages (from_agent, to_agent, payload, timestamp, read_status)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![from, to, payload_json, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch unread messages for an agent, oldest first
    ///
    /// With `mark_read` (the normal mode) the fetch and the read-flag update
    /// commit together. With `mark_read = false` the same messages stay
    /// redeliverable (peeking, crash-recovery inspection).
    pub fn receive(&self, agent_id: &str, mark_read: bool) -> Result<Vec<Message>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let messages: Vec<Message> = {
            let mut stmt = tx.prepare(
                "SELECT message_id, from_agent, to_agent, payload, timestamp, read_status
                 FROM messages WHERE to_agent = ?1 AND read_status = 0
                 ORDER BY message_id",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| {
                let payload_json: String = row.get(3)?;
                let timestamp: String = row.get(4)?;
                let read_status: i64 = row.get(5)?;
                Ok(Message {
                    message_id: row.get(0)?,
                    from_agent: row.get(1)?,
                    to_agent: row.get(2)?,
                    payload: serde_json::from_str(&payload_json)
                        .unwrap_or(MessagePayload::Unknown(serde_json::Value::Null)),
                    timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                        .map(|dt| dt.with_timezone(&Local))
                        .unwrap_or_else(|_| Local::now()),
                    read: read_status != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if mark_read {
            for message in &messages {
                tx.execute(
                    "UPDATE messages SET read_status = 1 WHERE message_id = ?1",
                    params![message.message_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(messages)
    }

    /// Unread message count for an agent (supervisor monitoring)
    pub fn unread_count(&self, agent_id: &str) -> Result<usize> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE to_agent = ?1 AND read_status = 0",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> Mailbox {
        Mailbox::new(Arc::new(SessionDb::in_memory().unwrap()))
    }

    #[test]
    fn test_point_to_point_exactly_once() {
        let mailbox = mailbox();
        mailbox.register_agent("x", AgentRole::Worker).unwrap();
        mailbox.register_agent("y", AgentRole::Worker).unwrap();

        mailbox
            .send("x", "y", &MessagePayload::Broadcast { text: "ping".to_string() })
            .unwrap();

        let messages = mailbox.receive("y", true).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_agent, "x");

        // Second receive is empty: already marked read
        assert!(mailbox.receive("y", true).unwrap().is_empty());
        // And nobody else ever sees it
        assert!(mailbox.receive("x", true).unwrap().is_empty());
    }

    #[test]
    fn test_peek_leaves_messages_redeliverable() {
        let mailbox = mailbox();
        mailbox.register_agent("y", AgentRole::Worker).unwrap();
        mailbox
            .send("x", "y", &MessagePayload::Terminate)
            .unwrap();

        assert_eq!(mailbox.receive("y", false).unwrap().len(), 1);
        assert_eq!(mailbox.unread_count("y").unwrap(), 1);
        assert_eq!(mailbox.receive("y", true).unwrap().len(), 1);
        assert_eq!(mailbox.unread_count("y").unwrap(), 0);
    }

    #[test]
    fn test_receive_preserves_send_order() {
        let mailbox = mailbox();
        for i in 0..5 {
            mailbox
                .send(
                    "x",
                    "y",
                    &MessagePayload::Broadcast { text: format!("m{}", i) },
                )
                .unwrap();
        }

        let messages = mailbox.receive("y", true).unwrap();
        let texts: Vec<String> = messages
            .iter()
            .map(|m| match &m.payload {
                MessagePayload::Broadcast { text } => text.clone(),
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_broadcast_fans_out_to_known_agents_except_sender() {
        let mailbox = mailbox();
        mailbox.register_agent("sup", AgentRole::Supervisor).unwrap();
        mailbox.register_agent("w1", AgentRole::Worker).unwrap();
        mailbox.register_agent("w2", AgentRole::Worker).unwrap();

        mailbox.send("sup", BROADCAST, &MessagePayload::Terminate).unwrap();

        assert_eq!(mailbox.receive("w1", true).unwrap().len(), 1);
        assert_eq!(mailbox.receive("w2", true).unwrap().len(), 1);
        assert!(mailbox.receive("sup", true).unwrap().is_empty());

        // An agent registered after the broadcast sees nothing
        mailbox.register_agent("w3", AgentRole::Worker).unwrap();
        assert!(mailbox.receive("w3", true).unwrap().is_empty());
    }

    #[test]
    fn test_stale_agents_window() {
        let mailbox = mailbox();
        mailbox.register_agent("fresh", AgentRole::Worker).unwrap();

        // Backdate a heartbeat directly
        {
            let conn = mailbox.db.conn();
            conn.execute(
                "INSERT INTO agents (agent_id, role, last_heartbeat) VALUES ('stale', 'worker', ?1)",
                params![now_ms() - 60_000],
            )
            .unwrap();
        }

        let stale = mailbox.stale_agents(Duration::from_secs(30)).unwrap();
        assert_eq!(stale, vec!["stale".to_string()]);
    }
}
