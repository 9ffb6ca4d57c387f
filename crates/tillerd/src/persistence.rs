use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tiller_core::{AgentStatus, Event, TaskId};

use crate::types::AgentRecord;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Agent records and lifecycle events. The only store tiller owns.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS agents (
    task_id TEXT PRIMARY KEY,
    status_tag TEXT NOT NULL,
    pid INTEGER,
    payload_json TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status_tag);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    task_id TEXT,
    at TEXT NOT NULL,
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_task_at ON events(task_id, at);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_agent(&self, record: &AgentRecord) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(record)?;
        self.conn.execute(
            r#"
INSERT INTO agents (task_id, status_tag, pid, payload_json, started_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(task_id) DO UPDATE SET
  status_tag = excluded.status_tag,
  pid = excluded.pid,
  payload_json = excluded.payload_json,
  started_at = excluded.started_at,
  updated_at = excluded.updated_at
"#,
            params![
                record.task_id.0,
                record.status.tag(),
                record.pid,
                payload,
                record.started_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_agent(&self, task_id: &TaskId) -> Result<Option<AgentRecord>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM agents WHERE task_id = ?1",
                params![task_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str::<AgentRecord>(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    /// Read-modify-write of one record inside a transaction. `apply` returns
    /// `false` to leave the stored record untouched.
    pub fn update_agent<F>(
        &mut self,
        task_id: &TaskId,
        apply: F,
    ) -> Result<Option<AgentRecord>, PersistenceError>
    where
        F: FnOnce(&mut AgentRecord) -> bool,
    {
        let tx = self.conn.transaction()?;
        let payload: Option<String> = tx
            .query_row(
                "SELECT payload_json FROM agents WHERE task_id = ?1",
                params![task_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let mut record: AgentRecord = serde_json::from_str(&payload)?;
        if apply(&mut record) {
            record.updated_at = Utc::now();
            tx.execute(
                r#"
UPDATE agents SET status_tag = ?2, pid = ?3, payload_json = ?4, updated_at = ?5
WHERE task_id = ?1
"#,
                params![
                    record.task_id.0,
                    record.status.tag(),
                    record.pid,
                    serde_json::to_string(&record)?,
                    record.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(Some(record))
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM agents ORDER BY started_at ASC, task_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            let payload = row?;
            records.push(serde_json::from_str::<AgentRecord>(&payload)?);
        }
        Ok(records)
    }

    pub fn list_agents_by_status(
        &self,
        status: AgentStatus,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM agents WHERE status_tag = ?1 ORDER BY started_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![status.tag()], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            let payload = row?;
            records.push(serde_json::from_str::<AgentRecord>(&payload)?);
        }
        Ok(records)
    }

    pub fn count_live_agents(&self) -> Result<usize, PersistenceError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE status_tag IN (?1, ?2)",
            params![AgentStatus::Spawned.tag(), AgentStatus::Running.tag()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn delete_agent(&self, task_id: &TaskId) -> Result<bool, PersistenceError> {
        let deleted = self
            .conn
            .execute("DELETE FROM agents WHERE task_id = ?1", params![task_id.0])?;
        Ok(deleted > 0)
    }

    pub fn append_event(&self, event: &Event) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            r#"
INSERT OR IGNORE INTO events (event_id, task_id, at, kind_tag, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                event.id.0,
                event.task_id.as_ref().map(|id| id.0.clone()),
                event.at.to_rfc3339(),
                event.kind.tag(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn list_events_for_task(&self, task_id: &TaskId) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM events WHERE task_id = ?1 ORDER BY at ASC, event_id ASC",
        )?;
        let rows = stmt.query_map(params![task_id.0], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<Event>(&payload)?);
        }
        Ok(events)
    }

    pub fn list_events_global(&self) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM events ORDER BY at ASC, event_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<Event>(&payload)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::EventKind;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open");
        store.migrate().expect("migrate");
        store
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = store();
        store.migrate().expect("second migrate");
    }

    #[test]
    fn upsert_and_load_agent() {
        let store = store();
        let mut record = AgentRecord::spawned(TaskId::new("T1"), None, None);
        store.upsert_agent(&record).expect("insert");

        record.status = AgentStatus::Running;
        record.pid = Some(77);
        store.upsert_agent(&record).expect("update");

        let loaded = store
            .load_agent(&TaskId::new("T1"))
            .expect("load")
            .expect("present");
        assert_eq!(loaded.status, AgentStatus::Running);
        assert_eq!(loaded.pid, Some(77));
        assert!(store.load_agent(&TaskId::new("T2")).expect("load").is_none());
    }

    #[test]
    fn update_agent_applies_or_skips() {
        let mut store = store();
        store
            .upsert_agent(&AgentRecord::spawned(TaskId::new("T1"), None, None))
            .expect("insert");

        let updated = store
            .update_agent(&TaskId::new("T1"), |record| {
                record.status = AgentStatus::Running;
                true
            })
            .expect("update")
            .expect("present");
        assert_eq!(updated.status, AgentStatus::Running);

        store
            .update_agent(&TaskId::new("T1"), |record| {
                record.status = AgentStatus::Error;
                false
            })
            .expect("skipped update");
        let loaded = store.load_agent(&TaskId::new("T1")).expect("load").expect("present");
        assert_eq!(loaded.status, AgentStatus::Running);

        assert!(store
            .update_agent(&TaskId::new("missing"), |_| true)
            .expect("missing")
            .is_none());
    }

    #[test]
    fn counts_live_agents_and_filters_by_status() {
        let store = store();
        for (id, status) in [
            ("T1", AgentStatus::Running),
            ("T2", AgentStatus::Spawned),
            ("T3", AgentStatus::Completed),
        ] {
            let mut record = AgentRecord::spawned(TaskId::new(id), None, None);
            record.status = status;
            store.upsert_agent(&record).expect("insert");
        }
        assert_eq!(store.count_live_agents().expect("count"), 2);
        let completed = store
            .list_agents_by_status(AgentStatus::Completed)
            .expect("filter");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].task_id, TaskId::new("T3"));
        assert_eq!(store.list_agents().expect("list").len(), 3);

        assert!(store.delete_agent(&TaskId::new("T1")).expect("delete"));
        assert!(!store.delete_agent(&TaskId::new("T1")).expect("delete again"));
    }

    #[test]
    fn events_are_listed_per_task_and_globally() {
        let store = store();
        let task = TaskId::new("T1");
        store
            .append_event(&Event::now(Some(&task), EventKind::AgentReset))
            .expect("task event");
        store
            .append_event(&Event::now(None, EventKind::GhostCleared))
            .expect("global event");

        let task_events = store.list_events_for_task(&task).expect("task events");
        assert_eq!(task_events.len(), 1);
        assert_eq!(task_events[0].kind, EventKind::AgentReset);
        assert_eq!(store.list_events_global().expect("global").len(), 2);
    }
}
