use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value as JsonValue;

use crate::{reconciler::Resolution, utils::now_ts};

/// Runtime journal: per-component health plus a log of resolved commands.
#[derive(Clone)]
pub struct Journal {
    path: String,
}

impl Journal {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("SQLITE_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }

        // rusqlite::Connection is not Send/Sync; open short-lived connections per call.
        Ok(Self {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn =
            Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS runtime_status (
  component TEXT PRIMARY KEY,
  ts REAL,
  level TEXT,
  message TEXT,
  detail TEXT
);

CREATE TABLE IF NOT EXISTS command_log (
  command_id TEXT PRIMARY KEY,
  kind TEXT,
  outcome TEXT,
  error_code TEXT,
  message TEXT,
  ts REAL
);

CREATE INDEX IF NOT EXISTS idx_command_log_ts ON command_log(ts);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_runtime_status(
        &self,
        component: &str,
        level: &str,
        message: &str,
        detail: Option<&str>,
        ts: f64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO runtime_status(component, ts, level, message, detail)
VALUES(?,?,?,?,?)
ON CONFLICT(component) DO UPDATE SET
  ts=excluded.ts,
  level=excluded.level,
  message=excluded.message,
  detail=excluded.detail
"#,
            params![component, ts, level, message, detail],
        )?;
        Ok(())
    }

    pub fn fetch_runtime_statuses(&self) -> Result<JsonValue> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT component, ts, level, message, detail FROM runtime_status ORDER BY ts DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = serde_json::Map::new();
        while let Some(r) = rows.next()? {
            let component: String = r.get(0)?;
            let ts: f64 = r.get(1)?;
            let level: String = r.get(2)?;
            let message: String = r.get(3)?;
            let detail: Option<String> = r.get(4)?;
            out.insert(
                component.clone(),
                serde_json::json!({
                    "component": component,
                    "ts": ts,
                    "level": level,
                    "message": message,
                    "detail": detail.unwrap_or_default(),
                }),
            );
        }
        Ok(JsonValue::Object(out))
    }

    pub fn record_command(&self, resolution: &Resolution) -> Result<()> {
        let (outcome, code, message) = match &resolution.outcome {
            Ok(()) => ("confirmed", None, String::new()),
            Err(e) => ("failed", Some(e.code()), e.to_string()),
        };
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT OR REPLACE INTO command_log(command_id, kind, outcome, error_code, message, ts)
VALUES(?,?,?,?,?,?)
"#,
            params![
                resolution.id.to_string(),
                resolution.kind.as_str(),
                outcome,
                code,
                message,
                now_ts()
            ],
        )?;
        Ok(())
    }

    pub fn fetch_recent_commands(&self, limit: usize) -> Result<Vec<JsonValue>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT command_id, kind, outcome, error_code, message, ts
FROM command_log
ORDER BY ts DESC
LIMIT ?
"#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = vec![];
        while let Some(r) = rows.next()? {
            out.push(serde_json::json!({
                "command_id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "outcome": r.get::<_, String>(2)?,
                "error_code": r.get::<_, Option<String>>(3)?,
                "message": r.get::<_, String>(4)?,
                "ts": r.get::<_, f64>(5)?,
            }));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use crate::types::{CommandId, CommandKind};

    fn temp_journal() -> Journal {
        let path = std::env::temp_dir().join(format!("dashsync-{}.sqlite", uuid::Uuid::new_v4()));
        let j = Journal::new(path.to_str().unwrap()).unwrap();
        j.init_db().unwrap();
        j
    }

    #[test]
    fn runtime_status_upserts_per_component() {
        let j = temp_journal();
        j.upsert_runtime_status("poller", "warn", "poll failed", None, 1.0)
            .unwrap();
        j.upsert_runtime_status("poller", "ok", "running", Some("v=3"), 2.0)
            .unwrap();
        j.upsert_runtime_status("feed", "ok", "connected", None, 3.0)
            .unwrap();
        let v = j.fetch_runtime_statuses().unwrap();
        assert_eq!(v["poller"]["level"], "ok");
        assert_eq!(v["poller"]["detail"], "v=3");
        assert_eq!(v.as_object().unwrap().len(), 2);
        let _ = std::fs::remove_file(j.path());
    }

    #[test]
    fn command_log_keeps_outcome_and_code() {
        let j = temp_journal();
        j.record_command(&Resolution {
            id: CommandId::new(),
            kind: CommandKind::Start,
            outcome: Ok(()),
        })
        .unwrap();
        j.record_command(&Resolution {
            id: CommandId::new(),
            kind: CommandKind::Stop,
            outcome: Err(CommandError::timeout(CommandKind::Stop)),
        })
        .unwrap();
        let rows = j.fetch_recent_commands(10).unwrap();
        assert_eq!(rows.len(), 2);
        let stop = rows.iter().find(|r| r["kind"] == "stop").unwrap();
        assert_eq!(stop["outcome"], "failed");
        assert_eq!(stop["error_code"], "command_timeout");
        let _ = std::fs::remove_file(j.path());
    }
}
