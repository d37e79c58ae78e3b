#![forbid(unsafe_code)]

//! Embedded `SQLite` backend for the trace sink.
//!
//! `SQLite` has no array type, so `logs.routing_keys` holds a JSON array and
//! membership lookups go through the `log_routing_keys` side table, written
//! in the same transaction as its `logs` row. `event_ts` is stored as unix
//! seconds.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, Params};
use time::OffsetDateTime;
use trace_sink_core::{EventStore, SinkError, StoredTraceEvent, TraceEvent};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_ts INTEGER,
  "user" TEXT,
  app_id TEXT,
  state TEXT NOT NULL,
  routing_keys TEXT NOT NULL DEFAULT '[]',
  publisher TEXT,
  subscriber TEXT,
  exchange_name TEXT,
  node TEXT
);

CREATE TABLE IF NOT EXISTS log_routing_keys (
  log_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  routing_key TEXT NOT NULL,
  PRIMARY KEY (log_id, position),
  FOREIGN KEY (log_id) REFERENCES logs(id)
);

CREATE INDEX IF NOT EXISTS idx_logs_event_ts ON logs(event_ts DESC);
CREATE INDEX IF NOT EXISTS idx_logs_state ON logs(state);
CREATE INDEX IF NOT EXISTS idx_logs_routing_keys ON log_routing_keys(routing_key, log_id);

CREATE TRIGGER IF NOT EXISTS trg_logs_no_update
BEFORE UPDATE ON logs
BEGIN
  SELECT RAISE(FAIL, 'logs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_logs_no_delete
BEFORE DELETE ON logs
BEGIN
  SELECT RAISE(FAIL, 'logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_log_routing_keys_no_update
BEFORE UPDATE ON log_routing_keys
BEGIN
  SELECT RAISE(FAIL, 'log_routing_keys is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_log_routing_keys_no_delete
BEFORE DELETE ON log_routing_keys
BEGIN
  SELECT RAISE(FAIL, 'log_routing_keys is append-only');
END;
"#;

const SELECT_COLUMNS: &str = r#"id, event_ts, "user", app_id, state, routing_keys,
    publisher, subscriber, exchange_name, node"#;

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns [`SinkError::Connectivity`] if opening the database or
    /// applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))
            .and_then(configure)
            .map_err(connectivity)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self, SinkError> {
        let conn = Connection::open_in_memory()
            .context("failed to open in-memory sqlite database")
            .and_then(configure)
            .map_err(connectivity)?;
        Ok(Self { conn })
    }

    fn insert(&mut self, event: &TraceEvent) -> Result<i64> {
        let tx = self
            .conn
            .transaction()
            .context("failed to begin log transaction")?;

        tx.execute(
            r#"INSERT INTO logs(
                event_ts, "user", app_id, state, routing_keys,
                publisher, subscriber, exchange_name, node
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                event.event_time.map(OffsetDateTime::unix_timestamp),
                event.user,
                event.app_id,
                event.state,
                serde_json::to_string(&event.routing_keys)?,
                event.publisher,
                event.subscriber,
                event.exchange_name,
                event.node,
            ],
        )
        .context("failed to insert log row")?;
        let id = tx.last_insert_rowid();

        for (position, routing_key) in event.routing_keys.iter().enumerate() {
            tx.execute(
                "INSERT INTO log_routing_keys(log_id, position, routing_key) VALUES (?1, ?2, ?3)",
                params![
                    id,
                    i64::try_from(position).map_err(|_| anyhow!("routing key position overflow"))?,
                    routing_key,
                ],
            )
            .context("failed to insert log_routing_keys row")?;
        }

        tx.commit().context("failed to commit log row")?;
        Ok(id)
    }

    fn select<P: Params>(&self, sql: &str, params: P) -> Result<Vec<StoredTraceEvent>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let routing_keys_raw: String = row.get(5)?;
            out.push(StoredTraceEvent {
                id: row.get(0)?,
                event: TraceEvent {
                    event_time: row
                        .get::<_, Option<i64>>(1)?
                        .map(from_unix_seconds)
                        .transpose()?,
                    user: row.get(2)?,
                    app_id: row.get(3)?,
                    state: row.get(4)?,
                    routing_keys: serde_json::from_str(&routing_keys_raw)
                        .context("invalid routing_keys json")?,
                    publisher: row.get(6)?,
                    subscriber: row.get(7)?,
                    exchange_name: row.get(8)?,
                    node: row.get(9)?,
                },
            });
        }

        Ok(out)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn ensure_schema(&mut self) -> Result<(), SinkError> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply logs schema")
            .map_err(connectivity)?;
        debug!("sqlite logs schema ensured");
        Ok(())
    }

    async fn append(&mut self, event: &TraceEvent) -> Result<i64, SinkError> {
        self.insert(event).map_err(persistence)
    }

    async fn recent(&mut self, limit: u32) -> Result<Vec<StoredTraceEvent>, SinkError> {
        self.select(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM logs
                 ORDER BY event_ts DESC NULLS LAST, id DESC
                 LIMIT ?1"
            ),
            params![i64::from(limit)],
        )
        .map_err(persistence)
    }

    async fn by_routing_key(
        &mut self,
        routing_key: &str,
        limit: u32,
    ) -> Result<Vec<StoredTraceEvent>, SinkError> {
        self.select(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM logs
                 WHERE id IN (SELECT log_id FROM log_routing_keys WHERE routing_key = ?1)
                 ORDER BY event_ts DESC NULLS LAST, id DESC
                 LIMIT ?2"
            ),
            params![routing_key, i64::from(limit)],
        )
        .map_err(persistence)
    }

    async fn count(&mut self) -> Result<i64, SinkError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .context("failed to count log rows")
            .map_err(persistence)
    }
}

fn configure(conn: Connection) -> Result<Connection> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(conn)
}

#[allow(clippy::needless_pass_by_value)]
fn connectivity(err: anyhow::Error) -> SinkError {
    SinkError::Connectivity(format!("{err:#}"))
}

#[allow(clippy::needless_pass_by_value)]
fn persistence(err: anyhow::Error) -> SinkError {
    SinkError::Persistence(format!("{err:#}"))
}

fn from_unix_seconds(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value)
        .map_err(|err| anyhow!("invalid event_ts {value}: {err}"))
}
