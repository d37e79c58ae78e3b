#![forbid(unsafe_code)]

//! Postgres backend for the trace sink.
//!
//! One `PgConnection` is opened per process and held for its lifetime; the
//! sink drives it strictly sequentially. Every statement runs in autocommit
//! mode, so each appended row is its own committed unit.

use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Connection, Row};
use time::OffsetDateTime;
use trace_sink_core::{EventStore, SinkError, StoredTraceEvent, TraceEvent};
use tracing::{debug, info};

const SCHEMA_STATEMENTS: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS logs (
      id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
      event_ts TIMESTAMPTZ,
      "user" TEXT,
      app_id TEXT,
      state TEXT NOT NULL,
      routing_keys TEXT[] NOT NULL DEFAULT '{}',
      publisher TEXT,
      subscriber TEXT,
      exchange_name TEXT,
      node TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_logs_event_ts ON logs (event_ts DESC)",
    "CREATE INDEX IF NOT EXISTS idx_logs_state ON logs (state)",
    "CREATE INDEX IF NOT EXISTS idx_logs_routing_keys ON logs USING GIN (routing_keys)",
];

const INSERT_LOG: &str = r#"INSERT INTO logs (
      event_ts, "user", app_id, state, routing_keys,
      publisher, subscriber, exchange_name, node
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    RETURNING id"#;

const SELECT_COLUMNS: &str = r#"id, event_ts, "user", app_id, state, routing_keys,
    publisher, subscriber, exchange_name, node"#;

/// Connection parameters, usually read from the `PG*` environment variables.
///
/// Defaults target a local development database.
#[derive(Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for PgSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "citypass_logs".to_string(),
            user: "citypass".to_string(),
            password: "citypass".to_string(),
        }
    }
}

impl Debug for PgSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl PgSettings {
    #[must_use]
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

pub struct PgEventStore {
    conn: PgConnection,
}

impl PgEventStore {
    /// Opens the single connection the sink works with.
    ///
    /// # Errors
    /// Returns [`SinkError::Connectivity`] when the server cannot be reached
    /// or rejects the credentials.
    pub async fn connect(settings: &PgSettings) -> Result<Self, SinkError> {
        let store = Self::connect_with(&settings.connect_options()).await?;
        info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.database,
            "connected to postgres"
        );
        Ok(store)
    }

    /// # Errors
    /// Returns [`SinkError::Connectivity`] when the connection cannot be opened.
    pub async fn connect_with(options: &PgConnectOptions) -> Result<Self, SinkError> {
        let conn = PgConnection::connect_with(options)
            .await
            .map_err(|err| SinkError::Connectivity(format!("connect postgres: {err}")))?;
        Ok(Self { conn })
    }

    /// Closes the connection cleanly.
    ///
    /// # Errors
    /// Returns [`SinkError::Connectivity`] if the terminate handshake fails.
    pub async fn close(self) -> Result<(), SinkError> {
        self.conn
            .close()
            .await
            .map_err(|err| SinkError::Connectivity(format!("close postgres: {err}")))
    }

    async fn select(
        &mut self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        action: &str,
    ) -> Result<Vec<StoredTraceEvent>, SinkError> {
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|err| backend(action, &err))?;
        rows.iter()
            .map(|row| stored_from_row(row).map_err(|err| backend(action, &err)))
            .collect()
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn ensure_schema(&mut self) -> Result<(), SinkError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&mut self.conn)
                .await
                .map_err(|err| SinkError::Connectivity(format!("apply logs schema: {err}")))?;
        }
        debug!("postgres logs schema ensured");
        Ok(())
    }

    async fn append(&mut self, event: &TraceEvent) -> Result<i64, SinkError> {
        sqlx::query_scalar::<_, i64>(INSERT_LOG)
            .bind(event.event_time)
            .bind(event.user.as_deref())
            .bind(event.app_id.as_deref())
            .bind(event.state.as_str())
            .bind(event.routing_keys.as_slice())
            .bind(event.publisher.as_deref())
            .bind(event.subscriber.as_deref())
            .bind(event.exchange_name.as_deref())
            .bind(event.node.as_deref())
            .fetch_one(&mut self.conn)
            .await
            .map_err(|err| backend("insert log row", &err))
    }

    async fn recent(&mut self, limit: u32) -> Result<Vec<StoredTraceEvent>, SinkError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM logs
             ORDER BY event_ts DESC NULLS LAST, id DESC
             LIMIT $1"
        );
        self.select(sqlx::query(&sql).bind(i64::from(limit)), "select recent logs")
            .await
    }

    async fn by_routing_key(
        &mut self,
        routing_key: &str,
        limit: u32,
    ) -> Result<Vec<StoredTraceEvent>, SinkError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM logs
             WHERE routing_keys @> ARRAY[$1]::TEXT[]
             ORDER BY event_ts DESC NULLS LAST, id DESC
             LIMIT $2"
        );
        self.select(
            sqlx::query(&sql).bind(routing_key).bind(i64::from(limit)),
            "select logs by routing key",
        )
        .await
    }

    async fn count(&mut self) -> Result<i64, SinkError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM logs")
            .fetch_one(&mut self.conn)
            .await
            .map_err(|err| backend("count log rows", &err))
    }
}

fn stored_from_row(row: &PgRow) -> Result<StoredTraceEvent, sqlx::Error> {
    Ok(StoredTraceEvent {
        id: row.try_get("id")?,
        event: TraceEvent {
            event_time: row.try_get::<Option<OffsetDateTime>, _>("event_ts")?,
            user: row.try_get("user")?,
            app_id: row.try_get("app_id")?,
            state: row.try_get("state")?,
            routing_keys: row.try_get("routing_keys")?,
            publisher: row.try_get("publisher")?,
            subscriber: row.try_get("subscriber")?,
            exchange_name: row.try_get("exchange_name")?,
            node: row.try_get("node")?,
        },
    })
}

fn backend(action: &str, err: &sqlx::Error) -> SinkError {
    SinkError::Persistence(format!("{action}: {err}"))
}
