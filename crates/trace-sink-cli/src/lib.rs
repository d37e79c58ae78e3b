//! Command surface of the `trace-sink` binary.
//!
//! - [`run_cli`] connects to the configured store (retrying until it is up),
//!   ensures the schema and executes one [`Command`].
//! - [`JsonLinesFeed`] is the [`DeliverySource`] used by `run`: one JSON
//!   delivery per line, as written by an external bus bridge.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio_util::sync::CancellationToken;
use trace_sink_core::{
    connect_with_retry, consume, Delivery, DeliverySource, EventStore, Headers, Inbound,
    Pipeline, RetryPolicy, SinkError, StoredTraceEvent,
};
use trace_sink_store_postgres::{PgEventStore, PgSettings};
use trace_sink_store_sqlite::SqliteEventStore;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "trace-sink")]
#[command(about = "Records message-bus trace metadata as append-only log rows")]
pub struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Postgres,
    Sqlite,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    #[arg(long, env = "TRACE_SINK_BACKEND", value_enum, default_value_t = BackendArg::Postgres)]
    backend: BackendArg,
    #[arg(long, env = "TRACE_SINK_SQLITE_PATH", default_value = "./trace_sink.sqlite3")]
    sqlite_path: PathBuf,
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    pg_host: String,
    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    pg_port: u16,
    #[arg(long, env = "PGDATABASE", default_value = "citypass_logs")]
    pg_database: String,
    #[arg(long, env = "PGUSER", default_value = "citypass")]
    pg_user: String,
    #[arg(long, env = "PGPASSWORD", default_value = "citypass", hide_env_values = true)]
    pg_password: String,
    #[arg(long, env = "TRACE_SINK_RETRY_INTERVAL_MS", default_value_t = 3000)]
    retry_interval_ms: u64,
    /// Unset means retry until interrupted.
    #[arg(long, env = "TRACE_SINK_MAX_CONNECT_ATTEMPTS")]
    max_connect_attempts: Option<u32>,
}

impl StoreArgs {
    fn pg_settings(&self) -> PgSettings {
        PgSettings {
            host: self.pg_host.clone(),
            port: self.pg_port,
            database: self.pg_database.clone(),
            user: self.pg_user.clone(),
            password: self.pg_password.clone(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_interval_ms))
            .with_max_attempts(self.max_connect_attempts)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume deliveries from a JSON-lines feed until it ends or Ctrl-C.
    Run(RunArgs),
    /// Create the logs table and indexes, then exit.
    Schema,
    /// Print the newest rows as JSON lines.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print rows whose routing keys contain the given key.
    Search {
        #[arg(long)]
        routing_key: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Feed file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    feed: String,
}

/// Installs the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Trips `cancel` on Ctrl-C, or SIGTERM on unix.
pub async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM, only Ctrl-C stops the sink");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
    cancel.cancel();
}

/// Connects to the configured backend and executes the parsed command.
///
/// # Errors
/// Returns an error when the store cannot be reached before `cancel` fires
/// (or the attempt budget runs out), or when the command itself fails.
pub async fn run_cli(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let policy = cli.store.retry_policy();
    match cli.store.backend {
        BackendArg::Postgres => {
            let settings = cli.store.pg_settings();
            info!(?settings, "waiting for postgres");
            let settings = &settings;
            let store =
                connect_with_retry(&policy, &cancel, move |_| PgEventStore::connect(settings))
                    .await?;
            let store = run_command(cli.command, store, &cancel).await?;
            store.close().await?;
            Ok(())
        }
        BackendArg::Sqlite => {
            let path = &cli.store.sqlite_path;
            info!(path = %path.display(), "opening sqlite store");
            let store = connect_with_retry(&policy, &cancel, move |_| {
                let opened = SqliteEventStore::open(path);
                async move { opened }
            })
            .await?;
            run_command(cli.command, store, &cancel).await?;
            Ok(())
        }
    }
}

/// Executes one command against an already connected store and hands the
/// store back.
///
/// # Errors
/// Returns an error when the feed cannot be opened or read, or when a
/// query fails.
pub async fn run_command<S: EventStore>(
    command: Command,
    mut store: S,
    cancel: &CancellationToken,
) -> Result<S> {
    match command {
        Command::Run(args) => {
            let mut feed = JsonLinesFeed::open(&args.feed).await?;
            let mut pipeline = Pipeline::new(store);
            let summary = consume(&mut feed, &mut pipeline, cancel).await?;
            store = pipeline.into_store();
            info!(
                delivered = summary.delivered,
                stored = summary.stored,
                dropped = summary.dropped,
                "consumer finished"
            );
        }
        Command::Schema => {
            info!("logs schema is in place");
        }
        Command::Recent { limit } => print_rows(&store.recent(limit).await?)?,
        Command::Search { routing_key, limit } => {
            print_rows(&store.by_routing_key(&routing_key, limit).await?)?;
        }
    }
    Ok(store)
}

fn print_rows(rows: &[StoredTraceEvent]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

/// Key that marks a legacy `{"trace": {...}}` feed line.
const TRACE_KEY: &str = "trace";

/// A legacy record whose fields were extracted upstream.
#[derive(Debug, Deserialize)]
struct TraceLine {
    trace: Headers,
    #[serde(default)]
    delivery_tag: Option<u64>,
}

/// A raw bus delivery. `body` may be a string or any JSON document.
#[derive(Debug, Deserialize)]
struct DeliveryLine {
    #[serde(default)]
    delivery_tag: Option<u64>,
    #[serde(default)]
    routing_key: Option<String>,
    #[serde(default)]
    headers: Option<Headers>,
    #[serde(default)]
    body: Option<Value>,
}

fn parse_feed_line(line: &str, line_no: u64) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    if value.get(TRACE_KEY).is_some() {
        let TraceLine {
            trace,
            delivery_tag,
        } = serde_json::from_value(value)?;
        return Ok(Inbound::TraceData {
            delivery_tag: delivery_tag.unwrap_or(line_no),
            data: trace,
        });
    }

    let DeliveryLine {
        delivery_tag,
        routing_key,
        headers,
        body,
    } = serde_json::from_value(value)?;
    let body = match body {
        None => Vec::new(),
        Some(Value::String(text)) => text.into_bytes(),
        Some(document) => serde_json::to_vec(&document)?,
    };
    Ok(Inbound::Delivery(Delivery {
        delivery_tag: delivery_tag.unwrap_or(line_no),
        routing_key,
        headers,
        body,
    }))
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Reads deliveries from newline-delimited JSON.
///
/// Blank lines are ignored; lines that are not UTF-8 or not a valid delivery
/// are logged and skipped. A delivery without `delivery_tag` is tagged with
/// its line number.
pub struct JsonLinesFeed<R> {
    lines: Split<R>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.split(b'\n'),
            line_no: 0,
        }
    }
}

impl JsonLinesFeed<BufReader<BoxedReader>> {
    /// Opens `path`, or stdin when `path` is `-`.
    ///
    /// # Errors
    /// Returns an error if the feed file cannot be opened.
    pub async fn open(path: &str) -> Result<Self> {
        let reader: BoxedReader = if path == "-" {
            Box::new(tokio::io::stdin())
        } else {
            Box::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open feed {path}"))?,
            )
        };
        Ok(Self::new(BufReader::new(reader)))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> DeliverySource for JsonLinesFeed<R> {
    async fn next_delivery(&mut self) -> Result<Option<Inbound>, SinkError> {
        loop {
            let raw = self
                .lines
                .next_segment()
                .await
                .map_err(|err| SinkError::Feed(format!("read feed line: {err}")))?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            self.line_no += 1;

            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(err) => {
                    warn!(line = self.line_no, error = %err, "skipping feed line that is not utf-8");
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_feed_line(trimmed, self.line_no) {
                Ok(inbound) => return Ok(Some(inbound)),
                Err(err) => {
                    warn!(line = self.line_no, error = %err, "skipping malformed feed line");
                }
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), SinkError> {
        debug!(delivery_tag, "delivery acked");
        Ok(())
    }
}
