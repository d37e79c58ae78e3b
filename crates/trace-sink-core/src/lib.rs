//! Canonical trace-event model and the delivery pipeline of the trace sink.
//!
//! A bus delivery flows through three steps:
//! - [`normalize`] maps the routing key and header metadata onto a [`TraceEvent`].
//! - an [`EventStore`] appends the event as one immutable row.
//! - [`Pipeline::on_delivery`] glues both together and isolates failures per message.
//!
//! Storage backends live in their own crates and implement [`EventStore`].

#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

mod normalize;
mod pipeline;
mod retry;

pub use normalize::normalize;
pub use pipeline::{consume, ConsumeSummary, DeliveryOutcome, Pipeline};
pub use retry::{connect_with_retry, RetryPolicy, DEFAULT_RETRY_INTERVAL};

/// Free-form header metadata attached to a delivery by the bus layer.
pub type Headers = Map<String, Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SinkError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("delivery feed error: {0}")]
    Feed(String),
    #[error("startup cancelled after {attempts} connection attempt(s)")]
    Cancelled { attempts: u32 },
    #[error("gave up connecting after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// One message's journey metadata, as recorded in the `logs` table.
///
/// `state` and `routing_keys` are always present; every other field is
/// populated only when the envelope carried it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceEvent {
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub event_time: Option<OffsetDateTime>,
    pub user: Option<String>,
    pub app_id: Option<String>,
    pub state: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    pub publisher: Option<String>,
    pub subscriber: Option<String>,
    pub exchange_name: Option<String>,
    pub node: Option<String>,
}

impl Display for TraceEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// A persisted [`TraceEvent`] together with its row identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredTraceEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// A single message handed over by the bus client.
///
/// The body is carried for completeness; the sink only reads metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: Option<String>,
    pub headers: Option<Headers>,
    pub body: Vec<u8>,
}

/// What a [`DeliverySource`] yields.
///
/// `TraceData` carries an already-extracted flat trace mapping, as still
/// emitted by some upstream producers; see [`TraceEvent::from_trace_data`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Delivery(Delivery),
    TraceData { delivery_tag: u64, data: Headers },
}

impl Inbound {
    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        match self {
            Self::Delivery(delivery) => delivery.delivery_tag,
            Self::TraceData { delivery_tag, .. } => *delivery_tag,
        }
    }
}

/// Append-only storage for trace events.
///
/// Implementations own exactly one connection and are driven sequentially,
/// hence `&mut self` everywhere.
#[async_trait]
pub trait EventStore: Send {
    /// Creates the `logs` table and its indexes when missing.
    #[allow(clippy::missing_errors_doc)]
    async fn ensure_schema(&mut self) -> Result<(), SinkError>;

    /// Inserts one row in its own committed unit and returns its id.
    #[allow(clippy::missing_errors_doc)]
    async fn append(&mut self, event: &TraceEvent) -> Result<i64, SinkError>;

    #[allow(clippy::missing_errors_doc)]
    async fn recent(&mut self, limit: u32) -> Result<Vec<StoredTraceEvent>, SinkError>;

    #[allow(clippy::missing_errors_doc)]
    async fn by_routing_key(
        &mut self,
        routing_key: &str,
        limit: u32,
    ) -> Result<Vec<StoredTraceEvent>, SinkError>;

    #[allow(clippy::missing_errors_doc)]
    async fn count(&mut self) -> Result<i64, SinkError>;
}

/// The bus client seen from the sink: one delivery at a time, acked by the caller.
#[async_trait]
pub trait DeliverySource: Send {
    /// Waits for the next delivery. `Ok(None)` means the source is closed.
    #[allow(clippy::missing_errors_doc)]
    async fn next_delivery(&mut self) -> Result<Option<Inbound>, SinkError>;

    #[allow(clippy::missing_errors_doc)]
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), SinkError>;
}
