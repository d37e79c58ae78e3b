use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{normalize, Delivery, DeliverySource, EventStore, Inbound, TraceEvent};

/// Result of handling one delivery. Either way the delivery is already acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Stored { id: i64 },
    Dropped { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub delivered: u64,
    pub stored: u64,
    pub dropped: u64,
}

/// Normalizes deliveries and appends them to the owned store.
#[derive(Debug)]
pub struct Pipeline<S> {
    store: S,
}

impl<S: EventStore> Pipeline<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Handles a single bus delivery.
    ///
    /// Persistence failures are logged and reported as
    /// [`DeliveryOutcome::Dropped`]; they are never propagated.
    pub async fn on_delivery(&mut self, delivery: &Delivery) -> DeliveryOutcome {
        let event = normalize(delivery.routing_key.as_deref(), delivery.headers.as_ref());
        self.record(&event).await
    }

    pub async fn record(&mut self, event: &TraceEvent) -> DeliveryOutcome {
        match self.store.append(event).await {
            Ok(id) => {
                info!(row_id = id, event = %event, "trace event stored");
                DeliveryOutcome::Stored { id }
            }
            Err(err) => {
                error!(error = %err, event = %event, "failed to store trace event, dropping it");
                DeliveryOutcome::Dropped {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Pulls deliveries from `source` until it closes or `cancel` fires.
///
/// Each delivery is acked before it is processed, so a failed insert never
/// leads to redelivery. Cancellation is only observed between deliveries.
///
/// # Errors
/// Returns the source's own error when receiving or acking fails.
pub async fn consume<Src, S>(
    source: &mut Src,
    pipeline: &mut Pipeline<S>,
    cancel: &CancellationToken,
) -> Result<ConsumeSummary, crate::SinkError>
where
    Src: DeliverySource + ?Sized,
    S: EventStore,
{
    let mut summary = ConsumeSummary::default();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("shutdown requested, consumer stopping");
                break;
            }
            next = source.next_delivery() => next?,
        };
        let Some(inbound) = next else {
            info!("delivery source closed");
            break;
        };

        summary.delivered += 1;
        source.ack(inbound.delivery_tag()).await?;

        let outcome = match inbound {
            Inbound::Delivery(delivery) => pipeline.on_delivery(&delivery).await,
            Inbound::TraceData { data, .. } => {
                pipeline.record(&TraceEvent::from_trace_data(&data)).await
            }
        };
        match outcome {
            DeliveryOutcome::Stored { .. } => summary.stored += 1,
            DeliveryOutcome::Dropped { .. } => summary.dropped += 1,
        }
    }

    if summary.dropped > 0 {
        warn!(
            delivered = summary.delivered,
            dropped = summary.dropped,
            "some deliveries could not be stored"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{Headers, SinkError, StoredTraceEvent};

    /// Keeps rows in memory and refuses events whose state is `poison`.
    #[derive(Default)]
    struct MemoryStore {
        rows: Vec<StoredTraceEvent>,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn ensure_schema(&mut self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn append(&mut self, event: &TraceEvent) -> Result<i64, SinkError> {
            if event.state == "poison" {
                return Err(SinkError::Persistence("constraint violated".to_string()));
            }
            let id = i64::try_from(self.rows.len()).unwrap_or(i64::MAX) + 1;
            self.rows.push(StoredTraceEvent {
                id,
                event: event.clone(),
            });
            Ok(id)
        }

        async fn recent(&mut self, limit: u32) -> Result<Vec<StoredTraceEvent>, SinkError> {
            Ok(self
                .rows
                .iter()
                .rev()
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn by_routing_key(
            &mut self,
            routing_key: &str,
            limit: u32,
        ) -> Result<Vec<StoredTraceEvent>, SinkError> {
            Ok(self
                .rows
                .iter()
                .rev()
                .filter(|row| row.event.routing_keys.iter().any(|key| key == routing_key))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn count(&mut self) -> Result<i64, SinkError> {
            Ok(i64::try_from(self.rows.len()).unwrap_or(i64::MAX))
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        pending: VecDeque<Inbound>,
        acked: Vec<u64>,
    }

    #[async_trait]
    impl DeliverySource for ScriptedSource {
        async fn next_delivery(&mut self) -> Result<Option<Inbound>, SinkError> {
            Ok(self.pending.pop_front())
        }

        async fn ack(&mut self, delivery_tag: u64) -> Result<(), SinkError> {
            self.acked.push(delivery_tag);
            Ok(())
        }
    }

    fn delivery(tag: u64, routing_key: &str) -> Inbound {
        Inbound::Delivery(Delivery {
            delivery_tag: tag,
            routing_key: Some(routing_key.to_string()),
            headers: None,
            body: Vec::new(),
        })
    }

    #[tokio::test]
    async fn failed_insert_does_not_block_next_delivery() {
        let mut source = ScriptedSource {
            pending: VecDeque::from([delivery(1, "poison.x"), delivery(2, "reclamo.creado")]),
            ..ScriptedSource::default()
        };
        let mut pipeline = Pipeline::new(MemoryStore::default());

        let summary = consume(&mut source, &mut pipeline, &CancellationToken::new()).await;

        assert_eq!(
            summary.unwrap_or_else(|_| unreachable!()),
            ConsumeSummary {
                delivered: 2,
                stored: 1,
                dropped: 1
            }
        );
        assert_eq!(source.acked, vec![1, 2]);
        let store = pipeline.into_store();
        assert_eq!(store.rows.len(), 1);
        assert_eq!(store.rows[0].event.state, "reclamo");
    }

    #[tokio::test]
    async fn on_delivery_reports_dropped_reason() {
        let mut pipeline = Pipeline::new(MemoryStore::default());
        let outcome = pipeline
            .on_delivery(&Delivery {
                routing_key: Some("poison".to_string()),
                ..Delivery::default()
            })
            .await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Dropped {
                reason: "persistence error: constraint violated".to_string()
            }
        );
    }

    #[tokio::test]
    async fn trace_data_records_use_legacy_mapping() {
        let data: Headers = match json!({"state": "pago", "suscriber": "billing"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut source = ScriptedSource {
            pending: VecDeque::from([Inbound::TraceData {
                delivery_tag: 9,
                data,
            }]),
            ..ScriptedSource::default()
        };
        let mut pipeline = Pipeline::new(MemoryStore::default());

        let summary = consume(&mut source, &mut pipeline, &CancellationToken::new())
            .await
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.stored, 1);
        let mut store = pipeline.into_store();
        let rows = store
            .recent(10)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(rows[0].event.subscriber.as_deref(), Some("billing"));
        assert_eq!(rows[0].event.state, "pago");
    }

    #[tokio::test]
    async fn cancelled_consumer_takes_no_delivery() {
        let mut source = ScriptedSource {
            pending: VecDeque::from([delivery(1, "a")]),
            ..ScriptedSource::default()
        };
        let mut pipeline = Pipeline::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = consume(&mut source, &mut pipeline, &cancel)
            .await
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(summary, ConsumeSummary::default());
        assert!(source.acked.is_empty());
        assert_eq!(source.pending.len(), 1);
    }

    struct BrokenSource;

    #[async_trait]
    impl DeliverySource for BrokenSource {
        async fn next_delivery(&mut self) -> Result<Option<Inbound>, SinkError> {
            Err(SinkError::Feed("channel closed".to_string()))
        }

        async fn ack(&mut self, _delivery_tag: u64) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn source_errors_end_the_loop() {
        let mut pipeline = Pipeline::new(MemoryStore::default());
        let result = consume(&mut BrokenSource, &mut pipeline, &CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(SinkError::Feed("channel closed".to_string()))
        );
    }
}
