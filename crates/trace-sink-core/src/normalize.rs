use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::{Headers, TraceEvent};

/// Key under which the bus layer nests message properties.
const PROPERTIES_KEY: &str = "properties";

/// Legacy misspelling of `subscriber` still produced upstream.
/// Read only when `subscriber` itself is absent.
const LEGACY_SUBSCRIBER_KEY: &str = "suscriber";

/// Maps a delivery's routing key and headers onto a [`TraceEvent`].
///
/// Never fails: a missing or wrongly shaped field leaves the matching
/// event field unset. An absent or empty routing key yields an empty
/// `state`.
#[must_use]
pub fn normalize(routing_key: Option<&str>, headers: Option<&Headers>) -> TraceEvent {
    let empty = Headers::new();
    let headers = headers.unwrap_or(&empty);
    let properties = headers.get(PROPERTIES_KEY).and_then(Value::as_object);

    let routing_keys = string_list(headers, "routing_keys");
    let publisher = routing_keys
        .first()
        .map(|key| first_segment(key).to_string());

    TraceEvent {
        event_time: properties.and_then(|props| epoch_seconds(props.get("timestamp"))),
        user: string_field(headers, "user"),
        app_id: properties.and_then(|props| string_field(props, "app_id")),
        state: first_segment(routing_key.unwrap_or_default()).to_string(),
        publisher,
        subscriber: string_list(headers, "routed_queues").into_iter().next(),
        exchange_name: string_field(headers, "exchange_name"),
        node: string_field(headers, "node"),
        routing_keys,
    }
}

impl TraceEvent {
    /// Builds an event from a flat trace-data mapping whose fields were
    /// already extracted upstream.
    ///
    /// Both `subscriber` and its legacy alias `suscriber` are accepted; the
    /// correctly spelled key wins when both are present.
    #[must_use]
    pub fn from_trace_data(data: &Headers) -> Self {
        Self {
            event_time: epoch_seconds(data.get("timestamp")),
            user: string_field(data, "user"),
            app_id: string_field(data, "app_id"),
            state: string_field(data, "state").unwrap_or_default(),
            routing_keys: string_list(data, "routing_keys"),
            publisher: string_field(data, "publisher"),
            subscriber: string_field(data, "subscriber")
                .or_else(|| string_field(data, LEGACY_SUBSCRIBER_KEY)),
            exchange_name: string_field(data, "exchange_name"),
            node: string_field(data, "node"),
        }
    }
}

/// Part of `value` before the first `.`, or all of it when there is none.
fn first_segment(value: &str) -> &str {
    value.split_once('.').map_or(value, |(head, _)| head)
}

fn string_field(map: &Headers, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// String elements of the array under `key`. Other elements are skipped.
fn string_list(map: &Headers, key: &str) -> Vec<String> {
    let Some(items) = map.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    let strings: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    if strings.len() < items.len() {
        debug!(
            key,
            skipped = items.len() - strings.len(),
            "ignoring non-string header list elements"
        );
    }
    strings
}

fn epoch_seconds(value: Option<&Value>) -> Option<OffsetDateTime> {
    let seconds = match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(whole_seconds))?,
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(whole_seconds))?
        }
        _ => return None,
    };
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn whole_seconds(value: f64) -> Option<i64> {
    let floored = value.floor();
    if !floored.is_finite() || floored < i64::MIN as f64 || floored >= i64::MAX as f64 {
        return None;
    }
    Some(floored as i64)
}
