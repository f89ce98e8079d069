//! Reader for XES-YAML traces as exported by the CPEE engine.
//!
//! A trace file is a stream of YAML documents. The first one describes the
//! log and is skipped; each later document wraps a single `event` mapping.

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// Lifecycle transition of a trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// `activity/calling`: the engine sent the request.
    Calling,
    /// `activity/receiving`: a (possibly partial) response arrived.
    Receiving,
    /// `task/instantiation`: the activity spawned a sub-process instance.
    Instantiation,
    /// `activity/done`: the activity completed.
    Done,
    /// Any other transition. Ignored by the assembler.
    Other(String),
}

impl Lifecycle {
    pub fn parse(value: &str) -> Self {
        match value {
            "activity/calling" => Lifecycle::Calling,
            "activity/receiving" => Lifecycle::Receiving,
            "task/instantiation" => Lifecycle::Instantiation,
            "activity/done" => Lifecycle::Done,
            other => Lifecycle::Other(other.to_string()),
        }
    }
}

/// One decoded event of a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub instance_uuid: String,
    pub activity_uuid: String,
    /// Logical endpoint name; empty when the event does not carry one.
    pub endpoint: String,
    pub timestamp: OffsetDateTime,
    pub lifecycle: Lifecycle,
    /// The event's `data` (or `raw`) payload, an empty list if absent.
    pub data: serde_json::Value,
}

/// Result of reading one trace file.
#[derive(Debug, Default)]
pub struct ParsedTrace {
    pub events: Vec<TraceEvent>,
    /// Documents that were skipped as malformed.
    pub skipped: usize,
    /// Reading stopped early at a YAML syntax error.
    pub truncated: bool,
}

#[derive(Deserialize)]
struct Document {
    event: Option<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "cpee:instance")]
    instance: Option<String>,
    #[serde(rename = "cpee:activity_uuid")]
    activity_uuid: Option<String>,
    #[serde(rename = "concept:endpoint")]
    endpoint: Option<String>,
    #[serde(rename = "time:timestamp")]
    timestamp: Option<String>,
    #[serde(rename = "cpee:lifecycle:transition")]
    lifecycle: Option<String>,
    data: Option<serde_json::Value>,
    raw: Option<serde_json::Value>,
}

/// Read the events of one trace. `source` names the file in log output.
///
/// Malformed documents are skipped and counted. A YAML syntax error ends the
/// read; events decoded before it are kept.
pub fn parse_trace(source: &str, text: &str) -> ParsedTrace {
    let mut parsed = ParsedTrace::default();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = match serde_yaml::Value::deserialize(document) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(source, document = index, error = %e, "YAML syntax error, ignoring rest of file");
                parsed.truncated = true;
                break;
            }
        };
        // Log metadata.
        if index == 0 || value.is_null() {
            continue;
        }
        match decode_event(value) {
            Ok(event) => parsed.events.push(event),
            Err(reason) => {
                tracing::warn!(source, document = index, %reason, "skipping malformed entry");
                parsed.skipped += 1;
            }
        }
    }
    parsed
}

fn decode_event(value: serde_yaml::Value) -> Result<TraceEvent, String> {
    let document: Document =
        serde_yaml::from_value(value).map_err(|e| format!("unexpected shape: {e}"))?;
    let event = document.event.ok_or("document has no event")?;

    let instance_uuid = non_empty(event.instance).ok_or("missing cpee:instance")?;
    let activity_uuid = non_empty(event.activity_uuid).ok_or("missing cpee:activity_uuid")?;
    let lifecycle = non_empty(event.lifecycle).ok_or("missing cpee:lifecycle:transition")?;
    let raw_ts = event.timestamp.ok_or("missing time:timestamp")?;
    let timestamp = OffsetDateTime::parse(raw_ts.trim(), &Rfc3339)
        .map_err(|e| format!("bad time:timestamp {raw_ts:?}: {e}"))?
        .to_offset(UtcOffset::UTC);

    Ok(TraceEvent {
        instance_uuid,
        activity_uuid,
        endpoint: event.endpoint.unwrap_or_default(),
        timestamp,
        lifecycle: Lifecycle::parse(&lifecycle),
        data: event
            .data
            .or(event.raw)
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ORDER_TRACE;
    use time::macros::datetime;

    #[test]
    fn reads_events_after_metadata() {
        let parsed = parse_trace("order.xes.yaml", ORDER_TRACE);
        assert_eq!(parsed.skipped, 0);
        assert!(!parsed.truncated);
        assert_eq!(parsed.events.len(), 8);

        let first = &parsed.events[0];
        assert_eq!(first.instance_uuid, "inst-1");
        assert_eq!(first.activity_uuid, "a1");
        assert_eq!(first.endpoint, "submitOrder");
        assert_eq!(first.lifecycle, Lifecycle::Calling);
        assert_eq!(first.timestamp, datetime!(2024-03-01 08:00:00 UTC));
        assert_eq!(
            first.data,
            serde_json::json!([{ "name": "orderId", "value": "42" }])
        );
    }

    #[test]
    fn malformed_documents_are_skipped_and_counted() {
        let text = "\
log: {}
---
event:
  cpee:instance: i1
  cpee:activity_uuid: a1
  cpee:lifecycle:transition: activity/calling
  time:timestamp: 'yesterday'
---
- just
- a list
---
note: no event here
---
event:
  cpee:instance: i1
  cpee:activity_uuid: a1
  cpee:lifecycle:transition: activity/done
  time:timestamp: '2024-03-01T09:00:00Z'
";
        let parsed = parse_trace("bad.xes.yaml", text);
        assert_eq!(parsed.skipped, 3);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].lifecycle, Lifecycle::Done);
        assert_eq!(parsed.events[0].data, serde_json::json!([]));
    }

    #[test]
    fn syntax_error_keeps_earlier_events() {
        let text = "\
log: {}
---
event:
  cpee:instance: i1
  cpee:activity_uuid: a1
  cpee:lifecycle:transition: activity/calling
  time:timestamp: '2024-03-01T09:00:00Z'
---
event: [unclosed
";
        let parsed = parse_trace("broken.xes.yaml", text);
        assert!(parsed.truncated);
        assert_eq!(parsed.events.len(), 1);
    }

    #[test]
    fn raw_is_used_when_data_is_absent() {
        let text = "\
log: {}
---
event:
  cpee:instance: i1
  cpee:activity_uuid: a1
  cpee:lifecycle:transition: activity/receiving
  time:timestamp: '2024-03-01T09:00:00Z'
  raw: plain text body
";
        let parsed = parse_trace("raw.xes.yaml", text);
        assert_eq!(parsed.events[0].data, serde_json::json!("plain text body"));
        assert_eq!(parsed.events[0].endpoint, "");
    }

    #[test]
    fn unknown_transitions_are_kept_as_other() {
        assert_eq!(
            Lifecycle::parse("dataelements/change"),
            Lifecycle::Other("dataelements/change".to_string())
        );
    }
}
