use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Fixed-width UTC rendering used for stored timestamps, so that lexical
/// order in the database equals chronological order.
const STORED_TIMESTAMP: &[time::format_description::FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

/// Ordered input parameters of a recorded call.
pub type InputParams = IndexMap<String, serde_json::Value>;

/// How a call record relates to the trace it was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The earliest call of its instance. Matching it instantiates a new
    /// live binding.
    Start,
    /// A mid-trace call with a recorded calling event.
    Call,
    /// Responses recorded without a calling event.
    Orphan,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Call => "call",
            Self::Orphan => "orphan",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "call" => Some(Self::Call),
            "orphan" => Some(Self::Orphan),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded response of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResponse {
    /// Milliseconds between the original call and this response.
    pub offset_ms: u64,
    /// The recorded response data, as found in the trace.
    pub payload: serde_json::Value,
    /// True only for the last response of the sequence.
    pub terminal: bool,
}

impl RecordedResponse {
    /// Build a response sequence from `(offset_ms, payload)` pairs, marking
    /// the last entry terminal.
    pub fn sequence(entries: Vec<(u64, serde_json::Value)>) -> Vec<RecordedResponse> {
        let last = entries.len().saturating_sub(1);
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (offset_ms, payload))| RecordedResponse {
                offset_ms,
                payload,
                terminal: i == last,
            })
            .collect()
    }
}

/// One activity's recorded request parameters plus its recorded responses.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub instance_uuid: String,
    pub activity_uuid: String,
    pub endpoint_name: String,
    pub call_timestamp: OffsetDateTime,
    pub input_params: InputParams,
    pub responses: Vec<RecordedResponse>,
    pub event_type: EventType,
    /// The activity spawned a sub-process instance (`task/instantiation`).
    pub spawns_instance: bool,
}

impl CallRecord {
    /// Parameter signature of this record. See [`crate::param_signature`].
    pub fn signature(&self) -> String {
        crate::signature::param_signature(&self.endpoint_name, &self.input_params)
    }

    /// Check the response invariant: a non-empty sequence has exactly one
    /// terminal entry, the last one.
    pub fn responses_well_formed(&self) -> bool {
        let n = self.responses.len();
        self.responses
            .iter()
            .enumerate()
            .all(|(i, r)| r.terminal == (i + 1 == n))
    }

    /// Canonical JSON rendering of the input parameters, as stored.
    pub fn input_params_json(&self) -> String {
        serde_json::to_string(&self.input_params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Identity of a stored call, valid for the table generation it was read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    pub generation: u64,
    pub row: i64,
}

/// A call record as stored, with its consumption state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCall {
    pub id: CallId,
    pub record: CallRecord,
    /// Live caller that consumed this record, if any.
    pub consumed_by: Option<String>,
    pub consumed_at: Option<OffsetDateTime>,
}

/// An unconsumed record of a signature group, as seen by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: CallId,
    pub instance_uuid: String,
    pub call_timestamp: OffsetDateTime,
    pub event_type: EventType,
    /// Live caller that already owns this candidate's instance, if any.
    pub bound_to: Option<String>,
}

/// An atomic claim of one stored call on behalf of a live caller.
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: CallId,
    pub caller: String,
    pub claimed_at: OffsetDateTime,
}

/// Filter for [`crate::ReplayStorage::count_calls`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFilter {
    pub consumed: Option<bool>,
    pub event_type: Option<EventType>,
}

/// Render a timestamp in the stored fixed-width UTC form.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(STORED_TIMESTAMP)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Parse a stored timestamp, falling back to RFC 3339 for values written by
/// other tools.
pub fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    if let Ok(ts) = PrimitiveDateTime::parse(value, STORED_TIMESTAMP) {
        return Some(ts.assume_utc());
    }
    OffsetDateTime::parse(value, &Rfc3339).ok()
}
