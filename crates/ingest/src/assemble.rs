//! Merge the events of one activity into a single call record.

use indexmap::IndexMap;
use logreplay_storage::{CallRecord, EventType, InputParams, RecordedResponse};
use time::OffsetDateTime;

use crate::xes::{Lifecycle, TraceEvent};

/// Records assembled from one trace file.
#[derive(Debug, Default)]
pub struct Assembled {
    pub records: Vec<CallRecord>,
    /// Calls still open at end of file, finalised anyway.
    pub unfinished: usize,
}

struct PendingCall {
    endpoint: String,
    call_timestamp: OffsetDateTime,
    input_params: InputParams,
    responses: Vec<(OffsetDateTime, serde_json::Value)>,
    spawns_instance: bool,
    orphan: bool,
}

impl PendingCall {
    fn into_record(self, instance_uuid: String, activity_uuid: String) -> CallRecord {
        let call_timestamp = self.call_timestamp;
        let mut offsets: Vec<(u64, serde_json::Value)> = self
            .responses
            .into_iter()
            .map(|(at, payload)| {
                let ms = (at - call_timestamp).whole_milliseconds().max(0);
                (u64::try_from(ms).unwrap_or(u64::MAX), payload)
            })
            .collect();
        offsets.sort_by_key(|(offset, _)| *offset);
        CallRecord {
            instance_uuid,
            activity_uuid,
            endpoint_name: self.endpoint,
            call_timestamp,
            input_params: self.input_params,
            responses: RecordedResponse::sequence(offsets),
            event_type: if self.orphan {
                EventType::Orphan
            } else {
                EventType::Call
            },
            spawns_instance: self.spawns_instance,
        }
    }
}

/// Input parameters of a calling event: each `{name, value}` entry of its
/// data list, in order. Entries without a name are dropped.
pub fn input_params(data: &serde_json::Value) -> InputParams {
    let mut params = InputParams::new();
    if let serde_json::Value::Array(entries) = data {
        for entry in entries {
            if let Some(name) = entry.get("name").and_then(|n| n.as_str()) {
                let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
                params.insert(name.to_string(), value);
            }
        }
    }
    params
}

/// Fold the events of one trace file into call records.
pub fn assemble(source: &str, events: Vec<TraceEvent>) -> Assembled {
    let mut pending: IndexMap<(String, String), PendingCall> = IndexMap::new();
    let mut assembled = Assembled::default();

    for event in events {
        let key = (event.instance_uuid, event.activity_uuid);
        match event.lifecycle {
            Lifecycle::Calling => {
                let call = PendingCall {
                    endpoint: event.endpoint,
                    call_timestamp: event.timestamp,
                    input_params: input_params(&event.data),
                    responses: Vec::new(),
                    spawns_instance: false,
                    orphan: false,
                };
                if let Some(previous) = pending.shift_remove(&key) {
                    tracing::debug!(
                        source,
                        instance = %key.0,
                        activity = %key.1,
                        "activity called again before done, closing previous call"
                    );
                    assembled
                        .records
                        .push(previous.into_record(key.0.clone(), key.1.clone()));
                }
                pending.insert(key, call);
            }
            Lifecycle::Receiving => {
                let call = pending.entry(key).or_insert_with(|| PendingCall {
                    endpoint: event.endpoint,
                    call_timestamp: event.timestamp,
                    input_params: InputParams::new(),
                    responses: Vec::new(),
                    spawns_instance: false,
                    orphan: true,
                });
                call.responses.push((event.timestamp, event.data));
            }
            Lifecycle::Instantiation => {
                if let Some(call) = pending.get_mut(&key) {
                    call.spawns_instance = true;
                }
            }
            Lifecycle::Done => match pending.shift_remove(&key) {
                Some(call) => assembled.records.push(call.into_record(key.0, key.1)),
                None => {
                    tracing::debug!(source, instance = %key.0, activity = %key.1, "done without an open call");
                }
            },
            Lifecycle::Other(_) => {}
        }
    }

    for ((instance_uuid, activity_uuid), call) in pending {
        tracing::warn!(
            source,
            instance = %instance_uuid,
            activity = %activity_uuid,
            "activity never completed, keeping recorded responses"
        );
        assembled.unfinished += 1;
        assembled
            .records
            .push(call.into_record(instance_uuid, activity_uuid));
    }
    assembled
}

/// Order records by instance and call time, and mark the earliest record of
/// each instance as its `Start`. Returns the number of start records.
pub fn classify(records: &mut [CallRecord]) -> usize {
    records.sort_by(|a, b| {
        a.instance_uuid
            .cmp(&b.instance_uuid)
            .then(a.call_timestamp.cmp(&b.call_timestamp))
    });
    let mut starts = 0;
    for i in 0..records.len() {
        if i == 0 || records[i - 1].instance_uuid != records[i].instance_uuid {
            records[i].event_type = EventType::Start;
            starts += 1;
        }
    }
    starts
}
