//! Shared helpers for the engine unit tests.

use std::sync::Arc;

use logreplay_storage::{
    CallRecord, EventType, InputParams, RecordedResponse, ReplayStorage,
};
use time::macros::datetime;
use time::Duration;

/// A `submitOrder` call with a single `orderId` parameter.
pub(crate) fn record(
    instance: &str,
    activity: &str,
    order_id: &str,
    second: i64,
    responses: &[(u64, serde_json::Value)],
) -> CallRecord {
    let mut input_params = InputParams::new();
    input_params.insert("orderId".to_string(), serde_json::json!(order_id));
    CallRecord {
        instance_uuid: instance.to_string(),
        activity_uuid: activity.to_string(),
        endpoint_name: "submitOrder".to_string(),
        call_timestamp: datetime!(2024-03-01 09:00:00 UTC) + Duration::seconds(second),
        input_params,
        responses: RecordedResponse::sequence(responses.to_vec()),
        event_type: EventType::Call,
        spawns_instance: false,
    }
}

/// Store `records` in table `calls`, marking the earliest record of each
/// instance as its start.
pub(crate) async fn seed_store<S: ReplayStorage>(storage: &Arc<S>, records: &[CallRecord]) {
    let mut records = records.to_vec();
    for i in 0..records.len() {
        let instance = records[i].instance_uuid.clone();
        let earliest = records
            .iter()
            .filter(|r| r.instance_uuid == instance)
            .map(|r| r.call_timestamp)
            .min();
        if earliest == Some(records[i].call_timestamp) {
            records[i].event_type = EventType::Start;
        }
    }
    let mut snap = storage.begin_snapshot().await.unwrap();
    storage.ensure_table(&mut snap, "calls").await.unwrap();
    storage
        .insert_call_records(&mut snap, "calls", &records)
        .await
        .unwrap();
    storage.commit_snapshot(snap).await.unwrap();
}
