use std::future::Future;

use super::{ensure, make_call, seed, TestResult, TABLE};
use crate::record::{CallFilter, EventType};
use crate::ReplayStorage;

pub(super) async fn run_ingest_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "ingest",
            "uncommitted_inserts_invisible",
            uncommitted_inserts_invisible(factory).await,
        ),
        TestResult::from_result(
            "ingest",
            "aborted_replace_keeps_prior_rows",
            aborted_replace_keeps_prior_rows(factory).await,
        ),
        TestResult::from_result(
            "ingest",
            "replace_leaves_only_new_rows",
            replace_leaves_only_new_rows(factory).await,
        ),
        TestResult::from_result(
            "ingest",
            "duplicates_ignored_and_not_counted",
            duplicates_ignored_and_not_counted(factory).await,
        ),
        TestResult::from_result(
            "ingest",
            "stored_record_round_trips",
            stored_record_round_trips(factory).await,
        ),
        TestResult::from_result(
            "ingest",
            "count_calls_applies_filters",
            count_calls_applies_filters(factory).await,
        ),
    ]
}

async fn uncommitted_inserts_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_call_records(&mut snap, TABLE, &[make_call("i1", "a1", "42", 0)])
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let count = storage
        .count_calls(TABLE, CallFilter::default())
        .await
        .map_err(|e| e.to_string())?;
    ensure(count == 0, || format!("aborted insert visible: {count} rows"))
}

async fn aborted_replace_keeps_prior_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let prior: Vec<_> = (0..3)
        .map(|i| make_call(&format!("old-{i}"), "a1", "42", i))
        .collect();
    seed(&storage, &prior).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let removed = storage
        .clear_table(&mut snap, TABLE)
        .await
        .map_err(|e| format!("clear: {e}"))?;
    ensure(removed == 3, || format!("clear reported {removed} rows, expected 3"))?;
    storage
        .insert_call_records(&mut snap, TABLE, &[make_call("new", "a1", "42", 0)])
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let calls = storage
        .list_calls(TABLE, 0)
        .await
        .map_err(|e| e.to_string())?;
    let instances: Vec<&str> = calls
        .iter()
        .map(|c| c.record.instance_uuid.as_str())
        .collect();
    ensure(instances == ["old-0", "old-1", "old-2"], || {
        format!("prior rows not preserved: {instances:?}")
    })?;
    let generation = storage
        .table_generation(TABLE)
        .await
        .map_err(|e| e.to_string())?;
    ensure(generation == 0, || {
        format!("aborted clear bumped generation to {generation}")
    })
}

async fn replace_leaves_only_new_rows<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let prior: Vec<_> = (0..4)
        .map(|i| make_call(&format!("old-{i}"), "a1", "42", i))
        .collect();
    seed(&storage, &prior).await?;

    let fresh: Vec<_> = (0..5)
        .map(|i| make_call(&format!("new-{i}"), "a1", "42", i))
        .collect();
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .clear_table(&mut snap, TABLE)
        .await
        .map_err(|e| format!("clear: {e}"))?;
    let inserted = storage
        .insert_call_records(&mut snap, TABLE, &fresh)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    ensure(inserted == 5, || format!("inserted {inserted}, expected 5"))?;

    let calls = storage
        .list_calls(TABLE, 0)
        .await
        .map_err(|e| e.to_string())?;
    ensure(calls.len() == 5, || format!("expected 5 rows, got {}", calls.len()))?;
    ensure(
        calls
            .iter()
            .all(|c| c.record.instance_uuid.starts_with("new-")),
        || "old rows survived replace".to_string(),
    )?;
    let generation = storage
        .table_generation(TABLE)
        .await
        .map_err(|e| e.to_string())?;
    ensure(generation == 1, || {
        format!("replace should bump generation to 1, got {generation}")
    })?;
    ensure(calls.iter().all(|c| c.id.generation == 1), || {
        "listed ids carry a stale generation".to_string()
    })
}

async fn duplicates_ignored_and_not_counted<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[make_call("i1", "a1", "42", 0)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let inserted = storage
        .insert_call_records(
            &mut snap,
            TABLE,
            &[
                make_call("i1", "a1", "42", 0),
                make_call("i1", "a2", "42", 1),
                make_call("i1", "a2", "42", 1),
            ],
        )
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    ensure(inserted == 1, || format!("expected 1 inserted, got {inserted}"))?;
    let count = storage
        .count_calls(TABLE, CallFilter::default())
        .await
        .map_err(|e| e.to_string())?;
    ensure(count == 2, || format!("expected 2 rows, got {count}"))
}

async fn stored_record_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut record = make_call("i1", "a1", "42", 7);
    record.input_params.insert("qty".to_string(), serde_json::json!(3));
    record.responses = crate::RecordedResponse::sequence(vec![
        (0, serde_json::json!([{"name": "status", "mimetype": "text/plain", "data": "queued"}])),
        (1500, serde_json::json!({"status": "shipped"})),
    ]);
    record.event_type = EventType::Start;
    record.spawns_instance = true;
    seed(&storage, std::slice::from_ref(&record)).await?;

    let calls = storage
        .list_calls(TABLE, 0)
        .await
        .map_err(|e| e.to_string())?;
    let stored = calls.first().ok_or("no row stored")?;
    ensure(stored.record == record, || {
        format!("round trip changed the record: {:?} != {:?}", stored.record, record)
    })?;
    let keys: Vec<&str> = stored.record.input_params.keys().map(String::as_str).collect();
    ensure(keys == ["orderId", "qty"], || {
        format!("parameter order not preserved: {keys:?}")
    })?;
    ensure(stored.consumed_by.is_none(), || {
        "fresh row already consumed".to_string()
    })
}

async fn count_calls_applies_filters<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut start = make_call("i1", "a1", "42", 0);
    start.event_type = EventType::Start;
    seed(
        &storage,
        &[start, make_call("i1", "a2", "43", 1), make_call("i1", "a3", "44", 2)],
    )
    .await?;

    let starts = storage
        .count_calls(
            TABLE,
            CallFilter {
                event_type: Some(EventType::Start),
                ..CallFilter::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(starts == 1, || format!("expected 1 start, got {starts}"))?;

    let unconsumed = storage
        .count_calls(
            TABLE,
            CallFilter {
                consumed: Some(false),
                ..CallFilter::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(unconsumed == 3, || format!("expected 3 unconsumed, got {unconsumed}"))
}
