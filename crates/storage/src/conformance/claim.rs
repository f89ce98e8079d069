use std::future::Future;

use super::{ensure, make_call, seed, signature_of, TestResult, BASE_TIME, TABLE};
use crate::record::{CallFilter, Claim};
use crate::{ReplayStorage, StorageError};

pub(super) async fn run_claim_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "claim",
            "candidates_ordered_by_timestamp",
            candidates_ordered_by_timestamp(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "claim_consumes_exactly_once",
            claim_consumes_exactly_once(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "claimed_candidate_reports_binding",
            claimed_candidate_reports_binding(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "instance_bound_to_other_caller_rejected",
            instance_bound_to_other_caller_rejected(factory).await,
        ),
        TestResult::from_result(
            "claim",
            "stale_generation_rejected",
            stale_generation_rejected(factory).await,
        ),
    ]
}

fn claim_for(id: crate::CallId, caller: &str) -> Claim {
    Claim {
        id,
        caller: caller.to_string(),
        claimed_at: BASE_TIME,
    }
}

async fn candidates_ordered_by_timestamp<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(
        &storage,
        &[
            make_call("late", "a1", "42", 30),
            make_call("early", "a1", "42", 10),
            make_call("other-params", "a1", "43", 0),
            make_call("middle", "a1", "42", 20),
        ],
    )
    .await?;

    let candidates = storage
        .find_candidates(TABLE, &signature_of("42"))
        .await
        .map_err(|e| e.to_string())?;
    let order: Vec<&str> = candidates.iter().map(|c| c.instance_uuid.as_str()).collect();
    ensure(order == ["early", "middle", "late"], || {
        format!("unexpected candidate order {order:?}")
    })?;
    ensure(candidates.iter().all(|c| c.bound_to.is_none()), || {
        "fresh candidates report a binding".to_string()
    })
}

async fn claim_consumes_exactly_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[make_call("i1", "a1", "42", 0)]).await?;
    let sig = signature_of("42");

    let candidate = storage
        .find_candidates(TABLE, &sig)
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate")?;
    let claimed = storage
        .claim_call(TABLE, &claim_for(candidate.id, "caller-a"))
        .await
        .map_err(|e| format!("first claim: {e}"))?;
    ensure(claimed.consumed_by.as_deref() == Some("caller-a"), || {
        format!("claimed row has consumed_by {:?}", claimed.consumed_by)
    })?;
    ensure(claimed.record.instance_uuid == "i1", || {
        "claim returned the wrong record".to_string()
    })?;

    match storage
        .claim_call(TABLE, &claim_for(candidate.id, "caller-a"))
        .await
    {
        Err(StorageError::AlreadyClaimed { .. }) => {}
        other => return Err(format!("second claim: expected AlreadyClaimed, got {other:?}")),
    }

    let left = storage
        .find_candidates(TABLE, &sig)
        .await
        .map_err(|e| e.to_string())?;
    ensure(left.is_empty(), || {
        format!("consumed record still offered: {left:?}")
    })?;
    let consumed = storage
        .count_calls(
            TABLE,
            CallFilter {
                consumed: Some(true),
                ..CallFilter::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    ensure(consumed == 1, || format!("expected 1 consumed, got {consumed}"))
}

async fn claimed_candidate_reports_binding<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(
        &storage,
        &[make_call("i1", "a1", "42", 0), make_call("i1", "a2", "43", 5)],
    )
    .await?;

    let first = storage
        .find_candidates(TABLE, &signature_of("42"))
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate for 42")?;
    storage
        .claim_call(TABLE, &claim_for(first.id, "caller-a"))
        .await
        .map_err(|e| format!("claim: {e}"))?;

    let next = storage
        .find_candidates(TABLE, &signature_of("43"))
        .await
        .map_err(|e| e.to_string())?;
    let bound: Vec<Option<&str>> = next.iter().map(|c| c.bound_to.as_deref()).collect();
    ensure(bound == [Some("caller-a")], || {
        format!("expected the follow-up bound to caller-a, got {bound:?}")
    })
}

async fn instance_bound_to_other_caller_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(
        &storage,
        &[make_call("i1", "a1", "42", 0), make_call("i1", "a2", "43", 5)],
    )
    .await?;

    let first = storage
        .find_candidates(TABLE, &signature_of("42"))
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate for 42")?;
    storage
        .claim_call(TABLE, &claim_for(first.id, "caller-a"))
        .await
        .map_err(|e| format!("claim: {e}"))?;

    let follow_up = storage
        .find_candidates(TABLE, &signature_of("43"))
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate for 43")?;
    match storage
        .claim_call(TABLE, &claim_for(follow_up.id, "caller-b"))
        .await
    {
        Err(StorageError::InstanceBound { instance_uuid, .. }) if instance_uuid == "i1" => {}
        other => return Err(format!("expected InstanceBound, got {other:?}")),
    }

    // The owner itself may continue.
    storage
        .claim_call(TABLE, &claim_for(follow_up.id, "caller-a"))
        .await
        .map(|_| ())
        .map_err(|e| format!("owner continuation: {e}"))
}

async fn stale_generation_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[make_call("i1", "a1", "42", 0)]).await?;
    let candidate = storage
        .find_candidates(TABLE, &signature_of("42"))
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate")?;

    // Replace the table contents underneath the candidate.
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .clear_table(&mut snap, TABLE)
        .await
        .map_err(|e| format!("clear: {e}"))?;
    storage
        .insert_call_records(&mut snap, TABLE, &[make_call("i2", "a1", "42", 0)])
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    match storage
        .claim_call(TABLE, &claim_for(candidate.id, "caller-a"))
        .await
    {
        Err(StorageError::StaleGeneration {
            expected: 0,
            found: 1,
            ..
        }) => Ok(()),
        other => Err(format!("expected StaleGeneration 0 -> 1, got {other:?}")),
    }
}
