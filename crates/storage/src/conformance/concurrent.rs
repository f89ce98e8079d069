use std::future::Future;
use std::sync::Arc;

use super::{make_call, seed, signature_of, TestResult, BASE_TIME, TABLE};
use crate::record::{CallFilter, Claim};
use crate::{ReplayStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "racing_claims_exactly_one_wins",
            racing_claims_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "racing_callers_split_instances",
            racing_callers_split_instances(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "claims_on_distinct_records_all_succeed",
            claims_on_distinct_records_all_succeed(factory).await,
        ),
    ]
}

// ── One record, N callers ────────────────────────────────────────────────────

/// N tasks race to claim the same record. Exactly one wins; the rest see a
/// claim conflict.
async fn racing_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed(storage.as_ref(), &[make_call("i1", "a1", "42", 0)]).await?;
    let candidate = storage
        .find_candidates(TABLE, &signature_of("42"))
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .next()
        .ok_or("no candidate")?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let claim = Claim {
                id: candidate.id,
                caller: format!("caller-{i}"),
                claimed_at: BASE_TIME,
            };
            match s.claim_call(TABLE, &claim).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_claim_conflict() => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

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
    if consumed != 1 {
        return Err(format!("expected 1 consumed row, got {consumed}"));
    }
    Ok(())
}

// ── Many instances, many callers ─────────────────────────────────────────────

/// N callers each walk the candidate list for the same signature and claim
/// the first record they can. Every caller ends up with a different instance.
async fn racing_callers_split_instances<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let records: Vec<_> = (0..N)
        .map(|i| make_call(&format!("inst-{i}"), "a1", "42", i as i64))
        .collect();
    seed(storage.as_ref(), &records).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let caller = format!("caller-{i}");
            for candidate in s.find_candidates(TABLE, &signature_of("42")).await? {
                let claim = Claim {
                    id: candidate.id,
                    caller: caller.clone(),
                    claimed_at: BASE_TIME,
                };
                match s.claim_call(TABLE, &claim).await {
                    Ok(call) => return Ok(Some(call.record.instance_uuid)),
                    Err(e) if e.is_claim_conflict() => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(None)
        }));
    }

    let mut claimed = Vec::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let instance = handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e: StorageError| format!("task {i} failed: {e}"))?;
        // A caller that saw a stale candidate list may come up empty.
        if let Some(instance) = instance {
            claimed.push(instance);
        }
    }

    let mut unique = claimed.clone();
    unique.sort();
    unique.dedup();
    if unique.len() != claimed.len() {
        return Err(format!("an instance was claimed twice: {claimed:?}"));
    }
    if claimed.is_empty() {
        return Err("no caller claimed anything".to_string());
    }
    Ok(())
}

// ── Distinct records ─────────────────────────────────────────────────────────

/// N tasks each claim a different record. All succeed.
async fn claims_on_distinct_records_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let records: Vec<_> = (0..N)
        .map(|i| make_call(&format!("inst-{i}"), "a1", &format!("order-{i}"), 0))
        .collect();
    seed(storage.as_ref(), &records).await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let candidate = s
                .find_candidates(TABLE, &signature_of(&format!("order-{i}")))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::Backend(format!("no candidate for order-{i}")))?;
            let claim = Claim {
                id: candidate.id,
                caller: format!("caller-{i}"),
                claimed_at: BASE_TIME,
            };
            s.claim_call(TABLE, &claim).await.map(|_| ())
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

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
    if consumed != N as u64 {
        return Err(format!("expected {N} consumed rows, got {consumed}"));
    }
    Ok(())
}
