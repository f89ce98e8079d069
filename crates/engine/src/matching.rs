//! Replay Matching Engine.
//!
//! Candidates for an inbound call are the unconsumed records of the replay
//! table with the same parameter signature. They are ranked, then claimed
//! one by one through the store's atomic claim until one succeeds. A lost
//! race moves on to the next candidate; a generation change (the table was
//! reloaded) refetches the candidate list.

use std::sync::Arc;

use logreplay_storage::{
    param_signature, Candidate, Claim, EventType, ReplayStorage, StorageError, StoredCall,
};
use time::OffsetDateTime;

use crate::call::InboundCall;

/// Default number of candidate refetch rounds before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no claim succeeded after {attempts} attempts")]
    Contention { attempts: usize },
}

impl MatchError {
    /// The store was temporarily unavailable; retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MatchError::Storage(StorageError::Busy(_)) | MatchError::Contention { .. }
        )
    }
}

/// Result of matching one inbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The record now consumed by the caller.
    Matched(StoredCall),
    /// No unconsumed candidate exists.
    NotFound,
}

/// Preference of a candidate for `caller`; lower is better. `None` if the
/// candidate's instance already belongs to another caller.
fn rank(candidate: &Candidate, caller: &str) -> Option<u8> {
    match candidate.bound_to.as_deref() {
        Some(owner) if owner == caller => Some(0),
        Some(_) => None,
        None if candidate.event_type == EventType::Start => Some(1),
        None => Some(2),
    }
}

/// Candidates `caller` may claim, best first.
fn rank_candidates(
    candidates: Vec<Candidate>,
    caller: &str,
    instance_hint: Option<&str>,
) -> Vec<Candidate> {
    let mut ranked: Vec<(u8, Candidate)> = candidates
        .into_iter()
        .filter(|c| instance_hint.map_or(true, |hint| c.instance_uuid == hint))
        .filter_map(|c| rank(&c, caller).map(|r| (r, c)))
        .collect();
    ranked.sort_by(|(ra, a), (rb, b)| {
        ra.cmp(rb)
            .then(a.call_timestamp.cmp(&b.call_timestamp))
            .then(a.id.row.cmp(&b.id.row))
    });
    ranked.into_iter().map(|(_, c)| c).collect()
}

/// Finds and claims recorded calls in one replay table.
pub struct Matcher<S> {
    storage: Arc<S>,
    table: String,
    max_attempts: usize,
}

impl<S: ReplayStorage> Matcher<S> {
    pub fn new(storage: Arc<S>, table: impl Into<String>) -> Self {
        Self {
            storage,
            table: table.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Table this matcher serves.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Find and claim the record answering `call`.
    pub async fn find_and_claim(&self, call: &InboundCall) -> Result<MatchOutcome, MatchError> {
        let signature = param_signature(&call.endpoint, &call.params);
        let hint = call.sim_target.instance();

        for attempt in 1..=self.max_attempts {
            let candidates = match self.storage.find_candidates(&self.table, &signature).await {
                Ok(candidates) => candidates,
                Err(StorageError::TableNotFound(table)) => {
                    tracing::warn!(%table, "replay table does not exist");
                    return Ok(MatchOutcome::NotFound);
                }
                Err(e) => return Err(e.into()),
            };
            let ranked = rank_candidates(candidates, &call.caller, hint);
            if ranked.is_empty() {
                tracing::debug!(
                    endpoint = %call.endpoint,
                    caller = %call.caller,
                    hint = ?hint,
                    "no unconsumed candidate"
                );
                return Ok(MatchOutcome::NotFound);
            }

            for candidate in ranked {
                let claim = Claim {
                    id: candidate.id,
                    caller: call.caller.clone(),
                    claimed_at: OffsetDateTime::now_utc(),
                };
                match self.storage.claim_call(&self.table, &claim).await {
                    Ok(stored) => {
                        tracing::debug!(
                            endpoint = %call.endpoint,
                            caller = %call.caller,
                            instance = %stored.record.instance_uuid,
                            row = stored.id.row,
                            attempt,
                            "claimed recorded call"
                        );
                        return Ok(MatchOutcome::Matched(stored));
                    }
                    Err(StorageError::StaleGeneration { found, .. }) => {
                        tracing::debug!(generation = found, "replay table reloaded, refetching");
                        break;
                    }
                    Err(e) if e.is_claim_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(MatchError::Contention {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{form_params, SimTarget};
    use crate::testutil::{record, seed_store};
    use logreplay_storage::{CallId, MemoryStorage, SqliteStorage};
    use std::collections::HashSet;
    use time::macros::datetime;
    use tokio::time::Instant;

    fn inbound(caller: &str, order_id: &str, hint: &str) -> InboundCall {
        InboundCall {
            endpoint: "submitOrder".to_string(),
            callback: format!("http://engine.test/{caller}/callbacks/1"),
            sim_target: SimTarget::parse(hint),
            caller: caller.to_string(),
            params: form_params([("orderId", order_id)]),
            received_at: Instant::now(),
        }
    }

    fn candidate(row: i64, instance: &str, second: i64, kind: EventType, bound: Option<&str>) -> Candidate {
        Candidate {
            id: CallId { generation: 0, row },
            instance_uuid: instance.to_string(),
            call_timestamp: datetime!(2024-03-01 09:00:00 UTC) + time::Duration::seconds(second),
            event_type: kind,
            bound_to: bound.map(str::to_string),
        }
    }

    #[test]
    fn ranking_prefers_own_instance_then_starts() {
        let ranked = rank_candidates(
            vec![
                candidate(1, "early-call", 0, EventType::Call, None),
                candidate(2, "start", 5, EventType::Start, None),
                candidate(3, "mine", 9, EventType::Call, Some("me")),
                candidate(4, "theirs", 1, EventType::Start, Some("other")),
            ],
            "me",
            None,
        );
        let order: Vec<&str> = ranked.iter().map(|c| c.instance_uuid.as_str()).collect();
        assert_eq!(order, ["mine", "start", "early-call"]);
    }

    #[test]
    fn hint_restricts_to_instance() {
        let ranked = rank_candidates(
            vec![
                candidate(1, "a", 0, EventType::Start, None),
                candidate(2, "b", 5, EventType::Start, None),
            ],
            "me",
            Some("b"),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].instance_uuid, "b");
    }

    #[tokio::test]
    async fn earliest_start_is_claimed_once() {
        let storage = Arc::new(MemoryStorage::new());
        seed_store(
            &storage,
            &[
                record("late", "a1", "42", 20, &[(0, serde_json::json!({"n": 2}))]),
                record("early", "a1", "42", 10, &[(0, serde_json::json!({"n": 1}))]),
            ],
        )
        .await;
        let matcher = Matcher::new(storage.clone(), "calls");

        let first = matcher.find_and_claim(&inbound("c1", "42", "")).await.unwrap();
        let MatchOutcome::Matched(first) = first else {
            panic!("expected a match");
        };
        assert_eq!(first.record.instance_uuid, "early");
        assert_eq!(first.consumed_by.as_deref(), Some("c1"));

        let second = matcher.find_and_claim(&inbound("c2", "42", "")).await.unwrap();
        let MatchOutcome::Matched(second) = second else {
            panic!("expected a match");
        };
        assert_eq!(second.record.instance_uuid, "late");

        let third = matcher.find_and_claim(&inbound("c3", "42", "")).await.unwrap();
        assert_eq!(third, MatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn unknown_hint_instance_is_not_found() {
        let storage = Arc::new(MemoryStorage::new());
        seed_store(&storage, &[record("i1", "a1", "42", 0, &[])]).await;
        let matcher = Matcher::new(storage, "calls");
        let outcome = matcher
            .find_and_claim(&inbound("c1", "42", "instance=nope"))
            .await
            .unwrap();
        assert_eq!(outcome, MatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let matcher = Matcher::new(Arc::new(MemoryStorage::new()), "calls");
        let outcome = matcher.find_and_claim(&inbound("c1", "42", "")).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn follow_up_call_stays_with_bound_instance() {
        let storage = Arc::new(MemoryStorage::new());
        seed_store(
            &storage,
            &[
                record("i1", "a1", "1", 0, &[]),
                record("i1", "a2", "2", 5, &[]),
                record("i2", "a1", "1", 1, &[]),
                record("i2", "a2", "2", 2, &[]),
            ],
        )
        .await;
        let matcher = Matcher::new(storage, "calls");

        // c1 gets i1 (earliest start), c2 gets i2.
        for (caller, expected) in [("c1", "i1"), ("c2", "i2")] {
            let MatchOutcome::Matched(call) =
                matcher.find_and_claim(&inbound(caller, "1", "")).await.unwrap()
            else {
                panic!("expected a match for {caller}");
            };
            assert_eq!(call.record.instance_uuid, expected);
        }

        // i2's follow-up is earlier, but c1 stays on i1.
        let MatchOutcome::Matched(call) =
            matcher.find_and_claim(&inbound("c1", "2", "")).await.unwrap()
        else {
            panic!("expected a follow-up match");
        };
        assert_eq!(call.record.instance_uuid, "i1");

        // A third caller may not take over i2.
        let outcome = matcher.find_and_claim(&inbound("c3", "2", "")).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_share_an_instance() {
        let storage = Arc::new(MemoryStorage::new());
        let records: Vec<_> = (0..8)
            .map(|i| record(&format!("inst-{i}"), "a1", "42", i, &[]))
            .collect();
        seed_store(&storage, &records).await;
        let matcher = Arc::new(Matcher::new(storage, "calls"));

        let mut handles = Vec::new();
        for i in 0..12 {
            let matcher = matcher.clone();
            handles.push(tokio::spawn(async move {
                matcher
                    .find_and_claim(&inbound(&format!("caller-{i}"), "42", ""))
                    .await
            }));
        }

        let mut instances = Vec::new();
        let mut not_found = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                MatchOutcome::Matched(call) => instances.push(call.record.instance_uuid),
                MatchOutcome::NotFound => not_found += 1,
            }
        }
        let unique: HashSet<_> = instances.iter().collect();
        assert_eq!(unique.len(), instances.len(), "{instances:?}");
        assert_eq!(instances.len(), 8);
        assert_eq!(not_found, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_split_sqlite_instances() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open(dir.path().join("events.db")).unwrap());
        let records: Vec<_> = (0..8)
            .map(|i| record(&format!("inst-{i}"), "a1", "42", i, &[]))
            .collect();
        seed_store(&storage, &records).await;
        let matcher = Arc::new(Matcher::new(storage, "calls"));

        let mut handles = Vec::new();
        for i in 0..12 {
            let matcher = matcher.clone();
            handles.push(tokio::spawn(async move {
                matcher
                    .find_and_claim(&inbound(&format!("caller-{i}"), "42", ""))
                    .await
            }));
        }

        let mut instances = Vec::new();
        let mut not_found = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                MatchOutcome::Matched(call) => instances.push(call.record.instance_uuid),
                MatchOutcome::NotFound => not_found += 1,
            }
        }
        let unique: HashSet<_> = instances.iter().collect();
        assert_eq!(unique.len(), instances.len(), "{instances:?}");
        assert_eq!(instances.len(), 8);
        assert_eq!(not_found, 4);
    }
}
