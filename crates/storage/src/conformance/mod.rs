//! Conformance test suite for `ReplayStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `ReplayStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Schema**: table creation, registry, name validation
//! - **Ingest**: snapshot visibility, atomic replace, duplicate handling
//! - **Claim**: candidate lookup, exhaust-once, instance binding, generations
//! - **Concurrency**: racing claims on one record, claims on distinct records
//! - **Settings**: create and overwrite
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use logreplay_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async { fresh_sqlite_storage() }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod claim;
mod concurrent;
mod ingest;
mod schema;
mod settings;

use std::fmt;
use std::future::Future;

use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use crate::record::{CallRecord, EventType, InputParams, RecordedResponse};
use crate::ReplayStorage;

/// Table used by every conformance test.
const TABLE: &str = "calls";

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "schema", "ingest", "claim").
    pub category: String,
    /// Test name (e.g. "ensure_table_is_idempotent").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(schema::run_schema_tests(&factory).await);
    results.extend(ingest::run_ingest_tests(&factory).await);
    results.extend(claim::run_claim_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);
    results.extend(settings::run_settings_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const BASE_TIME: OffsetDateTime = datetime!(2024-03-01 09:00:00 UTC);

/// A call record with sensible defaults: endpoint `submitOrder`, one
/// parameter `orderId`, one terminal response.
fn make_call(instance: &str, activity: &str, order_id: &str, second: i64) -> CallRecord {
    let mut input_params = InputParams::new();
    input_params.insert("orderId".to_string(), serde_json::json!(order_id));
    CallRecord {
        instance_uuid: instance.to_string(),
        activity_uuid: activity.to_string(),
        endpoint_name: "submitOrder".to_string(),
        call_timestamp: BASE_TIME + Duration::seconds(second),
        input_params,
        responses: RecordedResponse::sequence(vec![(
            0,
            serde_json::json!({ "status": "ok", "instance": instance }),
        )]),
        event_type: EventType::Call,
        spawns_instance: false,
    }
}

/// Create `TABLE` and insert `records` in one committed snapshot.
async fn seed<S: ReplayStorage>(storage: &S, records: &[CallRecord]) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .ensure_table(&mut snap, TABLE)
        .await
        .map_err(|e| format!("ensure: {e}"))?;
    storage
        .insert_call_records(&mut snap, TABLE, records)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

fn signature_of(order_id: &str) -> String {
    make_call("i", "a", order_id, 0).signature()
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(msg())
    }
}
