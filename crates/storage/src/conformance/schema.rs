use std::future::Future;

use super::{ensure, seed, TestResult, TABLE};
use crate::{StorageError, ReplayStorage};

pub(super) async fn run_schema_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "schema",
            "ensure_table_registers_at_generation_0",
            ensure_table_registers_at_generation_0(factory).await,
        ),
        TestResult::from_result(
            "schema",
            "ensure_table_is_idempotent",
            ensure_table_is_idempotent(factory).await,
        ),
        TestResult::from_result(
            "schema",
            "invalid_table_name_rejected",
            invalid_table_name_rejected(factory).await,
        ),
        TestResult::from_result(
            "schema",
            "unknown_table_reports_not_found",
            unknown_table_reports_not_found(factory).await,
        ),
        TestResult::from_result(
            "schema",
            "tables_coexist_independently",
            tables_coexist_independently(factory).await,
        ),
    ]
}

async fn ensure_table_registers_at_generation_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    ensure(
        !storage.table_exists(TABLE).await.map_err(|e| e.to_string())?,
        || "fresh store already has the table".to_string(),
    )?;
    seed(&storage, &[]).await?;
    ensure(
        storage.table_exists(TABLE).await.map_err(|e| e.to_string())?,
        || "table not registered after commit".to_string(),
    )?;
    let generation = storage
        .table_generation(TABLE)
        .await
        .map_err(|e| e.to_string())?;
    ensure(generation == 0, || format!("expected generation 0, got {generation}"))
}

async fn ensure_table_is_idempotent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[super::make_call("i1", "a1", "42", 0)]).await?;
    seed(&storage, &[]).await?;
    let tables = storage.list_tables().await.map_err(|e| e.to_string())?;
    ensure(tables == vec![TABLE.to_string()], || {
        format!("expected [{TABLE}], got {tables:?}")
    })?;
    let calls = storage
        .list_calls(TABLE, 0)
        .await
        .map_err(|e| e.to_string())?;
    ensure(calls.len() == 1, || {
        format!("re-ensuring dropped rows: {} left", calls.len())
    })
}

async fn invalid_table_name_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage.ensure_table(&mut snap, "_settings").await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::InvalidTableName { .. }) => Ok(()),
        other => Err(format!("expected InvalidTableName, got {other:?}")),
    }
}

async fn unknown_table_reports_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.find_candidates("missing", "sig").await {
        Err(StorageError::TableNotFound(name)) if name == "missing" => {}
        other => return Err(format!("find_candidates: expected TableNotFound, got {other:?}")),
    }
    match storage.table_generation("missing").await {
        Err(StorageError::TableNotFound(_)) => {}
        other => return Err(format!("table_generation: expected TableNotFound, got {other:?}")),
    }

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let result = storage.clear_table(&mut snap, "missing").await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::TableNotFound(_)) => Ok(()),
        other => Err(format!("clear_table: expected TableNotFound, got {other:?}")),
    }
}

async fn tables_coexist_independently<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed(&storage, &[super::make_call("i1", "a1", "42", 0)]).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .ensure_table(&mut snap, "experiment-2")
        .await
        .map_err(|e| format!("ensure: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let tables = storage.list_tables().await.map_err(|e| e.to_string())?;
    ensure(
        tables == vec![TABLE.to_string(), "experiment-2".to_string()],
        || format!("unexpected table list {tables:?}"),
    )?;
    let other = storage
        .list_calls("experiment-2", 0)
        .await
        .map_err(|e| e.to_string())?;
    ensure(other.is_empty(), || {
        format!("new table should be empty, has {} rows", other.len())
    })
}
