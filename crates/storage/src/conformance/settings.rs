use std::future::Future;

use super::{ensure, TestResult};
use crate::schema::keys;
use crate::ReplayStorage;

pub(super) async fn run_settings_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "settings",
            "missing_setting_is_none",
            missing_setting_is_none(factory).await,
        ),
        TestResult::from_result(
            "settings",
            "set_then_overwrite",
            set_then_overwrite(factory).await,
        ),
    ]
}

async fn missing_setting_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let value = storage
        .get_setting(keys::REPLAY_TABLE)
        .await
        .map_err(|e| e.to_string())?;
    ensure(value.is_none(), || format!("fresh store has a value: {value:?}"))
}

async fn set_then_overwrite<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: ReplayStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    storage
        .set_setting(keys::ACTIVE_TABLE, "calls")
        .await
        .map_err(|e| format!("set: {e}"))?;
    storage
        .set_setting(keys::ACTIVE_TABLE, "experiment-2")
        .await
        .map_err(|e| format!("overwrite: {e}"))?;
    storage
        .set_setting(keys::LAST_LOADED_DIRECTORY, "/var/log/cpee")
        .await
        .map_err(|e| format!("set other key: {e}"))?;

    let active = storage
        .get_setting(keys::ACTIVE_TABLE)
        .await
        .map_err(|e| e.to_string())?;
    ensure(active.as_deref() == Some("experiment-2"), || {
        format!("overwrite not visible: {active:?}")
    })?;
    let dir = storage
        .get_setting(keys::LAST_LOADED_DIRECTORY)
        .await
        .map_err(|e| e.to_string())?;
    ensure(dir.as_deref() == Some("/var/log/cpee"), || {
        format!("unrelated key changed: {dir:?}")
    })
}
