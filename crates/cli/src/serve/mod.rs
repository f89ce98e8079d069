//! `logreplay serve` -- HTTP replay endpoint for a CPEE engine.
//!
//! The engine calls the replay endpoint instead of the real service. A
//! matching recorded call is acknowledged at once and its recorded responses
//! are replayed to the engine's callback with the recorded timing.
//!
//! Endpoints:
//! - POST|PUT|GET /replay         - Answer a service call from the replay table
//! - POST|PUT|GET /cpee/replay    - Alias of /replay
//! - GET  /health                 - Served table, record counts, pending deliveries

mod handlers;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use logreplay_engine::{DeliveryConfig, DeliveryScheduler, Matcher, RequestHandler};
use logreplay_storage::{
    keys, validate_table_name, ReplayStorage, SqliteStorage, StorageError, DEFAULT_TABLE,
};
use tower_http::trace::TraceLayer;

use self::handlers::{handle_health, handle_not_found, handle_replay};
use self::state::AppState;

/// Maximum request body size: 10 MB.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ServeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) struct ServeOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db: PathBuf,
    pub(crate) table: Option<String>,
    pub(crate) delivery: DeliveryConfig,
}

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Table to replay: the flag, else the `replay_table` setting, else the
/// `active_table` setting, else the default.
pub(crate) async fn resolve_table<S: ReplayStorage>(
    storage: &S,
    flag: Option<&str>,
) -> Result<String, StorageError> {
    if let Some(table) = flag.map(str::trim).filter(|t| !t.is_empty()) {
        validate_table_name(table)?;
        return Ok(table.to_string());
    }
    for key in [keys::REPLAY_TABLE, keys::ACTIVE_TABLE] {
        if let Some(table) = storage.get_setting(key).await? {
            let table = table.trim();
            if !table.is_empty() {
                return Ok(table.to_string());
            }
        }
    }
    Ok(DEFAULT_TABLE.to_string())
}

pub(crate) fn router<S: ReplayStorage>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(handle_health::<S>))
        .route(
            "/replay",
            get(handle_replay::<S>)
                .post(handle_replay::<S>)
                .put(handle_replay::<S>),
        )
        .route(
            "/cpee/replay",
            get(handle_replay::<S>)
                .post(handle_replay::<S>)
                .put(handle_replay::<S>),
        )
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Serve the replay endpoint until Ctrl+C, then wait for scheduled deliveries.
pub(crate) async fn start_server(options: ServeOptions) -> Result<(), ServeError> {
    let storage = Arc::new(SqliteStorage::open(&options.db)?);
    let table = resolve_table(storage.as_ref(), options.table.as_deref()).await?;
    if !storage.table_exists(&table).await? {
        tracing::warn!(%table, "replay table does not exist; no call will match until it is ingested");
    }

    let handler = RequestHandler::new(
        Matcher::new(storage, table.clone()),
        DeliveryScheduler::http(&options.delivery),
    );
    let state = Arc::new(AppState::new(handler));
    let app = router(state.clone());

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(
        %addr,
        %table,
        db = %options.db.display(),
        method = %options.delivery.method,
        max_in_flight = options.delivery.max_in_flight,
        "replay server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    state.handler.shutdown().await;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logreplay_storage::MemoryStorage;

    #[tokio::test]
    async fn table_resolution_order() {
        let storage = MemoryStorage::new();
        assert_eq!(resolve_table(&storage, None).await.unwrap(), DEFAULT_TABLE);

        storage.set_setting(keys::ACTIVE_TABLE, "loaded").await.unwrap();
        assert_eq!(resolve_table(&storage, None).await.unwrap(), "loaded");

        storage.set_setting(keys::REPLAY_TABLE, "exp1").await.unwrap();
        assert_eq!(resolve_table(&storage, None).await.unwrap(), "exp1");

        assert_eq!(resolve_table(&storage, Some("exp2")).await.unwrap(), "exp2");
    }

    #[tokio::test]
    async fn invalid_table_flag_is_rejected() {
        let storage = MemoryStorage::new();
        let err = resolve_table(&storage, Some("_tables")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTableName { .. }), "{err}");
    }
}
