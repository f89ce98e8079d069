//! Replay and health route handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use logreplay_engine::{caller_identity, HandlerOutcome, InboundCall, SimTarget};
use logreplay_storage::{CallFilter, InputParams, ReplayStorage, StorageError};
use serde_json::Value;
use tokio::time::Instant;

use super::json_error;
use super::state::AppState;

/// Tells the engine whether a callback will follow.
pub(crate) const CPEE_CALLBACK: &str = "cpee-callback";
const CPEE_SIM_TARGET: &str = "cpee-sim-target";
const CPEE_INSTANCE_UUID: &str = "cpee-instance-uuid";
const CPEE_ATTR_SIM_ENGINE: &str = "cpee-attr-sim-engine";
const CPEE_ATTR_SIM_TRANSLATE: &str = "cpee-attr-sim-translate";

/// Status asking the engine to instantiate a sub-process itself.
pub(crate) const INSTANTIATION_STATUS: u16 = 561;

const ENDPOINT_PARAM: &str = "original_endpoint";
const MODEL_PARAM: &str = "url";

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health<S: ReplayStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Response {
    let matcher = state.handler.matcher();
    let table = matcher.table();
    match record_counts(matcher.storage().as_ref(), table).await {
        Ok(counts) => {
            let response = serde_json::json!({
                "status": "ok",
                "table": table,
                "table_exists": counts.is_some(),
                "records": counts.map(|(total, _)| total).unwrap_or(0),
                "unconsumed": counts.map(|(_, unconsumed)| unconsumed).unwrap_or(0),
                "pending_deliveries": state.handler.scheduler().pending(),
                "uptime_secs": state.started_at.elapsed().as_secs(),
            });
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let response = serde_json::json!({
                "status": "unavailable",
                "table": table,
                "error": e.to_string(),
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
        }
    }
}

/// (total, unconsumed) rows of `table`, or `None` if it does not exist.
async fn record_counts<S: ReplayStorage>(
    storage: &S,
    table: &str,
) -> Result<Option<(u64, u64)>, StorageError> {
    if !storage.table_exists(table).await? {
        return Ok(None);
    }
    let total = storage.count_calls(table, CallFilter::default()).await?;
    let unconsumed = storage
        .count_calls(
            table,
            CallFilter {
                consumed: Some(false),
                ..CallFilter::default()
            },
        )
        .await?;
    Ok(Some((total, unconsumed)))
}

/// POST|PUT|GET /replay
pub(crate) async fn handle_replay<S: ReplayStorage>(
    State(state): State<Arc<AppState<S>>>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received_at = Instant::now();
    let call = match inbound_call(&method, query.as_deref(), &headers, body, received_at).await {
        Ok(call) => call,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, &message).into_response(),
    };
    let endpoint = call.endpoint.clone();
    let model = call
        .params
        .get(MODEL_PARAM)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sim_target = call.sim_target.raw().to_string();

    match state.handler.handle(call).await {
        Ok(HandlerOutcome::Accepted { .. }) => {
            (StatusCode::ACCEPTED, [(CPEE_CALLBACK, "true")]).into_response()
        }
        Ok(HandlerOutcome::NotMatched) => (
            StatusCode::NOT_FOUND,
            [(CPEE_CALLBACK, "false")],
            Json(serde_json::json!({ "matched": false })),
        )
            .into_response(),
        Ok(HandlerOutcome::Instantiation { .. }) => {
            let mut response = StatusCode::from_u16(INSTANTIATION_STATUS)
                .unwrap_or(StatusCode::OK)
                .into_response();
            let out = response.headers_mut();
            out.insert("cpee-sim-tasktype", HeaderValue::from_static("i"));
            out.insert("cpee-sim-model", header_value(&model));
            out.insert("cpee-sim-target", header_value(&sim_target));
            out.insert(
                "cpee-sim-engine",
                header_value(header_str(&headers, CPEE_ATTR_SIM_ENGINE).unwrap_or_default()),
            );
            out.insert(
                "cpee-sim-translate",
                header_value(header_str(&headers, CPEE_ATTR_SIM_TRANSLATE).unwrap_or_default()),
            );
            response
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(%endpoint, error = %e, "replay store busy");
            json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(%endpoint, error = %e, "replay failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response()
        }
    }
}

/// Build the inbound call from the request. Parameters come from the query
/// string on GET and from the body otherwise.
pub(crate) async fn inbound_call(
    method: &Method,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    received_at: Instant,
) -> Result<InboundCall, String> {
    let query_pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .into_owned()
        .collect();

    let endpoint = query_pairs
        .iter()
        .find(|(name, _)| name == ENDPOINT_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing '{}' query parameter", ENDPOINT_PARAM))?;

    let callback = header_str(headers, CPEE_CALLBACK)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing '{}' header", CPEE_CALLBACK))?
        .to_string();

    let params = if *method == Method::GET {
        logreplay_engine::form_params(
            query_pairs
                .into_iter()
                .filter(|(name, _)| name != ENDPOINT_PARAM),
        )
    } else {
        body_params(headers, body).await?
    };

    Ok(InboundCall {
        caller: caller_identity(header_str(headers, CPEE_INSTANCE_UUID), &callback),
        sim_target: SimTarget::parse(header_str(headers, CPEE_SIM_TARGET).unwrap_or_default()),
        endpoint,
        callback,
        params,
        received_at,
    })
}

async fn body_params(headers: &HeaderMap, body: Bytes) -> Result<InputParams, String> {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .trim_start();
    if content_type.starts_with("multipart/form-data") {
        return multipart_params(content_type, body).await;
    }
    if !content_type.starts_with("application/json") {
        return Ok(logreplay_engine::form_params(
            url::form_urlencoded::parse(&body).into_owned(),
        ));
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InputParams::new());
    }
    match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err("JSON body must be an object".to_string()),
        Err(e) => Err(format!("invalid JSON body: {}", e)),
    }
}

/// Named parts of a `multipart/form-data` body, decoded as text.
async fn multipart_params(content_type: &str, body: Bytes) -> Result<InputParams, String> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| format!("invalid multipart body: {}", e))?;
    let stream = futures::stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut pairs = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("invalid multipart body: {}", e))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|e| format!("invalid multipart field '{}': {}", name, e))?;
        pairs.push((name, value));
    }
    Ok(logreplay_engine::form_params(pairs))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}
