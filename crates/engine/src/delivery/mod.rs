//! Delivery Scheduler: replays a claimed call's responses to its callback.
//!
//! Each call gets one background task that walks the response sequence in
//! order, sleeping until `received_at + offset` before each send. A shared
//! semaphore bounds the number of requests in flight across all calls.
//! Failures are logged per response and never stop the remaining ones.

pub mod body;
pub mod transport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use logreplay_storage::RecordedResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

pub use transport::{CallbackTransport, HttpTransport, CPEE_UPDATE_HEADER, REPLAY_LAST_HEADER};

/// Default bound on concurrent outbound callback requests.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("callback {callback} failed: {message}")]
    Transport { callback: String, message: String },

    #[error("delivery task failed: {0}")]
    Join(String),

    #[error("delivery limiter closed")]
    Closed,
}

/// HTTP method used for callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackMethod {
    #[default]
    Post,
    Put,
}

impl fmt::Display for CallbackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackMethod::Post => write!(f, "POST"),
            CallbackMethod::Put => write!(f, "PUT"),
        }
    }
}

impl FromStr for CallbackMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(CallbackMethod::Post),
            "PUT" => Ok(CallbackMethod::Put),
            other => Err(format!("unsupported callback method '{other}' (expected POST or PUT)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub max_in_flight: usize,
    pub method: CallbackMethod,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            method: CallbackMethod::Post,
        }
    }
}

/// One response on its way to a callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub callback: String,
    /// 1-based position in the call's response sequence.
    pub sequence: usize,
    pub total: usize,
    pub payload: serde_json::Value,
    /// Final delivery of the call.
    pub last: bool,
}

/// Outcome of replaying one call's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Schedules and tracks background deliveries.
#[derive(Clone)]
pub struct DeliveryScheduler {
    transport: Arc<dyn CallbackTransport>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl DeliveryScheduler {
    pub fn new(transport: Arc<dyn CallbackTransport>, config: &DeliveryConfig) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Scheduler delivering over HTTP with the configured method.
    pub fn http(config: &DeliveryConfig) -> Self {
        Self::new(Arc::new(HttpTransport::new(config.method)), config)
    }

    /// Start replaying `responses` to `callback`. Returns immediately; the
    /// handle resolves once the last response has been attempted.
    pub fn schedule(
        &self,
        callback: String,
        responses: Vec<RecordedResponse>,
        received_at: Instant,
    ) -> JoinHandle<DeliveryReport> {
        let transport = self.transport.clone();
        let permits = self.permits.clone();
        self.tracker.spawn(replay_responses(
            transport,
            permits,
            callback,
            responses,
            received_at,
        ))
    }

    /// Calls with deliveries still pending.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every scheduled delivery to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            tracing::info!(pending = self.tracker.len(), "waiting for scheduled deliveries");
        }
        self.tracker.wait().await;
    }
}

async fn replay_responses(
    transport: Arc<dyn CallbackTransport>,
    permits: Arc<Semaphore>,
    callback: String,
    responses: Vec<RecordedResponse>,
    received_at: Instant,
) -> DeliveryReport {
    let total = responses.len();
    let mut report = DeliveryReport::default();
    for (index, response) in responses.into_iter().enumerate() {
        tokio::time::sleep_until(received_at + Duration::from_millis(response.offset_ms)).await;
        let delivery = Delivery {
            callback: callback.clone(),
            sequence: index + 1,
            total,
            payload: response.payload,
            last: index + 1 == total,
        };
        let result = match permits.acquire().await {
            Ok(_permit) => transport.deliver(&delivery).await,
            Err(_) => Err(DeliveryError::Closed),
        };
        match result {
            Ok(()) => {
                report.delivered += 1;
                tracing::debug!(
                    callback = %delivery.callback,
                    sequence = delivery.sequence,
                    total,
                    last = delivery.last,
                    "delivered response"
                );
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    callback = %delivery.callback,
                    sequence = delivery.sequence,
                    total,
                    error = %e,
                    "callback delivery failed"
                );
            }
        }
    }
    report
}
