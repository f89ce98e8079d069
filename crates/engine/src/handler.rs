//! Request Handler: match an inbound call, then hand its responses to the
//! Delivery Scheduler without waiting for them.

use logreplay_storage::{ReplayStorage, StoredCall};
use tokio::task::JoinHandle;

use crate::call::InboundCall;
use crate::delivery::{DeliveryReport, DeliveryScheduler};
use crate::matching::{MatchError, MatchOutcome, Matcher};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::Match(e) => e.is_transient(),
        }
    }
}

/// What the caller is told synchronously.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// A record was claimed and its responses are being delivered.
    Accepted {
        instance_uuid: String,
        responses: usize,
        /// Resolves when the last response has been attempted. Dropping it
        /// does not cancel delivery.
        delivery: JoinHandle<DeliveryReport>,
    },
    /// The recorded activity spawned a sub-process instance; the engine must
    /// instantiate it itself. No callback follows.
    Instantiation { call: StoredCall },
    /// No unconsumed record answers the call.
    NotMatched,
}

pub struct RequestHandler<S> {
    matcher: Matcher<S>,
    scheduler: DeliveryScheduler,
}

impl<S: ReplayStorage> RequestHandler<S> {
    pub fn new(matcher: Matcher<S>, scheduler: DeliveryScheduler) -> Self {
        Self { matcher, scheduler }
    }

    pub fn matcher(&self) -> &Matcher<S> {
        &self.matcher
    }

    pub fn scheduler(&self) -> &DeliveryScheduler {
        &self.scheduler
    }

    pub async fn handle(&self, call: InboundCall) -> Result<HandlerOutcome, HandlerError> {
        let stored = match self.matcher.find_and_claim(&call).await? {
            MatchOutcome::Matched(stored) => stored,
            MatchOutcome::NotFound => {
                tracing::info!(endpoint = %call.endpoint, "no recorded call matches");
                return Ok(HandlerOutcome::NotMatched);
            }
        };

        if stored.record.spawns_instance {
            tracing::info!(
                endpoint = %call.endpoint,
                instance = %stored.record.instance_uuid,
                "recorded call spawned an instance"
            );
            return Ok(HandlerOutcome::Instantiation { call: stored });
        }

        let instance_uuid = stored.record.instance_uuid;
        let responses = stored.record.responses;
        let count = responses.len();
        tracing::info!(
            endpoint = %call.endpoint,
            instance = %instance_uuid,
            responses = count,
            callback = %call.callback,
            "replaying recorded call"
        );
        let delivery = self
            .scheduler
            .schedule(call.callback, responses, call.received_at);
        Ok(HandlerOutcome::Accepted {
            instance_uuid,
            responses: count,
            delivery,
        })
    }

    /// Wait for all scheduled deliveries.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
