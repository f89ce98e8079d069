//! Application state.

use std::time::Instant;

use logreplay_engine::RequestHandler;

/// Application state shared across request handlers.
pub(crate) struct AppState<S> {
    /// Matches inbound calls against the replay table and schedules delivery.
    pub(crate) handler: RequestHandler<S>,
    pub(crate) started_at: Instant,
}

impl<S> AppState<S> {
    pub(crate) fn new(handler: RequestHandler<S>) -> Self {
        Self {
            handler,
            started_at: Instant::now(),
        }
    }
}
