//! Replay engine: answers live service calls from recorded ones.
//!
//! [`RequestHandler`] ties the pieces together. It claims a recorded call
//! through the [`Matcher`], then replays the recorded responses to the
//! caller's callback through the [`DeliveryScheduler`], keeping the recorded
//! timing.

pub mod call;
pub mod delivery;
pub mod handler;
pub mod matching;

#[cfg(test)]
mod testutil;

pub use call::{caller_identity, form_params, InboundCall, SimTarget};
pub use delivery::{
    CallbackMethod, CallbackTransport, Delivery, DeliveryConfig, DeliveryError, DeliveryReport,
    DeliveryScheduler, HttpTransport,
};
pub use handler::{HandlerError, HandlerOutcome, RequestHandler};
pub use matching::{MatchError, MatchOutcome, Matcher, DEFAULT_MAX_ATTEMPTS};
