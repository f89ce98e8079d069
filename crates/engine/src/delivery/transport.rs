use async_trait::async_trait;

use super::body::{encode_body, EncodedBody};
use super::{CallbackMethod, Delivery, DeliveryError};

/// Header marking a non-final delivery (CPEE partial update).
pub const CPEE_UPDATE_HEADER: &str = "CPEE-UPDATE";

/// Header marking the final delivery of a call.
pub const REPLAY_LAST_HEADER: &str = "REPLAY-LAST";

/// Sends one delivery to its callback address.
#[async_trait]
pub trait CallbackTransport: Send + Sync + 'static {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// HTTP transport. ureq is synchronous, so requests run on the blocking pool.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    method: CallbackMethod,
}

impl HttpTransport {
    pub fn new(method: CallbackMethod) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            method,
        }
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let body = encode_body(&delivery.payload);
        let agent = self.agent.clone();
        let method = self.method;
        let url = delivery.callback.clone();
        let last = delivery.last;
        tokio::task::spawn_blocking(move || send(&agent, method, &url, last, &body))
            .await
            .map_err(|e| DeliveryError::Join(e.to_string()))?
    }
}

fn send(
    agent: &ureq::Agent,
    method: CallbackMethod,
    url: &str,
    last: bool,
    body: &EncodedBody,
) -> Result<(), DeliveryError> {
    let request = match method {
        CallbackMethod::Post => agent.post(url),
        CallbackMethod::Put => agent.put(url),
    };
    let request = request.header("Content-Type", &body.content_type);
    let request = if last {
        request.header(REPLAY_LAST_HEADER, "true")
    } else {
        request.header(CPEE_UPDATE_HEADER, "true")
    };
    request
        .send(&body.bytes[..])
        .map(|_| ())
        .map_err(|e| DeliveryError::Transport {
            callback: url.to_string(),
            message: e.to_string(),
        })
}
