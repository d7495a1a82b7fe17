use bytes::Bytes;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::info;

use super::{APPLICATION_JSON, Outcome, Rejection, encode_json, transport_failure};
use crate::encoder::vera::VeraPayload;
use crate::event::{Event, RolloutStatus};

/// Logs completed deployments in vera.
#[derive(Debug, Clone)]
pub struct VeraSink {
    url: String,
    client: Client,
}

impl VeraSink {
    pub fn new(url: String, client: Client) -> Self {
        Self { url, client }
    }

    pub(super) fn prepare(&self, event: &Event) -> Result<Bytes, Rejection> {
        if event.rollout_status() != RolloutStatus::Complete {
            return Err(Rejection::Precondition(
                "discarding message because rollout status is != complete",
            ));
        }
        encode_json(&VeraPayload::from(event))
    }

    pub(super) async fn send(&self, payload: &Bytes) -> Outcome {
        info!(payload = %String::from_utf8_lossy(payload), "Posting payload to vera");

        let response = match self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .body(payload.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return transport_failure(&self.url, &e),
        };

        let status = response.status();
        if status.is_success() {
            Outcome::Success
        } else {
            Outcome::Retryable(format!("POST {}: {}", self.url, status))
        }
    }
}
