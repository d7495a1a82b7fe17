use bytes::Bytes;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::info;

use super::{APPLICATION_JSON, Outcome, Rejection, encode_json, transport_failure};
use crate::encoder::nora::NoraPayload;
use crate::event::{Environment, Event};

/// Registers production applications in nora.
#[derive(Debug, Clone)]
pub struct NoraSink {
    url: String,
    client: Client,
}

impl NoraSink {
    pub fn new(url: String, client: Client) -> Self {
        Self { url, client }
    }

    pub(super) fn prepare(&self, event: &Event) -> Result<Bytes, Rejection> {
        if event.environment() != Environment::Production {
            return Err(Rejection::Precondition(
                "event does not belong to production",
            ));
        }
        encode_json(&NoraPayload::from(event))
    }

    pub(super) async fn send(&self, payload: &Bytes) -> Outcome {
        info!(payload = %String::from_utf8_lossy(payload), "Posting payload to nora");

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
        match status.as_u16() {
            // 2xx: registered. 403: a null team would overwrite the registered team.
            // 422: already registered.
            _ if status.is_success() => Outcome::Success,
            403 | 422 => Outcome::Success,
            _ => Outcome::Retryable(format!("POST {}: {}", self.url, status)),
        }
    }
}
