use bytes::Bytes;
use reqwest::Client;
use tracing::debug;

use super::{Outcome, Rejection, transport_failure};
use crate::config::InfluxDbSettings;
use crate::encoder::line::Line;
use crate::event::Event;

/// Writes deployments as line protocol to the InfluxDB 1.x `/write` endpoint.
#[derive(Debug, Clone)]
pub struct InfluxDbSink {
    settings: InfluxDbSettings,
    client: Client,
}

impl InfluxDbSink {
    pub fn new(settings: InfluxDbSettings, client: Client) -> Self {
        Self { settings, client }
    }

    pub(super) fn prepare(&self, event: &Event) -> Result<Bytes, Rejection> {
        Line::from(event)
            .marshal()
            .map(Bytes::from)
            .map_err(|e| Rejection::Encode(e.to_string()))
    }

    /// Credentials are only sent when both username and password are set.
    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.settings.username, &self.settings.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username, password))
            }
            _ => None,
        }
    }

    pub(super) async fn send(&self, payload: &Bytes) -> Outcome {
        let url = &self.settings.url;
        let mut request = self.client.post(url).body(payload.clone());
        if let Some((username, password)) = self.credentials() {
            request = request.basic_auth(username, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return transport_failure(url, &e),
        };

        let status = response.status();
        if status.as_u16() < 300 {
            return Outcome::Success;
        }

        let body = response.text().await.unwrap_or_default();
        debug!(
            payload = %String::from_utf8_lossy(payload),
            response = %body,
            "InfluxDB rejected the write"
        );
        Outcome::Retryable(format!("POST {url}: {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_utils::sample_event;
    use crate::sink::test_utils::{closed_url, start_server};

    fn sink(url: String, username: Option<&str>, password: Option<&str>) -> InfluxDbSink {
        InfluxDbSink::new(
            InfluxDbSettings {
                url,
                username: username.map(str::to_string),
                password: password.map(str::to_string),
            },
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_write_line() {
        let (url, server) = start_server(vec![204]).await;
        let sink = sink(url, None, None);

        let payload = sink.prepare(&sample_event()).unwrap();
        assert!(payload.starts_with(b"nais.deployment,application=app"));
        assert_eq!(sink.send(&payload).await, Outcome::Success);

        let requests = server.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, payload);
        assert_eq!(requests[0].authorization, None);
    }

    #[tokio::test]
    async fn test_basic_auth_needs_both_credentials() {
        let (url, server) = start_server(vec![204]).await;
        let payload = Bytes::from_static(b"nais.deployment version=\"1\" 0\n");

        sink(url.clone(), Some("admin"), None).send(&payload).await;
        sink(url.clone(), Some("admin"), Some("")).send(&payload).await;
        sink(url, Some("admin"), Some("secret")).send(&payload).await;

        let requests = server.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].authorization, None);
        assert_eq!(requests[1].authorization, None);
        // base64("admin:secret")
        assert_eq!(
            requests[2].authorization.as_deref(),
            Some("Basic YWRtaW46c2VjcmV0")
        );
    }

    #[tokio::test]
    async fn test_error_status_is_retryable() {
        let (url, _server) = start_server(vec![300, 400, 500]).await;
        let sink = sink(url, None, None);
        let payload = sink.prepare(&sample_event()).unwrap();

        for _ in 0..3 {
            assert!(matches!(sink.send(&payload).await, Outcome::Retryable(_)));
        }
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable() {
        let sink = sink(closed_url().await, None, None);
        let payload = sink.prepare(&sample_event()).unwrap();
        assert!(matches!(sink.send(&payload).await, Outcome::Retryable(_)));
    }
}
