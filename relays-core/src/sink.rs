//! Sink clients. A sink first turns an event into its payload ([`SinkClient::prepare`]),
//! which may reject the event for good, and then performs one delivery attempt per
//! [`SinkClient::send`] call. Retrying is up to the caller.

use std::time::Duration;

use bytes::Bytes;

use crate::Result;
use crate::config::SinkSettings;
use crate::error::Error;
use crate::event::Event;

pub(crate) mod influxdb;
pub(crate) mod null;
pub(crate) mod nora;
pub(crate) mod vera;

pub use influxdb::InfluxDbSink;
pub use nora::NoraSink;
pub use null::NullSink;
pub use vera::VeraSink;

const APPLICATION_JSON: &str = "application/json";

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient failure, the same payload may succeed later.
    Retryable(String),
    /// The payload will never be accepted. None of the sinks answer this way today,
    /// their permanent rejections all come from [`SinkClient::prepare`].
    Permanent(String),
}

/// Why an event is never sent to a sink.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("{0}")]
    Precondition(&'static str),

    #[error("encoding payload: {0}")]
    Encode(String),
}

/// The closed set of sinks the relays deliver to.
#[derive(Debug, Clone)]
pub enum SinkClient {
    InfluxDb(InfluxDbSink),
    Nora(NoraSink),
    Vera(VeraSink),
    Null(NullSink),
    #[cfg(test)]
    Scripted(test_utils::ScriptedSink),
}

impl SinkClient {
    pub fn new(settings: &SinkSettings, http_timeout: Duration) -> Result<Self> {
        Ok(match settings {
            SinkSettings::InfluxDb(influxdb) => {
                SinkClient::InfluxDb(InfluxDbSink::new(influxdb.clone(), http_client(http_timeout)?))
            }
            SinkSettings::Nora(nora) => {
                SinkClient::Nora(NoraSink::new(nora.url.clone(), http_client(http_timeout)?))
            }
            SinkSettings::Vera(vera) => {
                SinkClient::Vera(VeraSink::new(vera.url.clone(), http_client(http_timeout)?))
            }
            SinkSettings::Null => SinkClient::Null(NullSink),
        })
    }

    pub fn subsystem(&self) -> &'static str {
        match self {
            SinkClient::InfluxDb(_) => crate::config::INFLUXDB,
            SinkClient::Nora(_) => crate::config::NORA,
            SinkClient::Vera(_) => crate::config::VERA,
            SinkClient::Null(_) => crate::config::NULL,
            #[cfg(test)]
            SinkClient::Scripted(_) => "scripted",
        }
    }

    /// Checks the sink's precondition and encodes the payload. Runs before any network call.
    pub fn prepare(&self, event: &Event) -> std::result::Result<Bytes, Rejection> {
        match self {
            SinkClient::InfluxDb(sink) => sink.prepare(event),
            SinkClient::Nora(sink) => sink.prepare(event),
            SinkClient::Vera(sink) => sink.prepare(event),
            SinkClient::Null(sink) => sink.prepare(event),
            #[cfg(test)]
            SinkClient::Scripted(_) => Ok(Bytes::new()),
        }
    }

    /// One delivery attempt. The request is built anew from `payload` on every call.
    pub async fn send(&self, payload: &Bytes) -> Outcome {
        match self {
            SinkClient::InfluxDb(sink) => sink.send(payload).await,
            SinkClient::Nora(sink) => sink.send(payload).await,
            SinkClient::Vera(sink) => sink.send(payload).await,
            SinkClient::Null(sink) => sink.send(payload),
            #[cfg(test)]
            SinkClient::Scripted(sink) => sink.send(),
        }
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Sink(format!("creating HTTP client: {e}")))
}

fn encode_json<T: serde::Serialize>(payload: &T) -> std::result::Result<Bytes, Rejection> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|e| Rejection::Encode(e.to_string()))
}

/// Outcome of a transport failure. Timeouts, refused connections and broken bodies
/// are all worth another try.
fn transport_failure(url: &str, error: &reqwest::Error) -> Outcome {
    Outcome::Retryable(format!("POST {url}: {error}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfluxDbSettings, RegistrySettings};

    #[test]
    fn test_sink_client_from_settings() {
        let timeout = Duration::from_secs(1);
        let sinks = [
            SinkSettings::InfluxDb(InfluxDbSettings {
                url: "http://influx.local/write".to_string(),
                username: None,
                password: None,
            }),
            SinkSettings::Nora(RegistrySettings {
                url: "http://nora.local".to_string(),
            }),
            SinkSettings::Vera(RegistrySettings {
                url: "http://vera.local".to_string(),
            }),
            SinkSettings::Null,
        ];

        for settings in sinks {
            let client = SinkClient::new(&settings, timeout).unwrap();
            assert_eq!(client.subsystem(), settings.subsystem());
        }
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            Rejection::Precondition("event does not belong to production").to_string(),
            "event does not belong to production"
        );
        assert_eq!(
            Rejection::Encode("boom".to_string()).to_string(),
            "encoding payload: boom"
        );
    }
}
