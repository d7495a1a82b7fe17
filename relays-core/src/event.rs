//! The deployment event as published on the topic, together with its flat key/value view.
//!
//! The message types mirror the `nais.deployment` protobuf package. Every message on the
//! topic is a `google.protobuf.Any` wrapping an [`Event`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use prost::Message;

/// Type URL of [`Event`] inside the `Any` envelope.
pub const EVENT_TYPE_URL: &str = "type.googleapis.com/nais.deployment.Event";

const EVENT_TYPE_NAME: &str = "nais.deployment.Event";

/// Timestamps above this value are milliseconds. Read as seconds it is in the year 2445.
const DISTANT_FUTURE: i64 = 15_000_000_000;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(message, optional, tag = "2")]
    pub platform: Option<Platform>,
    #[prost(enumeration = "System", tag = "3")]
    pub source: i32,
    #[prost(message, optional, tag = "4")]
    pub deployer: Option<Actor>,
    #[prost(string, tag = "5")]
    pub team: String,
    #[prost(enumeration = "RolloutStatus", tag = "6")]
    pub rollout_status: i32,
    #[prost(enumeration = "Environment", tag = "7")]
    pub environment: i32,
    #[prost(string, tag = "8")]
    pub skya_environment: String,
    #[prost(string, tag = "9")]
    pub namespace: String,
    #[prost(string, tag = "10")]
    pub cluster: String,
    #[prost(string, tag = "11")]
    pub application: String,
    #[prost(string, tag = "12")]
    pub version: String,
    #[prost(message, optional, tag = "13")]
    pub image: Option<ContainerImage>,
    #[prost(int64, tag = "14")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Platform {
    #[prost(enumeration = "PlatformType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub variant: String,
}

/// The person or robot that triggered the deployment.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Actor {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerImage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub tag: String,
    #[prost(string, tag = "3")]
    pub hash: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PlatformType {
    Jboss = 0,
    Was = 1,
    Bigip = 2,
    Nais = 3,
}

impl PlatformType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            PlatformType::Jboss => "jboss",
            PlatformType::Was => "was",
            PlatformType::Bigip => "bigip",
            PlatformType::Nais => "nais",
        }
    }
}

/// The system that performed the deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum System {
    Naisd = 0,
    Naiserator = 1,
    Aura = 2,
    Spinnaker = 3,
}

impl System {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            System::Naisd => "naisd",
            System::Naiserator => "naiserator",
            System::Aura => "aura",
            System::Spinnaker => "spinnaker",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RolloutStatus {
    Unknown = 0,
    Initialized = 1,
    Complete = 2,
}

impl RolloutStatus {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            RolloutStatus::Unknown => "unknown",
            RolloutStatus::Initialized => "initialized",
            RolloutStatus::Complete => "complete",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Environment {
    Production = 0,
    Development = 1,
}

impl Environment {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
        }
    }
}

/// Why a topic message could not be turned into an [`Event`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    /// The bytes are not an `Any` envelope, or the envelope carries another type.
    /// These messages are dropped silently.
    #[error("not a deployment event envelope: {0}")]
    Unrecognized(String),

    /// The envelope claims to hold an event but the event itself does not decode.
    #[error("unable to unmarshal deployment event: {0}")]
    Malformed(String),
}

/// Unwraps the `Any` envelope carried by every topic message.
pub fn decode_envelope(payload: &[u8]) -> Result<Event, EnvelopeError> {
    let envelope = prost_types::Any::decode(payload)
        .map_err(|e| EnvelopeError::Unrecognized(e.to_string()))?;

    let type_name = envelope
        .type_url
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if type_name != EVENT_TYPE_NAME {
        return Err(EnvelopeError::Unrecognized(format!(
            "unknown type '{}'",
            envelope.type_url
        )));
    }

    Event::decode(envelope.value.as_slice()).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// Wraps the event in an `Any` envelope, the way producers publish it.
pub fn encode_envelope(event: &Event) -> Vec<u8> {
    prost_types::Any {
        type_url: EVENT_TYPE_URL.to_string(),
        value: event.encode_to_vec(),
    }
    .encode_to_vec()
}

impl Event {
    /// Flat view of the event used for line protocol tags/fields and log context.
    /// Empty values are left out.
    pub fn flatten(&self) -> BTreeMap<&'static str, String> {
        let platform = self.platform.clone().unwrap_or_default();
        let deployer = self.deployer.clone().unwrap_or_default();
        let image = self.image.clone().unwrap_or_default();

        let entries = [
            ("correlation_id", self.correlation_id.clone()),
            ("platform_type", platform.r#type().as_str_name().to_string()),
            ("platform_variant", platform.variant),
            ("source", self.source().as_str_name().to_string()),
            ("deployer_name", deployer.name),
            ("deployer_email", deployer.email),
            ("deployer_ident", deployer.ident),
            ("team", self.team.clone()),
            (
                "rollout_status",
                self.rollout_status().as_str_name().to_string(),
            ),
            ("environment", self.environment().as_str_name().to_string()),
            ("skya_environment", self.skya_environment.clone()),
            ("namespace", self.namespace.clone()),
            ("cluster", self.cluster.clone()),
            ("application", self.application.clone()),
            ("version", self.version.clone()),
            ("image_name", image.name),
            ("image_tag", image.tag),
            ("image_hash", image.hash),
        ];

        entries
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect()
    }

    /// The deployment time. Producers send either seconds or milliseconds since the epoch.
    pub fn timestamp_as_time(&self) -> DateTime<Utc> {
        let parsed = if self.timestamp > DISTANT_FUTURE {
            DateTime::from_timestamp_millis(self.timestamp)
        } else {
            DateTime::from_timestamp(self.timestamp, 0)
        };
        parsed.unwrap_or_default()
    }

    pub fn deployer_or_default(&self) -> Actor {
        self.deployer.clone().unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::test_utils::sample_event;
    use super::*;

    #[test]
    fn test_flatten_omits_empty_values() {
        let flat = sample_event().flatten();

        assert!(flat.values().all(|value| !value.is_empty()));
        assert_eq!(flat.get("application").map(String::as_str), Some("app"));
        assert_eq!(flat.get("source").map(String::as_str), Some("naiserator"));
        assert_eq!(flat.get("platform_type").map(String::as_str), Some("nais"));
        assert_eq!(
            flat.get("rollout_status").map(String::as_str),
            Some("complete")
        );
        assert_eq!(
            flat.get("environment").map(String::as_str),
            Some("development")
        );
        assert!(!flat.contains_key("platform_variant"));
        assert!(!flat.contains_key("deployer_name"));
        assert!(!flat.contains_key("image_name"));
        assert!(!flat.contains_key("correlation_id"));
    }

    #[test]
    fn test_flatten_empty_event_keeps_enum_names() {
        let flat = Event::default().flatten();

        // the zero value of each enum still has a name
        let keys: Vec<&str> = flat.keys().copied().collect();
        assert_eq!(
            keys,
            vec!["environment", "platform_type", "rollout_status", "source"]
        );
        assert_eq!(flat["environment"], "production");
        assert_eq!(flat["source"], "naisd");
    }

    #[test]
    fn test_unknown_enum_value_uses_default() {
        let event = Event {
            source: 42,
            ..Default::default()
        };
        assert_eq!(event.source(), System::Naisd);
    }

    #[test]
    fn test_timestamp_seconds_and_millis() {
        let event = Event {
            timestamp: 123456789,
            ..Default::default()
        };
        assert_eq!(
            event.timestamp_as_time(),
            Utc.timestamp_opt(123456789, 0).unwrap()
        );

        let event = Event {
            timestamp: 1_600_000_000_123,
            ..Default::default()
        };
        assert_eq!(
            event.timestamp_as_time(),
            Utc.timestamp_millis_opt(1_600_000_000_123).unwrap()
        );

        // the threshold itself is still seconds
        let event = Event {
            timestamp: DISTANT_FUTURE,
            ..Default::default()
        };
        assert_eq!(event.timestamp_as_time().timestamp(), DISTANT_FUTURE);
    }

    #[test]
    fn test_envelope_roundtrip_and_errors() {
        let event = sample_event();
        let payload = encode_envelope(&event);
        assert_eq!(decode_envelope(&payload), Ok(event.clone()));

        // truncated varint
        assert!(matches!(
            decode_envelope(&[0xff, 0xff, 0xff]),
            Err(EnvelopeError::Unrecognized(_))
        ));

        let foreign = prost_types::Any {
            type_url: "type.googleapis.com/google.protobuf.Duration".to_string(),
            value: vec![],
        }
        .encode_to_vec();
        assert!(matches!(
            decode_envelope(&foreign),
            Err(EnvelopeError::Unrecognized(_))
        ));

        let broken = prost_types::Any {
            type_url: EVENT_TYPE_URL.to_string(),
            value: vec![0x0a, 0x05, b'a'],
        }
        .encode_to_vec();
        assert!(matches!(
            decode_envelope(&broken),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
