//! Process configuration. The binary fills [`Settings`] from flags and environment,
//! [`Settings::validate`] rejects anything the relays cannot start with.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use relays_kafka::consumer::KafkaConsumerConfig;
use relays_kafka::{KafkaSaslAuth, TlsClientAuthCerts, TlsConfig};

use crate::Result;
use crate::error::Error;

pub const DEFAULT_BROKERS: &str = "localhost:9092";
pub const DEFAULT_TOPIC: &str = "deployment-events";
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_LOG_VERBOSITY: &str = "info";
pub const DEFAULT_SASL_MECHANISM: &str = "PLAIN";
pub const DEFAULT_QUEUE_SIZE: usize = 4096;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const INFLUXDB: &str = "influxdb";
pub const NORA: &str = "nora";
pub const VERA: &str = "vera";
pub const NULL: &str = "null";

const REDACTED: &str = "<redacted>";

// Used when the hostname cannot be determined.
const DEFAULT_HOSTNAME: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!(
                "log format '{other}' is not one of: text, json"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub format: LogFormat,
    /// A tracing filter directive, e.g. `info` or `relays_core=debug,info`.
    pub verbosity: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            verbosity: DEFAULT_LOG_VERBOSITY.to_string(),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SaslSettings {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslSettings")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Consumer groups are named `<prefix>/<subsystem>`.
    pub group_id_prefix: String,
    pub ca_path: Option<String>,
    pub certificate_path: Option<String>,
    pub private_key_path: Option<String>,
    pub sasl: Option<SaslSettings>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKERS.to_string()],
            topic: DEFAULT_TOPIC.to_string(),
            group_id_prefix: default_group_id_prefix(),
            ca_path: None,
            certificate_path: None,
            private_key_path: None,
            sasl: None,
        }
    }
}

impl KafkaSettings {
    pub fn group_id(&self, subsystem: &str) -> String {
        format!("{}/{}", self.group_id_prefix, subsystem)
    }

    fn tls_enabled(&self) -> bool {
        self.ca_path.is_some() || self.certificate_path.is_some() || self.private_key_path.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.brokers.iter().all(|broker| broker.trim().is_empty()) {
            return Err(Error::Config("no kafka brokers configured".to_string()));
        }
        if self.topic.is_empty() {
            return Err(Error::Config("kafka topic must not be empty".to_string()));
        }
        if self.group_id_prefix.is_empty() {
            return Err(Error::Config(
                "kafka consumer group id prefix must not be empty".to_string(),
            ));
        }

        if self.tls_enabled() {
            let paths = [
                ("kafka.tls.ca-path", &self.ca_path),
                ("kafka.tls.certificate-path", &self.certificate_path),
                ("kafka.tls.private-key-path", &self.private_key_path),
            ];
            for (name, path) in paths {
                let Some(path) = path else {
                    return Err(Error::Config(format!(
                        "{name} is required when kafka TLS is configured"
                    )));
                };
                if !Path::new(path).is_file() {
                    return Err(Error::Config(format!("{name}: '{path}' is not a readable file")));
                }
            }
        }

        if let Some(sasl) = &self.sasl {
            KafkaSaslAuth::from_mechanism(&sasl.mechanism, String::new(), String::new())
                .map_err(|e| Error::Config(e.to_string()))?;
            if sasl.username.is_empty() {
                return Err(Error::Config(
                    "kafka SASL requires a username".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Client configuration for the consumer group of one subsystem.
    pub fn consumer_config(&self, subsystem: &str) -> Result<KafkaConsumerConfig> {
        let tls = match (&self.ca_path, &self.certificate_path, &self.private_key_path) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsConfig {
                insecure_skip_verify: false,
                ca_cert_path: Some(ca.clone()),
                client_auth: Some(TlsClientAuthCerts {
                    client_cert_path: cert.clone(),
                    client_cert_private_key_path: key.clone(),
                }),
            }),
            (None, None, None) => None,
            _ => {
                return Err(Error::Config(
                    "kafka TLS needs a CA, a certificate and a private key".to_string(),
                ));
            }
        };

        let auth = self
            .sasl
            .as_ref()
            .map(|sasl| {
                KafkaSaslAuth::from_mechanism(
                    &sasl.mechanism,
                    sasl.username.clone(),
                    sasl.password.clone(),
                )
            })
            .transpose()?;

        Ok(KafkaConsumerConfig {
            brokers: self
                .brokers
                .iter()
                .map(|broker| broker.trim().to_string())
                .filter(|broker| !broker.is_empty())
                .collect(),
            topic: self.topic.clone(),
            consumer_group: self.group_id(subsystem),
            auth,
            tls,
        })
    }
}

#[derive(Clone, PartialEq)]
pub struct InfluxDbSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for InfluxDbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDbSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// Capacity of the queue between the consumer and the delivery worker.
    pub queue_size: usize,
    /// Delay before the first retry. Doubles after each failed attempt.
    pub retry_interval: Duration,
    pub http_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// A sink together with what it needs to connect. One per enabled subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkSettings {
    InfluxDb(InfluxDbSettings),
    Nora(RegistrySettings),
    Vera(RegistrySettings),
    Null,
}

impl SinkSettings {
    pub fn subsystem(&self) -> &'static str {
        match self {
            SinkSettings::InfluxDb(_) => INFLUXDB,
            SinkSettings::Nora(_) => NORA,
            SinkSettings::Vera(_) => VERA,
            SinkSettings::Null => NULL,
        }
    }

    fn url(&self) -> Option<&str> {
        match self {
            SinkSettings::InfluxDb(settings) => Some(&settings.url),
            SinkSettings::Nora(settings) | SinkSettings::Vera(settings) => Some(&settings.url),
            SinkSettings::Null => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kafka: KafkaSettings,
    pub log: LogSettings,
    pub influxdb: Option<InfluxDbSettings>,
    pub nora: Option<RegistrySettings>,
    pub vera: Option<RegistrySettings>,
    pub null_enabled: bool,
    pub metrics_bind_address: SocketAddr,
    pub delivery: DeliverySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kafka: KafkaSettings::default(),
            log: LogSettings::default(),
            influxdb: None,
            nora: None,
            vera: None,
            null_enabled: false,
            metrics_bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            delivery: DeliverySettings::default(),
        }
    }
}

impl Settings {
    /// The enabled subsystems, in a fixed order.
    pub fn sinks(&self) -> Vec<SinkSettings> {
        let mut sinks = Vec::new();
        if let Some(influxdb) = &self.influxdb {
            sinks.push(SinkSettings::InfluxDb(influxdb.clone()));
        }
        if let Some(nora) = &self.nora {
            sinks.push(SinkSettings::Nora(nora.clone()));
        }
        if let Some(vera) = &self.vera {
            sinks.push(SinkSettings::Vera(vera.clone()));
        }
        if self.null_enabled {
            sinks.push(SinkSettings::Null);
        }
        sinks
    }

    pub fn validate(&self) -> Result<()> {
        self.kafka.validate()?;

        let sinks = self.sinks();
        if sinks.is_empty() {
            return Err(Error::Config("no subsystems enabled".to_string()));
        }
        for sink in &sinks {
            if let Some(url) = sink.url() {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    Error::Config(format!("{}.url '{url}': {e}", sink.subsystem()))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::Config(format!(
                        "{}.url '{url}' must be an http or https URL",
                        sink.subsystem()
                    )));
                }
            }
        }

        if self.delivery.queue_size == 0 {
            return Err(Error::Config(
                "delivery queue size must be at least 1".to_string(),
            ));
        }
        if self.delivery.retry_interval.is_zero() {
            return Err(Error::Config(
                "delivery retry interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<program>-<hostname>`, so replicas on different hosts get their own consumer groups.
pub fn default_group_id_prefix() -> String {
    let program = std::env::args()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "deployment-event-relays".to_string());

    let hostname = hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

    format!("{program}-{hostname}")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn settings() -> Settings {
        Settings {
            vera: Some(RegistrySettings {
                url: "http://vera.local/api/v1/deploylog".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_no_subsystems_enabled() {
        let err = Settings::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "Config Error - no subsystems enabled");
    }

    #[test]
    fn test_sinks_in_order() {
        let settings = Settings {
            influxdb: Some(InfluxDbSettings {
                url: "http://influx.local/write?db=deploys".to_string(),
                username: None,
                password: None,
            }),
            nora: Some(RegistrySettings {
                url: "http://nora.local/api/apps".to_string(),
            }),
            null_enabled: true,
            ..settings()
        };
        settings.validate().unwrap();

        let names: Vec<&str> = settings.sinks().iter().map(|s| s.subsystem()).collect();
        assert_eq!(names, vec!["influxdb", "nora", "vera", "null"]);
    }

    #[test]
    fn test_invalid_url() {
        let invalid = Settings {
            nora: Some(RegistrySettings {
                url: "not a url".to_string(),
            }),
            ..settings()
        };
        assert!(matches!(invalid.validate(), Err(Error::Config(_))));

        let invalid = Settings {
            nora: Some(RegistrySettings {
                url: "ftp://nora.local".to_string(),
            }),
            ..settings()
        };
        assert!(matches!(invalid.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_brokers() {
        let mut settings = settings();
        settings.kafka.brokers = vec![" ".to_string()];
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_group_id() {
        let mut settings = settings();
        settings.kafka.group_id_prefix = "relays-host1".to_string();
        assert_eq!(settings.kafka.group_id("vera"), "relays-host1/vera");

        let consumer = settings.kafka.consumer_config("vera").unwrap();
        assert_eq!(consumer.consumer_group, "relays-host1/vera");
        assert_eq!(consumer.topic, DEFAULT_TOPIC);
        assert_eq!(consumer.brokers, vec![DEFAULT_BROKERS.to_string()]);
        assert!(consumer.tls.is_none());
        assert!(consumer.auth.is_none());
    }

    #[test]
    fn test_default_group_id_prefix() {
        let prefix = default_group_id_prefix();
        let hostname = hostname::get().unwrap().to_string_lossy().into_owned();
        assert!(prefix.ends_with(&format!("-{hostname}")), "{prefix}");
        assert!(!prefix.contains('/'));

        // the group must survive a restart of the process
        assert_eq!(prefix, default_group_id_prefix());
    }

    #[test]
    fn test_tls_paths_all_or_none() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();
        let cert = tempfile::NamedTempFile::new().unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();
        let path = |f: &tempfile::NamedTempFile| f.path().to_string_lossy().into_owned();

        let mut settings = settings();
        settings.kafka.ca_path = Some(path(&ca));
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
        assert!(settings.kafka.consumer_config("vera").is_err());

        settings.kafka.certificate_path = Some(path(&cert));
        settings.kafka.private_key_path = Some(path(&key));
        settings.validate().unwrap();

        let consumer = settings.kafka.consumer_config("vera").unwrap();
        let tls = consumer.tls.unwrap();
        assert_eq!(tls.ca_cert_path, Some(path(&ca)));
        assert_eq!(
            tls.client_auth.unwrap().client_cert_private_key_path,
            path(&key)
        );

        settings.kafka.private_key_path = Some("/does/not/exist.pem".to_string());
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sasl_settings() {
        let mut settings = settings();
        settings.kafka.sasl = Some(SaslSettings {
            mechanism: "SCRAM-SHA-512".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        });
        settings.validate().unwrap();
        let consumer = settings.kafka.consumer_config("vera").unwrap();
        assert!(matches!(
            consumer.auth,
            Some(KafkaSaslAuth::ScramSha512 { .. })
        ));

        settings.kafka.sasl = Some(SaslSettings {
            mechanism: "OAUTHBEARER".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        });
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let mut settings = settings();
        settings.influxdb = Some(InfluxDbSettings {
            url: "http://influx.local".to_string(),
            username: Some("admin".to_string()),
            password: Some("influx-secret".to_string()),
        });
        settings.kafka.sasl = Some(SaslSettings {
            mechanism: DEFAULT_SASL_MECHANISM.to_string(),
            username: "user".to_string(),
            password: "kafka-secret".to_string(),
        });

        let printed = format!("{settings:?}");
        assert!(printed.contains("admin"));
        assert!(!printed.contains("influx-secret"));
        assert!(!printed.contains("kafka-secret"));
    }
}
