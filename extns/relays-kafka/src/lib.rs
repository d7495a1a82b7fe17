use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod consumer;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// SASL credentials used to authenticate against the brokers. The connection is always
/// wrapped in TLS when SASL is enabled.
#[derive(Clone, PartialEq)]
pub enum KafkaSaslAuth {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

impl KafkaSaslAuth {
    /// Builds the auth from the mechanism name accepted by librdkafka.
    pub fn from_mechanism(mechanism: &str, username: String, password: String) -> Result<Self> {
        match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain { username, password }),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256 { username, password }),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512 { username, password }),
            other => Err(Error::Other(format!(
                "Unsupported SASL mechanism '{other}', expected PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512"
            ))),
        }
    }

    fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "PLAIN",
            Self::ScramSha256 { .. } => "SCRAM-SHA-256",
            Self::ScramSha512 { .. } => "SCRAM-SHA-512",
        }
    }

    fn credentials(&self) -> (&str, &str) {
        match self {
            Self::Plain { username, password }
            | Self::ScramSha256 { username, password }
            | Self::ScramSha512 { username, password } => (username, password),
        }
    }
}

// never print the password
impl std::fmt::Debug for KafkaSaslAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (username, _) = self.credentials();
        f.debug_struct("KafkaSaslAuth")
            .field("mechanism", &self.mechanism())
            .field("username", &username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    /// Path to the PEM encoded CA bundle.
    pub ca_cert_path: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

/// Paths to the PEM encoded client certificate and its private key.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert_path: String,
    pub client_cert_private_key_path: String,
}

pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls_config: Option<TlsConfig>,
    auth_config: Option<KafkaSaslAuth>,
) {
    let tls_enabled = tls_config.is_some();
    if let Some(tls_config) = tls_config {
        client_config.set("security.protocol", "SSL");
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecure_skip_verify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert_path) = tls_config.ca_cert_path {
            client_config.set("ssl.ca.location", ca_cert_path);
        }
        if let Some(client_auth) = tls_config.client_auth {
            client_config
                .set("ssl.certificate.location", client_auth.client_cert_path)
                .set("ssl.key.location", client_auth.client_cert_private_key_path);
        }
    }

    if let Some(auth) = auth_config {
        let (username, password) = auth.credentials();
        client_config
            .set(
                "security.protocol",
                if tls_enabled { "SASL_SSL" } else { "SASL_PLAINTEXT" },
            )
            .set("sasl.mechanisms", auth.mechanism())
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
}
