use std::net::SocketAddr;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use relays_core::Result;
use relays_core::config::{
    DEFAULT_BROKERS, DEFAULT_LOG_VERBOSITY, DEFAULT_METRICS_BIND_ADDRESS,
    DEFAULT_SASL_MECHANISM, DEFAULT_TOPIC, DeliverySettings, InfluxDbSettings, KafkaSettings,
    LogSettings, RegistrySettings, SaslSettings, Settings, default_group_id_prefix,
};
use tracing_subscriber::EnvFilter;

const KAFKA_BROKERS: &str = "kafka.brokers";
const KAFKA_TOPIC: &str = "kafka.topic";
const KAFKA_GROUP_ID_PREFIX: &str = "kafka.group-id-prefix";
const KAFKA_CA_PATH: &str = "kafka.tls.ca-path";
const KAFKA_CERTIFICATE_PATH: &str = "kafka.tls.certificate-path";
const KAFKA_PRIVATE_KEY_PATH: &str = "kafka.tls.private-key-path";
const KAFKA_SASL_USERNAME: &str = "kafka.sasl.username";
const KAFKA_SASL_PASSWORD: &str = "kafka.sasl.password";
const KAFKA_SASL_MECHANISM: &str = "kafka.sasl.mechanism";
const LOG_FORMAT: &str = "log.format";
const LOG_VERBOSITY: &str = "log.verbosity";
const INFLUXDB_URL: &str = "influxdb.url";
const INFLUXDB_USERNAME: &str = "influxdb.username";
const INFLUXDB_PASSWORD: &str = "influxdb.password";
const NORA_URL: &str = "nora.url";
const VERA_URL: &str = "vera.url";
const NULL_ENABLED: &str = "null.enabled";
const METRICS_BIND_ADDRESS: &str = "metrics.bind-address";
const DELIVERY_QUEUE_SIZE: &str = "delivery.queue-size";
const DELIVERY_RETRY_INTERVAL: &str = "delivery.retry-interval";
const HTTP_TIMEOUT: &str = "http.timeout";

pub(super) fn root_cli() -> Command {
    Command::new("deployment-event-relays")
        .about("Relays deployment events from Kafka to InfluxDB, nora and vera")
        .next_help_heading("Kafka")
        .args(kafka_args())
        .next_help_heading("Logging")
        .args(log_args())
        .next_help_heading("Subsystems")
        .args(subsystem_args())
        .next_help_heading("Delivery")
        .args(delivery_args())
}

fn kafka_args() -> [Arg; 9] {
    [
        Arg::new(KAFKA_BROKERS)
            .long(KAFKA_BROKERS)
            .env("KAFKA_BROKERS")
            .value_delimiter(',')
            .default_value(DEFAULT_BROKERS)
            .help("Comma separated list of Kafka brokers, HOST:PORT"),
        Arg::new(KAFKA_TOPIC)
            .long(KAFKA_TOPIC)
            .env("DER_KAFKA_TOPIC")
            .default_value(DEFAULT_TOPIC)
            .help("Topic to read deployment events from"),
        Arg::new(KAFKA_GROUP_ID_PREFIX)
            .long(KAFKA_GROUP_ID_PREFIX)
            .env("DER_KAFKA_GROUP_ID_PREFIX")
            .help("Consumer group prefix, each subsystem appends its name [default: <program>-<hostname>]"),
        Arg::new(KAFKA_CA_PATH)
            .long(KAFKA_CA_PATH)
            .env("KAFKA_CA_PATH")
            .help("Path to the CA certificate of the brokers"),
        Arg::new(KAFKA_CERTIFICATE_PATH)
            .long(KAFKA_CERTIFICATE_PATH)
            .env("KAFKA_CERTIFICATE_PATH")
            .help("Path to the client certificate"),
        Arg::new(KAFKA_PRIVATE_KEY_PATH)
            .long(KAFKA_PRIVATE_KEY_PATH)
            .env("KAFKA_PRIVATE_KEY_PATH")
            .help("Path to the client certificate's private key"),
        Arg::new(KAFKA_SASL_USERNAME)
            .long(KAFKA_SASL_USERNAME)
            .env("DER_KAFKA_SASL_USERNAME")
            .help("SASL username, enables SASL authentication"),
        Arg::new(KAFKA_SASL_PASSWORD)
            .long(KAFKA_SASL_PASSWORD)
            .env("DER_KAFKA_SASL_PASSWORD")
            .hide_env_values(true)
            .help("SASL password"),
        Arg::new(KAFKA_SASL_MECHANISM)
            .long(KAFKA_SASL_MECHANISM)
            .env("DER_KAFKA_SASL_MECHANISM")
            .default_value(DEFAULT_SASL_MECHANISM)
            .help("SASL mechanism: PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512"),
    ]
}

fn log_args() -> [Arg; 2] {
    [
        Arg::new(LOG_FORMAT)
            .long(LOG_FORMAT)
            .env("DER_LOG_FORMAT")
            .value_parser(["text", "json"])
            .default_value("text")
            .help("Log output format"),
        Arg::new(LOG_VERBOSITY)
            .long(LOG_VERBOSITY)
            .env("DER_LOG_VERBOSITY")
            .default_value(DEFAULT_LOG_VERBOSITY)
            .value_parser(parse_verbosity)
            .help("Log filter, e.g. info or relays_core=debug,info. RUST_LOG takes precedence"),
    ]
}

fn parse_verbosity(value: &str) -> std::result::Result<String, String> {
    EnvFilter::try_new(value)
        .map(|_| value.to_string())
        .map_err(|e| format!("invalid log filter: {e}"))
}

fn subsystem_args() -> [Arg; 6] {
    [
        Arg::new(INFLUXDB_URL)
            .long(INFLUXDB_URL)
            .env("DER_INFLUXDB_URL")
            .help("InfluxDB write URL, enables the influxdb subsystem"),
        Arg::new(INFLUXDB_USERNAME)
            .long(INFLUXDB_USERNAME)
            .env("DER_INFLUXDB_USERNAME")
            .help("InfluxDB username"),
        Arg::new(INFLUXDB_PASSWORD)
            .long(INFLUXDB_PASSWORD)
            .env("DER_INFLUXDB_PASSWORD")
            .hide_env_values(true)
            .help("InfluxDB password"),
        Arg::new(NORA_URL)
            .long(NORA_URL)
            .env("DER_NORA_URL")
            .help("nora API URL, enables the nora subsystem"),
        Arg::new(VERA_URL)
            .long(VERA_URL)
            .env("DER_VERA_URL")
            .help("vera API URL, enables the vera subsystem"),
        Arg::new(NULL_ENABLED)
            .long(NULL_ENABLED)
            .env("DER_NULL_ENABLED")
            .action(ArgAction::SetTrue)
            .help("Enable the null subsystem, which only logs events"),
    ]
}

fn delivery_args() -> [Arg; 4] {
    [
        Arg::new(METRICS_BIND_ADDRESS)
            .long(METRICS_BIND_ADDRESS)
            .env("DER_METRICS_BIND_ADDRESS")
            .value_parser(value_parser!(SocketAddr))
            .default_value(DEFAULT_METRICS_BIND_ADDRESS)
            .help("Listen address of the metrics server"),
        Arg::new(DELIVERY_QUEUE_SIZE)
            .long(DELIVERY_QUEUE_SIZE)
            .env("DER_DELIVERY_QUEUE_SIZE")
            .value_parser(value_parser!(usize))
            .default_value("4096")
            .help("Messages buffered per subsystem between the consumer and the sink"),
        Arg::new(DELIVERY_RETRY_INTERVAL)
            .long(DELIVERY_RETRY_INTERVAL)
            .env("DER_DELIVERY_RETRY_INTERVAL")
            .value_parser(value_parser!(u64))
            .default_value("1000")
            .help("Delay before the first retry in milliseconds, doubled on every attempt"),
        Arg::new(HTTP_TIMEOUT)
            .long(HTTP_TIMEOUT)
            .env("DER_HTTP_TIMEOUT")
            .value_parser(value_parser!(u64))
            .default_value("30000")
            .help("Timeout of a single HTTP request in milliseconds"),
    ]
}

fn string_arg(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .filter(|value| !value.is_empty())
        .cloned()
}

pub(super) fn settings_from_matches(matches: &ArgMatches) -> Result<Settings> {
    let sasl = string_arg(matches, KAFKA_SASL_USERNAME).map(|username| SaslSettings {
        mechanism: string_arg(matches, KAFKA_SASL_MECHANISM)
            .unwrap_or_else(|| DEFAULT_SASL_MECHANISM.to_string()),
        username,
        password: string_arg(matches, KAFKA_SASL_PASSWORD).unwrap_or_default(),
    });

    let kafka = KafkaSettings {
        brokers: matches
            .get_many::<String>(KAFKA_BROKERS)
            .map(|brokers| brokers.cloned().collect())
            .unwrap_or_default(),
        topic: string_arg(matches, KAFKA_TOPIC).unwrap_or_default(),
        group_id_prefix: string_arg(matches, KAFKA_GROUP_ID_PREFIX)
            .unwrap_or_else(default_group_id_prefix),
        ca_path: string_arg(matches, KAFKA_CA_PATH),
        certificate_path: string_arg(matches, KAFKA_CERTIFICATE_PATH),
        private_key_path: string_arg(matches, KAFKA_PRIVATE_KEY_PATH),
        sasl,
    };

    let log = LogSettings {
        format: string_arg(matches, LOG_FORMAT)
            .map(|format| format.parse())
            .transpose()?
            .unwrap_or_default(),
        verbosity: string_arg(matches, LOG_VERBOSITY)
            .unwrap_or_else(|| DEFAULT_LOG_VERBOSITY.to_string()),
    };

    let influxdb = string_arg(matches, INFLUXDB_URL).map(|url| InfluxDbSettings {
        url,
        username: string_arg(matches, INFLUXDB_USERNAME),
        password: string_arg(matches, INFLUXDB_PASSWORD),
    });

    let defaults = DeliverySettings::default();
    let delivery = DeliverySettings {
        queue_size: matches
            .get_one::<usize>(DELIVERY_QUEUE_SIZE)
            .copied()
            .unwrap_or(defaults.queue_size),
        retry_interval: matches
            .get_one::<u64>(DELIVERY_RETRY_INTERVAL)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(defaults.retry_interval),
        http_timeout: matches
            .get_one::<u64>(HTTP_TIMEOUT)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(defaults.http_timeout),
    };

    let settings = Settings {
        kafka,
        log,
        influxdb,
        nora: string_arg(matches, NORA_URL).map(|url| RegistrySettings { url }),
        vera: string_arg(matches, VERA_URL).map(|url| RegistrySettings { url }),
        null_enabled: matches.get_flag(NULL_ENABLED),
        metrics_bind_address: matches
            .get_one::<SocketAddr>(METRICS_BIND_ADDRESS)
            .copied()
            .unwrap_or_else(|| Settings::default().metrics_bind_address),
        delivery,
    };
    Ok(settings)
}
