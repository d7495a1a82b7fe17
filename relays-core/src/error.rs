use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Kafka Error - {0}")]
    Kafka(String),

    #[error("Consumer Error - {0}")]
    Consumer(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("metrics Error - {0}")]
    Metrics(String),
}

impl From<relays_kafka::Error> for Error {
    fn from(value: relays_kafka::Error) -> Self {
        Error::Kafka(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_errors_keep_their_message() {
        let error: Error = relays_kafka::Error::Connection {
            server: "localhost:9092".to_string(),
            error: "broker down".to_string(),
        }
        .into();
        assert!(
            matches!(&error, Error::Kafka(message) if message == "Connecting to Kafka localhost:9092 - broker down")
        );
        assert_eq!(
            error.to_string(),
            "Kafka Error - Connecting to Kafka localhost:9092 - broker down"
        );
    }
}
