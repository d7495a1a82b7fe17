use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

/// Reads fail for good after this many consecutive broker errors.
const MAX_FAILURE_COUNT: usize = 10;

/// Timeout of the metadata request that checks the brokers and credentials at startup.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConsumerConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic carrying the deployment events.
    pub topic: String,
    /// The consumer group whose committed offsets track the delivery progress.
    pub consumer_group: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
}

/// A message read from the topic, payload copied out of the librdkafka buffer.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub topic: String,
    pub value: Bytes,
    pub partition: i32,
    pub offset: i64,
}

/// Position of a processed message. Committing it moves the group to `offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committing offsets: {:?}", result);
    }
}

type RelayConsumer = StreamConsumer<KafkaContext>;

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Vec<KafkaMessage>>>,
    },
    Commit {
        offsets: Vec<KafkaOffset>,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Counts broker errors across reads. Only a successfully received message resets it.
#[derive(Debug, Default)]
struct ReadFailures {
    consecutive: usize,
}

impl ReadFailures {
    /// Returns true once more than [`MAX_FAILURE_COUNT`] errors happened in a row.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive > MAX_FAILURE_COUNT
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

struct KafkaActor {
    consumer: Arc<RelayConsumer>,
    read_timeout: Duration,
    batch_size: usize,
    failures: ReadFailures,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    async fn start(
        config: KafkaConsumerConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest")
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let consumer: Arc<RelayConsumer> =
            Arc::new(
                client_config
                    .create_with_context(KafkaContext)
                    .map_err(|err| Error::Connection {
                        server: config.brokers.join(","),
                        error: err.to_string(),
                    })?,
            );

        // Subscribing to a topic that does not exist does not fail, the error shows
        // up on the first read.
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        // subscribe() succeeds even with bad credentials or unreachable brokers, a
        // metadata request does not
        verify_connection(Arc::clone(&consumer), &config.brokers, &config.topic).await?;

        let actor = KafkaActor {
            consumer,
            read_timeout,
            batch_size,
            failures: ReadFailures::default(),
            handler_rx,
        };

        tokio::spawn(async move {
            info!(
                topic = %config.topic,
                consumer_group = %config.consumer_group,
                "Starting Kafka consumer..."
            );
            // returns when every handle to the actor is dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                if respond_to.send(messages).is_err() {
                    error!("Receiver of the Kafka read response went away");
                }
            }
            KafkaActorMessage::Commit {
                offsets,
                respond_to,
            } => {
                let status = self.commit_offsets(offsets).await;
                if respond_to.send(status).is_err() {
                    error!("Receiver of the Kafka commit response went away");
                }
            }
        }
    }

    /// Reads up to `batch_size` messages, returning whatever arrived when the read
    /// timeout fires. An empty batch is a valid result.
    async fn read_messages(&mut self) -> Result<Vec<KafkaMessage>> {
        let mut messages: Vec<KafkaMessage> = Vec::with_capacity(self.batch_size);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        while messages.len() < self.batch_size {
            tokio::select! {
                biased;

                _ = &mut timeout => break,

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            self.failures.reset();
                            msg
                        }
                        Err(e) => {
                            if self.failures.record() {
                                return Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let value = match message.payload() {
                        Some(payload) => Bytes::copy_from_slice(payload),
                        None => Bytes::new(),
                    };

                    messages.push(KafkaMessage {
                        topic: message.topic().to_string(),
                        value,
                        partition: message.partition(),
                        offset: message.offset(),
                    });
                }
            }
        }
        debug!(msg_count = messages.len(), "Read messages from Kafka");
        Ok(messages)
    }

    async fn commit_offsets(&mut self, offsets: Vec<KafkaOffset>) -> Result<()> {
        // topic -> partition -> highest offset
        let mut topic_partition_offsets: HashMap<String, HashMap<i32, i64>> = HashMap::new();
        for kafka_offset in offsets {
            topic_partition_offsets
                .entry(kafka_offset.topic)
                .or_default()
                .entry(kafka_offset.partition)
                .and_modify(|current| *current = (*current).max(kafka_offset.offset))
                .or_insert(kafka_offset.offset);
        }

        let mut tpl = TopicPartitionList::new();
        for (topic, partition_offsets) in &topic_partition_offsets {
            for (partition, offset) in partition_offsets {
                // the committed offset is the next one to read
                tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                    .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
            }
        }
        if tpl.count() == 0 {
            return Ok(());
        }

        // a synchronous commit blocks on the broker round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Kafka(format!("Waiting for the commit task to complete: {e:?}")))?
    }
}

async fn verify_connection(
    consumer: Arc<RelayConsumer>,
    brokers: &[String],
    topic: &str,
) -> Result<()> {
    let metadata_topic = topic.to_string();
    // fetch_metadata blocks on the broker round trip
    tokio::task::spawn_blocking(move || {
        consumer
            .fetch_metadata(Some(&metadata_topic), METADATA_TIMEOUT)
            .map(|_| ())
    })
    .await
    .map_err(|e| Error::Kafka(format!("Waiting for the metadata request to complete: {e:?}")))?
    .map_err(|e| Error::Connection {
        server: brokers.join(","),
        error: format!("fetching metadata of topic {topic}: {e}"),
    })
}

/// Handle to the consumer actor. Clones share the same underlying rdkafka consumer.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaConsumer {
    /// Connects and checks the brokers accept the configured credentials. Fails when the
    /// topic metadata cannot be fetched.
    pub async fn connect(
        config: KafkaConsumerConfig,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, read_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    pub async fn read_messages(&self) -> Result<Vec<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Read { respond_to: tx };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn commit_offsets(&self, offsets: Vec<KafkaOffset>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Commit {
            offsets,
            respond_to: tx,
        };
        let _ = self.actor_tx.send(msg).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }
}

/// Helpers for tests that need a running broker on localhost:9092.
#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use std::time::Duration;

    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    pub async fn setup_test_topic(topic_name: &str) -> FutureProducer {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create::<rdkafka::admin::AdminClient<_>>()
            .expect("Failed to create admin client");

        let topic_config = rdkafka::admin::NewTopic::new(
            topic_name,
            1,
            rdkafka::admin::TopicReplication::Fixed(1),
        );
        let _ = admin_client
            .create_topics(&[topic_config], &rdkafka::admin::AdminOptions::new())
            .await
            .expect("Failed to create topic");

        producer
    }

    pub async fn produce_test_messages(producer: &FutureProducer, topic: &str, payloads: &[Vec<u8>]) {
        for payload in payloads {
            let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(topic).payload(payload);
            producer
                .send(record, Duration::from_secs(5))
                .await
                .expect("Failed to send message");
        }
    }
}
