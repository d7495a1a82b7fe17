//! Consumer-group reader of the deployment topic.
//!
//! [`Consumer::consume`] starts a background puller on first use and yields
//! [`DeliveryMessage`]s over a bounded channel. Every message carries an [`AckHandle`];
//! acknowledging it commits the message's offset for the consumer group. The channel
//! closes when reading from the topic fails, callers treat that as fatal.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

pub(crate) mod kafka;

/// Capacity of the channel between the puller and the caller of [`Consumer::consume`].
pub const RECV_QUEUE_SIZE: usize = 32768;

/// Position of a message within the topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Offset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A message as read from the topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub value: Bytes,
    pub offset: Offset,
}

/// Access to the topic in consumer-group mode with manual commits.
#[trait_variant::make(TopicClient: Send)]
pub trait LocalTopicClient {
    /// Reads the next batch, which may be empty. Starts from the oldest uncommitted offset.
    async fn read(&self) -> Result<Vec<TopicMessage>>;

    /// Marks the given messages as processed; the group resumes after them.
    async fn commit(&self, offsets: Vec<Offset>) -> Result<()>;
}

/// Acknowledges one message. Consumed by [`AckHandle::ack`], so a message cannot be
/// acknowledged twice.
#[derive(Debug)]
pub struct AckHandle {
    offset: Offset,
    ack_tx: mpsc::UnboundedSender<Offset>,
}

impl AckHandle {
    pub fn offset(&self) -> &Offset {
        &self.offset
    }

    pub fn ack(self) {
        if self.ack_tx.send(self.offset).is_err() {
            warn!("Offset committer has stopped, acknowledgement is lost");
        }
    }
}

#[derive(Debug)]
pub struct DeliveryMessage {
    pub value: Bytes,
    ack: AckHandle,
}

impl DeliveryMessage {
    pub fn offset(&self) -> &Offset {
        self.ack.offset()
    }

    pub fn into_parts(self) -> (Bytes, AckHandle) {
        (self.value, self.ack)
    }
}

pub struct Consumer<C> {
    client: Option<C>,
    name: String,
    messages_tx: Option<mpsc::Sender<DeliveryMessage>>,
    messages: mpsc::Receiver<DeliveryMessage>,
    cancel: CancellationToken,
}

impl<C> Consumer<C>
where
    C: TopicClient + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, client: C, cancel: CancellationToken) -> Self {
        let (messages_tx, messages) = mpsc::channel(RECV_QUEUE_SIZE);
        Self {
            client: Some(client),
            name: name.into(),
            messages_tx: Some(messages_tx),
            messages,
            cancel,
        }
    }

    /// Returns the message channel, starting the puller on the first call. Later calls
    /// return the same channel.
    pub fn consume(&mut self) -> &mut mpsc::Receiver<DeliveryMessage> {
        if let (Some(client), Some(messages_tx)) = (self.client.take(), self.messages_tx.take()) {
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();

            tokio::spawn(commit_acks(self.name.clone(), client.clone(), ack_rx));
            tokio::spawn(pull(
                self.name.clone(),
                client,
                messages_tx,
                ack_tx,
                self.cancel.clone(),
            ));
        }
        &mut self.messages
    }
}

async fn pull<C: TopicClient>(
    name: String,
    client: C,
    messages_tx: mpsc::Sender<DeliveryMessage>,
    ack_tx: mpsc::UnboundedSender<Offset>,
    cancel: CancellationToken,
) {
    info!(subsystem = %name, "Started consuming the deployment topic");
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(subsystem = %name, "Cancellation received, stopping the consumer");
                return;
            }
            batch = client.read() => batch,
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                // dropping the sender closes the channel
                error!(subsystem = %name, ?e, "Reading from the topic failed, closing the consumer");
                return;
            }
        };

        for message in batch {
            debug!(
                subsystem = %name,
                kafka_topic = %message.offset.topic,
                kafka_partition = message.offset.partition,
                kafka_offset = message.offset.offset,
                "Received message"
            );
            let delivery = DeliveryMessage {
                value: message.value,
                ack: AckHandle {
                    offset: message.offset,
                    ack_tx: ack_tx.clone(),
                },
            };
            if messages_tx.send(delivery).await.is_err() {
                info!(subsystem = %name, "Message receiver dropped, stopping the consumer");
                return;
            }
        }
    }
}

/// Commits acknowledged offsets, batching whatever piled up since the last commit.
/// Runs until the puller and every outstanding [`AckHandle`] are gone.
async fn commit_acks<C: TopicClient>(
    name: String,
    client: C,
    mut ack_rx: mpsc::UnboundedReceiver<Offset>,
) {
    while let Some(offset) = ack_rx.recv().await {
        let mut offsets = vec![offset];
        while let Ok(offset) = ack_rx.try_recv() {
            offsets.push(offset);
        }
        if let Err(e) = client.commit(offsets).await {
            error!(subsystem = %name, ?e, "Failed to commit offsets");
        }
    }
    debug!(subsystem = %name, "Offset committer stopped");
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::{Offset, TopicClient, TopicMessage};
    use crate::Result;
    use crate::error::Error;

    pub(crate) const TOPIC: &str = "deployment-events";

    #[derive(Default)]
    struct Inner {
        pending: VecDeque<TopicMessage>,
        committed: Vec<Offset>,
        next_offset: i64,
        failed: bool,
    }

    /// A single partition topic kept in memory.
    #[derive(Clone, Default)]
    pub(crate) struct InMemoryTopic {
        inner: Arc<Mutex<Inner>>,
    }

    impl InMemoryTopic {
        pub(crate) fn produce(&self, value: impl Into<Bytes>) -> Offset {
            let mut inner = self.inner.lock();
            let offset = Offset {
                topic: TOPIC.to_string(),
                partition: 0,
                offset: inner.next_offset,
            };
            inner.next_offset += 1;
            inner.pending.push_back(TopicMessage {
                value: value.into(),
                offset: offset.clone(),
            });
            offset
        }

        pub(crate) fn committed(&self) -> Vec<Offset> {
            self.inner.lock().committed.clone()
        }

        /// Every read from now on fails.
        pub(crate) fn break_connection(&self) {
            self.inner.lock().failed = true;
        }

        /// Waits until `count` offsets have been committed.
        pub(crate) async fn wait_for_commits(&self, count: usize) -> Vec<Offset> {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                let committed = self.committed();
                if committed.len() >= count || tokio::time::Instant::now() > deadline {
                    return committed;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    impl TopicClient for InMemoryTopic {
        async fn read(&self) -> Result<Vec<TopicMessage>> {
            {
                let mut inner = self.inner.lock();
                if inner.failed {
                    return Err(Error::Kafka("broker connection lost".to_string()));
                }
                if !inner.pending.is_empty() {
                    return Ok(inner.pending.drain(..).collect());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(vec![])
        }

        async fn commit(&self, offsets: Vec<Offset>) -> Result<()> {
            self.inner.lock().committed.extend(offsets);
            Ok(())
        }
    }
}
