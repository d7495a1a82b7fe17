//! One relay per enabled subsystem: reads the topic through its own consumer group,
//! decides what to do with each message and hands it to the subsystem's delivery worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::Result;
use crate::config::DeliverySettings;
use crate::consumer::{Consumer, DeliveryMessage, Offset, TopicClient};
use crate::delivery::{Action, DeliveryWorker, WorkItem};
use crate::error::Error;
use crate::event::{EnvelopeError, decode_envelope};
use crate::metrics::{Observer, Status};
use crate::sink::SinkClient;

pub struct Relay<C> {
    sink: SinkClient,
    consumer: Consumer<C>,
    observer: Arc<dyn Observer>,
    queue_size: usize,
    retry_interval: Duration,
    cancel: CancellationToken,
}

impl<C> Relay<C>
where
    C: TopicClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        sink: SinkClient,
        consumer: Consumer<C>,
        observer: Arc<dyn Observer>,
        delivery: &DeliverySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            consumer,
            observer,
            queue_size: delivery.queue_size,
            retry_interval: delivery.retry_interval,
            cancel,
        }
    }

    /// Runs until cancelled. Returns an error when the consumer shuts down on its own,
    /// the caller is expected to stop the whole process.
    pub async fn run(mut self) -> Result<()> {
        let subsystem = self.sink.subsystem();
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_size);
        let worker = DeliveryWorker::new(
            self.sink.clone(),
            Arc::clone(&self.observer),
            self.retry_interval,
            self.cancel.clone(),
        );
        let worker_handle = tokio::spawn(worker.run(queue_rx));
        info!(subsystem, "Started relay");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.consumer.consume().recv() => message,
            };

            let Some(message) = message else {
                error!(subsystem, "Topic consumer shut down");
                return Err(Error::Consumer(format!(
                    "{subsystem}: kafka consumer has shut down"
                )));
            };

            let item = self.work_item(message);
            self.observer.enqueued(subsystem);
            if queue_tx.send(item).await.is_err() {
                self.observer.dequeued(subsystem);
                // the worker only stops early on cancellation
                break;
            }
        }

        drop(queue_tx);
        worker_handle
            .await
            .map_err(|e| Error::Sink(format!("{subsystem}: delivery worker failed: {e}")))?;
        info!(subsystem, "Relay stopped");
        Ok(())
    }

    /// Decodes the message and prepares the sink's payload. Everything that cannot be
    /// delivered becomes a discard, acknowledged by the worker in topic order.
    fn work_item(&self, message: DeliveryMessage) -> WorkItem {
        let subsystem = self.sink.subsystem();
        let (value, ack) = message.into_parts();
        let span = message_span(subsystem, ack.offset());

        let action = match decode_envelope(&value) {
            Err(EnvelopeError::Unrecognized(reason)) => {
                debug!(parent: &span, %reason, "Dropping message without a deployment event");
                Action::Discard(Status::Dropped)
            }
            Err(e @ EnvelopeError::Malformed(_)) => {
                error!(parent: &span, error = %e, "Discarding message");
                Action::Discard(Status::Error)
            }
            Ok(event) => {
                span.record("correlation_id", event.correlation_id.as_str());
                span.record("application", event.application.as_str());
                match self.sink.prepare(&event) {
                    Ok(payload) => Action::Send(payload),
                    Err(rejection) => {
                        warn!(parent: &span, %rejection, "Discarding event");
                        Action::Discard(Status::Error)
                    }
                }
            }
        };

        WorkItem { action, ack, span }
    }
}

fn message_span(subsystem: &'static str, offset: &Offset) -> Span {
    info_span!(
        "message",
        subsystem,
        correlation_id = tracing::field::Empty,
        application = tracing::field::Empty,
        kafka_partition = offset.partition,
        kafka_offset = offset.offset,
    )
}
