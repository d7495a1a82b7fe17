//! The delivery worker drains one subsystem's queue in order. Every work item ends
//! acknowledged, either delivered or discarded, unless shutdown interrupts its retries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};

use crate::consumer::AckHandle;
use crate::metrics::{Observer, Status};
use crate::sink::{Outcome, SinkClient};

/// What the worker does with a message.
#[derive(Debug)]
pub(crate) enum Action {
    /// Deliver the prepared payload, retrying until it is accepted.
    Send(Bytes),
    /// Acknowledge without delivery, reported with the given status.
    Discard(Status),
}

#[derive(Debug)]
pub(crate) struct WorkItem {
    pub(crate) action: Action,
    pub(crate) ack: AckHandle,
    /// Carries the message's log context into the worker.
    pub(crate) span: Span,
}

/// Exponential backoff doubling from the initial interval, without a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration) -> Self {
        Self { next: initial }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2);
        delay
    }
}

enum Delivery {
    Delivered,
    Rejected(String),
    Cancelled,
}

pub(crate) struct DeliveryWorker {
    sink: SinkClient,
    observer: Arc<dyn Observer>,
    retry_interval: Duration,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    pub(crate) fn new(
        sink: SinkClient,
        observer: Arc<dyn Observer>,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            observer,
            retry_interval,
            cancel,
        }
    }

    /// Processes work items one at a time until the queue closes or shutdown begins.
    pub(crate) async fn run(self, mut queue: mpsc::Receiver<WorkItem>) {
        let subsystem = self.sink.subsystem();
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let span = item.span.clone();
            if !self.process(item).instrument(span).await {
                break;
            }
        }
        info!(subsystem, "Delivery worker stopped");
    }

    /// Returns false when shutdown interrupted the item.
    async fn process(&self, item: WorkItem) -> bool {
        let subsystem = self.sink.subsystem();
        let WorkItem { action, ack, .. } = item;
        let offset = ack.offset().offset;

        let status = match action {
            Action::Discard(status) => status,
            Action::Send(payload) => match self.deliver(&payload, offset).await {
                Delivery::Delivered => {
                    info!("Delivered event");
                    Status::Ok
                }
                Delivery::Rejected(reason) => {
                    error!(%reason, "Sink rejected the event, discarding");
                    Status::Error
                }
                Delivery::Cancelled => {
                    warn!("Shutting down, event is left unacknowledged");
                    self.observer.dequeued(subsystem);
                    return false;
                }
            },
        };

        self.observer.processed(subsystem, status, offset);
        self.observer.dequeued(subsystem);
        ack.ack();
        true
    }

    async fn deliver(&self, payload: &Bytes, offset: i64) -> Delivery {
        let subsystem = self.sink.subsystem();
        let mut backoff = Backoff::new(self.retry_interval);
        let mut retry_attempt: u64 = 0;

        loop {
            let reason = match self.sink.send(payload).await {
                Outcome::Success => return Delivery::Delivered,
                Outcome::Permanent(reason) => return Delivery::Rejected(reason),
                Outcome::Retryable(reason) => reason,
            };
            self.observer.processed(subsystem, Status::Retry, offset);

            if self.cancel.is_cancelled() {
                return Delivery::Cancelled;
            }

            retry_attempt += 1;
            let delay = backoff.next_delay();
            warn!(?retry_attempt, ?delay, %reason, "Retrying due to retryable error.");

            tokio::select! {
                _ = self.cancel.cancelled() => return Delivery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
