//! Relays deployment events from a Kafka topic to the configured subsystems.
//!
//! Each subsystem runs on its own:
//! - Read the topic under the subsystem's own consumer group
//! - Decode the event and encode it for the subsystem
//! - Deliver it, retrying with exponential backoff until the sink accepts it
//! - Commit the offset once the message is delivered or discarded

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use relays_kafka::consumer::KafkaConsumer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::error::{Error, Result};

pub mod config;
pub mod consumer;
pub(crate) mod delivery;
pub mod encoder;
mod error;
pub mod event;
pub mod metrics;
pub mod relay;
pub mod sink;

use crate::config::Settings;
use crate::consumer::Consumer;
use crate::metrics::{Observer, PrometheusObserver, start_metrics_server};
use crate::relay::Relay;
use crate::sink::SinkClient;

/// Messages read from Kafka per poll.
const KAFKA_BATCH_SIZE: usize = 500;
const KAFKA_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Starts every enabled relay and the metrics server. Returns once a shutdown signal
/// arrives, or with the first error that stops a relay.
pub async fn run(settings: Settings) -> Result<()> {
    settings.validate()?;
    info!(?settings, "Starting deployment event relays");

    let cancel = CancellationToken::new();
    let observer = Arc::new(PrometheusObserver::new());

    // connect everything before starting, a bad subsystem stops the process up front
    let mut relays = Vec::new();
    for sink_settings in settings.sinks() {
        let subsystem = sink_settings.subsystem();
        observer.init_subsystem(subsystem);

        let sink = SinkClient::new(&sink_settings, settings.delivery.http_timeout)?;
        let client = KafkaConsumer::connect(
            settings.kafka.consumer_config(subsystem)?,
            KAFKA_BATCH_SIZE,
            KAFKA_READ_TIMEOUT,
        )
        .await?;
        relays.push(Relay::new(
            sink,
            Consumer::new(subsystem, client, cancel.clone()),
            Arc::clone(&observer) as Arc<dyn Observer>,
            &settings.delivery,
            cancel.clone(),
        ));
    }

    let shutdown_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    });

    let mut metrics_server = tokio::spawn(start_metrics_server(
        settings.metrics_bind_address,
        Arc::clone(&observer),
        cancel.clone(),
    ));
    let mut metrics_stopped = false;

    let mut running: FuturesUnordered<_> = relays
        .into_iter()
        .map(|relay| tokio::spawn(relay.run()))
        .collect();

    let mut result = Ok(());
    loop {
        let stopped = tokio::select! {
            joined = running.next() => match joined {
                Some(joined) => joined,
                None => break,
            },
            joined = &mut metrics_server, if !metrics_stopped => {
                metrics_stopped = true;
                joined
            },
        };

        let outcome = stopped
            .map_err(|e| Error::Consumer(format!("task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = outcome {
            error!(?e, "Stopping all relays");
            cancel.cancel();
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    cancel.cancel();
    if !metrics_stopped {
        match metrics_server.await {
            Ok(Err(e)) => error!(?e, "Metrics server failed"),
            Err(e) => error!(?e, "Metrics server task failed"),
            Ok(Ok(())) => {}
        }
    }

    info!("Gracefully Exiting...");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install the terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
