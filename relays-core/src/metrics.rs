use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::error::Error;

// All metrics live under this namespace.
const REGISTRY_PREFIX: &str = "deployment_event_relays";

// Note: no suffix on the names, the `_total` of counters is added by the prometheus client.
const MESSAGES: &str = "messages";
const OFFSET: &str = "offset";
const QUEUE_SIZE: &str = "queue_size";

const SUBSYSTEM_LABEL: &str = "subsystem";
const STATUS_LABEL: &str = "status";

/// What happened to a message, as reported by the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Delivered and acknowledged.
    Ok,
    /// Not a deployment event envelope, acknowledged without processing.
    Dropped,
    /// Rejected for good and acknowledged without delivery.
    Error,
    /// A failed delivery attempt that will be retried.
    Retry,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Ok, Status::Dropped, Status::Error, Status::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Dropped => "dropped",
            Status::Error => "error",
            Status::Retry => "retry",
        }
    }

    /// The offset processing continues from. Only a retry stays on the same message.
    pub fn next_offset(&self, offset: i64) -> i64 {
        match self {
            Status::Retry => offset,
            Status::Ok | Status::Dropped | Status::Error => offset + 1,
        }
    }
}

/// Receives the progress of every subsystem. Passed explicitly to the components that
/// report, there is no process global.
pub trait Observer: Send + Sync + 'static {
    /// A message at `offset` reached `status`.
    fn processed(&self, subsystem: &str, status: Status, offset: i64);

    /// A message entered the delivery queue.
    fn enqueued(&self, subsystem: &str);

    /// A message left the delivery queue, acknowledged or abandoned.
    fn dequeued(&self, subsystem: &str);
}

/// Exposes the observed progress in the Prometheus text format.
pub struct PrometheusObserver {
    registry: parking_lot::Mutex<Registry>,
    messages: Family<Vec<(String, String)>, Counter>,
    offset: Family<Vec<(String, String)>, Gauge>,
    queue_size: Family<Vec<(String, String)>, Gauge>,
}

impl Default for PrometheusObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusObserver {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(REGISTRY_PREFIX);
        let messages = Family::<Vec<(String, String)>, Counter>::default();
        let offset = Family::<Vec<(String, String)>, Gauge>::default();
        let queue_size = Family::<Vec<(String, String)>, Gauge>::default();

        registry.register(
            MESSAGES,
            "Number of processed messages by subsystem and status",
            messages.clone(),
        );
        registry.register(
            OFFSET,
            "Offset the subsystem continues processing from",
            offset.clone(),
        );
        registry.register(
            QUEUE_SIZE,
            "Messages read from the topic but not yet acknowledged",
            queue_size.clone(),
        );

        Self {
            registry: parking_lot::Mutex::new(registry),
            messages,
            offset,
            queue_size,
        }
    }

    /// Creates every series of a subsystem at zero so dashboards see them before the
    /// first message.
    pub fn init_subsystem(&self, subsystem: &str) {
        for status in Status::ALL {
            let _ = self.messages.get_or_create(&message_labels(subsystem, status));
        }
        let _ = self.offset.get_or_create(&subsystem_labels(subsystem));
        let _ = self.queue_size.get_or_create(&subsystem_labels(subsystem));
    }

    pub fn encode(&self) -> Result<String> {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        encode(&mut buffer, &registry)
            .map_err(|e| Error::Metrics(format!("encoding metrics: {e}")))?;
        Ok(buffer)
    }
}

impl Observer for PrometheusObserver {
    fn processed(&self, subsystem: &str, status: Status, offset: i64) {
        self.messages
            .get_or_create(&message_labels(subsystem, status))
            .inc();
        self.offset
            .get_or_create(&subsystem_labels(subsystem))
            .set(status.next_offset(offset));
    }

    fn enqueued(&self, subsystem: &str) {
        self.queue_size
            .get_or_create(&subsystem_labels(subsystem))
            .inc();
    }

    fn dequeued(&self, subsystem: &str) {
        self.queue_size
            .get_or_create(&subsystem_labels(subsystem))
            .dec();
    }
}

fn subsystem_labels(subsystem: &str) -> Vec<(String, String)> {
    vec![(SUBSYSTEM_LABEL.to_string(), subsystem.to_string())]
}

fn message_labels(subsystem: &str, status: Status) -> Vec<(String, String)> {
    vec![
        (SUBSYSTEM_LABEL.to_string(), subsystem.to_string()),
        (STATUS_LABEL.to_string(), status.as_str().to_string()),
    ]
}

fn metrics_router(observer: Arc<PrometheusObserver>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .with_state(observer)
}

async fn metrics_handler(State(observer): State<Arc<PrometheusObserver>>) -> impl IntoResponse {
    match observer.encode() {
        Ok(buffer) => {
            debug!("Exposing metrics: {:?}", buffer);
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    axum::http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )
                .body(Body::from(buffer))
                .map_or_else(
                    |_| StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    IntoResponse::into_response,
                )
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Serves `/metrics` and `/livez` until `cancel` fires.
pub async fn start_metrics_server(
    addr: SocketAddr,
    observer: Arc<PrometheusObserver>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Started metrics server");

    axum::serve(listener, metrics_router(observer))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("metrics server: {e}")))
}
