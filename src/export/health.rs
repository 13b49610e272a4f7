use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "scout";

/// Prometheus metrics describing the agent itself.
///
/// All metrics use the "scout" namespace. Organized by pipeline stage:
/// - Emission: points built and rejected by collectors
/// - Scheduling: per-collector invocation outcomes and timing
/// - Delivery: batches shipped to the remote endpoint
/// - Metadata: side-channel records
/// - Process: resource usage watched by the watchdog
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Emission ===
    /// Points forwarded onto the pipeline by collector.
    pub points_emitted: CounterVec,
    /// Points dropped by validation.
    pub points_rejected: Counter,

    // === Scheduling ===
    /// Collector invocations by collector.
    pub collector_invocations: CounterVec,
    /// Failed collector invocations by collector.
    pub collector_errors: CounterVec,
    /// Ticks dropped because the previous invocation was still running.
    pub collector_ticks_skipped: CounterVec,
    /// Invocation wall time by collector.
    pub collector_duration: HistogramVec,
    /// Collectors disabled by a failed init.
    pub collector_init_failures: Counter,
    /// Collectors currently scheduled.
    pub collectors_running: Gauge,

    // === Delivery ===
    /// Points acknowledged by the remote endpoint.
    pub points_sent: Counter,
    /// Batches acknowledged by the remote endpoint.
    pub batches_sent: Counter,
    /// Batches dropped after exhausting retries.
    pub batches_dropped: Counter,
    /// Delivery attempts beyond the first.
    pub send_retries: Counter,
    /// Points per delivered batch.
    pub batch_size: Histogram,
    /// Points waiting in the pipeline channel.
    pub pipeline_depth: Gauge,
    /// Local sink write failures.
    pub sink_write_errors: Counter,

    // === Metadata ===
    /// Metadata records staged for delivery.
    pub metadata_staged: Counter,
    /// Metadata records dropped because the staging queue was full.
    pub metadata_dropped: Counter,
    /// Metadata entries delivered.
    pub metadata_sent: Counter,
    /// Failed metadata requests.
    pub metadata_errors: Counter,

    // === Process ===
    /// Last observed resident set size in bytes.
    pub resident_memory_bytes: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    ///
    /// An empty `addr` disables the HTTP server; metrics are still recorded.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Emission ===
        let points_emitted = CounterVec::new(
            Opts::new(
                "points_emitted_total",
                "Points forwarded onto the pipeline by collector.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let points_rejected = Counter::with_opts(
            Opts::new(
                "points_rejected_total",
                "Points dropped because they failed validation.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Scheduling ===
        let collector_invocations = CounterVec::new(
            Opts::new(
                "collector_invocations_total",
                "Collector invocations by collector.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let collector_errors = CounterVec::new(
            Opts::new(
                "collector_errors_total",
                "Failed collector invocations by collector.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let collector_ticks_skipped = CounterVec::new(
            Opts::new(
                "collector_ticks_skipped_total",
                "Ticks dropped because the previous invocation was still running.",
            )
            .namespace(NAMESPACE),
            &["collector"],
        )?;
        let collector_duration = HistogramVec::new(
            HistogramOpts::new(
                "collector_duration_seconds",
                "Collector invocation wall time.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["collector"],
        )?;
        let collector_init_failures = Counter::with_opts(
            Opts::new(
                "collector_init_failures_total",
                "Collectors disabled by a failed init.",
            )
            .namespace(NAMESPACE),
        )?;
        let collectors_running = Gauge::with_opts(
            Opts::new("collectors_running", "Collectors currently scheduled.")
                .namespace(NAMESPACE),
        )?;

        // === Delivery ===
        let points_sent = Counter::with_opts(
            Opts::new(
                "points_sent_total",
                "Points acknowledged by the remote endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_sent = Counter::with_opts(
            Opts::new(
                "batches_sent_total",
                "Batches acknowledged by the remote endpoint.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_dropped = Counter::with_opts(
            Opts::new(
                "batches_dropped_total",
                "Batches dropped after exhausting delivery attempts.",
            )
            .namespace(NAMESPACE),
        )?;
        let send_retries = Counter::with_opts(
            Opts::new("send_retries_total", "Delivery attempts beyond the first.")
                .namespace(NAMESPACE),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size_points", "Points per delivered batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
        )?;
        let pipeline_depth = Gauge::with_opts(
            Opts::new("pipeline_depth", "Points waiting in the pipeline channel.")
                .namespace(NAMESPACE),
        )?;
        let sink_write_errors = Counter::with_opts(
            Opts::new("sink_write_errors_total", "Local sink write failures.")
                .namespace(NAMESPACE),
        )?;

        // === Metadata ===
        let metadata_staged = Counter::with_opts(
            Opts::new(
                "metadata_staged_total",
                "Metadata records staged for delivery.",
            )
            .namespace(NAMESPACE),
        )?;
        let metadata_dropped = Counter::with_opts(
            Opts::new(
                "metadata_dropped_total",
                "Metadata records dropped because the staging queue was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let metadata_sent = Counter::with_opts(
            Opts::new("metadata_sent_total", "Metadata entries delivered.")
                .namespace(NAMESPACE),
        )?;
        let metadata_errors = Counter::with_opts(
            Opts::new("metadata_errors_total", "Failed metadata requests.")
                .namespace(NAMESPACE),
        )?;

        // === Process ===
        let resident_memory_bytes = Gauge::with_opts(
            Opts::new(
                "process_resident_memory_bytes",
                "Last observed resident set size in bytes.",
            )
            .namespace(NAMESPACE),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(points_emitted.clone()))?;
        registry.register(Box::new(points_rejected.clone()))?;

        registry.register(Box::new(collector_invocations.clone()))?;
        registry.register(Box::new(collector_errors.clone()))?;
        registry.register(Box::new(collector_ticks_skipped.clone()))?;
        registry.register(Box::new(collector_duration.clone()))?;
        registry.register(Box::new(collector_init_failures.clone()))?;
        registry.register(Box::new(collectors_running.clone()))?;

        registry.register(Box::new(points_sent.clone()))?;
        registry.register(Box::new(batches_sent.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(send_retries.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(pipeline_depth.clone()))?;
        registry.register(Box::new(sink_write_errors.clone()))?;

        registry.register(Box::new(metadata_staged.clone()))?;
        registry.register(Box::new(metadata_dropped.clone()))?;
        registry.register(Box::new(metadata_sent.clone()))?;
        registry.register(Box::new(metadata_errors.clone()))?;

        registry.register(Box::new(resident_memory_bytes.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            points_emitted,
            points_rejected,
            collector_invocations,
            collector_errors,
            collector_ticks_skipped,
            collector_duration,
            collector_init_failures,
            collectors_running,
            points_sent,
            batches_sent,
            batches_dropped,
            send_retries,
            batch_size,
            pipeline_depth,
            sink_write_errors,
            metadata_staged,
            metadata_dropped,
            metadata_sent,
            metadata_errors,
            resident_memory_bytes,
        })
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, or `None` when no address is configured.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if self.addr.is_empty() {
            return Ok(None);
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(Some(local_addr))
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_namespace() {
        let health = HealthMetrics::new("").expect("metrics");
        health.batches_dropped.inc();
        health.points_emitted.with_label_values(&["fake"]).inc_by(3.0);

        let text = health.render().expect("render");
        assert!(text.contains("scout_batches_dropped_total 1"));
        assert!(text.contains("scout_points_emitted_total{collector=\"fake\"} 3"));
    }

    #[tokio::test]
    async fn test_start_disabled_without_addr() {
        let health = HealthMetrics::new("").expect("metrics");
        assert!(health.start().await.expect("start").is_none());
    }

    #[tokio::test]
    async fn test_server_serves_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.points_rejected.inc();
        let addr = health.start().await.expect("start").expect("bound");

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(body.contains("scout_points_rejected_total 1"));

        health.stop().await.expect("stop");
    }
}
