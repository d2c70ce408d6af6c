use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "wattscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Sessions started by the lifecycle manager.
    pub sessions_started: Counter,
    /// Sessions that ran to a clean stop.
    pub sessions_completed: Counter,
    /// Sessions that stopped with an error.
    pub sessions_failed: Counter,
    /// Aligned samples recorded across all sessions.
    pub samples_collected: Counter,
    /// Malformed counter lines skipped.
    pub parse_errors: Counter,
    /// Per-sample power estimates skipped for missing counters.
    pub estimates_skipped: Counter,
    /// Whether the watched cgroup is populated (1=yes, 0=no).
    pub cgroup_populated: Gauge,
    /// Whether a sampling session is active (1=yes, 0=no).
    pub session_active: Gauge,
    /// Most recent attributed-power estimate in joules.
    pub estimated_power_joules: Gauge,
}

impl HealthMetrics {
    /// Create the metric set and register it; the server starts later.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let sessions_started = counter("sessions_started_total", "Sampling sessions started.")?;
        let sessions_completed = counter(
            "sessions_completed_total",
            "Sampling sessions stopped cleanly.",
        )?;
        let sessions_failed = counter(
            "sessions_failed_total",
            "Sampling sessions stopped with an error.",
        )?;
        let samples_collected = counter("samples_collected_total", "Aligned samples recorded.")?;
        let parse_errors = counter("parse_errors_total", "Malformed counter lines skipped.")?;
        let estimates_skipped = counter(
            "estimates_skipped_total",
            "Power estimates skipped for missing counters.",
        )?;
        let cgroup_populated = gauge(
            "cgroup_populated",
            "Whether the watched cgroup has processes (1=yes, 0=no).",
        )?;
        let session_active = gauge(
            "session_active",
            "Whether a sampling session is running (1=yes, 0=no).",
        )?;
        let estimated_power_joules = gauge(
            "estimated_power_joules",
            "Most recent attributed-power estimate in joules.",
        )?;

        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(sessions_completed.clone()))?;
        registry.register(Box::new(sessions_failed.clone()))?;
        registry.register(Box::new(samples_collected.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(estimates_skipped.clone()))?;
        registry.register(Box::new(cgroup_populated.clone()))?;
        registry.register(Box::new(session_active.clone()))?;
        registry.register(Box::new(estimated_power_joules.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            sessions_started,
            sessions_completed,
            sessions_failed,
            samples_collected,
            parse_errors,
            estimates_skipped,
            cgroup_populated,
            session_active,
            estimated_power_joules,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace("wattscope"))?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace("wattscope"))?)
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {e}"),
        )
            .into_response();
    }

    (StatusCode::OK, buf).into_response()
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
