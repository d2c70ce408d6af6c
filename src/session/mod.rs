use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ResolvedEvents;
use crate::health::HealthMetrics;
use crate::power::PowerEstimator;
use crate::sampler::parse::{parse_chunk, ParsedChunk};
use crate::sampler::{Chunk, PerfSampler, Scope, CHUNK_QUEUE_DEPTH};
use crate::sink::Sink;

/// Lifecycle of one sampling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One aligned reading across both scopes.
///
/// A scope whose stream has ended (or was never requested) is absent,
/// never zero-filled: "no data" is distinct from "counted zero".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Interval timestamp in seconds, from the measurement stream.
    pub timestamp: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<BTreeMap<String, f64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<BTreeMap<String, f64>>,
}

/// Power attributed to the cgroup for one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributedPower {
    pub timestamp: f64,
    pub system_power_joules: f64,
    pub cgroup_power_joules: f64,
}

/// Parameters of one sampling run.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// perf `-G` target; `None` samples the system scope only.
    pub cgroup: Option<String>,
    pub interval: Duration,
    pub duration: Duration,
    pub perf_bin: String,
}

/// Counters accumulated over one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub samples: usize,
    pub estimates: usize,
    pub parse_errors: usize,
    pub estimates_skipped: usize,
}

/// A started session: cancel to request a graceful stop, then await the
/// join handle for cleanup to complete.
pub struct SessionHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<SessionReport>>,
}

impl SessionHandle {
    /// Request a graceful stop without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to finish cleanup and return its report.
    pub async fn join(self) -> Result<SessionReport> {
        self.join.await.context("session task panicked")?
    }

    pub(crate) fn join_mut(&mut self) -> &mut JoinHandle<Result<SessionReport>> {
        &mut self.join
    }
}

/// Spawn a session task: two measurement streams, the alignment pump,
/// and guaranteed subprocess/sink cleanup on every exit path.
pub fn start(
    spec: SessionSpec,
    resolved: ResolvedEvents,
    sink: Box<dyn Sink>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> SessionHandle {
    let join = tokio::spawn(run(spec, resolved, sink, health, cancel.clone()));
    SessionHandle { cancel, join }
}

/// Run one session to completion.
async fn run(
    spec: SessionSpec,
    resolved: ResolvedEvents,
    mut sink: Box<dyn Sink>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> Result<SessionReport> {
    let mut state = SessionState::Starting;
    info!(
        cgroup = spec.cgroup.as_deref().unwrap_or("-"),
        interval_ms = spec.interval.as_millis() as u64,
        duration_s = spec.duration.as_secs(),
        system_events = resolved.system.len(),
        cgroup_events = resolved.cgroup.len(),
        ?state,
        "session starting",
    );

    let estimator = PowerEstimator::from_resolved(&resolved);
    if estimator.is_none() {
        warn!("resolved events cannot support power attribution, recording samples only");
    }

    // System-wide stream.
    let system_sampler = PerfSampler::new(
        spec.perf_bin.as_str(),
        Scope::System,
        resolved.system_names(),
        spec.interval,
        spec.duration,
    );
    let (system_tx, system_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
    let system_task = system_sampler.spawn(cancel.child_token(), system_tx)?;

    // Cgroup-scoped stream, when a target was requested and the catalog
    // has events that can be counted per-cgroup.
    let mut cgroup_parts = None;
    if let Some(target) = &spec.cgroup {
        if resolved.cgroup.is_empty() {
            warn!("no cgroup-scope events resolved, skipping cgroup stream");
        } else {
            let sampler = PerfSampler::new(
                spec.perf_bin.as_str(),
                Scope::Cgroup(target.clone()),
                resolved.cgroup_names(),
                spec.interval,
                spec.duration,
            );
            let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
            match sampler.spawn(cancel.child_token(), tx) {
                Ok(task) => cgroup_parts = Some((task, rx)),
                Err(e) => {
                    // Reclaim the already-running system stream before
                    // surfacing the failure.
                    cancel.cancel();
                    let _ = system_task.await;
                    return Err(e);
                }
            }
        }
    }

    let (cgroup_task, cgroup_rx) = match cgroup_parts {
        Some((task, rx)) => (Some(task), Some(rx)),
        None => (None, None),
    };

    state = SessionState::Running;
    info!(?state, "session running");

    let pump_result = pump(
        system_rx,
        cgroup_rx,
        estimator.as_ref(),
        sink.as_mut(),
        &health,
    )
    .await;

    // The pump only returns once both streams closed: either perf ran
    // its course or cancellation stopped the readers. A sink failure
    // ends the pump early; stop the streams rather than waiting out
    // the duration.
    state = SessionState::Stopping;
    debug!(?state, "session draining");

    if pump_result.is_err() {
        cancel.cancel();
    }

    system_task.await.context("joining system sampler")?;
    if let Some(task) = cgroup_task {
        task.await.context("joining cgroup sampler")?;
    }

    let report = pump_result?;
    sink.flush().context("flushing output sink")?;

    state = SessionState::Stopped;
    info!(
        ?state,
        samples = report.samples,
        estimates = report.estimates,
        parse_errors = report.parse_errors,
        estimates_skipped = report.estimates_skipped,
        "session stopped",
    );

    Ok(report)
}

/// The alignment/parse step: pair the i-th system chunk with the i-th
/// cgroup chunk by position, parse both sides, record the sample, and
/// run the estimator when both scopes are present.
///
/// When one stream ends before the other, remaining pairs carry an
/// absent scope rather than zeros.
pub async fn pump(
    mut system_rx: mpsc::Receiver<Chunk>,
    mut cgroup_rx: Option<mpsc::Receiver<Chunk>>,
    estimator: Option<&PowerEstimator>,
    sink: &mut dyn Sink,
    health: &HealthMetrics,
) -> Result<SessionReport> {
    let mut report = SessionReport::default();

    loop {
        let system_chunk = system_rx.recv().await;
        let cgroup_chunk = match cgroup_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        if system_chunk.is_none() && cgroup_chunk.is_none() {
            break;
        }

        let system = parse_scope(system_chunk, "system", &mut report, health);
        let cgroup = parse_scope(cgroup_chunk, "cgroup", &mut report, health);

        let timestamp = system
            .as_ref()
            .and_then(|c| c.timestamp)
            .or_else(|| cgroup.as_ref().and_then(|c| c.timestamp))
            .unwrap_or_default();

        let sample = Sample {
            timestamp,
            system: system.map(|c| c.counters),
            cgroup: cgroup.map(|c| c.counters),
        };

        sink.record_sample(&sample)?;
        report.samples += 1;
        health.samples_collected.inc();

        if let Some(estimator) = estimator {
            if sample.system.is_some() && sample.cgroup.is_some() {
                match estimator.estimate(&sample) {
                    Ok(power) => {
                        sink.record_power(&power)?;
                        report.estimates += 1;
                        health.estimated_power_joules.set(power.cgroup_power_joules);
                    }
                    Err(e) => {
                        // Skip this sample's estimate only.
                        warn!(error = %e, timestamp, "skipping power estimate");
                        report.estimates_skipped += 1;
                        health.estimates_skipped.inc();
                    }
                }
            } else if sample.cgroup.is_none() && cgroup_rx.is_some() {
                debug!(timestamp, "cgroup stream ended, no estimate for trailing sample");
            }
        }
    }

    Ok(report)
}

/// Parse one scope's chunk, logging and counting per-line failures.
fn parse_scope(
    chunk: Option<Chunk>,
    scope: &'static str,
    report: &mut SessionReport,
    health: &HealthMetrics,
) -> Option<ParsedChunk> {
    let chunk = chunk?;
    let (parsed, errors) = parse_chunk(&chunk.lines);

    for error in &errors {
        warn!(scope, error = %error, "skipping malformed counter line");
    }
    report.parse_errors += errors.len();
    if !errors.is_empty() {
        health.parse_errors.inc_by(errors.len() as f64);
    }

    Some(parsed)
}
