use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, ResolvedEvents};
use crate::cgroup::{CgroupWatcher, Transition};
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::session::{self, SessionHandle, SessionSpec};
use crate::sink::jsonl::JsonlSink;

/// Queue bound for watcher transitions awaiting the control loop.
const TRANSITION_QUEUE_DEPTH: usize = 16;

/// The daemon control loop: watches one cgroup and runs at most one
/// sampling session per active period, with guaranteed cleanup.
pub struct Agent {
    cfg: Config,
    resolved: ResolvedEvents,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    control: Option<JoinHandle<()>>,
}

impl Agent {
    /// Create an agent, loading the persisted catalog.
    ///
    /// Fails with `CatalogError::Unavailable` when no catalog exists;
    /// the operator must run `init` first.
    pub fn new(cfg: Config) -> Result<Self> {
        let catalog = Catalog::load(&cfg.catalog.path)?;
        let resolved = catalog.resolve_events(cfg.sampling.detail_level);

        if resolved.system.is_empty() {
            anyhow::bail!(
                "catalog resolves no events at detail level {}",
                cfg.sampling.detail_level,
            );
        }

        info!(
            detail_level = cfg.sampling.detail_level,
            system_events = resolved.system.len(),
            cgroup_events = resolved.cgroup.len(),
            "resolved catalog events",
        );

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            resolved,
            health,
            cancel: CancellationToken::new(),
            control: None,
        })
    }

    /// Start the health server, the cgroup watcher, and the control loop.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let watcher = CgroupWatcher::new(
            Path::new(&self.cfg.cgroup.path),
            self.cfg.cgroup.poll_interval,
        )?;

        let (tx, rx) = mpsc::channel(TRANSITION_QUEUE_DEPTH);
        tokio::spawn(watcher.run(self.cancel.child_token(), tx));

        let spec = SessionSpec {
            cgroup: Some(self.cfg.perf_cgroup_target()),
            interval: self.cfg.sampling.interval,
            duration: self.cfg.sampling.duration,
            perf_bin: self.cfg.sampling.perf_bin.clone(),
        };

        let loop_ctx = ControlContext {
            spec,
            resolved: self.resolved.clone(),
            output_dir: self.cfg.output.directory.clone(),
            health: Arc::clone(&self.health),
        };

        self.control = Some(tokio::spawn(control_loop(
            loop_ctx,
            rx,
            self.cancel.child_token(),
        )));

        info!("agent started");

        Ok(())
    }

    /// Gracefully stop: end the watcher and control loop, which stops
    /// any active session, then shut the health server down.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(control) = self.control.take() {
            control.await.context("joining control loop")?;
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }
}

/// Everything the control loop needs to start sessions.
struct ControlContext {
    spec: SessionSpec,
    resolved: ResolvedEvents,
    output_dir: std::path::PathBuf,
    health: Arc<HealthMetrics>,
}

/// Serializes all session start/stop decisions: the single writer of
/// the "active session" slot.
///
/// Stops are awaited inline, so a `BecamePopulated` arriving while a
/// session is stopping queues in the channel and is re-evaluated once
/// the stop completes; a duplicate arriving while one is running is
/// absorbed.
async fn control_loop(
    ctx: ControlContext,
    mut transitions: mpsc::Receiver<Transition>,
    cancel: CancellationToken,
) {
    let mut active: Option<SessionHandle> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            transition = transitions.recv() => {
                let Some(transition) = transition else { break };

                match transition {
                    Transition::BecamePopulated => {
                        ctx.health.cgroup_populated.set(1.0);

                        if active.is_some() {
                            debug!("session already active, absorbing populate transition");
                            continue;
                        }

                        active = start_session(&ctx);
                    }
                    Transition::BecameEmpty => {
                        ctx.health.cgroup_populated.set(0.0);

                        if let Some(handle) = active.take() {
                            stop_session(handle, &ctx.health).await;
                        }
                    }
                }
            }

            // A session ending on its own (duration elapsed or stream
            // failure) clears the slot so a later transition can retry.
            result = async { active.as_mut().expect("guarded by is_some").join_mut().await },
                if active.is_some() =>
            {
                active = None;
                ctx.health.session_active.set(0.0);

                match result {
                    Ok(Ok(report)) => {
                        ctx.health.sessions_completed.inc();
                        info!(samples = report.samples, "session completed");
                    }
                    Ok(Err(e)) => {
                        ctx.health.sessions_failed.inc();
                        error!(error = %e, "session failed");
                    }
                    Err(e) => {
                        ctx.health.sessions_failed.inc();
                        error!(error = %e, "session task panicked");
                    }
                }
            }
        }
    }

    // Shutdown path: never leave a session or its subprocesses behind.
    if let Some(handle) = active.take() {
        stop_session(handle, &ctx.health).await;
    }
}

/// Start one session; a failure to start is logged and leaves the slot
/// empty so a future transition can retry.
fn start_session(ctx: &ControlContext) -> Option<SessionHandle> {
    let sink = match JsonlSink::create(&ctx.output_dir, Utc::now()) {
        Ok(sink) => {
            info!(path = %sink.path().display(), "session output file created");
            sink
        }
        Err(e) => {
            error!(error = %e, "creating session output sink");
            ctx.health.sessions_failed.inc();
            return None;
        }
    };

    let handle = session::start(
        ctx.spec.clone(),
        ctx.resolved.clone(),
        Box::new(sink),
        Arc::clone(&ctx.health),
        CancellationToken::new(),
    );

    ctx.health.sessions_started.inc();
    ctx.health.session_active.set(1.0);

    Some(handle)
}

/// Request a graceful stop and wait for cleanup to complete.
async fn stop_session(handle: SessionHandle, health: &HealthMetrics) {
    handle.request_stop();

    match handle.join().await {
        Ok(report) => {
            health.sessions_completed.inc();
            info!(samples = report.samples, "session stopped");
        }
        Err(e) => {
            health.sessions_failed.inc();
            warn!(error = %e, "session stopped with error");
        }
    }

    health.session_active.set(0.0);
}
