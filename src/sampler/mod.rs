pub mod parse;

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound on buffered chunks per scope before the reader backpressures.
pub const CHUNK_QUEUE_DEPTH: usize = 64;

/// How long to wait after SIGTERM before forcibly killing perf.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Counting scope for one measurement stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Whole-machine counters.
    System,
    /// Counters attributed to one cgroup (perf `-G` target).
    Cgroup(String),
}

impl Scope {
    /// Label used in logs and error contexts.
    pub fn label(&self) -> &'static str {
        match self {
            Scope::System => "system",
            Scope::Cgroup(_) => "cgroup",
        }
    }
}

/// The raw lines of one sampling interval for one scope.
///
/// A full chunk holds exactly one line per requested event; a trailing
/// chunk may be shorter when the stream ended mid-interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub lines: Vec<String>,
}

/// Wraps one long-lived `perf stat -I` subprocess and exposes its
/// interval output as a sequence of [`Chunk`]s over a bounded channel.
pub struct PerfSampler {
    perf_bin: String,
    scope: Scope,
    events: Vec<String>,
    interval: Duration,
    duration: Duration,
}

impl PerfSampler {
    pub fn new(
        perf_bin: impl Into<String>,
        scope: Scope,
        events: Vec<String>,
        interval: Duration,
        duration: Duration,
    ) -> Self {
        Self {
            perf_bin: perf_bin.into(),
            scope,
            events,
            interval,
            duration,
        }
    }

    /// Number of lines that make up one full chunk.
    pub fn chunk_size(&self) -> usize {
        self.events.len()
    }

    /// Build the perf invocation for this scope.
    ///
    /// Counter lines go to stderr in interval mode; the `sleep` child
    /// bounds the session duration.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.perf_bin);
        cmd.arg("stat")
            .arg("-I")
            .arg(self.interval.as_millis().to_string())
            .arg("-e")
            .arg(self.events.join(","))
            .arg("-a");

        if let Scope::Cgroup(target) = &self.scope {
            cmd.arg("-G").arg(target);
        }

        cmd.arg("--")
            .arg("sleep")
            .arg(self.duration.as_secs_f64().to_string());

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    /// Spawn the subprocess and its reader task.
    ///
    /// Chunks are delivered on `tx`; the channel closes when the stream
    /// ends or the token is cancelled. The child is reaped on every exit
    /// path before the task finishes.
    pub fn spawn(
        &self,
        cancel: CancellationToken,
        tx: mpsc::Sender<Chunk>,
    ) -> Result<JoinHandle<()>> {
        let scope = self.scope.label();
        let chunk_size = self.chunk_size();

        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("spawning {} for {scope} scope", self.perf_bin))?;

        let stderr = child
            .stderr
            .take()
            .context("perf child has no stderr pipe")?;

        debug!(scope, pid = child.id(), events = self.events.len(), "perf sampler spawned");

        Ok(tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            read_chunks(reader, chunk_size, cancel, tx, scope).await;
            terminate(&mut child, scope).await;
        }))
    }
}

/// Group non-comment, non-blank lines into chunks of `chunk_size` and
/// deliver them on `tx`. A partial trailing chunk is still delivered so
/// callers never block waiting for an interval that will not complete.
pub async fn read_chunks<R>(
    reader: R,
    chunk_size: usize,
    cancel: CancellationToken,
    tx: mpsc::Sender<Chunk>,
    scope: &'static str,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut buf: Vec<String> = Vec::with_capacity(chunk_size);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(scope, "sampler cancelled");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() || trimmed.starts_with('#') {
                            continue;
                        }

                        buf.push(line);

                        if buf.len() == chunk_size {
                            let chunk = Chunk { lines: std::mem::take(&mut buf) };
                            if tx.send(chunk).await.is_err() {
                                // Consumer is gone; stop reading.
                                break;
                            }
                            buf.reserve(chunk_size);
                        }
                    }
                    Ok(None) => {
                        debug!(scope, "perf stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(scope, error = %e, "error reading perf stream");
                        break;
                    }
                }
            }
        }
    }

    if !buf.is_empty() {
        debug!(scope, lines = buf.len(), "delivering partial trailing chunk");
        let _ = tx.send(Chunk { lines: buf }).await;
    }
}

/// Terminate the perf child: SIGTERM, a short grace period, then kill.
async fn terminate(child: &mut Child, scope: &'static str) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(scope, %status, "perf child already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(scope, error = %e, "checking perf child status");
        }
    }

    if let Some(pid) = child.id() {
        // Safety: pid is a live child of this process.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(scope, %status, "perf child terminated");
        }
        Ok(Err(e)) => {
            warn!(scope, error = %e, "waiting for perf child");
        }
        Err(_) => {
            warn!(scope, "perf child unresponsive after grace period, killing");
            if let Err(e) = child.kill().await {
                warn!(scope, error = %e, "killing perf child");
            }
        }
    }
}
