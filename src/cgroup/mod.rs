use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from starting a cgroup watch.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cgroup not found: {path}")]
    CgroupNotFound { path: PathBuf },
}

/// Population state of the watched cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupState {
    Empty,
    Populated,
}

/// Boundary-crossing transitions of the cgroup population.
///
/// Intermediate count changes that stay on one side of zero emit
/// nothing; only crossings matter to the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecamePopulated,
    BecameEmpty,
}

/// Watches one cgroup's process-membership file and emits population
/// transitions. The watcher never starts or stops sampling itself.
#[derive(Debug)]
pub struct CgroupWatcher {
    procs_path: PathBuf,
    poll_interval: Duration,
    state: CgroupState,
    pid_count: usize,
}

impl CgroupWatcher {
    /// Start watching the given cgroup directory.
    ///
    /// The initial state comes from an eager read of `cgroup.procs`.
    /// A missing cgroup is fatal; a transiently unreadable membership
    /// file is treated as empty and re-read on the next poll.
    pub fn new(cgroup_path: &Path, poll_interval: Duration) -> Result<Self, WatchError> {
        if !cgroup_path.is_dir() {
            return Err(WatchError::CgroupNotFound {
                path: cgroup_path.to_path_buf(),
            });
        }

        let procs_path = cgroup_path.join("cgroup.procs");
        let pid_count = count_pids(&procs_path).unwrap_or(0);
        let state = if pid_count > 0 {
            CgroupState::Populated
        } else {
            CgroupState::Empty
        };

        info!(
            cgroup = %cgroup_path.display(),
            pids = pid_count,
            ?state,
            "watching cgroup",
        );

        Ok(Self {
            procs_path,
            poll_interval,
            state,
            pid_count,
        })
    }

    pub fn state(&self) -> CgroupState {
        self.state
    }

    pub fn pid_count(&self) -> usize {
        self.pid_count
    }

    /// Run the watch loop until cancelled, emitting transitions on `tx`.
    ///
    /// If the cgroup is already populated at start, `BecamePopulated` is
    /// emitted immediately so an in-flight workload gets a session.
    pub async fn run(mut self, cancel: CancellationToken, tx: mpsc::Sender<Transition>) {
        if self.state == CgroupState::Populated
            && tx.send(Transition::BecamePopulated).await.is_err()
        {
            return;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cgroup watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let count = match count_pids(&self.procs_path) {
                        Ok(count) => count,
                        Err(e) => {
                            // Transient unreadability: no change, retry
                            // on the next tick.
                            warn!(error = %e, "membership file unreadable, retrying");
                            continue;
                        }
                    };

                    let (state, transition) = apply_count(self.state, count);
                    self.state = state;
                    self.pid_count = count;

                    if let Some(transition) = transition {
                        info!(pids = count, ?transition, "cgroup population changed");
                        if tx.send(transition).await.is_err() {
                            // Lifecycle manager is gone.
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Fold one observed membership count into the state machine.
///
/// Emits `BecamePopulated` on a 0 -> n crossing and `BecameEmpty` on an
/// n -> 0 crossing; anything else is a silent count update.
pub fn apply_count(state: CgroupState, count: usize) -> (CgroupState, Option<Transition>) {
    match (state, count) {
        (CgroupState::Empty, n) if n > 0 => {
            (CgroupState::Populated, Some(Transition::BecamePopulated))
        }
        (CgroupState::Populated, 0) => (CgroupState::Empty, Some(Transition::BecameEmpty)),
        (state, _) => (state, None),
    }
}

/// Count non-blank entries in a membership file.
fn count_pids(procs_path: &Path) -> io::Result<usize> {
    let content = std::fs::read_to_string(procs_path)?;
    Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a count sequence through the state machine, collecting
    /// emitted transitions.
    fn run_counts(initial: CgroupState, counts: &[usize]) -> Vec<Transition> {
        let mut state = initial;
        let mut transitions = Vec::new();

        for &count in counts {
            let (next, transition) = apply_count(state, count);
            state = next;
            transitions.extend(transition);
        }

        transitions
    }

    #[test]
    fn test_transition_sequence_only_boundary_crossings() {
        let transitions = run_counts(CgroupState::Empty, &[0, 1, 3, 2, 0, 0, 5]);
        assert_eq!(
            transitions,
            vec![
                Transition::BecamePopulated,
                Transition::BecameEmpty,
                Transition::BecamePopulated,
            ],
        );
    }

    #[test]
    fn test_repeated_zero_counts_emit_nothing() {
        assert!(run_counts(CgroupState::Empty, &[0, 0, 0]).is_empty());
    }

    #[test]
    fn test_count_changes_within_populated_emit_nothing() {
        assert!(run_counts(CgroupState::Populated, &[2, 5, 1]).is_empty());
    }

    #[test]
    fn test_new_fails_on_missing_cgroup() {
        let err = CgroupWatcher::new(Path::new("/nonexistent/cgroup"), Duration::from_millis(100))
            .expect_err("should fail");
        assert!(matches!(err, WatchError::CgroupNotFound { .. }));
    }

    #[test]
    fn test_new_reads_initial_population() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.procs"), "1234\n5678\n").expect("write");

        let watcher =
            CgroupWatcher::new(dir.path(), Duration::from_millis(100)).expect("watcher");
        assert_eq!(watcher.state(), CgroupState::Populated);
        assert_eq!(watcher.pid_count(), 2);
    }

    #[test]
    fn test_new_treats_missing_procs_file_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");

        let watcher =
            CgroupWatcher::new(dir.path(), Duration::from_millis(100)).expect("watcher");
        assert_eq!(watcher.state(), CgroupState::Empty);
        assert_eq!(watcher.pid_count(), 0);
    }

    #[tokio::test]
    async fn test_run_emits_transitions_on_membership_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").expect("write");

        let watcher = CgroupWatcher::new(dir.path(), Duration::from_millis(20)).expect("watcher");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(watcher.run(cancel.clone(), tx));

        std::fs::write(&procs, "4242\n").expect("write");
        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no timeout")
            .expect("transition");
        assert_eq!(transition, Transition::BecamePopulated);

        std::fs::write(&procs, "").expect("write");
        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no timeout")
            .expect("transition");
        assert_eq!(transition, Transition::BecameEmpty);

        cancel.cancel();
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn test_run_emits_initial_populated() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("cgroup.procs"), "77\n").expect("write");

        let watcher = CgroupWatcher::new(dir.path(), Duration::from_millis(20)).expect("watcher");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(watcher.run(cancel.clone(), tx));

        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no timeout")
            .expect("transition");
        assert_eq!(transition, Transition::BecamePopulated);

        cancel.cancel();
        handle.await.expect("join");
    }
}
