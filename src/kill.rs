//! Process-tree termination: SIGTERM, bounded wait, SIGKILL.

use crate::config::KillConfig;
use crate::probe::{children_of, pid_exists};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of waiting on a signalled tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Every process in the snapshot is gone.
    Terminated,
    /// The timeout elapsed with at least one process still alive.
    StillAlive,
}

/// How the `kill` command ended up stopping an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
    /// The caller gave up waiting (e.g. Ctrl-C); the tree may still be alive.
    Cancelled,
}

/// A signal that could not be delivered to one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFailure {
    pub pid: i32,
    pub signal: Signal,
    pub errno: Errno,
}

/// Summary of a soft kill attempt.
#[derive(Debug)]
pub struct KillReport {
    pub outcome: KillOutcome,
    pub snapshot: BTreeSet<i32>,
    pub failures: Vec<SignalFailure>,
}

/// The root plus all of its live descendants, snapshotted once.
pub fn process_tree(pid: i32) -> BTreeSet<i32> {
    let mut tree = children_of(pid);
    if pid > 0 {
        tree.insert(pid);
    }
    tree
}

/// Send `signal` to every PID, collecting failures.
///
/// A process that vanished before it could be signalled (ESRCH) already is
/// where we want it, so it is not a failure.
pub fn signal_all(pids: &BTreeSet<i32>, signal: Signal) -> Vec<SignalFailure> {
    let mut failures = Vec::new();
    for &pid in pids {
        if pid <= 0 {
            continue;
        }
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => failures.push(SignalFailure { pid, signal, errno }),
        }
    }
    failures
}

/// Poll until none of `pids` exists or `timeout` elapses.
///
/// Returns `true` when every process is gone.
pub async fn wait_for_exit(pids: &BTreeSet<i32>, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pids.iter().any(|&pid| pid_exists(pid)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// SIGTERM the tree rooted at `pid` and wait up to `timeout` for it to exit.
pub async fn soft_kill(pid: i32, timeout: Duration, interval: Duration) -> KillReport {
    soft_kill_snapshot(process_tree(pid), timeout, interval).await
}

async fn soft_kill_snapshot(
    snapshot: BTreeSet<i32>,
    timeout: Duration,
    interval: Duration,
) -> KillReport {
    tracing::debug!(pids = ?snapshot, "sending SIGTERM to process tree");
    let failures = signal_all(&snapshot, Signal::SIGTERM);
    let outcome = if wait_for_exit(&snapshot, timeout, interval).await {
        KillOutcome::Terminated
    } else {
        KillOutcome::StillAlive
    };
    KillReport {
        outcome,
        snapshot,
        failures,
    }
}

/// SIGKILL a fresh snapshot of the tree rooted at `pid`. Does not wait.
pub fn force_kill(pid: i32) -> Result<(), KillError> {
    force_kill_with(pid, &BTreeSet::new())
}

/// SIGKILL a fresh snapshot plus `known` PIDs from an earlier snapshot.
///
/// Descendants of a root that already exited are reparented and no longer
/// show up under it, so the earlier snapshot is included.
fn force_kill_with(pid: i32, known: &BTreeSet<i32>) -> Result<(), KillError> {
    let mut targets = process_tree(pid);
    targets.extend(known.iter().copied());
    tracing::debug!(pids = ?targets, "sending SIGKILL to process tree");
    let failures = signal_all(&targets, Signal::SIGKILL);
    if failures.is_empty() {
        Ok(())
    } else {
        Err(KillError::Signal { failures })
    }
}

/// Stop the tree rooted at `pid`, escalating to SIGKILL when needed.
///
/// The soft kill carries its own grace timeout; independently, an outer
/// timer bounds how long the caller waits before forcing. Whichever fires
/// first escalates. `cancel` completing abandons the wait immediately.
pub async fn terminate<F>(pid: i32, config: &KillConfig, cancel: F) -> Termination
where
    F: Future<Output = ()>,
{
    let snapshot = process_tree(pid);
    let soft = soft_kill_snapshot(
        snapshot.clone(),
        config.grace_timeout(),
        config.poll_interval(),
    );
    tokio::pin!(soft);
    tokio::pin!(cancel);

    let escalate = tokio::select! {
        biased;
        _ = &mut cancel => {
            tracing::debug!(pid, "kill wait cancelled");
            return Termination::Cancelled;
        }
        report = &mut soft => {
            tracing::debug!(
                pids = report.snapshot.len(),
                outcome = ?report.outcome,
                "soft kill finished"
            );
            if !report.failures.is_empty() {
                tracing::debug!(failures = ?report.failures, "some SIGTERM deliveries failed");
            }
            report.outcome == KillOutcome::StillAlive
        }
        _ = tokio::time::sleep(config.command_timeout()) => {
            tracing::debug!(pid, "kill timer elapsed");
            true
        }
    };

    if !escalate {
        tracing::debug!(pid, "app stopped");
        return Termination::Graceful;
    }

    tracing::debug!(pid, "force killing app");
    if let Err(e) = force_kill_with(pid, &snapshot) {
        tracing::debug!(error = %e, "failed to force kill app");
    }
    Termination::Forced
}

/// Aggregated signal delivery failures.
#[derive(Debug)]
pub enum KillError {
    Signal { failures: Vec<SignalFailure> },
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillError::Signal { failures } => {
                write!(f, "failed to signal {} process(es):", failures.len())?;
                for failure in failures {
                    write!(f, " {} ({}: {})", failure.pid, failure.signal, failure.errno)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for KillError {}
