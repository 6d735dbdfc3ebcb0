//! Per-backend worker-state machine and cold-start barrier, per spec §4.1.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::metrics;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub const ALL_STATES: &[&str] = &["stopped", "starting", "running", "stopping"];

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerMode {
    Active,
    Paused,
}

/// Broadcast over the cold-start barrier: either the backend became
/// reachable, or provisioning/warmup failed and the backend reverted to
/// `stopped`. Every waiter gets the same outcome (single-shot broadcast).
#[derive(Clone, Copy, Debug)]
pub enum BarrierOutcome {
    Ready,
    Failed,
}

/// What the caller attempting to begin a cold start should do.
pub enum ColdStartAttempt {
    /// This caller is the sole initiator: it must invoke the provisioning
    /// capability and drive the backend to `running`. Other callers join
    /// the same barrier and wait too.
    Initiate(broadcast::Receiver<BarrierOutcome>),
    /// Another caller already initiated; just wait.
    Join(broadcast::Receiver<BarrierOutcome>),
    /// No wait needed, the backend is already serving.
    AlreadyRunning,
    /// Mid-teardown; the caller should fail fast rather than wait.
    Unavailable,
}

struct Inner {
    state: WorkerState,
    base_url: Option<String>,
    last_request: DateTime<Utc>,
    barrier: Option<broadcast::Sender<BarrierOutcome>>,
}

/// One remote backend's lifecycle, counters, and cold-start barrier.
/// `base_url` is mutable because `remote`'s URL may be resolved
/// dynamically from the fleet rather than fixed at startup (§6).
pub struct Backend {
    pub name: String,
    inner: RwLock<Inner>,
    scaler_mode: RwLock<ScalerMode>,
    requests_total: AtomicU64,
    requests_blocked: AtomicU64,
    cold_starts: AtomicU64,
}

impl Backend {
    pub fn new(name: impl Into<String>, base_url: Option<String>, initially_running: bool) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                state: if initially_running { WorkerState::Running } else { WorkerState::Stopped },
                base_url,
                last_request: Utc::now(),
                barrier: None,
            }),
            scaler_mode: RwLock::new(ScalerMode::Active),
            requests_total: AtomicU64::new(0),
            requests_blocked: AtomicU64::new(0),
            cold_starts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.read().expect("backend lock poisoned").state
    }

    pub fn base_url(&self) -> Option<String> {
        self.inner.read().expect("backend lock poisoned").base_url.clone()
    }

    pub fn set_base_url(&self, url: Option<String>) {
        self.inner.write().expect("backend lock poisoned").base_url = url;
    }

    pub fn scaler_mode(&self) -> ScalerMode {
        *self.scaler_mode.read().expect("scaler lock poisoned")
    }

    pub fn pause(&self) {
        *self.scaler_mode.write().expect("scaler lock poisoned") = ScalerMode::Paused;
    }

    pub fn resume(&self) {
        *self.scaler_mode.write().expect("scaler lock poisoned") = ScalerMode::Active;
    }

    /// Attempts to begin, or join, a cold start. Single-flight: exactly one
    /// caller observes `Initiate` per `stopped -> running` transition
    /// (invariant 5).
    pub fn begin_cold_start(&self) -> ColdStartAttempt {
        let mut inner = self.inner.write().expect("backend lock poisoned");
        match inner.state {
            WorkerState::Running => ColdStartAttempt::AlreadyRunning,
            WorkerState::Starting => {
                let barrier = inner.barrier.as_ref().expect("starting state always carries a barrier");
                ColdStartAttempt::Join(barrier.subscribe())
            }
            WorkerState::Stopped => {
                let (tx, rx) = broadcast::channel(1);
                inner.state = WorkerState::Starting;
                inner.barrier = Some(tx);
                ColdStartAttempt::Initiate(rx)
            }
            WorkerState::Stopping => ColdStartAttempt::Unavailable,
        }
    }

    /// Releases the barrier with `Ready` and transitions to `running`.
    /// `cold_starts` increments at most once per transition.
    pub fn mark_running(&self) {
        let mut inner = self.inner.write().expect("backend lock poisoned");
        if inner.state == WorkerState::Starting {
            inner.state = WorkerState::Running;
            self.cold_starts.fetch_add(1, Ordering::Relaxed);
            metrics::COLD_STARTS.with_label_values(&[&self.name]).inc();
        }
        if let Some(tx) = inner.barrier.take() {
            let _ = tx.send(BarrierOutcome::Ready);
        }
    }

    /// Reverts a failed cold start: releases the barrier with `Failed` and
    /// returns to `stopped` (§7: "provisioning capability fails -> revert
    /// worker-state to previous stable state").
    pub fn fail_cold_start(&self) {
        let mut inner = self.inner.write().expect("backend lock poisoned");
        inner.state = WorkerState::Stopped;
        if let Some(tx) = inner.barrier.take() {
            let _ = tx.send(BarrierOutcome::Failed);
        }
    }

    /// Idle watcher transition: `running -> stopping`. Returns `true` if
    /// the transition happened (caller should now invoke `terminate`).
    pub fn begin_teardown(&self) -> bool {
        let mut inner = self.inner.write().expect("backend lock poisoned");
        if inner.state == WorkerState::Running {
            inner.state = WorkerState::Stopping;
            true
        } else {
            false
        }
    }

    pub fn finish_teardown(&self) {
        self.inner.write().expect("backend lock poisoned").state = WorkerState::Stopped;
    }

    /// Connection-refused-while-running demotion: straight to `stopped`
    /// without the `stopping` intermediate (§4.1's failure semantics), so
    /// the next request re-triggers a fresh cold start.
    pub fn demote_to_stopped(&self) {
        self.inner.write().expect("backend lock poisoned").state = WorkerState::Stopped;
    }

    /// Monotonic bookkeeping: only a strictly-greater timestamp replaces
    /// the current value (§5's ordering guarantee). Health probes must not
    /// call this.
    pub fn touch_last_request(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("backend lock poisoned");
        if at > inner.last_request {
            inner.last_request = at;
        }
    }

    pub fn last_request(&self) -> DateTime<Utc> {
        self.inner.read().expect("backend lock poisoned").last_request
    }

    pub fn idle_seconds(&self) -> i64 {
        (Utc::now() - self.last_request()).num_seconds().max(0)
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_blocked(&self) -> u64 {
        self.requests_blocked.load(Ordering::Relaxed)
    }

    pub fn cold_starts(&self) -> u64 {
        self.cold_starts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_cold_start_is_single_flight() {
        let backend = Backend::new("remote", None, false);
        match backend.begin_cold_start() {
            ColdStartAttempt::Initiate(_) => {}
            _ => panic!("first caller should initiate"),
        }
        match backend.begin_cold_start() {
            ColdStartAttempt::Join(_) => {}
            _ => panic!("second caller should join, not re-initiate"),
        }
        assert_eq!(backend.state(), WorkerState::Starting);
    }

    #[test]
    fn mark_running_increments_cold_starts_once() {
        let backend = Backend::new("remote", None, false);
        let _ = backend.begin_cold_start();
        backend.mark_running();
        backend.mark_running();
        assert_eq!(backend.cold_starts(), 1);
        assert_eq!(backend.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn joined_waiters_observe_ready_broadcast() {
        let backend = Backend::new("remote", None, false);
        let first = backend.begin_cold_start();
        let mut rx = match backend.begin_cold_start() {
            ColdStartAttempt::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        if let ColdStartAttempt::Initiate(_) = first {
            backend.mark_running();
        }
        assert!(matches!(rx.recv().await.unwrap(), BarrierOutcome::Ready));
    }

    #[test]
    fn fail_cold_start_reverts_to_stopped() {
        let backend = Backend::new("remote", None, false);
        let _ = backend.begin_cold_start();
        backend.fail_cold_start();
        assert_eq!(backend.state(), WorkerState::Stopped);
    }

    #[test]
    fn touch_last_request_is_monotone() {
        let backend = Backend::new("remote", None, true);
        let earlier = backend.last_request() - chrono::Duration::seconds(10);
        backend.touch_last_request(earlier);
        assert!(backend.last_request() > earlier);
    }

    #[test]
    fn teardown_requires_running_state() {
        let backend = Backend::new("remote", None, false);
        assert!(!backend.begin_teardown());
        assert_eq!(backend.state(), WorkerState::Stopped);
    }
}
