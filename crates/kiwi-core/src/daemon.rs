//! Enforcement daemon
//!
//! Runs on the worker for the lifetime of one lease. It confirms the claim,
//! waits out the granted duration while watching the record, and on expiry
//! or cancellation terminates the holder's processes and releases the node.
//!
//! Cancellation arrives as a [`CancellationToken`]; the binary cancels it
//! from its SIGUSR2 listener. Whichever of expiry and cancellation gets
//! there first performs the reclaim, guarded by [`ReclaimLatch`].

use kiwi_host_api::ProcessReaper;
use kiwi_store::{LeaseRecord, PidMarker, RecordStore};
use kiwi_util::{LeaseError, Result, Username};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lease::{confirm_active, release_active};

/// Longest single sleep between record checks
pub const DEFAULT_MAX_STEP: Duration = Duration::from_secs(3600);

/// How a daemon's watch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// Duration elapsed; lease reclaimed
    Expired,
    /// Cancellation signal received; lease reclaimed
    Cancelled,
    /// The record vanished, became unreadable, or moved on. Nothing reclaimed.
    Superseded,
    /// Another path already ran the reclaim
    AlreadyReclaimed,
}

/// Single-use latch: exactly one caller ever wins
#[derive(Debug, Default)]
pub struct ReclaimLatch(AtomicBool);

impl ReclaimLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the first caller only
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The enforcement daemon for one user's lease on one node
pub struct Housekeeper {
    store: RecordStore,
    user: Username,
    duration: Duration,
    reaper: Arc<dyn ProcessReaper>,
    marker: PidMarker,
    max_step: Duration,
    latch: ReclaimLatch,
}

impl Housekeeper {
    pub fn new(
        store: RecordStore,
        user: Username,
        duration: Duration,
        reaper: Arc<dyn ProcessReaper>,
        marker: PidMarker,
    ) -> Self {
        Self {
            store,
            user,
            duration,
            reaper,
            marker,
            max_step: DEFAULT_MAX_STEP,
            latch: ReclaimLatch::new(),
        }
    }

    pub fn with_max_step(mut self, max_step: Duration) -> Self {
        self.max_step = max_step;
        self
    }

    /// Take over the claim: `Initializing(user) → Active(user)`.
    /// Returns the fencing snapshot every later step is checked against.
    pub fn confirm(&self) -> Result<LeaseRecord> {
        confirm_active(&self.store, &self.user)
    }

    /// Register this process as the lease's daemon, wait out the lease,
    /// then reclaim.
    ///
    /// Once the lease is active nothing else will release it, so a marker
    /// that cannot be written only costs `kill` its target; enforcement
    /// carries on and the marker is cleaned up on every way out.
    pub async fn watch(
        &self,
        snapshot: &LeaseRecord,
        cancel: &CancellationToken,
    ) -> Result<DaemonOutcome> {
        let pid = std::process::id();
        let registered = match self.marker.write(pid) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    path = %self.marker.path().display(),
                    error = %e,
                    "Failed to write PID marker, enforcing without one"
                );
                false
            }
        };
        info!(
            user = %self.user,
            pid,
            job_id = snapshot.job_id,
            secs = self.duration.as_secs(),
            "Enforcing lease"
        );

        let outcome = match self.wait(snapshot, cancel).await {
            WaitResult::Expired => {
                info!(user = %self.user, "Lease expired");
                self.reclaim(snapshot, DaemonOutcome::Expired)
            }
            WaitResult::Cancelled => {
                info!(user = %self.user, "Lease cancelled");
                self.reclaim(snapshot, DaemonOutcome::Cancelled)
            }
            WaitResult::Superseded => Ok(DaemonOutcome::Superseded),
        };

        if registered {
            self.remove_marker(pid);
        }
        outcome
    }

    async fn wait(&self, snapshot: &LeaseRecord, cancel: &CancellationToken) -> WaitResult {
        // None: past the end of the monotonic clock, so the lease never expires
        let deadline = Instant::now().checked_add(self.duration);

        loop {
            let step = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return WaitResult::Expired;
                    }
                    remaining.min(self.max_step)
                }
                None => self.max_step,
            };

            tokio::select! {
                _ = cancel.cancelled() => return WaitResult::Cancelled,
                _ = tokio::time::sleep(step) => {}
            }

            if !self.still_current(snapshot) {
                return WaitResult::Superseded;
            }
        }
    }

    /// Whether the record still matches the snapshot. Transient read errors
    /// count as a match so a hiccup on shared storage does not abandon an
    /// enforced lease.
    fn still_current(&self, snapshot: &LeaseRecord) -> bool {
        match self.store.read() {
            Ok(current) if current == *snapshot => true,
            Ok(current) => {
                info!(expected = %snapshot, found = %current, "Record moved on, leaving");
                false
            }
            Err(e) if e.is_vanished_or_malformed() => {
                info!(error = %e, "Record gone or unreadable, leaving");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to check record, continuing");
                true
            }
        }
    }

    /// Terminate the holder's processes and release the node. Only the first
    /// call does anything; later calls return `AlreadyReclaimed`.
    pub fn reclaim(&self, snapshot: &LeaseRecord, outcome: DaemonOutcome) -> Result<DaemonOutcome> {
        if !self.latch.try_claim() {
            debug!(user = %self.user, "Reclaim already done");
            return Ok(DaemonOutcome::AlreadyReclaimed);
        }

        if !self.still_current(snapshot) {
            return Ok(DaemonOutcome::Superseded);
        }

        match self.reaper.terminate_user_processes(&self.user) {
            Ok(report) => {
                for (pid, reason) in &report.failed {
                    warn!(pid, reason = %reason, "Process survived reclaim");
                }
            }
            Err(e) => error!(user = %self.user, error = %e, "Failed to terminate user processes"),
        }

        match release_active(&self.store, snapshot) {
            Ok(_) => Ok(outcome),
            Err(e) if is_superseded(&e) => {
                info!(error = %e, "Lease already resolved elsewhere");
                Ok(DaemonOutcome::Superseded)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_reclaimed(&self) -> bool {
        self.latch.is_claimed()
    }

    fn remove_marker(&self, pid: u32) {
        match self.marker.remove_if_owned(pid) {
            Ok(true) => debug!(path = %self.marker.path().display(), "PID marker removed"),
            Ok(false) => debug!("PID marker belongs to another daemon"),
            Err(e) => warn!(error = %e, "Failed to remove PID marker"),
        }
    }
}

enum WaitResult {
    Expired,
    Cancelled,
    Superseded,
}

fn is_superseded(e: &LeaseError) -> bool {
    matches!(
        e,
        LeaseError::RaceDetected(_) | LeaseError::RecordMissing(_) | LeaseError::ProtocolViolation(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::begin_allocation;
    use kiwi_host_api::MockReaper;
    use kiwi_store::LeaseState;
    use kiwi_util::NodeName;
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
        store: RecordStore,
        reaper: Arc<MockReaper>,
        marker: PidMarker,
    }

    fn claimed(user: &str, secs: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::for_node(dir.path(), &NodeName::new("gpu1"));
        store.initialize().unwrap();
        begin_allocation(&store, &Username::new(user), Duration::from_secs(secs), 1000.0).unwrap();
        let marker = PidMarker::in_dir(dir.path(), &Username::new(user));

        Fixture {
            dir,
            store,
            reaper: Arc::new(MockReaper::new()),
            marker,
        }
    }

    fn housekeeper(f: &Fixture, user: &str, secs: u64) -> Housekeeper {
        Housekeeper::new(
            f.store.clone(),
            Username::new(user),
            Duration::from_secs(secs),
            f.reaper.clone(),
            f.marker.clone(),
        )
    }

    fn contents(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn latch_admits_one_winner() {
        let latch = Arc::new(ReclaimLatch::new());
        let winners: usize = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.try_claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert!(latch.is_claimed());
    }

    #[test]
    fn confirm_rejects_foreign_claim() {
        let f = claimed("alice", 100);
        let hk = housekeeper(&f, "mallory", 100);

        assert!(matches!(hk.confirm(), Err(LeaseError::PreconditionFailed(_))));
        assert_eq!(contents(f.store.path()), "init:alice 1 1000 100");
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reclaims_lease() {
        let f = claimed("alice", 100);
        let hk = housekeeper(&f, "alice", 100).with_max_step(Duration::from_secs(30));
        let snapshot = hk.confirm().unwrap();
        assert_eq!(contents(f.store.path()), "alice 1 1000 100");

        let outcome = hk.watch(&snapshot, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Expired);
        assert_eq!(contents(f.store.path()), "[idle] 1 1000 100");
        assert_eq!(f.reaper.call_count(), 1);
        assert!(!f.marker.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reclaims_lease() {
        let f = claimed("alice", 3600);
        let hk = housekeeper(&f, "alice", 3600);
        let snapshot = hk.confirm().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
            trigger.cancel();
        });

        let outcome = hk.watch(&snapshot, &cancel).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Cancelled);
        assert_eq!(contents(f.store.path()), "[idle] 1 1000 3600");
        assert_eq!(f.reaper.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_duration_waits_for_cancellation() {
        let f = claimed("alice", 100);
        std::fs::write(f.store.path(), format!("init:alice 1 1000 {}", u64::MAX)).unwrap();
        let hk = housekeeper(&f, "alice", u64::MAX).with_max_step(Duration::from_secs(600));
        let snapshot = hk.confirm().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            trigger.cancel();
        });

        let outcome = hk.watch(&snapshot, &cancel).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Cancelled);
        assert_eq!(contents(f.store.path()), format!("[idle] 1 1000 {}", u64::MAX));
        assert_eq!(f.reaper.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_duration_with_pending_cancellation() {
        let f = claimed("alice", 100);
        std::fs::write(f.store.path(), format!("init:alice 1 1000 {}", u64::MAX)).unwrap();
        let hk = housekeeper(&f, "alice", u64::MAX);
        let snapshot = hk.confirm().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(hk.watch(&snapshot, &cancel).await.unwrap(), DaemonOutcome::Cancelled);
        assert!(contents(f.store.path()).starts_with("[idle] 1 1000 "));
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_marker_still_enforces() {
        let f = claimed("alice", 5);
        let marker = PidMarker::in_dir(&f.dir.path().join("missing"), &Username::new("alice"));
        let hk = Housekeeper::new(
            f.store.clone(),
            Username::new("alice"),
            Duration::from_secs(5),
            f.reaper.clone(),
            marker.clone(),
        );
        let snapshot = hk.confirm().unwrap();

        let outcome = hk.watch(&snapshot, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Expired);
        assert_eq!(contents(f.store.path()), "[idle] 1 1000 5");
        assert_eq!(f.reaper.call_count(), 1);
        assert!(!marker.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn marker_removed_after_earlier_reclaim() {
        let f = claimed("alice", 60);
        let hk = housekeeper(&f, "alice", 60);
        let snapshot = hk.confirm().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        hk.reclaim(&snapshot, DaemonOutcome::Cancelled).unwrap();

        let outcome = hk.watch(&snapshot, &cancel).await.unwrap();
        assert_eq!(outcome, DaemonOutcome::AlreadyReclaimed);
        assert!(!f.marker.path().exists());
    }

    #[test]
    fn reclaim_runs_once() {
        let f = claimed("alice", 100);
        let hk = housekeeper(&f, "alice", 100);
        let snapshot = hk.confirm().unwrap();

        assert_eq!(
            hk.reclaim(&snapshot, DaemonOutcome::Cancelled).unwrap(),
            DaemonOutcome::Cancelled
        );
        assert_eq!(
            hk.reclaim(&snapshot, DaemonOutcome::Expired).unwrap(),
            DaemonOutcome::AlreadyReclaimed
        );
        assert!(hk.is_reclaimed());
        assert_eq!(f.reaper.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_record_ends_watch_quietly() {
        let f = claimed("alice", 7200);
        let hk = housekeeper(&f, "alice", 7200).with_max_step(Duration::from_secs(60));
        let snapshot = hk.confirm().unwrap();
        std::fs::remove_file(f.store.path()).unwrap();

        let outcome = hk.watch(&snapshot, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Superseded);
        assert_eq!(f.reaper.call_count(), 0);
        assert!(!f.marker.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_record_is_left_alone() {
        let f = claimed("alice", 7200);
        let hk = housekeeper(&f, "alice", 7200).with_max_step(Duration::from_secs(60));
        let snapshot = hk.confirm().unwrap();

        // Someone hand-edited the node over to bob
        std::fs::write(f.store.path(), "bob 9 5000 60").unwrap();

        let outcome = hk.watch(&snapshot, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, DaemonOutcome::Superseded);
        assert_eq!(contents(f.store.path()), "bob 9 5000 60");
        assert_eq!(f.reaper.call_count(), 0);
    }

    #[test]
    fn stale_snapshot_reclaims_nothing() {
        let f = claimed("alice", 100);
        let hk = housekeeper(&f, "alice", 100);
        let snapshot = hk.confirm().unwrap();
        let moved_on = snapshot.with_state(LeaseState::Idle);
        std::fs::write(f.store.path(), moved_on.encode()).unwrap();

        let outcome = hk.reclaim(&snapshot, DaemonOutcome::Expired).unwrap();

        assert_eq!(outcome, DaemonOutcome::Superseded);
        assert_eq!(f.reaper.call_count(), 0);
        assert_eq!(f.store.read().unwrap(), moved_on);
    }
}
