//! Lease state machine
//!
//! Every transition re-reads the record under the exclusive lock and checks
//! its precondition there; an unlocked read is only ever an early exit.
//!
//! ```text
//!   Idle ──allocate──▶ Initializing(u) ──confirm──▶ Active(u)
//!    ▲                      │                          │
//!    └────────rollback──────┘                          │
//!    └─────────────────────release (snapshot match)────┘
//! ```

use kiwi_store::{LeaseRecord, LeaseState, RecordStore};
use kiwi_util::{LeaseError, Result, Username};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default age after which an unconfirmed claim is considered abandoned
pub const DEFAULT_STALE_INIT_GRACE: Duration = Duration::from_secs(600);

/// Reject durations a daemon cannot wait out: zero, or too long for the
/// monotonic clock to represent.
pub fn check_duration(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(LeaseError::precondition("Lease duration must be positive"));
    }
    if Instant::now().checked_add(duration).is_none() {
        return Err(LeaseError::precondition(format!(
            "Lease duration of {}s is too long",
            duration.as_secs()
        )));
    }
    Ok(())
}

/// `Idle → Initializing(user)`: claim a node for `duration` starting at
/// `start` (epoch seconds). Returns the claimed record.
pub fn begin_allocation(
    store: &RecordStore,
    user: &Username,
    duration: Duration,
    start: f64,
) -> Result<LeaseRecord> {
    check_duration(duration)?;

    // Cheap rejection without queueing on the lock
    let observed = store.read()?;
    if !observed.state.is_idle() {
        return Err(not_idle(&observed));
    }

    store.with_lock(|rec| {
        let current = rec.read()?;
        if !current.state.is_idle() {
            return Err(not_idle(&current));
        }

        let claimed = LeaseRecord {
            state: LeaseState::Initializing(user.clone()),
            job_id: current.job_id + 1,
            start,
            duration: duration.as_secs(),
        };
        rec.write(&claimed)?;

        info!(user = %user, job_id = claimed.job_id, secs = claimed.duration, "Node claimed");
        Ok(claimed)
    })
}

/// `Initializing(user) → Active(user)`: the daemon takes over the lease.
/// The returned record is the daemon's fencing snapshot.
pub fn confirm_active(store: &RecordStore, user: &Username) -> Result<LeaseRecord> {
    store.with_lock(|rec| {
        let current = rec.read()?;
        if current.state != LeaseState::Initializing(user.clone()) {
            return Err(LeaseError::precondition(format!(
                "Cannot confirm lease for {}: record shows '{}'",
                user, current
            )));
        }

        let active = current.with_state(LeaseState::Active(user.clone()));
        rec.write(&active)?;

        info!(user = %user, job_id = active.job_id, "Lease confirmed");
        Ok(active)
    })
}

/// `Initializing(user) → Idle`: undo a claim whose daemon never confirmed.
///
/// With `expected_job` set the rollback only applies to that allocation, so
/// a client cannot undo a later claim by the same user.
pub fn rollback_init(
    store: &RecordStore,
    user: &Username,
    expected_job: Option<u64>,
) -> Result<LeaseRecord> {
    store.with_lock(|rec| {
        let current = rec.read()?;
        let job_matches = expected_job.is_none_or(|job| job == current.job_id);
        if current.state != LeaseState::Initializing(user.clone()) || !job_matches {
            return Err(LeaseError::precondition(format!(
                "Cannot roll back claim of {}: record shows '{}'",
                user, current
            )));
        }

        let idle = current.with_state(LeaseState::Idle);
        rec.write(&idle)?;

        info!(user = %user, job_id = idle.job_id, "Claim rolled back");
        Ok(idle)
    })
}

/// `Active(user) → Idle`: release the lease described by `snapshot`.
///
/// Fails with `RaceDetected`, writing nothing, if the record no longer
/// matches the snapshot in every field.
pub fn release_active(store: &RecordStore, snapshot: &LeaseRecord) -> Result<LeaseRecord> {
    if !matches!(snapshot.state, LeaseState::Active(_)) {
        return Err(LeaseError::precondition(format!(
            "Only an active lease can be released, not '{}'",
            snapshot
        )));
    }

    store.with_lock(|rec| {
        let current = rec.read()?;
        if current != *snapshot {
            return Err(LeaseError::race(format!(
                "expected '{}', found '{}'",
                snapshot, current
            )));
        }

        let idle = current.with_state(LeaseState::Idle);
        rec.write(&idle)?;

        info!(job_id = idle.job_id, "Lease released");
        Ok(idle)
    })
}

/// `Initializing → Idle` for claims older than `grace` at `now` (epoch
/// seconds). Returns the abandoned claim if one was rolled back.
///
/// Confirmed leases are never touched, and a daemon that tries to confirm
/// after the sweep fails its precondition.
pub fn reap_stale_init(
    store: &RecordStore,
    now: f64,
    grace: Duration,
) -> Result<Option<LeaseRecord>> {
    let is_stale =
        |r: &LeaseRecord| matches!(r.state, LeaseState::Initializing(_)) && now - r.start >= grace.as_secs_f64();

    if !is_stale(&store.read()?) {
        return Ok(None);
    }

    store.with_lock(|rec| {
        let current = rec.read()?;
        if !is_stale(&current) {
            debug!(record = %current, "Claim resolved before sweep");
            return Ok(None);
        }

        rec.write(&current.with_state(LeaseState::Idle))?;
        info!(record = %current, "Abandoned claim rolled back");
        Ok(Some(current))
    })
}

fn not_idle(record: &LeaseRecord) -> LeaseError {
    match record.state.holder() {
        Some(holder) => LeaseError::precondition(format!(
            "The node is not idle (held by {} since job {})",
            holder, record.job_id
        )),
        None => LeaseError::precondition("The node is not idle"),
    }
}
