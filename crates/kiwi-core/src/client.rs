//! Lease client
//!
//! The operator-side half of the protocol. The client claims nodes and
//! rolls back its own failed claims, but it never releases an active lease:
//! that is the enforcement daemon's job, reached through the cancellation
//! signal.

use chrono::{DateTime, Local};
use kiwi_config::{ClusterConfig, Worker};
use kiwi_host_api::{RemoteExecutor, WorkerTarget};
use kiwi_store::{LeaseRecord, LeaseState, NodeDirectory};
use kiwi_util::{LeaseError, NodeName, Result, Username, epoch_seconds};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::lease::{begin_allocation, check_duration, reap_stale_init, rollback_init};

/// What `kill` did to a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The claim was still unconfirmed and was rolled back directly
    RolledBack,
    /// The daemon was asked to end the lease
    Signalled,
}

/// A node and what its record currently says
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node: NodeName,
    /// The record, or why it could not be read
    pub record: std::result::Result<LeaseRecord, String>,
}

pub struct LeaseClient<E> {
    config: ClusterConfig,
    nodes: NodeDirectory,
    executor: E,
}

impl<E: RemoteExecutor> LeaseClient<E> {
    pub fn new(config: ClusterConfig, nodes: NodeDirectory, executor: E) -> Self {
        Self {
            config,
            nodes,
            executor,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn worker(&self, node: &NodeName) -> Result<&Worker> {
        self.config
            .worker(node)
            .ok_or_else(|| LeaseError::UnknownWorker(node.clone()))
    }

    fn target(worker: &Worker) -> WorkerTarget {
        WorkerTarget::new(worker.name.clone(), worker.host.clone(), worker.port)
    }

    /// Lease `node` to `user` for `duration`, starting now
    pub async fn allocate(
        &self,
        node: &NodeName,
        user: &Username,
        duration: Duration,
    ) -> Result<LeaseRecord> {
        self.allocate_at(node, user, duration, kiwi_util::now()).await
    }

    /// Lease `node` to `user` for `duration`, starting at `now`.
    ///
    /// Claims the node, then starts the enforcement daemon on it. If the
    /// daemon cannot be started the claim is rolled back.
    pub async fn allocate_at(
        &self,
        node: &NodeName,
        user: &Username,
        duration: Duration,
        now: DateTime<Local>,
    ) -> Result<LeaseRecord> {
        check_duration(duration)?;

        let worker = self.worker(node)?;
        if !self.config.is_reservable(worker, now, duration) {
            return Err(LeaseError::NotReservable(node.clone()));
        }

        let store = self.nodes.record(node);
        let claimed = begin_allocation(&store, user, duration, epoch_seconds(&now))?;

        if let Err(e) = self
            .executor
            .start_daemon(&Self::target(worker), user, duration)
            .await
        {
            warn!(node = %node, user = %user, error = %e, "Daemon did not start, rolling back");
            if let Err(rollback) = rollback_init(&store, user, Some(claimed.job_id)) {
                error!(node = %node, error = %rollback, "Rollback failed");
            }
            return Err(e.into());
        }

        let record = store.read()?;
        info!(node = %node, user = %user, record = %record, "Node allocated");
        Ok(record)
    }

    /// End `user`'s lease on `node`, whichever phase it is in
    pub async fn kill(&self, node: &NodeName, user: &Username) -> Result<KillOutcome> {
        let worker = self.worker(node)?;
        let store = self.nodes.record(node);
        let record = store.read()?;

        match &record.state {
            LeaseState::Initializing(holder) if holder == user => {
                match rollback_init(&store, user, Some(record.job_id)) {
                    Ok(_) => return Ok(KillOutcome::RolledBack),
                    Err(LeaseError::PreconditionFailed(msg)) => {
                        // Fine if the daemon confirmed in the meantime
                        if store.read()?.state != LeaseState::Active(user.clone()) {
                            return Err(LeaseError::PreconditionFailed(msg));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            LeaseState::Active(holder) if holder == user => {}
            _ => {
                return Err(LeaseError::precondition(format!(
                    "{} does not hold {} (record shows '{}')",
                    user, node, record
                )));
            }
        }

        self.executor
            .signal_daemon(&Self::target(worker), user)
            .await?;
        info!(node = %node, user = %user, "Cancellation requested");
        Ok(KillOutcome::Signalled)
    }

    /// Allocate `node`, open a shell on it, and end the lease when the
    /// shell exits. Returns the shell's exit code.
    pub async fn run(
        &self,
        node: &NodeName,
        user: &Username,
        duration: Duration,
    ) -> Result<Option<i32>> {
        self.allocate(node, user, duration).await?;

        let worker = self.worker(node)?;
        let shell = self.executor.open_shell(&Self::target(worker), user).await;

        match self.kill(node, user).await {
            Ok(_) => {}
            // Expired while the shell was open
            Err(LeaseError::PreconditionFailed(msg)) => {
                info!(node = %node, reason = %msg, "Lease already over")
            }
            Err(e) => warn!(node = %node, error = %e, "Failed to end lease after shell exit"),
        }

        Ok(shell?)
    }

    /// Roll back every claim older than `grace` that no daemon confirmed.
    /// Returns the abandoned claims.
    pub fn reconcile(&self, grace: Duration) -> Result<Vec<(NodeName, LeaseRecord)>> {
        let now = epoch_seconds(&kiwi_util::now());
        let mut reaped = Vec::new();

        for (node, store) in self.nodes.records()? {
            match reap_stale_init(&store, now, grace) {
                Ok(Some(record)) => reaped.push((node, record)),
                Ok(None) => {}
                Err(e) => warn!(node = %node, error = %e, "Skipping node during sweep"),
            }
        }
        Ok(reaped)
    }

    /// Every registered node with its current record
    pub fn list(&self) -> Result<Vec<NodeStatus>> {
        Ok(self
            .nodes
            .records()?
            .into_iter()
            .map(|(node, store)| NodeStatus {
                node,
                record: store.read().map_err(|e| e.to_string()),
            })
            .collect())
    }
}
