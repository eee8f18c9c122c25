//! End-to-end lease scenarios against a temporary shared directory
//!
//! The remote side is played by `MockRemote`; where a real daemon would
//! confirm the lease, the tests drive a `Housekeeper` directly.

use kiwi_config::{ClusterConfig, RawConfig, RawWorker};
use kiwi_core::{
    AdmitReason, Decision, DaemonOutcome, GateEnv, Housekeeper, KillOutcome, LeaseClient,
    begin_allocation, check_login, confirm_active, init_master, register_node,
};
use kiwi_host_api::{HostError, MockReaper, MockRemote, RemoteCall};
use kiwi_store::{LeaseRecord, LeaseState, NodeDirectory, PidMarker, RecordStore};
use kiwi_util::{LeaseError, NodeName, Result, Username, config_path, fail_safe_path};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Cluster {
    dir: tempfile::TempDir,
    config: ClusterConfig,
}

impl Cluster {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawConfig::empty();
        raw.workers.insert(
            "gpu1".into(),
            RawWorker {
                host: "10.0.0.11".into(),
                port: 22,
                reservation: None,
                label: None,
            },
        );
        kiwi_config::save_config(config_path(dir.path()), &raw).unwrap();
        let config = kiwi_config::load_config(config_path(dir.path())).unwrap();

        let nodes = NodeDirectory::new(dir.path());
        nodes.record(&gpu1()).initialize().unwrap();

        Self { dir, config }
    }

    fn shared(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self) -> RecordStore {
        RecordStore::for_node(self.shared(), &gpu1())
    }

    fn record(&self) -> String {
        std::fs::read_to_string(self.store().path()).unwrap()
    }

    fn client(&self, remote: MockRemote) -> LeaseClient<MockRemote> {
        LeaseClient::new(self.config.clone(), NodeDirectory::new(self.shared()), remote)
    }

    fn housekeeper(&self, user: &str, secs: u64, reaper: Arc<MockReaper>) -> Housekeeper {
        Housekeeper::new(
            self.store(),
            Username::new(user),
            Duration::from_secs(secs),
            reaper,
            PidMarker::in_dir(self.shared(), &Username::new(user)),
        )
    }
}

fn gpu1() -> NodeName {
    NodeName::new("gpu1")
}

/// Replace the start time, which depends on the clock, with `<ts>`
fn masked(record: &str) -> String {
    let mut fields: Vec<&str> = record.split_whitespace().collect();
    fields[2] = "<ts>";
    fields.join(" ")
}

#[tokio::test(start_paused = true)]
async fn alice_full_lifecycle() {
    let cluster = Cluster::new();
    assert_eq!(cluster.record(), "[idle] 0 0 0");

    let client = cluster.client(MockRemote::new());
    let alice = Username::new("alice");
    client.allocate(&gpu1(), &alice, Duration::from_secs(100)).await.unwrap();
    assert_eq!(masked(&cluster.record()), "init:alice 1 <ts> 100");

    let reaper = Arc::new(MockReaper::new());
    let hk = cluster.housekeeper("alice", 100, reaper.clone());
    let snapshot = hk.confirm().unwrap();
    assert_eq!(masked(&cluster.record()), "alice 1 <ts> 100");

    let outcome = hk.watch(&snapshot, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, DaemonOutcome::Expired);
    assert_eq!(masked(&cluster.record()), "[idle] 1 <ts> 100");
    assert_eq!(reaper.reaped_users(), vec![alice]);
}

#[tokio::test]
async fn bob_cannot_take_alices_node() {
    let cluster = Cluster::new();
    std::fs::write(cluster.store().path(), "alice 1 1700000000 100").unwrap();

    let client = cluster.client(MockRemote::new());
    let err = client
        .allocate(&gpu1(), &Username::new("bob"), Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::PreconditionFailed(_)));
    assert_eq!(cluster.record(), "alice 1 1700000000 100");
    assert!(client.executor().calls().is_empty());
}

#[tokio::test]
async fn carol_rolls_back_when_daemon_fails_to_start() {
    let cluster = Cluster::new();
    std::fs::write(cluster.store().path(), "[idle] 1 1700000000 100").unwrap();

    let remote = MockRemote::new();
    remote.set_fail_start(true);
    let client = cluster.client(remote);

    let err = client
        .allocate(&gpu1(), &Username::new("carol"), Duration::from_secs(50))
        .await
        .unwrap_err();

    assert!(matches!(err, LeaseError::RemoteActionFailed(_)));
    assert_eq!(masked(&cluster.record()), "[idle] 2 <ts> 50");
}

#[tokio::test]
async fn confirmed_allocation_and_kill() {
    let cluster = Cluster::new();
    let store = cluster.store();
    let remote = MockRemote::new().on_start(move |_, user, _| {
        confirm_active(&store, user)
            .map(|_| ())
            .map_err(|e| HostError::Internal(e.to_string()))
    });
    let client = cluster.client(remote);
    let alice = Username::new("alice");

    let record = client.allocate(&gpu1(), &alice, Duration::from_secs(600)).await.unwrap();
    assert_eq!(record.state, LeaseState::Active(alice.clone()));

    // Only the daemon may release an active lease
    let outcome = client.kill(&gpu1(), &alice).await.unwrap();
    assert_eq!(outcome, KillOutcome::Signalled);
    assert_eq!(cluster.store().read().unwrap(), record);
    assert!(matches!(
        client.executor().calls().last(),
        Some(RemoteCall::Signal { user, .. }) if user == &alice
    ));
}

#[tokio::test]
async fn signal_failure_is_reported() {
    let cluster = Cluster::new();
    std::fs::write(cluster.store().path(), "alice 1 1700000000 100").unwrap();
    let remote = MockRemote::new();
    remote.set_fail_signal(true);
    let client = cluster.client(remote);

    let err = client.kill(&gpu1(), &Username::new("alice")).await.unwrap_err();
    assert!(matches!(err, LeaseError::RemoteActionFailed(_)));
    assert_eq!(cluster.record(), "alice 1 1700000000 100");
}

#[tokio::test]
async fn reconcile_clears_abandoned_claims() {
    let cluster = Cluster::new();
    // A client died long ago between claiming and starting the daemon
    std::fs::write(cluster.store().path(), "init:erin 4 1000 60").unwrap();

    let client = cluster.client(MockRemote::new());
    let reaped = client.reconcile(Duration::from_secs(600)).unwrap();

    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0, gpu1());
    assert_eq!(cluster.record(), "[idle] 4 1000 60");
}

#[test]
fn concurrent_allocations_have_one_winner() {
    let cluster = Cluster::new();
    let users = ["alice", "bob", "carol", "dave", "erin", "frank"];
    let barrier = Arc::new(Barrier::new(users.len()));

    let results: Vec<Result<LeaseRecord>> = users
        .iter()
        .map(|user| {
            let store = cluster.store();
            let barrier = barrier.clone();
            let user = Username::new(*user);
            std::thread::spawn(move || {
                barrier.wait();
                begin_allocation(&store, &user, Duration::from_secs(60), 1000.0)
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let winners: Vec<&LeaseRecord> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LeaseError::PreconditionFailed(_)))
    );
    assert_eq!(cluster.store().read().unwrap(), *winners[0]);
    assert_eq!(winners[0].job_id, 1);
}

#[test]
fn concurrent_confirm_and_rollback_are_exclusive() {
    for _ in 0..20 {
        let cluster = Cluster::new();
        let alice = Username::new("alice");
        begin_allocation(&cluster.store(), &alice, Duration::from_secs(60), 1000.0).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let confirm = {
            let (store, alice, barrier) = (cluster.store(), alice.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                confirm_active(&store, &alice).is_ok()
            })
        };
        let rollback = {
            let (store, alice, barrier) = (cluster.store(), alice.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                kiwi_core::rollback_init(&store, &alice, Some(1)).is_ok()
            })
        };

        let confirmed = confirm.join().unwrap();
        let rolled_back = rollback.join().unwrap();
        assert!(confirmed != rolled_back);

        let expected = if confirmed { LeaseState::Active(alice) } else { LeaseState::Idle };
        assert_eq!(cluster.store().read().unwrap().state, expected);
    }
}

struct PamEnv {
    shared: PathBuf,
    user: &'static str,
}

impl GateEnv for PamEnv {
    fn hostname(&self) -> Result<NodeName> {
        Ok(gpu1())
    }

    fn login_identity(&self) -> Result<Username> {
        Ok(Username::new(self.user))
    }

    fn shared_path(&self) -> Result<PathBuf> {
        Ok(self.shared.clone())
    }
}

#[test]
fn dave_is_kept_out_of_alices_node() {
    let cluster = Cluster::new();
    std::fs::write(fail_safe_path(cluster.shared()), "").unwrap();
    std::fs::write(cluster.store().path(), "alice 1 1700000000 100").unwrap();

    let dave = PamEnv {
        shared: cluster.shared().to_path_buf(),
        user: "dave",
    };
    assert!(matches!(check_login(&dave), Decision::Deny { .. }));

    let alice = PamEnv {
        shared: cluster.shared().to_path_buf(),
        user: "alice",
    };
    assert_eq!(check_login(&alice), Decision::Admit(AdmitReason::Holder));

    // With the configuration unreadable the gate fails open
    std::fs::write(config_path(cluster.shared()), "not toml at all [").unwrap();
    assert!(matches!(check_login(&dave), Decision::Admit(AdmitReason::FailOpen(_))));
}

#[test]
fn freshly_initialized_cluster_gates_logins() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("shared");
    init_master(&shared).unwrap();
    register_node(
        &shared,
        &gpu1(),
        RawWorker {
            host: "10.0.0.11".into(),
            port: 22,
            reservation: None,
            label: None,
        },
    )
    .unwrap();

    let dave = PamEnv {
        shared: shared.clone(),
        user: "dave",
    };
    assert!(matches!(check_login(&dave), Decision::Deny { .. }));

    let store = RecordStore::for_node(&shared, &gpu1());
    let alice = Username::new("alice");
    begin_allocation(&store, &alice, Duration::from_secs(60), 1000.0).unwrap();
    confirm_active(&store, &alice).unwrap();

    assert!(matches!(check_login(&dave), Decision::Deny { .. }));
    let alice = PamEnv {
        shared,
        user: "alice",
    };
    assert_eq!(check_login(&alice), Decision::Admit(AdmitReason::Holder));
}
