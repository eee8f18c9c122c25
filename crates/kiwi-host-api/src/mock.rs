//! Mock host implementations for testing

use async_trait::async_trait;
use kiwi_util::Username;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{HostError, HostResult, ProcessReaper, ReapReport, RemoteExecutor, WorkerTarget};

/// A remote call seen by [`MockRemote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Start {
        target: WorkerTarget,
        user: Username,
        duration: Duration,
    },
    Signal {
        target: WorkerTarget,
        user: Username,
    },
    Shell {
        target: WorkerTarget,
        user: Username,
    },
}

type StartHook = Box<dyn Fn(&WorkerTarget, &Username, Duration) -> HostResult<()> + Send + Sync>;

/// Mock remote executor that records calls instead of using SSH
pub struct MockRemote {
    calls: Arc<Mutex<Vec<RemoteCall>>>,

    /// Configure start_daemon to fail
    pub fail_start: Arc<Mutex<bool>>,

    /// Configure signal_daemon to fail
    pub fail_signal: Arc<Mutex<bool>>,

    /// Runs in place of the remote daemon when a start succeeds
    on_start: Mutex<Option<StartHook>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_start: Arc::new(Mutex::new(false)),
            fail_signal: Arc::new(Mutex::new(false)),
            on_start: Mutex::new(None),
        }
    }

    /// Run `hook` for every successful start, e.g. to confirm the lease the
    /// way a real daemon would
    pub fn on_start(
        self,
        hook: impl Fn(&WorkerTarget, &Username, Duration) -> HostResult<()> + Send + Sync + 'static,
    ) -> Self {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn set_fail_start(&self, fail: bool) {
        *self.fail_start.lock().unwrap() = fail;
    }

    pub fn set_fail_signal(&self, fail: bool) {
        *self.fail_signal.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for MockRemote {
    async fn start_daemon(
        &self,
        target: &WorkerTarget,
        user: &Username,
        duration: Duration,
    ) -> HostResult<()> {
        self.record(RemoteCall::Start {
            target: target.clone(),
            user: user.clone(),
            duration,
        });

        if *self.fail_start.lock().unwrap() {
            return Err(HostError::StartFailed {
                node: target.name.clone(),
                reason: "Mock start failure".into(),
            });
        }

        match self.on_start.lock().unwrap().as_ref() {
            Some(hook) => hook(target, user, duration),
            None => Ok(()),
        }
    }

    async fn signal_daemon(&self, target: &WorkerTarget, user: &Username) -> HostResult<()> {
        self.record(RemoteCall::Signal {
            target: target.clone(),
            user: user.clone(),
        });

        if *self.fail_signal.lock().unwrap() {
            return Err(HostError::SignalFailed {
                node: target.name.clone(),
                reason: "Mock signal failure".into(),
            });
        }
        Ok(())
    }

    async fn open_shell(&self, target: &WorkerTarget, user: &Username) -> HostResult<Option<i32>> {
        self.record(RemoteCall::Shell {
            target: target.clone(),
            user: user.clone(),
        });
        Ok(Some(0))
    }
}

/// Mock reaper that counts invocations
#[derive(Debug, Default)]
pub struct MockReaper {
    calls: AtomicUsize,
    reaped: Mutex<Vec<Username>>,
}

impl MockReaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reaped_users(&self) -> Vec<Username> {
        self.reaped.lock().unwrap().clone()
    }
}

impl ProcessReaper for MockReaper {
    fn terminate_user_processes(&self, user: &Username) -> HostResult<ReapReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reaped.lock().unwrap().push(user.clone());
        Ok(ReapReport::default())
    }
}
