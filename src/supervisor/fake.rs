//! In-process stand-in for [`OsProcessController`](super::OsProcessController).
//!
//! A "healthy" fake process is just the real health sidecar served on
//! `port + offset` inside the test runtime.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::FoundryError;
use crate::supervisor::process::{
    OutputBuffer, ProcessController, ProcessExit, SpawnRequest, SpawnedProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeBehavior {
    /// Serves a correct health endpoint until terminated.
    Healthy,
    /// Exits with the given code shortly after spawn.
    ExitWith(i32),
    /// Stays alive but never answers health checks.
    Unresponsive,
}

struct FakeProcess {
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    sidecar: CancellationToken,
    suspended: bool,
}

pub(crate) struct FakeController {
    health_offset: u16,
    suspend_supported: bool,
    behavior: Mutex<FakeBehavior>,
    next_pid: AtomicU32,
    procs: Mutex<HashMap<u32, FakeProcess>>,
    calls: Mutex<Vec<String>>,
}

impl FakeController {
    pub fn new(health_offset: u16, behavior: FakeBehavior) -> Self {
        Self {
            health_offset,
            suspend_supported: true,
            behavior: Mutex::new(behavior),
            next_pid: AtomicU32::new(5000),
            procs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn without_suspend(mut self) -> Self {
        self.suspend_supported = false;
        self
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.procs.lock().unwrap().contains_key(&pid)
    }

    pub fn is_suspended(&self, pid: u32) -> bool {
        self.procs
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.suspended)
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self, pid: u32, code: i32) {
        if let Some(proc) = self.procs.lock().unwrap().remove(&pid) {
            proc.sidecar.cancel();
            let _ = proc.exit.send(Some(ProcessExit { code: Some(code) }));
        }
    }

    /// Take the health endpoint down while the process stays alive.
    pub fn silence(&self, pid: u32) {
        if let Some(proc) = self.procs.lock().unwrap().get(&pid) {
            proc.sidecar.cancel();
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ProcessController for FakeController {
    fn spawn(&self, request: SpawnRequest<'_>) -> crate::Result<SpawnedProcess> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.record(format!("spawn:{}:{}", request.target_id, request.port));

        let (tx, rx) = watch::channel(None);
        let exit = Arc::new(tx);
        let sidecar = CancellationToken::new();
        let mut output = OutputBuffer::new(16);
        output.push(format!("fake {} listening on {}", request.target_id, request.port));

        match *self.behavior.lock().unwrap() {
            FakeBehavior::Healthy => {
                let health_port = request.port + self.health_offset;
                let std_listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, health_port))
                    .and_then(|l| l.set_nonblocking(true).map(|()| l))
                    .map_err(|e| FoundryError::ProcessSpawnError(request.target_id.to_string(), e.to_string()))?;
                let listener = TcpListener::from_std(std_listener)
                    .map_err(|e| FoundryError::ProcessSpawnError(request.target_id.to_string(), e.to_string()))?;
                tokio::spawn(crate::sidecar::serve_health_listener(
                    listener,
                    request.target_id.to_string(),
                    sidecar.clone(),
                ));
            }
            FakeBehavior::ExitWith(code) => {
                output.push(format!("fatal: cannot start {}", request.target_id));
                let exit = exit.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = exit.send(Some(ProcessExit { code: Some(code) }));
                });
            }
            FakeBehavior::Unresponsive => {}
        }

        self.procs.lock().unwrap().insert(
            pid,
            FakeProcess {
                exit,
                sidecar,
                suspended: false,
            },
        );

        Ok(SpawnedProcess {
            pid,
            exit: rx,
            output: Arc::new(tokio::sync::Mutex::new(output)),
        })
    }

    fn suspend(&self, pid: u32) -> crate::Result<()> {
        self.record(format!("suspend:{pid}"));
        match self.procs.lock().unwrap().get_mut(&pid) {
            Some(p) => {
                p.suspended = true;
                Ok(())
            }
            None => Err(FoundryError::NotRunning(pid.to_string())),
        }
    }

    fn resume(&self, pid: u32) -> crate::Result<()> {
        self.record(format!("resume:{pid}"));
        match self.procs.lock().unwrap().get_mut(&pid) {
            Some(p) => {
                p.suspended = false;
                Ok(())
            }
            None => Err(FoundryError::NotRunning(pid.to_string())),
        }
    }

    fn terminate(&self, pid: u32, force: bool) -> crate::Result<()> {
        self.record(format!("terminate:{pid}:{force}"));
        if let Some(proc) = self.procs.lock().unwrap().remove(&pid) {
            proc.sidecar.cancel();
            let _ = proc.exit.send(Some(ProcessExit { code: None }));
        }
        Ok(())
    }

    fn supports_suspend(&self) -> bool {
        self.suspend_supported
    }
}
