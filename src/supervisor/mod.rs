//! The process supervisor: owns the registry of live hosted processes and
//! drives each target through its lifecycle.
//!
//! ```text
//! inactive -> generating -> starting -> running <-> paused -> stopped
//!                                 \         \          \
//!                                  +---------+----------+--> error
//! ```
//!
//! Lifecycle calls are serialized per target id. The in-memory registry is
//! the source of truth for what is actually alive; the durable record is
//! brought in line with it on every transition and by [`ProcessSupervisor::reconcile`].

#[cfg(test)]
pub(crate) mod fake;
pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};

use crate::config::HostingConfig;
use crate::error::FoundryError;
use crate::generator::STARTUP_SCRIPT;
use crate::health::HealthChecker;
use crate::port::PortAllocator;
use crate::store::{HostedTargetRecord, HostingStatus, StatusStore, update_record};
use crate::supervisor::process::{
    OutputBuffer, ProcessController, ProcessExit, SpawnRequest, wait_for_exit,
};

/// Output lines quoted in the error message of a failed start.
const FAILURE_OUTPUT_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub health_offset: u16,
    /// Wait between spawn and the first health check.
    pub settle_delay: Duration,
    /// How long a SIGTERM'd process gets before SIGKILL.
    pub stop_timeout: Duration,
    /// Pause between stop and start on restart.
    pub restart_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(hosting: &HostingConfig) -> Self {
        Self {
            health_offset: hosting.health_port_offset,
            settle_delay: hosting.settle_delay(),
            stop_timeout: hosting.stop_timeout(),
            restart_grace: hosting.restart_grace(),
        }
    }
}

/// A live hosted process. Never persisted.
struct ProcessHandle {
    pid: u32,
    port: u16,
    directory: PathBuf,
    started_at: DateTime<Utc>,
    last_health_check: Option<DateTime<Utc>>,
    paused: bool,
    paused_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
    output: Arc<Mutex<OutputBuffer>>,
}

/// Read projection of a live process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub target_id: String,
    pub pid: u32,
    pub port: u16,
    pub health_port: u16,
    pub url: String,
    pub directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub consecutive_health_failures: u32,
    pub recent_output: Vec<String>,
}

/// A target the health monitor should check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub target_id: String,
    pub pid: u32,
    pub health_port: u16,
}

fn local_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

struct Inner {
    handles: RwLock<HashMap<String, ProcessHandle>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ports: Arc<PortAllocator>,
    store: Arc<dyn StatusStore>,
    controller: Arc<dyn ProcessController>,
    checker: HealthChecker,
    settings: SupervisorSettings,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        ports: Arc<PortAllocator>,
        store: Arc<dyn StatusStore>,
        controller: Arc<dyn ProcessController>,
        checker: HealthChecker,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                handles: RwLock::new(HashMap::new()),
                locks: std::sync::Mutex::new(HashMap::new()),
                ports,
                store,
                controller,
                checker,
                settings,
            }),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.inner.store
    }

    /// The per-target lifecycle lock.
    pub(crate) fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Drop the lifecycle lock of `id` once nobody holds or waits on it.
    fn forget_lock(&self, id: &str) {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub async fn start(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id, None).await
    }

    /// Start on a port the caller already reserved from this supervisor's
    /// allocator. The port is released on any failure.
    pub async fn start_on(&self, id: &str, port: u16) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id, Some(port)).await
    }

    pub async fn stop(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    pub async fn restart(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        self.server_directory(id).await?;
        if self.is_live(id).await {
            self.stop_locked(id).await?;
            tokio::time::sleep(self.inner.settings.restart_grace).await;
        }
        self.start_locked(id, None).await
    }

    pub async fn pause(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (pid, paused) = self
            .inner
            .handles
            .read()
            .await
            .get(id)
            .map(|h| (h.pid, h.paused))
            .ok_or_else(|| FoundryError::NotRunning(id.to_string()))?;
        if paused {
            return Err(FoundryError::AlreadyPaused(id.to_string()));
        }

        if !self.inner.controller.supports_suspend() {
            tracing::info!(target = %id, pid, "suspend unsupported, stopping instead of pausing");
            self.stop_locked(id).await?;
            return update_record(self.inner.store.as_ref(), id, |r| {
                r.status = HostingStatus::Paused;
            });
        }

        self.inner
            .controller
            .suspend(pid)
            .map_err(|e| signal_error(id, e))?;
        let now = Utc::now();
        if let Some(handle) = self.inner.handles.write().await.get_mut(id) {
            handle.paused = true;
            handle.paused_at = Some(now);
        }
        tracing::info!(target = %id, pid, "target paused");
        update_record(self.inner.store.as_ref(), id, |r| {
            r.status = HostingStatus::Paused;
        })
    }

    pub async fn unpause(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let state = self
            .inner
            .handles
            .read()
            .await
            .get(id)
            .map(|h| (h.pid, h.paused));
        match state {
            Some((_, false)) => Err(FoundryError::NotPaused(id.to_string())),
            Some((pid, true)) => {
                self.inner
                    .controller
                    .resume(pid)
                    .map_err(|e| signal_error(id, e))?;
                let now = Utc::now();
                if let Some(handle) = self.inner.handles.write().await.get_mut(id) {
                    handle.paused = false;
                    handle.paused_at = None;
                    handle.last_health_check = Some(now);
                }
                tracing::info!(target = %id, pid, "target resumed");
                update_record(self.inner.store.as_ref(), id, |r| {
                    r.status = HostingStatus::Running;
                    r.last_health_check = Some(now);
                })
            }
            None => {
                // Paused by the stop fallback: resuming means starting again.
                let paused_record = self
                    .inner
                    .store
                    .load(id)?
                    .is_some_and(|r| r.status == HostingStatus::Paused);
                if !paused_record {
                    return Err(FoundryError::NotPaused(id.to_string()));
                }
                self.start_locked(id, None).await
            }
        }
    }

    /// Kill any live process, release its port, and delete the target's
    /// directory. Directory removal is best effort.
    pub async fn cleanup(&self, id: &str) -> crate::Result<()> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.cleanup_locked(id).await
        };
        drop(lock);
        self.forget_lock(id);
        result
    }

    async fn cleanup_locked(&self, id: &str) -> crate::Result<()> {
        let handle = self.inner.handles.write().await.remove(id);
        if let Some(handle) = handle {
            if handle.paused {
                let _ = self.inner.controller.resume(handle.pid);
            }
            if let Err(e) = self.inner.controller.terminate(handle.pid, true) {
                tracing::warn!(target = %id, pid = handle.pid, error = %e, "failed to kill process during cleanup");
            }
            let _ = tokio::time::timeout(
                self.inner.settings.stop_timeout,
                wait_for_exit(handle.exit.clone()),
            )
            .await;
            self.inner.ports.release(handle.port);
        }

        let directory = self
            .inner
            .store
            .load(id)?
            .and_then(|r| r.server_directory);
        if let Some(dir) = directory {
            remove_dir_best_effort(id, &dir).await;
        }
        tracing::info!(target = %id, "target cleaned up");
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Option<ProcessStatus> {
        let handles = self.inner.handles.read().await;
        let handle = handles.get(id)?;
        Some(self.project(id, handle).await)
    }

    /// Every live process, sorted by target id.
    pub async fn get_all(&self) -> Vec<ProcessStatus> {
        let handles = self.inner.handles.read().await;
        let mut ids: Vec<&String> = handles.keys().collect();
        ids.sort();
        let mut all = Vec::with_capacity(ids.len());
        for id in ids {
            all.push(self.project(id, &handles[id]).await);
        }
        all
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.inner.handles.read().await.contains_key(id)
    }

    pub async fn health_targets(&self) -> Vec<HealthTarget> {
        let offset = self.inner.settings.health_offset;
        let mut targets: Vec<HealthTarget> = self
            .inner
            .handles
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.paused)
            .map(|(id, h)| HealthTarget {
                target_id: id.clone(),
                pid: h.pid,
                health_port: h.port.saturating_add(offset),
            })
            .collect();
        targets.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        targets
    }

    /// Record a monitor check result. Ignored if the handle is gone or was replaced.
    pub async fn record_health(&self, id: &str, pid: u32, healthy: bool) {
        let mut handles = self.inner.handles.write().await;
        let Some(handle) = handles.get_mut(id).filter(|h| h.pid == pid) else {
            return;
        };
        if healthy {
            handle.last_health_check = Some(Utc::now());
            handle.consecutive_failures = 0;
        } else {
            handle.consecutive_failures += 1;
        }
    }

    /// Bring durable records in line with the (empty or partial) registry:
    /// anything claiming a process that is not live becomes `stopped`.
    /// Returns the ids that were corrected.
    pub async fn reconcile(&self) -> crate::Result<Vec<String>> {
        let handles = self.inner.handles.read().await;
        let mut corrected = Vec::new();
        for (id, mut record) in self.inner.store.list()? {
            if record.status.claims_process() && !handles.contains_key(&id) {
                tracing::info!(target = %id, status = %record.status, "no live process, marking stopped");
                record.mark_stopped();
                self.inner.store.save(&id, &record)?;
                corrected.push(id);
            }
        }
        Ok(corrected)
    }

    /// Stop every live process. Used on host shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.handles.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(target = %id, error = %e, "failed to stop target on shutdown");
            }
        }
    }

    async fn project(&self, id: &str, handle: &ProcessHandle) -> ProcessStatus {
        ProcessStatus {
            target_id: id.to_string(),
            pid: handle.pid,
            port: handle.port,
            health_port: handle.port.saturating_add(self.inner.settings.health_offset),
            url: local_url(handle.port),
            directory: handle.directory.clone(),
            started_at: handle.started_at,
            last_health_check: handle.last_health_check,
            paused: handle.paused,
            paused_at: handle.paused_at,
            consecutive_health_failures: handle.consecutive_failures,
            recent_output: handle.output.lock().await.tail(FAILURE_OUTPUT_LINES),
        }
    }

    /// The generated directory of a target, if it has a startup script.
    async fn server_directory(&self, id: &str) -> crate::Result<PathBuf> {
        let directory = self
            .inner
            .store
            .load(id)?
            .and_then(|r| r.server_directory)
            .ok_or_else(|| FoundryError::ServerNotFound(id.to_string()))?;
        if !tokio::fs::try_exists(directory.join(STARTUP_SCRIPT))
            .await
            .unwrap_or(false)
        {
            return Err(FoundryError::ServerNotFound(id.to_string()));
        }
        Ok(directory)
    }

    async fn start_locked(
        &self,
        id: &str,
        reserved_port: Option<u16>,
    ) -> crate::Result<HostedTargetRecord> {
        let release_reserved = || {
            if let Some(port) = reserved_port {
                self.inner.ports.release(port);
            }
        };

        if self.is_live(id).await {
            release_reserved();
            return Err(FoundryError::AlreadyRunning(id.to_string()));
        }
        let directory = match self.server_directory(id).await {
            Ok(dir) => dir,
            Err(e) => {
                release_reserved();
                return Err(e);
            }
        };

        let port = match reserved_port {
            Some(port) => port,
            None => match self.inner.ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    self.persist_error(id, &e.to_string());
                    return Err(e);
                }
            },
        };

        if let Err(e) = update_record(self.inner.store.as_ref(), id, |r| {
            r.status = HostingStatus::Starting;
            r.port = Some(port);
            r.url = None;
            r.pid = None;
            r.error_message = None;
        }) {
            self.inner.ports.release(port);
            return Err(e);
        }
        tracing::info!(target = %id, port, "starting target");

        let script = directory.join(STARTUP_SCRIPT);
        let spawned = match self.inner.controller.spawn(SpawnRequest {
            target_id: id,
            script: &script,
            port,
            directory: &directory,
        }) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(target = %id, port, error = %e, "failed to spawn startup script");
                self.inner.ports.release(port);
                self.persist_error(id, &e.to_string());
                return Err(e);
            }
        };
        let pid = spawned.pid;
        let exit = spawned.exit.clone();
        let output = spawned.output.clone();

        self.inner.handles.write().await.insert(
            id.to_string(),
            ProcessHandle {
                pid,
                port,
                directory: directory.clone(),
                started_at: Utc::now(),
                last_health_check: None,
                paused: false,
                paused_at: None,
                consecutive_failures: 0,
                exit: spawned.exit,
                output: spawned.output,
            },
        );
        self.watch_exit(id.to_string(), pid, port, exit.clone());

        let early_exit = tokio::select! {
            _ = tokio::time::sleep(self.inner.settings.settle_delay) => None,
            exit = wait_for_exit(exit.clone()) => Some(exit),
        };
        let health_port = port.saturating_add(self.inner.settings.health_offset);
        let health = match early_exit {
            Some(exit) => Err(format!("{} before becoming healthy", exit.describe())),
            None => self
                .inner
                .checker
                .check(health_port, id)
                .await
                .map_err(|e| match e {
                    FoundryError::HealthCheckFailed(_, reason) => reason,
                    other => other.to_string(),
                }),
        };

        if let Err(reason) = health {
            let mut message = reason;
            if early_exit.is_none() {
                if let Some(exit) = *exit.borrow() {
                    message = format!("{}; {}", exit.describe(), message);
                }
            }
            let tail = output.lock().await.tail(FAILURE_OUTPUT_LINES);
            if !tail.is_empty() {
                message = format!("{}; last output: {}", message, tail.join(" | "));
            }
            tracing::warn!(target = %id, pid, port, reason = %message, "target failed to become healthy");

            self.abort_start(id, pid, port).await;
            self.persist_error(id, &message);
            return Err(FoundryError::HealthCheckFailed(id.to_string(), message));
        }

        let now = Utc::now();
        if let Some(handle) = self.inner.handles.write().await.get_mut(id) {
            handle.last_health_check = Some(now);
        }
        let record = update_record(self.inner.store.as_ref(), id, |r| {
            r.status = HostingStatus::Running;
            r.port = Some(port);
            r.url = Some(local_url(port));
            r.pid = Some(pid);
            r.server_directory = Some(directory.clone());
            r.hosted_at = Some(now);
            r.last_health_check = Some(now);
            r.error_message = None;
        })?;
        tracing::info!(target = %id, pid, port, "target running");
        Ok(record)
    }

    /// Undo a start whose health check failed. Caller holds the target lock.
    async fn abort_start(&self, id: &str, pid: u32, port: u16) {
        let removed = {
            let mut handles = self.inner.handles.write().await;
            match handles.get(id) {
                Some(h) if h.pid == pid => handles.remove(id),
                _ => None,
            }
        };
        if let Err(e) = self.inner.controller.terminate(pid, true) {
            tracing::warn!(target = %id, pid, error = %e, "failed to kill unhealthy process");
        }
        if let Some(handle) = removed {
            let _ = tokio::time::timeout(
                self.inner.settings.stop_timeout,
                wait_for_exit(handle.exit),
            )
            .await;
        }
        self.inner.ports.release(port);
    }

    async fn stop_locked(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        let handle = self.inner.handles.write().await.remove(id);
        let Some(handle) = handle else {
            let mut record = self
                .inner
                .store
                .load(id)?
                .ok_or_else(|| FoundryError::ServerNotFound(id.to_string()))?;
            record.mark_stopped();
            self.inner.store.save(id, &record)?;
            tracing::debug!(target = %id, "no live process, record normalized to stopped");
            return Ok(record);
        };

        self.terminate_gracefully(id, &handle).await;
        self.inner.ports.release(handle.port);
        let record = update_record(self.inner.store.as_ref(), id, |r| r.mark_stopped())?;
        tracing::info!(target = %id, pid = handle.pid, port = handle.port, "target stopped");
        Ok(record)
    }

    /// SIGTERM, wait up to `stop_timeout`, then SIGKILL the whole group.
    async fn terminate_gracefully(&self, id: &str, handle: &ProcessHandle) {
        let controller = &self.inner.controller;
        let pid = handle.pid;
        if handle.paused {
            if let Err(e) = controller.resume(pid) {
                tracing::warn!(target = %id, pid, error = %e, "failed to resume paused process before stop");
            }
        }
        if let Err(e) = controller.terminate(pid, false) {
            tracing::warn!(target = %id, pid, error = %e, "failed to send SIGTERM");
        }

        let timeout = self.inner.settings.stop_timeout;
        let exited = tokio::time::timeout(timeout, wait_for_exit(handle.exit.clone()))
            .await
            .is_ok();
        if !exited {
            tracing::warn!(target = %id, pid, timeout_secs = timeout.as_secs(), "process ignored SIGTERM, killing");
        }
        // Background members of the group, such as the health sidecar, may
        // outlive the leader.
        if let Err(e) = controller.terminate(pid, true) {
            tracing::warn!(target = %id, pid, error = %e, "failed to send SIGKILL");
        }
        if !exited {
            let _ = tokio::time::timeout(timeout, wait_for_exit(handle.exit.clone())).await;
        }
    }

    /// Watch for the process ending on its own.
    fn watch_exit(
        &self,
        id: String,
        pid: u32,
        port: u16,
        exit: watch::Receiver<Option<ProcessExit>>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let exit = wait_for_exit(exit).await;
            supervisor.handle_exit(&id, pid, port, exit).await;
        });
    }

    async fn handle_exit(&self, id: &str, pid: u32, port: u16, exit: ProcessExit) {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;
            self.handle_exit_locked(id, pid, port, exit).await;
        }
        drop(lock);
        self.forget_lock(id);
    }

    async fn handle_exit_locked(&self, id: &str, pid: u32, port: u16, exit: ProcessExit) {
        {
            let mut handles = self.inner.handles.write().await;
            match handles.get(id) {
                Some(h) if h.pid == pid => {
                    handles.remove(id);
                }
                // Stopped on purpose, or already replaced by a newer start.
                _ => return,
            }
        }

        tracing::warn!(target = %id, pid, port, code = ?exit.code, "hosted process exited unexpectedly");
        if let Err(e) = self.inner.controller.terminate(pid, true) {
            tracing::debug!(target = %id, pid, error = %e, "group cleanup after exit failed");
        }
        self.inner.ports.release(port);
        let result = update_record(self.inner.store.as_ref(), id, |r| {
            if exit.code == Some(0) {
                r.mark_stopped();
            } else {
                r.mark_error(exit.describe());
            }
        });
        if let Err(e) = result {
            tracing::error!(target = %id, error = %e, "failed to persist process exit");
        }
    }

    /// Persist `error`, logging rather than masking the original failure.
    fn persist_error(&self, id: &str, message: &str) {
        if let Err(e) = update_record(self.inner.store.as_ref(), id, |r| r.mark_error(message)) {
            tracing::error!(target = %id, error = %e, "failed to persist error status");
        }
    }
}

fn signal_error(id: &str, err: FoundryError) -> FoundryError {
    match err {
        FoundryError::NotRunning(_) => FoundryError::NotRunning(id.to_string()),
        FoundryError::SignalFailed(_, reason) => FoundryError::SignalFailed(id.to_string(), reason),
        other => other,
    }
}

pub(crate) async fn remove_dir_best_effort(id: &str, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::info!(target = %id, path = %dir.display(), "target directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(target = %id, path = %dir.display(), error = %e, "failed to remove target directory")
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStatusStore;
    use crate::supervisor::fake::{FakeBehavior, FakeController};
    use tempfile::TempDir;

    pub(crate) const OFFSET: u16 = 1000;

    pub(crate) fn test_settings() -> SupervisorSettings {
        SupervisorSettings {
            health_offset: OFFSET,
            settle_delay: Duration::from_millis(30),
            stop_timeout: Duration::from_secs(1),
            restart_grace: Duration::from_millis(10),
        }
    }

    pub(crate) struct Harness {
        pub supervisor: ProcessSupervisor,
        pub controller: Arc<FakeController>,
        pub store: Arc<MemoryStatusStore>,
        pub root: TempDir,
    }

    impl Harness {
        /// `from` picks a private port region so parallel tests never collide.
        pub fn new(from: u16, controller: FakeController) -> Self {
            let controller = Arc::new(controller);
            let store = Arc::new(MemoryStatusStore::new());
            let supervisor = ProcessSupervisor::new(
                Arc::new(PortAllocator::new(from, from + 9, OFFSET)),
                store.clone(),
                controller.clone(),
                HealthChecker::new(Duration::from_secs(1)).unwrap(),
                test_settings(),
            );
            Self {
                supervisor,
                controller,
                store,
                root: tempfile::tempdir().unwrap(),
            }
        }

        /// Lay down a generated target and its record.
        pub fn generated(&self, id: &str) -> PathBuf {
            let dir = self.root.path().join(id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(STARTUP_SCRIPT), "#!/bin/sh\n").unwrap();
            self.store
                .save(
                    id,
                    &HostedTargetRecord {
                        status: HostingStatus::Inactive,
                        server_directory: Some(dir.clone()),
                        ..Default::default()
                    },
                )
                .unwrap();
            dir
        }

        pub fn record(&self, id: &str) -> HostedTargetRecord {
            self.store.load(id).unwrap().unwrap()
        }
    }

    fn healthy(from: u16) -> Harness {
        Harness::new(from, FakeController::new(OFFSET, FakeBehavior::Healthy))
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_runs_and_populates_record() {
        let h = healthy(40000);
        h.generated("widgets");

        let record = h.supervisor.start("widgets").await.unwrap();
        assert_eq!(record.status, HostingStatus::Running);
        let port = record.port.unwrap();
        assert!((40000..=40009).contains(&port));
        assert_eq!(record.url.as_deref(), Some(local_url(port).as_str()));
        assert!(record.pid.is_some());
        assert!(record.hosted_at.is_some());
        assert!(record.error_message.is_none());

        let status = h.supervisor.get_status("widgets").await.unwrap();
        assert_eq!(status.port, port);
        assert_eq!(status.health_port, port + OFFSET);
        assert!(status.last_health_check.is_some());
        assert!(h.supervisor.ports().is_reserved(port));

        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let h = healthy(40020);
        h.generated("widgets");
        h.supervisor.start("widgets").await.unwrap();
        let result = h.supervisor.start("widgets").await;
        assert!(matches!(result, Err(FoundryError::AlreadyRunning(_))));
        assert_eq!(h.supervisor.ports().reserved().len(), 1);
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_generated_server() {
        let h = healthy(40040);
        assert!(matches!(
            h.supervisor.start("ghost").await,
            Err(FoundryError::ServerNotFound(_))
        ));
        h.store.save("ghost", &HostedTargetRecord::default()).unwrap();
        assert!(matches!(
            h.supervisor.start("ghost").await,
            Err(FoundryError::ServerNotFound(_))
        ));
        assert!(h.supervisor.ports().reserved().is_empty());
    }

    #[tokio::test]
    async fn test_start_port_exhaustion() {
        let h = healthy(40060);
        h.generated("widgets");
        for port in 40060..=40069 {
            assert!(h.supervisor.ports().reserve(port));
        }
        let result = h.supervisor.start("widgets").await;
        assert!(matches!(result, Err(FoundryError::PortExhaustion(40060, 40069))));
        assert!(h.controller.calls().is_empty());
        assert_eq!(h.record("widgets").status, HostingStatus::Error);
    }

    #[tokio::test]
    async fn test_unhealthy_start_resolves_to_error() {
        let h = Harness::new(40080, FakeController::new(OFFSET, FakeBehavior::Unresponsive));
        h.generated("widgets");

        let result = h.supervisor.start("widgets").await;
        assert!(matches!(result, Err(FoundryError::HealthCheckFailed(ref id, _)) if id == "widgets"));

        let record = h.record("widgets");
        assert_eq!(record.status, HostingStatus::Error);
        assert!(record.error_message.is_some());
        assert!(record.port.is_none() && record.pid.is_none());
        assert!(h.supervisor.get_status("widgets").await.is_none());
        assert!(h.supervisor.ports().reserved().is_empty());
        assert!(h.controller.calls().iter().any(|c| c.ends_with(":true")));
    }

    #[tokio::test]
    async fn test_early_exit_then_clean_restart() {
        let h = Harness::new(40100, FakeController::new(OFFSET, FakeBehavior::ExitWith(1)));
        h.generated("widgets");

        let result = h.supervisor.start("widgets").await;
        assert!(matches!(result, Err(FoundryError::HealthCheckFailed(..))));
        let record = h.record("widgets");
        assert_eq!(record.status, HostingStatus::Error);
        let message = record.error_message.unwrap();
        assert!(message.contains("code 1"), "message: {message}");
        assert!(message.contains("fatal: cannot start widgets"), "message: {message}");
        assert!(h.supervisor.ports().reserved().is_empty());

        h.controller.set_behavior(FakeBehavior::Healthy);
        let record = h.supervisor.start("widgets").await.unwrap();
        assert_eq!(record.status, HostingStatus::Running);
        assert!(record.error_message.is_none());
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_after_running() {
        let h = healthy(40120);
        h.generated("widgets");
        let record = h.supervisor.start("widgets").await.unwrap();
        let pid = record.pid.unwrap();
        let port = record.port.unwrap();

        h.controller.crash(pid, 1);
        let store = h.store.clone();
        wait_until(|| store.load("widgets").unwrap().unwrap().status == HostingStatus::Error).await;

        let record = h.record("widgets");
        assert_eq!(record.error_message.as_deref(), Some("process exited with code 1"));
        assert!(record.port.is_none());
        assert!(!h.supervisor.ports().is_reserved(port));
        assert!(h.supervisor.get_status("widgets").await.is_none());
    }

    #[tokio::test]
    async fn test_clean_exit_marks_stopped() {
        let h = healthy(40140);
        h.generated("widgets");
        let pid = h.supervisor.start("widgets").await.unwrap().pid.unwrap();

        h.controller.crash(pid, 0);
        let store = h.store.clone();
        wait_until(|| store.load("widgets").unwrap().unwrap().status == HostingStatus::Stopped).await;
        assert!(h.record("widgets").error_message.is_none());
    }

    #[tokio::test]
    async fn test_stop_releases_everything() {
        let h = healthy(40160);
        h.generated("widgets");
        let record = h.supervisor.start("widgets").await.unwrap();
        let pid = record.pid.unwrap();

        let stopped = h.supervisor.stop("widgets").await.unwrap();
        assert_eq!(stopped.status, HostingStatus::Stopped);
        assert!(stopped.port.is_none() && stopped.url.is_none() && stopped.pid.is_none());
        assert!(!h.controller.is_alive(pid));
        assert!(h.supervisor.ports().reserved().is_empty());

        // The exit watcher must not overwrite the intentional stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.record("widgets").status, HostingStatus::Stopped);
        assert!(h.controller.calls().contains(&format!("terminate:{pid}:false")));
    }

    #[tokio::test]
    async fn test_stop_without_handle_normalizes_record() {
        let h = healthy(40180);
        let dir = h.generated("widgets");
        h.store
            .save(
                "widgets",
                &HostedTargetRecord {
                    status: HostingStatus::Running,
                    port: Some(40181),
                    url: Some(local_url(40181)),
                    pid: Some(99999),
                    server_directory: Some(dir),
                    ..Default::default()
                },
            )
            .unwrap();

        for _ in 0..2 {
            let record = h.supervisor.stop("widgets").await.unwrap();
            assert_eq!(record.status, HostingStatus::Stopped);
            assert!(record.port.is_none() && record.url.is_none() && record.pid.is_none());
        }
        assert!(h.controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pause_unpause_keeps_port_and_pid() {
        let h = healthy(40200);
        h.generated("widgets");
        let started = h.supervisor.start("widgets").await.unwrap();
        let pid = started.pid.unwrap();

        let paused = h.supervisor.pause("widgets").await.unwrap();
        assert_eq!(paused.status, HostingStatus::Paused);
        assert!(h.controller.is_suspended(pid));
        let status = h.supervisor.get_status("widgets").await.unwrap();
        assert!(status.paused && status.paused_at.is_some());
        assert!(h.supervisor.health_targets().await.is_empty());

        assert!(matches!(
            h.supervisor.pause("widgets").await,
            Err(FoundryError::AlreadyPaused(_))
        ));

        let resumed = h.supervisor.unpause("widgets").await.unwrap();
        assert_eq!(resumed.status, HostingStatus::Running);
        assert_eq!(resumed.port, started.port);
        assert_eq!(resumed.pid, started.pid);
        assert!(!h.controller.is_suspended(pid));
        assert!(matches!(
            h.supervisor.unpause("widgets").await,
            Err(FoundryError::NotPaused(_))
        ));

        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_requires_live_handle() {
        let h = healthy(40220);
        h.generated("widgets");
        assert!(matches!(
            h.supervisor.pause("widgets").await,
            Err(FoundryError::NotRunning(_))
        ));
        assert!(matches!(
            h.supervisor.unpause("widgets").await,
            Err(FoundryError::NotPaused(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_resumes_paused_process_first() {
        let h = healthy(40240);
        h.generated("widgets");
        let pid = h.supervisor.start("widgets").await.unwrap().pid.unwrap();
        h.supervisor.pause("widgets").await.unwrap();
        h.supervisor.stop("widgets").await.unwrap();

        let calls = h.controller.calls();
        let resume = calls.iter().position(|c| c == &format!("resume:{pid}")).unwrap();
        let term = calls.iter().position(|c| c == &format!("terminate:{pid}:false")).unwrap();
        assert!(resume < term);
    }

    #[tokio::test]
    async fn test_pause_fallback_without_suspend() {
        let h = Harness::new(
            40260,
            FakeController::new(OFFSET, FakeBehavior::Healthy).without_suspend(),
        );
        h.generated("widgets");
        let first = h.supervisor.start("widgets").await.unwrap();

        let paused = h.supervisor.pause("widgets").await.unwrap();
        assert_eq!(paused.status, HostingStatus::Paused);
        assert!(h.supervisor.get_status("widgets").await.is_none());
        assert!(h.supervisor.ports().reserved().is_empty());

        let resumed = h.supervisor.unpause("widgets").await.unwrap();
        assert_eq!(resumed.status, HostingStatus::Running);
        assert_ne!(resumed.pid, first.pid);
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let h = healthy(40280);
        h.generated("widgets");
        let first = h.supervisor.start("widgets").await.unwrap();
        let second = h.supervisor.restart("widgets").await.unwrap();
        assert_eq!(second.status, HostingStatus::Running);
        assert_ne!(first.pid, second.pid);
        assert!(!h.controller.is_alive(first.pid.unwrap()));
        assert_eq!(h.supervisor.ports().reserved().len(), 1);
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_unknown_target() {
        let h = healthy(40300);
        assert!(matches!(
            h.supervisor.restart("ghost").await,
            Err(FoundryError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_from_stopped_starts() {
        let h = healthy(40320);
        h.generated("widgets");
        let record = h.supervisor.restart("widgets").await.unwrap();
        assert_eq!(record.status, HostingStatus::Running);
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_handle_directory_and_port() {
        let h = healthy(40340);
        let dir = h.generated("widgets");
        let pid = h.supervisor.start("widgets").await.unwrap().pid.unwrap();

        h.supervisor.cleanup("widgets").await.unwrap();
        assert!(h.supervisor.get_status("widgets").await.is_none());
        assert!(!dir.exists());
        assert!(!h.controller.is_alive(pid));
        assert!(h.supervisor.ports().reserved().is_empty());
        assert!(h.controller.calls().contains(&format!("terminate:{pid}:true")));
        // The exit watcher may still be draining; it drops the lock entry too.
        for _ in 0..100 {
            if h.supervisor.lock_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.supervisor.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_normalizes_stale_records() {
        let h = healthy(40360);
        for (id, status) in [
            ("a", HostingStatus::Running),
            ("b", HostingStatus::Paused),
            ("c", HostingStatus::Starting),
            ("d", HostingStatus::Error),
            ("e", HostingStatus::Stopped),
        ] {
            h.store
                .save(id, &HostedTargetRecord { status, port: Some(40361), ..Default::default() })
                .unwrap();
        }
        let corrected = h.supervisor.reconcile().await.unwrap();
        assert_eq!(corrected, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(h.record("a").status, HostingStatus::Stopped);
        assert!(h.record("a").port.is_none());
        assert_eq!(h.record("d").status, HostingStatus::Error);
    }

    #[tokio::test]
    async fn test_record_health_counts_failures() {
        let h = healthy(40380);
        h.generated("widgets");
        let pid = h.supervisor.start("widgets").await.unwrap().pid.unwrap();

        h.supervisor.record_health("widgets", pid, false).await;
        h.supervisor.record_health("widgets", pid, false).await;
        h.supervisor.record_health("widgets", pid + 1, false).await;
        assert_eq!(
            h.supervisor.get_status("widgets").await.unwrap().consecutive_health_failures,
            2
        );
        h.supervisor.record_health("widgets", pid, true).await;
        assert_eq!(
            h.supervisor.get_status("widgets").await.unwrap().consecutive_health_failures,
            0
        );
        // Durable status is untouched by health results.
        assert_eq!(h.record("widgets").status, HostingStatus::Running);
        h.supervisor.stop("widgets").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_get_unique_ports() {
        let h = healthy(40400);
        let ids = ["t0", "t1", "t2", "t3", "t4"];
        for id in ids {
            h.generated(id);
        }
        let starts = ids.iter().map(|id| h.supervisor.start(id));
        let records = futures::future::join_all(starts).await;

        let mut ports: Vec<u16> = records
            .into_iter()
            .map(|r| r.unwrap().port.unwrap())
            .collect();
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), ids.len());
        assert!(ports.iter().all(|p| (40400..=40409).contains(p)));

        let all = h.supervisor.get_all().await;
        assert_eq!(all.len(), ids.len());
        assert_eq!(all[0].target_id, "t0");
        h.supervisor.stop_all().await;
        assert!(h.supervisor.get_all().await.is_empty());
    }

    /// Sidecar stand-in for the startup-script tests. The stand-in script
    /// re-runs this test binary filtered to this test with the health port
    /// in the environment; in a normal run it returns at once.
    #[test]
    fn test_sidecar_entrypoint() {
        let (Ok(port), Ok(target)) = (
            std::env::var("FOUNDRY_TEST_SIDECAR_PORT"),
            std::env::var("FOUNDRY_TEST_SIDECAR_TARGET"),
        ) else {
            return;
        };
        let port: u16 = port.parse().unwrap();
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(crate::sidecar::serve_health(
                port,
                target,
                tokio_util::sync::CancellationToken::new(),
            ))
            .unwrap();
    }

    #[cfg(unix)]
    mod startup_script {
        use super::*;
        use crate::generator::script::render_startup_script;
        use crate::supervisor::process::OsProcessController;
        use std::os::unix::fs::PermissionsExt;

        struct ScriptHarness {
            supervisor: ProcessSupervisor,
            store: Arc<MemoryStatusStore>,
            root: TempDir,
            sidecar: PathBuf,
        }

        impl ScriptHarness {
            fn new(from: u16) -> Self {
                let root = tempfile::tempdir().unwrap();
                let exe = std::env::current_exe().unwrap();
                let sidecar = root.path().join("sidecar.sh");
                // Invoked as: sidecar.sh health-sidecar --port P --target-id ID
                std::fs::write(
                    &sidecar,
                    format!(
                        "#!/bin/sh\nFOUNDRY_TEST_SIDECAR_PORT=\"$3\" FOUNDRY_TEST_SIDECAR_TARGET=\"$5\" \\\n  exec '{}' --exact supervisor::tests::test_sidecar_entrypoint --test-threads=1\n",
                        exe.display()
                    ),
                )
                .unwrap();
                make_executable(&sidecar);

                let store = Arc::new(MemoryStatusStore::new());
                let settings = SupervisorSettings {
                    settle_delay: Duration::from_secs(2),
                    stop_timeout: Duration::from_secs(2),
                    ..test_settings()
                };
                let supervisor = ProcessSupervisor::new(
                    Arc::new(PortAllocator::new(from, from + 9, OFFSET)),
                    store.clone(),
                    Arc::new(OsProcessController::new()),
                    HealthChecker::new(Duration::from_secs(1)).unwrap(),
                    settings,
                );
                Self {
                    supervisor,
                    store,
                    root,
                    sidecar,
                }
            }

            fn generated(&self, id: &str, launch: &[&str]) {
                let dir = self.root.path().join(id);
                std::fs::create_dir_all(dir.join("server")).unwrap();
                let launch: Vec<String> = launch.iter().map(|a| a.to_string()).collect();
                let script = dir.join(STARTUP_SCRIPT);
                std::fs::write(
                    &script,
                    render_startup_script(id, &self.sidecar, OFFSET, &launch),
                )
                .unwrap();
                make_executable(&script);
                self.store
                    .save(
                        id,
                        &HostedTargetRecord {
                            status: HostingStatus::Inactive,
                            server_directory: Some(dir),
                            ..Default::default()
                        },
                    )
                    .unwrap();
            }
        }

        fn make_executable(path: &Path) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        async fn wait_bindable(port: u16) {
            for _ in 0..200 {
                if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("port {} still bound", port);
        }

        #[tokio::test]
        async fn test_rendered_script_starts_and_stop_frees_both_ports() {
            let h = ScriptHarness::new(40500);
            h.generated("widgets", &["sleep", "30"]);

            let record = h.supervisor.start("widgets").await.unwrap();
            assert_eq!(record.status, HostingStatus::Running);
            let port = record.port.unwrap();
            assert!((40500..=40509).contains(&port));

            let health: serde_json::Value =
                reqwest::get(format!("http://127.0.0.1:{}/health", port + OFFSET))
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
            assert_eq!(health["status"], "ok");
            assert_eq!(health["targetId"], "widgets");

            let record = h.supervisor.stop("widgets").await.unwrap();
            assert_eq!(record.status, HostingStatus::Stopped);
            assert!(h.supervisor.get_status("widgets").await.is_none());
            wait_bindable(port).await;
            wait_bindable(port + OFFSET).await;
        }

        #[tokio::test]
        async fn test_rendered_script_early_exit_records_error() {
            let h = ScriptHarness::new(40520);
            h.generated("broken", &["sh", "-c", "echo boom; exit 1"]);

            let result = h.supervisor.start("broken").await;
            let Err(FoundryError::HealthCheckFailed(_, message)) = result else {
                panic!("expected a failed start, got {:?}", result);
            };
            assert!(message.contains("code 1"), "{}", message);

            let record = h.store.load("broken").unwrap().unwrap();
            assert_eq!(record.status, HostingStatus::Error);
            assert!(record.port.is_none());
            assert!(h.supervisor.get_status("broken").await.is_none());
            assert!(!h.supervisor.ports().is_reserved(40520));
            wait_bindable(40520 + OFFSET).await;
        }
    }
}
