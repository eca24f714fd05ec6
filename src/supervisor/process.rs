//! OS process control for hosted targets.
//!
//! Startup scripts are spawned as leaders of their own process group, so a
//! signal sent to the group reaches the script, the health sidecar it put in
//! the background, and the service it exec'd.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::error::FoundryError;

/// Lines of process output kept per target for diagnostics.
pub const OUTPUT_BUFFER_LINES: usize = 200;

/// Rolling buffer of a process's recent stdout/stderr lines.
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a line, evicting the oldest at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// How a process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("process exited with code {code}"),
            None => "process was terminated by a signal".to_string(),
        }
    }
}

/// What the supervisor needs to launch one target.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub target_id: &'a str,
    pub script: &'a Path,
    pub port: u16,
    pub directory: &'a Path,
}

/// A freshly spawned process.
pub struct SpawnedProcess {
    pub pid: u32,
    /// Flips to `Some` once the process has exited.
    pub exit: watch::Receiver<Option<ProcessExit>>,
    pub output: Arc<Mutex<OutputBuffer>>,
}

/// Wait until the process behind `exit` has ended.
///
/// A dropped sender counts as an exit with unknown code.
pub async fn wait_for_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match exit.wait_for(Option::is_some).await {
        Ok(state) => (*state).unwrap_or(ProcessExit { code: None }),
        Err(_) => ProcessExit { code: None },
    }
}

/// Process control seam. The supervisor only ever talks to processes through
/// this trait.
pub trait ProcessController: Send + Sync {
    /// Launch `script <port>` from `directory`. Must be called from within a
    /// tokio runtime.
    fn spawn(&self, request: SpawnRequest<'_>) -> crate::Result<SpawnedProcess>;

    /// Stop the process group from being scheduled.
    fn suspend(&self, pid: u32) -> crate::Result<()>;

    fn resume(&self, pid: u32) -> crate::Result<()>;

    /// Ask the process group to exit, or kill it outright when `force`.
    /// Signalling a group that is already gone succeeds.
    fn terminate(&self, pid: u32, force: bool) -> crate::Result<()>;

    /// Whether `suspend`/`resume` are available on this platform.
    fn supports_suspend(&self) -> bool;
}

/// `ProcessController` backed by real OS processes.
///
/// Each spawned leader also gets a kill switch held by the task that waits on
/// it. `terminate` falls back to it when the group cannot be signalled, which
/// is always the case off unix.
#[derive(Debug, Default, Clone)]
pub struct OsProcessController {
    kill_switches: Arc<std::sync::Mutex<HashMap<u32, CancellationToken>>>,
}

impl OsProcessController {
    pub fn new() -> Self {
        Self::default()
    }

    fn switches(&self) -> std::sync::MutexGuard<'_, HashMap<u32, CancellationToken>> {
        self.kill_switches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Kill the leader through its wait task. False if it is not tracked,
    /// i.e. it has already been reaped.
    fn kill_leader(&self, pid: u32) -> bool {
        match self.switches().get(&pid) {
            Some(kill) => {
                kill.cancel();
                true
            }
            None => false,
        }
    }
}

/// Drain a child pipe line by line into the shared buffer.
fn start_output_drain<R>(pipe: R, target_id: String, stream: &'static str, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target = %target_id, stream, line = %line, "hosted process output");
            output.lock().await.push(line);
        }
    });
}

impl ProcessController for OsProcessController {
    fn spawn(&self, request: SpawnRequest<'_>) -> crate::Result<SpawnedProcess> {
        let mut cmd = Command::new(request.script);
        cmd.arg(request.port.to_string());
        cmd.current_dir(request.directory);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            FoundryError::ProcessSpawnError(request.target_id.to_string(), e.to_string())
        })?;
        let pid = child.id().ok_or_else(|| {
            FoundryError::ProcessSpawnError(
                request.target_id.to_string(),
                "process exited before its pid could be read".to_string(),
            )
        })?;

        let output = Arc::new(Mutex::new(OutputBuffer::new(OUTPUT_BUFFER_LINES)));
        if let Some(stdout) = child.stdout.take() {
            start_output_drain(stdout, request.target_id.to_string(), "stdout", output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            start_output_drain(stderr, request.target_id.to_string(), "stderr", output.clone());
        }

        let (tx, rx) = watch::channel(None);
        let target_id = request.target_id.to_string();
        let kill = CancellationToken::new();
        self.switches().insert(pid, kill.clone());
        let controller = self.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.cancelled() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(target = %target_id, pid, error = %e, "failed to kill hosted process");
                    }
                    child.wait().await
                }
            };
            controller.switches().remove(&pid);
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(target = %target_id, pid, error = %e, "failed to wait on hosted process");
                    None
                }
            };
            let _ = tx.send(Some(ProcessExit { code }));
        });

        Ok(SpawnedProcess {
            pid,
            exit: rx,
            output,
        })
    }

    fn suspend(&self, pid: u32) -> crate::Result<()> {
        signal_group(pid, GroupSignal::Stop)
    }

    fn resume(&self, pid: u32) -> crate::Result<()> {
        signal_group(pid, GroupSignal::Continue)
    }

    fn terminate(&self, pid: u32, force: bool) -> crate::Result<()> {
        let signal = if force {
            GroupSignal::Kill
        } else {
            GroupSignal::Terminate
        };
        match signal_group(pid, signal) {
            Ok(()) | Err(FoundryError::NotRunning(_)) => Ok(()),
            Err(e) => {
                if self.kill_leader(pid) {
                    tracing::debug!(pid, error = %e, "group signal unavailable, killed leader directly");
                    Ok(())
                } else if cfg!(unix) {
                    Err(e)
                } else {
                    // Untracked means already reaped.
                    Ok(())
                }
            }
        }
    }

    fn supports_suspend(&self) -> bool {
        cfg!(unix)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Stop,
    Continue,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> crate::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| FoundryError::SignalFailed(pid.to_string(), "pid out of range".to_string()))?;
    let sig = match signal {
        GroupSignal::Stop => Signal::SIGSTOP,
        GroupSignal::Continue => Signal::SIGCONT,
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(FoundryError::NotRunning(pid.to_string())),
        Err(e) => Err(FoundryError::SignalFailed(pid.to_string(), e.to_string())),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: GroupSignal) -> crate::Result<()> {
    Err(FoundryError::SignalFailed(
        pid.to_string(),
        format!("{:?} is not supported on this platform", signal),
    ))
}
