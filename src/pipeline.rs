//! Detached generation jobs.
//!
//! A job walks one target through write spec → scaffold → install → write
//! script → start. Each job owns a child of the pipeline's root cancellation
//! token; cancelling it kills the running step's child process. Failures
//! never propagate to the submitter: they land in the durable record as
//! `error` with a message, and in the job's snapshot.
//!
//! Submitting again for a target with a job in flight supersedes it. A
//! superseded job stops touching the record as soon as it notices.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::FoundryError;
use crate::generator::{ServerGenerator, check_cancelled};
use crate::store::{HostingStatus, update_record};
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    WritingSpec,
    Scaffolding,
    Installing,
    WritingScript,
    Starting,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Everything a job needs to produce and start a target's service.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub target_id: String,
    pub name: String,
    pub spec: Value,
    pub base_url: String,
    /// A port already reserved for this target. Released if the job fails
    /// before the process starts.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub target_id: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

struct Job {
    snapshot: JobSnapshot,
    generation: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct PipelineInner {
    generator: Arc<ServerGenerator>,
    supervisor: ProcessSupervisor,
    jobs: std::sync::Mutex<HashMap<String, Job>>,
    root: CancellationToken,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct GenerationPipeline {
    inner: Arc<PipelineInner>,
}

impl GenerationPipeline {
    pub fn new(
        generator: Arc<ServerGenerator>,
        supervisor: ProcessSupervisor,
        root: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                generator,
                supervisor,
                jobs: std::sync::Mutex::new(HashMap::new()),
                root,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the target `generating` and run its job in the background.
    ///
    /// Returns as soon as the record is written. The handle resolves to the
    /// job's final state.
    pub fn submit(&self, request: GenerationRequest) -> crate::Result<JoinHandle<JobState>> {
        let id = request.target_id.clone();
        let store = self.inner.supervisor.store().clone();
        let persisted = update_record(store.as_ref(), &id, |r| {
            r.status = HostingStatus::Generating;
            r.name = Some(request.name.clone());
            r.base_url = Some(request.base_url.clone());
            r.error_message = None;
        });
        if let Err(e) = persisted {
            if let Some(port) = request.port {
                self.inner.supervisor.ports().release(port);
            }
            return Err(e);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.root.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let job = Job {
            snapshot: JobSnapshot {
                target_id: id.clone(),
                state: JobState::Queued,
                submitted_at: Utc::now(),
                finished_at: None,
                error: None,
            },
            generation,
            cancel: cancel.clone(),
            done: done_rx,
        };
        if let Some(previous) = self.jobs().insert(id.clone(), job) {
            if !previous.snapshot.state.is_terminal() {
                tracing::info!(target = %id, "superseding in-flight generation job");
                previous.cancel.cancel();
            }
        }
        tracing::info!(target = %id, generation, "generation job queued");

        let pipeline = self.clone();
        Ok(tokio::spawn(async move {
            let state = pipeline.run(request, generation, cancel).await;
            let _ = done_tx.send(true);
            state
        }))
    }

    /// Cancel the target's in-flight job. Returns false if there is none.
    pub fn cancel_generation(&self, id: &str) -> bool {
        match self.jobs().get(id) {
            Some(job) if !job.snapshot.state.is_terminal() => {
                tracing::info!(target = %id, state = ?job.snapshot.state, "cancelling generation job");
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel and wait (bounded) for the job to wind down.
    pub async fn cancel_and_wait(&self, id: &str, timeout: Duration) -> bool {
        let cancelled = self.cancel_generation(id);
        let done = self.jobs().get(id).map(|j| j.done.clone());
        if let Some(mut done) = done {
            let _ = tokio::time::timeout(timeout, done.wait_for(|d| *d)).await;
        }
        cancelled
    }

    pub fn job(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs().get(id).map(|j| j.snapshot.clone())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.jobs()
            .get(id)
            .is_some_and(|j| !j.snapshot.state.is_terminal())
    }

    /// Drop a finished job's snapshot.
    pub fn forget(&self, id: &str) {
        let mut jobs = self.jobs();
        if jobs.get(id).is_some_and(|j| j.snapshot.state.is_terminal()) {
            jobs.remove(id);
        }
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.jobs().get(id).is_some_and(|j| j.generation == generation)
    }

    /// Advance the job. Fails if it has been superseded.
    fn enter(&self, id: &str, generation: u64, state: JobState) -> crate::Result<()> {
        let mut jobs = self.jobs();
        match jobs.get_mut(id) {
            Some(job) if job.generation == generation => {
                job.snapshot.state = state;
                tracing::debug!(target = %id, state = ?state, "generation job advanced");
                Ok(())
            }
            _ => Err(FoundryError::GenerationCancelled(id.to_string())),
        }
    }

    fn finish(&self, id: &str, generation: u64, state: JobState, error: Option<String>) {
        let mut jobs = self.jobs();
        if let Some(job) = jobs.get_mut(id).filter(|j| j.generation == generation) {
            job.snapshot.state = state;
            job.snapshot.finished_at = Some(Utc::now());
            job.snapshot.error = error;
        }
    }

    async fn run(
        &self,
        request: GenerationRequest,
        generation: u64,
        cancel: CancellationToken,
    ) -> JobState {
        let id = request.target_id.as_str();
        let Err(e) = self.execute(&request, generation, &cancel).await else {
            self.finish(id, generation, JobState::Done, None);
            tracing::info!(target = %id, "generation job finished");
            return JobState::Done;
        };

        let cancelled = cancel.is_cancelled() || matches!(e, FoundryError::GenerationCancelled(_));
        let (state, message) = if cancelled {
            (JobState::Cancelled, "generation cancelled".to_string())
        } else {
            (JobState::Failed, e.to_string())
        };

        if !self.is_current(id, generation) {
            tracing::debug!(target = %id, "superseded job exiting");
            return state;
        }
        self.finish(id, generation, state, Some(message.clone()));

        let store = self.inner.supervisor.store();
        // A failed start has already recorded its own, more detailed, error.
        let recorded = matches!(store.load(id), Ok(Some(r)) if r.status == HostingStatus::Error);
        if cancelled || !recorded {
            if let Err(err) = update_record(store.as_ref(), id, |r| r.mark_error(message.clone())) {
                tracing::error!(target = %id, error = %err, "failed to persist generation failure");
            }
        }
        if cancelled {
            tracing::info!(target = %id, "generation job cancelled");
        } else {
            tracing::warn!(target = %id, error = %e, "generation job failed");
        }
        state
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        generation: u64,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let id = request.target_id.as_str();
        if let Err(e) = self.prepare(request, generation, cancel).await {
            if let Some(port) = request.port {
                self.inner.supervisor.ports().release(port);
            }
            return Err(e);
        }

        let ready = self
            .enter(id, generation, JobState::Starting)
            .and_then(|()| check_cancelled(id, cancel));
        if let Err(e) = ready {
            if let Some(port) = request.port {
                self.inner.supervisor.ports().release(port);
            }
            return Err(e);
        }

        match request.port {
            Some(port) => self.inner.supervisor.start_on(id, port).await?,
            None => self.inner.supervisor.start(id).await?,
        };
        Ok(())
    }

    /// Every step up to, but not including, the start.
    async fn prepare(
        &self,
        request: &GenerationRequest,
        generation: u64,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let id = request.target_id.as_str();
        let generator = &self.inner.generator;
        let supervisor = &self.inner.supervisor;

        // Regenerating replaces whatever is running from the previous spec.
        if supervisor.is_live(id).await {
            supervisor.stop(id).await?;
            update_record(supervisor.store().as_ref(), id, |r| {
                r.status = HostingStatus::Generating;
            })?;
        }

        self.enter(id, generation, JobState::WritingSpec)?;
        let directory = generator.write_spec(id, &request.spec).await?;
        check_cancelled(id, cancel)?;

        self.enter(id, generation, JobState::Scaffolding)?;
        generator
            .scaffold(id, &request.base_url, &request.name, cancel)
            .await?;
        check_cancelled(id, cancel)?;

        self.enter(id, generation, JobState::Installing)?;
        generator.install(id, cancel).await?;
        check_cancelled(id, cancel)?;

        self.enter(id, generation, JobState::WritingScript)?;
        generator.write_script(id).await?;

        if !self.is_current(id, generation) {
            return Err(FoundryError::GenerationCancelled(id.to_string()));
        }
        update_record(supervisor.store().as_ref(), id, |r| {
            r.server_directory = Some(directory.clone());
            r.generated_at = Some(Utc::now());
        })?;
        tracing::info!(target = %id, path = %directory.display(), "service generated");
        Ok(())
    }
}
