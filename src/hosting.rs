//! HostingService: the single public entry point for generating and hosting
//! tool servers.
//!
//! It validates config, wires the port allocator, spec processor, generator,
//! supervisor and pipeline together, reconciles durable records against the
//! (empty) registry on construction, and exposes every lifecycle operation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FoundryConfig;
use crate::error::FoundryError;
use crate::generator::builder::{CommandBuilder, ServerBuilder};
use crate::generator::{ServerGenerator, validate_target_id};
use crate::health::{HealthChecker, HealthMonitor};
use crate::pipeline::{GenerationPipeline, GenerationRequest, JobSnapshot, JobState};
use crate::port::PortAllocator;
use crate::spec::SpecProcessor;
use crate::spec::tool::ToolDescriptor;
use crate::store::{HostedTargetRecord, HostingStatus, StatusStore, update_record};
use crate::supervisor::process::{OsProcessController, ProcessController};
use crate::supervisor::{ProcessStatus, ProcessSupervisor, SupervisorSettings, remove_dir_best_effort};

/// How long cleanup waits for a cancelled job to wind down.
const CANCEL_WAIT: Duration = Duration::from_secs(10);

/// Reply to a submission: generation has started in the background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub target_id: String,
    pub status: HostingStatus,
    pub base_url: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Durable record merged with live process and job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub target_id: String,
    #[serde(flatten)]
    pub record: HostedTargetRecord,
    pub process: Option<ProcessStatus>,
    pub job: Option<JobSnapshot>,
}

/// Swappable collaborators. [`HostingService::from_config`] fills these with
/// the OS-backed defaults.
pub struct HostingParts {
    pub store: Arc<dyn StatusStore>,
    pub controller: Arc<dyn ProcessController>,
    pub builder: Arc<dyn ServerBuilder>,
    pub processor: SpecProcessor,
    /// Executable the startup script runs as `<sidecar> health-sidecar`.
    pub sidecar: PathBuf,
}

pub struct HostingService {
    processor: SpecProcessor,
    generator: Arc<ServerGenerator>,
    supervisor: ProcessSupervisor,
    pipeline: GenerationPipeline,
    store: Arc<dyn StatusStore>,
    checker: HealthChecker,
    health_interval: Duration,
    cancel: CancellationToken,
}

impl HostingService {
    /// Build with the real process controller and command builder.
    ///
    /// The sidecar defaults to the current executable.
    pub async fn from_config(
        config: FoundryConfig,
        store: Arc<dyn StatusStore>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let sidecar = match &config.generator.sidecar_command {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let parts = HostingParts {
            store,
            controller: Arc::new(OsProcessController::new()),
            builder: Arc::new(CommandBuilder::new(config.generator.clone())),
            processor: SpecProcessor::default(),
            sidecar,
        };
        Self::with_parts(config, parts).await
    }

    pub async fn with_parts(config: FoundryConfig, parts: HostingParts) -> crate::Result<Self> {
        config.validate()?;
        let hosting = &config.hosting;

        std::fs::create_dir_all(&hosting.root_dir)?;
        // Startup scripts are spawned by absolute path.
        let root = std::fs::canonicalize(&hosting.root_dir)?;

        let ports = Arc::new(PortAllocator::new(
            hosting.port_range_start,
            hosting.port_range_end,
            hosting.health_port_offset,
        ));
        let checker = HealthChecker::new(config.health.timeout())?;
        let supervisor = ProcessSupervisor::new(
            ports,
            parts.store.clone(),
            parts.controller,
            checker.clone(),
            SupervisorSettings::from_config(hosting),
        );
        let generator = Arc::new(ServerGenerator::new(
            root.clone(),
            parts.builder,
            parts.sidecar,
            hosting.health_port_offset,
        ));
        let cancel = CancellationToken::new();
        let pipeline = GenerationPipeline::new(generator.clone(), supervisor.clone(), cancel.child_token());

        let service = Self {
            processor: parts.processor,
            generator,
            supervisor,
            pipeline,
            store: parts.store,
            checker,
            health_interval: config.health.interval(),
            cancel,
        };
        service.reconcile().await?;
        tracing::info!(
            root = %root.display(),
            port_range_start = hosting.port_range_start,
            port_range_end = hosting.port_range_end,
            "hosting service ready"
        );
        Ok(service)
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn pipeline(&self) -> &GenerationPipeline {
        &self.pipeline
    }

    /// Resolve the document and kick off generation.
    ///
    /// Everything that can be rejected synchronously is: an invalid id, an
    /// unparseable document, an unresolvable base URL, extraction failure, and
    /// port exhaustion all fail here, before any directory or process exists.
    pub async fn submit(
        &self,
        id: &str,
        name: &str,
        raw: &[u8],
        declared_base_url: Option<&str>,
    ) -> crate::Result<SubmitReceipt> {
        validate_target_id(id)?;
        let resolved = self.processor.resolve(raw, declared_base_url)?;
        let port = self.supervisor.ports().allocate()?;

        self.pipeline.submit(GenerationRequest {
            target_id: id.to_string(),
            name: name.to_string(),
            spec: resolved.document,
            base_url: resolved.base_url.clone(),
            port: Some(port),
        })?;
        tracing::info!(target = %id, tools = resolved.tools.len(), base_url = %resolved.base_url, "spec accepted, generation started");

        Ok(SubmitReceipt {
            target_id: id.to_string(),
            status: HostingStatus::Generating,
            base_url: resolved.base_url,
            tools: resolved.tools,
        })
    }

    /// Re-run generation from the spec already on disk. Completed steps are
    /// skipped.
    pub async fn resume_generation(&self, id: &str) -> crate::Result<JoinHandle<JobState>> {
        validate_target_id(id)?;
        if self.pipeline.is_active(id) {
            return Err(FoundryError::AlreadyRunning(id.to_string()));
        }
        let record = self
            .store
            .load(id)?
            .ok_or_else(|| FoundryError::ServerNotFound(id.to_string()))?;
        let base_url = record.base_url.ok_or(FoundryError::MissingBaseUrl)?;
        let spec = self.generator.read_spec(id).await.map_err(|e| match e {
            FoundryError::Io(_) => FoundryError::ServerNotFound(id.to_string()),
            other => other,
        })?;
        tracing::info!(target = %id, "resuming generation");
        self.pipeline.submit(GenerationRequest {
            target_id: id.to_string(),
            name: record.name.unwrap_or_else(|| id.to_string()),
            spec,
            base_url,
            port: None,
        })
    }

    pub async fn start(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        validate_target_id(id)?;
        self.supervisor.start(id).await
    }

    pub async fn stop(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        validate_target_id(id)?;
        self.supervisor.stop(id).await
    }

    pub async fn restart(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        validate_target_id(id)?;
        self.supervisor.restart(id).await
    }

    pub async fn pause(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        validate_target_id(id)?;
        self.supervisor.pause(id).await
    }

    pub async fn unpause(&self, id: &str) -> crate::Result<HostedTargetRecord> {
        validate_target_id(id)?;
        self.supervisor.unpause(id).await
    }

    /// Cancel the target's in-flight generation. Returns false if none.
    pub fn cancel_generation(&self, id: &str) -> bool {
        self.pipeline.cancel_generation(id)
    }

    /// Cancel any job, kill any process, delete the directory and the
    /// durable record.
    pub async fn cleanup(&self, id: &str) -> crate::Result<()> {
        validate_target_id(id)?;
        self.pipeline.cancel_and_wait(id, CANCEL_WAIT).await;
        self.supervisor.cleanup(id).await?;
        remove_dir_best_effort(id, &self.generator.target_dir(id)?).await;
        self.store.remove(id)?;
        self.pipeline.forget(id);
        Ok(())
    }

    pub async fn status(&self, id: &str) -> crate::Result<TargetStatus> {
        validate_target_id(id)?;
        let record = self
            .store
            .load(id)?
            .ok_or_else(|| FoundryError::ServerNotFound(id.to_string()))?;
        Ok(self.merge(id.to_string(), record).await)
    }

    pub async fn list(&self) -> crate::Result<Vec<TargetStatus>> {
        let mut all = Vec::new();
        for (id, record) in self.store.list()? {
            all.push(self.merge(id, record).await);
        }
        Ok(all)
    }

    async fn merge(&self, target_id: String, mut record: HostedTargetRecord) -> TargetStatus {
        let process = self.supervisor.get_status(&target_id).await;
        if let Some(live) = process.as_ref().and_then(|p| p.last_health_check) {
            if record.last_health_check.is_none_or(|durable| durable < live) {
                record.last_health_check = Some(live);
            }
        }
        let job = self.pipeline.job(&target_id);
        TargetStatus {
            target_id,
            record,
            process,
            job,
        }
    }

    /// Normalize records left behind by a previous host process.
    pub async fn reconcile(&self) -> crate::Result<()> {
        let stopped = self.supervisor.reconcile().await?;
        let mut interrupted = 0usize;
        for (id, record) in self.store.list()? {
            if record.status == HostingStatus::Generating && !self.pipeline.is_active(&id) {
                update_record(self.store.as_ref(), &id, |r| r.mark_error("generation interrupted"))?;
                tracing::info!(target = %id, "generation interrupted by restart");
                interrupted += 1;
            }
        }
        if !stopped.is_empty() || interrupted > 0 {
            tracing::info!(stopped = stopped.len(), interrupted, "reconciled durable records");
        }
        Ok(())
    }

    /// Start the background health monitor. It stops on [`Self::shutdown`].
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        HealthMonitor::new(self.supervisor.clone(), self.checker.clone(), self.health_interval)
            .spawn(self.cancel.child_token())
    }

    /// Cancel every job and the monitor, then stop every live process.
    pub async fn shutdown(&self) {
        tracing::info!("hosting service shutting down");
        self.cancel.cancel();
        self.supervisor.stop_all().await;
    }
}
