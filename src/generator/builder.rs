//! The builder collaborator: scaffolds a service from a spec file and
//! installs its dependencies.
//!
//! `CommandBuilder` shells out to configured executables via
//! `tokio::process::Command` with structured args (never a shell). Each step
//! races the child against a timeout and the job's cancellation token; the
//! child is killed when either wins.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{GeneratorConfig, resolve_env_vars};
use crate::error::FoundryError;

/// Longest stderr excerpt carried in a `CodeGenerationFailed` error.
const STDERR_EXCERPT_BYTES: usize = 4096;

/// Inputs of one scaffold invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldRequest {
    pub target_id: String,
    pub spec_path: PathBuf,
    pub out_dir: PathBuf,
    /// Sanitized service name.
    pub name: String,
    pub base_url: String,
}

#[async_trait]
pub trait ServerBuilder: Send + Sync {
    /// Generate a runnable service into `request.out_dir`.
    async fn scaffold(
        &self,
        request: &ScaffoldRequest,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    /// Install the generated service's dependencies in `out_dir`.
    async fn install(&self, out_dir: &Path, cancel: &CancellationToken) -> crate::Result<()>;

    /// Argv that starts the generated service from its output directory.
    /// `{port}` is replaced with the primary port at launch.
    fn launch_command(&self) -> Vec<String>;
}

/// Captured result of a finished step.
struct StepOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

pub struct CommandBuilder {
    config: GeneratorConfig,
}

impl CommandBuilder {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    fn render_args(&self, request: &ScaffoldRequest) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{spec}", &request.spec_path.to_string_lossy())
                    .replace("{out}", &request.out_dir.to_string_lossy())
                    .replace("{name}", &request.name)
                    .replace("{base_url}", &request.base_url)
            })
            .collect()
    }

    async fn run_step(
        &self,
        step: &str,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> crate::Result<StepOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if !self.config.env.is_empty() {
            cmd.envs(resolve_env_vars(&self.config.env));
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the wait future on timeout/cancel kills the child.
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            tracing::error!(target = %target_id, step, command = %program, error = %e, "failed to spawn generation step");
            FoundryError::ProcessSpawnError(
                target_id.to_string(),
                format!("{} step could not start '{}': {}", step, program, e),
            )
        })?;

        tracing::info!(target = %target_id, step, command = %program, "generation step started");

        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            _ = tokio::time::sleep(self.config.step_timeout()) => {
                tracing::warn!(target = %target_id, step, "generation step timed out, child killed");
                return Err(FoundryError::GenerationTimedOut(step.to_string()));
            }
            _ = cancel.cancelled() => {
                tracing::info!(target = %target_id, step, "generation step cancelled, child killed");
                return Err(FoundryError::GenerationCancelled(target_id.to_string()));
            }
        };

        let step_output = StepOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        tracing::info!(target = %target_id, step, exit_code = step_output.exit_code, "generation step finished");
        if !step_output.stdout.is_empty() {
            tracing::debug!(target = %target_id, step, stdout = %step_output.stdout, "generation step stdout");
        }
        if !step_output.stderr.is_empty() {
            tracing::debug!(target = %target_id, step, stderr = %step_output.stderr, "generation step stderr");
        }
        Ok(step_output)
    }
}

/// Keep the tail of stderr, where generators print the actual failure.
fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_EXCERPT_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[async_trait]
impl ServerBuilder for CommandBuilder {
    async fn scaffold(
        &self,
        request: &ScaffoldRequest,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let args = self.render_args(request);
        let output = self
            .run_step(
                "scaffold",
                &self.config.command,
                &args,
                request.spec_path.parent(),
                &request.target_id,
                cancel,
            )
            .await
            .map_err(|e| match e {
                FoundryError::ProcessSpawnError(_, msg) => FoundryError::CodeGenerationFailed(-1, msg),
                other => other,
            })?;

        if output.exit_code != 0 {
            return Err(FoundryError::CodeGenerationFailed(
                output.exit_code,
                stderr_excerpt(&output.stderr),
            ));
        }
        Ok(())
    }

    async fn install(&self, out_dir: &Path, cancel: &CancellationToken) -> crate::Result<()> {
        let target_id = out_dir
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = self
            .run_step(
                "install",
                &self.config.install_command,
                &self.config.install_args,
                Some(out_dir),
                &target_id,
                cancel,
            )
            .await
            .map_err(|e| match e {
                FoundryError::ProcessSpawnError(..) => FoundryError::DependencyInstallFailed(-1),
                other => other,
            })?;

        if output.exit_code != 0 {
            tracing::warn!(
                target = %target_id,
                exit_code = output.exit_code,
                stderr = %stderr_excerpt(&output.stderr),
                "dependency installation failed"
            );
            return Err(FoundryError::DependencyInstallFailed(output.exit_code));
        }
        Ok(())
    }

    fn launch_command(&self) -> Vec<String> {
        self.config.launch.clone()
    }
}
