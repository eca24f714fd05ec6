//! Server generation: persist the spec, scaffold a service with the builder,
//! install its dependencies, and emit the startup script.
//!
//! Each target gets one directory under the hosting root:
//!
//! ```text
//! <root>/<id>/openapi.json
//! <root>/<id>/server/        generated tree
//! <root>/<id>/start.sh
//! ```
//!
//! Completed steps leave marker files so a resumed job skips them. Writing a
//! spec that differs from the one on disk invalidates the markers, and the
//! scaffold marker records the service name and base URL it was built for.

pub mod builder;
pub mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::FoundryError;
use crate::generator::builder::{ScaffoldRequest, ServerBuilder};

pub const SPEC_FILE: &str = "openapi.json";
pub const SERVER_DIR: &str = "server";
pub const STARTUP_SCRIPT: &str = "start.sh";
const SCAFFOLDED_MARKER: &str = ".scaffolded";
const INSTALLED_MARKER: &str = ".installed";

/// Target ids become directory names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_target_id(id: &str) -> crate::Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(FoundryError::InvalidTargetId(id.to_string()))
    }
}

/// Lowercase `[a-z0-9-]`, runs collapsed, ends trimmed. Never empty.
pub fn sanitize_service_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "tool-server".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct ServerGenerator {
    root: PathBuf,
    builder: Arc<dyn ServerBuilder>,
    sidecar: PathBuf,
    health_offset: u16,
}

impl ServerGenerator {
    pub fn new(
        root: impl Into<PathBuf>,
        builder: Arc<dyn ServerBuilder>,
        sidecar: impl Into<PathBuf>,
        health_offset: u16,
    ) -> Self {
        Self {
            root: root.into(),
            builder,
            sidecar: sidecar.into(),
            health_offset,
        }
    }

    /// `<root>/<id>`, after validating the id.
    pub fn target_dir(&self, id: &str) -> crate::Result<PathBuf> {
        validate_target_id(id)?;
        Ok(self.root.join(id))
    }

    /// Run every step in order. Returns the target directory.
    pub async fn generate(
        &self,
        id: &str,
        spec: &Value,
        base_url: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> crate::Result<PathBuf> {
        let dir = self.write_spec(id, spec).await?;
        check_cancelled(id, cancel)?;
        self.scaffold(id, base_url, name, cancel).await?;
        check_cancelled(id, cancel)?;
        self.install(id, cancel).await?;
        check_cancelled(id, cancel)?;
        self.write_script(id).await?;
        Ok(dir)
    }

    /// Create the target directory and write the spec into it.
    pub async fn write_spec(&self, id: &str, spec: &Value) -> crate::Result<PathBuf> {
        let dir = self.target_dir(id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(spec)
            .map_err(|e| FoundryError::InvalidSpecification(e.to_string()))?;
        let spec_path = dir.join(SPEC_FILE);
        let unchanged = matches!(tokio::fs::read(&spec_path).await, Ok(existing) if existing == body);
        if !unchanged {
            // A different spec invalidates everything generated from the old one.
            remove_file_if_exists(&dir.join(SCAFFOLDED_MARKER)).await?;
            remove_file_if_exists(&dir.join(INSTALLED_MARKER)).await?;
            tokio::fs::write(&spec_path, body).await?;
            tracing::info!(target = %id, path = %spec_path.display(), "spec written");
        }
        Ok(dir)
    }

    pub async fn scaffold(
        &self,
        id: &str,
        base_url: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let dir = self.target_dir(id)?;
        let marker = dir.join(SCAFFOLDED_MARKER);
        let service_name = sanitize_service_name(name);
        let inputs = scaffold_inputs(&service_name, base_url);
        match tokio::fs::read(&marker).await {
            Ok(recorded) if recorded == inputs => {
                tracing::debug!(target = %id, "scaffold already done, skipping");
                return Ok(());
            }
            Ok(_) => {
                // Scaffolded for another name or base URL; the install is stale too.
                tracing::info!(target = %id, "scaffold inputs changed, regenerating");
                remove_file_if_exists(&marker).await?;
                remove_file_if_exists(&dir.join(INSTALLED_MARKER)).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let out_dir = dir.join(SERVER_DIR);
        if tokio::fs::try_exists(&out_dir).await? {
            tokio::fs::remove_dir_all(&out_dir).await?;
        }
        let request = ScaffoldRequest {
            target_id: id.to_string(),
            spec_path: dir.join(SPEC_FILE),
            out_dir,
            name: service_name,
            base_url: base_url.to_string(),
        };
        self.builder.scaffold(&request, cancel).await?;
        tokio::fs::write(&marker, inputs).await?;
        tracing::info!(target = %id, service = %request.name, "service scaffolded");
        Ok(())
    }

    pub async fn install(&self, id: &str, cancel: &CancellationToken) -> crate::Result<()> {
        let dir = self.target_dir(id)?;
        let marker = dir.join(INSTALLED_MARKER);
        if tokio::fs::try_exists(&marker).await? {
            tracing::debug!(target = %id, "dependencies already installed, skipping");
            return Ok(());
        }
        let out_dir = dir.join(SERVER_DIR);
        tokio::fs::create_dir_all(&out_dir).await?;
        self.builder.install(&out_dir, cancel).await?;
        tokio::fs::write(&marker, b"").await?;
        tracing::info!(target = %id, "dependencies installed");
        Ok(())
    }

    /// Write `start.sh`. Always rewritten; it depends on config, not on
    /// generator output.
    pub async fn write_script(&self, id: &str) -> crate::Result<PathBuf> {
        let dir = self.target_dir(id)?;
        let path = dir.join(STARTUP_SCRIPT);
        let script = script::render_startup_script(
            id,
            &self.sidecar,
            self.health_offset,
            &self.builder.launch_command(),
        );
        tokio::fs::write(&path, script).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(path)
    }

    /// Whether every step has completed for this target.
    pub async fn is_complete(&self, id: &str) -> bool {
        let Ok(dir) = self.target_dir(id) else {
            return false;
        };
        for file in [SCAFFOLDED_MARKER, INSTALLED_MARKER, STARTUP_SCRIPT] {
            if !matches!(tokio::fs::try_exists(dir.join(file)).await, Ok(true)) {
                return false;
            }
        }
        true
    }

    /// Read back a previously written spec, for resuming a job.
    pub async fn read_spec(&self, id: &str) -> crate::Result<Value> {
        let path = self.target_dir(id)?.join(SPEC_FILE);
        let raw = tokio::fs::read(&path).await?;
        serde_json::from_slice(&raw).map_err(|e| FoundryError::InvalidSpecification(e.to_string()))
    }
}

pub(crate) fn check_cancelled(id: &str, cancel: &CancellationToken) -> crate::Result<()> {
    if cancel.is_cancelled() {
        return Err(FoundryError::GenerationCancelled(id.to_string()));
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> crate::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Contents of the scaffold marker: the builder inputs besides the spec.
fn scaffold_inputs(service_name: &str, base_url: &str) -> Vec<u8> {
    serde_json::json!({ "name": service_name, "baseUrl": base_url })
        .to_string()
        .into_bytes()
}
