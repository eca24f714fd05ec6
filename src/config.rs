//! Foundry configuration: deserialization and validation.

use crate::error::FoundryError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of `${VAR}` references to their values from the process
/// environment. Unset variables resolve to the empty string.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level Foundry configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FoundryConfig {
    #[serde(default)]
    pub hosting: HostingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// Where generated servers live and how their processes are arbitrated.
#[derive(Debug, Clone, Deserialize)]
pub struct HostingConfig {
    /// One sub-directory per target is created under this root.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Directory for durable status records. Defaults to `<root_dir>/.status`.
    pub status_dir: Option<PathBuf>,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Distance between a target's primary port and its health listener.
    #[serde(default = "default_health_port_offset")]
    pub health_port_offset: u16,
    /// Delay between spawning a startup script and the first health check.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Pause between the stop and start halves of a restart.
    #[serde(default = "default_restart_grace_ms")]
    pub restart_grace_ms: u64,
}

/// Background liveness polling.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
}

/// External generator, dependency installer and launch command.
///
/// `args` accepts the placeholders `{spec}`, `{out}`, `{name}` and
/// `{base_url}`; `launch` accepts `{port}`. Commands are run directly
/// (never through a shell).
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_command")]
    pub command: String,
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,
    /// Argv that starts the generated service, run from the output directory.
    #[serde(default = "default_launch")]
    pub launch: Vec<String>,
    /// Env var references (`${VAR}`), resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-step budget for scaffold and install.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Binary that provides the `health-sidecar` subcommand. Defaults to the
    /// running executable.
    pub sidecar_command: Option<PathBuf>,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("hosted")
}

fn default_port_range_start() -> u16 {
    4100
}

fn default_port_range_end() -> u16 {
    4199
}

fn default_health_port_offset() -> u16 {
    1000
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_restart_grace_ms() -> u64 {
    1000
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_generator_command() -> String {
    "openapi-mcp-generator".to_string()
}

fn default_generator_args() -> Vec<String> {
    [
        "--input",
        "{spec}",
        "--output",
        "{out}",
        "--server-name",
        "{name}",
        "--base-url",
        "{base_url}",
        "--transport",
        "streamable-http",
        "--force",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_install_command() -> String {
    "npm".to_string()
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string(), "--no-audit".to_string()]
}

fn default_launch() -> Vec<String> {
    ["node", "build/index.js", "--port", "{port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            status_dir: None,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            health_port_offset: default_health_port_offset(),
            settle_delay_ms: default_settle_delay_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            restart_grace_ms: default_restart_grace_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: default_generator_args(),
            install_command: default_install_command(),
            install_args: default_install_args(),
            launch: default_launch(),
            env: HashMap::new(),
            step_timeout_secs: default_step_timeout_secs(),
            sidecar_command: None,
        }
    }
}

impl HostingConfig {
    pub fn status_dir(&self) -> PathBuf {
        self.status_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(".status"))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GeneratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> FoundryError {
    FoundryError::InvalidConfig(field.to_string(), reason.into())
}

impl FoundryConfig {
    /// Validate the config, failing fast before any directory or process is created.
    pub fn validate(&self) -> crate::Result<()> {
        let hosting = &self.hosting;

        // 1. Port range must be non-empty and leave room for the health ports
        if hosting.port_range_start == 0 {
            return Err(invalid("hosting.port_range_start", "must be > 0"));
        }
        if hosting.port_range_start > hosting.port_range_end {
            return Err(invalid(
                "hosting.port_range_start",
                format!(
                    "start {} is above end {}",
                    hosting.port_range_start, hosting.port_range_end
                ),
            ));
        }
        if hosting.health_port_offset == 0 {
            return Err(invalid("hosting.health_port_offset", "must be > 0"));
        }
        if hosting
            .port_range_end
            .checked_add(hosting.health_port_offset)
            .is_none()
        {
            return Err(invalid(
                "hosting.health_port_offset",
                format!(
                    "port {} + offset {} exceeds 65535",
                    hosting.port_range_end, hosting.health_port_offset
                ),
            ));
        }

        // 2. Health ports must not land inside the primary range
        let span = hosting.port_range_end - hosting.port_range_start;
        if hosting.health_port_offset <= span {
            return Err(invalid(
                "hosting.health_port_offset",
                format!(
                    "offset {} overlaps the primary port range ({} ports)",
                    hosting.health_port_offset,
                    u32::from(span) + 1
                ),
            ));
        }

        // 3. Timers
        if self.health.interval_secs == 0 {
            return Err(invalid("health.interval_secs", "must be > 0"));
        }
        if self.health.timeout_secs == 0 {
            return Err(invalid("health.timeout_secs", "must be > 0"));
        }
        if self.generator.step_timeout_secs == 0 {
            return Err(invalid("generator.step_timeout_secs", "must be > 0"));
        }

        // 4. Commands
        if self.generator.command.trim().is_empty() {
            return Err(invalid("generator.command", "must be non-empty"));
        }
        if self.generator.install_command.trim().is_empty() {
            return Err(invalid("generator.install_command", "must be non-empty"));
        }
        if self.generator.launch.is_empty() {
            return Err(invalid("generator.launch", "must name a command"));
        }

        // 5. Env var references: must be ${VAR}
        for (key, value) in &self.generator.env {
            if parse_env_ref(value).is_none() {
                return Err(invalid(
                    "generator.env",
                    format!(
                        "value for key '{}' must be a ${{VAR}} reference, got '{}'",
                        key, value
                    ),
                ));
            }
        }

        Ok(())
    }
}
