//! Foundry: generate and host tool servers from OpenAPI documents.
//!
//! Three subcommands:
//! - `foundry serve`: host targets behind a JSON control API
//! - `foundry health-sidecar`: the per-target health listener started by `start.sh`
//! - `foundry inspect`: resolve a document offline and print its tools

mod api;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nimbus_foundry::{FileStatusStore, FoundryConfig, HostingService, SpecProcessor};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Foundry: generate and host tool servers from OpenAPI documents.
#[derive(Parser)]
#[command(
    name = "foundry",
    version,
    about = "Foundry: generate and host tool servers from OpenAPI documents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host generated tool servers behind a JSON control API
    Serve {
        /// Path to foundry.toml [default: ./foundry.toml or ~/.config/foundry/foundry.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "4000")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Answer GET /health for one target (run by generated start scripts)
    HealthSidecar {
        /// Health port to bind on loopback
        #[arg(long)]
        port: u16,
        /// Target id to report
        #[arg(long)]
        target_id: String,
    },
    /// Resolve a JSON/YAML document and print its base URL and tools
    Inspect {
        /// Document to read
        file: PathBuf,
        /// Base URL overriding the document's servers/host
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with env filter (RUST_LOG controls verbosity)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler: cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down foundry...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = match resolve_config(config)? {
                Some(path) => load_config(&path).await?,
                None => {
                    tracing::info!("no foundry.toml found, using defaults");
                    FoundryConfig::default()
                }
            };
            run_serve(config, host, port, cancel).await?;
        }
        Commands::HealthSidecar { port, target_id } => {
            nimbus_foundry::sidecar::serve_health(port, target_id, cancel)
                .await
                .map_err(|e| anyhow::anyhow!("health sidecar on port {} failed: {}", port, e))?;
        }
        Commands::Inspect { file, base_url } => {
            println!("{}", inspect(&file, base_url.as_deref()).await?);
        }
    }

    Ok(())
}

/// Build the hosting service, start the health monitor, and serve the
/// control API until cancelled. Live targets are stopped on the way out.
async fn run_serve(
    config: FoundryConfig,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let store = FileStatusStore::open(config.hosting.status_dir())
        .map_err(|e| anyhow::anyhow!("Failed to open status store: {}", e))?;
    let service = HostingService::from_config(config, Arc::new(store))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to build hosting service: {}", e))?;
    let service = Arc::new(service);
    let monitor = service.spawn_health_monitor();

    let app = api::router(service.clone());
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "foundry control API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await;

    service.shutdown().await;
    monitor.await.ok();
    served.map_err(|e| anyhow::anyhow!("foundry HTTP server error: {}", e))?;

    tracing::info!("foundry control API stopped");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Inspection {
    base_url: String,
    tools: Vec<nimbus_foundry::ToolDescriptor>,
}

async fn inspect(file: &Path, base_url: Option<&str>) -> Result<String> {
    let raw = tokio::fs::read(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", file, e))?;
    let resolved = SpecProcessor::default().resolve(&raw, base_url)?;
    let inspection = Inspection {
        base_url: resolved.base_url,
        tools: resolved.tools,
    };
    Ok(serde_json::to_string_pretty(&inspection)?)
}

/// Resolve config file path: explicit flag → ./foundry.toml → ~/.config/foundry/foundry.toml.
/// An explicit path must exist; otherwise `None` means defaults.
fn resolve_config(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file {:?} does not exist", path));
        }
        return Ok(Some(path));
    }

    let local = Path::new("foundry.toml");
    if local.exists() {
        return Ok(Some(local.to_path_buf()));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("foundry").join("foundry.toml");
        if xdg.exists() {
            return Ok(Some(xdg));
        }
    }

    Ok(None)
}

/// Load and parse a foundry.toml config file.
async fn load_config(config_path: &Path) -> Result<FoundryConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config: FoundryConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inspect_prints_base_url_and_tools() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("widgets.yaml");
        std::fs::write(
            &file,
            "openapi: 3.0.0\nservers:\n  - url: https://api.example.com\npaths:\n  /widgets:\n    get:\n      operationId: listWidgets\n",
        )
        .unwrap();

        let out: serde_json::Value = serde_json::from_str(&inspect(&file, None).await.unwrap()).unwrap();
        assert_eq!(out["baseUrl"], "https://api.example.com");
        assert_eq!(out["tools"][0]["name"], "listWidgets");

        let overridden: serde_json::Value =
            serde_json::from_str(&inspect(&file, Some("http://localhost:9000")).await.unwrap()).unwrap();
        assert_eq!(overridden["baseUrl"], "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_load_config_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foundry.toml");
        std::fs::write(&path, "[hosting]\nport_range_start = 7000\nport_range_end = 7099\n").unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.hosting.port_range_start, 7000);
        assert_eq!(config.hosting.port_range_end, 7099);
        assert_eq!(config.hosting.health_port_offset, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_resolve_config_missing_explicit_path() {
        assert!(resolve_config(Some(PathBuf::from("/nonexistent/foundry.toml"))).is_err());
    }
}
