//! The per-target health listener.
//!
//! Startup scripts run it in the background on `port + health_port_offset`.
//! It answers `GET /health` with `{"status":"ok","targetId":<id>}` for as long
//! as the target's process group is alive.

use std::net::{Ipv4Addr, SocketAddr};

use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Body served by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReply {
    pub status: String,
    pub target_id: String,
}

impl HealthReply {
    pub fn ok(target_id: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            target_id: target_id.into(),
        }
    }
}

pub fn health_router(target_id: String) -> Router {
    Router::new().route(
        "/health",
        get(move || {
            let reply = HealthReply::ok(target_id.clone());
            async move { Json(reply) }
        }),
    )
}

/// Bind the loopback health port.
pub async fn bind_health(port: u16) -> crate::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    Ok(TcpListener::bind(addr).await?)
}

/// Serve the health router on an already-bound listener until `cancel` fires.
pub async fn serve_health_listener(
    listener: TcpListener,
    target_id: String,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let port = listener.local_addr()?.port();
    tracing::info!(target = %target_id, port, "health sidecar listening");
    axum::serve(listener, health_router(target_id.clone()))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!(target = %target_id, port, "health sidecar stopped");
    Ok(())
}

pub async fn serve_health(
    port: u16,
    target_id: String,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = bind_health(port).await?;
    serve_health_listener(listener, target_id, cancel).await
}
