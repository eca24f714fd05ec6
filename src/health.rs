//! Liveness probing of hosted targets.
//!
//! [`HealthChecker`] issues one bounded `GET /health` against a target's
//! health port. [`HealthMonitor`] runs it on a timer for every live,
//! non-paused target. Failures are logged and counted on the handle; the
//! monitor never restarts, stops, or re-labels a target.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::FoundryError;
use crate::sidecar::HealthReply;
use crate::supervisor::ProcessSupervisor;

#[derive(Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FoundryError::InvalidConfig("health.timeout_secs".to_string(), e.to_string()))?;
        Ok(Self { client })
    }

    /// Healthy only on a 2xx whose JSON body is `{"status":"ok","targetId":<target_id>}`.
    pub async fn check(&self, health_port: u16, target_id: &str) -> crate::Result<()> {
        let url = format!("http://127.0.0.1:{health_port}/health");
        let failed = |reason: String| FoundryError::HealthCheckFailed(target_id.to_string(), reason);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(failed(format!("GET {url} returned {}", response.status())));
        }
        let reply: HealthReply = response
            .json()
            .await
            .map_err(|e| failed(format!("unexpected health body: {e}")))?;
        if reply.status != "ok" {
            return Err(failed(format!("reported status '{}'", reply.status)));
        }
        if reply.target_id != target_id {
            return Err(failed(format!(
                "health port answered for target '{}'",
                reply.target_id
            )));
        }
        Ok(())
    }
}

/// Outcome of one check in a monitor sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub target_id: String,
    pub healthy: bool,
}

pub struct HealthMonitor {
    supervisor: ProcessSupervisor,
    checker: HealthChecker,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: ProcessSupervisor, checker: HealthChecker, interval: Duration) -> Self {
        Self {
            supervisor,
            checker,
            interval,
        }
    }

    /// Check every live, non-paused target concurrently and record results.
    pub async fn check_once(&self) -> Vec<CheckOutcome> {
        let targets = self.supervisor.health_targets().await;
        let checks = targets.iter().map(|t| async move {
            let result = self.checker.check(t.health_port, &t.target_id).await;
            (t, result)
        });

        let mut outcomes = Vec::with_capacity(targets.len());
        for (target, result) in join_all(checks).await {
            let healthy = match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        target = %target.target_id,
                        pid = target.pid,
                        port = target.health_port,
                        error = %e,
                        "health check failed"
                    );
                    false
                }
            };
            self.supervisor
                .record_health(&target.target_id, target.pid, healthy)
                .await;
            outcomes.push(CheckOutcome {
                target_id: target.target_id.clone(),
                healthy,
            });
        }
        outcomes
    }

    /// Sweep on the configured interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start just checked everything.
        ticker.tick().await;

        tracing::info!(interval_secs = self.interval.as_secs(), "health monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let outcomes = self.check_once().await;
                    tracing::debug!(checked = outcomes.len(), "health sweep finished");
                }
            }
        }
        tracing::info!("health monitor stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
