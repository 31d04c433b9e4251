//! Readiness probing against the backend's HTTP surface.
//!
//! The backend exposes two readiness tiers: the HTTP layer and basic
//! endpoints come up first (`core_ready`), while heavier ML dependencies
//! finish loading asynchronously afterwards (`ml_ready`). The blocking
//! probe only waits for the first tier so the shell can render quickly; a
//! separate non-blocking poll reports the second.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Per-request timeout for readiness probe requests. Short on purpose; the
/// probe loop supplies the retries.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Health payload returned by `GET /health`.
///
/// Older server builds report a single `ready` boolean; two-phase builds
/// report `core_ready` and `ml_ready` separately. All fields are optional
/// so either shape parses.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HealthReport {
    /// Legacy single-tier readiness flag.
    #[serde(default)]
    pub ready: Option<bool>,
    /// HTTP layer and basic endpoints are live.
    #[serde(default)]
    pub core_ready: Option<bool>,
    /// Heavy ML dependencies have finished loading.
    #[serde(default)]
    pub ml_ready: Option<bool>,
}

impl HealthReport {
    /// Whether the first readiness tier is satisfied.
    pub fn is_core_ready(&self) -> bool {
        self.core_ready.or(self.ready).unwrap_or(false)
    }

    /// Whether the second readiness tier is satisfied.
    pub fn is_ml_ready(&self) -> bool {
        self.ml_ready.unwrap_or(false)
    }
}

/// Readiness payload returned by `GET /readiness`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct ReadinessReport {
    #[serde(default)]
    ml_ready: bool,
}

/// Outcome of the background ML-readiness poll.
///
/// A timeout here is not a failure; the backend is already usable without
/// the ML tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlReadiness {
    /// The ML tier became available.
    Ready,
    /// The poll ceiling elapsed without the ML tier coming up.
    TimedOut,
}

/// Polls the backend health endpoints.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    base_url: String,
    interval: Duration,
}

impl HealthProbe {
    /// Create a probe for the backend at `base_url` (no trailing slash),
    /// polling every `interval`.
    pub fn new(client: reqwest::Client, base_url: String, interval: Duration) -> Self {
        Self {
            client,
            base_url,
            interval,
        }
    }

    /// Fetch the current health report.
    ///
    /// Network errors and non-2xx responses surface as errors; the polling
    /// entry points below swallow them and retry.
    pub async fn fetch_health(&self) -> Result<HealthReport> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Http(format!("Health request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "Health endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<HealthReport>()
            .await
            .map_err(|e| Error::Http(format!("Failed to decode health payload: {}", e)))
    }

    /// Issue a single health check with an explicit request timeout.
    ///
    /// Returns `true` only for a 2xx response; timeouts, connection errors
    /// and error statuses all count as unhealthy.
    pub async fn check(&self, request_timeout: Duration) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(request_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Block until the first readiness tier is reported, or `timeout`
    /// elapses.
    ///
    /// Connection-refused and other network errors during polling are
    /// swallowed and retried; the server is expected to need time to bind
    /// its listening socket.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            match self.fetch_health().await {
                Ok(report) if report.is_core_ready() => {
                    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Backend reported core readiness");
                    return Ok(());
                }
                Ok(_) => tracing::trace!("Backend responding but not core-ready yet"),
                Err(e) => tracing::trace!(error = %e, "Health probe attempt failed, retrying"),
            }
            if started.elapsed() >= timeout {
                return Err(Error::HealthCheckTimeout(format!(
                    "Backend not ready after {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll the secondary readiness endpoint until the ML tier comes up or
    /// `timeout` elapses. Never fails; the outcome says which happened.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn poll_ml_readiness(&self, timeout: Duration) -> MlReadiness {
        let url = format!("{}/readiness", self.base_url);
        let started = tokio::time::Instant::now();
        loop {
            let ready = match self
                .client
                .get(&url)
                .timeout(PROBE_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => response
                    .json::<ReadinessReport>()
                    .await
                    .map(|r| r.ml_ready)
                    .unwrap_or(false),
                _ => false,
            };
            if ready {
                tracing::info!("Backend reported ML readiness");
                return MlReadiness::Ready;
            }
            if started.elapsed() >= timeout {
                tracing::warn!("ML readiness poll timed out, backend remains usable without the ML tier");
                return MlReadiness::TimedOut;
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
