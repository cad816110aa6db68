//! Application-level liveness probes.
//!
//! Health failures are logged and nothing else. Restarts are driven only by
//! OS-level exit detection in the supervisor, so a service that is up but
//! degraded (for example unauthenticated) keeps running and may recover.

use crate::catch::Catch;
use crate::supervisor::{ProbeTarget, ProcessTableReader};
use crate::{HubError, SupervisorConfig};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Body of `GET /health` on every service host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub service: String,
    /// ISO-8601
    pub timestamp: String,
    pub auth_status: String,
    pub connections: usize,
}

#[derive(Debug)]
pub enum HealthOutcome {
    Healthy(HealthReport),
    /// Non-200 answer, a body reporting `unhealthy`, or a body that does not parse
    Unhealthy {
        status: u16,
        report: Option<HealthReport>,
    },
    /// No HTTP answer within the probe timeout
    Unreachable(HubError),
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy(_))
    }
}

pub struct HealthMonitor {
    reader: ProcessTableReader,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(reader: ProcessTableReader, config: &SupervisorConfig) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout())
            .build()
            .catch()?;

        Ok(Self {
            reader,
            client,
            interval: config.health_interval(),
        })
    }

    pub async fn probe(&self, target: &ProbeTarget) -> HealthOutcome {
        let response = match self.client.get(&target.health_url).send().await.catch() {
            Ok(response) => response,
            Err(e) => return HealthOutcome::Unreachable(e),
        };

        let status = response.status();
        let report = response.json::<HealthReport>().await.ok();
        match report {
            Some(report) if status == StatusCode::OK && report.status == HealthState::Healthy => {
                HealthOutcome::Healthy(report)
            }
            report => HealthOutcome::Unhealthy {
                status: status.as_u16(),
                report,
            },
        }
    }

    /// Probe every `Running` service once, in port order
    pub async fn probe_all(&self) -> Vec<(ProbeTarget, HealthOutcome)> {
        let mut outcomes = Vec::new();
        for target in self.reader.probe_targets().await {
            let outcome = self.probe(&target).await;
            match &outcome {
                HealthOutcome::Healthy(report) => debug!(
                    service = %target.name,
                    auth_status = %report.auth_status,
                    connections = report.connections,
                    "Health check passed"
                ),
                HealthOutcome::Unhealthy { status, report } => warn!(
                    service = %target.name,
                    status,
                    auth_status = report.as_ref().map(|r| r.auth_status.as_str()),
                    "Health check failed"
                ),
                HealthOutcome::Unreachable(e) => {
                    warn!(service = %target.name, error = %e, "Health check unreachable")
                }
            }
            outcomes.push((target, outcome));
        }
        outcomes
    }

    pub async fn run(&self, token: CancellationToken) -> Result<(), HubError> {
        info!(interval = ?self.interval, "Health monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let outcomes = self.probe_all().await;
            let healthy = outcomes.iter().filter(|(_, o)| o.is_healthy()).count();
            info!(healthy, probed = outcomes.len(), "Health check cycle complete");
        }

        info!("Health monitor stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::ProcessSupervisor;
    use crate::{ServiceDescriptor, ServiceRegistry};
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::get};

    fn report(status: HealthState) -> HealthReport {
        HealthReport {
            status,
            service: "sheets".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            auth_status: "not_authenticated".to_string(),
            connections: 0,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        format!("http://{addr}/health")
    }

    fn target(url: String) -> ProbeTarget {
        ProbeTarget {
            name: "sheets".to_string(),
            port: 0,
            health_url: url,
        }
    }

    async fn monitor() -> (ProcessSupervisor, HealthMonitor) {
        let registry = ServiceRegistry::new(vec![
            ServiceDescriptor::builder()
                .name("idle")
                .command("sh")
                .args(["-c", "sleep 30"])
                .port(18201u16)
                .build()
                .unwrap(),
        ])
        .unwrap();
        let config = SupervisorConfig {
            settle_interval_ms: 100,
            health_timeout_ms: 500,
            ..Default::default()
        };
        let supervisor = ProcessSupervisor::new(registry, config.clone()).unwrap();
        let monitor = HealthMonitor::new(supervisor.reader(), &config).unwrap();
        (supervisor, monitor)
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let url = serve(Router::new().route(
            "/health",
            get(|| async { Json(report(HealthState::Healthy)) }),
        ))
        .await;
        let (_supervisor, monitor) = monitor().await;

        let outcome = monitor.probe(&target(url)).await;
        assert!(outcome.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_non_200_is_unhealthy() {
        let url = serve(Router::new().route(
            "/health",
            get(|| async {
                (
                    AxumStatus::SERVICE_UNAVAILABLE,
                    Json(report(HealthState::Unhealthy)),
                )
            }),
        ))
        .await;
        let (_supervisor, monitor) = monitor().await;

        match monitor.probe(&target(url)).await {
            HealthOutcome::Unhealthy { status, report } => {
                assert_eq!(status, 503);
                assert_eq!(report.unwrap().status, HealthState::Unhealthy);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_malformed_body_is_unhealthy() {
        let url = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let (_supervisor, monitor) = monitor().await;

        assert!(matches!(
            monitor.probe(&target(url)).await,
            HealthOutcome::Unhealthy {
                status: 200,
                report: None
            }
        ));
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_touch_process() {
        let (supervisor, monitor) = monitor().await;
        assert!(supervisor.start_all().await.is_complete());

        // Nothing listens on the service port, so the probe fails
        let outcomes = monitor.probe_all().await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].1, HealthOutcome::Unreachable(_)));

        let snapshot = supervisor.reader().get("idle").await.unwrap();
        assert_eq!(snapshot.status, crate::supervisor::ServiceStatus::Running);
        assert!(supervisor.detect_crash().await.is_empty());

        supervisor.terminate_all(Duration::from_secs(2)).await;
    }
}
