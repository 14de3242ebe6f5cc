//! Probe poller and the `/live` and `/ready` endpoints.
//!
//! Every round runs all probes. A round fails if any probe fails or times
//! out. Readiness drops on the first failed round; liveness drops once more
//! than `failure_threshold` consecutive rounds have failed. A passing round
//! resets the count.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::probe::Probe;

/// Poller settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Pause after a passing round.
    pub success_interval: Duration,
    /// Pause after a failing round.
    pub failure_interval: Duration,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            success_interval: Duration::from_secs(5),
            failure_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 5,
        }
    }
}

/// Polls registered probes and answers liveness/readiness.
#[derive(Clone)]
pub struct HealthService {
    probes: Arc<Vec<(String, Arc<dyn Probe>)>>,
    failures: Arc<AtomicU32>,
    settings: HealthSettings,
}

impl HealthService {
    pub fn new(probes: Vec<(String, Arc<dyn Probe>)>, settings: HealthSettings) -> Self {
        Self {
            probes: Arc::new(probes),
            failures: Arc::new(AtomicU32::new(0)),
            settings,
        }
    }

    /// Consecutive failed rounds.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn is_live(&self) -> bool {
        self.failure_count() <= self.settings.failure_threshold
    }

    /// Poll until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(probes = self.probes.len(), "Health poller starting");

        loop {
            let pause = if self.check_all().await {
                self.settings.success_interval
            } else {
                self.settings.failure_interval
            };

            tokio::select! {
                _ = time::sleep(pause) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Health poller stopped");
                    break;
                }
            }
        }
    }

    /// Run one round. Returns `true` if every probe passed.
    pub async fn check_all(&self) -> bool {
        let mut healthy = true;
        for (name, probe) in self.probes.iter() {
            match time::timeout(self.settings.probe_timeout, probe.check()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(probe = %name, error = %e, "Health check failed");
                    healthy = false;
                }
                Err(_) => {
                    tracing::warn!(probe = %name, "Health check timed out");
                    healthy = false;
                }
            }
        }

        if healthy {
            let previous = self.failures.swap(0, Ordering::Relaxed);
            if previous > 0 {
                tracing::info!(failed_rounds = previous, "Health recovered");
            }
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::gauge!("health_failed_rounds").set(f64::from(self.failure_count()));
        healthy
    }

    /// `/live` and `/ready`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/live", get(live))
            .route("/ready", get(ready))
            .with_state(self.clone())
    }
}

const UNHEALTHY: (StatusCode, &str) = (StatusCode::INTERNAL_SERVER_ERROR, "service unhealthy\n");

async fn live(State(health): State<HealthService>) -> (StatusCode, &'static str) {
    if health.is_live() {
        (StatusCode::OK, "")
    } else {
        UNHEALTHY
    }
}

async fn ready(State(health): State<HealthService>) -> (StatusCode, &'static str) {
    if health.is_ready() {
        (StatusCode::OK, "")
    } else {
        UNHEALTHY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BoxError;
    use axum::body::Body;
    use http::Request;
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    fn settings() -> HealthSettings {
        HealthSettings {
            success_interval: Duration::from_millis(10),
            failure_interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(50),
            failure_threshold: 2,
        }
    }

    async fn status_of(health: &HealthService, path: &str) -> StatusCode {
        health
            .router()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    fn flag_probe(up: Arc<AtomicBool>) -> Arc<dyn Probe> {
        Arc::new(move || {
            let up = up.clone();
            async move {
                if up.load(Ordering::SeqCst) {
                    Ok::<(), BoxError>(())
                } else {
                    Err("database unreachable".into())
                }
            }
        })
    }

    #[tokio::test]
    async fn readiness_drops_first_liveness_after_threshold() {
        let up = Arc::new(AtomicBool::new(true));
        let health = HealthService::new(vec![("db".to_string(), flag_probe(up.clone()))], settings());

        assert!(health.check_all().await);
        assert_eq!(status_of(&health, "/ready").await, StatusCode::OK);
        assert_eq!(status_of(&health, "/live").await, StatusCode::OK);

        up.store(false, Ordering::SeqCst);
        assert!(!health.check_all().await);
        assert_eq!(status_of(&health, "/ready").await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of(&health, "/live").await, StatusCode::OK);

        health.check_all().await;
        health.check_all().await;
        assert_eq!(health.failure_count(), 3);
        assert_eq!(status_of(&health, "/live").await, StatusCode::INTERNAL_SERVER_ERROR);

        up.store(true, Ordering::SeqCst);
        assert!(health.check_all().await);
        assert_eq!(health.failure_count(), 0);
        assert_eq!(status_of(&health, "/live").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let probe: Arc<dyn Probe> = Arc::new(|| async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<(), BoxError>(())
        });
        let health = HealthService::new(vec![("slow".to_string(), probe)], settings());
        assert!(!health.check_all().await);
        assert!(!health.is_ready());
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let up = Arc::new(AtomicBool::new(false));
        let health = HealthService::new(vec![("db".to_string(), flag_probe(up))], settings());
        let shutdown = CancellationToken::new();
        let poller = {
            let health = health.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { health.run(shutdown).await })
        };
        time::sleep(Duration::from_millis(40)).await;
        assert!(health.failure_count() >= 2);
        shutdown.cancel();
        poller.await.unwrap();
    }
}
