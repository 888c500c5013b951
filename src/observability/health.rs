//! Health check HTTP server for container orchestration
//!
//! `/health` aggregates MQTT, request activity and any registered component
//! checks (the idempotency store registers one); `/ready` follows the MQTT
//! connection; `/live` always answers; `/metrics` dumps the metrics snapshot.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const REQUEST_STALENESS_THRESHOLD_SECONDS: u64 = 300;

pub struct HealthServer {
    worker_id: String,
    port: u16,
    mqtt_connected: Arc<AtomicBool>,
    last_request_processed: Arc<AtomicU64>,
    additional_checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(worker_id: String, port: u16) -> Self {
        Self {
            worker_id,
            port,
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            last_request_processed: Arc::new(AtomicU64::new(0)),
            additional_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Record that a delivery reached a terminal state
    pub fn mark_request_processed(&self) {
        self.last_request_processed
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Add or replace a named component check
    pub async fn set_health_check(&self, name: &str, check: HealthCheck) {
        self.additional_checks
            .write()
            .await
            .insert(name.to_string(), check);
    }

    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        let ready_route = warp::path("ready").and(warp::get()).map(move || {
            let ready = ready_server.mqtt_connected.load(Ordering::Relaxed);
            let response = ReadinessResponse {
                ready,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
    }

    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let routes = self.routes();
        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
        Ok(())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert(
            "request_processing".to_string(),
            self.check_request_processing_health(),
        );
        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");
        metrics().update_health_status(healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            worker_id: self.worker_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        if self.mqtt_connected.load(Ordering::Relaxed) {
            HealthCheck::healthy("MQTT connection established")
        } else {
            HealthCheck::unhealthy("MQTT connection failed or disconnected")
        }
    }

    /// Idle workers are healthy; this only reports staleness
    fn check_request_processing_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let last = self.last_request_processed.load(Ordering::Relaxed);

        if last == 0 {
            HealthCheck::healthy("No requests processed yet")
        } else if now.saturating_sub(last) > REQUEST_STALENESS_THRESHOLD_SECONDS {
            HealthCheck {
                status: "stale".to_string(),
                message: Some(format!(
                    "No request activity for {} seconds",
                    now.saturating_sub(last)
                )),
                last_check: now,
            }
        } else {
            HealthCheck::healthy("Recent request activity")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    worker_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
