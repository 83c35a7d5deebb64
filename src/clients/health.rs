use std::{collections::HashMap, future::Future, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    circuit_breaker::CircuitBreaker,
    error::DispatchError,
    idempotency::IdempotencyStore,
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
    queue::QueueFabric,
    records::RecordStore,
};

const CRITICAL: [&str; 3] = ["record_store", "idempotency_store", "message_broker"];

pub struct HealthChecker {
    records: Arc<dyn RecordStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    fabric: Arc<dyn QueueFabric>,
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl HealthChecker {
    pub fn new(
        records: Arc<dyn RecordStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        fabric: Arc<dyn QueueFabric>,
        breakers: Vec<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            records,
            idempotency,
            fabric,
            breakers,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert(
            "record_store".to_string(),
            Self::check("record_store", self.records.ping()).await,
        );
        checks.insert(
            "idempotency_store".to_string(),
            Self::check("idempotency_store", self.idempotency.ping()).await,
        );
        checks.insert(
            "message_broker".to_string(),
            Self::check("message_broker", self.fabric.ping()).await,
        );

        for breaker in &self.breakers {
            checks.insert(
                format!("circuit:{}", breaker.name()),
                self.check_circuit_breaker(breaker).await,
            );
        }

        HealthCheckResponse {
            status: determine_overall_status(&checks),
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check<F>(name: &str, ping: F) -> ServiceHealth
    where
        F: Future<Output = Result<(), DispatchError>>,
    {
        let start = Instant::now();

        match ping.await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(dependency = name, response_time_ms = elapsed, "Health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(dependency = name, error = %e, "Health check failed");
                ServiceHealth::unhealthy(e.to_string())
            }
        }
    }

    async fn check_circuit_breaker(&self, breaker: &CircuitBreaker) -> ServiceHealth {
        match breaker.snapshot().await {
            Ok(snapshot) => {
                debug!(
                    breaker = %snapshot.name,
                    circuit_state = snapshot.state.as_str(),
                    "Circuit breaker state checked"
                );

                match snapshot.state {
                    CircuitState::Closed => {
                        ServiceHealth::circuit(snapshot.state.as_str(), HealthStatus::Healthy)
                    }
                    CircuitState::HalfOpen => {
                        ServiceHealth::circuit(snapshot.state.as_str(), HealthStatus::Degraded)
                            .with_error("Circuit breaker in recovery mode".to_string())
                    }
                    CircuitState::Open => {
                        ServiceHealth::circuit(snapshot.state.as_str(), HealthStatus::Degraded)
                            .with_error(format!(
                                "Provider unavailable after {} consecutive failures",
                                snapshot.consecutive_failures
                            ))
                    }
                }
            }
            Err(e) => {
                warn!(breaker = breaker.name(), error = %e, "Failed to check circuit breaker state");
                ServiceHealth::circuit("unknown", HealthStatus::Degraded)
                    .with_error(format!("Cannot check circuit breaker: {}", e))
            }
        }
    }
}

/// Unhealthy if a critical dependency is down, degraded if anything else
/// is unhealthy or degraded.
pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| CRITICAL.contains(&name.as_str()))
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    let has_problem = checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if has_problem {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
