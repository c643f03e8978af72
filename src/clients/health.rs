use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    broker::connection::{ConnectionManager, ConnectionState},
    clients::{Cache, NotificationRepository},
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

#[derive(Clone)]
pub struct HealthChecker {
    repository: Arc<dyn NotificationRepository>,
    cache: Arc<dyn Cache>,
    connection: Arc<ConnectionManager>,
}

impl HealthChecker {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        cache: Arc<dyn Cache>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            repository,
            cache,
            connection,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("cache_service".to_string(), self.check_cache().await);
        checks.insert("message_broker".to_string(), self.check_broker());

        let status = determine_overall_status(&checks);

        HealthCheckResponse {
            status,
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.repository.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_cache(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.cache.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    /// Reads the connection manager's state; no extra broker round trip.
    fn check_broker(&self) -> ServiceHealth {
        let status = self.connection.status();

        let health = match status.state {
            ConnectionState::Connected => HealthStatus::Healthy,
            ConnectionState::Connecting | ConnectionState::Reconnecting => HealthStatus::Degraded,
            ConnectionState::Disconnected => HealthStatus::Unhealthy,
        };

        if health != HealthStatus::Healthy {
            warn!(state = %status.state, generation = status.generation, "Broker not connected");
        }

        ServiceHealth::broker(health, status.state.to_string(), status.generation)
    }
}

pub fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    checks
        .values()
        .map(|health| health.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}
