use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered from best to worst, so the overall status is the maximum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, ServiceHealth>,
}

/// Broker connection as last published by the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerHealth {
    pub state: String,
    /// Bumped on every successful (re)connect; a jump means the consumer
    /// had to register again.
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    fn new(status: HealthStatus) -> Self {
        Self {
            status,
            response_time_ms: None,
            broker: None,
            error: None,
        }
    }

    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            response_time_ms: Some(response_time_ms),
            ..Self::new(HealthStatus::Healthy)
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(HealthStatus::Degraded)
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(HealthStatus::Unhealthy)
        }
    }

    /// Broker check result. Only a connected broker is healthy; an
    /// in-progress (re)connect degrades.
    pub fn broker(status: HealthStatus, state: impl Into<String>, generation: u64) -> Self {
        let error = match status {
            HealthStatus::Healthy => None,
            HealthStatus::Degraded => Some("Broker connection is being re-established".to_string()),
            HealthStatus::Unhealthy => Some("Broker connection closed".to_string()),
        };

        Self {
            broker: Some(BrokerHealth {
                state: state.into(),
                generation,
            }),
            error,
            ..Self::new(status)
        }
    }
}
