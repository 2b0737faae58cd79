//! Health snapshot of a running service.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::extractor::DataTypeProgress;
use crate::resilience::{CircuitState, ConnectionHealth};
use crate::workers::{ConsumerState, ConsumerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The service makes progress, slower than usual or with a dependency recovering.
    Degraded,
    /// A dependency is unavailable and its circuit breaker rejects calls.
    Unhealthy,
}

/// Report rendered by the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub connections: Vec<ConnectionHealth>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extraction: Vec<DataTypeProgress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub consumers: Vec<ConsumerStatus>,
}

impl ServiceHealth {
    pub fn new(
        service: impl Into<String>,
        connections: Vec<ConnectionHealth>,
        extraction: Vec<DataTypeProgress>,
        consumers: Vec<ConsumerStatus>,
    ) -> Self {
        let status = overall_status(&connections, &extraction, &consumers);

        Self {
            service: service.into(),
            status,
            timestamp: Utc::now(),
            connections,
            extraction,
            consumers,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

fn overall_status(
    connections: &[ConnectionHealth],
    extraction: &[DataTypeProgress],
    consumers: &[ConsumerStatus],
) -> HealthStatus {
    if connections
        .iter()
        .any(|connection| connection.circuit_breaker.state == CircuitState::Open)
    {
        return HealthStatus::Unhealthy;
    }

    let connection_degraded = connections.iter().any(|connection| {
        connection.circuit_breaker.state == CircuitState::HalfOpen
            || (connection.last_check.is_some() && !connection.healthy)
    });
    let stalled = extraction.iter().any(|progress| progress.stalled);
    let paused = consumers
        .iter()
        .any(|consumer| consumer.paused && consumer.state != ConsumerState::Cancelled);

    if connection_degraded || stalled || paused {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
