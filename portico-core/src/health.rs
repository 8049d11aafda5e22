//! Health probe types
//!
//! Shared by the gateway (which answers probes) and the client-side monitor
//! (which schedules them and fans results out to listeners).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse liveness of the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Backend answered within the latency budget
    Ok,
    /// Backend answered, but slowly or with a self-reported degradation
    Degraded,
    /// Probe failed or timed out
    Down,
}

/// Result of one completed probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub provider: String,
}

impl HealthStatus {
    pub fn ok(provider: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status: HealthState::Ok,
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
            provider: provider.into(),
        }
    }

    pub fn degraded(provider: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status: HealthState::Degraded,
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
            provider: provider.into(),
        }
    }

    /// A failed probe never carries a latency.
    pub fn down(provider: impl Into<String>) -> Self {
        Self {
            status: HealthState::Down,
            timestamp: Utc::now(),
            latency_ms: None,
            provider: provider.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthState::Ok
    }
}

/// What an adapter reports when it answers a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReport {
    Healthy,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_has_no_latency() {
        let status = HealthStatus::down("supabase");
        assert_eq!(status.status, HealthState::Down);
        assert!(status.latency_ms.is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let status = HealthStatus::ok("memory", 12);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["latencyMs"], 12);
        assert_eq!(json["provider"], "memory");
        assert!(json.get("timestamp").is_some());

        let down = serde_json::to_value(HealthStatus::down("memory")).unwrap();
        assert_eq!(down["status"], "down");
        assert!(down.get("latencyMs").is_none());
    }
}
