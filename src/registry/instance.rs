use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Instance health, ordered best to worst for selection purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Excluded from discovery and selection entirely
    Offline,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// How an instance wants to be probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub endpoint: String,
    /// Probe period in milliseconds
    #[serde(rename = "interval")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval_ms: 30_000,
            timeout_ms: 5_000,
            retries: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub environment: String,
}

/// One running, addressable deployment of a named logical service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub metadata: InstanceMetadata,
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: "1.0.0".to_string(),
            host: host.into(),
            port,
            protocol: "http".to_string(),
            health_check: HealthCheckConfig::default(),
            metadata: InstanceMetadata::default(),
            status: HealthStatus::Healthy,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn health_check_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_check.endpoint)
    }

    /// Whether load balancing may route to this instance at all.
    pub fn is_routable(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let mut instance = ServiceInstance::new("svc-a", "10.0.0.5", 8080);
        assert_eq!(instance.base_url(), "http://10.0.0.5:8080");

        instance.protocol = "https".to_string();
        assert_eq!(instance.base_url(), "https://10.0.0.5:8080");
    }

    #[test]
    fn test_health_check_url() {
        let instance = ServiceInstance::new("svc-a", "localhost", 3000);
        assert_eq!(instance.health_check_url(), "http://localhost:3000/health");
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::from_str::<HealthStatus>("\"offline\"").unwrap(),
            HealthStatus::Offline
        );
    }

    #[test]
    fn test_routability() {
        let mut instance = ServiceInstance::new("svc-a", "localhost", 3000);
        assert!(instance.is_routable());
        instance.status = HealthStatus::Degraded;
        assert!(instance.is_routable());
        instance.status = HealthStatus::Unhealthy;
        assert!(!instance.is_routable());
        instance.status = HealthStatus::Offline;
        assert!(!instance.is_routable());
    }

    #[test]
    fn test_instance_serde_round_trip() {
        let instance = ServiceInstance::new("svc-a", "localhost", 3000);
        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"interval\":30000"));
        let back: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, instance.id);
        assert_eq!(back.status, HealthStatus::Healthy);
    }
}
