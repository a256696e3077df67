//! Configuration data structures

use crate::models::region::RegionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// Weights used by the global load balancer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerSettings {
    pub load_weight: f64,
    pub error_weight: f64,
    pub latency_weight: f64,
    /// Latency at which the latency score drops to 0.5
    pub latency_reference_ms: f64,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            load_weight: 0.5,
            error_weight: 0.3,
            latency_weight: 0.2,
            latency_reference_ms: 100.0,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Identifier of the local region
    pub region_id: String,
    /// Endpoint peers use to reach this region
    pub endpoint: String,
    /// Maximum active workflows in this region
    pub capacity: u32,
    /// Peer regions
    pub peers: Vec<RegionConfig>,
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// Global worker pool size (concurrent step actions)
    pub worker_pool_size: usize,
    /// Default per-workflow step concurrency
    pub workflow_concurrency: usize,
    /// Default per-attempt step timeout
    pub step_timeout_ms: u64,
    /// Heartbeat interval for region health reporting
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a region is unreachable
    pub missed_heartbeat_threshold: u32,
    /// Error rate above which a region is degraded
    pub degraded_error_rate: f64,
    /// Execution lease time-to-live
    pub lease_ttl_ms: u64,
    /// Anti-entropy gossip interval
    pub gossip_interval_ms: u64,
    /// Per-region timeout for cross-region workflows
    pub region_timeout_seconds: u64,
    /// Default cooldown for threat response patterns
    pub pattern_cooldown_seconds: u64,
    /// Load balancer weights
    pub balancer: BalancerSettings,
    /// Audit log location (JSON lines); in-memory when unset
    pub audit_store_path: Option<PathBuf>,
    /// Audit entries kept in memory for queries; the file keeps all of them
    pub audit_retained_entries: usize,
    /// Archived executions kept in memory for status and metrics
    pub audit_retained_executions: usize,
    /// Status API bind address
    pub api_host: String,
    /// Status API port number
    pub api_port: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            region_id: "local".to_string(),
            endpoint: "http://127.0.0.1:7400".to_string(),
            capacity: 100,
            peers: Vec::new(),
            log_level: LogLevel::Info,
            worker_pool_size: 32,
            workflow_concurrency: 4,
            step_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            missed_heartbeat_threshold: 3,
            degraded_error_rate: 0.25,
            lease_ttl_ms: 2_000,
            gossip_interval_ms: 500,
            region_timeout_seconds: 300,
            pattern_cooldown_seconds: 300,
            balancer: BalancerSettings::default(),
            audit_store_path: None,
            audit_retained_entries: 10_000,
            audit_retained_executions: 1_000,
            api_host: "127.0.0.1".to_string(),
            api_port: 7400,
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Configuration = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("meridian").join("config.toml"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn region_timeout(&self) -> Duration {
        Duration::from_secs(self.region_timeout_seconds)
    }

    pub fn pattern_cooldown(&self) -> Duration {
        Duration::from_secs(self.pattern_cooldown_seconds)
    }

    /// Static description of the local region
    pub fn local_region(&self) -> RegionConfig {
        RegionConfig::new(self.region_id.clone(), self.endpoint.clone(), self.capacity)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !is_valid_region_id(&self.region_id) {
            errors.push("region_id must match region naming convention".to_string());
        }

        for peer in &self.peers {
            if !is_valid_region_id(&peer.id) {
                errors.push(format!("peer '{}' has an invalid region id", peer.id));
            }
            if peer.id == self.region_id {
                errors.push(format!("peer '{}' duplicates the local region", peer.id));
            }
        }

        if self.capacity == 0 {
            errors.push("capacity must be at least 1".to_string());
        }

        if self.worker_pool_size == 0 || self.worker_pool_size > 1024 {
            errors.push("worker_pool_size must be between 1 and 1024".to_string());
        }

        if self.workflow_concurrency == 0 {
            errors.push("workflow_concurrency must be at least 1".to_string());
        }

        if self.heartbeat_interval_ms < 10 {
            errors.push("heartbeat_interval_ms must be at least 10".to_string());
        }

        if self.missed_heartbeat_threshold == 0 {
            errors.push("missed_heartbeat_threshold must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.degraded_error_rate) {
            errors.push("degraded_error_rate must be between 0.0 and 1.0".to_string());
        }

        // Renewal runs at a third of the TTL; anything shorter than a heartbeat
        // makes leases flap under ordinary scheduling jitter.
        if self.lease_ttl_ms < self.heartbeat_interval_ms / 2 {
            errors.push("lease_ttl_ms must be at least half the heartbeat interval".to_string());
        }

        let weights = &self.balancer;
        if weights.load_weight < 0.0 || weights.error_weight < 0.0 || weights.latency_weight < 0.0
        {
            errors.push("balancer weights cannot be negative".to_string());
        }
        if weights.load_weight + weights.error_weight + weights.latency_weight <= 0.0 {
            errors.push("balancer weights must not all be zero".to_string());
        }
        if weights.latency_reference_ms <= 0.0 {
            errors.push("balancer latency_reference_ms must be positive".to_string());
        }

        if self.audit_retained_entries == 0 || self.audit_retained_executions == 0 {
            errors.push("audit retention limits must be at least 1".to_string());
        }

        if self.api_port < 1024 {
            errors.push("api_port must be at least 1024 (privileged ports not allowed)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Validate region id according to naming convention
fn is_valid_region_id(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }

    let Some(first_char) = name.chars().next() else {
        return false;
    };
    if !first_char.is_ascii_alphanumeric() {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.region_id, "local");
        assert_eq!(config.missed_heartbeat_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_validation() {
        let config = Configuration {
            region_id: "bad region!".to_string(),
            worker_pool_size: 0,
            degraded_error_rate: 1.5,
            audit_retained_entries: 0,
            api_port: 80,
            ..Configuration::default()
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("region_id")));
        assert!(errors.iter().any(|e| e.contains("worker_pool_size")));
        assert!(errors.iter().any(|e| e.contains("degraded_error_rate")));
        assert!(errors.iter().any(|e| e.contains("api_port")));
        assert!(errors.iter().any(|e| e.contains("audit retention")));
    }

    #[test]
    fn test_region_id_validation() {
        assert!(is_valid_region_id("eu-west-1"));
        assert!(is_valid_region_id("us_east"));
        assert!(!is_valid_region_id(""));
        assert!(!is_valid_region_id("-leading"));
        assert!(!is_valid_region_id("has space"));
        assert!(!is_valid_region_id(&"a".repeat(65)));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Configuration = toml::from_str(
            r#"
region_id = "eu-west"
heartbeat_interval_ms = 250

[[peers]]
id = "us-east"
endpoint = "http://10.1.0.4:7400"
capacity = 50
"#,
        )
        .unwrap();
        assert_eq!(config.region_id, "eu-west");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.lease_ttl_ms, 2_000);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let config = Configuration {
            region_id: "ap-south".to_string(),
            capacity: 12,
            ..Configuration::default()
        };

        config.save_to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded_config = Configuration::load_from_file(&config_path).unwrap();
        assert_eq!(loaded_config.region_id, "ap-south");
        assert_eq!(loaded_config.capacity, 12);
    }
}
