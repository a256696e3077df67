//! Threat events ingested from the detection pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Typed event from the anomaly/threat detector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Event type, e.g. "brute_force" or "tunnel_anomaly"
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    /// Identity of the underlying incident (source address, peer id, ...)
    pub correlation_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ThreatEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: Severity,
        correlation_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            severity,
            correlation_key: correlation_key.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_event_deserialization_defaults() {
        let json = r#"{"type":"brute_force","severity":"high","correlation_key":"10.0.0.7"}"#;
        let event: ThreatEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "brute_force");
        assert_eq!(event.severity, Severity::High);
        assert!(event.payload.is_null());
    }
}
