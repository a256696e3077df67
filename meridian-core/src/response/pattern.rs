//! Threat response patterns and payload predicates

use crate::models::event::{Severity, ThreatEvent};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Comparison applied to one payload field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Equals,
    NotEquals,
    Exists,
    GreaterThan,
    LessThan,
    /// Substring for strings, membership for arrays
    Contains,
    OneOf,
}

/// Predicate over a dotted path into the event payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldPredicate {
    pub field: String,
    pub op: PredicateOp,
    #[serde(default)]
    pub value: Value,
}

impl FieldPredicate {
    pub fn new(field: impl Into<String>, op: PredicateOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn matches(&self, payload: &Value) -> bool {
        let found = lookup(payload, &self.field);
        match self.op {
            PredicateOp::Exists => found.is_some_and(|v| !v.is_null()),
            PredicateOp::Equals => found == Some(&self.value),
            PredicateOp::NotEquals => found != Some(&self.value),
            PredicateOp::GreaterThan => compare(found, &self.value).is_some_and(|(a, b)| a > b),
            PredicateOp::LessThan => compare(found, &self.value).is_some_and(|(a, b)| a < b),
            PredicateOp::Contains => match (found, &self.value) {
                (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            PredicateOp::OneOf => match (found, &self.value) {
                (Some(v), Value::Array(options)) => options.contains(v),
                _ => false,
            },
        }
    }
}

fn compare(found: Option<&Value>, bound: &Value) -> Option<(f64, f64)> {
    Some((found?.as_f64()?, bound.as_f64()?))
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Maps a class of threat events to a response workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatResponsePattern {
    pub id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<FieldPredicate>,
    pub severity: Severity,
    /// Name of the workflow definition to instantiate
    pub workflow: String,
    /// Suppression window per correlation key, fractions allowed; engine
    /// default when unset or not a valid duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<f64>,
}

impl ThreatResponsePattern {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        severity: Severity,
        workflow: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            predicates: Vec::new(),
            severity,
            workflow: workflow.into(),
            cooldown_seconds: None,
        }
    }

    pub fn with_predicate(mut self, predicate: FieldPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_seconds = Some(cooldown.as_secs_f64());
        self
    }

    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn matches(&self, event: &ThreatEvent) -> bool {
        self.event_type == event.event_type && self.predicates.iter().all(|p| p.matches(&event.payload))
    }
}

/// YAML document holding a list of patterns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSet {
    #[serde(default)]
    pub patterns: Vec<ThreatResponsePattern>,
}

impl PatternSet {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("invalid pattern set YAML")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pattern set {}", path.display()))?;
        Self::from_yaml(&content)
    }
}
