//! Workflow validation logic

use crate::models::workflow::{RetryPolicy, WorkflowDefinition};
use std::collections::{HashMap, HashSet};

/// Validation error type
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: String, message: String) {
        self.errors.push(ValidationError { field, message });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Errors rendered as `field: message`
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// Workflow validator
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Validate retry policy
    /// - max_attempts: 1-10
    /// - initial_delay_ms: at most 300s
    /// - backoff_multiplier: 1.0-10.0
    pub fn validate_retry_policy(policy: &RetryPolicy) -> ValidationResult {
        let mut result = ValidationResult::new();

        if policy.max_attempts < 1 {
            result.add_error(
                "max_attempts".to_string(),
                "max_attempts must be at least 1".to_string(),
            );
        }
        if policy.max_attempts > 10 {
            result.add_error(
                "max_attempts".to_string(),
                "max_attempts cannot exceed 10".to_string(),
            );
        }

        if policy.initial_delay_ms > 300_000 {
            result.add_error(
                "initial_delay_ms".to_string(),
                "initial_delay_ms cannot exceed 300000".to_string(),
            );
        }

        if policy.backoff_multiplier < 1.0 || policy.backoff_multiplier > 10.0 {
            result.add_error(
                "backoff_multiplier".to_string(),
                "backoff_multiplier must be between 1.0 and 10.0".to_string(),
            );
        }

        if policy.max_delay_ms < policy.initial_delay_ms {
            result.add_warning(format!(
                "max_delay_ms ({}) is below initial_delay_ms ({}); every retry waits max_delay_ms",
                policy.max_delay_ms, policy.initial_delay_ms
            ));
        }

        if policy.exponential_backoff && policy.backoff_multiplier > 3.0 {
            result.add_warning(format!(
                "High backoff_multiplier ({}) with exponential backoff may reach max delay quickly",
                policy.backoff_multiplier
            ));
        }

        result
    }

    /// Validate workflow definition
    pub fn validate_workflow(workflow: &WorkflowDefinition) -> ValidationResult {
        let mut result = ValidationResult::new();

        if workflow.name.is_empty() {
            result.add_error(
                "name".to_string(),
                "Workflow name cannot be empty".to_string(),
            );
        }

        if workflow.steps.is_empty() {
            result.add_error(
                "steps".to_string(),
                "Workflow must declare at least one step".to_string(),
            );
        }

        if workflow.max_concurrency == Some(0) {
            result.add_error(
                "max_concurrency".to_string(),
                "max_concurrency must be at least 1".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if step.id.is_empty() {
                result.add_error("steps".to_string(), "Step id cannot be empty".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                result.add_error(
                    format!("steps.{}", step.id),
                    format!("Duplicate step id '{}'", step.id),
                );
            }
        }

        for step in &workflow.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    result.add_error(
                        format!("steps.{}.depends_on", step.id),
                        "Step cannot depend on itself".to_string(),
                    );
                } else if workflow.step(dep).is_none() {
                    result.add_error(
                        format!("steps.{}.depends_on", step.id),
                        format!("Dependency '{}' not found", dep),
                    );
                }
            }

            if let Some(retry_policy) = &step.retry_policy {
                let policy_validation = Self::validate_retry_policy(retry_policy);
                for error in policy_validation.errors {
                    result.add_error(
                        format!("steps.{}.retry_policy.{}", step.id, error.field),
                        error.message,
                    );
                }
                for warning in policy_validation.warnings {
                    result.add_warning(format!("Step '{}': {}", step.id, warning));
                }
            }

            if step.timeout_ms == Some(0) {
                result.add_error(
                    format!("steps.{}.timeout_ms", step.id),
                    "timeout_ms must be greater than 0".to_string(),
                );
            }

            if step.action.is_remediation() && step.compensation.is_none() {
                result.add_warning(format!(
                    "Step '{}' performs '{}' but declares no compensation; it cannot be rolled back",
                    step.id, step.action
                ));
            }
        }

        if let Some(cycle) = Self::detect_circular_dependencies(workflow) {
            result.add_error(
                "steps".to_string(),
                format!(
                    "Circular dependency detected: {} → {}",
                    cycle.join(" → "),
                    cycle[0]
                ),
            );
        }

        result
    }

    /// Detect dependency cycles using DFS; returns the cycle path if any
    pub fn detect_circular_dependencies(workflow: &WorkflowDefinition) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn dfs<'a>(
            node: &'a str,
            workflow: &'a WorkflowDefinition,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::Visiting);
            path.push(node);

            if let Some(step) = workflow.step(node) {
                for dep in &step.depends_on {
                    // Self-dependencies and unknown deps are reported separately
                    if dep == node || workflow.step(dep).is_none() {
                        continue;
                    }
                    match marks.get(dep.as_str()) {
                        Some(Mark::Visiting) => {
                            let start = path.iter().position(|n| *n == dep.as_str())?;
                            return Some(path[start..].iter().map(|s| s.to_string()).collect());
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if let Some(cycle) = dfs(dep, workflow, marks, path) {
                                return Some(cycle);
                            }
                        }
                    }
                }
            }

            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for step in &workflow.steps {
            if !marks.contains_key(step.id.as_str()) {
                let mut path = Vec::new();
                if let Some(cycle) = dfs(&step.id, workflow, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Dependency order of step ids, ties broken by declaration order.
    /// Returns `None` when the graph has a cycle.
    pub fn topological_order(workflow: &WorkflowDefinition) -> Option<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = workflow
            .steps
            .iter()
            .map(|s| {
                let known = s
                    .depends_on
                    .iter()
                    .filter(|d| workflow.step(d).is_some())
                    .count();
                (s.id.as_str(), known)
            })
            .collect();

        let mut order = Vec::with_capacity(workflow.steps.len());
        while order.len() < workflow.steps.len() {
            let next = workflow
                .steps
                .iter()
                .find(|s| remaining.get(s.id.as_str()) == Some(&0))?;
            remaining.remove(next.id.as_str());
            for step in &workflow.steps {
                if step.depends_on.contains(&next.id) {
                    if let Some(count) = remaining.get_mut(step.id.as_str()) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            order.push(next.id.clone());
        }
        Some(order)
    }
}
