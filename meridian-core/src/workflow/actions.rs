//! Action dispatch boundary
//!
//! Every external side effect of a workflow goes through an [`ActionHandler`]
//! looked up by [`ActionKind`]. Handlers declare the kinds they serve and the
//! registry refuses to bind a handler to a kind it did not declare.

use crate::error::{ActionError, ActionResult, RegistryError};
use crate::models::workflow::{ActionKind, WorkflowDefinition};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One action invocation
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub params: Value,
    pub workflow_id: Uuid,
    pub step_id: String,
    /// One-based attempt number
    pub attempt: u32,
    /// True when running a compensating action
    pub compensation: bool,
    pub region: String,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, params: Value) -> Self {
        Self {
            kind,
            params,
            workflow_id: Uuid::nil(),
            step_id: String::new(),
            attempt: 1,
            compensation: false,
            region: String::new(),
        }
    }
}

/// Executes one or more action kinds
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handler name for diagnostics
    fn name(&self) -> &str;

    /// Action kinds this handler can execute
    fn kinds(&self) -> Vec<ActionKind>;

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value>;
}

/// Handler table keyed by action kind
#[derive(Default)]
pub struct ActionRegistry {
    handlers: DashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers (notifiers, dry-run remediation, noop)
    pub fn with_builtin_handlers() -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn ActionHandler>; 4] = [
            Arc::new(super::handlers::NoopHandler),
            Arc::new(super::handlers::LogNotifier),
            Arc::new(super::handlers::WebhookNotifier::new()),
            Arc::new(super::handlers::DryRunRemediation::new()),
        ];
        for handler in builtins {
            // Built-in handlers always declare at least one kind
            if let Err(e) = registry.register(handler) {
                tracing::error!(error = %e, "Failed to register built-in handler");
            }
        }
        registry
    }

    /// Register a handler for every kind it declares
    pub fn register(&self, handler: Arc<dyn ActionHandler>) -> Result<(), RegistryError> {
        let kinds = handler.kinds();
        if kinds.is_empty() {
            return Err(RegistryError::NoKinds(handler.name().to_string()));
        }
        for kind in kinds {
            tracing::debug!(handler = handler.name(), action = %kind, "Registered action handler");
            self.handlers.insert(kind, Arc::clone(&handler));
        }
        Ok(())
    }

    /// Register a handler for a single kind it must declare
    pub fn register_for(
        &self,
        kind: ActionKind,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), RegistryError> {
        if !handler.kinds().contains(&kind) {
            return Err(RegistryError::UndeclaredKind {
                handler: handler.name().to_string(),
                kind,
            });
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn has(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Step and compensation kinds of `definition` without a handler
    pub fn missing_kinds(&self, definition: &WorkflowDefinition) -> Vec<ActionKind> {
        let mut missing: Vec<ActionKind> = definition
            .steps
            .iter()
            .flat_map(|s| std::iter::once(s.action).chain(s.compensation.as_ref().map(|c| c.action)))
            .filter(|kind| !self.has(*kind))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Run an action with a timeout
    pub async fn execute(&self, request: &ActionRequest, timeout: Duration) -> ActionResult<Value> {
        let handler = self
            .handlers
            .get(&request.kind)
            .map(|h| Arc::clone(h.value()))
            .ok_or(ActionError::Unregistered(request.kind))?;

        match tokio::time::timeout(timeout, handler.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
