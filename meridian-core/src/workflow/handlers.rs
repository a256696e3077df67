//! Built-in action handlers

use super::actions::{ActionHandler, ActionRequest};
use crate::error::{ActionError, ActionResult};
use crate::models::workflow::ActionKind;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Handles `noop`
pub struct NoopHandler;

#[async_trait]
impl ActionHandler for NoopHandler {
    fn name(&self) -> &str {
        "noop"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        vec![ActionKind::Noop]
    }

    async fn execute(&self, _request: &ActionRequest) -> ActionResult<Value> {
        Ok(Value::Null)
    }
}

/// Writes `notify` actions to the log
pub struct LogNotifier;

#[async_trait]
impl ActionHandler for LogNotifier {
    fn name(&self) -> &str {
        "log-notifier"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        vec![ActionKind::Notify]
    }

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value> {
        let message = request
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("workflow notification");
        let channel = request
            .params
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or("default");
        tracing::info!(
            workflow_id = %request.workflow_id,
            step_id = %request.step_id,
            channel = channel,
            compensation = request.compensation,
            "{}",
            message
        );
        Ok(json!({ "delivered": true, "channel": channel }))
    }
}

/// POSTs `webhook` actions to `params.url`
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        vec![ActionKind::Webhook]
    }

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value> {
        let url = request
            .params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::Permanent("webhook requires a 'url' parameter".to_string()))?;
        let body = request.params.get("body").cloned().unwrap_or_else(|| {
            json!({
                "workflow_id": request.workflow_id,
                "step_id": request.step_id,
                "region": request.region,
            })
        });

        let res = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ActionError::Transient(format!("webhook request failed: {}", e)))?;

        let status = res.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ActionError::Transient(format!("webhook returned {}", status)));
        }
        if !status.is_success() {
            return Err(ActionError::Permanent(format!("webhook returned {}", status)));
        }
        Ok(json!({ "status": status.as_u16() }))
    }
}

/// Records remediation actions without touching the network
pub struct DryRunRemediation {
    invocations: AtomicU64,
}

impl DryRunRemediation {
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Default for DryRunRemediation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for DryRunRemediation {
    fn name(&self) -> &str {
        "dry-run-remediation"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        ActionKind::ALL
            .into_iter()
            .filter(|k| k.is_remediation() || *k == ActionKind::ScoreThreat)
            .collect()
    }

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            workflow_id = %request.workflow_id,
            step_id = %request.step_id,
            action = %request.kind,
            params = %request.params,
            "Dry-run remediation"
        );
        Ok(json!({
            "dry_run": true,
            "action": request.kind,
            "params": request.params,
        }))
    }
}
