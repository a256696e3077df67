//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use meridian_core::context::RegionContext;
use meridian_core::distributed::{DistributedState, LeaseArbiter};
use meridian_core::error::{ActionError, ActionResult};
use meridian_core::models::configuration::Configuration;
use meridian_core::models::region::RegionConfig;
use meridian_core::models::workflow::ActionKind;
use meridian_core::workflow::{ActionHandler, ActionRegistry, ActionRequest, OrchestrationEngine};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// Test configuration with short timers
pub fn config(region: &str, peers: &[&str]) -> Configuration {
    Configuration {
        region_id: region.to_string(),
        endpoint: format!("http://{}.test:7400", region),
        capacity: 10,
        peers: peers
            .iter()
            .map(|p| RegionConfig::new(*p, format!("http://{}.test:7400", p), 10))
            .collect(),
        heartbeat_interval_ms: 100,
        lease_ttl_ms: 200,
        gossip_interval_ms: 50,
        ..Configuration::default()
    }
}

/// Build a region context and engine sharing `arbiter` and `actions`
pub fn region(
    config: Configuration,
    arbiter: Arc<DistributedState>,
    actions: Arc<ActionRegistry>,
) -> (RegionContext, Arc<OrchestrationEngine>) {
    let ctx = RegionContext::builder(config)
        .arbiter(arbiter as Arc<dyn LeaseArbiter>)
        .actions(actions)
        .build()
        .unwrap();
    let engine = OrchestrationEngine::new(&ctx).unwrap();
    (ctx, engine)
}

/// Handler that records every call and fails on request
#[derive(Default)]
pub struct ScriptedHandler {
    kinds: Vec<ActionKind>,
    calls: Mutex<Vec<(String, bool, String)>>,
    fail_steps: Mutex<HashSet<String>>,
    fail_compensations: Mutex<HashSet<String>>,
    transient: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: u64,
}

impl ScriptedHandler {
    pub fn new(kinds: &[ActionKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Self::default()
        }
    }

    /// Every call sleeps for `delay_ms` before answering
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn fail_step(&self, step_id: &str) {
        self.fail_steps.lock().unwrap().insert(step_id.to_string());
    }

    pub fn fail_compensation(&self, step_id: &str) {
        self.fail_compensations.lock().unwrap().insert(step_id.to_string());
    }

    /// Fail the step transiently `times` times before succeeding
    pub fn flaky(&self, step_id: &str, times: usize) {
        self.transient.lock().unwrap().insert(step_id.to_string(), times);
    }

    /// Forward executions of `step_id`
    pub fn executions(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, compensation, _)| id == step_id && !compensation)
            .count()
    }

    pub fn compensations(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, compensation, _)| id == step_id && *compensation)
            .count()
    }

    /// Regions that ran a forward execution of `step_id`
    pub fn regions_for(&self, step_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, compensation, _)| id == step_id && !compensation)
            .map(|(_, _, region)| region.clone())
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        self.kinds.clone()
    }

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value> {
        self.calls.lock().unwrap().push((
            request.step_id.clone(),
            request.compensation,
            request.region.clone(),
        ));
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if request.compensation {
            if self.fail_compensations.lock().unwrap().contains(&request.step_id) {
                return Err(ActionError::Permanent(format!("cannot undo {}", request.step_id)));
            }
            return Ok(json!({ "undone": request.step_id }));
        }

        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(left) = transient.get_mut(&request.step_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ActionError::Transient("upstream busy".to_string()));
                }
            }
        }
        if self.fail_steps.lock().unwrap().contains(&request.step_id) {
            return Err(ActionError::Permanent(format!("{} refused", request.step_id)));
        }
        Ok(json!({ "step": request.step_id, "attempt": request.attempt }))
    }
}

/// Handler that blocks until opened. Regions listed as `stalled` never finish.
pub struct GateHandler {
    kinds: Vec<ActionKind>,
    open: watch::Sender<bool>,
    entered: Notify,
    stalled: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl GateHandler {
    pub fn new(kinds: &[ActionKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            open: watch::channel(false).0,
            entered: Notify::new(),
            stalled: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Calls made from `region` hang forever
    pub fn stall_region(&self, region: &str) {
        self.stalled.lock().unwrap().insert(region.to_string());
    }

    /// Let every waiting and future call through
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Wait until some call has entered the handler
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for GateHandler {
    fn name(&self) -> &str {
        "gate"
    }

    fn kinds(&self) -> Vec<ActionKind> {
        self.kinds.clone()
    }

    async fn execute(&self, request: &ActionRequest) -> ActionResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.compensation {
            return Ok(json!({ "undone": request.step_id }));
        }
        let mut opened = self.open.subscribe();
        self.entered.notify_one();
        let stalled = self.stalled.lock().unwrap().contains(&request.region);
        if stalled {
            std::future::pending::<()>().await;
        }
        let _ = opened.wait_for(|open| *open).await;
        Ok(json!({ "step": request.step_id }))
    }
}
