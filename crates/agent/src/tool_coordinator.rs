//! Tool execution coordinator.
//!
//! Runs one batch of model-requested tool calls on a bounded pool, records
//! per-call status for display, and aggregates the results into the
//! continuation payload the model sees next. Results are assembled only
//! after every worker has been joined, in the order the calls were made.

use std::sync::Arc;
use std::time::Instant;

use pocketcode_core::error::ToolError;
use pocketcode_core::event::{DomainEvent, EventBus};
use pocketcode_core::tool::{ToolCall, ToolRegistry, ToolStatus, ToolUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Where a batch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Dispatched,
    Running,
    Aggregated,
    ContinuationSent,
}

/// One tool-bearing response's worth of calls.
#[derive(Debug, Clone)]
pub struct ToolBatch {
    state: BatchState,
    calls: Vec<ToolCall>,
    usages: Vec<ToolUsage>,
}

impl ToolBatch {
    /// A new batch with every call pending.
    pub fn new(calls: Vec<ToolCall>) -> Self {
        let usages = calls.iter().map(ToolUsage::pending).collect();
        Self {
            state: BatchState::Dispatched,
            calls,
            usages,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn usages(&self) -> &[ToolUsage] {
        &self.usages
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Move every call to running. Only valid from `Dispatched`.
    pub fn mark_running(&mut self) {
        if self.state == BatchState::Dispatched {
            for usage in &mut self.usages {
                usage.status = ToolStatus::Running;
            }
            self.state = BatchState::Running;
        }
    }

    /// Build the continuation payload once. Later calls return `None`.
    pub fn take_continuation(&mut self) -> Option<ContinuationPayload> {
        if self.state != BatchState::Aggregated {
            return None;
        }
        self.state = BatchState::ContinuationSent;
        Some(ContinuationPayload::from_usages(&self.usages))
    }
}

/// `{"action":"tool_result","results":[{"toolName":...,"result":{...}}]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPayload {
    pub action: String,
    pub results: Vec<ToolResultEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub tool_name: String,
    pub result: Value,
}

impl ContinuationPayload {
    fn from_usages(usages: &[ToolUsage]) -> Self {
        Self {
            action: "tool_result".into(),
            results: usages
                .iter()
                .map(|u| ToolResultEntry {
                    tool_name: u.tool_name.clone(),
                    result: u.result.clone().unwrap_or_else(|| failure("no result")),
                })
                .collect(),
        }
    }

    /// The payload as the text of a machine-generated user turn.
    pub fn to_prompt(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| json!({"action": "tool_result", "results": []}).to_string())
    }
}

/// Executes batches against a registry.
pub struct ToolCoordinator {
    registry: ToolRegistry,
    max_parallel: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl ToolCoordinator {
    pub fn new(registry: ToolRegistry, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run every call in the batch and aggregate. A failing, unknown or
    /// panicking tool yields `{ok: false, error}` for that call only.
    pub async fn execute(&self, batch: &mut ToolBatch) {
        batch.mark_running();
        if batch.state != BatchState::Running {
            return;
        }

        let permits = Arc::new(Semaphore::new(batch.len().min(self.max_parallel).max(1)));
        let mut handles = Vec::with_capacity(batch.len());

        for call in batch.calls.iter().cloned() {
            let registry = self.registry.clone();
            let permits = Arc::clone(&permits);
            handles.push(tokio::spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let started = Instant::now();
                let result = registry.execute(&call).await;
                (result, started.elapsed())
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let (result, elapsed) = match handle.await {
                Ok(done) => done,
                Err(e) => (Err(ToolError::Panicked(e.to_string())), Default::default()),
            };
            let usage = &mut batch.usages[i];
            let success = result.is_ok();
            if let Err(e) = &result {
                warn!(tool = %usage.tool_name, error = %e, "Tool failed");
            }
            usage.status = if success {
                ToolStatus::Completed
            } else {
                ToolStatus::Failed
            };
            usage.result = Some(normalize(result));
            usage.duration = elapsed;

            if let Some(bus) = &self.event_bus {
                bus.publish(DomainEvent::ToolExecuted {
                    tool_name: usage.tool_name.clone(),
                    success,
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        debug!(calls = batch.len(), "Tool batch aggregated");
        batch.state = BatchState::Aggregated;
    }
}

/// `{ok: true, ...payload}` or `{ok: false, error}`.
fn normalize(result: Result<Value, ToolError>) -> Value {
    match result {
        Ok(Value::Object(mut map)) => {
            map.insert("ok".into(), Value::Bool(true));
            Value::Object(map)
        }
        Ok(Value::Null) => json!({ "ok": true }),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("ok".into(), Value::Bool(true));
            map.insert("result".into(), other);
            Value::Object(map)
        }
        Err(e) => failure(&e.to_string()),
    }
}

fn failure(message: &str) -> Value {
    json!({ "ok": false, "error": message })
}
