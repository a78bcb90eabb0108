//! Advising: deciding what happens *after* a node concludes.
//!
//! Advisers are pluggable policies declared per node as ordered obtainments.
//! After a node reaches a conclusion the engine walks them in order; the
//! first adviser that applies and produces a directive wins. The directive
//! itself is a tagged [`AdviserResponse`] variant; the executor dispatches
//! each variant to its follow-up handler.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use cascade_types::execution::{AdviserResponse, NodeExecution};
use cascade_types::plan::PlanNode;
use cascade_types::status::NodeStatus;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdviseError {
    #[error("unknown adviser kind: {0}")]
    UnknownKind(String),

    #[error("adviser failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// AdvisingEvent
// ---------------------------------------------------------------------------

/// What an adviser sees when consulted.
pub struct AdvisingEvent<'a> {
    pub node_execution: &'a NodeExecution,
    /// The status the node held before this conclusion.
    pub from_status: NodeStatus,
    /// The obtainment's configuration.
    pub parameters: &'a Value,
}

impl AdvisingEvent<'_> {
    /// The concluded status advisers react to.
    pub fn to_status(&self) -> NodeStatus {
        self.node_execution.status
    }
}

// ---------------------------------------------------------------------------
// Adviser trait + registry
// ---------------------------------------------------------------------------

/// A pluggable post-conclusion policy.
pub trait Adviser: Send + Sync {
    /// Whether this adviser applies to the event at all.
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool;

    /// The directive, or `None` to defer to the next obtainment.
    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError>;
}

/// Registry of advisers keyed by obtainment kind.
pub struct AdviserRegistry {
    handlers: DashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// A registry with the built-in advisers registered.
    pub fn with_default_advisers() -> Self {
        let registry = Self::new();
        registry.register("retry", Arc::new(RetryAdviser));
        registry.register("next_step", Arc::new(NextStepAdviser));
        registry.register("ignore_failure", Arc::new(IgnoreFailureAdviser));
        registry.register("mark_success", Arc::new(MarkSuccessAdviser));
        registry
    }

    pub fn register(&self, kind: &str, adviser: Arc<dyn Adviser>) {
        self.handlers.insert(kind.to_string(), adviser);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Adviser>> {
        self.handlers.get(kind).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// AdviserDispatch
// ---------------------------------------------------------------------------

/// Walks a node's adviser obtainments and returns the first directive.
pub struct AdviserDispatch {
    registry: AdviserRegistry,
}

impl AdviserDispatch {
    pub fn new(registry: AdviserRegistry) -> Self {
        Self { registry }
    }

    pub fn first_response(
        &self,
        node: &PlanNode,
        node_execution: &NodeExecution,
        from_status: NodeStatus,
    ) -> Result<Option<AdviserResponse>, AdviseError> {
        for obtainment in &node.adviser_obtainments {
            let adviser = self
                .registry
                .get(&obtainment.kind)
                .ok_or_else(|| AdviseError::UnknownKind(obtainment.kind.clone()))?;
            let event = AdvisingEvent {
                node_execution,
                from_status,
                parameters: &obtainment.parameters,
            };
            if !adviser.can_advise(&event) {
                continue;
            }
            if let Some(response) = adviser.advise(&event)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Built-in advisers
// ---------------------------------------------------------------------------

/// Re-queues a failed node while attempts remain.
///
/// Parameters: `max_attempts` (total attempts, default 1 = no retry),
/// `wait_ms` (delay before the next attempt, default 0).
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status().is_failure_like()
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        let max_attempts = event
            .parameters
            .get("max_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let attempt = event.node_execution.retry_count() + 1;
        if attempt >= max_attempts {
            return Ok(None);
        }
        let wait_ms = event
            .parameters
            .get("wait_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(Some(AdviserResponse::Retry { wait_ms }))
    }
}

/// Proceeds to a configured sibling after success.
///
/// Parameters: `next_node_id` (required).
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status() == NodeStatus::Succeeded
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        let Some(next_node_id) = event.parameters.get("next_node_id").and_then(Value::as_str)
        else {
            return Ok(None);
        };
        Ok(Some(AdviserResponse::NextStep {
            next_node_id: next_node_id.to_string(),
        }))
    }
}

/// Continues past a failure, keeping the failure recorded.
///
/// Parameters: `next_node_id` (optional).
pub struct IgnoreFailureAdviser;

impl Adviser for IgnoreFailureAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status().is_failure_like()
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        let next_node_id = event
            .parameters
            .get("next_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Some(AdviserResponse::IgnoreFailure { next_node_id }))
    }
}

/// Overwrites a failure with success.
///
/// Parameters: `next_node_id` (optional).
pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status().is_failure_like()
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        let next_node_id = event
            .parameters
            .get("next_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Some(AdviserResponse::MarkSuccess { next_node_id }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
