//! Facilitation: deciding *how* a queued node will execute.
//!
//! Each plan node declares an ordered list of facilitator obtainments. The
//! engine walks them in order and takes the first non-null decision. Kinds
//! outside the core set are custom: the engine publishes a facilitation
//! event instead of deciding inline, and the external facilitator answers
//! through `process_facilitation_response`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cascade_types::ambiance::Ambiance;
use cascade_types::plan::{ExpressionMode, PlanNode};
use cascade_types::step::StepMode;

use crate::expression::ExpressionService;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FacilitationError {
    #[error("no facilitator produced a decision for node {node_id}")]
    NoDecision { node_id: String },

    #[error("unknown facilitator kind: {0}")]
    UnknownKind(String),

    #[error("facilitator failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// FacilitatorResponse
// ---------------------------------------------------------------------------

/// The decision: execution mode plus optional wait hint and a reason string
/// advisers can inspect later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub mode: StepMode,
    /// Initial wait before starting, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_wait_ms: Option<u64>,
    #[serde(default)]
    pub reason: String,
}

impl FacilitatorResponse {
    pub fn for_mode(mode: StepMode) -> Self {
        Self {
            mode,
            initial_wait_ms: None,
            reason: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Facilitator trait + registry
// ---------------------------------------------------------------------------

/// A pluggable facilitation decision.
///
/// Returning `Ok(None)` passes the decision to the next obtainment in order.
pub trait Facilitator: Send + Sync {
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, FacilitationError>;
}

/// Fixed-mode facilitator backing the five core kinds.
struct ModeFacilitator {
    mode: StepMode,
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _node: &PlanNode,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, FacilitationError> {
        let initial_wait_ms = parameters
            .get("initial_wait_ms")
            .and_then(Value::as_u64);
        Ok(Some(FacilitatorResponse {
            mode: self.mode,
            initial_wait_ms,
            reason: "core facilitator".to_string(),
        }))
    }
}

/// The facilitator kinds the engine can decide inline.
pub const CORE_FACILITATOR_KINDS: &[&str] = &["sync", "async", "task", "child", "child_chain"];

/// Registry of facilitators keyed by obtainment kind.
pub struct FacilitatorRegistry {
    handlers: DashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// A registry with the five core mode facilitators registered.
    pub fn with_core_facilitators() -> Self {
        let registry = Self::new();
        for (kind, mode) in [
            ("sync", StepMode::Sync),
            ("async", StepMode::Async),
            ("task", StepMode::Task),
            ("child", StepMode::Child),
            ("child_chain", StepMode::ChildChain),
        ] {
            registry.register(kind, Arc::new(ModeFacilitator { mode }));
        }
        registry
    }

    pub fn register(&self, kind: &str, facilitator: Arc<dyn Facilitator>) {
        self.handlers.insert(kind.to_string(), facilitator);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Facilitator>> {
        self.handlers.get(kind).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// FacilitationEngine
// ---------------------------------------------------------------------------

/// Walks a node's facilitator obtainments and produces the decision.
pub struct FacilitationEngine {
    registry: FacilitatorRegistry,
}

impl FacilitationEngine {
    pub fn new(registry: FacilitatorRegistry) -> Self {
        Self { registry }
    }

    /// True when any declared obtainment is outside the registry: the
    /// decision belongs to an external facilitator.
    pub fn custom_facilitator_present(&self, node: &PlanNode) -> bool {
        node.facilitator_obtainments
            .iter()
            .any(|obtainment| self.registry.get(&obtainment.kind).is_none())
    }

    /// First non-null decision across the node's obtainments, in order.
    pub fn facilitator_response(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<FacilitatorResponse, FacilitationError> {
        for obtainment in &node.facilitator_obtainments {
            let facilitator = self
                .registry
                .get(&obtainment.kind)
                .ok_or_else(|| FacilitationError::UnknownKind(obtainment.kind.clone()))?;
            if let Some(response) =
                facilitator.facilitate(ambiance, node, &obtainment.parameters)?
            {
                return Ok(response);
            }
        }
        Err(FacilitationError::NoDecision {
            node_id: node.uuid.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Pre-facilitation checks
// ---------------------------------------------------------------------------

/// Outcome of the checks that run before facilitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCheckOutcome {
    /// Continue into facilitation.
    Proceed { reason: String },
    /// Stop silently; an interrupt handler owns the status transition.
    Blocked { reason: String },
    /// The node's when-condition came out false; conclude it Skipped.
    Skip { reason: String },
}

impl PreCheckOutcome {
    pub fn is_proceed(&self) -> bool {
        matches!(self, PreCheckOutcome::Proceed { .. })
    }
}

/// Evaluates a node's when-condition against the ambiance.
///
/// `None` when the node has no condition or the evaluation itself fails --
/// an unevaluable condition never blocks progress on its own.
pub fn evaluate_when_condition<X: ExpressionService>(
    service: &X,
    ambiance: &Ambiance,
    node: &PlanNode,
) -> Option<bool> {
    let condition = node.when_condition.as_deref()?;
    match service.evaluate(ambiance, condition, ExpressionMode::Strict) {
        Ok(value) => Some(truthy(&value)),
        Err(err) => {
            tracing::debug!(
                node_id = node.uuid.as_str(),
                error = %err,
                "when-condition evaluation failed, not blocking"
            );
            None
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
