//! Step handler seam: the bodies the engine runs for Sync-mode nodes and the
//! resume hook for Async/Task completions.
//!
//! Handlers are synchronous decisions over already-resolved parameters; long
//! running work belongs to external systems that complete through the resume
//! path. Handler failures surface as `anyhow::Error` -- arbitrary user
//! errors enter the engine here and are normalized into step outcomes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use cascade_types::ambiance::Ambiance;
use cascade_types::execution::StepOutcome;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What a step handler sees when invoked.
pub struct StepContext<'a> {
    pub ambiance: &'a Ambiance,
    pub resolved_params: &'a Value,
}

// ---------------------------------------------------------------------------
// StepHandler trait + registry
// ---------------------------------------------------------------------------

/// A step body, keyed in the registry by step type name.
pub trait StepHandler: Send + Sync {
    /// Runs the step inline (Sync mode).
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, anyhow::Error>;

    /// Folds correlated external responses into an outcome (Async/Task
    /// completion). The default succeeds with the responses as output.
    fn resume(
        &self,
        _ctx: &StepContext<'_>,
        responses: HashMap<String, Value>,
    ) -> Result<StepOutcome, anyhow::Error> {
        Ok(StepOutcome::succeeded(Some(
            serde_json::to_value(responses)?,
        )))
    }
}

/// Registry of step handlers keyed by step type name.
#[derive(Default)]
pub struct StepRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, step_type_name: &str, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type_name.to_string(), handler);
    }

    pub fn get(&self, step_type_name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers
            .get(step_type_name)
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
