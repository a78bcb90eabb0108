//! Step typing: what kind of node a level represents and how a step runs.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StepCategory / StepType
// ---------------------------------------------------------------------------

/// Structural category of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Step,
    Stage,
    StepGroup,
    Strategy,
    Fork,
}

/// The declared type of a step: a service-specific name plus its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    /// Service-specific type name (e.g. "shell_script", "deployment_stage").
    pub name: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            name: name.into(),
            category,
        }
    }
}

// ---------------------------------------------------------------------------
// StepMode
// ---------------------------------------------------------------------------

/// How a node will execute, as decided by facilitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Inline, synchronous execution inside the engine dispatch.
    Sync,
    /// Asynchronous execution awaiting a correlated callback.
    Async,
    /// Delegated to an external worker/task system.
    Task,
    /// Spawns a single child node and waits for it.
    Child,
    /// Spawns a chain of children, resuming between links.
    ChildChain,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
