//! Interrupt registry: externally issued abort/expire signals.
//!
//! Interrupts are consulted at exactly two checkpoints -- immediately before
//! facilitation and immediately before starting the resolved execution mode
//! -- never mid-flight inside an external task. The registry is explicit:
//! callers pass the run and node ids they care about, there is no ambient
//! interrupt state.

use dashmap::DashMap;

use cascade_types::error::StoreError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Kind of interrupt issued against a run or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptKind {
    Abort,
    Expire,
}

impl InterruptKind {
    fn as_str(self) -> &'static str {
        match self {
            InterruptKind::Abort => "abort",
            InterruptKind::Expire => "expire",
        }
    }
}

/// Where an interrupt applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptScope {
    /// The whole plan execution.
    Plan,
    /// A specific node execution (a stage's runtime id covers its subtree).
    Node(String),
}

/// One open interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub scope: InterruptScope,
}

/// Result of a pre-invocation check: proceed or stop, with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCheck {
    pub proceed: bool,
    pub reason: String,
}

impl ExecutionCheck {
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            reason: reason.into(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// InterruptRegistry trait
// ---------------------------------------------------------------------------

/// Lookup of open interrupts for a plan execution.
///
/// `related_ids` carries every node execution id whose interrupts also block
/// this node (in practice: the node itself and its owning stage).
pub trait InterruptRegistry: Send + Sync {
    fn check_pre_invocation(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
        related_ids: &[String],
    ) -> impl std::future::Future<Output = Result<ExecutionCheck, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryInterruptRegistry
// ---------------------------------------------------------------------------

/// Open interrupts keyed by plan execution id.
#[derive(Debug, Default)]
pub struct InMemoryInterruptRegistry {
    open: DashMap<String, Vec<Interrupt>>,
}

impl InMemoryInterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open interrupt against a plan execution.
    pub fn register(&self, plan_execution_id: &str, interrupt: Interrupt) {
        self.open
            .entry(plan_execution_id.to_string())
            .or_default()
            .push(interrupt);
    }

    /// Clears all interrupts for a plan execution.
    pub fn clear(&self, plan_execution_id: &str) {
        self.open.remove(plan_execution_id);
    }
}

impl InterruptRegistry for InMemoryInterruptRegistry {
    async fn check_pre_invocation(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
        related_ids: &[String],
    ) -> Result<ExecutionCheck, StoreError> {
        let Some(interrupts) = self.open.get(plan_execution_id) else {
            return Ok(ExecutionCheck::proceed("no open interrupts"));
        };
        for interrupt in interrupts.iter() {
            let applies = match &interrupt.scope {
                InterruptScope::Plan => true,
                InterruptScope::Node(id) => {
                    id == node_execution_id || related_ids.contains(id)
                }
            };
            if applies {
                return Ok(ExecutionCheck::blocked(format!(
                    "open {} interrupt on this execution",
                    interrupt.kind.as_str()
                )));
            }
        }
        Ok(ExecutionCheck::proceed("no matching interrupts"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
