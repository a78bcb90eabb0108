//! Node execution store trait definition.

use cascade_types::error::StoreError;
use cascade_types::execution::{NodeExecution, StageExecutionSummary};
use cascade_types::status::NodeStatus;

/// Storage interface for node executions.
///
/// The contract that matters most is [`Self::update_status_with_ops`]: a
/// conditional, compare-and-swap style update. A transition applies only if
/// the stored status is still in the allowed-from set; otherwise the call
/// returns `Ok(None)` and the caller must treat the rejection as a normal
/// no-op race outcome, never an error. This is what linearizes concurrent
/// transitions on a single execution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait NodeExecutionStore: Send + Sync {
    /// Persist a newly created execution.
    fn save(
        &self,
        execution: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Fetch an execution by its runtime id.
    fn get(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<NodeExecution, StoreError>> + Send;

    /// Apply a non-status mutation to an execution and return the result.
    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut NodeExecution) + Send,
    ) -> impl std::future::Future<Output = Result<NodeExecution, StoreError>> + Send;

    /// Guarded status transition.
    ///
    /// Applies `to` (plus `ops`) only when the stored status is in
    /// `allowed_from`; an empty set means the status's
    /// [`NodeStatus::default_allowed_from`] set. Returns `Ok(None)` when the
    /// guard rejects the transition.
    fn update_status_with_ops(
        &self,
        id: &str,
        to: NodeStatus,
        ops: impl FnOnce(&mut NodeExecution) + Send,
        allowed_from: &[NodeStatus],
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, StoreError>> + Send;

    /// All executions belonging to one plan execution.
    fn fetch_by_plan_execution(
        &self,
        plan_execution_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, StoreError>> + Send;

    /// Stage-level execution summaries for one plan execution, in creation
    /// order. Strategy wrappers of looped/matrixed stages count as
    /// stage-level here.
    fn fetch_stage_executions(
        &self,
        plan_execution_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<StageExecutionSummary>, StoreError>> + Send;
}
