//! Plan store trait definition.

use cascade_types::error::StoreError;
use cascade_types::plan::{Plan, PlanNode};

/// Read-only access to compiled plans.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PlanStore: Send + Sync {
    /// Fetch a whole plan by id.
    fn fetch_plan(
        &self,
        plan_id: &str,
    ) -> impl std::future::Future<Output = Result<Plan, StoreError>> + Send;

    /// Fetch a single executable node of a plan by its static node id.
    fn fetch_node(
        &self,
        plan_id: &str,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<PlanNode, StoreError>> + Send;
}
