//! In-memory store implementations backed by `DashMap`.
//!
//! Reference implementations for tests and light embedders. The status
//! guard relies on the map's per-entry locking: the check-and-set inside
//! `update_status_with_ops` holds the entry's write lock, so concurrent
//! attempts on the same execution serialize and at most one conflicting
//! transition wins.

use chrono::Utc;
use dashmap::DashMap;

use cascade_types::error::StoreError;
use cascade_types::execution::{NodeExecution, StageExecutionSummary};
use cascade_types::plan::{Plan, PlanNode};
use cascade_types::status::NodeStatus;
use cascade_types::step::StepCategory;

use super::{NodeExecutionStore, PlanStore};

// ---------------------------------------------------------------------------
// InMemoryPlanStore
// ---------------------------------------------------------------------------

/// Plan store over a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    plans: DashMap<String, Plan>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plan: Plan) {
        self.plans.insert(plan.uuid.clone(), plan);
    }
}

impl PlanStore for InMemoryPlanStore {
    async fn fetch_plan(&self, plan_id: &str) -> Result<Plan, StoreError> {
        self.plans
            .get(plan_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))
    }

    async fn fetch_node(&self, plan_id: &str, node_id: &str) -> Result<PlanNode, StoreError> {
        let plan = self
            .plans
            .get(plan_id)
            .ok_or_else(|| StoreError::NotFound(format!("plan {plan_id}")))?;
        plan.plan_node(node_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id} in plan {plan_id}")))
    }
}

// ---------------------------------------------------------------------------
// InMemoryNodeExecutionStore
// ---------------------------------------------------------------------------

/// Node execution store over a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryNodeExecutionStore {
    executions: DashMap<String, NodeExecution>,
}

impl InMemoryNodeExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

impl NodeExecutionStore for InMemoryNodeExecutionStore {
    async fn save(&self, execution: &NodeExecution) -> Result<(), StoreError> {
        if self.executions.contains_key(&execution.uuid) {
            return Err(StoreError::Conflict(format!(
                "node execution {} already exists",
                execution.uuid
            )));
        }
        self.executions
            .insert(execution.uuid.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NodeExecution, StoreError> {
        self.executions
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::NotFound(format!("node execution {id}")))
    }

    async fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut NodeExecution) + Send,
    ) -> Result<NodeExecution, StoreError> {
        let mut entry = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node execution {id}")))?;
        mutate(entry.value_mut());
        entry.last_updated_ts = Utc::now();
        Ok(entry.clone())
    }

    async fn update_status_with_ops(
        &self,
        id: &str,
        to: NodeStatus,
        ops: impl FnOnce(&mut NodeExecution) + Send,
        allowed_from: &[NodeStatus],
    ) -> Result<Option<NodeExecution>, StoreError> {
        // The entry's write lock is held across check and mutation, which is
        // what makes this a real compare-and-swap.
        let mut entry = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node execution {id}")))?;
        let allowed = if allowed_from.is_empty() {
            NodeStatus::default_allowed_from(to)
        } else {
            allowed_from
        };
        if !allowed.contains(&entry.status) {
            return Ok(None);
        }
        entry.status = to;
        ops(entry.value_mut());
        entry.last_updated_ts = Utc::now();
        Ok(Some(entry.clone()))
    }

    async fn fetch_by_plan_execution(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let mut executions: Vec<NodeExecution> = self
            .executions
            .iter()
            .filter(|entry| entry.ambiance.plan_execution_id == plan_execution_id)
            .map(|entry| entry.clone())
            .collect();
        executions.sort_by(|a, b| a.start_ts.cmp(&b.start_ts).then(a.uuid.cmp(&b.uuid)));
        Ok(executions)
    }

    async fn fetch_stage_executions(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<StageExecutionSummary>, StoreError> {
        let executions = self.fetch_by_plan_execution(plan_execution_id).await?;
        Ok(executions
            .into_iter()
            .filter(|execution| {
                matches!(
                    execution.step_type.category,
                    StepCategory::Stage | StepCategory::Strategy
                ) || execution.group.as_deref() == Some("STAGE")
            })
            .map(|execution| StageExecutionSummary {
                uuid: execution.uuid,
                identifier: execution.identifier,
                name: execution.name,
                status: execution.status,
                step_type: execution.step_type,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::ambiance::{Ambiance, Level};
    use cascade_types::step::StepType;
    use std::sync::Arc;

    fn execution(uuid: &str, plan_execution_id: &str, category: StepCategory) -> NodeExecution {
        let mut ambiance = Ambiance::new("plan-1", plan_execution_id);
        ambiance.levels.push(Level::new(
            format!("setup-{uuid}"),
            uuid,
            format!("id_{uuid}"),
            StepType::new("test_step", category),
        ));
        let node = PlanNode::new(
            format!("setup-{uuid}"),
            format!("id_{uuid}"),
            StepType::new("test_step", category),
        );
        NodeExecution::queued(ambiance, &node, None, None, None)
    }

    #[tokio::test]
    async fn save_then_get_roundtrip() {
        let store = InMemoryNodeExecutionStore::new();
        let execution = execution("e1", "pe1", StepCategory::Step);
        store.save(&execution).await.unwrap();
        let fetched = store.get("e1").await.unwrap();
        assert_eq!(fetched.uuid, "e1");
        assert_eq!(fetched.status, NodeStatus::Queued);
    }

    #[tokio::test]
    async fn duplicate_save_conflicts() {
        let store = InMemoryNodeExecutionStore::new();
        let execution = execution("e1", "pe1", StepCategory::Step);
        store.save(&execution).await.unwrap();
        assert!(matches!(
            store.save(&execution).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cas_accepts_transition_from_allowed_set() {
        let store = InMemoryNodeExecutionStore::new();
        store
            .save(&execution("e1", "pe1", StepCategory::Step))
            .await
            .unwrap();

        let updated = store
            .update_status_with_ops("e1", NodeStatus::Running, |_| {}, &[NodeStatus::Queued])
            .await
            .unwrap();
        assert_eq!(updated.unwrap().status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn cas_rejects_transition_outside_allowed_set() {
        let store = InMemoryNodeExecutionStore::new();
        store
            .save(&execution("e1", "pe1", StepCategory::Step))
            .await
            .unwrap();

        // Stored status is Queued; only Running is allowed as source.
        let rejected = store
            .update_status_with_ops("e1", NodeStatus::Succeeded, |_| {}, &[NodeStatus::Running])
            .await
            .unwrap();
        assert!(rejected.is_none());
        // State is untouched.
        assert_eq!(store.get("e1").await.unwrap().status, NodeStatus::Queued);
    }

    #[tokio::test]
    async fn cas_empty_set_uses_default_allowed_from() {
        let store = InMemoryNodeExecutionStore::new();
        store
            .save(&execution("e1", "pe1", StepCategory::Step))
            .await
            .unwrap();

        // Queued -> Running is in the default set.
        let updated = store
            .update_status_with_ops("e1", NodeStatus::Running, |_| {}, &[])
            .await
            .unwrap();
        assert!(updated.is_some());

        // Running -> Queued is not.
        let rejected = store
            .update_status_with_ops("e1", NodeStatus::Queued, |_| {}, &[])
            .await
            .unwrap();
        assert!(rejected.is_none());
    }

    #[tokio::test]
    async fn cas_ops_apply_only_on_accepted_transition() {
        let store = InMemoryNodeExecutionStore::new();
        store
            .save(&execution("e1", "pe1", StepCategory::Step))
            .await
            .unwrap();

        let rejected = store
            .update_status_with_ops(
                "e1",
                NodeStatus::Succeeded,
                |e| e.outputs = Some(serde_json::json!({"x": 1})),
                &[NodeStatus::Running],
            )
            .await
            .unwrap();
        assert!(rejected.is_none());
        assert!(store.get("e1").await.unwrap().outputs.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_single_winner() {
        let store = Arc::new(InMemoryNodeExecutionStore::new());
        store
            .save(&execution("e1", "pe1", StepCategory::Step))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update_status_with_ops("e1", NodeStatus::Running, |_| {}, &[NodeStatus::Queued])
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get("e1").await.unwrap().status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn stage_executions_filter_to_stage_level() {
        let store = InMemoryNodeExecutionStore::new();
        store
            .save(&execution("stage-1", "pe1", StepCategory::Stage))
            .await
            .unwrap();
        store
            .save(&execution("step-1", "pe1", StepCategory::Step))
            .await
            .unwrap();
        store
            .save(&execution("strategy-1", "pe1", StepCategory::Strategy))
            .await
            .unwrap();
        store
            .save(&execution("other-plan", "pe2", StepCategory::Stage))
            .await
            .unwrap();

        let summaries = store.fetch_stage_executions("pe1").await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.uuid.as_str()).collect();
        assert!(ids.contains(&"stage-1"));
        assert!(ids.contains(&"strategy-1"));
        assert!(!ids.contains(&"step-1"));
        assert!(!ids.contains(&"other-plan"));
    }

    #[tokio::test]
    async fn plan_store_fetches_nodes() {
        let plans = InMemoryPlanStore::new();
        let node = PlanNode::new("n-1", "first", StepType::new("test_step", StepCategory::Step));
        plans.insert(Plan {
            uuid: "plan-1".to_string(),
            start_node_id: "n-1".to_string(),
            nodes: vec![cascade_types::plan::PlanNodeEntry::Plan(node)],
            version: 1,
        });

        assert_eq!(plans.fetch_plan("plan-1").await.unwrap().start_node_id, "n-1");
        assert_eq!(
            plans.fetch_node("plan-1", "n-1").await.unwrap().identifier,
            "first"
        );
        assert!(plans.fetch_node("plan-1", "n-2").await.is_err());
        assert!(plans.fetch_plan("missing").await.is_err());
    }
}
