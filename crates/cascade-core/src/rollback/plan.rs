//! Rollback-mode plan derivation.
//!
//! The derived plan re-executes stage nodes for real and replays everything
//! else through identity nodes pointing at the prior run's recorded results.

use std::collections::HashSet;

use uuid::Uuid;

use cascade_types::plan::{IdentityNode, Plan, PlanNode, PlanNodeEntry};
use cascade_types::step::StepCategory;

/// One node of the prior run: its static node and the execution that ran it.
#[derive(Debug, Clone)]
pub struct ExecutedNode {
    pub node: PlanNode,
    pub node_execution_id: String,
}

/// Derives the plan a rollback run executes.
///
/// - every prior-run STAGE node is carried over as its executable node;
/// - every other prior-run node becomes an identity replay of its recorded
///   execution, unless its id is in `preserved_node_ids`;
/// - nodes of the *original* plan whose id is in `preserved_node_ids` and
///   which the prior run never reached are appended untouched, so a rollback
///   run can introduce genuinely new nodes alongside replayed history.
///
/// The derived plan keeps the original start node and version under a fresh
/// plan id.
pub fn derive_rollback_plan(
    original: &Plan,
    prior: &[ExecutedNode],
    preserved_node_ids: &HashSet<String>,
) -> Plan {
    let mut nodes: Vec<PlanNodeEntry> = Vec::with_capacity(prior.len());
    let mut included: HashSet<&str> = HashSet::new();

    for executed in prior {
        included.insert(executed.node.uuid.as_str());
        let keep_live = executed.node.step_type.category == StepCategory::Stage
            || preserved_node_ids.contains(&executed.node.uuid);
        if keep_live {
            nodes.push(PlanNodeEntry::Plan(executed.node.clone()));
        } else {
            nodes.push(PlanNodeEntry::Identity(IdentityNode::replaying(
                &executed.node,
                executed.node_execution_id.clone(),
            )));
        }
    }

    for entry in &original.nodes {
        if preserved_node_ids.contains(entry.uuid()) && !included.contains(entry.uuid()) {
            nodes.push(entry.clone());
        }
    }

    Plan {
        uuid: Uuid::now_v7().to_string(),
        start_node_id: original.start_node_id.clone(),
        nodes,
        version: original.version,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::step::StepType;

    fn node(uuid: &str, category: StepCategory) -> PlanNode {
        PlanNode::new(uuid, format!("id_{uuid}"), StepType::new("test_step", category))
    }

    fn original_plan(extra: Vec<PlanNode>) -> Plan {
        let mut nodes = vec![
            PlanNodeEntry::Plan(node("stage-1", StepCategory::Stage)),
            PlanNodeEntry::Plan(node("step-1", StepCategory::Step)),
        ];
        nodes.extend(extra.into_iter().map(PlanNodeEntry::Plan));
        Plan {
            uuid: "plan-original".to_string(),
            start_node_id: "stage-1".to_string(),
            nodes,
            version: 3,
        }
    }

    fn executed(uuid: &str, category: StepCategory) -> ExecutedNode {
        ExecutedNode {
            node: node(uuid, category),
            node_execution_id: format!("exec-{uuid}"),
        }
    }

    #[test]
    fn test_stage_nodes_stay_live() {
        let plan = derive_rollback_plan(
            &original_plan(vec![]),
            &[executed("stage-1", StepCategory::Stage)],
            &HashSet::new(),
        );
        assert_eq!(plan.nodes.len(), 1);
        assert!(matches!(plan.nodes[0], PlanNodeEntry::Plan(_)));
        assert_eq!(plan.start_node_id, "stage-1");
        assert_eq!(plan.version, 3);
        assert_ne!(plan.uuid, "plan-original");
    }

    #[test]
    fn test_non_stage_nodes_become_identity_replays() {
        let plan = derive_rollback_plan(
            &original_plan(vec![]),
            &[
                executed("stage-1", StepCategory::Stage),
                executed("step-1", StepCategory::Step),
                executed("fork-1", StepCategory::Fork),
            ],
            &HashSet::new(),
        );
        assert_eq!(plan.nodes.len(), 3);
        let identity_ids: Vec<&str> = plan
            .nodes
            .iter()
            .filter_map(|entry| match entry {
                PlanNodeEntry::Identity(identity) => Some(identity.uuid.as_str()),
                PlanNodeEntry::Plan(_) => None,
            })
            .collect();
        assert_eq!(identity_ids, vec!["step-1", "fork-1"]);

        let PlanNodeEntry::Identity(replay) = &plan.nodes[1] else {
            panic!("expected identity node");
        };
        assert_eq!(replay.original_node_execution_id, "exec-step-1");
        assert_eq!(replay.step_type.category, StepCategory::Step);
    }

    #[test]
    fn test_preserved_prior_node_stays_live() {
        let preserved = HashSet::from(["step-1".to_string()]);
        let plan = derive_rollback_plan(
            &original_plan(vec![]),
            &[
                executed("stage-1", StepCategory::Stage),
                executed("step-1", StepCategory::Step),
            ],
            &preserved,
        );
        assert!(plan
            .nodes
            .iter()
            .all(|entry| matches!(entry, PlanNodeEntry::Plan(_))));
    }

    #[test]
    fn test_preserved_original_nodes_are_appended() {
        // A dedicated rollback stage exists in the original plan but never
        // ran; preserving it appends it untouched.
        let rollback_stage = node("rollback-stage", StepCategory::Stage);
        let preserved = HashSet::from(["rollback-stage".to_string()]);
        let plan = derive_rollback_plan(
            &original_plan(vec![rollback_stage]),
            &[executed("stage-1", StepCategory::Stage)],
            &preserved,
        );
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[1].uuid(), "rollback-stage");
        assert!(matches!(plan.nodes[1], PlanNodeEntry::Plan(_)));
    }

    #[test]
    fn test_preserved_node_not_duplicated_when_in_prior_run() {
        let preserved = HashSet::from(["stage-1".to_string()]);
        let plan = derive_rollback_plan(
            &original_plan(vec![]),
            &[executed("stage-1", StepCategory::Stage)],
            &preserved,
        );
        assert_eq!(plan.nodes.len(), 1);
    }
}
