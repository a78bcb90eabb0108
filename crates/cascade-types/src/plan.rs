//! Static plan types: the compiled graph the engine executes.
//!
//! A `Plan` is immutable and shared across every execution of the same
//! workflow version. Rollback-mode runs derive a new plan in which
//! previously executed non-stage nodes are replaced by identity nodes that
//! replay the recorded result of the original execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::StepType;

// ---------------------------------------------------------------------------
// Obtainments
// ---------------------------------------------------------------------------

/// Declares one adviser to consult after the node concludes, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    /// Registry key of the adviser (e.g. "retry", "next_step").
    pub kind: String,
    /// Adviser-specific configuration.
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn new(kind: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }
}

/// Declares one facilitator to consult when deciding the execution mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    /// Registry key of the facilitator (e.g. "sync", "task").
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorObtainment {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Expression mode
// ---------------------------------------------------------------------------

/// How unresolved expressions are treated during parameter resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionMode {
    /// Unresolved expressions are an error.
    #[default]
    Strict,
    /// Unresolved expressions pass through as literal text.
    Lenient,
}

/// How a skipped node appears in the rendered execution graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipGraphType {
    #[default]
    None,
    SkipNode,
    SkipTree,
}

// ---------------------------------------------------------------------------
// PlanNode
// ---------------------------------------------------------------------------

/// One static node in a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Static node id, stable across executions of this plan version.
    pub uuid: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Fully-qualified name of the owning stage.
    #[serde(default)]
    pub stage_fqn: String,
    /// Module/service that owns this step type.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub skip_expression_chain: bool,
    #[serde(default)]
    pub skip_graph_type: SkipGraphType,
    /// Expression gating execution; false means the node is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_condition: Option<String>,
    /// Template for input the node requires from outside before starting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_input_template: Option<Value>,
    #[serde(default)]
    pub expression_mode: ExpressionMode,
    /// Raw, templated step parameters.
    #[serde(default)]
    pub step_parameters: Value,
    /// Dotted key paths removed from the display-only step-inputs view.
    #[serde(default)]
    pub excluded_step_input_keys: Vec<String>,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
}

impl PlanNode {
    /// A minimal node; callers fill the remaining fields as needed.
    pub fn new(uuid: impl Into<String>, identifier: impl Into<String>, step_type: StepType) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            step_type,
            group: None,
            stage_fqn: String::new(),
            service_name: String::new(),
            skip_expression_chain: false,
            skip_graph_type: SkipGraphType::default(),
            when_condition: None,
            execution_input_template: None,
            expression_mode: ExpressionMode::default(),
            step_parameters: Value::Null,
            excluded_step_input_keys: Vec::new(),
            adviser_obtainments: Vec::new(),
            facilitator_obtainments: Vec::new(),
        }
    }

    pub fn has_advisers(&self) -> bool {
        !self.adviser_obtainments.is_empty()
    }
}

// ---------------------------------------------------------------------------
// IdentityNode
// ---------------------------------------------------------------------------

/// Replay stand-in for a previously executed node in a rollback-mode plan.
///
/// Carries the original step type and the source execution's id so its
/// recorded status and outputs can be replayed without re-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityNode {
    pub uuid: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub stage_fqn: String,
    /// The prior run's node execution whose result this node replays.
    pub original_node_execution_id: String,
}

impl IdentityNode {
    /// Builds the replay stand-in for `node`, pointing at the prior run's
    /// execution id.
    pub fn replaying(node: &PlanNode, original_node_execution_id: impl Into<String>) -> Self {
        Self {
            uuid: node.uuid.clone(),
            name: node.name.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            group: node.group.clone(),
            stage_fqn: node.stage_fqn.clone(),
            original_node_execution_id: original_node_execution_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A node entry in a plan: executable or identity replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanNodeEntry {
    Plan(PlanNode),
    Identity(IdentityNode),
}

impl PlanNodeEntry {
    pub fn uuid(&self) -> &str {
        match self {
            PlanNodeEntry::Plan(node) => &node.uuid,
            PlanNodeEntry::Identity(node) => &node.uuid,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            PlanNodeEntry::Plan(node) => &node.identifier,
            PlanNodeEntry::Identity(node) => &node.identifier,
        }
    }

    pub fn step_type(&self) -> &StepType {
        match self {
            PlanNodeEntry::Plan(node) => &node.step_type,
            PlanNodeEntry::Identity(node) => &node.step_type,
        }
    }

    pub fn as_plan_node(&self) -> Option<&PlanNode> {
        match self {
            PlanNodeEntry::Plan(node) => Some(node),
            PlanNodeEntry::Identity(_) => None,
        }
    }
}

/// The compiled, static graph for one workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    /// Id of the node the run begins at.
    pub start_node_id: String,
    pub nodes: Vec<PlanNodeEntry>,
    #[serde(default)]
    pub version: u32,
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Option<&PlanNodeEntry> {
        self.nodes.iter().find(|entry| entry.uuid() == node_id)
    }

    pub fn plan_node(&self, node_id: &str) -> Option<&PlanNode> {
        self.node(node_id).and_then(PlanNodeEntry::as_plan_node)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepCategory;
    use serde_json::json;

    fn sample_node() -> PlanNode {
        let mut node = PlanNode::new(
            "n-1",
            "run_script",
            StepType::new("shell_script", StepCategory::Step),
        );
        node.step_parameters = json!({ "script": "echo hi", "timeout": "<+ctx.timeout>" });
        node.excluded_step_input_keys = vec!["script".to_string()];
        node.adviser_obtainments = vec![AdviserObtainment::new("retry", json!({"max_attempts": 2}))];
        node.facilitator_obtainments = vec![FacilitatorObtainment::new("sync")];
        node
    }

    #[test]
    fn test_plan_node_json_roundtrip() {
        let node = sample_node();
        let json_str = serde_json::to_string(&node).unwrap();
        let parsed: PlanNode = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, node);
        assert!(parsed.has_advisers());
    }

    #[test]
    fn test_plan_node_yaml_roundtrip() {
        let node = sample_node();
        let yaml = serde_yaml_ng::to_string(&node).unwrap();
        assert!(yaml.contains("run_script"));
        assert!(yaml.contains("kind: retry"));
        let parsed: PlanNode = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_identity_node_replaying_copies_static_fields() {
        let node = sample_node();
        let identity = IdentityNode::replaying(&node, "prior-exec-9");
        assert_eq!(identity.uuid, "n-1");
        assert_eq!(identity.step_type, node.step_type);
        assert_eq!(identity.original_node_execution_id, "prior-exec-9");
    }

    #[test]
    fn test_plan_node_entry_tagged_serde() {
        let entry = PlanNodeEntry::Identity(IdentityNode::replaying(&sample_node(), "prior-1"));
        let json_str = serde_json::to_string(&entry).unwrap();
        assert!(json_str.contains("\"type\":\"identity\""));
        let parsed: PlanNodeEntry = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.uuid(), "n-1");
        assert!(parsed.as_plan_node().is_none());
    }

    #[test]
    fn test_plan_lookup() {
        let plan = Plan {
            uuid: "p-1".to_string(),
            start_node_id: "n-1".to_string(),
            nodes: vec![PlanNodeEntry::Plan(sample_node())],
            version: 1,
        };
        assert!(plan.plan_node("n-1").is_some());
        assert!(plan.node("missing").is_none());
    }
}
