//! Runtime execution records and the response types that flow through the
//! node state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::plan::{PlanNode, SkipGraphType};
use crate::status::NodeStatus;
use crate::step::{StepMode, StepType};

// ---------------------------------------------------------------------------
// FailureInfo
// ---------------------------------------------------------------------------

/// Accumulated failure detail for a node execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Primary, user-facing message.
    pub message: String,
    /// Every failure message accumulated across attempts/handlers.
    #[serde(default)]
    pub failure_messages: Vec<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            failure_messages: vec![message.clone()],
            message,
        }
    }

    /// Records an additional message, keeping the original primary one.
    pub fn also(mut self, message: impl Into<String>) -> Self {
        self.failure_messages.push(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// Normalized result of a step body: a status plus outputs or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
}

impl StepOutcome {
    pub fn succeeded(outputs: Option<Value>) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            outputs,
            failure_info: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            outputs: None,
            failure_info: Some(FailureInfo::new(message)),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: NodeStatus::Skipped,
            outputs: None,
            failure_info: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Adviser response
// ---------------------------------------------------------------------------

/// Directive produced by an adviser after a node concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserResponse {
    /// Proceed to the given sibling node.
    NextStep { next_node_id: String },
    /// Re-queue this node for another attempt after `wait_ms`.
    Retry { wait_ms: u64 },
    /// Overwrite the outcome with success, optionally proceeding.
    MarkSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_node_id: Option<String>,
    },
    /// Keep the failure recorded but continue as if successful.
    IgnoreFailure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_node_id: Option<String>,
    },
    /// Stop the whole plan execution.
    EndPlan {
        #[serde(default)]
        abort: bool,
    },
}

// ---------------------------------------------------------------------------
// Step completion (notify payload)
// ---------------------------------------------------------------------------

/// Completion payload delivered to whoever is waiting on a node's notify id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    /// Static plan-node id of the completed node.
    pub node_id: String,
    pub identifier: String,
    pub node_execution_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// NodeExecution
// ---------------------------------------------------------------------------

/// One runtime instantiation of a plan node for a specific run.
///
/// Created in `Queued`; mutated exclusively through the store's guarded
/// status transitions; immutable once terminal except for adviser/response
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Runtime id; equals the ambiance's current level runtime id.
    pub uuid: String,
    pub ambiance: Ambiance,
    /// Static plan-node id.
    pub node_id: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub stage_fqn: String,
    #[serde(default)]
    pub skip_graph_type: SkipGraphType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Previous sibling in the chain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    /// Correlation key the waiting parent listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,
    pub status: NodeStatus,
    /// Execution mode chosen by facilitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StepMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_params: Option<Value>,
    /// Redaction-filtered view of resolved params, for graph display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_inputs: Option<Value>,
    /// Whether the node declares an execution-input template.
    #[serde(default)]
    pub execution_input_configured: bool,
    /// Whether external execution input has been supplied.
    #[serde(default)]
    pub execution_input_provided: bool,
    /// The externally supplied input document, once provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    pub start_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    pub last_updated_ts: DateTime<Utc>,
}

impl NodeExecution {
    /// Builds a queued execution of `node` under `ambiance`.
    ///
    /// The uuid is the ambiance's current runtime id; the identifier and
    /// name carry the strategy postfix when the current level is under a
    /// matrix/loop strategy.
    pub fn queued(
        ambiance: Ambiance,
        node: &PlanNode,
        notify_id: Option<String>,
        parent_id: Option<String>,
        previous_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let uuid = ambiance
            .current_runtime_id()
            .unwrap_or_default()
            .to_string();
        let identifier = ambiance.decorated_identifier(&node.identifier);
        let name = ambiance.decorated_identifier(&node.name);
        Self {
            uuid,
            node_id: node.uuid.clone(),
            name,
            identifier,
            step_type: node.step_type.clone(),
            group: node.group.clone(),
            stage_fqn: node.stage_fqn.clone(),
            skip_graph_type: node.skip_graph_type,
            parent_id,
            previous_id,
            notify_id,
            status: NodeStatus::Queued,
            mode: None,
            resolved_params: None,
            step_inputs: None,
            execution_input_configured: node.execution_input_template.is_some(),
            execution_input_provided: false,
            execution_input: None,
            outputs: None,
            adviser_response: None,
            failure_info: None,
            start_ts: now,
            end_ts: None,
            last_updated_ts: now,
            ambiance,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.ambiance
            .current_level()
            .map(|l| l.retry_index)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Stage execution summary
// ---------------------------------------------------------------------------

/// Projection of a stage-level node execution used by rollback derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionSummary {
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    pub status: NodeStatus,
    pub step_type: StepType,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, StrategyMetadata};
    use crate::step::StepCategory;
    use serde_json::json;

    fn sample_ambiance() -> Ambiance {
        let mut ambiance = Ambiance::new("plan-1", "exec-1");
        ambiance.levels.push(Level::new(
            "n-1",
            "rt-1",
            "run_script",
            StepType::new("shell_script", StepCategory::Step),
        ));
        ambiance
    }

    fn sample_node() -> PlanNode {
        PlanNode::new(
            "n-1",
            "run_script",
            StepType::new("shell_script", StepCategory::Step),
        )
    }

    #[test]
    fn test_queued_execution_takes_runtime_id() {
        let execution = NodeExecution::queued(
            sample_ambiance(),
            &sample_node(),
            Some("notify-1".to_string()),
            Some("parent-1".to_string()),
            None,
        );
        assert_eq!(execution.uuid, "rt-1");
        assert_eq!(execution.status, NodeStatus::Queued);
        assert_eq!(execution.node_id, "n-1");
        assert_eq!(execution.notify_id.as_deref(), Some("notify-1"));
        assert!(!execution.execution_input_configured);
        assert!(execution.end_ts.is_none());
    }

    #[test]
    fn test_queued_execution_decorates_identifier_under_strategy() {
        let mut ambiance = sample_ambiance();
        ambiance.levels.last_mut().unwrap().strategy_metadata = Some(StrategyMetadata {
            current_iteration: 2,
            total_iterations: 5,
            matrix: None,
        });
        let execution = NodeExecution::queued(ambiance, &sample_node(), None, None, None);
        assert_eq!(execution.identifier, "run_script_2");
    }

    #[test]
    fn test_execution_input_flag_follows_template() {
        let mut node = sample_node();
        node.execution_input_template = Some(json!({"approvers": []}));
        let execution = NodeExecution::queued(sample_ambiance(), &node, None, None, None);
        assert!(execution.execution_input_configured);
        assert!(!execution.execution_input_provided);
    }

    #[test]
    fn test_failure_info_accumulates() {
        let info = FailureInfo::new("connection refused").also("retries exhausted");
        assert_eq!(info.message, "connection refused");
        assert_eq!(info.failure_messages.len(), 2);
    }

    #[test]
    fn test_step_outcome_constructors() {
        let ok = StepOutcome::succeeded(Some(json!({"exit_code": 0})));
        assert_eq!(ok.status, NodeStatus::Succeeded);
        assert!(ok.failure_info.is_none());

        let failed = StepOutcome::failed("boom");
        assert_eq!(failed.status, NodeStatus::Failed);
        assert_eq!(failed.failure_info.unwrap().message, "boom");
    }

    #[test]
    fn test_adviser_response_tagged_serde() {
        let response = AdviserResponse::Retry { wait_ms: 1000 };
        let json_str = serde_json::to_string(&response).unwrap();
        assert!(json_str.contains("\"type\":\"retry\""));
        let parsed: AdviserResponse = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, response);

        let next = AdviserResponse::NextStep {
            next_node_id: "n-2".to_string(),
        };
        let json_str = serde_json::to_string(&next).unwrap();
        assert!(json_str.contains("\"type\":\"next_step\""));
    }

    #[test]
    fn test_node_execution_json_roundtrip() {
        let mut execution =
            NodeExecution::queued(sample_ambiance(), &sample_node(), None, None, None);
        execution.mode = Some(StepMode::Async);
        execution.failure_info = Some(FailureInfo::new("late failure"));
        let json_str = serde_json::to_string(&execution).unwrap();
        let parsed: NodeExecution = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, execution);
    }
}
