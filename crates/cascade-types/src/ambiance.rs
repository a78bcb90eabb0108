//! Hierarchical execution context ("ambiance") for a node execution.
//!
//! An `Ambiance` identifies where in the compiled plan graph an operation is
//! happening: an append-only stack of `Level`s plus run-scoped metadata
//! (scope keys, trigger info, feature flags, settings). It is a value type:
//! every transformation returns a new `Ambiance`, nothing mutates in place,
//! so instances can be shared freely across tasks.
//!
//! The current level is always the last element of the stack; the parent is
//! the second-to-last. Cloning for a child appends one level; cloning for
//! completion truncates back to the parent's prefix.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::step::{StepCategory, StepType};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Reserved matrix-values key whose value is always appended last to a
/// strategy identifier postfix, used to disambiguate duplicate combinations.
pub const MATRIX_DUPLICATE_POSTFIX_KEY: &str = "__duplicate_postfix";

/// Maximum length of a strategy postfix body before truncation.
pub const MAX_POSTFIX_LEN: usize = 126;

/// Setup-abstraction keys identifying the run's scope.
pub mod setup_keys {
    pub const ACCOUNT_ID: &str = "account_id";
    pub const ORG_ID: &str = "org_id";
    pub const PROJECT_ID: &str = "project_id";
}

/// Per-run setting keys consulted by the engine.
pub mod settings {
    /// When enabled, matrix node identifiers use field values instead of the
    /// iteration index.
    pub const USE_MATRIX_FIELD_NAMES: &str = "use_matrix_field_names";
}

// ---------------------------------------------------------------------------
// Strategy metadata
// ---------------------------------------------------------------------------

/// Matrix coordinates for one combination of a matrix strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixMetadata {
    /// User-provided display name for this combination, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Axis values for this combination. A `BTreeMap` so the derived
    /// identifier slug is inherently sorted by key.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    /// Axis keys excluded from the derived identifier slug.
    #[serde(default)]
    pub keys_to_skip_in_name: Vec<String>,
}

/// Iteration/matrix position of a looped or matrixed node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub current_iteration: u32,
    pub total_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixMetadata>,
}

impl StrategyMetadata {
    /// The identifier postfix for this strategy position.
    ///
    /// Deterministic: the same metadata and mode always yield the same
    /// postfix. The body is truncated to [`MAX_POSTFIX_LEN`] characters and
    /// every non-alphanumeric character is folded to `_`. The reserved
    /// duplicate-postfix value, when present, is appended last regardless of
    /// which naming mode is active.
    pub fn identifier_postfix(&self, use_matrix_field_names: bool) -> String {
        let Some(matrix) = self.matrix.as_ref().filter(|m| !m.values.is_empty()) else {
            return self.iteration_postfix();
        };

        let mut body = if let Some(name) = matrix.node_name.as_deref().filter(|n| !n.is_empty()) {
            name.to_string()
        } else if use_matrix_field_names {
            matrix
                .values
                .iter()
                .filter(|(key, _)| {
                    !matrix.keys_to_skip_in_name.contains(*key)
                        && key.as_str() != MATRIX_DUPLICATE_POSTFIX_KEY
                })
                .map(|(_, value)| value.replace('.', ""))
                .collect::<Vec<_>>()
                .join("_")
        } else {
            self.current_iteration.to_string()
        };

        if let Some(dup) = matrix.values.get(MATRIX_DUPLICATE_POSTFIX_KEY) {
            body = format!("{body}_{dup}");
        }

        let truncated: String = body.chars().take(MAX_POSTFIX_LEN).collect();
        format!("_{truncated}")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    fn iteration_postfix(&self) -> String {
        if self.total_iterations == 0 {
            String::new()
        } else {
            format!("_{}", self.current_iteration)
        }
    }
}

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// One entry in the ambiance level stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Static plan-node id this level refers to.
    pub setup_id: String,
    /// This execution's runtime instance id.
    pub runtime_id: String,
    /// User-visible identifier of the node.
    pub identifier: String,
    /// Structural group label (e.g. "STAGE", "STAGES", "STEP_GROUP").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_metadata: Option<StrategyMetadata>,
    /// 0 on first execution; incremented per adviser-driven retry.
    #[serde(default)]
    pub retry_index: u32,
    /// Levels with this flag set are excluded from fully-qualified names.
    #[serde(default)]
    pub skip_expression_chain: bool,
    /// Millisecond timestamp at which this level was entered.
    #[serde(default)]
    pub start_ts: i64,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
            group: None,
            step_type,
            strategy_metadata: None,
            retry_index: 0,
            skip_expression_chain: false,
            start_ts: 0,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_strategy_metadata(mut self, metadata: StrategyMetadata) -> Self {
        self.strategy_metadata = Some(metadata);
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    pub fn with_skip_expression_chain(mut self, skip: bool) -> Self {
        self.skip_expression_chain = skip;
        self
    }

    fn is_stage(&self) -> bool {
        self.step_type.category == StepCategory::Stage || self.group.as_deref() == Some("STAGE")
    }

    fn qualifies_for_fqn(&self) -> bool {
        !self.identifier.is_empty() && !self.setup_id.is_empty() && !self.skip_expression_chain
    }
}

// ---------------------------------------------------------------------------
// Execution metadata
// ---------------------------------------------------------------------------

/// How the run was started and by whom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Trigger kind (e.g. "manual", "webhook", "scheduled", "rollback").
    pub kind: String,
    /// Identifier of the triggering principal.
    pub principal: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

/// Execution mode of the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Normal,
    PipelineRollback,
    PostExecutionRollback,
}

/// Run-scoped metadata carried on every ambiance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub pipeline_identifier: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub trigger_info: TriggerInfo,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub run_sequence: u32,
    /// The source run's plan execution id when running in a rollback mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_plan_execution_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Ambiance
// ---------------------------------------------------------------------------

/// Immutable hierarchical execution context for one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    /// Id of the compiled plan.
    pub plan_id: String,
    /// Id of this run of the plan.
    pub plan_execution_id: String,
    /// Runtime id of the owning stage execution, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_execution_id: Option<String>,
    /// The source run's stage execution id when running in a rollback mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_stage_execution_id: Option<String>,
    pub levels: Vec<Level>,
    /// Scope keys (account/org/project and similar).
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl Ambiance {
    pub fn new(plan_id: impl Into<String>, plan_execution_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            plan_execution_id: plan_execution_id.into(),
            stage_execution_id: None,
            original_stage_execution_id: None,
            levels: Vec::new(),
            setup_abstractions: HashMap::new(),
            metadata: ExecutionMetadata::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Level-stack access
    // -----------------------------------------------------------------------

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn parent_level(&self) -> Option<&Level> {
        if self.levels.len() < 2 {
            return None;
        }
        self.levels.get(self.levels.len() - 2)
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level()
            .map(|l| l.runtime_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level()
            .map(|l| l.setup_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        self.parent_level().map(|l| l.runtime_id.as_str())
    }

    // -----------------------------------------------------------------------
    // Cloning (always returns a new value)
    // -----------------------------------------------------------------------

    /// Context for a child node execution: this context plus one level.
    pub fn clone_for_child(&self, level: Level) -> Ambiance {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Context for bubbling a completion to the parent: drops the current
    /// level. On an empty stack this is the identity.
    pub fn clone_for_finish(&self) -> Ambiance {
        let mut cloned = self.clone();
        cloned.levels.pop();
        cloned
    }

    /// Drops the current level and appends a replacement terminal level.
    pub fn clone_for_finish_with(&self, level: Level) -> Ambiance {
        let mut cloned = self.clone_for_finish();
        cloned.levels.push(level);
        cloned
    }

    // -----------------------------------------------------------------------
    // Find-level family
    // -----------------------------------------------------------------------

    /// Nearest enclosing level matching `pred`, scanning from the end.
    pub fn nearest_level_where<F: Fn(&Level) -> bool>(&self, pred: F) -> Option<&Level> {
        self.levels.iter().rev().find(|l| pred(l))
    }

    /// First (outermost) level matching `pred`, scanning from the start.
    ///
    /// Not interchangeable with [`Self::nearest_level_where`]: with nested
    /// matches the two return different levels.
    pub fn first_level_where<F: Fn(&Level) -> bool>(&self, pred: F) -> Option<&Level> {
        self.levels.iter().find(|l| pred(l))
    }

    pub fn nearest_stage_level(&self) -> Option<&Level> {
        self.nearest_level_where(Level::is_stage)
    }

    pub fn outermost_stage_level(&self) -> Option<&Level> {
        self.first_level_where(Level::is_stage)
    }

    pub fn nearest_strategy_level(&self) -> Option<&Level> {
        self.nearest_level_where(|l| l.step_type.category == StepCategory::Strategy)
    }

    pub fn outermost_strategy_level(&self) -> Option<&Level> {
        self.first_level_where(|l| l.step_type.category == StepCategory::Strategy)
    }

    pub fn nearest_step_group_level(&self) -> Option<&Level> {
        self.nearest_level_where(|l| l.step_type.category == StepCategory::StepGroup)
    }

    /// Nearest step-group level whose immediate parent is a strategy level.
    pub fn nearest_step_group_level_under_strategy(&self) -> Option<&Level> {
        for index in (1..self.levels.len()).rev() {
            let level = &self.levels[index];
            let parent = &self.levels[index - 1];
            if level.step_type.category == StepCategory::StepGroup
                && parent.step_type.category == StepCategory::Strategy
            {
                return Some(level);
            }
        }
        None
    }

    pub fn stage_runtime_id(&self) -> Option<&str> {
        self.nearest_stage_level().map(|l| l.runtime_id.as_str())
    }

    // -----------------------------------------------------------------------
    // Scope and metadata accessors
    // -----------------------------------------------------------------------

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions
            .get(setup_keys::ACCOUNT_ID)
            .map(String::as_str)
    }

    pub fn org_id(&self) -> Option<&str> {
        self.setup_abstractions
            .get(setup_keys::ORG_ID)
            .map(String::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.setup_abstractions
            .get(setup_keys::PROJECT_ID)
            .map(String::as_str)
    }

    /// Whether the current level is a retried execution.
    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index != 0)
    }

    pub fn is_rollback_mode(&self) -> bool {
        matches!(
            self.metadata.execution_mode,
            ExecutionMode::PipelineRollback | ExecutionMode::PostExecutionRollback
        )
    }

    /// The plan execution whose recorded data this run reads: the original
    /// run's id in rollback modes, otherwise this run's own id.
    pub fn effective_plan_execution_id(&self) -> &str {
        if self.is_rollback_mode() {
            if let Some(original) = self.metadata.original_plan_execution_id.as_deref() {
                return original;
            }
        }
        &self.plan_execution_id
    }

    pub fn effective_stage_execution_id(&self) -> Option<&str> {
        if self.is_rollback_mode() {
            self.original_stage_execution_id.as_deref()
        } else {
            self.stage_execution_id.as_deref()
        }
    }

    pub fn setting_enabled(&self, key: &str) -> bool {
        self.metadata.settings.get(key).map(String::as_str) == Some("true")
    }

    pub fn setting_value(&self, key: &str) -> Option<&str> {
        self.metadata.settings.get(key).map(String::as_str)
    }

    pub fn feature_flag_enabled(&self, name: &str) -> bool {
        self.metadata.feature_flags.get(name).copied().unwrap_or(false)
    }

    pub fn enabled_feature_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = self
            .metadata
            .feature_flags
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone())
            .collect();
        flags.sort();
        flags
    }

    pub fn use_matrix_field_names(&self) -> bool {
        self.setting_enabled(settings::USE_MATRIX_FIELD_NAMES)
    }

    // -----------------------------------------------------------------------
    // Naming
    // -----------------------------------------------------------------------

    /// Applies the current level's strategy postfix to `identifier`.
    ///
    /// Levels without strategy metadata keep the identifier unchanged.
    pub fn decorated_identifier(&self, identifier: &str) -> String {
        match self.current_level().and_then(|l| l.strategy_metadata.as_ref()) {
            Some(metadata) => format!(
                "{identifier}{}",
                metadata.identifier_postfix(self.use_matrix_field_names())
            ),
            None => identifier.to_string(),
        }
    }

    /// Fully-qualified name: level identifiers joined with `.`, excluding
    /// levels that do not take part in the expression chain.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .filter(|l| l.qualifies_for_fqn())
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Structured fields for tracing spans/events.
    pub fn log_fields(&self) -> HashMap<String, String> {
        let mut fields = self.setup_abstractions.clone();
        fields.insert("plan_execution_id".to_string(), self.plan_execution_id.clone());
        if !self.metadata.pipeline_identifier.is_empty() {
            fields.insert(
                "pipeline_identifier".to_string(),
                self.metadata.pipeline_identifier.clone(),
            );
        }
        if let Some(level) = self.current_level() {
            fields.insert("identifier".to_string(), level.identifier.clone());
            fields.insert("runtime_id".to_string(), level.runtime_id.clone());
            fields.insert("setup_id".to_string(), level.setup_id.clone());
            fields.insert("step_type".to_string(), level.step_type.name.clone());
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
