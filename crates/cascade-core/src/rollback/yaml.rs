//! Rollback-mode workflow document derivation.
//!
//! Filters the original pipeline document down to the stages that actually
//! executed and reverses their order. Stage entries live under
//! `pipeline.stages`, each keyed by `identifier`; parallel groups are a
//! `parallel` array of stage entries.
//!
//! Two modes:
//! - **pipeline rollback** keeps a parallel block whole when any member
//!   executed;
//! - **post-execution rollback** filters parallel blocks down to the members
//!   that executed and drops emptied blocks, and fails fast when a requested
//!   stage is still in progress.

use serde_yaml_ng::Value;

use cascade_types::ambiance::ExecutionMode;
use cascade_types::error::StoreError;
use cascade_types::status::NodeStatus;
use cascade_types::step::StepCategory;

use crate::store::NodeExecutionStore;

/// Name of the synthetic stage that performs pipeline rollback; it never
/// rolls back itself.
pub const PIPELINE_ROLLBACK_STAGE_NAME: &str = "Pipeline Rollback Stage";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// The input document does not parse or lacks the pipeline stage list.
    /// Fatal: the caller must not attempt a partial rollback.
    #[error("unable to transform workflow document for rollback: {0}")]
    MalformedDocument(String),

    /// A requested stage has not finished; no partial rollback of an
    /// in-flight run.
    #[error("stage '{stage}' is still in progress, wait for it to complete")]
    StageStillInProgress { stage: String },

    #[error("unsupported execution mode {0:?} for rollback transformation")]
    UnsupportedMode(ExecutionMode),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// RollbackYamlTransformer
// ---------------------------------------------------------------------------

/// How parallel blocks are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParallelFiltering {
    /// Keep the whole block when any member executed.
    WholeBlock,
    /// Keep only the members that executed; drop emptied blocks.
    Partial,
}

/// Derives the rollback-mode workflow document from the original one.
pub struct RollbackYamlTransformer<S: NodeExecutionStore> {
    store: S,
}

impl<S: NodeExecutionStore> RollbackYamlTransformer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Transforms `document` for the given rollback mode.
    ///
    /// `original_plan_execution_id` identifies the finished run being rolled
    /// back; `stage_node_execution_ids` is the post-execution mode's explicit
    /// selection (ignored in pipeline mode).
    pub async fn transform(
        &self,
        document: &str,
        mode: ExecutionMode,
        original_plan_execution_id: &str,
        stage_node_execution_ids: &[String],
    ) -> Result<String, RollbackError> {
        match mode {
            ExecutionMode::PipelineRollback => {
                self.transform_for_pipeline_rollback(document, original_plan_execution_id)
                    .await
            }
            ExecutionMode::PostExecutionRollback => {
                self.transform_for_post_execution_rollback(
                    document,
                    original_plan_execution_id,
                    stage_node_execution_ids,
                )
                .await
            }
            ExecutionMode::Normal => Err(RollbackError::UnsupportedMode(mode)),
        }
    }

    /// Every stage the original run executed rolls back, in reverse order,
    /// except the synthetic pipeline-rollback stage itself.
    async fn transform_for_pipeline_rollback(
        &self,
        document: &str,
        original_plan_execution_id: &str,
    ) -> Result<String, RollbackError> {
        let executed: Vec<String> = self
            .store
            .fetch_stage_executions(original_plan_execution_id)
            .await?
            .into_iter()
            .filter(|summary| summary.name != PIPELINE_ROLLBACK_STAGE_NAME)
            .map(|summary| summary.identifier)
            .collect();
        tracing::debug!(
            original_plan_execution_id,
            stages = executed.len(),
            "filtering document for pipeline rollback"
        );
        filter_and_reverse_stages(document, &executed, ParallelFiltering::WholeBlock)
    }

    /// Only the requested, finished stages roll back; a looped/matrixed
    /// stage whose strategy wrapper is still spinning counts as executed.
    async fn transform_for_post_execution_rollback(
        &self,
        document: &str,
        original_plan_execution_id: &str,
        stage_node_execution_ids: &[String],
    ) -> Result<String, RollbackError> {
        let summaries = self
            .store
            .fetch_stage_executions(original_plan_execution_id)
            .await?;

        let mut executed = Vec::new();
        for summary in summaries {
            let running_strategy = summary.step_type.category == StepCategory::Strategy
                && summary.status == NodeStatus::Running;
            if stage_node_execution_ids.contains(&summary.uuid)
                && !summary.status.is_terminal()
                && !running_strategy
            {
                return Err(RollbackError::StageStillInProgress {
                    stage: summary.identifier,
                });
            }
            if summary.status.is_terminal() || running_strategy {
                executed.push(summary.identifier);
            }
        }
        filter_and_reverse_stages(document, &executed, ParallelFiltering::Partial)
    }
}

// ---------------------------------------------------------------------------
// Document filtering
// ---------------------------------------------------------------------------

fn filter_and_reverse_stages(
    document: &str,
    executed_stage_ids: &[String],
    filtering: ParallelFiltering,
) -> Result<String, RollbackError> {
    let mut doc: Value = serde_yaml_ng::from_str(document)
        .map_err(|e| RollbackError::MalformedDocument(e.to_string()))?;

    let stages_value = doc
        .get_mut("pipeline")
        .and_then(|pipeline| pipeline.get_mut("stages"))
        .ok_or_else(|| {
            RollbackError::MalformedDocument("document has no pipeline.stages list".to_string())
        })?;
    let stages = stages_value
        .as_sequence()
        .ok_or_else(|| {
            RollbackError::MalformedDocument("pipeline.stages is not a list".to_string())
        })?
        .clone();

    let mut reversed: Vec<Value> = Vec::with_capacity(stages.len());
    for entry in stages.iter().rev() {
        match entry.get("parallel") {
            None => {
                if executed_stage_ids.contains(&stage_identifier(entry)?) {
                    reversed.push(entry.clone());
                }
            }
            Some(parallel) => {
                let members = parallel.as_sequence().ok_or_else(|| {
                    RollbackError::MalformedDocument("parallel block is not a list".to_string())
                })?;
                match filtering {
                    ParallelFiltering::WholeBlock => {
                        let mut any_executed = false;
                        for member in members {
                            if executed_stage_ids.contains(&stage_identifier(member)?) {
                                any_executed = true;
                                break;
                            }
                        }
                        if any_executed {
                            reversed.push(entry.clone());
                        }
                    }
                    ParallelFiltering::Partial => {
                        let mut kept: Vec<Value> = Vec::new();
                        for member in members {
                            if executed_stage_ids.contains(&stage_identifier(member)?) {
                                kept.push(member.clone());
                            }
                        }
                        if !kept.is_empty() {
                            let mut block = entry.clone();
                            if let Value::Mapping(map) = &mut block {
                                map.insert(
                                    Value::String("parallel".to_string()),
                                    Value::Sequence(kept),
                                );
                            }
                            reversed.push(block);
                        }
                    }
                }
            }
        }
    }

    *stages_value = Value::Sequence(reversed);
    serde_yaml_ng::to_string(&doc).map_err(|e| RollbackError::MalformedDocument(e.to_string()))
}

fn stage_identifier(entry: &Value) -> Result<String, RollbackError> {
    entry
        .get("stage")
        .and_then(|stage| stage.get("identifier"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RollbackError::MalformedDocument("stage entry has no identifier".to_string())
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
