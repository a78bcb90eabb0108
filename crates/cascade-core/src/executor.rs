//! The node execution state machine.
//!
//! `NodeExecutor` drives a single node execution through its life cycle:
//!
//! 1. `create_node_execution` persists a Queued execution.
//! 2. `start_execution` resolves parameters, runs pre-facilitation checks
//!    (interrupts, when-condition skip), gates on execution input, and either
//!    publishes a custom-facilitation event or decides the mode inline.
//! 3. `process_facilitation_response` persists the mode, re-checks
//!    interrupts, and starts the step body (inline, or suspending for an
//!    external callback).
//! 4. `resume_node_execution` handles correlated external responses.
//! 5. `process_step_response` normalizes outcomes, `process_adviser_response`
//!    applies the advisers' directive, and `end_node_execution` propagates
//!    completion to the waiting parent or concludes the run.
//!
//! Every status change goes through the store's guarded transition; a
//! rejected transition is a lost race and a normal no-op. Any error escaping
//! a lifecycle step funnels through `handle_error`, which converts it into a
//! failed step response so advisers see infrastructure failures exactly like
//! business failures. A secondary error while handling the first is logged
//! and never re-raised.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use cascade_types::ambiance::Ambiance;
use cascade_types::error::StoreError;
use cascade_types::execution::{
    AdviserResponse, FailureInfo, NodeExecution, StepCompletion, StepOutcome,
};
use cascade_types::plan::PlanNode;
use cascade_types::status::NodeStatus;
use cascade_types::step::StepMode;

use crate::advise::{AdviseError, AdviserDispatch};
use crate::event::{EngineEvent, EventBus};
use crate::expression::{ExpressionError, ExpressionService, ParameterResolver};
use crate::facilitation::{
    FacilitationEngine, FacilitationError, FacilitatorResponse, PreCheckOutcome,
    evaluate_when_condition,
};
use crate::interrupt::InterruptRegistry;
use crate::notify::CorrelationBus;
use crate::steps::{StepContext, StepRegistry};
use crate::store::{NodeExecutionStore, PlanStore};

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that can occur while driving a node execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("facilitation error: {0}")]
    Facilitation(#[from] FacilitationError),

    #[error("advise error: {0}")]
    Advise(#[from] AdviseError),

    #[error("ambiance has no current level")]
    MissingLevel,

    #[error("no step handler registered for step type '{0}'")]
    MissingStepHandler(String),
}

// ---------------------------------------------------------------------------
// NodeExecutor
// ---------------------------------------------------------------------------

/// The state machine for plan-node executions.
///
/// Generic over its ports for storage flexibility. The executor is shared
/// across tasks; all interior state lives behind concurrent primitives.
pub struct NodeExecutor<P, S, X, I>
where
    P: PlanStore,
    S: NodeExecutionStore,
    X: ExpressionService,
    I: InterruptRegistry,
{
    plan_store: P,
    node_store: S,
    expressions: X,
    interrupts: I,
    facilitation: FacilitationEngine,
    advisers: AdviserDispatch,
    steps: StepRegistry,
    event_bus: EventBus,
    correlation_bus: Arc<CorrelationBus>,
}

impl<P, S, X, I> NodeExecutor<P, S, X, I>
where
    P: PlanStore,
    S: NodeExecutionStore,
    X: ExpressionService,
    I: InterruptRegistry,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_store: P,
        node_store: S,
        expressions: X,
        interrupts: I,
        facilitation: FacilitationEngine,
        advisers: AdviserDispatch,
        steps: StepRegistry,
        event_bus: EventBus,
        correlation_bus: Arc<CorrelationBus>,
    ) -> Self {
        Self {
            plan_store,
            node_store,
            expressions,
            interrupts,
            facilitation,
            advisers,
            steps,
            event_bus,
            correlation_bus,
        }
    }

    pub fn node_store(&self) -> &S {
        &self.node_store
    }

    pub fn plan_store(&self) -> &P {
        &self.plan_store
    }

    pub fn interrupts(&self) -> &I {
        &self.interrupts
    }

    pub fn correlation_bus(&self) -> &Arc<CorrelationBus> {
        &self.correlation_bus
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    /// Builds and persists a Queued execution of `node` under `ambiance`.
    ///
    /// The execution's uuid is the ambiance's current runtime id; strategy
    /// metadata rides on the current level and decorates the identifier. No
    /// side effects beyond persistence.
    pub async fn create_node_execution(
        &self,
        ambiance: Ambiance,
        node: &PlanNode,
        notify_id: Option<String>,
        parent_id: Option<String>,
        previous_id: Option<String>,
    ) -> Result<NodeExecution, ExecutorError> {
        let execution = NodeExecution::queued(ambiance, node, notify_id, parent_id, previous_id);
        self.node_store.save(&execution).await?;
        tracing::info!(
            node_execution_id = execution.uuid.as_str(),
            node_id = execution.node_id.as_str(),
            identifier = execution.identifier.as_str(),
            "created node execution"
        );
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Facilitates and starts the node at the ambiance's current level.
    ///
    /// Errors never escape: they funnel through `handle_error` so advisers
    /// get to react to them like any other failure.
    pub async fn start_execution(&self, ambiance: &Ambiance) {
        if let Err(error) = self.start_execution_inner(ambiance).await {
            tracing::error!(
                node_execution_id = ambiance.current_runtime_id().unwrap_or_default(),
                plan_execution_id = ambiance.plan_execution_id.as_str(),
                error = %error,
                "start failed"
            );
            self.handle_error(ambiance, error).await;
        }
    }

    async fn start_execution_inner(&self, ambiance: &Ambiance) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let node_id = ambiance
            .current_setup_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let mut node = self.plan_store.fetch_node(&ambiance.plan_id, node_id).await?;
        let execution = self.node_store.get(node_execution_id).await?;

        // Externally supplied input merges over the node's own parameters.
        if let Some(input) = &execution.execution_input {
            node.step_parameters = merge_values(node.step_parameters, input);
        }

        match ParameterResolver::resolve(&self.expressions, ambiance, &node) {
            Ok(resolved) => {
                self.node_store
                    .update(node_execution_id, |e| {
                        e.resolved_params = Some(resolved.resolved_params.clone());
                        e.step_inputs = Some(resolved.step_inputs.clone());
                    })
                    .await?;
            }
            Err(resolution_error) => {
                // A failed resolution is swallowed only when the node would
                // not have proceeded anyway; otherwise the original error
                // wins.
                return match self.pre_facilitation_checks(ambiance, &node).await? {
                    PreCheckOutcome::Proceed { .. } => Err(resolution_error.into()),
                    PreCheckOutcome::Blocked { reason } => {
                        tracing::info!(reason = reason.as_str(), "not proceeding");
                        Ok(())
                    }
                    PreCheckOutcome::Skip { reason } => {
                        tracing::info!(reason = reason.as_str(), "skipping node");
                        self.conclude_execution(
                            ambiance,
                            NodeStatus::Skipped,
                            NodeStatus::Queued,
                            &[],
                        )
                        .await
                    }
                };
            }
        }

        match self.pre_facilitation_checks(ambiance, &node).await? {
            PreCheckOutcome::Blocked { reason } => {
                tracing::info!(reason = reason.as_str(), "not proceeding");
                return Ok(());
            }
            PreCheckOutcome::Skip { reason } => {
                tracing::info!(reason = reason.as_str(), "skipping node");
                return self
                    .conclude_execution(ambiance, NodeStatus::Skipped, NodeStatus::Queued, &[])
                    .await;
            }
            PreCheckOutcome::Proceed { reason } => {
                tracing::debug!(reason = reason.as_str(), "proceeding");
            }
        }

        // Execution-input gate: suspend until input arrives.
        if execution.execution_input_configured && !execution.execution_input_provided {
            let paused = self
                .node_store
                .update_status_with_ops(
                    node_execution_id,
                    NodeStatus::Paused,
                    |_| {},
                    &[NodeStatus::Queued],
                )
                .await?;
            if paused.is_some() {
                self.event_bus.publish(EngineEvent::ExecutionInputRequested {
                    ambiance: ambiance.clone(),
                    node_execution_id: node_execution_id.to_string(),
                });
            }
            return Ok(());
        }

        if self.facilitation.custom_facilitator_present(&node) {
            self.event_bus.publish(EngineEvent::FacilitationRequested {
                ambiance: ambiance.clone(),
                node_id: node.uuid.clone(),
            });
            return Ok(());
        }

        let response = self.facilitation.facilitator_response(ambiance, &node)?;
        self.process_facilitation_response_inner(ambiance, response)
            .await
    }

    /// Retry bypass, interrupts, then the when-condition, in that order.
    async fn pre_facilitation_checks(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<PreCheckOutcome, ExecutorError> {
        if ambiance.is_retry() {
            // The retry decision already accounted for open interrupts.
            return Ok(PreCheckOutcome::Proceed {
                reason: "node is retried".to_string(),
            });
        }
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let mut related_ids = Vec::new();
        if let Some(stage_runtime_id) = ambiance.stage_runtime_id() {
            related_ids.push(stage_runtime_id.to_string());
        }
        let check = self
            .interrupts
            .check_pre_invocation(&ambiance.plan_execution_id, node_execution_id, &related_ids)
            .await?;
        if !check.proceed {
            return Ok(PreCheckOutcome::Blocked {
                reason: check.reason,
            });
        }
        if evaluate_when_condition(&self.expressions, ambiance, node) == Some(false) {
            return Ok(PreCheckOutcome::Skip {
                reason: format!(
                    "when condition '{}' evaluated to false",
                    node.when_condition.as_deref().unwrap_or_default()
                ),
            });
        }
        Ok(PreCheckOutcome::Proceed {
            reason: check.reason,
        })
    }

    // -----------------------------------------------------------------------
    // facilitation response
    // -----------------------------------------------------------------------

    /// Persists the chosen mode and, interrupts permitting, starts the step
    /// body. Answers both inline facilitation and external facilitators.
    pub async fn process_facilitation_response(
        &self,
        ambiance: &Ambiance,
        response: FacilitatorResponse,
    ) {
        if let Err(error) = self
            .process_facilitation_response_inner(ambiance, response)
            .await
        {
            tracing::error!(
                node_execution_id = ambiance.current_runtime_id().unwrap_or_default(),
                plan_execution_id = ambiance.plan_execution_id.as_str(),
                error = %error,
                "processing facilitation response failed"
            );
            self.handle_error(ambiance, error).await;
        }
    }

    async fn process_facilitation_response_inner(
        &self,
        ambiance: &Ambiance,
        response: FacilitatorResponse,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        self.node_store
            .update(node_execution_id, |e| e.mode = Some(response.mode))
            .await?;

        // The window between facilitation and start must still honor a
        // concurrently issued abort/expire, scoped to this node and its
        // owning stage.
        let mut related_ids = vec![node_execution_id.to_string()];
        if let Some(stage_runtime_id) = ambiance.stage_runtime_id() {
            related_ids.push(stage_runtime_id.to_string());
        }
        let check = self
            .interrupts
            .check_pre_invocation(&ambiance.plan_execution_id, node_execution_id, &related_ids)
            .await?;
        if !check.proceed {
            tracing::info!(reason = check.reason.as_str(), "not starting");
            return Ok(());
        }
        self.start_node(ambiance, response).await
    }

    async fn start_node(
        &self,
        ambiance: &Ambiance,
        response: FacilitatorResponse,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let Some(running) = self
            .node_store
            .update_status_with_ops(
                node_execution_id,
                NodeStatus::Running,
                |_| {},
                &[NodeStatus::Queued],
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id,
                "not starting, status transition rejected"
            );
            return Ok(());
        };

        match response.mode {
            StepMode::Sync => {
                self.event_bus.publish(EngineEvent::NodeStarted {
                    ambiance: ambiance.clone(),
                    node_execution_id: node_execution_id.to_string(),
                    mode: StepMode::Sync,
                });
                let handler = self
                    .steps
                    .get(&running.step_type.name)
                    .ok_or_else(|| {
                        ExecutorError::MissingStepHandler(running.step_type.name.clone())
                    })?;
                let params = running.resolved_params.clone().unwrap_or(Value::Null);
                let outcome = match handler.execute(&StepContext {
                    ambiance,
                    resolved_params: &params,
                }) {
                    Ok(outcome) => outcome,
                    Err(error) => StepOutcome::failed(error.to_string()),
                };
                self.process_step_response_inner(ambiance, outcome).await
            }
            StepMode::Async | StepMode::Task => {
                let waiting = if response.mode == StepMode::Task {
                    NodeStatus::TaskWaiting
                } else {
                    NodeStatus::AsyncWaiting
                };
                self.node_store
                    .update_status_with_ops(
                        node_execution_id,
                        waiting,
                        |_| {},
                        &[NodeStatus::Running],
                    )
                    .await?;
                self.event_bus.publish(EngineEvent::NodeStarted {
                    ambiance: ambiance.clone(),
                    node_execution_id: node_execution_id.to_string(),
                    mode: response.mode,
                });
                Ok(())
            }
            StepMode::Child | StepMode::ChildChain => {
                self.event_bus.publish(EngineEvent::SpawnChild {
                    ambiance: ambiance.clone(),
                    node_execution_id: node_execution_id.to_string(),
                    mode: response.mode,
                });
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // resume
    // -----------------------------------------------------------------------

    /// Handles a correlated external response for a suspended node.
    ///
    /// `async_error` marks a transport-level failure, as opposed to the step
    /// itself reporting a business failure; both unify into the same failed
    /// pathway before advisers run.
    pub async fn resume_node_execution(
        &self,
        ambiance: &Ambiance,
        responses: HashMap<String, Value>,
        async_error: bool,
    ) {
        if let Err(error) = self
            .resume_node_execution_inner(ambiance, responses, async_error)
            .await
        {
            tracing::error!(
                node_execution_id = ambiance.current_runtime_id().unwrap_or_default(),
                plan_execution_id = ambiance.plan_execution_id.as_str(),
                error = %error,
                "resume failed"
            );
            self.handle_error(ambiance, error).await;
        }
    }

    async fn resume_node_execution_inner(
        &self,
        ambiance: &Ambiance,
        responses: HashMap<String, Value>,
        async_error: bool,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let mut execution = self.node_store.get(node_execution_id).await?;
        if !execution.status.is_resumable() {
            tracing::warn!(
                node_execution_id,
                status = ?execution.status,
                "node execution is no longer in a resumable state"
            );
            return Ok(());
        }

        if execution.status != NodeStatus::Running {
            let previous = execution.status;
            tracing::info!(node_execution_id, previous = ?previous, "marking running on resume");
            let Some(updated) = self
                .node_store
                .update_status_with_ops(node_execution_id, NodeStatus::Running, |_| {}, &[])
                .await?
            else {
                tracing::warn!(node_execution_id, "resume lost the status race");
                return Ok(());
            };
            execution = updated;
            // A previously flowing node never changed the run aggregate.
            if !previous.is_flowing() {
                self.recalculate_run_status(&ambiance.plan_execution_id)
                    .await?;
            }
        } else {
            tracing::debug!(node_execution_id, "already running on resume");
        }

        let outcome = if async_error {
            let message = responses
                .values()
                .find_map(|value| value.get("error_message").and_then(Value::as_str))
                .unwrap_or("asynchronous callback reported a transport error");
            StepOutcome::failed(message)
        } else {
            let handler = self
                .steps
                .get(&execution.step_type.name)
                .ok_or_else(|| ExecutorError::MissingStepHandler(execution.step_type.name.clone()))?;
            let params = execution.resolved_params.clone().unwrap_or(Value::Null);
            match handler.resume(
                &StepContext {
                    ambiance,
                    resolved_params: &params,
                },
                responses,
            ) {
                Ok(outcome) => outcome,
                Err(error) => StepOutcome::failed(error.to_string()),
            }
        };
        self.process_step_response_inner(ambiance, outcome).await
    }

    /// Derives the run-level aggregate from the node tree and announces it.
    async fn recalculate_run_status(
        &self,
        plan_execution_id: &str,
    ) -> Result<(), ExecutorError> {
        let executions = self
            .node_store
            .fetch_by_plan_execution(plan_execution_id)
            .await?;
        let status = aggregate_status(&executions);
        self.event_bus.publish(EngineEvent::RunStatusChanged {
            plan_execution_id: plan_execution_id.to_string(),
            status,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // conclusion
    // -----------------------------------------------------------------------

    /// Applies a terminal status. Without advisers the node ends directly;
    /// with advisers they get a chance to redirect the outcome first.
    pub async fn conclude_execution(
        &self,
        ambiance: &Ambiance,
        to_status: NodeStatus,
        from_status: NodeStatus,
        allowed_override: &[NodeStatus],
    ) -> Result<(), ExecutorError> {
        let level = ambiance.current_level().ok_or(ExecutorError::MissingLevel)?;
        let node = self
            .plan_store
            .fetch_node(&ambiance.plan_id, &level.setup_id)
            .await?;

        if !node.has_advisers() {
            let Some(updated) = self
                .node_store
                .update_status_with_ops(&level.runtime_id, to_status, |_| {}, allowed_override)
                .await?
            else {
                tracing::warn!(
                    node_execution_id = level.runtime_id.as_str(),
                    to = ?to_status,
                    "cannot conclude, status transition rejected"
                );
                return Ok(());
            };
            return self.end_node_execution(&updated.ambiance).await;
        }

        let Some(updated) = self
            .node_store
            .update_status_with_ops(
                &level.runtime_id,
                to_status,
                |e| e.end_ts = Some(Utc::now()),
                allowed_override,
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id = level.runtime_id.as_str(),
                to = ?to_status,
                "cannot conclude, status transition rejected"
            );
            return Ok(());
        };
        self.advise(&updated, &node, from_status).await
    }

    // -----------------------------------------------------------------------
    // step response
    // -----------------------------------------------------------------------

    /// Normalizes a step's result into persisted status, outputs, and
    /// failure info, then ends or advises.
    pub async fn process_step_response(&self, ambiance: &Ambiance, outcome: StepOutcome) {
        if let Err(error) = self.process_step_response_inner(ambiance, outcome).await {
            tracing::error!(
                node_execution_id = ambiance.current_runtime_id().unwrap_or_default(),
                plan_execution_id = ambiance.plan_execution_id.as_str(),
                error = %error,
                "handling step response failed"
            );
            self.handle_error(ambiance, error).await;
        }
    }

    async fn process_step_response_inner(
        &self,
        ambiance: &Ambiance,
        outcome: StepOutcome,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let node_id = ambiance
            .current_setup_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let node = self.plan_store.fetch_node(&ambiance.plan_id, node_id).await?;
        let previous_status = self.node_store.get(node_execution_id).await?.status;

        let Some(updated) = self
            .node_store
            .update_status_with_ops(
                node_execution_id,
                outcome.status,
                |e| {
                    if outcome.outputs.is_some() {
                        e.outputs = outcome.outputs.clone();
                    }
                    if let Some(info) = outcome.failure_info.clone() {
                        e.failure_info = Some(match e.failure_info.take() {
                            Some(previous) => previous.also(info.message),
                            None => info,
                        });
                    }
                    e.end_ts = Some(Utc::now());
                },
                &[],
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id,
                to = ?outcome.status,
                "step response dropped, status transition rejected"
            );
            return Ok(());
        };

        if !node.has_advisers() {
            tracing::info!(node_execution_id, "no advisers, ending execution");
            return self.end_node_execution(&updated.ambiance).await;
        }
        self.advise(&updated, &node, previous_status).await
    }

    async fn advise(
        &self,
        execution: &NodeExecution,
        node: &PlanNode,
        from_status: NodeStatus,
    ) -> Result<(), ExecutorError> {
        let response = self.advisers.first_response(node, execution, from_status)?;
        self.process_adviser_response(&execution.ambiance, response)
            .await
    }

    // -----------------------------------------------------------------------
    // adviser response
    // -----------------------------------------------------------------------

    /// Applies an adviser directive, or ends the node when there is none.
    pub async fn process_adviser_response(
        &self,
        ambiance: &Ambiance,
        response: Option<AdviserResponse>,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let Some(response) = response else {
            tracing::info!(node_execution_id, "no adviser directive, ending execution");
            return self.end_node_execution(ambiance).await;
        };
        tracing::info!(node_execution_id, directive = ?response, "handling adviser response");
        let updated = self
            .node_store
            .update(node_execution_id, |e| {
                e.adviser_response = Some(response.clone())
            })
            .await?;

        match response {
            AdviserResponse::NextStep { next_node_id } => {
                self.event_bus.publish(EngineEvent::RunNextNode {
                    ambiance: ambiance.clone_for_finish(),
                    next_node_id,
                    previous_execution_id: node_execution_id.to_string(),
                });
                Ok(())
            }
            AdviserResponse::Retry { wait_ms } => self.initiate_retry(&updated, wait_ms).await,
            AdviserResponse::MarkSuccess { next_node_id }
            | AdviserResponse::IgnoreFailure { next_node_id } => {
                // Failure info stays recorded; only the outcome flips.
                let Some(succeeded) = self
                    .node_store
                    .update_status_with_ops(
                        node_execution_id,
                        NodeStatus::Succeeded,
                        |e| e.end_ts = Some(Utc::now()),
                        &[
                            NodeStatus::Failed,
                            NodeStatus::Errored,
                            NodeStatus::Expired,
                            NodeStatus::Aborted,
                        ],
                    )
                    .await?
                else {
                    tracing::warn!(node_execution_id, "cannot overwrite outcome, transition rejected");
                    return Ok(());
                };
                match next_node_id {
                    Some(next_node_id) => {
                        self.event_bus.publish(EngineEvent::RunNextNode {
                            ambiance: ambiance.clone_for_finish(),
                            next_node_id,
                            previous_execution_id: node_execution_id.to_string(),
                        });
                        Ok(())
                    }
                    None => self.end_node_execution(&succeeded.ambiance).await,
                }
            }
            AdviserResponse::EndPlan { abort } => {
                self.event_bus.publish(EngineEvent::PlanEndRequested {
                    plan_execution_id: ambiance.plan_execution_id.clone(),
                    abort,
                });
                self.end_node_execution(ambiance).await
            }
        }
    }

    /// Creates and starts a fresh execution of the same node with a bumped
    /// retry index on a new runtime id.
    async fn initiate_retry(
        &self,
        execution: &NodeExecution,
        wait_ms: u64,
    ) -> Result<(), ExecutorError> {
        let level = execution
            .ambiance
            .current_level()
            .ok_or(ExecutorError::MissingLevel)?;
        let mut retry_level = level.clone();
        retry_level.runtime_id = Uuid::now_v7().to_string();
        retry_level.retry_index = level.retry_index + 1;
        retry_level.start_ts = Utc::now().timestamp_millis();
        let retry_ambiance = execution.ambiance.clone_for_finish_with(retry_level);

        let node = self
            .plan_store
            .fetch_node(&retry_ambiance.plan_id, &execution.node_id)
            .await?;
        let retry_execution = self
            .create_node_execution(
                retry_ambiance.clone(),
                &node,
                execution.notify_id.clone(),
                execution.parent_id.clone(),
                execution.previous_id.clone(),
            )
            .await?;

        tracing::info!(
            retried_execution_id = execution.uuid.as_str(),
            new_execution_id = retry_execution.uuid.as_str(),
            wait_ms,
            "re-queued node for retry"
        );
        self.event_bus.publish(EngineEvent::RetryScheduled {
            ambiance: retry_ambiance.clone(),
            retried_execution_id: execution.uuid.clone(),
            new_execution_id: retry_execution.uuid.clone(),
            wait_ms,
        });
        Box::pin(self.start_execution(&retry_ambiance)).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // end
    // -----------------------------------------------------------------------

    /// Delivers the completion to the waiting parent, or concludes the run
    /// when this was the root node.
    ///
    /// Delivery is at-most-once per notify id even under duplicate
    /// invocation; the correlation bus drops the duplicate.
    pub async fn end_node_execution(&self, ambiance: &Ambiance) -> Result<(), ExecutorError> {
        let level = ambiance.current_level().ok_or(ExecutorError::MissingLevel)?;
        let execution = self.node_store.get(&level.runtime_id).await?;

        match execution.notify_id.as_deref().filter(|id| !id.is_empty()) {
            Some(notify_id) => {
                let completion = StepCompletion {
                    node_id: level.setup_id.clone(),
                    identifier: level.identifier.clone(),
                    node_execution_id: level.runtime_id.clone(),
                    status: execution.status,
                    failure_info: execution.failure_info.clone(),
                    adviser_response: execution.adviser_response.clone(),
                    outputs: execution.outputs.clone(),
                    end_ts: execution.end_ts,
                };
                if !self.correlation_bus.done_with(notify_id, completion) {
                    tracing::debug!(notify_id, "duplicate completion dropped");
                }
            }
            None => {
                tracing::info!(
                    plan_execution_id = ambiance.plan_execution_id.as_str(),
                    status = ?execution.status,
                    "ending run"
                );
                self.event_bus.publish(EngineEvent::RunConcluded {
                    plan_execution_id: ambiance.plan_execution_id.clone(),
                    status: execution.status,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // errors
    // -----------------------------------------------------------------------

    /// Converts an engine error into a failed step response so advisers see
    /// it exactly like a business failure. A secondary error is logged and
    /// never re-raised.
    pub async fn handle_error(&self, ambiance: &Ambiance, error: ExecutorError) {
        let outcome = StepOutcome {
            status: NodeStatus::Failed,
            outputs: None,
            failure_info: Some(FailureInfo::new(error.to_string())),
        };
        if let Err(secondary) = self.process_step_response_inner(ambiance, outcome).await {
            tracing::error!(
                node_execution_id = ambiance.current_runtime_id().unwrap_or_default(),
                error = %secondary,
                "error while handling error, giving up on this execution"
            );
        }
    }

    // -----------------------------------------------------------------------
    // execution input
    // -----------------------------------------------------------------------

    /// Supplies the externally provided input document and re-enters start.
    pub async fn provide_execution_input(
        &self,
        ambiance: &Ambiance,
        input: Value,
    ) -> Result<(), ExecutorError> {
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or(ExecutorError::MissingLevel)?;
        let Some(_) = self
            .node_store
            .update_status_with_ops(
                node_execution_id,
                NodeStatus::Queued,
                |e| {
                    e.execution_input_provided = true;
                    e.execution_input = Some(input.clone());
                },
                &[NodeStatus::Paused],
            )
            .await?
        else {
            tracing::warn!(
                node_execution_id,
                "ignoring execution input, node is not waiting for it"
            );
            return Ok(());
        };
        self.start_execution(ambiance).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deep-merges `overlay` object fields over `base`; non-objects replace.
fn merge_values(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                base_map.insert(key.clone(), merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Run-level aggregate of a node tree.
fn aggregate_status(executions: &[NodeExecution]) -> NodeStatus {
    if executions.iter().any(|e| !e.status.is_terminal()) {
        return NodeStatus::Running;
    }
    if executions.iter().any(|e| e.status == NodeStatus::Aborted) {
        return NodeStatus::Aborted;
    }
    if executions.iter().any(|e| e.status == NodeStatus::Expired) {
        return NodeStatus::Expired;
    }
    if executions
        .iter()
        .any(|e| matches!(e.status, NodeStatus::Failed | NodeStatus::Errored))
    {
        return NodeStatus::Failed;
    }
    NodeStatus::Succeeded
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
