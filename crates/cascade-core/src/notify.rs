//! Correlation of external completions back to waiting executions.
//!
//! When a child node (or an external task) finishes, its completion is
//! delivered under the `notify_id` the waiter registered. Delivery is
//! at-most-once per correlation id: the first `done_with` wins, duplicates
//! are no-ops. Listeners that subscribe after delivery still observe the
//! stored completion, so a waiter that timed out and re-subscribed sees the
//! same result exactly once.

use dashmap::DashMap;
use tokio::sync::oneshot;

use cascade_types::execution::StepCompletion;

enum CorrelationState {
    Pending(Vec<oneshot::Sender<StepCompletion>>),
    Delivered(StepCompletion),
}

/// Message passing keyed by correlation id with at-most-once delivery.
#[derive(Default)]
pub struct CorrelationBus {
    state: DashMap<String, CorrelationState>,
}

impl CorrelationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a completion for `notify_id`.
    ///
    /// Returns `false` when the correlation was already completed; the
    /// duplicate is dropped and current listeners are not re-notified.
    pub fn done_with(&self, notify_id: &str, completion: StepCompletion) -> bool {
        let mut entry = self
            .state
            .entry(notify_id.to_string())
            .or_insert_with(|| CorrelationState::Pending(Vec::new()));
        let state = entry.value_mut();
        if let CorrelationState::Delivered(_) = state {
            return false;
        }
        let previous =
            std::mem::replace(state, CorrelationState::Delivered(completion.clone()));
        drop(entry);
        if let CorrelationState::Pending(waiters) = previous {
            for waiter in waiters {
                let _ = waiter.send(completion.clone());
            }
        }
        true
    }

    /// Waits for the completion correlated to `notify_id`.
    ///
    /// Resolves immediately when the completion was already delivered.
    /// `None` only when the bus is dropped while waiting.
    pub async fn wait_for(&self, notify_id: &str) -> Option<StepCompletion> {
        let receiver = {
            let mut entry = self
                .state
                .entry(notify_id.to_string())
                .or_insert_with(|| CorrelationState::Pending(Vec::new()));
            match entry.value_mut() {
                CorrelationState::Delivered(completion) => return Some(completion.clone()),
                CorrelationState::Pending(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
            }
        };
        receiver.await.ok()
    }

    /// Whether a completion has been delivered for `notify_id`.
    pub fn completed(&self, notify_id: &str) -> bool {
        self.state
            .get(notify_id)
            .is_some_and(|entry| matches!(entry.value(), CorrelationState::Delivered(_)))
    }
}

impl std::fmt::Debug for CorrelationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationBus")
            .field("correlations", &self.state.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
