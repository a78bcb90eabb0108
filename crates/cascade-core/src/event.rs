//! Broadcast event bus decoupling the state machine from the surrounding
//! engine.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op. The embedding service subscribes to react to custom
//! facilitation requests, child spawning, sibling scheduling, and run
//! conclusion.

use tokio::sync::broadcast;

use cascade_types::ambiance::Ambiance;
use cascade_types::status::NodeStatus;
use cascade_types::step::StepMode;

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// Events published by the node state machine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A node declares a custom facilitator; an external facilitator must
    /// answer via `process_facilitation_response`.
    FacilitationRequested {
        ambiance: Ambiance,
        node_id: String,
    },
    /// A node is paused awaiting externally supplied execution input.
    ExecutionInputRequested {
        ambiance: Ambiance,
        node_execution_id: String,
    },
    /// A node began executing in the given mode. For Async/Task modes the
    /// external system owns completion and must call back through resume.
    NodeStarted {
        ambiance: Ambiance,
        node_execution_id: String,
        mode: StepMode,
    },
    /// A Child/ChildChain node needs its children scheduled.
    SpawnChild {
        ambiance: Ambiance,
        node_execution_id: String,
        mode: StepMode,
    },
    /// An adviser directed execution to continue at a sibling node.
    RunNextNode {
        /// Parent-scoped context the sibling starts from.
        ambiance: Ambiance,
        next_node_id: String,
        previous_execution_id: String,
    },
    /// An adviser re-queued a node; the replacement is already created.
    RetryScheduled {
        ambiance: Ambiance,
        retried_execution_id: String,
        new_execution_id: String,
        wait_ms: u64,
    },
    /// An adviser asked for the whole plan execution to end.
    PlanEndRequested {
        plan_execution_id: String,
        abort: bool,
    },
    /// The root node ended; the run is complete.
    RunConcluded {
        plan_execution_id: String,
        status: NodeStatus,
    },
    /// The run-level aggregate status changed (derived on resume).
    RunStatusChanged {
        plan_execution_id: String,
        status: NodeStatus,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Multi-consumer bus for engine events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EngineEvent {
        EngineEvent::RunConcluded {
            plan_execution_id: "exec-1".to_string(),
            status: NodeStatus::Succeeded,
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, EngineEvent::RunConcluded { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(matches!(
            rx1.recv().await.unwrap(),
            EngineEvent::RunConcluded { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            EngineEvent::RunConcluded { .. }
        ));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
    }
}
