//! Node execution statuses and the status sets that govern transitions.
//!
//! Every status change in the engine goes through a guarded compare-and-swap
//! at the store layer: a transition only applies when the stored status is in
//! the caller's allowed-from set. The sets defined here (`terminal`,
//! `resumable`, `flowing`) are the vocabulary those guards speak.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created, waiting for the engine to pick it up.
    Queued,
    /// Actively executing.
    Running,
    /// Suspended, awaiting an external delegate/task callback.
    TaskWaiting,
    /// Suspended, awaiting an asynchronous correlated response.
    AsyncWaiting,
    /// Suspended on externally supplied input or a manual gate.
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
    /// An engine-internal error was recorded; still eligible for recovery.
    Errored,
}

impl NodeStatus {
    /// Statuses from which no further execution happens.
    pub const TERMINAL: &'static [NodeStatus] = &[
        NodeStatus::Succeeded,
        NodeStatus::Failed,
        NodeStatus::Aborted,
        NodeStatus::Expired,
        NodeStatus::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Statuses from which an external correlated response may resume a node.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            NodeStatus::Queued
                | NodeStatus::Running
                | NodeStatus::Paused
                | NodeStatus::TaskWaiting
                | NodeStatus::AsyncWaiting
        )
    }

    /// Actively progressing statuses: not terminal and not paused.
    ///
    /// Resuming a node whose previous status was already flowing skips the
    /// run-level aggregate recalculation.
    pub fn is_flowing(self) -> bool {
        matches!(
            self,
            NodeStatus::Queued
                | NodeStatus::Running
                | NodeStatus::TaskWaiting
                | NodeStatus::AsyncWaiting
        )
    }

    /// Outcomes advisers treat as failures when deciding recovery.
    pub fn is_failure_like(self) -> bool {
        matches!(
            self,
            NodeStatus::Failed | NodeStatus::Errored | NodeStatus::Expired | NodeStatus::Aborted
        )
    }

    /// The default allowed-from set for a guarded transition into `to`.
    ///
    /// Used when a caller passes an empty allowed-from set to
    /// `update_status_with_ops`.
    pub fn default_allowed_from(to: NodeStatus) -> &'static [NodeStatus] {
        const NON_TERMINAL: &[NodeStatus] = &[
            NodeStatus::Queued,
            NodeStatus::Running,
            NodeStatus::TaskWaiting,
            NodeStatus::AsyncWaiting,
            NodeStatus::Paused,
            NodeStatus::Errored,
        ];
        match to {
            NodeStatus::Queued => &[NodeStatus::Paused],
            NodeStatus::Running => &[
                NodeStatus::Queued,
                NodeStatus::TaskWaiting,
                NodeStatus::AsyncWaiting,
                NodeStatus::Paused,
            ],
            NodeStatus::TaskWaiting | NodeStatus::AsyncWaiting => {
                &[NodeStatus::Queued, NodeStatus::Running]
            }
            NodeStatus::Paused => &[
                NodeStatus::Queued,
                NodeStatus::Running,
                NodeStatus::TaskWaiting,
                NodeStatus::AsyncWaiting,
            ],
            NodeStatus::Errored => &[
                NodeStatus::Queued,
                NodeStatus::Running,
                NodeStatus::TaskWaiting,
                NodeStatus::AsyncWaiting,
                NodeStatus::Paused,
            ],
            NodeStatus::Succeeded
            | NodeStatus::Failed
            | NodeStatus::Aborted
            | NodeStatus::Expired
            | NodeStatus::Skipped => NON_TERMINAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[NodeStatus] = &[
        NodeStatus::Queued,
        NodeStatus::Running,
        NodeStatus::TaskWaiting,
        NodeStatus::AsyncWaiting,
        NodeStatus::Paused,
        NodeStatus::Succeeded,
        NodeStatus::Failed,
        NodeStatus::Aborted,
        NodeStatus::Expired,
        NodeStatus::Skipped,
        NodeStatus::Errored,
    ];

    #[test]
    fn test_terminal_set() {
        assert!(NodeStatus::Succeeded.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Errored.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(!NodeStatus::Paused.is_terminal());
    }

    #[test]
    fn test_resumable_excludes_terminal() {
        for status in ALL {
            if status.is_terminal() {
                assert!(!status.is_resumable(), "{status:?} should not be resumable");
            }
        }
        assert!(NodeStatus::AsyncWaiting.is_resumable());
        assert!(NodeStatus::Paused.is_resumable());
        assert!(!NodeStatus::Errored.is_resumable());
    }

    #[test]
    fn test_flowing_excludes_paused() {
        assert!(NodeStatus::Running.is_flowing());
        assert!(NodeStatus::TaskWaiting.is_flowing());
        assert!(!NodeStatus::Paused.is_flowing());
        assert!(!NodeStatus::Failed.is_flowing());
    }

    #[test]
    fn test_default_allowed_from_terminal_accepts_any_non_terminal() {
        let allowed = NodeStatus::default_allowed_from(NodeStatus::Failed);
        assert!(allowed.contains(&NodeStatus::Running));
        assert!(allowed.contains(&NodeStatus::Errored));
        assert!(!allowed.contains(&NodeStatus::Succeeded));
    }

    #[test]
    fn test_default_allowed_from_running() {
        let allowed = NodeStatus::default_allowed_from(NodeStatus::Running);
        assert!(allowed.contains(&NodeStatus::Queued));
        assert!(allowed.contains(&NodeStatus::AsyncWaiting));
        assert!(!allowed.contains(&NodeStatus::Failed));
    }

    #[test]
    fn test_status_serde_roundtrip() {
        for status in ALL {
            let json = serde_json::to_string(status).unwrap();
            let parsed: NodeStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, *status);
        }
        assert_eq!(
            serde_json::to_string(&NodeStatus::TaskWaiting).unwrap(),
            "\"task_waiting\""
        );
    }
}
