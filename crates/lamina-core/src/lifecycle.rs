use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Scheduling state of one recipe node during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Ready,
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(node: &str, from: NodeState, to: NodeState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (NodeState::Pending, NodeState::Ready | NodeState::Cancelled)
            | (NodeState::Ready, NodeState::Building | NodeState::Cancelled)
            | (
                NodeState::Building,
                NodeState::Complete | NodeState::Failed | NodeState::Cancelled
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            node: node.to_owned(),
            from,
            to,
        })
    }
}
