use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the node core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoreState {
    #[default]
    Uninitialized,
    /// Image measured, waiting to be activated or to join.
    AcceptingInit,
    /// Activated as coordinator.
    ActivatingNodes,
    /// Joined as worker.
    IsNode,
    Failed,
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::AcceptingInit => write!(f, "AcceptingInit"),
            Self::ActivatingNodes => write!(f, "ActivatingNodes"),
            Self::IsNode => write!(f, "IsNode"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl CoreState {
    /// Whether leaving `AcceptingInit` for `self` must first be recorded in the TPM.
    pub fn requires_activation(self) -> bool {
        matches!(self, Self::ActivatingNodes | Self::IsNode)
    }
}

/// Validate that a core state transition is allowed.
///
/// `Failed` is reachable from every state and is absorbing.
pub fn validate_transition(from: CoreState, to: CoreState) -> Result<()> {
    if to == CoreState::Failed {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Construction done
        (CoreState::Uninitialized, CoreState::AcceptingInit)
        // Activated or re-joined as coordinator
        | (CoreState::AcceptingInit, CoreState::ActivatingNodes)
        // Activated or re-joined as worker
        | (CoreState::AcceptingInit, CoreState::IsNode)
    );

    if valid {
        Ok(())
    } else {
        bail!("Invalid state transition: {} -> {}", from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CoreState; 5] = [
        CoreState::Uninitialized,
        CoreState::AcceptingInit,
        CoreState::ActivatingNodes,
        CoreState::IsNode,
        CoreState::Failed,
    ];

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(CoreState::Uninitialized, CoreState::AcceptingInit).is_ok());
        assert!(validate_transition(CoreState::AcceptingInit, CoreState::ActivatingNodes).is_ok());
        assert!(validate_transition(CoreState::AcceptingInit, CoreState::IsNode).is_ok());
    }

    #[test]
    fn test_failed_from_any() {
        for state in ALL {
            assert!(
                validate_transition(state, CoreState::Failed).is_ok(),
                "{} -> Failed should be valid",
                state,
            );
        }
    }

    #[test]
    fn test_failed_is_absorbing() {
        for state in ALL {
            if state == CoreState::Failed {
                continue;
            }
            assert!(validate_transition(CoreState::Failed, state).is_err());
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(CoreState::Uninitialized, CoreState::IsNode).is_err());
        assert!(validate_transition(CoreState::AcceptingInit, CoreState::Uninitialized).is_err());
        assert!(validate_transition(CoreState::IsNode, CoreState::ActivatingNodes).is_err());
        assert!(validate_transition(CoreState::ActivatingNodes, CoreState::IsNode).is_err());
        assert!(validate_transition(CoreState::IsNode, CoreState::IsNode).is_err());
    }

    #[test]
    fn test_error_message() {
        let err = validate_transition(CoreState::IsNode, CoreState::AcceptingInit).unwrap_err();
        assert!(format!("{}", err).contains("IsNode -> AcceptingInit"));
    }

    #[test]
    fn test_requires_activation() {
        assert!(CoreState::IsNode.requires_activation());
        assert!(CoreState::ActivatingNodes.requires_activation());
        assert!(!CoreState::Failed.requires_activation());
        assert!(!CoreState::AcceptingInit.requires_activation());
    }
}
