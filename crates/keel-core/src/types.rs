use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// AttemptState
// ---------------------------------------------------------------------------

/// Lifecycle state of a deployment attempt.
///
/// Success path:
/// `requested → publishing → pending_approval → transferring → activating → verifying → committed`
///
/// Failure paths: any remote phase → `rolling_back → rolled_back | failed`;
/// pre-mutation failures → `aborted`; operator abort before transfer → `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Requested,
    Publishing,
    PendingApproval,
    Transferring,
    Activating,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
    Aborted,
    Cancelled,
}

impl AttemptState {
    pub fn all() -> &'static [AttemptState] {
        &[
            AttemptState::Requested,
            AttemptState::Publishing,
            AttemptState::PendingApproval,
            AttemptState::Transferring,
            AttemptState::Activating,
            AttemptState::Verifying,
            AttemptState::Committed,
            AttemptState::RollingBack,
            AttemptState::RolledBack,
            AttemptState::Failed,
            AttemptState::Aborted,
            AttemptState::Cancelled,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Requested => "requested",
            AttemptState::Publishing => "publishing",
            AttemptState::PendingApproval => "pending_approval",
            AttemptState::Transferring => "transferring",
            AttemptState::Activating => "activating",
            AttemptState::Verifying => "verifying",
            AttemptState::Committed => "committed",
            AttemptState::RollingBack => "rolling_back",
            AttemptState::RolledBack => "rolled_back",
            AttemptState::Failed => "failed",
            AttemptState::Aborted => "aborted",
            AttemptState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Committed
                | AttemptState::RolledBack
                | AttemptState::Failed
                | AttemptState::Aborted
                | AttemptState::Cancelled
        )
    }

    /// Cancellation is only possible before any remote mutation.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            AttemptState::Requested | AttemptState::Publishing | AttemptState::PendingApproval
        )
    }

    /// True once the target host may have been changed by this attempt.
    pub fn remote_mutation_begun(self) -> bool {
        matches!(
            self,
            AttemptState::Transferring
                | AttemptState::Activating
                | AttemptState::Verifying
                | AttemptState::RollingBack
        )
    }

    /// Legal edges of the state machine. Everything else is rejected by the store.
    pub fn can_transition_to(self, to: AttemptState) -> bool {
        use AttemptState::*;
        match (self, to) {
            (Requested, Publishing) => true,
            (Publishing, PendingApproval) => true,
            (PendingApproval, Transferring) => true,
            (Transferring, Activating) => true,
            (Activating, Verifying) => true,
            (Verifying, Committed) => true,
            (Transferring | Activating | Verifying, RollingBack) => true,
            (RollingBack, RolledBack | Failed) => true,
            (Requested | Publishing | PendingApproval, Aborted | Cancelled) => true,
            _ => false,
        }
    }

    /// Process exit code for a CLI invocation that ends in this state.
    pub fn exit_code(self) -> i32 {
        match self {
            AttemptState::Committed => 0,
            AttemptState::RolledBack => 3,
            AttemptState::Failed => 4,
            AttemptState::Aborted => 5,
            AttemptState::Cancelled => 6,
            // Non-terminal: the attempt is parked (e.g. waiting for approval).
            _ => 0,
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptState {
    type Err = crate::error::KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptState::all()
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::error::KeelError::InvalidState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A remote execution phase. Each phase owns a fixed command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Transfer,
    Activate,
    Verify,
    Rollback,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Transfer => "transfer",
            Phase::Activate => "activate",
            Phase::Verify => "verify",
            Phase::Rollback => "rollback",
        }
    }

    /// The attempt state during which this phase runs.
    pub fn state(self) -> AttemptState {
        match self {
            Phase::Transfer => AttemptState::Transferring,
            Phase::Activate => AttemptState::Activating,
            Phase::Verify => AttemptState::Verifying,
            Phase::Rollback => AttemptState::RollingBack,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
