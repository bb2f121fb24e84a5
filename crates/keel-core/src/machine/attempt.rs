use crate::audit::FailureKind;
use crate::bundle::BundleFingerprint;
use crate::publish::{ArtifactReference, Digest};
use crate::types::{AttemptState, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: AttemptState,
    pub at: DateTime<Utc>,
    pub actor: String,
}

/// What was running on the target right before activation.
/// `version: None` means nothing was, so rollback deactivates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownGood {
    pub version: Option<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver_id: String,
    pub signed_at: DateTime<Utc>,
    pub accepted_at: DateTime<Utc>,
}

/// The first failure that took the attempt off the success path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub failure: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: u64,
    pub target: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactReference>,
    pub bundle_fingerprint: BundleFingerprint,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub requested_by: String,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_good: Option<KnownGood>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl DeploymentAttempt {
    pub fn digest(&self) -> Option<&Digest> {
        self.artifact.as_ref().map(|a| &a.digest)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record the first failure only; later ones (e.g. during rollback) are in the audit log.
    pub fn record_failure(&mut self, failure: FailureKind, phase: Option<Phase>, exit_code: Option<i32>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome {
                failure,
                phase,
                exit_code,
            });
        }
    }
}
