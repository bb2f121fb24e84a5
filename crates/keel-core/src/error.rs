use crate::audit::FailureKind;
use crate::machine::approval::ApprovalRejection;
use crate::types::{AttemptState, Phase};
use thiserror::Error;

/// Every error carries names, digests and codes only. No variant holds a
/// resolved secret value, so errors are safe to log and to surface over HTTP.
#[derive(Debug, Error)]
pub enum KeelError {
    #[error("not initialized: run 'keel init'")]
    NotInitialized,

    #[error("invalid name '{0}': must be lowercase alphanumeric with hyphens or dots")]
    InvalidName(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("attempt not found: {0}")]
    AttemptNotFound(u64),

    // -- secrets ------------------------------------------------------------
    #[error("invalid secret locator '{0}': expected <backend>:<path>")]
    InvalidLocator(String),

    #[error("unknown secret backend: {0}")]
    UnknownSecretBackend(String),

    #[error("secret unavailable: {name}")]
    SecretUnavailable { name: String },

    #[error("secret store '{backend}' unreachable: {reason}")]
    SecretStoreUnreachable { backend: String, reason: String },

    #[error("age binary not found: install from https://age-encryption.org")]
    AgeNotInstalled,

    // -- bundle -------------------------------------------------------------
    #[error("bundle key '{0}' is malformed: expected 32 bytes, base64 or hex encoded")]
    InvalidBundleKey(String),

    #[error("bundle sealing failed")]
    BundleSealFailed,

    #[error("bundle could not be opened: wrong key or tampered ciphertext")]
    BundleOpenFailed,

    // -- registry -----------------------------------------------------------
    #[error("invalid digest '{0}': expected sha256:<64 lowercase hex chars>")]
    InvalidDigest(String),

    #[error("registry rejected publish: {0}")]
    PublishRejected(String),

    #[error("publish conflict: {digest} already exists with different content")]
    PublishConflict { digest: String },

    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("artifact not found in registry: {0}")]
    ArtifactNotFound(String),

    // -- remote -------------------------------------------------------------
    #[error("invalid remote argument: {0}")]
    InvalidRemoteArgument(String),

    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("{phase} command '{command}' exited with code {exit_code}")]
    CommandFailed {
        phase: Phase,
        command: String,
        exit_code: i32,
    },

    #[error("{phase} timed out after {seconds}s")]
    Timeout { phase: Phase, seconds: u64 },

    #[error("health verification failed after {probes} probe(s)")]
    VerificationFailed { probes: u32 },

    // -- policy -------------------------------------------------------------
    #[error("attempt {attempt_id} is already in progress for target {target}")]
    AttemptInProgress { target: String, attempt_id: u64 },

    #[error("target {target} needs repair after failed attempt {attempt_id}: run 'keel targets repair {target}'")]
    TargetDegraded { target: String, attempt_id: u64 },

    #[error("duplicate attempt: {existing} already deploys the same artifact and config to {target}")]
    DuplicateAttempt { target: String, existing: u64 },

    #[error("approval rejected: {0}")]
    ApprovalRejected(ApprovalRejection),

    #[error("attempt {id} cannot be cancelled in state {state}")]
    CancelNotAllowed { id: u64, state: AttemptState },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    // -- persistence --------------------------------------------------------
    #[error("audit log corrupted at sequence {sequence_no}: {reason}")]
    AuditCorrupted { sequence_no: u64, reason: String },

    #[error("audit write failed after {attempts} attempt(s): {reason}")]
    AuditUnavailable { attempts: u32, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KeelError>;

/// Coarse error taxonomy used for exit codes and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request, unknown target or secret; rejected before any state exists.
    Input,
    /// A collaborator (registry, secret store, target) could not be reached.
    Resource,
    /// Approval, exclusion or duplicate-attempt rules; resubmit deliberately.
    Policy,
    /// Health verification did not pass.
    Verification,
    /// Persistence or integrity failure inside keel itself.
    Internal,
}

impl KeelError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            KeelError::NotInitialized
            | KeelError::InvalidName(_)
            | KeelError::InvalidRequest(_)
            | KeelError::InvalidState(_)
            | KeelError::UnknownTarget(_)
            | KeelError::AttemptNotFound(_)
            | KeelError::InvalidLocator(_)
            | KeelError::UnknownSecretBackend(_)
            | KeelError::SecretUnavailable { .. }
            | KeelError::InvalidBundleKey(_)
            | KeelError::InvalidDigest(_)
            | KeelError::ArtifactNotFound(_)
            | KeelError::InvalidRemoteArgument(_) => ErrorCategory::Input,
            KeelError::SecretStoreUnreachable { .. }
            | KeelError::AgeNotInstalled
            | KeelError::PublishRejected(_)
            | KeelError::RegistryUnreachable(_)
            | KeelError::ConnectionFailed { .. }
            | KeelError::CommandFailed { .. }
            | KeelError::Timeout { .. } => ErrorCategory::Resource,
            KeelError::AttemptInProgress { .. }
            | KeelError::TargetDegraded { .. }
            | KeelError::DuplicateAttempt { .. }
            | KeelError::ApprovalRejected(_)
            | KeelError::CancelNotAllowed { .. }
            | KeelError::InvalidTransition { .. } => ErrorCategory::Policy,
            KeelError::VerificationFailed { .. } => ErrorCategory::Verification,
            KeelError::BundleSealFailed
            | KeelError::BundleOpenFailed
            | KeelError::PublishConflict { .. }
            | KeelError::AuditCorrupted { .. }
            | KeelError::AuditUnavailable { .. }
            | KeelError::Store(_)
            | KeelError::HomeNotFound
            | KeelError::Io(_)
            | KeelError::Yaml(_)
            | KeelError::Json(_) => ErrorCategory::Internal,
        }
    }

    /// The structured failure kind recorded in the audit trail for this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            KeelError::SecretUnavailable { .. } => FailureKind::SecretUnavailable,
            KeelError::SecretStoreUnreachable { .. } | KeelError::AgeNotInstalled => {
                FailureKind::SecretStoreUnreachable
            }
            KeelError::InvalidBundleKey(_) | KeelError::BundleSealFailed => {
                FailureKind::BundleSealFailed
            }
            KeelError::PublishRejected(_) => FailureKind::PublishRejected,
            KeelError::PublishConflict { .. } => FailureKind::PublishConflict,
            KeelError::RegistryUnreachable(_) => FailureKind::RegistryUnreachable,
            KeelError::ArtifactNotFound(_) | KeelError::InvalidDigest(_) => {
                FailureKind::ArtifactNotFound
            }
            KeelError::ConnectionFailed { .. } => FailureKind::ConnectionFailed,
            KeelError::CommandFailed { .. } => FailureKind::CommandFailed,
            KeelError::Timeout { .. } => FailureKind::Timeout,
            KeelError::VerificationFailed { .. } => FailureKind::VerificationFailed,
            KeelError::DuplicateAttempt { .. } => FailureKind::DuplicateAttempt,
            _ => FailureKind::Internal,
        }
    }

    /// Exit code of the failed command, when the error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            KeelError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

pub(crate) fn store_err(e: impl std::fmt::Display) -> KeelError {
    KeelError::Store(e.to_string())
}
