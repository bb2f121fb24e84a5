//! Signed approvals.
//!
//! An approval is an ed25519 signature by a configured approver over
//! `keel-approval:v1:<attempt_id>:<approver_id>:<timestamp>`. Binding the
//! attempt id into the signed bytes means an approval can never be replayed
//! against another attempt.

use crate::config::ApprovalsConfig;
use crate::error::{KeelError, Result};
use crate::types::AttemptState;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::Zeroizing;

use super::attempt::DeploymentAttempt;

const PAYLOAD_PREFIX: &str = "keel-approval:v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub attempt_id: u64,
    pub approver_id: String,
    /// Base64 ed25519 signature over [`ApprovalEvent::signing_payload`].
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalEvent {
    pub fn signing_payload(attempt_id: u64, approver_id: &str, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{PAYLOAD_PREFIX}:{attempt_id}:{approver_id}:{}",
            timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }

    pub fn sign(
        key: &SigningKey,
        attempt_id: u64,
        approver_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let approver_id = approver_id.into();
        let payload = Self::signing_payload(attempt_id, &approver_id, &timestamp);
        let signature = key.sign(payload.as_bytes());
        Self {
            attempt_id,
            approver_id,
            signature: B64.encode(signature.to_bytes()),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalRejection {
    #[error("approval is for attempt {got}, not {expected}")]
    AttemptMismatch { expected: u64, got: u64 },
    #[error("attempt is {0}, not pending approval")]
    NotPending(AttemptState),
    #[error("unknown approver '{0}'")]
    UnknownApprover(String),
    #[error("signature is not valid base64 ed25519")]
    MalformedSignature,
    #[error("signature does not verify")]
    BadSignature,
    #[error("approval expired")]
    Expired,
    #[error("approval timestamp is in the future")]
    FromFuture,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

fn decode_32(s: &str) -> Option<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(B64.decode(s.trim()).ok()?);
    let mut out = Zeroizing::new([0u8; 32]);
    if bytes.len() != 32 {
        return None;
    }
    out.copy_from_slice(&bytes);
    Some(out)
}

pub fn parse_public_key(s: &str) -> Result<VerifyingKey> {
    let bytes = decode_32(s)
        .ok_or_else(|| KeelError::InvalidRequest("public key must be 32 bytes of base64".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| KeelError::InvalidRequest("public key is not a valid ed25519 point".into()))
}

/// Signing keys are stored as the base64 32-byte seed.
pub fn parse_signing_key(s: &str) -> Result<SigningKey> {
    let bytes = decode_32(s)
        .ok_or_else(|| KeelError::InvalidRequest("signing key must be 32 bytes of base64".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn generate_signing_key() -> SigningKey {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *seed);
    SigningKey::from_bytes(&seed)
}

pub fn encode_signing_key(key: &SigningKey) -> Zeroizing<String> {
    Zeroizing::new(B64.encode(key.to_bytes()))
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    B64.encode(key.to_bytes())
}

// ---------------------------------------------------------------------------
// ApprovalVerifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApprovalVerifier {
    approvers: BTreeMap<String, VerifyingKey>,
    ttl: Duration,
    max_skew: Duration,
}

impl ApprovalVerifier {
    pub fn from_config(config: &ApprovalsConfig) -> Result<Self> {
        let mut approvers = BTreeMap::new();
        for a in &config.approvers {
            approvers.insert(a.id.clone(), parse_public_key(&a.public_key)?);
        }
        Ok(Self {
            approvers,
            ttl: Duration::seconds(config.ttl_seconds as i64),
            max_skew: Duration::seconds(config.max_clock_skew_seconds as i64),
        })
    }

    /// Check that `event` approves exactly `attempt`, right now.
    pub fn verify(
        &self,
        event: &ApprovalEvent,
        attempt: &DeploymentAttempt,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ApprovalRejection> {
        if event.attempt_id != attempt.id {
            return Err(ApprovalRejection::AttemptMismatch {
                expected: attempt.id,
                got: event.attempt_id,
            });
        }
        if attempt.state != AttemptState::PendingApproval {
            return Err(ApprovalRejection::NotPending(attempt.state));
        }
        let key = self
            .approvers
            .get(&event.approver_id)
            .ok_or_else(|| ApprovalRejection::UnknownApprover(event.approver_id.clone()))?;

        let raw = B64
            .decode(event.signature.trim())
            .map_err(|_| ApprovalRejection::MalformedSignature)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| ApprovalRejection::MalformedSignature)?;
        let payload =
            ApprovalEvent::signing_payload(event.attempt_id, &event.approver_id, &event.timestamp);
        key.verify_strict(payload.as_bytes(), &signature)
            .map_err(|_| ApprovalRejection::BadSignature)?;

        if event.timestamp > now + self.max_skew {
            return Err(ApprovalRejection::FromFuture);
        }
        if now - event.timestamp > self.ttl {
            return Err(ApprovalRejection::Expired);
        }
        Ok(())
    }
}
