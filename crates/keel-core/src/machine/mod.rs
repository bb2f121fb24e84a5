//! The deployment state machine.
//!
//! One attempt moves `requested → publishing → pending_approval →
//! transferring → activating → verifying → committed`. Failures before the
//! target is touched end in `aborted`; failures after it end in
//! `rolling_back` and then `rolled_back` or `failed`. Every edge is a
//! compare-and-set in [`DeploymentStore`] that writes its audit record in
//! the same transaction.

pub mod approval;
pub mod attempt;
pub mod backoff;

#[cfg(test)]
mod tests;

pub use approval::{ApprovalEvent, ApprovalRejection, ApprovalVerifier};
pub use attempt::{ApprovalRecord, DeploymentAttempt, HistoryEntry, KnownGood, Outcome};
pub use backoff::ProbeSchedule;

use crate::audit::{AuditRecord, FailureKind, RedactedDetail};
use crate::bundle::{self, BundleFingerprint, BundleKey, EncryptedBundle};
use crate::config::{Config, TargetConfig};
use crate::error::{KeelError, Result};
use crate::paths;
use crate::publish::{validate_repository, validate_tag, ArtifactPublisher, ArtifactSource, Digest, FsRegistry};
use crate::remote::{
    CommandSequence, ExecutorSession, RedactionFilter, RemoteConnector, RemoteExecutor,
    SshConnector,
};
use crate::secrets::{ResolvedSecret, SecretMaterializer, SecretRef, SecretSet};
use crate::store::{DeploymentStore, NewAttempt, TargetRecord, Transition};
use crate::types::{AttemptState, Phase};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Actor recorded for transitions keel makes on its own.
pub const SYSTEM_ACTOR: &str = "keel";
const RECOVERY_ACTOR: &str = "keel-recovery";

const BUNDLE_KEY_NAME: &str = "bundle-key";
const CREDENTIAL_NAME: &str = "ssh-credential";

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub target: String,
    pub source: ArtifactSource,
    pub requested_by: String,
}

/// Everything one attempt needs to touch the target, resolved just in time.
struct Armed {
    sealed: EncryptedBundle,
    session: ExecutorSession,
}

/// A remote phase that failed after the target may have changed.
struct PhaseFailure {
    phase: Phase,
    error: KeelError,
}

#[derive(Clone)]
pub struct DeploymentStateMachine {
    config: Arc<Config>,
    store: Arc<DeploymentStore>,
    materializer: Arc<SecretMaterializer>,
    publisher: ArtifactPublisher,
    executor: RemoteExecutor,
    verifier: ApprovalVerifier,
}

impl DeploymentStateMachine {
    pub fn new(
        config: Config,
        store: Arc<DeploymentStore>,
        materializer: SecretMaterializer,
        publisher: ArtifactPublisher,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Self> {
        let verifier = ApprovalVerifier::from_config(&config.approvals)?;
        let executor = RemoteExecutor::new(connector, config.timeouts.clone());
        Ok(Self {
            config: Arc::new(config),
            store,
            materializer: Arc::new(materializer),
            publisher,
            executor,
            verifier,
        })
    }

    /// Wire up the project at `root`: its config, database, secret backends,
    /// filesystem registry and the SSH transport.
    pub fn from_project(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let store = Arc::new(DeploymentStore::open(&paths::db_path(root))?);
        let materializer = SecretMaterializer::from_config(root, &config)?;
        let registry_root = paths::resolve_configured(root, &config.registry.path)?;
        let publisher = ArtifactPublisher::new(Arc::new(FsRegistry::new(
            config.registry.name.clone(),
            registry_root,
        )));
        Self::new(
            config,
            store,
            materializer,
            publisher,
            Arc::new(SshConnector::new()),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &DeploymentStore {
        &self.store
    }

    pub fn materializer(&self) -> &SecretMaterializer {
        &self.materializer
    }

    // -----------------------------------------------------------------------
    // Request
    // -----------------------------------------------------------------------

    /// Reject anything malformed before an attempt exists, and compute the
    /// fingerprint the attempt will carry.
    fn validate_request(&self, req: &DeployRequest) -> Result<BundleFingerprint> {
        paths::validate_actor(&req.requested_by)?;
        paths::validate_name(&req.target)?;
        let target = self.config.target(&req.target)?;
        crate::remote::validate_agent_path(&target.agent)?;
        crate::remote::ssh::validate_address(&target.address)?;

        validate_repository(req.source.repository())?;
        match &req.source {
            ArtifactSource::Build(b) => {
                if let Some(tag) = &b.tag {
                    validate_tag(tag)?;
                }
            }
            ArtifactSource::Tag { tag, .. } => validate_tag(tag)?,
            ArtifactSource::Digest { .. } => {}
        }

        let bundle_cfg = &self.config.bundle;
        self.materializer.check_refs(&bundle_cfg.secrets)?;
        self.materializer.check_refs(&self.key_refs())?;
        if let Some(cred) = self.credential_ref(target) {
            self.materializer.check_refs(std::slice::from_ref(&cred))?;
        }
        if let Some(r) = bundle_cfg
            .secrets
            .iter()
            .find(|r| bundle_cfg.static_fields.contains_key(&r.name))
        {
            return Err(KeelError::InvalidRequest(format!(
                "'{}' is both a static field and a secret",
                r.name
            )));
        }

        BundleFingerprint::compute(
            &bundle_cfg.static_fields,
            bundle_cfg.secrets.iter().map(|r| r.name.as_str()),
            &bundle_cfg.encryption_key,
        )
    }

    fn key_refs(&self) -> [SecretRef; 1] {
        [SecretRef::new(
            BUNDLE_KEY_NAME,
            self.config.bundle.encryption_key.clone(),
        )]
    }

    fn credential_ref(&self, target: &TargetConfig) -> Option<SecretRef> {
        target
            .credential
            .clone()
            .map(|loc| SecretRef::new(CREDENTIAL_NAME, loc))
    }

    /// Create an attempt, publish its artifact and park it at
    /// `pending_approval`. Input and exclusion errors are returned before
    /// anything is written; later failures end the attempt in `aborted` and
    /// the returned attempt carries the outcome.
    pub async fn request(&self, req: DeployRequest) -> Result<DeploymentAttempt> {
        let fingerprint = self.validate_request(&req)?;
        let new = NewAttempt {
            target: req.target.clone(),
            repository: req.source.repository().to_string(),
            bundle_fingerprint: fingerprint.clone(),
            requested_by: req.requested_by.clone(),
        };
        let (attempt, _) = self
            .with_retry(|| self.store.create_attempt(new.clone(), Utc::now()))
            .await?;
        info!(attempt_id = attempt.id, target = %attempt.target, "attempt created");

        let publisher = self.publisher.clone();
        let source = req.source.clone();
        let limit = self.config.timeouts.publish();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let published = tokio::time::timeout(
            limit,
            tokio::task::spawn_blocking(move || publisher.publish_source_unless(&source, &flag)),
        )
        .await;
        let artifact = match published {
            Ok(Ok(Ok(artifact))) => artifact,
            Ok(Ok(Err(e))) => {
                return self
                    .abort(attempt.id, AttemptState::Publishing, &e, SYSTEM_ACTOR)
                    .await
            }
            Ok(Err(join)) => {
                let e = KeelError::RegistryUnreachable(format!("publish task failed: {join}"));
                return self
                    .abort(attempt.id, AttemptState::Publishing, &e, SYSTEM_ACTOR)
                    .await;
            }
            Err(_) => {
                // The blocking push cannot be interrupted; stop it before it tags.
                cancelled.store(true, Ordering::SeqCst);
                warn!(
                    attempt_id = attempt.id,
                    "publish timed out; a push still in flight may land but will not move the tag"
                );
                let e = KeelError::RegistryUnreachable(format!(
                    "publish timed out after {}s",
                    limit.as_secs()
                ));
                return self
                    .abort(attempt.id, AttemptState::Publishing, &e, SYSTEM_ACTOR)
                    .await;
            }
        };

        if let Some(existing) =
            self.store
                .find_duplicate(&attempt.target, &fingerprint, &artifact.digest, attempt.id)?
        {
            let e = KeelError::DuplicateAttempt {
                target: attempt.target.clone(),
                existing,
            };
            return self
                .abort(attempt.id, AttemptState::Publishing, &e, SYSTEM_ACTOR)
                .await;
        }

        let detail = RedactedDetail::Published {
            artifact: artifact.clone(),
        };
        let outcome = self
            .commit(
                attempt.id,
                AttemptState::Publishing,
                AttemptState::PendingApproval,
                SYSTEM_ACTOR,
                detail,
                move |a: &mut DeploymentAttempt, _: &mut TargetRecord| {
                    a.artifact = Some(artifact.clone());
                },
            )
            .await;
        self.settled(attempt.id, outcome)
    }

    /// A compare-and-set that lost to a concurrent change (e.g. a cancel)
    /// is not an error for the caller; they get the attempt as it now is.
    fn settled(&self, id: u64, outcome: Result<DeploymentAttempt>) -> Result<DeploymentAttempt> {
        match outcome {
            Err(KeelError::InvalidTransition { from, to, .. }) => {
                debug!(attempt_id = id, %from, %to, "transition superseded");
                self.store.get_attempt(id)
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Approval
    // -----------------------------------------------------------------------

    /// Check `event` against attempt `attempt_id` without changing anything.
    pub fn validate_approval(&self, attempt_id: u64, event: &ApprovalEvent) -> Result<DeploymentAttempt> {
        let attempt = self.store.get_attempt(attempt_id)?;
        if let Err(rejection) = self.verifier.verify(event, &attempt, Utc::now()) {
            warn!(attempt_id, approver = %event.approver_id, reason = %rejection, "approval rejected");
            return Err(KeelError::ApprovalRejected(rejection));
        }
        Ok(attempt)
    }

    /// Accept an approval and drive the attempt to a terminal state.
    /// A rejected approval leaves the attempt pending.
    pub async fn submit_approval(
        &self,
        attempt_id: u64,
        event: ApprovalEvent,
    ) -> Result<DeploymentAttempt> {
        let attempt = self.validate_approval(attempt_id, &event)?;
        info!(attempt_id, approver = %event.approver_id, "approval accepted");
        self.drive(attempt, event).await
    }

    async fn drive(&self, attempt: DeploymentAttempt, event: ApprovalEvent) -> Result<DeploymentAttempt> {
        let id = attempt.id;
        let digest = attempt.digest().cloned().ok_or_else(|| {
            KeelError::InvalidState(format!("attempt {id} has no published artifact"))
        })?;

        let armed = match self.arm(&attempt).await {
            Ok(armed) => armed,
            Err(e) => {
                return self
                    .abort(id, AttemptState::PendingApproval, &e, &event.approver_id)
                    .await
            }
        };
        let Armed {
            sealed,
            mut session,
        } = armed;

        let known_good = self
            .store
            .get_target(&attempt.target)?
            .and_then(|t| t.current_version);
        let approval = ApprovalRecord {
            approver_id: event.approver_id.clone(),
            signed_at: event.timestamp,
            accepted_at: Utc::now(),
        };
        let kg = known_good.clone();
        let started = self
            .commit(
                id,
                AttemptState::PendingApproval,
                AttemptState::Transferring,
                &event.approver_id,
                RedactedDetail::Approved {
                    approver_id: event.approver_id.clone(),
                    known_good: known_good.clone(),
                },
                move |a: &mut DeploymentAttempt, _: &mut TargetRecord| {
                    a.approval = Some(approval.clone());
                    a.known_good = Some(KnownGood {
                        version: kg.clone(),
                    });
                },
            )
            .await;
        let started = match started {
            Ok(a) => a,
            Err(e) => {
                close_session(session).await;
                return self.settled(id, Err(e));
            }
        };

        let result = match self.forward(&mut session, &started, &digest, &sealed).await {
            Ok(Ok(committed)) => Ok(committed),
            Ok(Err(failure)) => {
                self.roll_back(&mut session, id, failure, known_good.as_ref())
                    .await
            }
            Err(e) => Err(e),
        };
        close_session(session).await;
        result
    }

    /// Resolve the attempt's secrets, seal its bundle and open its session.
    /// The plaintext bundle, the bundle key and the credential are dropped
    /// before this returns; only the redaction filter keeps copies.
    async fn arm(&self, attempt: &DeploymentAttempt) -> Result<Armed> {
        let target = self.config.target(&attempt.target)?;
        let bundle_cfg = &self.config.bundle;

        let secrets = self.materialize(bundle_cfg.secrets.clone()).await?;
        let key_secret = self.resolve_one(&self.key_refs()[0]).await?;
        let credential = match self.credential_ref(target) {
            Some(r) => Some(self.resolve_one(&r).await?),
            None => None,
        };

        let redactor = redactor_for(&secrets, [Some(&key_secret), credential.as_ref()]);
        let key = BundleKey::from_secret(&key_secret)?;
        drop(key_secret);

        let payload = bundle::bundle(
            bundle_cfg.static_fields.clone(),
            secrets,
            bundle_cfg.encryption_key.clone(),
        )?;
        if payload.fingerprint() != &attempt.bundle_fingerprint {
            return Err(KeelError::InvalidRequest(
                "bundle configuration changed since the attempt was requested".into(),
            ));
        }
        let sealed = payload.seal(&key)?;
        drop(payload);
        drop(key);
        debug!(attempt_id = attempt.id, bundle_id = %sealed.bundle_id, "bundle sealed");

        let session = self
            .executor
            .open(&attempt.target, target, credential.as_ref(), redactor)
            .await?;
        Ok(Armed { sealed, session })
    }

    /// Resolve `refs` off the async runtime. Backends may shell out or block
    /// on I/O, so a slow one is cut off at `timeouts.secrets_seconds`.
    async fn materialize(&self, refs: Vec<SecretRef>) -> Result<SecretSet> {
        let materializer = Arc::clone(&self.materializer);
        let backends = {
            let mut names: Vec<&str> = refs.iter().map(|r| r.from.backend()).collect();
            names.sort_unstable();
            names.dedup();
            names.join(",")
        };
        let limit = self.config.timeouts.secrets();
        let resolved = tokio::time::timeout(
            limit,
            tokio::task::spawn_blocking(move || materializer.resolve(&refs)),
        )
        .await;
        match resolved {
            Ok(Ok(set)) => set,
            Ok(Err(join)) => Err(KeelError::SecretStoreUnreachable {
                backend: backends,
                reason: format!("resolution task failed: {join}"),
            }),
            Err(_) => {
                warn!(backend = %backends, "secret resolution timed out");
                Err(KeelError::SecretStoreUnreachable {
                    backend: backends,
                    reason: format!("resolution timed out after {}s", limit.as_secs()),
                })
            }
        }
    }

    async fn resolve_one(&self, r: &SecretRef) -> Result<ResolvedSecret> {
        let mut set = self.materialize(vec![r.clone()]).await?;
        set.take(&r.name).ok_or_else(|| KeelError::SecretUnavailable {
            name: r.name.clone(),
        })
    }

    /// Transfer, activate and verify. `Ok(Err(_))` is a phase failure that
    /// needs a rollback; `Err(_)` is keel failing to record progress.
    async fn forward(
        &self,
        session: &mut ExecutorSession,
        attempt: &DeploymentAttempt,
        digest: &Digest,
        sealed: &EncryptedBundle,
    ) -> Result<std::result::Result<DeploymentAttempt, PhaseFailure>> {
        let id = attempt.id;

        let transfer = CommandSequence::transfer(digest, sealed.bundle_id);
        if let Err(error) = session.execute(&transfer, Some(sealed)).await {
            return Ok(Err(PhaseFailure {
                phase: Phase::Transfer,
                error,
            }));
        }
        self.commit(
            id,
            AttemptState::Transferring,
            AttemptState::Activating,
            SYSTEM_ACTOR,
            RedactedDetail::PhaseSucceeded {
                phase: Phase::Transfer,
            },
            |_: &mut DeploymentAttempt, _: &mut TargetRecord| {},
        )
        .await?;

        let activate = CommandSequence::activate(digest, sealed.bundle_id);
        if let Err(error) = session.execute(&activate, None).await {
            return Ok(Err(PhaseFailure {
                phase: Phase::Activate,
                error,
            }));
        }
        let active = digest.clone();
        self.commit(
            id,
            AttemptState::Activating,
            AttemptState::Verifying,
            SYSTEM_ACTOR,
            RedactedDetail::Activated {
                digest: digest.clone(),
            },
            move |_: &mut DeploymentAttempt, t: &mut TargetRecord| {
                t.current_version = Some(active.clone());
            },
        )
        .await?;

        let probes = match self.probe(session, digest).await {
            Ok(probes) => probes,
            Err(error) => {
                return Ok(Err(PhaseFailure {
                    phase: Phase::Verify,
                    error,
                }))
            }
        };
        let committed = self
            .commit(
                id,
                AttemptState::Verifying,
                AttemptState::Committed,
                SYSTEM_ACTOR,
                RedactedDetail::Healthy {
                    probes,
                    version: Some(digest.clone()),
                },
                |_: &mut DeploymentAttempt, _: &mut TargetRecord| {},
            )
            .await?;
        info!(attempt_id = id, target = %committed.target, %digest, "deployment committed");
        Ok(Ok(committed))
    }

    /// Probe until the target reports `expected` and healthy, or the
    /// schedule runs out. A lost connection ends probing at once.
    async fn probe(&self, session: &mut ExecutorSession, expected: &Digest) -> Result<u32> {
        let verify = CommandSequence::verify();
        let mut probes = 0u32;
        for delay in ProbeSchedule::new(&self.config.probe) {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            probes += 1;
            match session.execute(&verify, None).await {
                Ok(result) => match result.reported_version() {
                    Some(v) if &v == expected => return Ok(probes),
                    reported => {
                        debug!(probe = probes, expected = %expected, ?reported, "version mismatch")
                    }
                },
                Err(e @ KeelError::ConnectionFailed { .. }) => return Err(e),
                Err(e) => debug!(probe = probes, error = %e, "probe failed"),
            }
        }
        Err(KeelError::VerificationFailed { probes })
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    async fn roll_back(
        &self,
        session: &mut ExecutorSession,
        id: u64,
        failure: PhaseFailure,
        known_good: Option<&Digest>,
    ) -> Result<DeploymentAttempt> {
        let kind = failure.error.failure_kind();
        let exit_code = failure.error.exit_code();
        let phase = failure.phase;
        warn!(attempt_id = id, %phase, error = %failure.error, "phase failed, rolling back");
        self.commit(
            id,
            phase.state(),
            AttemptState::RollingBack,
            SYSTEM_ACTOR,
            RedactedDetail::PhaseFailed {
                phase,
                failure: kind,
                exit_code,
            },
            move |a: &mut DeploymentAttempt, _: &mut TargetRecord| {
                a.record_failure(kind, Some(phase), exit_code);
            },
        )
        .await?;
        self.finish_rollback(session, id, known_good).await
    }

    /// Run the rollback phase from `rolling_back`. Restoring a known-good
    /// version must pass a health probe; deactivating has nothing to probe.
    async fn finish_rollback(
        &self,
        session: &mut ExecutorSession,
        id: u64,
        known_good: Option<&Digest>,
    ) -> Result<DeploymentAttempt> {
        let restored = match session
            .execute(&CommandSequence::rollback(known_good), None)
            .await
        {
            Ok(_) => match known_good {
                Some(digest) => self.probe(session, digest).await,
                None => Ok(0),
            },
            Err(e) => Err(e),
        };

        match restored {
            Ok(probes) => {
                let version = known_good.cloned();
                let restored_version = version.clone();
                let attempt = self
                    .commit(
                        id,
                        AttemptState::RollingBack,
                        AttemptState::RolledBack,
                        SYSTEM_ACTOR,
                        RedactedDetail::Restored { version, probes },
                        move |_: &mut DeploymentAttempt, t: &mut TargetRecord| {
                            t.current_version = restored_version.clone();
                        },
                    )
                    .await?;
                info!(attempt_id = id, target = %attempt.target, "rolled back to known-good version");
                Ok(attempt)
            }
            Err(e) => {
                let kind = e.failure_kind();
                let exit_code = e.exit_code();
                warn!(attempt_id = id, error = %e, "rollback failed; target needs an operator");
                self.commit(
                    id,
                    AttemptState::RollingBack,
                    AttemptState::Failed,
                    SYSTEM_ACTOR,
                    RedactedDetail::PhaseFailed {
                        phase: Phase::Rollback,
                        failure: kind,
                        exit_code,
                    },
                    move |a: &mut DeploymentAttempt, t: &mut TargetRecord| {
                        a.record_failure(kind, Some(Phase::Rollback), exit_code);
                        t.degraded_by = Some(a.id);
                    },
                )
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancel / queries
    // -----------------------------------------------------------------------

    /// Cancel an attempt that has not touched its target yet.
    pub async fn cancel(&self, id: u64, actor: &str) -> Result<DeploymentAttempt> {
        paths::validate_actor(actor)?;
        let attempt = self.store.get_attempt(id)?;
        if !attempt.state.is_cancellable() {
            return Err(KeelError::CancelNotAllowed {
                id,
                state: attempt.state,
            });
        }
        let outcome = self
            .commit(
                id,
                attempt.state,
                AttemptState::Cancelled,
                actor,
                RedactedDetail::Cancelled,
                |_: &mut DeploymentAttempt, _: &mut TargetRecord| {},
            )
            .await;
        match outcome {
            Err(KeelError::InvalidTransition { .. }) => {
                let now = self.store.get_attempt(id)?;
                Err(KeelError::CancelNotAllowed {
                    id,
                    state: now.state,
                })
            }
            other => {
                if other.is_ok() {
                    info!(attempt_id = id, actor, "attempt cancelled");
                }
                other
            }
        }
    }

    pub fn status(&self, id: u64) -> Result<DeploymentAttempt> {
        self.store.get_attempt(id)
    }

    pub fn list(&self) -> Result<Vec<DeploymentAttempt>> {
        self.store.list_attempts()
    }

    pub fn audit(&self, id: u64) -> Result<Vec<AuditRecord>> {
        // Existence check so an unknown id is an error, not an empty trail.
        self.store.get_attempt(id)?;
        self.store.audit().read(id)
    }

    /// Verify the whole audit chain; returns the number of records checked.
    pub fn verify_audit(&self) -> Result<u64> {
        self.store.audit().verify()
    }

    pub fn targets(&self) -> Result<Vec<TargetRecord>> {
        self.store.list_targets()
    }

    /// Release a host left degraded by a failed rollback. The operator states
    /// which version they found running (`None` for nothing active); it
    /// becomes the known-good version for the next attempt.
    pub async fn repair_target(
        &self,
        target: &str,
        version: Option<Digest>,
        actor: &str,
    ) -> Result<TargetRecord> {
        paths::validate_actor(actor)?;
        paths::validate_name(target)?;
        self.config.target(target)?;
        let (record, _) = self
            .with_retry(|| {
                self.store
                    .repair_target(target, version.clone(), actor, Utc::now())
            })
            .await?;
        info!(target, actor, version = ?record.current_version, "target repaired");
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Settle attempts left non-terminal by a crash, if untouched for longer
    /// than `max_age`. Pre-mutation states are aborted, remote phases are
    /// rolled back once, and an interrupted rollback is marked failed.
    /// Attempts waiting for approval are left alone.
    pub async fn recover(&self, max_age: chrono::Duration) -> Result<Vec<DeploymentAttempt>> {
        let cutoff = Utc::now() - max_age;
        let mut settled = Vec::new();
        for attempt in self.store.list_attempts()? {
            if attempt.is_terminal() || attempt.updated_at > cutoff {
                continue;
            }
            let previous = attempt.state;
            let detail = RedactedDetail::Recovered { previous };
            let interrupted = |a: &mut DeploymentAttempt, _: &mut TargetRecord| {
                a.record_failure(FailureKind::Interrupted, None, None);
            };
            let outcome = match previous {
                AttemptState::Requested | AttemptState::Publishing => {
                    self.commit(attempt.id, previous, AttemptState::Aborted, RECOVERY_ACTOR, detail, interrupted)
                        .await
                }
                AttemptState::Transferring | AttemptState::Activating | AttemptState::Verifying => {
                    self.commit(attempt.id, previous, AttemptState::RollingBack, RECOVERY_ACTOR, detail, interrupted)
                        .await?;
                    self.resume_rollback(&attempt).await
                }
                AttemptState::RollingBack => {
                    self.commit(
                        attempt.id,
                        previous,
                        AttemptState::Failed,
                        RECOVERY_ACTOR,
                        detail,
                        |a: &mut DeploymentAttempt, t: &mut TargetRecord| {
                            a.record_failure(FailureKind::Interrupted, Some(Phase::Rollback), None);
                            t.degraded_by = Some(a.id);
                        },
                    )
                    .await
                }
                _ => continue,
            };
            let outcome = self.settled(attempt.id, outcome)?;
            warn!(attempt_id = attempt.id, from = %previous, to = %outcome.state, "recovered interrupted attempt");
            settled.push(outcome);
        }
        Ok(settled)
    }

    /// Open a fresh session for an attempt already in `rolling_back` and run
    /// the rollback phase. Failing to even connect ends in `failed`.
    async fn resume_rollback(&self, attempt: &DeploymentAttempt) -> Result<DeploymentAttempt> {
        let known_good = attempt.known_good.as_ref().and_then(|k| k.version.clone());
        match self.open_session(attempt).await {
            Ok(mut session) => {
                let result = self
                    .finish_rollback(&mut session, attempt.id, known_good.as_ref())
                    .await;
                close_session(session).await;
                result
            }
            Err(e) => {
                let kind = e.failure_kind();
                warn!(attempt_id = attempt.id, error = %e, "cannot reach target to roll back");
                self.commit(
                    attempt.id,
                    AttemptState::RollingBack,
                    AttemptState::Failed,
                    RECOVERY_ACTOR,
                    RedactedDetail::PhaseFailed {
                        phase: Phase::Rollback,
                        failure: kind,
                        exit_code: None,
                    },
                    move |a: &mut DeploymentAttempt, t: &mut TargetRecord| {
                        a.record_failure(kind, Some(Phase::Rollback), None);
                        t.degraded_by = Some(a.id);
                    },
                )
                .await
            }
        }
    }

    /// Session for rollback only: no bundle is sealed, but every bundle
    /// secret still feeds the redaction filter.
    async fn open_session(&self, attempt: &DeploymentAttempt) -> Result<ExecutorSession> {
        let target = self.config.target(&attempt.target)?;
        let secrets = self.materialize(self.config.bundle.secrets.clone()).await?;
        let credential = match self.credential_ref(target) {
            Some(r) => Some(self.resolve_one(&r).await?),
            None => None,
        };
        let redactor = redactor_for(&secrets, [credential.as_ref(), None]);
        drop(secrets);
        self.executor
            .open(&attempt.target, target, credential.as_ref(), redactor)
            .await
    }

    // -----------------------------------------------------------------------
    // Durable writes
    // -----------------------------------------------------------------------

    /// End an attempt that never touched its target.
    async fn abort(
        &self,
        id: u64,
        from: AttemptState,
        error: &KeelError,
        actor: &str,
    ) -> Result<DeploymentAttempt> {
        let kind = error.failure_kind();
        warn!(attempt_id = id, from = %from, error = %error, "attempt aborted");
        let outcome = self
            .commit(
                id,
                from,
                AttemptState::Aborted,
                actor,
                RedactedDetail::Aborted { failure: kind },
                move |a: &mut DeploymentAttempt, _: &mut TargetRecord| {
                    a.record_failure(kind, None, None);
                },
            )
            .await;
        self.settled(id, outcome)
    }

    async fn commit<F>(
        &self,
        id: u64,
        from: AttemptState,
        to: AttemptState,
        actor: &str,
        detail: RedactedDetail,
        mutate: F,
    ) -> Result<DeploymentAttempt>
    where
        F: Fn(&mut DeploymentAttempt, &mut TargetRecord) + Send + Sync,
    {
        let transition = Transition {
            attempt_id: id,
            from,
            to,
            actor: actor.to_string(),
            detail,
        };
        let (attempt, record) = self
            .with_retry(|| {
                self.store
                    .commit_transition(transition.clone(), Utc::now(), &mutate)
            })
            .await?;
        info!(
            attempt_id = id,
            target = %attempt.target,
            from = %from,
            to = %to,
            seq = record.sequence_no,
            "transition"
        );
        Ok(attempt)
    }

    /// Retry store failures with doubling delays. Any other error returns at
    /// once; a transition that never commits did not happen.
    async fn with_retry<T, Op>(&self, mut op: Op) -> Result<T>
    where
        Op: FnMut() -> Result<T> + Send,
    {
        let attempts = self.config.audit.write_retries.max(1);
        let mut delay = Duration::from_millis(self.config.audit.retry_delay_ms);
        let mut last = String::new();
        for n in 1..=attempts {
            match op() {
                Err(KeelError::Store(reason)) => {
                    warn!(attempt = n, of = attempts, %reason, "durable write failed");
                    last = reason;
                    if n < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                other => return other,
            }
        }
        Err(KeelError::AuditUnavailable {
            attempts,
            reason: last,
        })
    }
}

fn redactor_for<'a>(
    secrets: &'a SecretSet,
    extra: [Option<&'a ResolvedSecret>; 2],
) -> RedactionFilter {
    RedactionFilter::new(
        secrets
            .iter()
            .chain(extra.into_iter().flatten())
            .map(ResolvedSecret::expose),
    )
}

async fn close_session(session: ExecutorSession) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "closing remote session failed");
    }
}
