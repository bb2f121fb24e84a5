//! Durable deployment records in redb.
//!
//! # Table design
//!
//! ```text
//! attempts  key: attempt id u64 big-endian   value: JSON DeploymentAttempt
//! targets   key: target name                 value: JSON TargetRecord
//! meta      key: &str                        value: u64 (next attempt id)
//! ```
//!
//! plus the audit tables from [`crate::audit`]. Every mutation runs in one
//! redb write transaction; redb serializes writers, so the per-host claim,
//! the id counter and the audit head all have a single writer at a time.
//! A state change and its audit record commit together or not at all.

use crate::audit::{self, AuditEntry, AuditLog, AuditRecord, RedactedDetail};
use crate::bundle::BundleFingerprint;
use crate::error::{store_err, KeelError, Result};
use crate::machine::attempt::{DeploymentAttempt, HistoryEntry};
use crate::publish::Digest;
use crate::types::AttemptState;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const ATTEMPTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("attempts");
const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ATTEMPT_ID: &str = "next_attempt_id";

fn attempt_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

// ---------------------------------------------------------------------------
// TargetRecord
// ---------------------------------------------------------------------------

/// What keel knows about one target host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub host: String,
    /// Written only by activation and rollback, under the host claim.
    #[serde(default)]
    pub current_version: Option<Digest>,
    /// Attempt currently holding the per-host exclusion.
    #[serde(default)]
    pub claimed_by: Option<u64>,
    /// Set when a rollback failed; the host needs an operator.
    #[serde(default)]
    pub degraded_by: Option<u64>,
}

impl TargetRecord {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            current_version: None,
            claimed_by: None,
            degraded_by: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub target: String,
    pub repository: String,
    pub bundle_fingerprint: BundleFingerprint,
    pub requested_by: String,
}

/// A compare-and-set state change: applied only if the attempt is still in `from`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub attempt_id: u64,
    pub from: AttemptState,
    pub to: AttemptState,
    pub actor: String,
    pub detail: RedactedDetail,
}

// ---------------------------------------------------------------------------
// DeploymentStore
// ---------------------------------------------------------------------------

pub struct DeploymentStore {
    db: Arc<Database>,
    audit: AuditLog,
    fail_writes: AtomicU32,
}

fn read_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn load_attempt(txn: &WriteTransaction, id: u64) -> Result<DeploymentAttempt> {
    let table = txn.open_table(ATTEMPTS).map_err(store_err)?;
    let guard = table
        .get(attempt_key(id).as_slice())
        .map_err(store_err)?
        .ok_or(KeelError::AttemptNotFound(id))?;
    read_json(guard.value())
}

fn load_target(txn: &WriteTransaction, host: &str) -> Result<TargetRecord> {
    let table = txn.open_table(TARGETS).map_err(store_err)?;
    let record = match table.get(host).map_err(store_err)? {
        Some(guard) => read_json(guard.value())?,
        None => TargetRecord::new(host),
    };
    Ok(record)
}

fn put_attempt(txn: &WriteTransaction, attempt: &DeploymentAttempt) -> Result<()> {
    let value = serde_json::to_vec(attempt)?;
    let mut table = txn.open_table(ATTEMPTS).map_err(store_err)?;
    table
        .insert(attempt_key(attempt.id).as_slice(), value.as_slice())
        .map_err(store_err)?;
    Ok(())
}

fn put_target(txn: &WriteTransaction, record: &TargetRecord) -> Result<()> {
    let value = serde_json::to_vec(record)?;
    let mut table = txn.open_table(TARGETS).map_err(store_err)?;
    table
        .insert(record.host.as_str(), value.as_slice())
        .map_err(store_err)?;
    Ok(())
}

impl DeploymentStore {
    /// Open or create the database at `path` and make sure every table exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        Self::from_database(Arc::new(db))
    }

    pub fn from_database(db: Arc<Database>) -> Result<Self> {
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(ATTEMPTS).map_err(store_err)?;
        wt.open_table(TARGETS).map_err(store_err)?;
        wt.open_table(META).map_err(store_err)?;
        audit::ensure_tables(&wt)?;
        wt.commit().map_err(store_err)?;
        let audit = AuditLog::new(Arc::clone(&db))?;
        Ok(Self {
            db,
            audit,
            fail_writes: AtomicU32::new(0),
        })
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Make the next `n` write transactions fail before committing.
    #[cfg(test)]
    pub(crate) fn inject_write_failures(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(KeelError::Store("injected write failure".to_string()));
        }
        self.db.begin_write().map_err(store_err)
    }

    /// Create an attempt for `new.target`, take the host claim and record
    /// `requested -> publishing`, all in one transaction. If the host is
    /// already claimed, or degraded by a failed rollback, nothing is written.
    pub fn create_attempt(
        &self,
        new: NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<(DeploymentAttempt, AuditRecord)> {
        let wt = self.begin_write()?;
        let mut target = load_target(&wt, &new.target)?;
        if let Some(holder) = target.claimed_by {
            return Err(KeelError::AttemptInProgress {
                target: new.target,
                attempt_id: holder,
            });
        }
        if let Some(failed) = target.degraded_by {
            return Err(KeelError::TargetDegraded {
                target: new.target,
                attempt_id: failed,
            });
        }

        let id = {
            let mut meta = wt.open_table(META).map_err(store_err)?;
            let id = meta
                .get(NEXT_ATTEMPT_ID)
                .map_err(store_err)?
                .map(|g| g.value())
                .unwrap_or(1);
            meta.insert(NEXT_ATTEMPT_ID, id + 1).map_err(store_err)?;
            id
        };

        let attempt = DeploymentAttempt {
            id,
            target: new.target.clone(),
            repository: new.repository.clone(),
            artifact: None,
            bundle_fingerprint: new.bundle_fingerprint.clone(),
            state: AttemptState::Publishing,
            started_at: now,
            updated_at: now,
            requested_by: new.requested_by.clone(),
            history: vec![
                HistoryEntry {
                    state: AttemptState::Requested,
                    at: now,
                    actor: new.requested_by.clone(),
                },
                HistoryEntry {
                    state: AttemptState::Publishing,
                    at: now,
                    actor: new.requested_by.clone(),
                },
            ],
            known_good: None,
            approval: None,
            outcome: None,
        };
        target.claimed_by = Some(id);

        put_attempt(&wt, &attempt)?;
        put_target(&wt, &target)?;
        let record = audit::append_in(
            &wt,
            AuditEntry {
                attempt_id: id,
                from_state: AttemptState::Requested,
                to_state: AttemptState::Publishing,
                actor: new.requested_by,
                detail: RedactedDetail::Requested {
                    target: new.target,
                    repository: new.repository,
                    fingerprint: new.bundle_fingerprint,
                },
            },
            now,
        )?;
        wt.commit().map_err(store_err)?;
        Ok((attempt, record))
    }

    /// Apply `transition` if the attempt is still in `transition.from` and the
    /// edge is legal. `mutate` may edit the attempt and its target record
    /// before they are written. Terminal states release the host claim.
    pub fn commit_transition<F>(
        &self,
        transition: Transition,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<(DeploymentAttempt, AuditRecord)>
    where
        F: FnOnce(&mut DeploymentAttempt, &mut TargetRecord),
    {
        let wt = self.begin_write()?;
        let mut attempt = load_attempt(&wt, transition.attempt_id)?;
        if attempt.state != transition.from {
            return Err(KeelError::InvalidTransition {
                from: attempt.state.to_string(),
                to: transition.to.to_string(),
                reason: format!("attempt is no longer {}", transition.from),
            });
        }
        if !transition.from.can_transition_to(transition.to) {
            return Err(KeelError::InvalidTransition {
                from: transition.from.to_string(),
                to: transition.to.to_string(),
                reason: "not a legal edge".to_string(),
            });
        }

        let mut target = load_target(&wt, &attempt.target)?;
        mutate(&mut attempt, &mut target);

        attempt.state = transition.to;
        attempt.updated_at = now;
        attempt.history.push(HistoryEntry {
            state: transition.to,
            at: now,
            actor: transition.actor.clone(),
        });
        if transition.to.is_terminal() && target.claimed_by == Some(attempt.id) {
            target.claimed_by = None;
        }

        put_attempt(&wt, &attempt)?;
        put_target(&wt, &target)?;
        let record = audit::append_in(
            &wt,
            AuditEntry {
                attempt_id: attempt.id,
                from_state: transition.from,
                to_state: transition.to,
                actor: transition.actor,
                detail: transition.detail,
            },
            now,
        )?;
        wt.commit().map_err(store_err)?;
        Ok((attempt, record))
    }

    /// Clear the degraded mark on `host` after an operator has checked it by
    /// hand. `version` is what the operator confirmed is running and becomes
    /// the next rollback target. The audit record is attached to the attempt
    /// whose rollback failed.
    pub fn repair_target(
        &self,
        host: &str,
        version: Option<Digest>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(TargetRecord, AuditRecord)> {
        let wt = self.begin_write()?;
        let mut target = load_target(&wt, host)?;
        let failed = target
            .degraded_by
            .ok_or_else(|| KeelError::InvalidState(format!("target {host} is not degraded")))?;
        if let Some(holder) = target.claimed_by {
            return Err(KeelError::AttemptInProgress {
                target: host.to_string(),
                attempt_id: holder,
            });
        }
        let attempt = load_attempt(&wt, failed)?;

        target.degraded_by = None;
        target.current_version = version.clone();
        put_target(&wt, &target)?;
        let record = audit::append_in(
            &wt,
            AuditEntry {
                attempt_id: failed,
                from_state: attempt.state,
                to_state: attempt.state,
                actor: actor.to_string(),
                detail: RedactedDetail::Repaired { version },
            },
            now,
        )?;
        wt.commit().map_err(store_err)?;
        Ok((target, record))
    }

    pub fn get_attempt(&self, id: u64) -> Result<DeploymentAttempt> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(store_err)?;
        let guard = table
            .get(attempt_key(id).as_slice())
            .map_err(store_err)?
            .ok_or(KeelError::AttemptNotFound(id))?;
        read_json(guard.value())
    }

    /// All attempts, newest first.
    pub fn list_attempts(&self) -> Result<Vec<DeploymentAttempt>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(store_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            out.push(read_json::<DeploymentAttempt>(v.value())?);
        }
        out.reverse();
        Ok(out)
    }

    /// A non-terminal attempt other than `exclude` deploying the same
    /// artifact and bundle to the same target.
    pub fn find_duplicate(
        &self,
        target: &str,
        fingerprint: &BundleFingerprint,
        digest: &Digest,
        exclude: u64,
    ) -> Result<Option<u64>> {
        Ok(self
            .list_attempts()?
            .into_iter()
            .find(|a| {
                a.id != exclude
                    && !a.is_terminal()
                    && a.target == target
                    && &a.bundle_fingerprint == fingerprint
                    && a.digest() == Some(digest)
            })
            .map(|a| a.id))
    }

    pub fn get_target(&self, host: &str) -> Result<Option<TargetRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(TARGETS).map_err(store_err)?;
        let record = match table.get(host).map_err(store_err)? {
            Some(guard) => Some(read_json(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    pub fn list_targets(&self) -> Result<Vec<TargetRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(TARGETS).map_err(store_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            out.push(read_json(v.value())?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
