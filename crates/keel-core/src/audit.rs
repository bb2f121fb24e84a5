//! Append-only, hash-chained audit log of attempt state transitions.
//!
//! # Table design
//!
//! ```text
//! audit             key: sequence_no u64 big-endian           value: JSON AuditRecord
//! audit_by_attempt  key: attempt_id BE ++ sequence_no BE      value: empty
//! audit_head        key: "head"                               value: JSON ChainHead
//! ```
//!
//! Big-endian keys make byte order equal numeric order, so the newest record
//! is `table.last()` and an attempt's records are one prefix range scan.
//! `audit_head` is written in the same transaction as every append; a
//! newest record that disagrees with it means records were cut from the tail.
//!
//! Records carry `prev_hash` and `hash = sha256(prev_hash || canonical(record))`.
//! The `detail` field is a closed enum of typed facts with no free text, so
//! there is nowhere for a secret value to be written.

use crate::bundle::BundleFingerprint;
use crate::error::{store_err, KeelError, Result};
use crate::publish::{ArtifactReference, Digest};
use crate::types::{AttemptState, Phase};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub(crate) const AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit");
pub(crate) const AUDIT_BY_ATTEMPT: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("audit_by_attempt");
const AUDIT_HEAD: TableDefinition<&str, &[u8]> = TableDefinition::new("audit_head");
const HEAD_KEY: &str = "head";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChainHead {
    sequence_no: u64,
    hash: String,
}

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn attempt_key(attempt_id: u64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&attempt_id.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// FailureKind / RedactedDetail
// ---------------------------------------------------------------------------

/// Structured error kind recorded instead of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SecretUnavailable,
    SecretStoreUnreachable,
    BundleSealFailed,
    PublishRejected,
    PublishConflict,
    RegistryUnreachable,
    ArtifactNotFound,
    ConnectionFailed,
    CommandFailed,
    Timeout,
    VerificationFailed,
    DuplicateAttempt,
    Interrupted,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::SecretUnavailable => "secret_unavailable",
            FailureKind::SecretStoreUnreachable => "secret_store_unreachable",
            FailureKind::BundleSealFailed => "bundle_seal_failed",
            FailureKind::PublishRejected => "publish_rejected",
            FailureKind::PublishConflict => "publish_conflict",
            FailureKind::RegistryUnreachable => "registry_unreachable",
            FailureKind::ArtifactNotFound => "artifact_not_found",
            FailureKind::ConnectionFailed => "connection_failed",
            FailureKind::CommandFailed => "command_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::VerificationFailed => "verification_failed",
            FailureKind::DuplicateAttempt => "duplicate_attempt",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedactedDetail {
    Requested {
        target: String,
        repository: String,
        fingerprint: BundleFingerprint,
    },
    Published {
        artifact: ArtifactReference,
    },
    Approved {
        approver_id: String,
        known_good: Option<Digest>,
    },
    PhaseSucceeded {
        phase: Phase,
    },
    Activated {
        digest: Digest,
    },
    Healthy {
        probes: u32,
        version: Option<Digest>,
    },
    PhaseFailed {
        phase: Phase,
        failure: FailureKind,
        exit_code: Option<i32>,
    },
    Restored {
        version: Option<Digest>,
        probes: u32,
    },
    Aborted {
        failure: FailureKind,
    },
    Cancelled,
    Recovered {
        previous: AttemptState,
    },
    /// An operator confirmed what a degraded host runs and released it.
    Repaired {
        version: Option<Digest>,
    },
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence_no: u64,
    pub attempt_id: u64,
    pub from_state: AttemptState,
    pub to_state: AttemptState,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub detail: RedactedDetail,
    pub prev_hash: String,
    pub hash: String,
}

/// A transition to be recorded. Sequence, timestamp and hashes are assigned on append.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub attempt_id: u64,
    pub from_state: AttemptState,
    pub to_state: AttemptState,
    pub actor: String,
    pub detail: RedactedDetail,
}

#[derive(Serialize)]
struct CanonicalBody<'a> {
    sequence_no: u64,
    attempt_id: u64,
    from_state: AttemptState,
    to_state: AttemptState,
    timestamp: &'a DateTime<Utc>,
    actor: &'a str,
    detail: &'a RedactedDetail,
}

impl AuditRecord {
    pub fn compute_hash(&self) -> Result<String> {
        let body = serde_json::to_vec(&CanonicalBody {
            sequence_no: self.sequence_no,
            attempt_id: self.attempt_id,
            from_state: self.from_state,
            to_state: self.to_state,
            timestamp: &self.timestamp,
            actor: &self.actor,
            detail: &self.detail,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn corrupted(sequence_no: u64, reason: impl Into<String>) -> KeelError {
    KeelError::AuditCorrupted {
        sequence_no,
        reason: reason.into(),
    }
}

/// Check `record` (stored under `key_seq`) against its predecessor.
fn check_link(prev: Option<&AuditRecord>, key_seq: u64, record: &AuditRecord) -> Result<()> {
    if record.sequence_no != key_seq {
        return Err(corrupted(key_seq, "record stored under the wrong sequence number"));
    }
    let expected_prev = match prev {
        Some(p) => {
            if p.sequence_no + 1 != record.sequence_no {
                return Err(corrupted(p.sequence_no + 1, "gap in sequence"));
            }
            p.hash.as_str()
        }
        None if record.sequence_no == 1 => GENESIS_HASH,
        None => {
            return Err(corrupted(
                record.sequence_no.saturating_sub(1),
                "missing predecessor",
            ))
        }
    };
    if record.prev_hash != expected_prev {
        return Err(corrupted(record.sequence_no, "prev_hash does not match predecessor"));
    }
    if record.compute_hash()? != record.hash {
        return Err(corrupted(record.sequence_no, "hash does not match content"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transaction-level operations (shared with the deployment store)
// ---------------------------------------------------------------------------

pub(crate) fn ensure_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(AUDIT).map_err(store_err)?;
    txn.open_table(AUDIT_BY_ATTEMPT).map_err(store_err)?;
    txn.open_table(AUDIT_HEAD).map_err(store_err)?;
    Ok(())
}

fn read_marker(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Option<ChainHead>> {
    match table.get(HEAD_KEY).map_err(store_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

/// Compare the newest stored record with the recorded chain head.
fn check_head(marker: Option<&ChainHead>, last: Option<&AuditRecord>) -> Result<()> {
    match (marker, last) {
        (None, None) => Ok(()),
        (Some(m), Some(l)) if m.sequence_no == l.sequence_no && m.hash == l.hash => Ok(()),
        (Some(m), _) => Err(corrupted(m.sequence_no, "chain truncated")),
        (None, Some(l)) => Err(corrupted(l.sequence_no, "chain head missing")),
    }
}

/// Append inside the caller's write transaction, so the record commits
/// atomically with whatever state change it describes.
pub(crate) fn append_in(
    txn: &WriteTransaction,
    entry: AuditEntry,
    now: DateTime<Utc>,
) -> Result<AuditRecord> {
    let mut table = txn.open_table(AUDIT).map_err(store_err)?;
    let mut heads = txn.open_table(AUDIT_HEAD).map_err(store_err)?;
    let last: Option<AuditRecord> = table
        .last()
        .map_err(store_err)?
        .map(|(_, v)| serde_json::from_slice(v.value()))
        .transpose()?;
    let marker = read_marker(&heads)?;
    check_head(marker.as_ref(), last.as_ref())?;
    let (sequence_no, prev_hash) = match marker {
        Some(h) => (h.sequence_no + 1, h.hash),
        None => (1, GENESIS_HASH.to_string()),
    };

    let mut record = AuditRecord {
        sequence_no,
        attempt_id: entry.attempt_id,
        from_state: entry.from_state,
        to_state: entry.to_state,
        timestamp: now,
        actor: entry.actor,
        detail: entry.detail,
        prev_hash,
        hash: String::new(),
    };
    record.hash = record.compute_hash()?;

    let value = serde_json::to_vec(&record)?;
    table
        .insert(seq_key(sequence_no).as_slice(), value.as_slice())
        .map_err(store_err)?;
    let mut index = txn.open_table(AUDIT_BY_ATTEMPT).map_err(store_err)?;
    index
        .insert(attempt_key(record.attempt_id, sequence_no).as_slice(), b"".as_slice())
        .map_err(store_err)?;
    let marker = serde_json::to_vec(&ChainHead {
        sequence_no,
        hash: record.hash.clone(),
    })?;
    heads
        .insert(HEAD_KEY, marker.as_slice())
        .map_err(store_err)?;
    Ok(record)
}

fn get_record(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    seq: u64,
) -> Result<Option<AuditRecord>> {
    match table.get(seq_key(seq).as_slice()).map_err(store_err)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Read-mostly view over the audit tables. Shares the database with the
/// deployment store.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let wt = db.begin_write().map_err(store_err)?;
        ensure_tables(&wt)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Append a standalone record in its own transaction.
    pub fn append(&self, entry: AuditEntry) -> Result<u64> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let record = append_in(&wt, entry, Utc::now())?;
        wt.commit().map_err(store_err)?;
        Ok(record.sequence_no)
    }

    /// All records for one attempt, oldest first. Each record is checked
    /// against its predecessor in the global chain.
    pub fn read(&self, attempt_id: u64) -> Result<Vec<AuditRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AUDIT).map_err(store_err)?;
        let index = rt.open_table(AUDIT_BY_ATTEMPT).map_err(store_err)?;

        let lower = attempt_key(attempt_id, 0);
        let upper = attempt_key(attempt_id, u64::MAX);
        let mut records = Vec::new();
        for entry in index
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(store_err)?
        {
            let (k, _) = entry.map_err(store_err)?;
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&k.value()[8..16]);
            let seq = u64::from_be_bytes(seq_bytes);

            let record =
                get_record(&table, seq)?.ok_or_else(|| corrupted(seq, "indexed record missing"))?;
            if record.attempt_id != attempt_id {
                return Err(corrupted(seq, "record does not belong to indexed attempt"));
            }
            let prev = if seq > 1 {
                let prev = get_record(&table, seq - 1)?;
                Some(prev.ok_or_else(|| corrupted(seq - 1, "gap in sequence"))?)
            } else {
                None
            };
            check_link(prev.as_ref(), seq, &record)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records with `range.start <= sequence_no < range.end`, verified as a chain.
    pub fn read_range(&self, range: Range<u64>) -> Result<Vec<AuditRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AUDIT).map_err(store_err)?;

        let start = range.start.max(1);
        if start >= range.end {
            return Ok(Vec::new());
        }
        let mut prev = if start > 1 {
            get_record(&table, start - 1)?
        } else {
            None
        };
        if start > 1 && prev.is_none() {
            // Nothing before `start` means nothing at or after it either.
            if table
                .range(seq_key(start).as_slice()..)
                .map_err(store_err)?
                .next()
                .is_some()
            {
                return Err(corrupted(start - 1, "gap in sequence"));
            }
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let lower = seq_key(start);
        let upper = seq_key(range.end);
        for entry in table
            .range(lower.as_slice()..upper.as_slice())
            .map_err(store_err)?
        {
            let (k, v) = entry.map_err(store_err)?;
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(k.value());
            let key_seq = u64::from_be_bytes(seq_bytes);
            let record: AuditRecord = serde_json::from_slice(v.value())?;
            check_link(prev.as_ref(), key_seq, &record)?;
            prev = Some(record.clone());
            records.push(record);
        }
        Ok(records)
    }

    /// Walk the whole chain and check it ends at the recorded head.
    /// Returns the number of records verified.
    pub fn verify(&self) -> Result<u64> {
        let records = self.read_range(1..u64::MAX)?;
        let rt = self.db.begin_read().map_err(store_err)?;
        let heads = rt.open_table(AUDIT_HEAD).map_err(store_err)?;
        check_head(read_marker(&heads)?.as_ref(), records.last())?;
        Ok(records.len() as u64)
    }

    pub fn head(&self) -> Result<Option<AuditRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AUDIT).map_err(store_err)?;
        let head = table
            .last()
            .map_err(store_err)?
            .map(|(_, v)| serde_json::from_slice(v.value()))
            .transpose()?;
        Ok(head)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, Arc<Database>, AuditLog) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("audit.db")).unwrap());
        let log = AuditLog::new(db.clone()).unwrap();
        (dir, db, log)
    }

    fn entry(attempt_id: u64, from: AttemptState, to: AttemptState) -> AuditEntry {
        AuditEntry {
            attempt_id,
            from_state: from,
            to_state: to,
            actor: "keel".into(),
            detail: RedactedDetail::PhaseSucceeded {
                phase: Phase::Transfer,
            },
        }
    }

    /// Overwrite one stored record with `f` applied.
    fn tamper(db: &Database, seq: u64, f: impl FnOnce(&mut AuditRecord)) {
        let wt = db.begin_write().unwrap();
        {
            let mut table = wt.open_table(AUDIT).unwrap();
            let mut rec: AuditRecord = {
                let v = table.get(seq_key(seq).as_slice()).unwrap().unwrap();
                serde_json::from_slice(v.value()).unwrap()
            };
            f(&mut rec);
            let bytes = serde_json::to_vec(&rec).unwrap();
            table
                .insert(seq_key(seq).as_slice(), bytes.as_slice())
                .unwrap();
        }
        wt.commit().unwrap();
    }

    #[test]
    fn sequence_starts_at_one_and_chains() {
        let (_dir, _db, log) = open();
        assert_eq!(
            log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
                .unwrap(),
            1
        );
        assert_eq!(
            log.append(entry(1, AttemptState::Publishing, AttemptState::PendingApproval))
                .unwrap(),
            2
        );
        let records = log.read(1).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(log.verify().unwrap(), 2);
    }

    #[test]
    fn read_filters_by_attempt() {
        let (_dir, _db, log) = open();
        log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
            .unwrap();
        log.append(entry(2, AttemptState::Requested, AttemptState::Publishing))
            .unwrap();
        log.append(entry(1, AttemptState::Publishing, AttemptState::Aborted))
            .unwrap();
        let one: Vec<u64> = log.read(1).unwrap().iter().map(|r| r.sequence_no).collect();
        assert_eq!(one, vec![1, 3]);
        assert_eq!(log.read(2).unwrap().len(), 1);
        assert!(log.read(99).unwrap().is_empty());
    }

    #[test]
    fn read_range_is_half_open() {
        let (_dir, _db, log) = open();
        for _ in 0..5 {
            log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
                .unwrap();
        }
        let seqs: Vec<u64> = log
            .read_range(2..4)
            .unwrap()
            .iter()
            .map(|r| r.sequence_no)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(log.read_range(10..20).unwrap().is_empty());
    }

    #[test]
    fn edited_detail_is_detected() {
        let (_dir, db, log) = open();
        log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
            .unwrap();
        log.append(entry(1, AttemptState::Publishing, AttemptState::PendingApproval))
            .unwrap();
        tamper(&db, 1, |r| r.actor = "mallory".into());
        let err = log.verify().unwrap_err();
        assert!(matches!(err, KeelError::AuditCorrupted { sequence_no: 1, .. }));
        assert!(log.read(1).is_err());
    }

    #[test]
    fn rehashed_edit_breaks_the_next_link() {
        let (_dir, db, log) = open();
        log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
            .unwrap();
        log.append(entry(1, AttemptState::Publishing, AttemptState::PendingApproval))
            .unwrap();
        tamper(&db, 1, |r| {
            r.actor = "mallory".into();
            r.hash = r.compute_hash().unwrap();
        });
        let err = log.verify().unwrap_err();
        assert!(matches!(err, KeelError::AuditCorrupted { sequence_no: 2, .. }));
    }

    #[test]
    fn gap_is_detected() {
        let (_dir, db, log) = open();
        for _ in 0..3 {
            log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
                .unwrap();
        }
        let wt = db.begin_write().unwrap();
        {
            let mut table = wt.open_table(AUDIT).unwrap();
            table.remove(seq_key(2).as_slice()).unwrap();
        }
        wt.commit().unwrap();
        assert!(matches!(
            log.verify(),
            Err(KeelError::AuditCorrupted { sequence_no: 2, .. })
        ));
    }

    #[test]
    fn tail_deletion_is_detected() {
        let (_dir, db, log) = open();
        for _ in 0..3 {
            log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
                .unwrap();
        }
        let wt = db.begin_write().unwrap();
        {
            let mut table = wt.open_table(AUDIT).unwrap();
            table.remove(seq_key(3).as_slice()).unwrap();
        }
        wt.commit().unwrap();
        assert!(matches!(
            log.verify(),
            Err(KeelError::AuditCorrupted { sequence_no: 3, .. })
        ));
        // Appending over a cut tail would hide the cut.
        assert!(matches!(
            log.append(entry(1, AttemptState::Requested, AttemptState::Publishing)),
            Err(KeelError::AuditCorrupted { .. })
        ));
    }

    #[test]
    fn emptied_log_is_detected() {
        let (_dir, db, log) = open();
        log.append(entry(1, AttemptState::Requested, AttemptState::Publishing))
            .unwrap();
        let wt = db.begin_write().unwrap();
        {
            let mut table = wt.open_table(AUDIT).unwrap();
            table.remove(seq_key(1).as_slice()).unwrap();
        }
        wt.commit().unwrap();
        assert!(log.verify().is_err());
    }

    #[test]
    fn concurrent_appends_are_gapless() {
        let (_dir, _db, log) = open();
        let handles: Vec<_> = (1..=4u64)
            .map(|attempt| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(entry(
                            attempt,
                            AttemptState::Requested,
                            AttemptState::Publishing,
                        ))
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let all = log.read_range(1..u64::MAX).unwrap();
        let seqs: Vec<u64> = all.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<_>>());
        for attempt in 1..=4 {
            assert_eq!(log.read(attempt).unwrap().len(), 25);
        }
    }

    #[test]
    fn detail_serializes_as_tagged_facts() {
        let detail = RedactedDetail::PhaseFailed {
            phase: Phase::Activate,
            failure: FailureKind::CommandFailed,
            exit_code: Some(2),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "phase_failed");
        assert_eq!(json["phase"], "activate");
        assert_eq!(json["failure"], "command_failed");
    }
}
