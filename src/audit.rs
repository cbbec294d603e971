//! Immutable, hash-stamped audit ledger.
//!
//! Every record carries a digest of its own `data` snapshot, computed at
//! append time over the canonical CBOR encoding and re-derivable later for
//! verification. The ledger is append-only: no update or delete path exists.
//! Records are individually self-verifying; they are not chained to each
//! other, so a deleted record is not detectable by this mechanism alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{JourneyError, Result};
use crate::time::{Clock, TimeStamp};
use chrono::Utc;

const AUDIT_TREE: &str = "audit_records";

/// What happened. Closed set so an unknown action is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AuditAction {
    #[n(0)]
    StageStarted,
    #[n(1)]
    StageCompleted,
    #[n(2)]
    StageBlocked,
    #[n(3)]
    StepProgressUpdated,
    #[n(4)]
    StepRetried,
    #[n(5)]
    LegalAgreementSigned,
    #[n(6)]
    SignatureRejected,
    #[n(7)]
    SubscriptionSelected,
    #[n(8)]
    OnboardingCompleted,
    #[n(9)]
    RewardIssueFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::StageStarted => "stage_started",
            AuditAction::StageCompleted => "stage_completed",
            AuditAction::StageBlocked => "stage_blocked",
            AuditAction::StepProgressUpdated => "step_progress_updated",
            AuditAction::StepRetried => "step_retried",
            AuditAction::LegalAgreementSigned => "legal_agreement_signed",
            AuditAction::SignatureRejected => "signature_rejected",
            AuditAction::SubscriptionSelected => "subscription_selected",
            AuditAction::OnboardingCompleted => "onboarding_completed",
            AuditAction::RewardIssueFailed => "reward_issue_failed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AuditRecord {
    #[n(0)]
    pub id: String, // uuid7, doubles as the storage key so keys sort by time
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub document_id: Option<String>,
    #[n(3)]
    pub action: AuditAction,
    #[n(4)]
    pub data: BTreeMap<String, String>,
    #[n(5)]
    pub data_hash: String,
    #[n(6)]
    pub ip: Option<String>,
    #[n(7)]
    pub user_agent: Option<String>,
    #[n(8)]
    pub timestamp: TimeStamp<Utc>,
}

/// Result of re-deriving a record's data hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerification {
    pub is_valid: bool,
    pub stored_hash: String,
    pub recomputed_hash: String,
}

/// Exact-match/range filters for `query`. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub document_id: Option<String>,
    pub action: Option<AuditAction>,
    pub from: Option<TimeStamp<Utc>>,
    pub to: Option<TimeStamp<Utc>>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(user_id) = &self.user_id
            && record.user_id != *user_id
        {
            return false;
        }
        if let Some(document_id) = &self.document_id
            && record.document_id.as_deref() != Some(document_id.as_str())
        {
            return false;
        }
        if let Some(action) = self.action
            && record.action != action
        {
            return false;
        }
        if let Some(from) = &self.from
            && record.timestamp < *from
        {
            return false;
        }
        if let Some(to) = &self.to
            && record.timestamp > *to
        {
            return false;
        }
        true
    }
}

/// Digest of a data snapshot: SHA-256 over its canonical CBOR encoding.
/// `BTreeMap` keeps key order deterministic, so equal maps hash equally.
pub fn data_digest(data: &BTreeMap<String, String>) -> Result<String> {
    let cbor = minicbor::to_vec(data).map_err(|e| JourneyError::Encoding(e.to_string()))?;
    Ok(sha256::digest(&cbor))
}

#[derive(Clone)]
pub struct AuditLedger {
    tree: sled::Tree,
    clock: Arc<dyn Clock>,
}

impl AuditLedger {
    pub fn new(db: &sled::Db, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(AUDIT_TREE)?,
            clock,
        })
    }

    /// Append a record, flushing before returning so the caller never
    /// acknowledges a state change whose audit entry could still be lost.
    pub fn append(
        &self,
        action: AuditAction,
        user_id: &str,
        document_id: Option<&str>,
        data: BTreeMap<String, String>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<AuditRecord> {
        let record = AuditRecord {
            id: uuid7::uuid7().to_string(),
            user_id: user_id.to_string(),
            document_id: document_id.map(str::to_string),
            action,
            data_hash: data_digest(&data)?,
            data,
            ip: ip.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            timestamp: self.clock.now(),
        };

        let cbor = minicbor::to_vec(&record).map_err(|e| JourneyError::Encoding(e.to_string()))?;
        self.tree.insert(record.id.as_bytes(), cbor)?;
        self.tree.flush()?;

        Ok(record)
    }

    pub fn record(&self, record_id: &str) -> Result<AuditRecord> {
        let bytes = self
            .tree
            .get(record_id.as_bytes())?
            .ok_or_else(|| JourneyError::not_found("audit record", record_id))?;

        minicbor::decode(&bytes).map_err(|e| JourneyError::Encoding(e.to_string()))
    }

    /// Recompute the data hash of a stored record and compare it to the
    /// hash stamped at append time.
    pub fn verify(&self, record_id: &str) -> Result<AuditVerification> {
        let record = self.record(record_id)?;
        let recomputed = data_digest(&record.data)?;
        let is_valid = recomputed == record.data_hash;

        if !is_valid {
            tracing::error!(
                record_id,
                stored = %record.data_hash,
                recomputed = %recomputed,
                "audit record failed hash verification"
            );
        }

        Ok(AuditVerification {
            is_valid,
            stored_hash: record.data_hash,
            recomputed_hash: recomputed,
        })
    }

    /// Filtered scan, newest first. uuid7 keys are time-ordered, so a
    /// reverse key scan is reverse-chronological.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let mut out = Vec::new();
        for entry in self.tree.iter().rev() {
            let (_, bytes) = entry?;
            let record: AuditRecord =
                minicbor::decode(&bytes).map_err(|e| JourneyError::Encoding(e.to_string()))?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}
