//! Registration orchestration over the fixed eight-step onboarding sequence.
//!
//! The orchestrator owns the coarse-grained `RegistrationState`, verifies
//! legal-agreement signatures before accepting them, and requests reward
//! issuance on completion. Every operation follows the same ordering:
//! validate, mutate state (CAS + flush), append the audit record, return.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;

use crate::audit::{AuditAction, AuditLedger};
use crate::error::{JourneyError, Result};
use crate::gates::DocumentFacts;
use crate::signature::{SignatureRecord, SignatureVerifier};
use crate::time::{Clock, TimeStamp};

const REGISTRATION_TREE: &str = "registration_state";
const SIGNATURE_TREE: &str = "signature_records";
const SIGNED_DOCS_TREE: &str = "signed_documents";

/// The fixed onboarding sequence, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RegistrationStep {
    #[n(0)]
    AccountCreation,
    #[n(1)]
    PasswordSetup,
    #[n(2)]
    ProfileCompletion,
    #[n(3)]
    LegalAgreements,
    #[n(4)]
    SubscriptionSelection,
    #[n(5)]
    OrientationBooking,
    #[n(6)]
    TokenSetup,
    #[n(7)]
    Completion,
}

impl RegistrationStep {
    pub const ALL: [RegistrationStep; 8] = [
        RegistrationStep::AccountCreation,
        RegistrationStep::PasswordSetup,
        RegistrationStep::ProfileCompletion,
        RegistrationStep::LegalAgreements,
        RegistrationStep::SubscriptionSelection,
        RegistrationStep::OrientationBooking,
        RegistrationStep::TokenSetup,
        RegistrationStep::Completion,
    ];

    /// Required steps gate `is_complete`; the trailing three do not.
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            RegistrationStep::AccountCreation
                | RegistrationStep::PasswordSetup
                | RegistrationStep::ProfileCompletion
                | RegistrationStep::LegalAgreements
                | RegistrationStep::SubscriptionSelection
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStep::AccountCreation => "account_creation",
            RegistrationStep::PasswordSetup => "password_setup",
            RegistrationStep::ProfileCompletion => "profile_completion",
            RegistrationStep::LegalAgreements => "legal_agreements",
            RegistrationStep::SubscriptionSelection => "subscription_selection",
            RegistrationStep::OrientationBooking => "orientation_booking",
            RegistrationStep::TokenSetup => "token_setup",
            RegistrationStep::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum StepStatus {
    #[n(0)]
    NotStarted,
    #[n(1)]
    InProgress,
    #[n(2)]
    Completed,
    #[n(3)]
    Failed,
    #[n(4)]
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StepProgress {
    #[n(0)]
    pub step: RegistrationStep,
    #[n(1)]
    pub status: StepStatus,
    #[n(2)]
    pub started_at: Option<TimeStamp<Utc>>,
    #[n(3)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub retry_count: u32,
    #[n(5)]
    pub error_message: Option<String>,
    #[n(6)]
    pub data: BTreeMap<String, String>,
}

impl StepProgress {
    fn fresh(step: RegistrationStep) -> Self {
        Self {
            step,
            status: StepStatus::NotStarted,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
            data: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RegistrationState {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub email: String,
    #[n(2)]
    pub current_step: RegistrationStep,
    #[n(3)]
    pub steps: Vec<StepProgress>,
    #[n(4)]
    pub is_complete: bool,
    #[n(5)]
    pub total_retries: u32,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub updated_at: TimeStamp<Utc>,
}

impl RegistrationState {
    fn new(user_id: &str, email: &str, now: TimeStamp<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            current_step: RegistrationStep::AccountCreation,
            steps: RegistrationStep::ALL.iter().copied().map(StepProgress::fresh).collect(),
            is_complete: false,
            total_retries: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn step(&self, step: RegistrationStep) -> &StepProgress {
        // ALL and steps are built from the same array, the entry exists
        self.steps
            .iter()
            .find(|p| p.step == step)
            .unwrap_or_else(|| unreachable!("step table is fixed at construction"))
    }

    fn step_mut(&mut self, step: RegistrationStep) -> &mut StepProgress {
        self.steps
            .iter_mut()
            .find(|p| p.step == step)
            .unwrap_or_else(|| unreachable!("step table is fixed at construction"))
    }

    /// Recompute the derived fields after any step mutation. `is_complete`
    /// holds iff every required step is completed, so finishing optional
    /// trailing steps can never flip it back to false.
    fn recompute(&mut self, now: TimeStamp<Utc>) {
        self.is_complete = self
            .steps
            .iter()
            .filter(|p| p.step.is_required())
            .all(|p| p.status == StepStatus::Completed);

        self.current_step = self
            .steps
            .iter()
            .find(|p| p.status != StepStatus::Completed && p.status != StepStatus::Skipped)
            .map(|p| p.step)
            .unwrap_or(RegistrationStep::Completion);

        self.updated_at = now;
    }
}

/// Outcome of a reward-issuance request.
#[derive(Debug, Clone)]
pub struct RewardGrant {
    pub success: bool,
    pub transaction_id: String,
}

/// External token-ledger collaborator. Best-effort: the orchestrator logs
/// and audits a failure but never rolls back onboarding completion over it.
pub trait RewardIssuer: Send + Sync {
    fn award_tokens(&self, user_id: &str, amount: u64, reason: &str) -> Result<RewardGrant>;
}

/// Lookup of verified signed documents, backed by its own tree so gate
/// evaluation sees a signature the moment it is accepted.
#[derive(Clone)]
pub struct SignedDocumentRegistry {
    tree: sled::Tree,
}

impl SignedDocumentRegistry {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(SIGNED_DOCS_TREE)?,
        })
    }

    fn key(user_id: &str, doc: crate::stage::DocType) -> Vec<u8> {
        let mut key = Vec::with_capacity(user_id.len() + 32);
        key.extend_from_slice(user_id.as_bytes());
        key.push(0);
        key.extend_from_slice(doc.as_str().as_bytes());
        key
    }

    fn register(&self, user_id: &str, doc: crate::stage::DocType, record_key: &str) -> Result<()> {
        self.tree.insert(Self::key(user_id, doc), record_key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

impl DocumentFacts for SignedDocumentRegistry {
    fn signed_documents(&self, user_id: &str) -> Result<BTreeSet<crate::stage::DocType>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0);

        let mut docs = BTreeSet::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let doc_str = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| JourneyError::Encoding(e.to_string()))?;
            docs.insert(doc_str.parse()?);
        }
        Ok(docs)
    }
}

pub struct RegistrationOrchestrator {
    tree: sled::Tree,
    signatures: sled::Tree,
    signed_docs: SignedDocumentRegistry,
    verifier: SignatureVerifier,
    ledger: AuditLedger,
    rewards: Arc<dyn RewardIssuer>,
    clock: Arc<dyn Clock>,
    /// Externally configured completion reward, never computed here.
    reward_amount: u64,
}

fn decode_registration(bytes: &[u8]) -> Result<RegistrationState> {
    minicbor::decode(bytes).map_err(|e| JourneyError::Encoding(e.to_string()))
}

impl RegistrationOrchestrator {
    pub fn new(
        db: &sled::Db,
        verifier: SignatureVerifier,
        ledger: AuditLedger,
        rewards: Arc<dyn RewardIssuer>,
        clock: Arc<dyn Clock>,
        reward_amount: u64,
    ) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(REGISTRATION_TREE)?,
            signatures: db.open_tree(SIGNATURE_TREE)?,
            signed_docs: SignedDocumentRegistry::new(db)?,
            verifier,
            ledger,
            rewards,
            clock,
            reward_amount,
        })
    }

    /// The registry doubles as the `DocumentFacts` provider for gates.
    pub fn signed_documents(&self) -> SignedDocumentRegistry {
        self.signed_docs.clone()
    }

    /// Initialize a registration with all eight steps `NotStarted`.
    pub fn create_state(&self, user_id: &str, email: &str) -> Result<RegistrationState> {
        if user_id.is_empty() {
            return Err(JourneyError::Validation("user_id is empty".into()));
        }
        if !email.contains('@') {
            return Err(JourneyError::Validation(format!("malformed email: {email}")));
        }

        let state = RegistrationState::new(user_id, email, self.clock.now());
        let encoded =
            minicbor::to_vec(&state).map_err(|e| JourneyError::Encoding(e.to_string()))?;

        // create-only swap: fails if a state already exists
        let swapped = self
            .tree
            .compare_and_swap(user_id.as_bytes(), None::<&[u8]>, Some(encoded))?;
        if swapped.is_err() {
            return Err(JourneyError::Conflict(format!(
                "registration state already exists for {user_id}"
            )));
        }
        self.tree.flush()?;

        tracing::info!(user_id, email, "registration state created");
        Ok(state)
    }

    pub fn state(&self, user_id: &str) -> Result<RegistrationState> {
        let bytes = self
            .tree
            .get(user_id.as_bytes())?
            .ok_or_else(|| JourneyError::not_found("registration state", user_id))?;
        decode_registration(&bytes)
    }

    /// Serialized read-modify-write on one user's registration state.
    fn update_state<F>(&self, user_id: &str, apply: F) -> Result<RegistrationState>
    where
        F: Fn(RegistrationState) -> Result<RegistrationState>,
    {
        loop {
            let old = self
                .tree
                .get(user_id.as_bytes())?
                .ok_or_else(|| JourneyError::not_found("registration state", user_id))?;
            let next = apply(decode_registration(&old)?)?;

            let encoded =
                minicbor::to_vec(&next).map_err(|e| JourneyError::Encoding(e.to_string()))?;
            match self
                .tree
                .compare_and_swap(user_id.as_bytes(), Some(old), Some(encoded))?
            {
                Ok(()) => {
                    self.tree.flush()?;
                    return Ok(next);
                }
                Err(_) => continue,
            }
        }
    }

    /// Mutate one step's progress and recompute the derived state fields.
    ///
    /// `Failed` increments the step's retry count and the state's total;
    /// timestamps are stamped once and never erased by later transitions.
    pub fn update_step_progress(
        &self,
        user_id: &str,
        step: RegistrationStep,
        status: StepStatus,
        data: Option<BTreeMap<String, String>>,
        error_message: Option<String>,
    ) -> Result<RegistrationState> {
        let now = self.clock.now();
        let state = self.update_state(user_id, |mut state| {
            let progress = state.step_mut(step);

            match status {
                StepStatus::InProgress => {
                    if progress.started_at.is_none() {
                        progress.started_at = Some(now.clone());
                    }
                }
                StepStatus::Completed => {
                    if progress.completed_at.is_none() {
                        progress.completed_at = Some(now.clone());
                    }
                    progress.error_message = None;
                }
                StepStatus::Failed => {
                    progress.retry_count += 1;
                    progress.error_message = error_message.clone();
                    state.total_retries += 1;
                }
                StepStatus::NotStarted | StepStatus::Skipped => {}
            }
            let progress = state.step_mut(step);
            progress.status = status;
            if let Some(data) = &data {
                progress.data.extend(data.clone());
            }

            state.recompute(now.clone());
            Ok(state)
        })?;

        tracing::info!(user_id, step = step.as_str(), "step progress updated");
        self.ledger.append(
            AuditAction::StepProgressUpdated,
            user_id,
            None,
            BTreeMap::from([
                ("step".to_string(), step.as_str().to_string()),
                ("status".to_string(), status.as_str().to_string()),
            ]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Put a failed step back in progress, keeping its retry history.
    pub fn retry_step(&self, user_id: &str, step: RegistrationStep) -> Result<RegistrationState> {
        let now = self.clock.now();
        let state = self.update_state(user_id, |mut state| {
            let progress = state.step_mut(step);
            match progress.status {
                StepStatus::Completed => {
                    return Err(JourneyError::Conflict(format!(
                        "step {} already completed",
                        step.as_str()
                    )));
                }
                StepStatus::Failed | StepStatus::NotStarted | StepStatus::Skipped
                | StepStatus::InProgress => {
                    progress.status = StepStatus::InProgress;
                    progress.error_message = None;
                    if progress.started_at.is_none() {
                        progress.started_at = Some(now.clone());
                    }
                }
            }
            state.recompute(now.clone());
            Ok(state)
        })?;

        self.ledger.append(
            AuditAction::StepRetried,
            user_id,
            None,
            BTreeMap::from([("step".to_string(), step.as_str().to_string())]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Accept a legal-agreement signature.
    ///
    /// The supplied record is verified before anything is persisted; a
    /// mismatching hash is rejected as `Integrity` with a `SignatureRejected`
    /// audit entry, since it indicates tampering or a corrupted capture.
    pub fn handle_legal_agreement_signing(
        &self,
        user_id: &str,
        agreement: crate::stage::DocType,
        record: SignatureRecord,
    ) -> Result<RegistrationState> {
        if record.document_id.is_empty() || record.content_hash.is_empty() {
            return Err(JourneyError::Validation(
                "signature record is missing required fields".into(),
            ));
        }
        // unknown users must be rejected before anything is persisted
        self.state(user_id)?;
        if record.signer_id != user_id {
            return Err(JourneyError::Unauthorized(format!(
                "signer {} does not match user {user_id}",
                record.signer_id
            )));
        }

        if !self.verifier.verify(&record)? {
            tracing::error!(
                user_id,
                document_id = %record.document_id,
                "signature hash mismatch, rejecting agreement"
            );
            self.ledger.append(
                AuditAction::SignatureRejected,
                user_id,
                Some(&record.document_id),
                BTreeMap::from([("agreement".to_string(), agreement.as_str().to_string())]),
                Some(&record.ip),
                Some(&record.user_agent),
            )?;
            return Err(JourneyError::Integrity(format!(
                "signature hash mismatch for document {}",
                record.document_id
            )));
        }

        // re-signing appends a fresh record under a new key
        let record_key = format!("{user_id}/{}/{}", record.document_id, uuid7::uuid7());
        let encoded =
            minicbor::to_vec(&record).map_err(|e| JourneyError::Encoding(e.to_string()))?;
        self.signatures.insert(record_key.as_bytes(), encoded)?;
        self.signatures.flush()?;
        self.signed_docs.register(user_id, agreement, &record_key)?;

        self.ledger.append(
            AuditAction::LegalAgreementSigned,
            user_id,
            Some(&record.document_id),
            BTreeMap::from([
                ("agreement".to_string(), agreement.as_str().to_string()),
                ("signature_hash".to_string(), record.signature_hash.clone()),
            ]),
            Some(&record.ip),
            Some(&record.user_agent),
        )?;

        tracing::info!(user_id, agreement = agreement.as_str(), "legal agreement signed");
        self.update_step_progress(
            user_id,
            RegistrationStep::LegalAgreements,
            StepStatus::Completed,
            Some(BTreeMap::from([(
                "document_id".to_string(),
                record.document_id.clone(),
            )])),
            None,
        )
    }

    pub fn signature_record(&self, record_key: &str) -> Result<SignatureRecord> {
        let bytes = self
            .signatures
            .get(record_key.as_bytes())?
            .ok_or_else(|| JourneyError::not_found("signature record", record_key))?;
        minicbor::decode(&bytes).map_err(|e| JourneyError::Encoding(e.to_string()))
    }

    /// Complete the subscription-selection step with the chosen plan.
    pub fn select_subscription(&self, user_id: &str, plan: &str) -> Result<RegistrationState> {
        if plan.is_empty() {
            return Err(JourneyError::Validation("subscription plan is empty".into()));
        }

        let state = self.update_step_progress(
            user_id,
            RegistrationStep::SubscriptionSelection,
            StepStatus::Completed,
            Some(BTreeMap::from([("plan".to_string(), plan.to_string())])),
            None,
        )?;

        self.ledger.append(
            AuditAction::SubscriptionSelected,
            user_id,
            None,
            BTreeMap::from([("plan".to_string(), plan.to_string())]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Finish onboarding: force-complete the trailing non-gating steps, then
    /// request the completion reward. Reward issuance is best-effort; a
    /// failure is logged and audited but completion stands.
    pub fn complete_onboarding(&self, user_id: &str) -> Result<RegistrationState> {
        let current = self.state(user_id)?;
        if !current.is_complete {
            return Err(JourneyError::Conflict(
                "required registration steps are not all completed".into(),
            ));
        }

        let now = self.clock.now();
        let state = self.update_state(user_id, |mut state| {
            for step in [
                RegistrationStep::OrientationBooking,
                RegistrationStep::TokenSetup,
                RegistrationStep::Completion,
            ] {
                let progress = state.step_mut(step);
                if progress.status != StepStatus::Completed {
                    progress.status = StepStatus::Completed;
                    progress.completed_at = Some(now.clone());
                }
            }
            state.recompute(now.clone());
            Ok(state)
        })?;

        self.ledger.append(
            AuditAction::OnboardingCompleted,
            user_id,
            None,
            BTreeMap::new(),
            None,
            None,
        )?;
        tracing::info!(user_id, "onboarding completed");

        match self
            .rewards
            .award_tokens(user_id, self.reward_amount, "onboarding completion")
        {
            Ok(grant) if grant.success => {
                tracing::info!(user_id, transaction_id = %grant.transaction_id, "completion reward issued");
            }
            Ok(grant) => {
                tracing::warn!(user_id, transaction_id = %grant.transaction_id, "reward issuer declined grant");
                self.audit_reward_failure(user_id, "issuer declined")?;
            }
            Err(err) => {
                tracing::warn!(user_id, error = %err, "reward issuance failed");
                self.audit_reward_failure(user_id, &err.to_string())?;
            }
        }

        Ok(state)
    }

    fn audit_reward_failure(&self, user_id: &str, detail: &str) -> Result<()> {
        self.ledger.append(
            AuditAction::RewardIssueFailed,
            user_id,
            None,
            BTreeMap::from([("detail".to_string(), detail.to_string())]),
            None,
            None,
        )?;
        Ok(())
    }
}
