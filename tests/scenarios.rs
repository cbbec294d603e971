//! End-to-end scenarios for the onboarding journey engine.
//!
//! Each test opens its own sled database on temp storage. Sled uses
//! file-based locking to prevent concurrent access, so separate databases
//! per test keep the suite independent and simplify cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tempfile::tempdir;

use onboarding_journey::audit::{AuditAction, AuditFilter, AuditLedger, AuditRecord};
use onboarding_journey::error::JourneyError;
use onboarding_journey::gates::{GateEvaluator, RbacFacts};
use onboarding_journey::journey::{JourneyStateMachine, StageStatus};
use onboarding_journey::registration::{
    RegistrationOrchestrator, RegistrationStep, RewardGrant, RewardIssuer, StepStatus,
};
use onboarding_journey::signature::{SignRequest, SignatureRecord, SignatureVerifier};
use onboarding_journey::stage::{DocType, GateRequirement, Stage, StageGraph};
use onboarding_journey::time::{Clock, SystemClock, TimeStamp};
use onboarding_journey::utils;

const SECRET: &[u8] = b"onboarding signing secret";

struct StaticRbac(u8);
impl RbacFacts for StaticRbac {
    fn rbac_level(&self, _: &str) -> onboarding_journey::error::Result<u8> {
        Ok(self.0)
    }
}

struct GrantingIssuer;
impl RewardIssuer for GrantingIssuer {
    fn award_tokens(
        &self,
        _: &str,
        _: u64,
        _: &str,
    ) -> onboarding_journey::error::Result<RewardGrant> {
        Ok(RewardGrant {
            success: true,
            transaction_id: "txn_ok".into(),
        })
    }
}

struct FailingIssuer;
impl RewardIssuer for FailingIssuer {
    fn award_tokens(
        &self,
        _: &str,
        _: u64,
        _: &str,
    ) -> onboarding_journey::error::Result<RewardGrant> {
        Err(JourneyError::Storage(sled::Error::ReportableBug(
            "ledger offline".into(),
        )))
    }
}

fn onboarding_graph() -> Arc<StageGraph> {
    Arc::new(
        StageGraph::new(vec![
            Stage {
                id: "profile".into(),
                name: "Profile".into(),
                order: 10,
                is_active: true,
                gates: vec![],
            },
            Stage {
                id: "compliance".into(),
                name: "Compliance".into(),
                order: 20,
                is_active: true,
                gates: vec![
                    GateRequirement::LegalDocument {
                        required_docs: vec![DocType::Nda],
                    },
                    GateRequirement::PreviousStage {
                        stage_id: "profile".into(),
                    },
                ],
            },
            Stage {
                id: "activation".into(),
                name: "Activation".into(),
                order: 30,
                is_active: true,
                gates: vec![GateRequirement::RbacLevel { min_level: 1 }],
            },
        ])
        .unwrap(),
    )
}

struct Harness {
    _dir: tempfile::TempDir,
    db: sled::Db,
    machine: Arc<JourneyStateMachine>,
    orchestrator: Arc<RegistrationOrchestrator>,
    ledger: AuditLedger,
    graph: Arc<StageGraph>,
}

fn harness_with(rewards: Arc<dyn RewardIssuer>, name: &str) -> Harness {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path().join(name)).unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let graph = onboarding_graph();
    let ledger = AuditLedger::new(&db, clock.clone()).unwrap();
    let machine = Arc::new(
        JourneyStateMachine::new(&db, graph.clone(), ledger.clone(), clock.clone()).unwrap(),
    );
    let orchestrator = Arc::new(
        RegistrationOrchestrator::new(
            &db,
            SignatureVerifier::new(SECRET),
            ledger.clone(),
            rewards,
            clock,
            500,
        )
        .unwrap(),
    );

    Harness {
        _dir: dir,
        db,
        machine,
        orchestrator,
        ledger,
        graph,
    }
}

fn harness(name: &str) -> Harness {
    harness_with(Arc::new(GrantingIssuer), name)
}

fn signed_nda(user_id: &str) -> SignatureRecord {
    SignatureVerifier::new(SECRET)
        .sign(SignRequest {
            signer_id: user_id.to_string(),
            document_id: "nda-2025".into(),
            document_version: "1".into(),
            content: "Mutual non-disclosure agreement, revision 2025.".into(),
            signed_at: TimeStamp::now(),
            ip: "198.51.100.4".into(),
            user_agent: "scenario-suite/1.0".into(),
        })
        .unwrap()
}

fn complete_required_steps(h: &Harness, user: &str) {
    for step in [
        RegistrationStep::AccountCreation,
        RegistrationStep::PasswordSetup,
        RegistrationStep::ProfileCompletion,
    ] {
        h.orchestrator
            .update_step_progress(user, step, StepStatus::Completed, None, None)
            .unwrap();
    }
    h.orchestrator
        .handle_legal_agreement_signing(user, DocType::Nda, signed_nda(user))
        .unwrap();
    h.orchestrator.select_subscription(user, "standard").unwrap();
}

// Scenario A: a fresh registration has all eight steps untouched.
#[test]
fn create_state_initializes_all_steps() -> anyhow::Result<()> {
    let h = harness("scenario_a.db");
    let user = utils::new_uuid_to_bech32("user_")?;

    let state = h.orchestrator.create_state(&user, "u1@x.com")?;

    assert_eq!(state.steps.len(), 8);
    assert!(state.steps.iter().all(|s| s.status == StepStatus::NotStarted));
    assert_eq!(state.current_step, RegistrationStep::AccountCreation);
    assert!(!state.is_complete);

    // creating the same user twice conflicts
    assert!(matches!(
        h.orchestrator.create_state(&user, "u1@x.com"),
        Err(JourneyError::Conflict(_))
    ));

    Ok(())
}

// Scenario B: completing the five required steps flips is_complete,
// regardless of the remaining three; optional steps never flip it back.
#[test]
fn is_complete_depends_only_on_required_steps() -> anyhow::Result<()> {
    let h = harness("scenario_b.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    complete_required_steps(&h, &user);

    let state = h.orchestrator.state(&user)?;
    assert!(state.is_complete);
    assert_eq!(
        state.step(RegistrationStep::OrientationBooking).status,
        StepStatus::NotStarted
    );

    // completing an optional step afterwards keeps it true
    let state = h.orchestrator.update_step_progress(
        &user,
        RegistrationStep::OrientationBooking,
        StepStatus::Completed,
        None,
        None,
    )?;
    assert!(state.is_complete);

    Ok(())
}

// Scenario C: two failures on one step accumulate on both counters.
#[test]
fn failures_accumulate_retry_counts() -> anyhow::Result<()> {
    let h = harness("scenario_c.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    for _ in 0..2 {
        h.orchestrator.update_step_progress(
            &user,
            RegistrationStep::LegalAgreements,
            StepStatus::Failed,
            None,
            Some("bad signature".into()),
        )?;
    }

    let state = h.orchestrator.state(&user)?;
    let step = state.step(RegistrationStep::LegalAgreements);
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.error_message.as_deref(), Some("bad signature"));
    assert_eq!(state.total_retries, 2);

    // retry clears the error and re-enters the step
    let state = h.orchestrator.retry_step(&user, RegistrationStep::LegalAgreements)?;
    let step = state.step(RegistrationStep::LegalAgreements);
    assert_eq!(step.status, StepStatus::InProgress);
    assert!(step.error_message.is_none());
    assert_eq!(step.retry_count, 2);

    Ok(())
}

// Scenario D: the NDA gate fails until a verified signature lands, then
// passes without touching the state machine.
#[test]
fn legal_document_gate_follows_signature_acceptance() -> anyhow::Result<()> {
    let h = harness("scenario_d.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    let evaluator = GateEvaluator::new(
        h.graph.clone(),
        Arc::new(h.orchestrator.signed_documents()),
        Arc::new(StaticRbac(2)),
        h.machine.clone(),
    );

    h.machine.start(&user, "profile")?;
    h.machine.complete(&user, "profile", BTreeMap::new())?;

    let check = evaluator.evaluate(&user, "compliance")?;
    assert!(!check.all_passed);
    assert_eq!(check.results[0].missing, vec!["nda".to_string()]);

    h.orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, signed_nda(&user))?;

    let check = evaluator.evaluate(&user, "compliance")?;
    assert!(check.all_passed, "{check:?}");

    Ok(())
}

// Scenario E: mutating a stored signature record makes verification fail.
#[test]
fn tampered_stored_signature_fails_verification() -> anyhow::Result<()> {
    let h = harness("scenario_e.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;
    h.orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, signed_nda(&user))?;

    // reach into storage and rewrite the content hash
    let tree = h.db.open_tree("signature_records")?;
    let (key, bytes) = tree.iter().next().expect("one signature stored")?;
    let mut record: SignatureRecord = minicbor::decode(&bytes)?;
    record.content_hash = sha256::digest("quietly replaced after signing");
    tree.insert(&key, minicbor::to_vec(&record)?)?;

    let reloaded = h.orchestrator.signature_record(std::str::from_utf8(&key)?)?;
    let verifier = SignatureVerifier::new(SECRET);
    assert!(!verifier.verify(&reloaded)?);

    // lookup of a never-issued record key
    assert!(matches!(
        h.orchestrator.signature_record("user/doc/missing"),
        Err(JourneyError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn rejected_signature_leaves_step_untouched_and_audits() -> anyhow::Result<()> {
    let h = harness("rejected_signature.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    let mut record = signed_nda(&user);
    record.content_hash = sha256::digest("tampered before submission");

    let err = h
        .orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, record)
        .unwrap_err();
    assert!(matches!(err, JourneyError::Integrity(_)));

    let state = h.orchestrator.state(&user)?;
    assert_eq!(
        state.step(RegistrationStep::LegalAgreements).status,
        StepStatus::NotStarted
    );

    let rejections = h.ledger.query(&AuditFilter {
        user_id: Some(user.clone()),
        action: Some(AuditAction::SignatureRejected),
        ..Default::default()
    })?;
    assert_eq!(rejections.len(), 1);

    Ok(())
}

#[test]
fn signing_without_registration_state_leaves_no_trace() -> anyhow::Result<()> {
    use onboarding_journey::gates::DocumentFacts;

    let h = harness("unknown_signer.db");
    let user = utils::new_uuid_to_bech32("user_")?;

    // no create_state: the user is unknown to the orchestrator
    let err = h
        .orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, signed_nda(&user))
        .unwrap_err();
    assert!(matches!(err, JourneyError::NotFound { .. }));

    // nothing was persisted: no signed document, no signature record, no audit
    let registry = h.orchestrator.signed_documents();
    assert_eq!(registry.signed_documents(&user)?, BTreeSet::new());
    assert!(h.db.open_tree("signature_records")?.is_empty());
    let records = h.ledger.query(&AuditFilter {
        user_id: Some(user),
        ..Default::default()
    })?;
    assert!(records.is_empty());

    Ok(())
}

#[test]
fn step_audit_snapshot_uses_snake_case_status() -> anyhow::Result<()> {
    let h = harness("step_audit_status.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    h.orchestrator.update_step_progress(
        &user,
        RegistrationStep::AccountCreation,
        StepStatus::Completed,
        None,
        None,
    )?;

    let records = h.ledger.query(&AuditFilter {
        user_id: Some(user),
        action: Some(AuditAction::StepProgressUpdated),
        ..Default::default()
    })?;
    assert_eq!(
        records[0].data.get("status").map(String::as_str),
        Some("completed")
    );
    assert_eq!(
        records[0].data.get("step").map(String::as_str),
        Some("account_creation")
    );

    Ok(())
}

#[test]
fn signer_mismatch_is_unauthorized() -> anyhow::Result<()> {
    let h = harness("signer_mismatch.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    let other = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    let err = h
        .orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, signed_nda(&other))
        .unwrap_err();
    assert!(matches!(err, JourneyError::Unauthorized(_)));

    Ok(())
}

#[test]
fn journey_progress_tracks_stage_flow() -> anyhow::Result<()> {
    let h = harness("journey_progress.db");
    let user = utils::new_uuid_to_bech32("user_")?;

    let progress = h.machine.progress(&user)?;
    assert_eq!(progress.total_count, 3);
    assert_eq!(progress.completed_count, 0);
    assert_eq!(progress.current_stage.as_deref(), Some("profile"));
    assert_eq!(progress.next_stage.as_deref(), Some("compliance"));

    let started = h.machine.start(&user, "profile")?;
    let first_started_at = started.started_at.clone().expect("stamped on start");

    // restart is idempotent and keeps the original start time
    let restarted = h.machine.start(&user, "profile")?;
    assert_eq!(restarted.started_at, Some(first_started_at));

    h.machine.complete(&user, "profile", BTreeMap::new())?;
    // completing twice is a no-op success
    let again = h.machine.complete(&user, "profile", BTreeMap::new())?;
    assert_eq!(again.status, StageStatus::Completed);

    h.machine.block(&user, "activation", "compliance freeze")?;

    let progress = h.machine.progress(&user)?;
    assert_eq!(progress.completed_count, 1);
    assert_eq!(progress.current_stage.as_deref(), Some("compliance"));
    assert!((progress.percentage - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(progress.blocked_reasons, vec!["compliance freeze".to_string()]);

    // completing a never-started stage is rejected without mutation
    assert!(matches!(
        h.machine.complete(&user, "compliance", BTreeMap::new()),
        Err(JourneyError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn completion_awards_reward_and_survives_reward_failure() -> anyhow::Result<()> {
    // failing issuer first: completion must stand anyway
    let h = harness_with(Arc::new(FailingIssuer), "completion_failing.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    // completing early conflicts
    assert!(matches!(
        h.orchestrator.complete_onboarding(&user),
        Err(JourneyError::Conflict(_))
    ));

    complete_required_steps(&h, &user);
    let state = h.orchestrator.complete_onboarding(&user)?;

    assert!(state.is_complete);
    assert!(state
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));

    let failures = h.ledger.query(&AuditFilter {
        user_id: Some(user.clone()),
        action: Some(AuditAction::RewardIssueFailed),
        ..Default::default()
    })?;
    assert_eq!(failures.len(), 1);

    let completed = h.ledger.query(&AuditFilter {
        user_id: Some(user),
        action: Some(AuditAction::OnboardingCompleted),
        ..Default::default()
    })?;
    assert_eq!(completed.len(), 1);

    Ok(())
}

#[test]
fn audit_trail_covers_transitions_and_tampering_is_detected() -> anyhow::Result<()> {
    let h = harness("audit_trail.db");
    let user = utils::new_uuid_to_bech32("user_")?;

    h.machine.start(&user, "profile")?;
    h.machine.complete(&user, "profile", BTreeMap::new())?;

    let records = h.ledger.query(&AuditFilter {
        user_id: Some(user.clone()),
        ..Default::default()
    })?;
    assert_eq!(records.len(), 2);
    // newest first
    assert_eq!(records[0].action, AuditAction::StageCompleted);
    assert_eq!(records[1].action, AuditAction::StageStarted);

    for record in &records {
        assert!(h.ledger.verify(&record.id)?.is_valid);
    }

    // rewrite a stored snapshot; verification must notice
    let tree = h.db.open_tree("audit_records")?;
    let target = &records[1];
    let bytes = tree.get(target.id.as_bytes())?.unwrap();
    let mut stored: AuditRecord = minicbor::decode(&bytes)?;
    stored
        .data
        .insert("stage_id".to_string(), "somewhere_else".to_string());
    tree.insert(target.id.as_bytes(), minicbor::to_vec(&stored)?)?;

    let verification = h.ledger.verify(&target.id)?;
    assert!(!verification.is_valid);
    assert_ne!(verification.stored_hash, verification.recomputed_hash);

    Ok(())
}

#[test]
fn audit_date_range_filter_bounds_results() -> anyhow::Result<()> {
    let h = harness("audit_range.db");
    let user = utils::new_uuid_to_bech32("user_")?;

    h.machine.start(&user, "profile")?;
    let cutoff: TimeStamp<Utc> = Utc::now().into();
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.machine.complete(&user, "profile", BTreeMap::new())?;

    let newer = h.ledger.query(&AuditFilter {
        user_id: Some(user.clone()),
        from: Some(cutoff.clone()),
        ..Default::default()
    })?;
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].action, AuditAction::StageCompleted);

    let older = h.ledger.query(&AuditFilter {
        user_id: Some(user),
        to: Some(cutoff),
        ..Default::default()
    })?;
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].action, AuditAction::StageStarted);

    Ok(())
}

// Concurrent duplicate submissions must not lose updates: the CAS loop
// serializes read-modify-write per user.
#[test]
fn concurrent_failures_never_lose_retry_counts() -> anyhow::Result<()> {
    let h = harness("concurrent_failures.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let user = user.clone();
            std::thread::spawn(move || {
                orchestrator
                    .update_step_progress(
                        &user,
                        RegistrationStep::PasswordSetup,
                        StepStatus::Failed,
                        None,
                        Some("weak password".into()),
                    )
                    .unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let state = h.orchestrator.state(&user)?;
    assert_eq!(state.total_retries, 8);
    assert_eq!(state.step(RegistrationStep::PasswordSetup).retry_count, 8);

    Ok(())
}

#[test]
fn signed_documents_registry_feeds_gate_facts() -> anyhow::Result<()> {
    use onboarding_journey::gates::DocumentFacts;

    let h = harness("registry_facts.db");
    let user = utils::new_uuid_to_bech32("user_")?;
    h.orchestrator.create_state(&user, "u1@x.com")?;

    let registry = h.orchestrator.signed_documents();
    assert_eq!(registry.signed_documents(&user)?, BTreeSet::new());

    h.orchestrator
        .handle_legal_agreement_signing(&user, DocType::Nda, signed_nda(&user))?;

    assert_eq!(
        registry.signed_documents(&user)?,
        BTreeSet::from([DocType::Nda])
    );

    Ok(())
}
