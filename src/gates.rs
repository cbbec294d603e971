//! Gate evaluation against a user's current facts.
//!
//! Evaluation is purely advisory: the journey state machine never consults
//! it inside a mutation. Callers (the orchestrator or an outer API layer)
//! run `evaluate` before permitting a transition, which lets gate policy
//! evolve independently of persistence and retry semantics.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::journey::StageStatus;
use crate::stage::{DocType, GateRequirement, StageGraph};

/// Read-only provider of a user's verified document signatures.
pub trait DocumentFacts: Send + Sync {
    fn signed_documents(&self, user_id: &str) -> Result<BTreeSet<DocType>>;
}

/// Read-only provider of a user's RBAC level.
pub trait RbacFacts: Send + Sync {
    fn rbac_level(&self, user_id: &str) -> Result<u8>;
}

/// Read-only view of per-stage journey status, implemented by the state
/// machine. `None` means the user never touched the stage.
pub trait StageStatusFacts: Send + Sync {
    fn stage_status(&self, user_id: &str, stage_id: &str) -> Result<Option<StageStatus>>;
}

/// Outcome of a single gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub gate_id: String,
    pub passed: bool,
    pub missing: Vec<String>,
}

/// Outcome of evaluating every gate on a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCheckResult {
    pub all_passed: bool,
    pub results: Vec<GateOutcome>,
}

pub struct GateEvaluator {
    graph: Arc<StageGraph>,
    documents: Arc<dyn DocumentFacts>,
    rbac: Arc<dyn RbacFacts>,
    stages: Arc<dyn StageStatusFacts>,
}

impl GateEvaluator {
    pub fn new(
        graph: Arc<StageGraph>,
        documents: Arc<dyn DocumentFacts>,
        rbac: Arc<dyn RbacFacts>,
        stages: Arc<dyn StageStatusFacts>,
    ) -> Self {
        Self {
            graph,
            documents,
            rbac,
            stages,
        }
    }

    /// Evaluate every gate on `stage_id` for `user_id`.
    ///
    /// All gates run even after a failure so the caller gets a complete
    /// diagnostic, not just the first missing requirement. A stage with no
    /// gates passes trivially.
    pub fn evaluate(&self, user_id: &str, stage_id: &str) -> Result<GateCheckResult> {
        let stage = self.graph.stage(stage_id)?;

        let mut results = Vec::with_capacity(stage.gates.len());
        for (idx, gate) in stage.gates.iter().enumerate() {
            let gate_id = format!("{}#{}:{}", stage.id, idx, gate.kind());
            let missing = self.missing_for(user_id, gate)?;

            results.push(GateOutcome {
                gate_id,
                passed: missing.is_empty(),
                missing,
            });
        }

        let all_passed = results.iter().all(|r| r.passed);
        Ok(GateCheckResult {
            all_passed,
            results,
        })
    }

    fn missing_for(&self, user_id: &str, gate: &GateRequirement) -> Result<Vec<String>> {
        match gate {
            GateRequirement::LegalDocument { required_docs } => {
                let signed = self.documents.signed_documents(user_id)?;
                Ok(required_docs
                    .iter()
                    .filter(|doc| !signed.contains(doc))
                    .map(|doc| doc.to_string())
                    .collect())
            }
            GateRequirement::RbacLevel { min_level } => {
                let level = self.rbac.rbac_level(user_id)?;
                if level >= *min_level {
                    Ok(vec![])
                } else {
                    Ok(vec![format!(
                        "rbac level {level} below required minimum {min_level}"
                    )])
                }
            }
            GateRequirement::PreviousStage { stage_id } => {
                let status = self.stages.stage_status(user_id, stage_id)?;
                if status == Some(StageStatus::Completed) {
                    Ok(vec![])
                } else {
                    Ok(vec![format!("stage '{stage_id}' not completed")])
                }
            }
        }
    }
}
