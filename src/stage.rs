//! Static, ordered catalog of workflow stages and their admission gates.
//!
//! A `StageGraph` is built once from administrative configuration and then
//! shared read-only across requests. Stage authoring (re-ordering, gate
//! edits) happens outside this crate.

use std::fmt;
use std::str::FromStr;

use crate::error::{JourneyError, Result};

/// Legal document kinds a gate can require. Closed set so an unknown
/// document type is unrepresentable past the parsing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DocType {
    TermsOfService,
    PrivacyPolicy,
    Nda,
    SubscriptionAgreement,
}

impl DocType {
    pub const ALL: [DocType; 4] = [
        DocType::TermsOfService,
        DocType::PrivacyPolicy,
        DocType::Nda,
        DocType::SubscriptionAgreement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::TermsOfService => "terms_of_service",
            DocType::PrivacyPolicy => "privacy_policy",
            DocType::Nda => "nda",
            DocType::SubscriptionAgreement => "subscription_agreement",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = JourneyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "terms_of_service" => Ok(DocType::TermsOfService),
            "privacy_policy" => Ok(DocType::PrivacyPolicy),
            "nda" => Ok(DocType::Nda),
            "subscription_agreement" => Ok(DocType::SubscriptionAgreement),
            other => Err(JourneyError::Validation(format!(
                "unknown document type: {other}"
            ))),
        }
    }
}

/// An admission predicate attached to a stage. Each variant evaluates to
/// pass/fail plus a human-readable list of what is still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRequirement {
    /// Every listed document must have a verified signature on file.
    LegalDocument { required_docs: Vec<DocType> },
    /// User's RBAC level must be at least `min_level`.
    RbacLevel { min_level: u8 },
    /// The referenced stage must already be completed.
    PreviousStage { stage_id: String },
}

impl GateRequirement {
    pub fn kind(&self) -> &'static str {
        match self {
            GateRequirement::LegalDocument { .. } => "legal_document",
            GateRequirement::RbacLevel { .. } => "rbac_level",
            GateRequirement::PreviousStage { .. } => "previous_stage",
        }
    }
}

/// One named, ordered step of the journey. Immutable once the graph is
/// constructed.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub is_active: bool,
    pub gates: Vec<GateRequirement>,
}

/// Ordered, read-only stage catalog.
#[derive(Debug)]
pub struct StageGraph {
    // sorted by `order` at construction
    stages: Vec<Stage>,
}

impl StageGraph {
    /// Build the catalog, enforcing that `order` is a strict total order
    /// over active stages and that stage ids are unique.
    pub fn new(mut stages: Vec<Stage>) -> Result<Self> {
        stages.sort_by_key(|s| s.order);

        let active: Vec<&Stage> = stages.iter().filter(|s| s.is_active).collect();
        for pair in active.windows(2) {
            if pair[0].order == pair[1].order {
                return Err(JourneyError::Validation(format!(
                    "stages '{}' and '{}' share order {}",
                    pair[0].id, pair[1].id, pair[0].order
                )));
            }
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].iter().any(|s| s.id == stage.id) {
                return Err(JourneyError::Validation(format!(
                    "duplicate stage id: {}",
                    stage.id
                )));
            }
        }

        Ok(Self { stages })
    }

    /// Active stages in ascending `order`.
    pub fn active_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.is_active)
    }

    pub fn active_count(&self) -> usize {
        self.active_stages().count()
    }

    pub fn stage(&self, id: &str) -> Result<&Stage> {
        self.stages
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| JourneyError::not_found("stage", id))
    }
}
