//! Per-user, per-stage journey state machine.
//!
//! Owns the `UserStageState` records and their transition logic. Gate
//! evaluation is never consulted here; callers decide eligibility before
//! invoking a mutator. Every mutation is a compare-and-swap loop on the
//! backing tree, so concurrent duplicate submissions (double-click "start")
//! cannot lose updates, and the tree is flushed before success is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::audit::{AuditAction, AuditLedger};
use crate::error::{JourneyError, Result};
use crate::gates::StageStatusFacts;
use crate::stage::StageGraph;
use crate::time::{Clock, TimeStamp};

const JOURNEY_TREE: &str = "user_stage_state";
const BLOCKED_REASON_KEY: &str = "blocked_reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum StageStatus {
    #[n(0)]
    NotStarted,
    #[n(1)]
    InProgress,
    #[n(2)]
    Completed,
    #[n(3)]
    Blocked,
    #[n(4)]
    Skipped,
}

/// Current state for one `(user, stage)` pair. Logically single-row-per-key:
/// mutators replace this record, never append copies.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct UserStageState {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub stage_id: String,
    #[n(2)]
    pub status: StageStatus,
    #[n(3)]
    pub started_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub retry_count: u32,
    #[n(6)]
    pub metadata: BTreeMap<String, String>,
}

impl UserStageState {
    fn fresh(user_id: &str, stage_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            stage_id: stage_id.to_string(),
            status: StageStatus::NotStarted,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Aggregate view over all active stages for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct JourneyProgress {
    /// First active stage, in order, whose status is not `Completed`.
    pub current_stage: Option<String>,
    pub completed_count: usize,
    pub total_count: usize,
    pub percentage: f64,
    /// The stage after `current_stage`, if any.
    pub next_stage: Option<String>,
    pub blocked_reasons: Vec<String>,
}

pub struct JourneyStateMachine {
    tree: sled::Tree,
    graph: Arc<StageGraph>,
    ledger: AuditLedger,
    clock: Arc<dyn Clock>,
}

fn state_key(user_id: &str, stage_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + stage_id.len() + 1);
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key.extend_from_slice(stage_id.as_bytes());
    key
}

fn decode_state(bytes: &[u8]) -> Result<UserStageState> {
    minicbor::decode(bytes).map_err(|e| JourneyError::Encoding(e.to_string()))
}

impl JourneyStateMachine {
    pub fn new(
        db: &sled::Db,
        graph: Arc<StageGraph>,
        ledger: AuditLedger,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(JOURNEY_TREE)?,
            graph,
            ledger,
            clock,
        })
    }

    /// Serialized read-modify-write for one `(user, stage)` key. Loads the
    /// current record, applies `apply`, and swaps the result in only if the
    /// stored bytes are unchanged; otherwise retries against the new value.
    fn update_state<F>(&self, user_id: &str, stage_id: &str, apply: F) -> Result<UserStageState>
    where
        F: Fn(Option<UserStageState>) -> Result<UserStageState>,
    {
        let key = state_key(user_id, stage_id);
        loop {
            let old = self.tree.get(&key)?;
            let current = old.as_deref().map(decode_state).transpose()?;
            let next = apply(current)?;

            let encoded =
                minicbor::to_vec(&next).map_err(|e| JourneyError::Encoding(e.to_string()))?;
            match self.tree.compare_and_swap(&key, old, Some(encoded))? {
                Ok(()) => {
                    self.tree.flush()?;
                    return Ok(next);
                }
                Err(_) => continue, // lost the race, retry on the new value
            }
        }
    }

    pub fn state(&self, user_id: &str, stage_id: &str) -> Result<Option<UserStageState>> {
        let bytes = self.tree.get(state_key(user_id, stage_id))?;
        bytes.as_deref().map(decode_state).transpose()
    }

    /// Move a stage to `InProgress`, creating the record lazily. Restarting
    /// keeps the original `started_at`, so the call is idempotent.
    pub fn start(&self, user_id: &str, stage_id: &str) -> Result<UserStageState> {
        self.graph.stage(stage_id)?;

        let now = self.clock.now();
        let state = self.update_state(user_id, stage_id, |current| {
            let mut state = current.unwrap_or_else(|| UserStageState::fresh(user_id, stage_id));
            state.status = StageStatus::InProgress;
            if state.started_at.is_none() {
                state.started_at = Some(now.clone());
            }
            Ok(state)
        })?;

        tracing::info!(user_id, stage_id, "stage started");
        self.ledger.append(
            AuditAction::StageStarted,
            user_id,
            None,
            BTreeMap::from([("stage_id".to_string(), stage_id.to_string())]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Mark a stage `Completed`. Requires an existing record. Completing an
    /// already-completed stage is a no-op success and does not move
    /// `completed_at`.
    pub fn complete(
        &self,
        user_id: &str,
        stage_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<UserStageState> {
        self.graph.stage(stage_id)?;

        let now = self.clock.now();
        let state = self.update_state(user_id, stage_id, |current| {
            let mut state = current.ok_or_else(|| {
                JourneyError::not_found("user stage state", format!("{user_id}/{stage_id}"))
            })?;

            if state.status == StageStatus::Completed {
                return Ok(state); // idempotent
            }
            state.status = StageStatus::Completed;
            state.completed_at = Some(now.clone());
            state.metadata.extend(metadata.clone());
            Ok(state)
        })?;

        tracing::info!(user_id, stage_id, "stage completed");
        self.ledger.append(
            AuditAction::StageCompleted,
            user_id,
            None,
            BTreeMap::from([("stage_id".to_string(), stage_id.to_string())]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Mark a stage `Blocked`, recording the reason. Reachable from any
    /// state, including stages the user never started (compliance freeze).
    pub fn block(&self, user_id: &str, stage_id: &str, reason: &str) -> Result<UserStageState> {
        self.graph.stage(stage_id)?;

        let state = self.update_state(user_id, stage_id, |current| {
            let mut state = current.unwrap_or_else(|| UserStageState::fresh(user_id, stage_id));
            state.status = StageStatus::Blocked;
            state
                .metadata
                .insert(BLOCKED_REASON_KEY.to_string(), reason.to_string());
            Ok(state)
        })?;

        tracing::info!(user_id, stage_id, reason, "stage blocked");
        self.ledger.append(
            AuditAction::StageBlocked,
            user_id,
            None,
            BTreeMap::from([
                ("stage_id".to_string(), stage_id.to_string()),
                ("reason".to_string(), reason.to_string()),
            ]),
            None,
            None,
        )?;

        Ok(state)
    }

    /// Aggregate progress over the active stage catalog.
    pub fn progress(&self, user_id: &str) -> Result<JourneyProgress> {
        let active: Vec<_> = self.graph.active_stages().collect();
        let total_count = active.len();

        let mut completed_count = 0;
        let mut current_stage = None;
        let mut next_stage = None;
        let mut blocked_reasons = Vec::new();

        for (idx, stage) in active.iter().enumerate() {
            let state = self.state(user_id, &stage.id)?;
            let status = state
                .as_ref()
                .map(|s| s.status)
                .unwrap_or(StageStatus::NotStarted);

            if status == StageStatus::Completed {
                completed_count += 1;
            } else if current_stage.is_none() {
                current_stage = Some(stage.id.clone());
                next_stage = active.get(idx + 1).map(|s| s.id.clone());
            }

            if status == StageStatus::Blocked
                && let Some(state) = &state
                && let Some(reason) = state.metadata.get(BLOCKED_REASON_KEY)
            {
                blocked_reasons.push(reason.clone());
            }
        }

        let percentage = if total_count == 0 {
            0.0
        } else {
            completed_count as f64 / total_count as f64 * 100.0
        };

        Ok(JourneyProgress {
            current_stage,
            completed_count,
            total_count,
            percentage,
            next_stage,
            blocked_reasons,
        })
    }
}

impl StageStatusFacts for JourneyStateMachine {
    fn stage_status(&self, user_id: &str, stage_id: &str) -> Result<Option<StageStatus>> {
        Ok(self.state(user_id, stage_id)?.map(|s| s.status))
    }
}
