use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::errors::{FailureKind, OrchestratorError};
use crate::phase::{Outcome, Phase, RunStatus};
use crate::worktree::WorktreeHandle;

/// Schema version written into every state record.
pub const STATE_VERSION: u32 = 1;

/// Immutable record of one phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// 1-based position in the run's checkpoint log; assigned on append
    #[serde(default)]
    pub seq: u32,
    pub phase: Phase,
    pub attempt: u32,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Agent output kept for diagnosis when the attempt did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub digest: String,
}

impl Checkpoint {
    pub fn new(phase: Phase, attempt: u32, outcome: Outcome) -> Self {
        Self {
            seq: 0,
            phase,
            attempt,
            outcome,
            artifacts: BTreeMap::new(),
            error: None,
            raw_output: None,
            duration_ms: 0,
            timestamp: Utc::now(),
            digest: String::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: BTreeMap<String, String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// SHA-256 over everything except `seq`, `timestamp`, `duration_ms` and
    /// `digest`, so a replay of the same attempt hashes identically.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.phase.as_str());
        hasher.update([0]);
        hasher.update(self.attempt.to_le_bytes());
        hasher.update(self.outcome.as_str());
        hasher.update([0]);
        for (k, v) in &self.artifacts {
            hasher.update(k);
            hasher.update([1]);
            hasher.update(v);
            hasher.update([0]);
        }
        hasher.update(self.error.as_deref().unwrap_or(""));
        hasher.update([0]);
        hasher.update(self.raw_output.as_deref().unwrap_or(""));
        format!("{:x}", hasher.finalize())
    }
}

/// Result of appending a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { seq: u32 },
    /// Same content already logged; nothing written
    Duplicate { seq: u32 },
}

impl AppendOutcome {
    pub fn seq(&self) -> u32 {
        match self {
            AppendOutcome::Appended { seq } | AppendOutcome::Duplicate { seq } => *seq,
        }
    }
}

/// Why a run is parked, with the checkpoint it can resume from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub kind: FailureKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Sequence number of the last checkpoint at the time of failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Durable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub version: u32,
    pub run_id: String,
    pub source_ref: String,
    pub phase: RunStatus,
    /// Pipeline fixed at creation
    pub phases: Vec<Phase>,
    /// Latest outcome per phase name
    #[serde(default)]
    pub status: BTreeMap<String, Outcome>,
    #[serde(default)]
    pub worktree: Option<WorktreeHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub terminal: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(source_ref: &str, phases: Vec<Phase>) -> Self {
        Self::with_run_id(&new_run_id(), source_ref, phases)
    }

    pub fn with_run_id(run_id: &str, source_ref: &str, phases: Vec<Phase>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id: run_id.to_string(),
            source_ref: source_ref.to_string(),
            phase: RunStatus::Created,
            phases,
            status: BTreeMap::new(),
            worktree: None,
            base_branch: None,
            checkpoints: Vec::new(),
            terminal: false,
            stale: false,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move the state machine, rejecting transitions the table forbids.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), OrchestratorError> {
        if self.phase == to && to.is_in_phase() {
            return Ok(());
        }
        if !self.phase.can_transition(to) {
            return Err(OrchestratorError::IllegalTransition {
                run_id: self.run_id.clone(),
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        self.terminal = matches!(to, RunStatus::Completed | RunStatus::Failed);
        if to != RunStatus::Failed {
            self.failure = None;
        }
        self.touch();
        Ok(())
    }

    /// Park the run in `failed` with a reason and the last checkpoint.
    pub fn park(&mut self, kind: FailureKind, reason: impl Into<String>, phase: Option<Phase>) {
        self.phase = RunStatus::Failed;
        self.terminal = true;
        self.failure = Some(FailureReport {
            kind,
            reason: reason.into(),
            phase,
            last_checkpoint: self.checkpoints.last().map(|c| c.seq),
            at: Utc::now(),
        });
        self.touch();
    }

    /// Append to the log unless an entry with the same digest exists.
    pub fn push_checkpoint(&mut self, mut checkpoint: Checkpoint) -> AppendOutcome {
        let digest = checkpoint.content_digest();
        if let Some(existing) = self.checkpoints.iter().find(|c| c.digest == digest) {
            return AppendOutcome::Duplicate { seq: existing.seq };
        }
        let seq = self.checkpoints.last().map(|c| c.seq).unwrap_or(0) + 1;
        checkpoint.seq = seq;
        checkpoint.digest = digest;
        self.status
            .insert(checkpoint.phase.as_str().to_string(), checkpoint.outcome);
        self.checkpoints.push(checkpoint);
        self.touch();
        AppendOutcome::Appended { seq }
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn last_success(&self, phase: Phase) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.phase == phase && c.outcome.is_success())
    }

    /// Attempts already logged for `phase`.
    pub fn attempts(&self, phase: Phase) -> u32 {
        self.checkpoints
            .iter()
            .filter(|c| c.phase == phase)
            .map(|c| c.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Check the invariants a loaded record must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!("unsupported state version {}", self.version));
        }
        if self.run_id.is_empty() {
            return Err("empty run id".into());
        }
        for (i, cp) in self.checkpoints.iter().enumerate() {
            let expected = i as u32 + 1;
            if cp.seq != expected {
                return Err(format!(
                    "checkpoint {} has sequence {}, expected {}",
                    i, cp.seq, expected
                ));
            }
            if !self.phases.contains(&cp.phase) {
                return Err(format!("checkpoint {} names phase {} outside the pipeline", cp.seq, cp.phase));
            }
        }
        Ok(())
    }
}

/// Eight hex characters from a v4 UUID.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
