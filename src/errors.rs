//! Typed error hierarchy for the ADW orchestrator.
//!
//! One enum per subsystem:
//! - `WorktreeError`: worktree allocation, teardown and isolation failures
//! - `StateError`: state record persistence and locking failures
//! - `DelegationError`: agent subprocess failures
//! - `QueueError`: task queue failures
//! - `OrchestratorError`: run-level failures, wrapping the above
//!
//! `FailureKind` is the serializable classification stored in a parked run's
//! failure report; it decides retryability and the CLI exit code.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run finished (or was already) `completed`.
pub const EXIT_COMPLETED: i32 = 0;
/// Phase failure; `adw resume <runId>` continues from the last checkpoint.
pub const EXIT_RESUMABLE: i32 = 1;
/// Fatal or unresumable failure (corrupt state, broken worktree, bad usage).
pub const EXIT_FATAL: i32 = 2;

/// Errors from worktree management.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree at {path}: {reason}")]
    Creation { path: PathBuf, reason: String },

    #[error("Merge of '{base}' into '{branch}' conflicts in {} file(s): {}", files.len(), files.join(", "))]
    MergeConflict {
        branch: String,
        base: String,
        files: Vec<String>,
    },

    #[error("Isolation check failed: expected branch '{expected}', found '{found}'")]
    IsolationBreach { expected: String, found: String },

    #[error("Git command `{command}` failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Run {run_id} not found")]
    NotFound { run_id: String },

    #[error("Run {run_id} already exists")]
    AlreadyExists { run_id: String },

    #[error("State record at {path} is corrupt: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("Run {run_id} is locked by another orchestrator")]
    Locked { run_id: String },

    #[error(
        "Refusing to rewrite checkpoints of run {run_id}: {persisted} persisted, {proposed} proposed"
    )]
    CheckpointRewrite {
        run_id: String,
        persisted: usize,
        proposed: usize,
    },

    #[error("State I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single delegated agent invocation.
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("Delegation '{kind}' timed out after {}s", timeout.as_secs_f64())]
    Timeout { kind: String, timeout: Duration },

    #[error("Output of '{kind}' is unparseable: {reason}")]
    Unparseable { kind: String, reason: String },

    #[error("Failed to spawn agent '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent exited with code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Delegation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Task {id} cannot move from {from} to {to}")]
    IllegalTransition { id: i64, from: String, to: String },

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Task {id} is no longer leased to {worker}")]
    LeaseLost { id: i64, worker: String },

    #[error("Queue lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Run-level errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Illegal transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("Run {run_id} is already completed")]
    AlreadyCompleted { run_id: String },

    #[error("Worktree of run {run_id} no longer exists at {path}")]
    StaleWorktree { run_id: String, path: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Classification used for failure reports and exit codes.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OrchestratorError::Worktree(WorktreeError::MergeConflict { .. }) => {
                FailureKind::MergeConflict
            }
            OrchestratorError::Worktree(_) => FailureKind::WorktreeCreation,
            OrchestratorError::State(StateError::Corruption { .. }) => FailureKind::StateCorruption,
            OrchestratorError::StaleWorktree { .. } => FailureKind::StaleWorktree,
            _ => FailureKind::Internal,
        }
    }

    /// Exit code for the CLI when this error ends a command.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::AlreadyCompleted { .. } => EXIT_COMPLETED,
            OrchestratorError::State(StateError::Locked { .. }) => EXIT_RESUMABLE,
            other => other.failure_kind().exit_code(),
        }
    }
}

/// Why a run was parked in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WorktreeCreation,
    DelegationTimeout,
    UnparseableOutput,
    AgentError,
    PhaseFailure,
    StateCorruption,
    MergeConflict,
    StaleWorktree,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::WorktreeCreation => "worktree_creation",
            FailureKind::DelegationTimeout => "delegation_timeout",
            FailureKind::UnparseableOutput => "unparseable_output",
            FailureKind::AgentError => "agent_error",
            FailureKind::PhaseFailure => "phase_failure",
            FailureKind::StateCorruption => "state_corruption",
            FailureKind::MergeConflict => "merge_conflict",
            FailureKind::StaleWorktree => "stale_worktree",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }

    /// Transient failures are retried locally before the run is parked.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::DelegationTimeout | FailureKind::UnparseableOutput | FailureKind::AgentError
        )
    }

    /// Structural failures park the run immediately.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FailureKind::WorktreeCreation
                | FailureKind::StateCorruption
                | FailureKind::StaleWorktree
                | FailureKind::Internal
        )
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_structural() {
            EXIT_FATAL
        } else {
            EXIT_RESUMABLE
        }
    }

    /// Operator guidance printed next to the failure reason.
    pub fn recovery_hint(&self, run_id: &str) -> String {
        match self {
            FailureKind::StateCorruption => format!(
                "Inspect the state record of run {} by hand; it is never repaired automatically.",
                run_id
            ),
            FailureKind::StaleWorktree => format!(
                "The worktree of run {} is gone. Run 'adw cleanup' and start a new run.",
                run_id
            ),
            FailureKind::MergeConflict => format!(
                "Resolve the conflicts inside the run's worktree, commit, then 'adw resume {}'.",
                run_id
            ),
            FailureKind::WorktreeCreation => format!(
                "Fix the git checkout (stale branch or directory?) then 'adw resume {}'.",
                run_id
            ),
            _ => format!("Continue from the last checkpoint with 'adw resume {}'.", run_id),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_creation_error_carries_path() {
        let err = WorktreeError::Creation {
            path: PathBuf::from("/repo/.adw/trees/x"),
            reason: "path already exists".into(),
        };
        match &err {
            WorktreeError::Creation { path, reason } => {
                assert_eq!(path, &PathBuf::from("/repo/.adw/trees/x"));
                assert!(reason.contains("exists"));
            }
            _ => panic!("Expected Creation"),
        }
        assert!(err.to_string().contains("/repo/.adw/trees/x"));
    }

    #[test]
    fn merge_conflict_lists_files() {
        let err = WorktreeError::MergeConflict {
            branch: "adw/x-1234".into(),
            base: "main".into(),
            files: vec!["a.rs".into(), "b.rs".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 file(s)"));
        assert!(msg.contains("a.rs, b.rs"));
    }

    #[test]
    fn delegation_timeout_reports_seconds() {
        let err = DelegationError::Timeout {
            kind: "build".into(),
            timeout: Duration::from_millis(1500),
        };
        assert!(err.to_string().contains("1.5s"));
    }

    #[test]
    fn orchestrator_error_converts_from_state_error() {
        let err: OrchestratorError = StateError::Corruption {
            path: PathBuf::from("state.json"),
            reason: "bad json".into(),
        }
        .into();
        assert_eq!(err.failure_kind(), FailureKind::StateCorruption);
        assert_eq!(err.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn merge_conflict_is_resumable() {
        let err: OrchestratorError = WorktreeError::MergeConflict {
            branch: "b".into(),
            base: "main".into(),
            files: vec![],
        }
        .into();
        assert_eq!(err.failure_kind(), FailureKind::MergeConflict);
        assert_eq!(err.exit_code(), EXIT_RESUMABLE);
    }

    #[test]
    fn already_completed_exits_zero() {
        let err = OrchestratorError::AlreadyCompleted {
            run_id: "abcd1234".into(),
        };
        assert_eq!(err.exit_code(), EXIT_COMPLETED);
    }

    #[test]
    fn failure_kind_classification() {
        assert!(FailureKind::DelegationTimeout.is_transient());
        assert!(FailureKind::UnparseableOutput.is_transient());
        assert!(!FailureKind::PhaseFailure.is_transient());
        assert!(FailureKind::StateCorruption.is_structural());
        assert!(!FailureKind::MergeConflict.is_structural());
        assert_eq!(FailureKind::PhaseFailure.exit_code(), EXIT_RESUMABLE);
        assert_eq!(FailureKind::WorktreeCreation.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::UnparseableOutput).unwrap();
        assert_eq!(json, "\"unparseable_output\"");
        let back: FailureKind = serde_json::from_str("\"merge_conflict\"").unwrap();
        assert_eq!(back, FailureKind::MergeConflict);
    }

    #[test]
    fn recovery_hint_names_the_run() {
        assert!(FailureKind::PhaseFailure.recovery_hint("abcd1234").contains("adw resume abcd1234"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorktreeError::IsolationBreach {
            expected: "a".into(),
            found: "b".into(),
        });
        assert_std_error(&StateError::Locked { run_id: "x".into() });
        assert_std_error(&DelegationError::Cancelled);
        assert_std_error(&QueueError::LockPoisoned);
    }
}
