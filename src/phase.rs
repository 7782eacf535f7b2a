//! Phase, run status and outcome vocabulary shared by every subsystem.
//!
//! This module provides:
//! - `Phase`: one discrete unit of work in a run's pipeline
//! - `RunStatus`: the orchestrator state machine and its transition table
//! - `Outcome`: what a delegation or checkpoint reports

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A discrete, ordered unit of work within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Build,
    Review,
    Test,
    Document,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Plan,
        Phase::Build,
        Phase::Review,
        Phase::Test,
        Phase::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Build => "build",
            Phase::Review => "review",
            Phase::Test => "test",
            Phase::Document => "document",
        }
    }

    /// The state the orchestrator is in while this phase runs.
    pub fn run_status(&self) -> RunStatus {
        match self {
            Phase::Plan => RunStatus::Planning,
            Phase::Build => RunStatus::Building,
            Phase::Review => RunStatus::Reviewing,
            Phase::Test => RunStatus::Testing,
            Phase::Document => RunStatus::Documenting,
        }
    }

    /// plan → build → review; test and document are opt-in.
    pub fn default_pipeline() -> Vec<Phase> {
        vec![Phase::Plan, Phase::Build, Phase::Review]
    }

    /// Parse and validate a pipeline: non-empty, no duplicates, canonical order.
    pub fn parse_pipeline(names: &[String]) -> Result<Vec<Phase>> {
        if names.is_empty() {
            anyhow::bail!("Pipeline must contain at least one phase");
        }
        let mut phases = Vec::with_capacity(names.len());
        for name in names {
            let phase: Phase = name.parse()?;
            if phases.contains(&phase) {
                anyhow::bail!("Phase '{}' listed twice in pipeline", phase);
            }
            if let Some(last) = phases.last()
                && *last > phase
            {
                anyhow::bail!("Phase '{}' cannot run after '{}'", phase, last);
            }
            phases.push(phase);
        }
        Ok(phases)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plan" => Ok(Phase::Plan),
            "build" => Ok(Phase::Build),
            "review" => Ok(Phase::Review),
            "test" => Ok(Phase::Test),
            "document" => Ok(Phase::Document),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: plan, build, review, test, document",
                s
            ),
        }
    }
}

/// Orchestrator state for a run.
///
/// ```text
/// created → planning → building → reviewing → (testing) → (documenting) → completed
///    └──────────┴──────────┴──────────┴────────────┴─────────────┴──→ failed → resumed ─┐
///                                                                        ▲              │
///                                                                        └──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Planning,
    Building,
    Reviewing,
    Testing,
    Documenting,
    Completed,
    Failed,
    Resumed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Planning => "planning",
            RunStatus::Building => "building",
            RunStatus::Reviewing => "reviewing",
            RunStatus::Testing => "testing",
            RunStatus::Documenting => "documenting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Resumed => "resumed",
        }
    }

    /// Position along the forward path; `None` for failed/resumed.
    fn rank(&self) -> Option<u8> {
        match self {
            RunStatus::Created => Some(0),
            RunStatus::Planning => Some(1),
            RunStatus::Building => Some(2),
            RunStatus::Reviewing => Some(3),
            RunStatus::Testing => Some(4),
            RunStatus::Documenting => Some(5),
            RunStatus::Completed => Some(6),
            RunStatus::Failed | RunStatus::Resumed => None,
        }
    }

    /// A phase is executing (or was executing when the process died).
    pub fn is_in_phase(&self) -> bool {
        matches!(
            self,
            RunStatus::Planning
                | RunStatus::Building
                | RunStatus::Reviewing
                | RunStatus::Testing
                | RunStatus::Documenting
        )
    }

    pub fn can_transition(&self, to: RunStatus) -> bool {
        match (*self, to) {
            (RunStatus::Completed, _) => false,
            (_, RunStatus::Created) => false,
            (RunStatus::Failed, RunStatus::Resumed) => true,
            (RunStatus::Failed, _) => false,
            (from, RunStatus::Resumed) => from.is_in_phase() || from == RunStatus::Created,
            (_, RunStatus::Failed) => true,
            (RunStatus::Resumed, to) => to.is_in_phase() || to == RunStatus::Completed,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one delegation or phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    Timeout,
    Unparseable,
    AgentError,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
            Outcome::Timeout => "timeout",
            Outcome::Unparseable => "unparseable",
            Outcome::AgentError => "agent_error",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Retried locally with backoff before the run is parked.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Outcome::Timeout | Outcome::Unparseable | Outcome::AgentError
        )
    }

    /// Combine the outcomes of a fan-out step. Order matters only for
    /// picking the dominant failure: cancelled > timeout > agent error >
    /// unparseable > failure.
    pub fn join(outcomes: &[Outcome]) -> Outcome {
        if outcomes.is_empty() || outcomes.iter().all(Outcome::is_success) {
            return Outcome::Success;
        }
        for dominant in [
            Outcome::Cancelled,
            Outcome::Timeout,
            Outcome::AgentError,
            Outcome::Unparseable,
        ] {
            if outcomes.contains(&dominant) {
                return dominant;
            }
        }
        if outcomes.iter().any(Outcome::is_success) {
            Outcome::Partial
        } else {
            Outcome::Failure
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "partial" => Ok(Outcome::Partial),
            "timeout" => Ok(Outcome::Timeout),
            "unparseable" => Ok(Outcome::Unparseable),
            "agent_error" => Ok(Outcome::AgentError),
            "cancelled" => Ok(Outcome::Cancelled),
            _ => anyhow::bail!("Invalid outcome '{}'", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_str() {
        assert_eq!("plan".parse::<Phase>().unwrap(), Phase::Plan);
        assert_eq!(" Review ".parse::<Phase>().unwrap(), Phase::Review);
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_parse_pipeline_rejects_duplicates_and_disorder() {
        let ok = Phase::parse_pipeline(&["plan".into(), "build".into(), "test".into()]).unwrap();
        assert_eq!(ok, vec![Phase::Plan, Phase::Build, Phase::Test]);
        assert!(Phase::parse_pipeline(&["plan".into(), "plan".into()]).is_err());
        assert!(Phase::parse_pipeline(&["review".into(), "build".into()]).is_err());
        assert!(Phase::parse_pipeline(&[]).is_err());
    }

    #[test]
    fn test_forward_transitions() {
        assert!(RunStatus::Created.can_transition(RunStatus::Planning));
        assert!(RunStatus::Planning.can_transition(RunStatus::Building));
        assert!(RunStatus::Reviewing.can_transition(RunStatus::Completed));
        assert!(RunStatus::Reviewing.can_transition(RunStatus::Documenting));
        assert!(!RunStatus::Building.can_transition(RunStatus::Planning));
        assert!(!RunStatus::Created.can_transition(RunStatus::Created));
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for from in [
            RunStatus::Created,
            RunStatus::Planning,
            RunStatus::Building,
            RunStatus::Reviewing,
            RunStatus::Testing,
            RunStatus::Documenting,
            RunStatus::Resumed,
        ] {
            assert!(from.can_transition(RunStatus::Failed), "{} -> failed", from);
        }
        assert!(!RunStatus::Completed.can_transition(RunStatus::Failed));
    }

    #[test]
    fn test_resume_path() {
        assert!(RunStatus::Failed.can_transition(RunStatus::Resumed));
        assert!(!RunStatus::Failed.can_transition(RunStatus::Building));
        assert!(RunStatus::Building.can_transition(RunStatus::Resumed));
        assert!(RunStatus::Resumed.can_transition(RunStatus::Building));
        assert!(RunStatus::Resumed.can_transition(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition(RunStatus::Resumed));
    }

    #[test]
    fn test_outcome_join() {
        use Outcome::*;
        assert_eq!(Outcome::join(&[Success, Success]), Success);
        assert_eq!(Outcome::join(&[Success, Timeout]), Timeout);
        assert_eq!(Outcome::join(&[Unparseable, Failure]), Unparseable);
        assert_eq!(Outcome::join(&[Success, Failure]), Partial);
        assert_eq!(Outcome::join(&[Failure, Failure]), Failure);
        assert_eq!(Outcome::join(&[Timeout, Cancelled]), Cancelled);
    }

    #[test]
    fn test_outcome_transient() {
        assert!(Outcome::Timeout.is_transient());
        assert!(Outcome::AgentError.is_transient());
        assert!(!Outcome::Failure.is_transient());
        assert!(!Outcome::Partial.is_transient());
    }
}
