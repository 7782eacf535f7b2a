//! Pure decisions over a run's checkpoint log.
//!
//! Nothing here touches the filesystem or a process: the same checkpoint
//! list always yields the same next phase and the same verdict, whether the
//! run is progressing normally or being resumed after a crash.

use std::collections::BTreeMap;
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::errors::FailureKind;
use crate::phase::{Outcome, Phase};
use crate::state::ExecutionState;

/// First phase of the run's pipeline without a successful checkpoint.
pub fn next_phase(state: &ExecutionState) -> Option<Phase> {
    state
        .phases
        .iter()
        .copied()
        .find(|phase| state.last_success(*phase).is_none())
}

/// Artifacts of every completed phase, in pipeline order. Later phases
/// override earlier keys.
pub fn accumulated_artifacts(state: &ExecutionState) -> BTreeMap<String, String> {
    let mut artifacts = BTreeMap::new();
    for phase in &state.phases {
        if let Some(cp) = state.last_success(*phase) {
            artifacts.extend(cp.artifacts.clone());
        }
    }
    artifacts
}

/// What to do after a phase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Advance,
    Retry { retry: u32, delay: Duration },
    Park(FailureKind),
}

/// `retries_used` counts retries already spent on this phase in the
/// current drive. With `retry_locally` unset, transient outcomes park
/// immediately and the caller owns retrying.
pub fn judge(outcome: Outcome, retries_used: u32, policy: &RetryPolicy, retry_locally: bool) -> Verdict {
    if outcome.is_success() {
        return Verdict::Advance;
    }
    let kind = failure_kind(outcome);
    if outcome.is_transient() && retry_locally {
        let retry = retries_used + 1;
        if policy.allows(retry) {
            return Verdict::Retry {
                retry,
                delay: policy.delay_for(retry),
            };
        }
    }
    Verdict::Park(kind)
}

pub fn failure_kind(outcome: Outcome) -> FailureKind {
    match outcome {
        Outcome::Timeout => FailureKind::DelegationTimeout,
        Outcome::Unparseable => FailureKind::UnparseableOutput,
        Outcome::AgentError => FailureKind::AgentError,
        Outcome::Cancelled => FailureKind::Cancelled,
        Outcome::Success | Outcome::Failure | Outcome::Partial => FailureKind::PhaseFailure,
    }
}
