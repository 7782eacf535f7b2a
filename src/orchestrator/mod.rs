//! Phase orchestration engine.
//!
//! `PhaseOrchestrator` owns the state machine of every run it drives:
//!
//! 1. create (or load) the run record and take the run lock
//! 2. allocate the run's worktree, or check that it still exists on resume
//! 3. for each pipeline phase without a successful checkpoint, delegate
//!    the phase, append a checkpoint, then advance, retry or park
//! 4. on completion, mark the run `completed` and release the worktree
//!
//! The orchestrator never inspects the filesystem to decide what to do
//! next; `machine::next_phase` reads the checkpoint log only.

pub mod machine;
pub mod retry;

pub use machine::{Verdict, accumulated_artifacts, next_phase};
pub use retry::RetryPolicy;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AdwConfig;
use crate::delegate::{PhaseContext, ProcessRunner, SubagentDelegator};
use crate::errors::{
    EXIT_COMPLETED, EXIT_RESUMABLE, FailureKind, OrchestratorError, StateError, WorktreeError,
};
use crate::phase::{Outcome, Phase, RunStatus};
use crate::state::{Checkpoint, ExecutionState, FailureReport, StateStore};
use crate::worktree::{WorktreeHandle, WorktreeManager};

/// Knobs the orchestrator reads for every run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub pipeline: Vec<Phase>,
    pub default_timeout: Duration,
    pub timeouts: BTreeMap<Phase, Duration>,
    pub retry: RetryPolicy,
    pub keep_worktree: bool,
    pub sync_on_resume: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            pipeline: Phase::default_pipeline(),
            default_timeout: Duration::from_secs(1800),
            timeouts: BTreeMap::new(),
            retry: RetryPolicy::default(),
            keep_worktree: false,
            sync_on_resume: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AdwConfig) -> Result<Self> {
        Ok(Self {
            pipeline: config.pipeline()?,
            default_timeout: Duration::from_secs(config.toml.orchestrator.timeout_secs),
            timeouts: Phase::ALL
                .iter()
                .map(|p| (*p, config.timeout_for(*p)))
                .collect(),
            retry: RetryPolicy::from_config(config),
            keep_worktree: config.toml.orchestrator.keep_worktree,
            sync_on_resume: config.toml.orchestrator.sync_on_resume,
        })
    }

    pub fn timeout_for(&self, phase: Phase) -> Duration {
        self.timeouts
            .get(&phase)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Where a run stands after the orchestrator let go of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub source_ref: String,
    pub status: RunStatus,
    pub checkpoints: usize,
    pub last_phase: Option<Phase>,
    pub next_phase: Option<Phase>,
    pub worktree: Option<PathBuf>,
    pub failure: Option<FailureReport>,
}

impl RunReport {
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            source_ref: state.source_ref.clone(),
            status: state.phase,
            checkpoints: state.checkpoints.len(),
            last_phase: state.last_checkpoint().map(|c| c.phase),
            next_phase: next_phase(state),
            worktree: state
                .worktree
                .as_ref()
                .filter(|w| w.alive)
                .map(|w| w.path.clone()),
            failure: state.failure.clone(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.status, &self.failure) {
            (RunStatus::Completed, _) => EXIT_COMPLETED,
            (RunStatus::Failed, Some(failure)) => failure.kind.exit_code(),
            _ => EXIT_RESUMABLE,
        }
    }
}

/// Result of a single `step`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub phase: Option<Phase>,
    pub outcome: Option<Outcome>,
    pub run: RunReport,
}

/// Outcome of the startup recovery sweep.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Interrupted runs that can be resumed
    pub candidates: Vec<String>,
    /// Runs parked because their worktree disappeared
    pub stale: Vec<String>,
    /// Runs currently held by another process
    pub locked: Vec<String>,
    /// Records that failed to load
    pub corrupt: Vec<String>,
    pub resumed: Vec<RunReport>,
}

enum PhaseEnd {
    Advanced,
    Parked,
}

pub struct PhaseOrchestrator {
    settings: OrchestratorSettings,
    store: StateStore,
    worktrees: WorktreeManager,
    delegator: Arc<SubagentDelegator>,
    cancel: CancellationToken,
}

impl PhaseOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        store: StateStore,
        worktrees: WorktreeManager,
        delegator: Arc<SubagentDelegator>,
    ) -> Self {
        Self {
            settings,
            store,
            worktrees,
            delegator,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the orchestrator to the configured agent command. Must be called
    /// inside a tokio runtime.
    pub fn from_config(config: &AdwConfig) -> Result<Self> {
        let runner = ProcessRunner::new(&config.agent_cmd(), config.agent_args());
        let worktrees = WorktreeManager::new(&config.root, &config.worktree_dir())
            .with_base_branch(config.toml.project.base_branch.clone());
        Ok(Self::new(
            OrchestratorSettings::from_config(config)?,
            StateStore::new(&config.runs_dir()),
            worktrees,
            Arc::new(SubagentDelegator::new(Arc::new(runner))),
        ))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Token that cancels every run driven by this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the in-flight delegation of one run.
    pub async fn cancel(&self, run_id: &str) -> bool {
        self.delegator.registry().cancel(run_id).await
    }

    /// Cancel the delegations in flight, then every run driven by this
    /// orchestrator. Returns the runs that had a delegation running.
    pub async fn shutdown(&self) -> Vec<String> {
        let registry = self.delegator.registry();
        let runs = registry.list().await;
        let stopped = registry.cancel_all().await;
        self.cancel.cancel();
        tracing::info!(stopped, runs = ?runs, "Cancelled in-flight delegations");
        runs
    }

    /// Persist a new run in `created` without driving it.
    pub fn create_run(
        &self,
        source_ref: &str,
        phases: Option<Vec<Phase>>,
    ) -> Result<ExecutionState, OrchestratorError> {
        let pipeline = phases.unwrap_or_else(|| self.settings.pipeline.clone());
        if pipeline.is_empty() {
            return Err(anyhow::anyhow!("Pipeline must contain at least one phase").into());
        }
        let state = ExecutionState::new(source_ref, pipeline);
        self.store.create(&state)?;
        tracing::info!(run_id = %state.run_id, source_ref, "Created run");
        Ok(state)
    }

    /// Create a run for `source_ref` and drive it to completion or a park.
    pub async fn start(
        &self,
        source_ref: &str,
        phases: Option<Vec<Phase>>,
    ) -> Result<RunReport, OrchestratorError> {
        let state = self.create_run(source_ref, phases)?;
        self.drive(&state.run_id, false).await
    }

    /// Continue a parked or interrupted run from its checkpoint log.
    pub async fn resume(&self, run_id: &str) -> Result<RunReport, OrchestratorError> {
        self.drive(run_id, true).await
    }

    /// Run exactly one phase attempt of `run_id`. Transient failures are not
    /// retried here; the caller owns retrying.
    pub async fn step(&self, run_id: &str) -> Result<StepReport, OrchestratorError> {
        let span = tracing::info_span!("step", run_id);
        self.step_locked(run_id).instrument(span).await
    }

    async fn step_locked(&self, run_id: &str) -> Result<StepReport, OrchestratorError> {
        let _lock = self.store.lock(run_id)?;
        let mut state = self.store.load(run_id)?;
        let reentry = state.phase == RunStatus::Failed;
        if !self.prepare(&mut state, reentry)? {
            return Ok(StepReport {
                phase: None,
                outcome: None,
                run: RunReport::from_state(&state),
            });
        }

        let Some(phase) = next_phase(&state) else {
            self.complete(&mut state)?;
            return Ok(StepReport {
                phase: None,
                outcome: None,
                run: RunReport::from_state(&state),
            });
        };

        self.run_phase(&mut state, phase, false).await?;
        let outcome = state
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.phase == phase)
            .map(|c| c.outcome)
            .or_else(|| state.failure.as_ref().map(|_| Outcome::Cancelled));
        if state.phase != RunStatus::Failed && next_phase(&state).is_none() {
            self.complete(&mut state)?;
        }
        Ok(StepReport {
            phase: Some(phase),
            outcome,
            run: RunReport::from_state(&state),
        })
    }

    /// Startup sweep over non-terminal runs. Runs whose worktree vanished
    /// are flagged stale and parked; the rest are resume candidates, and
    /// are resumed when `resume` is set.
    pub async fn recover(&self, resume: bool) -> Result<RecoveryReport, OrchestratorError> {
        let scan = self.store.scan()?;
        let mut report = RecoveryReport {
            corrupt: scan.corrupt.iter().map(|(id, _)| id.clone()).collect(),
            ..Default::default()
        };

        for state in scan.runs.into_iter().filter(|s| !s.terminal) {
            let run_id = state.run_id.clone();
            let lock = match self.store.lock(&run_id) {
                Ok(lock) => lock,
                Err(StateError::Locked { .. }) => {
                    report.locked.push(run_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut state = self.store.load(&run_id)?;
            if let Some(handle) = &state.worktree
                && !self.worktrees.exists(handle)
            {
                let reason = format!("worktree {} no longer exists", handle.path.display());
                tracing::warn!(run_id = %run_id, "Flagging stale run: {}", reason);
                state.stale = true;
                let next = next_phase(&state);
                state.park(FailureKind::StaleWorktree, reason, next);
                self.store.save(&state)?;
                report.stale.push(run_id);
                continue;
            }
            drop(lock);

            if resume {
                report.resumed.push(self.resume(&run_id).await?);
            } else {
                report.candidates.push(run_id);
            }
        }
        Ok(report)
    }

    async fn drive(&self, run_id: &str, reentry: bool) -> Result<RunReport, OrchestratorError> {
        let span = tracing::info_span!("run", run_id);
        self.drive_locked(run_id, reentry).instrument(span).await
    }

    async fn drive_locked(&self, run_id: &str, reentry: bool) -> Result<RunReport, OrchestratorError> {
        let _lock = self.store.lock(run_id)?;
        let mut state = self.store.load(run_id)?;
        if !self.prepare(&mut state, reentry)? {
            return Ok(RunReport::from_state(&state));
        }

        loop {
            if self.cancel.is_cancelled() {
                let next = next_phase(&state);
                self.park_cancelled(&mut state, next)?;
                break;
            }
            let Some(phase) = next_phase(&state) else {
                self.complete(&mut state)?;
                break;
            };
            match self.run_phase(&mut state, phase, true).await? {
                PhaseEnd::Advanced => continue,
                PhaseEnd::Parked => break,
            }
        }
        Ok(RunReport::from_state(&state))
    }

    /// Ready a loaded run for execution. Returns `false` when the run was
    /// parked instead (worktree creation failed, stale worktree, merge
    /// conflict).
    fn prepare(&self, state: &mut ExecutionState, reentry: bool) -> Result<bool, OrchestratorError> {
        if state.phase == RunStatus::Completed {
            return Err(OrchestratorError::AlreadyCompleted {
                run_id: state.run_id.clone(),
            });
        }
        if reentry && state.phase != RunStatus::Resumed {
            state.transition(RunStatus::Resumed)?;
            tracing::info!(next = ?next_phase(state), "Resuming run");
        }

        match state.worktree.clone() {
            None => match self.allocate_worktree(state) {
                Ok(handle) => {
                    state.base_branch = Some(self.worktrees.base_branch()?);
                    state.worktree = Some(handle);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worktree allocation failed");
                    state.park(FailureKind::WorktreeCreation, e.to_string(), None);
                    self.store.save(state)?;
                    return Ok(false);
                }
            },
            Some(handle) if !self.worktrees.exists(&handle) => {
                let err = OrchestratorError::StaleWorktree {
                    run_id: state.run_id.clone(),
                    path: handle.path.clone(),
                };
                tracing::error!(error = %err, "Run is stale");
                state.stale = true;
                let next = next_phase(state);
                state.park(FailureKind::StaleWorktree, err.to_string(), next);
                self.store.save(state)?;
                return Ok(false);
            }
            Some(handle) => {
                if reentry && self.settings.sync_on_resume {
                    let base = match &state.base_branch {
                        Some(base) => base.clone(),
                        None => self.worktrees.base_branch()?,
                    };
                    if let Err(e) = self.worktrees.sync_with_base(&handle, &base) {
                        let err = OrchestratorError::from(e);
                        tracing::error!(error = %err, "Sync with base failed");
                        let next = next_phase(state);
                        state.park(err.failure_kind(), err.to_string(), next);
                        self.store.save(state)?;
                        return Ok(false);
                    }
                }
            }
        }

        self.store.save(state)?;
        Ok(true)
    }

    /// Create the run's worktree and prove git inside it cannot reach the
    /// orchestrator's checkout. A worktree failing the check is removed.
    fn allocate_worktree(&self, state: &ExecutionState) -> Result<WorktreeHandle, WorktreeError> {
        let handle = self.worktrees.create(&state.run_id, &state.source_ref)?;
        if let Err(e) = self.worktrees.verify_isolation(&handle) {
            if let Err(destroy) = self.worktrees.destroy(&handle) {
                tracing::warn!(path = %handle.path.display(), error = %destroy, "Failed to remove unisolated worktree");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Attempt `phase` until it succeeds, exhausts its retries, or fails for
    /// good. Every attempt is checkpointed except a cancelled one.
    async fn run_phase(
        &self,
        state: &mut ExecutionState,
        phase: Phase,
        retry_locally: bool,
    ) -> Result<PhaseEnd, OrchestratorError> {
        state.transition(phase.run_status())?;
        self.store.save(state)?;

        let overlay = match &state.worktree {
            Some(handle) => Some(self.worktrees.isolate(handle)?),
            None => None,
        };
        let workdir = state
            .worktree
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_else(|| self.worktrees.root().to_path_buf());
        let timeout = self.settings.timeout_for(phase);
        let mut retries = 0;

        loop {
            let attempt = state.attempts(phase) + 1;
            let ctx = PhaseContext {
                run_id: state.run_id.clone(),
                source_ref: state.source_ref.clone(),
                attempt,
                artifacts: accumulated_artifacts(state),
                overlay: overlay.clone(),
                workdir: workdir.clone(),
                log_dir: Some(self.store.log_dir(&state.run_id)),
                cancel: self.cancel.child_token(),
            };
            tracing::info!(phase = %phase, attempt, "Starting phase");

            let result = self.delegator.spawn(phase, ctx, timeout).wait().await;
            if result.outcome == Outcome::Cancelled {
                self.park_cancelled(state, Some(phase))?;
                return Ok(PhaseEnd::Parked);
            }

            let mut checkpoint = Checkpoint::new(phase, attempt, result.outcome)
                .with_artifacts(result.artifacts)
                .with_duration_ms(result.duration.as_millis() as u64);
            if let Some(error) = &result.error {
                checkpoint = checkpoint.with_error(error.clone());
            }
            if !result.raw_output.is_empty() {
                checkpoint = checkpoint.with_raw_output(result.raw_output);
            }
            self.store.append_checkpoint(&state.run_id, checkpoint)?;
            *state = self.store.load(&state.run_id)?;
            tracing::info!(phase = %phase, attempt, outcome = %result.outcome, "Phase attempt finished");

            match machine::judge(result.outcome, retries, &self.settings.retry, retry_locally) {
                Verdict::Advance => return Ok(PhaseEnd::Advanced),
                Verdict::Retry { retry, delay } => {
                    retries = retry;
                    tracing::warn!(
                        phase = %phase,
                        retry,
                        delay_secs = delay.as_secs(),
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.park_cancelled(state, Some(phase))?;
                            return Ok(PhaseEnd::Parked);
                        }
                    }
                }
                Verdict::Park(kind) => {
                    let reason = result
                        .error
                        .unwrap_or_else(|| format!("{} phase ended {}", phase, result.outcome));
                    tracing::error!(phase = %phase, kind = %kind, reason = %reason, "Parking run");
                    state.park(kind, reason, Some(phase));
                    self.store.save(state)?;
                    return Ok(PhaseEnd::Parked);
                }
            }
        }
    }

    fn park_cancelled(&self, state: &mut ExecutionState, phase: Option<Phase>) -> Result<(), OrchestratorError> {
        tracing::warn!("Run cancelled");
        state.park(FailureKind::Cancelled, "cancelled by operator", phase);
        self.store.save(state)?;
        Ok(())
    }

    fn complete(&self, state: &mut ExecutionState) -> Result<(), OrchestratorError> {
        state.transition(RunStatus::Completed)?;
        if !self.settings.keep_worktree
            && let Some(handle) = state.worktree.as_mut()
        {
            match self.worktrees.destroy(handle) {
                Ok(()) => handle.alive = false,
                Err(e) => tracing::warn!(error = %e, "Failed to remove worktree of completed run"),
            }
        }
        self.store.save(state)?;
        tracing::info!(checkpoints = state.checkpoints.len(), "Run completed");
        Ok(())
    }
}
