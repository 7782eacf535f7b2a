//! Subagent delegation.
//!
//! A phase step is one or more delegations. Each delegation renders a prompt
//! that carries only the run's explicit inputs, launches an agent through an
//! [`AgentRunner`] under a timeout, and parses the reply against the
//! delegation's [`OutputContract`]. Independent delegations of a step run
//! concurrently; dependent ones wait for their dependency's artifacts.
//!
//! [`SubagentDelegator::spawn`] runs a step as a task and hands back a
//! [`DelegationHandle`] whose completion channel the orchestrator awaits.

pub mod contract;
pub mod extract;
pub mod registry;
pub mod runner;

pub use contract::{ContractKind, DelegationSpec, OutputContract, ParseTier, ParsedOutput};
pub use registry::InFlightRegistry;
pub use runner::{AgentOutput, AgentRunner, ENV_ALLOWLIST, Invocation, ProcessRunner};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::errors::DelegationError;
use crate::phase::{Outcome, Phase};
use crate::worktree::EnvironmentOverlay;
use extract::reduce_transcript;

/// How long a cancelled agent gets to exit before its future is dropped.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Stderr kept in error messages.
const STDERR_TAIL: usize = 500;

/// Everything a phase step may show its agents.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: String,
    pub source_ref: String,
    pub attempt: u32,
    /// Artifacts produced by earlier phases, e.g. `plan_file`
    pub artifacts: BTreeMap<String, String>,
    pub overlay: Option<EnvironmentOverlay>,
    pub workdir: PathBuf,
    /// Where prompts and raw output are written
    pub log_dir: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn new(run_id: &str, source_ref: &str, workdir: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_ref: source_ref.to_string(),
            attempt: 1,
            artifacts: BTreeMap::new(),
            overlay: None,
            workdir: workdir.to_path_buf(),
            log_dir: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// The complete input of one delegated agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub run_id: String,
    pub source_ref: String,
    pub phase: Phase,
    pub kind: ContractKind,
    pub attempt: u32,
    pub inputs: BTreeMap<String, String>,
    pub required: Vec<&'static str>,
}

impl DelegationRequest {
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!(
            "{} {}\n\nRun: {}\nSource: {}\nPhase: {} (attempt {})\n",
            self.kind.command(),
            self.source_ref,
            self.run_id,
            self.source_ref,
            self.phase,
            self.attempt
        );
        if !self.inputs.is_empty() {
            prompt.push_str("\nInputs:\n");
            for (key, value) in &self.inputs {
                prompt.push_str(&format!("- {}: {}\n", key, value));
            }
        }
        prompt.push_str(&format!(
            "\nWhen you are done, reply with a single ```json block containing the fields: {}.\n",
            self.required.join(", ")
        ));
        prompt
    }
}

/// Result of one delegation.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationResult {
    pub kind: ContractKind,
    pub outcome: Outcome,
    pub artifacts: BTreeMap<String, String>,
    pub error: Option<String>,
    pub raw_output: String,
    pub tier: Option<ParseTier>,
    pub duration: Duration,
}

impl DelegationResult {
    fn failed(kind: ContractKind, outcome: Outcome, error: String, raw: String, duration: Duration) -> Self {
        Self {
            kind,
            outcome,
            artifacts: BTreeMap::new(),
            error: Some(error),
            raw_output: raw,
            tier: None,
            duration,
        }
    }
}

/// Joined result of a phase step.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    pub phase: Phase,
    pub outcome: Outcome,
    pub artifacts: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Output of every delegation that did not succeed
    pub raw_output: String,
    pub duration: Duration,
    pub delegations: Vec<DelegationResult>,
}

impl PhaseResult {
    pub fn join(phase: Phase, delegations: Vec<DelegationResult>, duration: Duration) -> Self {
        let outcomes: Vec<Outcome> = delegations.iter().map(|d| d.outcome).collect();
        let outcome = Outcome::join(&outcomes);

        let mut artifacts = BTreeMap::new();
        let mut errors = Vec::new();
        let mut raw = String::new();
        for d in &delegations {
            if d.outcome.is_success() {
                artifacts.extend(d.artifacts.clone());
                continue;
            }
            if let Some(e) = &d.error {
                errors.push(format!("{}: {}", d.kind, e));
            }
            if !d.raw_output.is_empty() {
                raw.push_str(&format!("--- {} ---\n{}\n", d.kind, d.raw_output));
            }
        }

        Self {
            phase,
            outcome,
            artifacts,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            raw_output: raw,
            duration,
            delegations,
        }
    }
}

/// Completion side of a spawned step.
pub struct DelegationHandle {
    phase: Phase,
    cancel: CancellationToken,
    rx: oneshot::Receiver<PhaseResult>,
}

impl DelegationHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> PhaseResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => PhaseResult::join(
                self.phase,
                vec![DelegationResult::failed(
                    ContractKind::step_for(self.phase)[0].kind,
                    Outcome::AgentError,
                    "delegation task ended without a result".into(),
                    String::new(),
                    Duration::ZERO,
                )],
                Duration::ZERO,
            ),
        }
    }
}

pub struct SubagentDelegator {
    runner: Arc<dyn AgentRunner>,
    registry: InFlightRegistry,
}

impl SubagentDelegator {
    /// Must be called inside a tokio runtime (the registry task is spawned).
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            runner,
            registry: InFlightRegistry::spawn(),
        }
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Run the step for `phase` as a task; the returned handle completes with
    /// the joined result.
    pub fn spawn(self: &Arc<Self>, phase: Phase, ctx: PhaseContext, timeout: Duration) -> DelegationHandle {
        let (tx, rx) = oneshot::channel();
        let cancel = ctx.cancel.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.registry.register(&ctx.run_id, ctx.cancel.clone()).await;
            let result = this.invoke(phase, &ctx, timeout).await;
            this.registry.remove(&ctx.run_id).await;
            let _ = tx.send(result);
        });
        DelegationHandle { phase, cancel, rx }
    }

    /// Run every delegation of `phase` and join the results.
    pub async fn invoke(&self, phase: Phase, ctx: &PhaseContext, timeout: Duration) -> PhaseResult {
        self.invoke_step(phase, &ContractKind::step_for(phase), ctx, timeout)
            .await
    }

    /// Dispatch `specs` in dependency waves; each wave runs concurrently.
    pub async fn invoke_step(
        &self,
        phase: Phase,
        specs: &[DelegationSpec],
        ctx: &PhaseContext,
        timeout: Duration,
    ) -> PhaseResult {
        let started = Instant::now();
        let mut done: BTreeMap<ContractKind, DelegationResult> = BTreeMap::new();
        let mut pending: Vec<DelegationSpec> = specs.to_vec();

        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|s| s.after.is_none_or(|dep| done.contains_key(&dep)));

            if ready.is_empty() {
                for spec in blocked {
                    let reason = format!(
                        "dependency '{}' is not part of this step",
                        spec.after.map(|d| d.to_string()).unwrap_or_default()
                    );
                    done.insert(
                        spec.kind,
                        DelegationResult::failed(spec.kind, Outcome::Failure, reason, String::new(), Duration::ZERO),
                    );
                }
                break;
            }

            let wave = ready.iter().map(|spec| {
                let mut inputs = ctx.artifacts.clone();
                let dependency = spec.after.and_then(|dep| done.get(&dep));
                if let Some(dep) = dependency {
                    inputs.extend(dep.artifacts.clone());
                }
                let skipped = dependency.filter(|d| !d.outcome.is_success()).map(|d| {
                    DelegationResult::failed(
                        spec.kind,
                        d.outcome,
                        format!("skipped: dependency '{}' ended {}", d.kind, d.outcome),
                        String::new(),
                        Duration::ZERO,
                    )
                });
                let request = DelegationRequest {
                    run_id: ctx.run_id.clone(),
                    source_ref: ctx.source_ref.clone(),
                    phase,
                    kind: spec.kind,
                    attempt: ctx.attempt,
                    inputs,
                    required: spec.kind.contract().required,
                };
                async move {
                    match skipped {
                        Some(result) => result,
                        None => self.invoke_one(request, ctx, timeout).await,
                    }
                }
            });

            let results = join_all(wave).await;
            for result in results {
                done.insert(result.kind, result);
            }
            pending = blocked;
        }

        let ordered = specs
            .iter()
            .filter_map(|s| done.remove(&s.kind))
            .collect();
        PhaseResult::join(phase, ordered, started.elapsed())
    }

    /// One agent launch under `timeout`.
    pub async fn invoke_one(
        &self,
        request: DelegationRequest,
        ctx: &PhaseContext,
        timeout: Duration,
    ) -> DelegationResult {
        let span = tracing::info_span!("delegate", run_id = %request.run_id, kind = %request.kind, attempt = request.attempt);
        self.invoke_one_inner(request, ctx, timeout)
            .instrument(span)
            .await
    }

    async fn invoke_one_inner(
        &self,
        request: DelegationRequest,
        ctx: &PhaseContext,
        timeout: Duration,
    ) -> DelegationResult {
        let kind = request.kind;
        let prompt = request.render_prompt();
        let log_stem = format!("{}-{}-attempt-{}", request.phase, kind, request.attempt);
        write_log(ctx.log_dir.as_deref(), &format!("{}-prompt.md", log_stem), &prompt);

        let started = Instant::now();
        let since = SystemTime::now();
        let token = ctx.cancel.child_token();
        let invocation = Invocation {
            label: kind.to_string(),
            prompt,
            overlay: ctx.overlay.clone(),
            workdir: ctx.workdir.clone(),
            extra_env: vec![
                ("ADW_RUN_ID".to_string(), request.run_id.clone()),
                ("ADW_PHASE".to_string(), request.phase.to_string()),
            ],
        };
        tracing::info!(timeout_secs = timeout.as_secs_f64(), "Delegating");

        let fut = self.runner.run(invocation, token.clone());
        tokio::pin!(fut);
        let run = tokio::select! {
            r = &mut fut => Some(r),
            _ = tokio::time::sleep(timeout) => None,
        };

        let output = match run {
            None => {
                token.cancel();
                let _ = tokio::time::timeout(KILL_GRACE, &mut fut).await;
                let err = DelegationError::Timeout {
                    kind: kind.to_string(),
                    timeout,
                };
                tracing::warn!(error = %err, "Delegation timed out");
                return DelegationResult::failed(kind, Outcome::Timeout, err.to_string(), String::new(), started.elapsed());
            }
            Some(Err(DelegationError::Cancelled)) => {
                return DelegationResult::failed(
                    kind,
                    Outcome::Cancelled,
                    DelegationError::Cancelled.to_string(),
                    String::new(),
                    started.elapsed(),
                );
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Agent failed to run");
                return DelegationResult::failed(kind, Outcome::AgentError, e.to_string(), String::new(), started.elapsed());
            }
            Some(Ok(output)) => output,
        };

        write_log(ctx.log_dir.as_deref(), &format!("{}-output.log", log_stem), &output.stdout);
        let duration = started.elapsed();
        let transcript = reduce_transcript(&output.stdout);

        if !output.success() || transcript.is_error {
            let err = match output.exit_code {
                Some(code) if code != 0 => DelegationError::NonZeroExit { exit_code: code }.to_string(),
                Some(_) => "agent reported an error result".to_string(),
                None => "agent terminated by signal".to_string(),
            };
            let detail = tail(&output.stderr, STDERR_TAIL);
            let message = if detail.is_empty() { err } else { format!("{}: {}", err, detail) };
            tracing::warn!(error = %message, "Agent returned an error");
            return DelegationResult::failed(kind, Outcome::AgentError, message, output.stdout, duration);
        }

        let contract = kind.contract();
        let worktree = ctx.overlay.as_ref().map(|o| o.cwd()).unwrap_or(&ctx.workdir);
        match contract.parse(&transcript.text, Some(worktree), Some(since)) {
            Ok(parsed) => {
                let (outcome, reason) = contract.judge(&parsed);
                tracing::info!(outcome = %outcome, tier = ?parsed.tier, "Delegation finished");
                DelegationResult {
                    kind,
                    outcome,
                    artifacts: parsed.artifacts(),
                    error: reason,
                    raw_output: if outcome.is_success() { String::new() } else { transcript.text },
                    tier: Some(parsed.tier),
                    duration,
                }
            }
            Err(failure) => {
                let err = DelegationError::Unparseable {
                    kind: kind.to_string(),
                    reason: failure.to_string(),
                };
                tracing::warn!(error = %err, "Delegation output unparseable");
                DelegationResult::failed(kind, Outcome::Unparseable, err.to_string(), transcript.text, duration)
            }
        }
    }
}

fn write_log(dir: Option<&Path>, name: &str, content: &str) {
    let Some(dir) = dir else {
        return;
    };
    let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(dir.join(name), content));
    if let Err(e) = result {
        tracing::warn!(file = name, error = %e, "Failed to write delegation log");
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// One scripted agent reply.
    #[derive(Debug, Clone)]
    pub enum Reply {
        Output(String),
        Exit(i32, String),
        /// Output after a delay
        Slow(Duration, String),
        Hang,
    }

    /// Replies queued per delegation label; a label with an empty queue
    /// repeats its last reply.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        last: Mutex<HashMap<String, Reply>>,
        pub prompts: Mutex<Vec<(String, String)>>,
        pub active: std::sync::atomic::AtomicUsize,
        pub peak: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, label: &str, replies: Vec<Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(label.to_string(), replies.into());
            self
        }

        pub fn prompts_for(&self, label: &str) -> Vec<String> {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| l == label)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn next(&self, label: &str) -> Reply {
            let queued = self
                .replies
                .lock()
                .unwrap()
                .get_mut(label)
                .and_then(|q| q.pop_front());
            let mut last = self.last.lock().unwrap();
            match queued {
                Some(reply) => {
                    last.insert(label.to_string(), reply.clone());
                    reply
                }
                None => last
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| Reply::Exit(127, format!("no reply scripted for {}", label))),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(
            &self,
            invocation: Invocation,
            cancel: CancellationToken,
        ) -> Result<AgentOutput, DelegationError> {
            use std::sync::atomic::Ordering;
            self.prompts
                .lock()
                .unwrap()
                .push((invocation.label.clone(), invocation.prompt.clone()));
            let reply = self.next(&invocation.label);

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // Give concurrent delegations a chance to overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;

            let result = match reply {
                Reply::Output(stdout) => Ok(AgentOutput {
                    stdout,
                    stderr: String::new(),
                    exit_code: Some(0),
                }),
                Reply::Exit(code, stderr) => Ok(AgentOutput {
                    stdout: String::new(),
                    stderr,
                    exit_code: Some(code),
                }),
                Reply::Slow(delay, stdout) => {
                    tokio::time::sleep(delay).await;
                    Ok(AgentOutput {
                        stdout,
                        stderr: String::new(),
                        exit_code: Some(0),
                    })
                }
                Reply::Hang => {
                    cancel.cancelled().await;
                    Err(DelegationError::Cancelled)
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    pub fn plan_ok() -> Reply {
        Reply::Output("```json\n{\"plan_file\": \"specs/plan.md\"}\n```".into())
    }

    pub fn build_ok() -> Reply {
        Reply::Output(
            r#"{"validation_level": 2, "lint": "pass", "typecheck": "pass", "tests": "pass"}"#.into(),
        )
    }

    pub fn review_ok() -> Reply {
        Reply::Output(r#"{"success": true, "review_summary": "looks good", "review_issues": []}"#.into())
    }

    pub fn pr_ok() -> Reply {
        Reply::Output("https://github.com/acme/widgets/pull/42".into())
    }

    /// A runner where every default-pipeline delegation succeeds.
    pub fn happy_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("plan", vec![plan_ok()])
            .on("build", vec![build_ok()])
            .on("review", vec![review_ok()])
            .on("pull_request", vec![pr_ok()])
    }
}
