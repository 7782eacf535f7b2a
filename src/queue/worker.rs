use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::db::QueueHandle;
use super::models::{FailOutcome, NewTask, Task, TaskPayload};
use crate::errors::{EXIT_FATAL, OrchestratorError, QueueError, StateError};
use crate::orchestrator::{PhaseOrchestrator, RunReport, accumulated_artifacts, next_phase};
use crate::phase::{Outcome, Phase, RunStatus};

/// What the worker did with a claimed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Disposition {
    /// Phase succeeded; the run's next phase was queued when it has one
    Completed { next_task: Option<i64> },
    /// The run had already moved past this phase
    Skipped,
    /// Failed; a linked retry task was queued
    Retrying {
        retry_task: i64,
        available_at: DateTime<Utc>,
    },
    /// Failure the run cannot recover from by retrying
    DeadLettered,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: i64,
    pub run_id: String,
    pub phase: Phase,
    pub disposition: Disposition,
}

/// Claims phase tasks and executes each as one orchestrator `step`.
pub struct QueueWorker {
    queue: QueueHandle,
    orchestrator: Arc<PhaseOrchestrator>,
    worker_id: String,
    phases: Vec<Phase>,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: QueueHandle, orchestrator: Arc<PhaseOrchestrator>, worker_id: &str) -> Self {
        Self {
            queue,
            orchestrator,
            worker_id: worker_id.to_string(),
            phases: Vec::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Restrict the worker to these phases; empty means all.
    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process at most one task.
    pub async fn run_once(&self) -> Result<Option<TaskReport>, QueueError> {
        let Some(task) = self.queue.claim(self.phases.clone(), &self.worker_id).await? else {
            return Ok(None);
        };
        let span = tracing::info_span!(
            "task",
            task_id = task.id,
            run_id = %task.payload.run_id(),
            phase = %task.phase
        );
        self.process(task).instrument(span).await.map(Some)
    }

    /// Poll until cancelled. Returns the number of tasks processed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<usize, QueueError> {
        tracing::info!(worker = %self.worker_id, phases = ?self.phases, "Worker started");
        let mut processed = 0;
        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => {
                    processed += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e @ QueueError::Database(_)) => {
                    tracing::error!(error = %e, "Queue error, backing off");
                }
                Err(e @ (QueueError::LeaseLost { .. } | QueueError::IllegalTransition { .. })) => {
                    tracing::warn!(error = %e, "Task was taken back from this worker");
                    continue;
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!(worker = %self.worker_id, processed, "Worker stopped");
        Ok(processed)
    }

    async fn process(&self, task: Task) -> Result<TaskReport, QueueError> {
        let task = self.queue.start(task.id).await?;
        let run_id = task.payload.run_id().to_string();
        let disposition = self.execute(&task, &run_id).await?;
        tracing::info!(disposition = ?disposition, "Task processed");
        Ok(TaskReport {
            task_id: task.id,
            run_id,
            phase: task.phase,
            disposition,
        })
    }

    async fn execute(&self, task: &Task, run_id: &str) -> Result<Disposition, QueueError> {
        let state = match self.orchestrator.store().load(run_id) {
            Ok(state) => state,
            Err(e @ StateError::NotFound { .. }) | Err(e @ StateError::Corruption { .. }) => {
                self.queue.fail_permanently(task.id, &e.to_string()).await?;
                return Ok(Disposition::DeadLettered);
            }
            Err(e) => return self.fail(task, &e.to_string()).await,
        };
        if next_phase(&state) != Some(task.phase) && state.last_success(task.phase).is_some() {
            self.queue
                .complete(task.id, json!({ "skipped": true, "status": state.phase }))
                .await?;
            return Ok(Disposition::Skipped);
        }

        match self
            .renewing_lease(task.id, run_id, self.orchestrator.step(run_id))
            .await?
        {
            Ok(step) if step.outcome == Some(Outcome::Success) => {
                let result = serde_json::to_value(&step.run)
                    .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
                self.queue.complete(task.id, result).await?;
                let next_task = self.enqueue_next(task, &step.run).await?;
                Ok(Disposition::Completed { next_task })
            }
            Ok(step) if step.run.status == RunStatus::Completed => {
                self.queue
                    .complete(task.id, json!({ "skipped": true, "status": step.run.status }))
                    .await?;
                Ok(Disposition::Skipped)
            }
            Ok(step) => {
                let reason = step
                    .run
                    .failure
                    .as_ref()
                    .map(|f| format!("{}: {}", f.kind, f.reason))
                    .unwrap_or_else(|| format!("phase {} did not succeed", task.phase));
                if step.run.exit_code() == EXIT_FATAL {
                    self.queue.fail_permanently(task.id, &reason).await?;
                    Ok(Disposition::DeadLettered)
                } else {
                    self.fail(task, &reason).await
                }
            }
            Err(OrchestratorError::AlreadyCompleted { .. }) => {
                self.queue
                    .complete(task.id, json!({ "skipped": true, "status": RunStatus::Completed }))
                    .await?;
                Ok(Disposition::Skipped)
            }
            Err(e) if e.exit_code() == EXIT_FATAL => {
                self.queue.fail_permanently(task.id, &e.to_string()).await?;
                Ok(Disposition::DeadLettered)
            }
            Err(e) => self.fail(task, &e.to_string()).await,
        }
    }

    /// Drive `work` while renewing the task's lease every third of its length.
    /// Once the lease is lost the run's delegations are cancelled on every
    /// tick until `work` parks it, and `LeaseLost` is returned so the task is
    /// not touched again.
    async fn renewing_lease<F: Future>(
        &self,
        task_id: i64,
        run_id: &str,
        work: F,
    ) -> Result<F::Output, QueueError> {
        let every = (self.queue.settings().lease / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        tokio::pin!(work);
        let mut lost = None;
        loop {
            tokio::select! {
                out = &mut work => return match lost {
                    Some(e) => Err(e),
                    None => Ok(out),
                },
                _ = ticker.tick() => {
                    if lost.is_some() {
                        self.orchestrator.cancel(run_id).await;
                        continue;
                    }
                    match self.queue.heartbeat(task_id, &self.worker_id).await {
                        Ok(_) => {}
                        Err(e @ QueueError::LeaseLost { .. }) => {
                            tracing::warn!(task_id, run_id, "Lease lost, abandoning run");
                            self.orchestrator.cancel(run_id).await;
                            lost = Some(e);
                        }
                        Err(e) => tracing::warn!(task_id, error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }

    async fn fail(&self, task: &Task, reason: &str) -> Result<Disposition, QueueError> {
        let outcome = self.queue.fail(task.id, reason).await?;
        Ok(match outcome {
            FailOutcome::DeadLettered => Disposition::DeadLettered,
            FailOutcome::Retrying {
                retry_task,
                available_at,
            } => Disposition::Retrying {
                retry_task,
                available_at,
            },
        })
    }

    async fn enqueue_next(&self, task: &Task, run: &RunReport) -> Result<Option<i64>, QueueError> {
        let Some(next) = run.next_phase else {
            return Ok(None);
        };
        if run.status == RunStatus::Completed {
            return Ok(None);
        }
        let state = self
            .orchestrator
            .store()
            .load(&run.run_id)
            .map_err(|e| QueueError::Database(e.into()))?;
        let payload = TaskPayload::for_phase(
            next,
            &run.run_id,
            &run.source_ref,
            &accumulated_artifacts(&state),
        );
        let id = self
            .queue
            .enqueue(
                NewTask::new(payload)
                    .with_priority(task.priority)
                    .with_tags(task.tags.clone()),
            )
            .await?;
        Ok(Some(id))
    }
}

/// Create a run and queue its first phase. Returns `(run_id, task_id)`.
pub async fn submit(
    queue: &QueueHandle,
    orchestrator: &PhaseOrchestrator,
    source_ref: &str,
    phases: Option<Vec<Phase>>,
    priority: i64,
    tags: Vec<String>,
) -> Result<(String, i64), OrchestratorError> {
    let state = orchestrator.create_run(source_ref, phases)?;
    let Some(first) = next_phase(&state) else {
        return Err(anyhow::anyhow!("Run {} has no phases", state.run_id).into());
    };
    let payload = TaskPayload::for_phase(first, &state.run_id, source_ref, &Default::default());
    let task_id = queue
        .enqueue(NewTask::new(payload).with_priority(priority).with_tags(tags))
        .await
        .map_err(anyhow::Error::from)?;
    tracing::info!(run_id = %state.run_id, task_id, "Run submitted to queue");
    Ok((state.run_id, task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::SubagentDelegator;
    use crate::delegate::test_support::*;
    use crate::orchestrator::{OrchestratorSettings, RetryPolicy};
    use crate::queue::db::{QueueDb, QueueSettings};
    use crate::queue::models::{TaskFilter, TaskStatus};
    use crate::state::StateStore;
    use crate::worktree::WorktreeManager;
    use crate::worktree::test_support::init_repo;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        queue: QueueHandle,
        orchestrator: Arc<PhaseOrchestrator>,
    }

    fn fixture(runner: ScriptedRunner, max_retries: u32) -> Fixture {
        fixture_with_lease(runner, max_retries, Duration::from_secs(300))
    }

    fn fixture_with_lease(runner: ScriptedRunner, max_retries: u32, lease: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        init_repo(&root);
        let orchestrator = PhaseOrchestrator::new(
            OrchestratorSettings {
                retry: RetryPolicy::immediate(0),
                default_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            StateStore::new(&root.join(".adw/runs")),
            WorktreeManager::new(&root, &root.join(".adw/trees")),
            Arc::new(SubagentDelegator::new(Arc::new(runner))),
        );
        let queue = QueueHandle::new(
            QueueDb::new_in_memory(QueueSettings {
                max_retries,
                backoff_base: Duration::ZERO,
                lease,
            })
            .unwrap(),
        );
        Fixture {
            _dir: dir,
            queue,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn worker(f: &Fixture) -> QueueWorker {
        QueueWorker::new(f.queue.clone(), f.orchestrator.clone(), "w1")
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_tasks_chain_through_the_pipeline() {
        let f = fixture(happy_runner(), 3);
        let (run_id, _) = submit(&f.queue, &f.orchestrator, "issue-7", None, 3, vec!["nightly".into()])
            .await
            .unwrap();
        let w = worker(&f);

        let mut phases = Vec::new();
        while let Some(report) = w.run_once().await.unwrap() {
            assert!(matches!(report.disposition, Disposition::Completed { .. }));
            phases.push(report.phase);
        }
        assert_eq!(phases, vec![Phase::Plan, Phase::Build, Phase::Review]);

        let state = f.orchestrator.store().load(&run_id).unwrap();
        assert_eq!(state.phase, RunStatus::Completed);

        let tasks = f.queue.list(TaskFilter::default()).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert!(tasks.iter().all(|t| t.priority == 3 && t.tags == vec!["nightly"]));
        match &tasks[1].payload {
            TaskPayload::Build(p) => assert_eq!(p.plan_file.as_deref(), Some("specs/plan.md")),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lease_is_renewed_during_a_long_step() {
        let runner = happy_runner().on(
            "plan",
            vec![Reply::Slow(Duration::from_millis(500), "```json\n{\"plan_file\": \"specs/plan.md\"}\n```".into())],
        );
        let f = fixture_with_lease(runner, 3, Duration::from_millis(150));
        submit(&f.queue, &f.orchestrator, "issue-4", None, 0, vec![])
            .await
            .unwrap();
        let w = worker(&f);

        let (report, stolen) = tokio::join!(w.run_once(), async {
            tokio::time::sleep(Duration::from_millis(350)).await;
            f.queue.claim(vec![Phase::Plan], "w2").await
        });
        assert!(stolen.unwrap().is_none());
        let report = report.unwrap().unwrap();
        assert!(matches!(report.disposition, Disposition::Completed { .. }));

        let plans = f
            .queue
            .list(TaskFilter {
                phase: Some(Phase::Plan),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_the_run() {
        let runner = happy_runner().on("plan", vec![Reply::Hang]);
        let f = fixture_with_lease(runner, 3, Duration::from_millis(90));
        let (run_id, task_id) = submit(&f.queue, &f.orchestrator, "issue-5", None, 0, vec![])
            .await
            .unwrap();
        let w = worker(&f);

        let started = std::time::Instant::now();
        let (report, _) = tokio::join!(w.run_once(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.queue.fail_permanently(task_id, "taken back").await.unwrap();
        });
        assert!(matches!(report, Err(QueueError::LeaseLost { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));

        let state = f.orchestrator.store().load(&run_id).unwrap();
        assert_eq!(state.failure.unwrap().kind, crate::errors::FailureKind::Cancelled);
        let task = f.queue.get(task_id).await.unwrap();
        assert_eq!(task.error.as_deref(), Some("taken back"));
    }

    #[tokio::test]
    async fn test_failed_step_is_retried_through_the_queue() {
        let runner = happy_runner().on("build", vec![Reply::Exit(1, "boom".into()), build_ok()]);
        let f = fixture(runner, 2);
        let (run_id, _) = submit(&f.queue, &f.orchestrator, "issue-8", None, 0, vec![])
            .await
            .unwrap();
        let w = worker(&f);

        w.run_once().await.unwrap().unwrap();
        let failed = w.run_once().await.unwrap().unwrap();
        assert_eq!(failed.phase, Phase::Build);
        let Disposition::Retrying { retry_task, .. } = failed.disposition else {
            panic!("expected a queued retry");
        };
        assert_eq!(
            f.orchestrator.store().load(&run_id).unwrap().phase,
            RunStatus::Failed
        );

        let retried = w.run_once().await.unwrap().unwrap();
        assert_eq!(retried.task_id, retry_task);
        assert!(matches!(retried.disposition, Disposition::Completed { .. }));
        w.run_once().await.unwrap().unwrap();
        assert!(w.run_once().await.unwrap().is_none());
        assert_eq!(
            f.orchestrator.store().load(&run_id).unwrap().phase,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let runner = happy_runner().on("plan", vec![Reply::Exit(1, "nope".into())]);
        let f = fixture(runner, 1);
        submit(&f.queue, &f.orchestrator, "issue-9", None, 0, vec![])
            .await
            .unwrap();
        let w = worker(&f);

        assert!(matches!(
            w.run_once().await.unwrap().unwrap().disposition,
            Disposition::Retrying { .. }
        ));
        assert_eq!(
            w.run_once().await.unwrap().unwrap().disposition,
            Disposition::DeadLettered
        );
        let dead = f.queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_run_is_dead_lettered() {
        let f = fixture(happy_runner(), 3);
        f.queue
            .enqueue(NewTask::new(TaskPayload::for_phase(
                Phase::Plan,
                "missing1",
                "issue-1",
                &Default::default(),
            )))
            .await
            .unwrap();
        let report = worker(&f).run_once().await.unwrap().unwrap();
        assert_eq!(report.disposition, Disposition::DeadLettered);
    }

    #[tokio::test]
    async fn test_duplicate_task_for_finished_phase_is_skipped() {
        let f = fixture(happy_runner(), 3);
        let (run_id, _) = submit(&f.queue, &f.orchestrator, "issue-1", None, 0, vec![])
            .await
            .unwrap();
        let w = worker(&f).with_phases(vec![Phase::Plan]);
        w.run_once().await.unwrap().unwrap();

        f.queue
            .enqueue(NewTask::new(TaskPayload::for_phase(
                Phase::Plan,
                &run_id,
                "issue-1",
                &Default::default(),
            )))
            .await
            .unwrap();
        let report = w.run_once().await.unwrap().unwrap();
        assert_eq!(report.disposition, Disposition::Skipped);
        assert!(w.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(happy_runner(), 3);
        submit(&f.queue, &f.orchestrator, "issue-1", None, 0, vec![])
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stopper.cancel();
        });
        assert_eq!(worker(&f).run(cancel).await.unwrap(), 3);
    }
}
