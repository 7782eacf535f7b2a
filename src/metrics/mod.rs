//! Run and phase metrics.
//!
//! [`MetricsCollector`] keeps one sample per checkpoint and one per finished
//! run. It is fed either by replaying the state store ([`MetricsCollector::from_store`])
//! or live from store events ([`MetricsCollector::observe`]). Both paths
//! deduplicate by `(run_id, seq)`, so replaying after observing is harmless.

mod alert;

pub use alert::{Alert, AlertGate};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::errors::StateError;
use crate::phase::{Outcome, Phase, RunStatus};
use crate::state::{Checkpoint, StateStore, StoreEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSample {
    pub run_id: String,
    pub phase: Phase,
    pub outcome: Outcome,
    pub seq: u32,
    pub attempt: u32,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RunSample {
    completed: bool,
    at: DateTime<Utc>,
}

/// Per-phase counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseFunnel {
    /// Runs that attempted the phase
    pub entered: usize,
    /// Runs with a successful attempt
    pub passed: usize,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub window_hours: u64,
    /// Finished runs in the window
    pub runs: usize,
    pub completed: usize,
    /// `completed / runs`; `None` without finished runs
    pub success_rate: Option<f64>,
    pub phase_funnel: BTreeMap<Phase, PhaseFunnel>,
    /// Non-success outcomes by name
    pub failure_distribution: BTreeMap<String, usize>,
    /// Attempts beyond the first
    pub retries: usize,
    pub avg_duration_ms: BTreeMap<Phase, u64>,
    pub dead_letters: usize,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    samples: Vec<PhaseSample>,
    seen: HashSet<(String, u32)>,
    terminals: BTreeMap<String, RunSample>,
    dead_letters: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from every run in the store.
    pub fn from_store(store: &StateStore) -> Result<Self, StateError> {
        let mut collector = Self::new();
        for state in store.list()? {
            for cp in &state.checkpoints {
                collector.record_checkpoint(&state.run_id, cp);
            }
            if state.terminal {
                collector.record_terminal(
                    &state.run_id,
                    state.phase == RunStatus::Completed,
                    state.updated_at,
                );
            }
        }
        Ok(collector)
    }

    /// Record one phase attempt. Returns the sample so callers holding more
    /// detail (attempt, sequence, timestamp) can fill it in.
    pub fn record(&mut self, run_id: &str, phase: Phase, outcome: Outcome, duration_ms: u64) -> &mut PhaseSample {
        let index = self.samples.len();
        self.samples.push(PhaseSample {
            run_id: run_id.to_string(),
            phase,
            outcome,
            seq: 0,
            attempt: 1,
            duration_ms,
            at: Utc::now(),
        });
        &mut self.samples[index]
    }

    /// Record a stored checkpoint; a checkpoint already seen is ignored.
    pub fn record_checkpoint(&mut self, run_id: &str, checkpoint: &Checkpoint) {
        if !self.seen.insert((run_id.to_string(), checkpoint.seq)) {
            return;
        }
        let sample = self.record(run_id, checkpoint.phase, checkpoint.outcome, checkpoint.duration_ms);
        sample.seq = checkpoint.seq;
        sample.attempt = checkpoint.attempt;
        sample.at = checkpoint.timestamp;
    }

    /// A run reached `completed` or `failed`. A later call for the same run
    /// (a resumed run finishing again) replaces the earlier one.
    pub fn record_terminal(&mut self, run_id: &str, completed: bool, at: DateTime<Utc>) {
        self.terminals
            .insert(run_id.to_string(), RunSample { completed, at });
    }

    pub fn set_dead_letters(&mut self, count: usize) {
        self.dead_letters = count;
    }

    pub fn summarize(&self, window: Duration) -> MetricsSummary {
        self.summarize_at(window, Utc::now())
    }

    /// Drop samples and finished runs older than `cutoff`. A long-lived
    /// observer calls this so memory tracks the window, not the uptime.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        let seen = &mut self.seen;
        self.samples.retain(|sample| {
            let keep = sample.at >= cutoff;
            if !keep {
                seen.remove(&(sample.run_id.clone(), sample.seq));
            }
            keep
        });
        self.terminals.retain(|_, run| run.at >= cutoff);
    }

    pub fn summarize_at(&self, window: Duration, now: DateTime<Utc>) -> MetricsSummary {
        let cutoff = window_start(window, now);
        let mut summary = MetricsSummary {
            window_hours: window.as_secs() / 3600,
            dead_letters: self.dead_letters,
            ..Default::default()
        };

        for run in self.terminals.values().filter(|r| r.at >= cutoff) {
            summary.runs += 1;
            if run.completed {
                summary.completed += 1;
            }
        }
        if summary.runs > 0 {
            summary.success_rate = Some(summary.completed as f64 / summary.runs as f64);
        }

        let mut entered: BTreeMap<Phase, BTreeSet<&str>> = BTreeMap::new();
        let mut passed: BTreeMap<Phase, BTreeSet<&str>> = BTreeMap::new();
        let mut durations: BTreeMap<Phase, (u64, u64)> = BTreeMap::new();

        for sample in self.samples.iter().filter(|s| s.at >= cutoff) {
            entered.entry(sample.phase).or_default().insert(sample.run_id.as_str());
            summary.phase_funnel.entry(sample.phase).or_default().attempts += 1;
            if sample.outcome.is_success() {
                passed.entry(sample.phase).or_default().insert(sample.run_id.as_str());
            } else {
                *summary
                    .failure_distribution
                    .entry(sample.outcome.as_str().to_string())
                    .or_default() += 1;
            }
            if sample.attempt > 1 {
                summary.retries += 1;
            }
            let total = durations.entry(sample.phase).or_default();
            total.0 += sample.duration_ms;
            total.1 += 1;
        }

        for (phase, funnel) in summary.phase_funnel.iter_mut() {
            funnel.entered = entered.get(phase).map_or(0, BTreeSet::len);
            funnel.passed = passed.get(phase).map_or(0, BTreeSet::len);
        }
        summary.avg_duration_ms = durations
            .into_iter()
            .map(|(phase, (sum, n))| (phase, sum / n.max(1)))
            .collect();
        summary
    }

    /// Feed a shared collector from store events until the channel closes.
    /// Each finished run re-evaluates `gate`; alerts are logged.
    pub fn observe(
        collector: Arc<Mutex<MetricsCollector>>,
        mut rx: broadcast::Receiver<StoreEvent>,
        mut gate: AlertGate,
        window: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Metrics observer lagged behind store events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Ok(mut metrics) = collector.lock() else {
                    tracing::error!("Metrics collector lock poisoned");
                    break;
                };
                match event {
                    StoreEvent::CheckpointAppended { run_id, checkpoint } => {
                        metrics.record_checkpoint(&run_id, &checkpoint);
                    }
                    StoreEvent::RunFinished { run_id, status, at } => {
                        metrics.record_terminal(&run_id, status == RunStatus::Completed, at);
                        metrics.prune(window_start(window, Utc::now()));
                        let summary = metrics.summarize(window);
                        if let Some(alert) = gate.evaluate(&summary, Utc::now()) {
                            tracing::warn!(
                                success_rate = alert.success_rate,
                                runs = alert.runs,
                                "ALERT: {}",
                                alert
                            );
                        }
                    }
                }
            }
        })
    }
}

fn window_start(window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
