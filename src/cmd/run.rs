//! Run driving commands: `adw run` and `adw resume`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use adw::config::AdwConfig;
use adw::metrics::{AlertGate, MetricsCollector};
use adw::orchestrator::{PhaseOrchestrator, RunReport};
use adw::queue;
use anyhow::Result;
use console::style;
use tokio::task::JoinHandle;

use super::{cancel_on_ctrl_c, parse_phases, print_json, print_report};

pub struct RunOptions {
    pub source_ref: String,
    pub phases: Vec<String>,
    pub queue: bool,
    pub priority: i64,
    pub tags: Vec<String>,
    pub keep_worktree: bool,
}

fn orchestrator(config: &AdwConfig, keep_worktree: bool) -> Result<PhaseOrchestrator> {
    if keep_worktree {
        let mut config = config.clone();
        config.toml.orchestrator.keep_worktree = true;
        return PhaseOrchestrator::from_config(&config);
    }
    PhaseOrchestrator::from_config(config)
}

/// Feed finished runs into a collector so a success-rate drop is alerted
/// while this process drives runs.
fn spawn_alerts(config: &AdwConfig, orchestrator: &PhaseOrchestrator) -> Option<JoinHandle<()>> {
    let collector = match MetricsCollector::from_store(orchestrator.store()) {
        Ok(collector) => collector,
        Err(e) => {
            tracing::warn!(error = %e, "Metrics history unavailable, alerts disabled");
            return None;
        }
    };
    let section = &config.toml.metrics;
    let window = Duration::from_secs(section.window_hours * 3600);
    Some(MetricsCollector::observe(
        Arc::new(Mutex::new(collector)),
        orchestrator.store().subscribe(),
        AlertGate::new(section.alert_threshold, section.min_samples, window),
        window,
    ))
}

async fn finish(report: RunReport, observer: Option<JoinHandle<()>>, json: bool) -> Result<i32> {
    if let Some(observer) = observer {
        // The observer drains once the store's sender is dropped.
        let _ = tokio::time::timeout(Duration::from_secs(1), observer).await;
    }
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.exit_code())
}

pub async fn cmd_run(config: &AdwConfig, opts: RunOptions, json: bool) -> Result<i32> {
    let phases = parse_phases(&opts.phases)?;
    let orchestrator = orchestrator(config, opts.keep_worktree)?;

    if opts.queue {
        let queue = queue::open(config)?;
        let (run_id, task_id) = queue::submit(
            &queue,
            &orchestrator,
            &opts.source_ref,
            phases,
            opts.priority,
            opts.tags,
        )
        .await?;
        if json {
            print_json(&serde_json::json!({ "runId": run_id, "taskId": task_id }))?;
        } else {
            println!();
            println!("Queued run {} as task {}", style(&run_id).cyan(), task_id);
            println!("  Start a worker with 'adw worker' to process it.");
            println!();
        }
        return Ok(0);
    }

    cancel_on_ctrl_c(orchestrator.cancellation_token());
    let observer = spawn_alerts(config, &orchestrator);
    if !json {
        println!("{} {}", style("Starting run for").bold(), opts.source_ref);
    }
    let report = orchestrator.start(&opts.source_ref, phases).await;
    drop(orchestrator);
    finish(report?, observer, json).await
}

pub async fn cmd_resume(config: &AdwConfig, run_id: &str, json: bool) -> Result<i32> {
    let orchestrator = orchestrator(config, false)?;
    cancel_on_ctrl_c(orchestrator.cancellation_token());
    let observer = spawn_alerts(config, &orchestrator);
    if !json {
        println!("{} {}", style("Resuming run").bold(), run_id);
    }
    let report = orchestrator.resume(run_id).await;
    drop(orchestrator);
    finish(report?, observer, json).await
}
