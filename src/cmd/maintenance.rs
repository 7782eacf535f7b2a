//! Housekeeping commands: `adw recover`, `adw cleanup`, `adw metrics`.

use std::time::Duration;

use adw::config::AdwConfig;
use adw::errors::EXIT_COMPLETED;
use adw::metrics::{AlertGate, MetricsCollector};
use adw::orchestrator::PhaseOrchestrator;
use adw::queue;
use adw::state::StateStore;
use adw::worktree::{StalePolicy, WorktreeManager};
use anyhow::Result;
use chrono::Utc;
use console::style;

use super::{cancel_on_ctrl_c, display_path, print_json, print_report};

pub async fn cmd_recover(config: &AdwConfig, resume: bool, json: bool) -> Result<i32> {
    let orchestrator = PhaseOrchestrator::from_config(config)?;
    cancel_on_ctrl_c(orchestrator.cancellation_token());
    let report = orchestrator.recover(resume).await?;
    let code = report
        .resumed
        .iter()
        .map(|r| r.exit_code())
        .max()
        .unwrap_or(EXIT_COMPLETED);

    if json {
        print_json(&report)?;
        return Ok(code);
    }

    println!();
    if report.candidates.is_empty()
        && report.stale.is_empty()
        && report.locked.is_empty()
        && report.corrupt.is_empty()
        && report.resumed.is_empty()
    {
        println!("Nothing to recover.");
        println!();
        return Ok(code);
    }
    for run_id in &report.candidates {
        println!("{} {}  ('adw resume {}')", style("resumable").yellow(), run_id, run_id);
    }
    for run_id in &report.stale {
        println!("{} {}  (worktree gone)", style("stale").red(), run_id);
    }
    for run_id in &report.locked {
        println!("{} {}  (held by another process)", style("locked").dim(), run_id);
    }
    for run_id in &report.corrupt {
        println!("{} {}  (inspect by hand)", style("corrupt").red().bold(), run_id);
    }
    for run in &report.resumed {
        print_report(run);
    }
    println!();
    Ok(code)
}

pub fn cmd_cleanup(config: &AdwConfig, max_age_days: Option<u64>, dry_run: bool, json: bool) -> Result<i32> {
    let days = max_age_days.unwrap_or(config.toml.worktree.max_age_days);
    let store = StateStore::new(&config.runs_dir());
    let worktrees = WorktreeManager::new(&config.root, &config.worktree_dir());

    let mut policy = StalePolicy {
        max_age: Duration::from_secs(days * 24 * 3600),
        dry_run,
        ..Default::default()
    };
    for state in store.list()? {
        let Some(worktree) = &state.worktree else {
            continue;
        };
        if !state.terminal && worktree.alive {
            policy.keep.insert(worktree.branch.clone());
        }
        policy
            .last_active
            .insert(worktree.branch.clone(), state.updated_at);
    }
    let stale = worktrees.cleanup_stale(&policy)?;

    if json {
        print_json(&serde_json::json!({
            "dryRun": dry_run,
            "stale": stale,
            "kept": policy.keep,
        }))?;
        return Ok(0);
    }
    println!();
    if stale.is_empty() {
        println!(
            "No worktrees idle for {} day(s) under {}.",
            days,
            display_path(&config.worktree_dir(), &config.root)
        );
        println!();
        return Ok(0);
    }
    for wt in &stale {
        let action = if wt.removed {
            style("removed").green()
        } else if dry_run {
            style("would remove").yellow()
        } else {
            style("failed").red()
        };
        println!(
            "{} {}  (idle {}d)",
            action,
            wt.branch,
            wt.age_secs / (24 * 3600)
        );
    }
    println!();
    if dry_run {
        println!(
            "{} stale worktree(s). Re-run with --no-dry-run to remove them.",
            stale.len()
        );
    } else {
        let removed = stale.iter().filter(|w| w.removed).count();
        println!("Removed {} stale worktree(s).", removed);
    }
    println!();
    Ok(0)
}

pub async fn cmd_metrics(config: &AdwConfig, window_hours: Option<u64>, json: bool) -> Result<i32> {
    let section = &config.toml.metrics;
    let hours = window_hours.unwrap_or(section.window_hours);
    let window = Duration::from_secs(hours * 3600);

    let mut collector = MetricsCollector::from_store(&StateStore::new(&config.runs_dir()))?;
    if config.queue_db().exists() {
        let dead = queue::open(config)?.dead_letters().await?;
        collector.set_dead_letters(dead.len());
    }
    let summary = collector.summarize(window);
    let alert = AlertGate::new(section.alert_threshold, section.min_samples, window)
        .evaluate(&summary, Utc::now());

    if json {
        print_json(&serde_json::json!({ "summary": summary, "alert": alert }))?;
        return Ok(0);
    }

    println!();
    println!("Metrics (last {}h)", hours);
    println!("=================");
    println!();
    let rate = summary
        .success_rate
        .map(|r| format!("{:.0}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string());
    println!("Runs finished: {} ({} completed)", summary.runs, summary.completed);
    println!("Success rate:  {}", rate);
    println!("Retries:       {}", summary.retries);
    println!("Dead letters:  {}", summary.dead_letters);

    if !summary.phase_funnel.is_empty() {
        println!();
        println!("{:<10} {:<8} {:<8} {:<9} Avg", "Phase", "Entered", "Passed", "Attempts");
        println!("{:<10} {:<8} {:<8} {:<9} ---", "-----", "-------", "------", "--------");
        for (phase, funnel) in &summary.phase_funnel {
            let avg = summary
                .avg_duration_ms
                .get(phase)
                .map(|ms| format!("{:.1}s", *ms as f64 / 1000.0))
                .unwrap_or_default();
            println!(
                "{:<10} {:<8} {:<8} {:<9} {}",
                phase.as_str(),
                funnel.entered,
                funnel.passed,
                funnel.attempts,
                avg
            );
        }
    }
    if !summary.failure_distribution.is_empty() {
        println!();
        println!("Failures:");
        for (kind, count) in &summary.failure_distribution {
            println!("  {:<20} {}", kind, count);
        }
    }
    if let Some(alert) = alert {
        println!();
        println!("{} {}", style("ALERT:").red().bold(), alert);
    }
    println!();
    Ok(0)
}
