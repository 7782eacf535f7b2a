//! Run inspection commands: `adw status` and `adw list`.

use adw::config::AdwConfig;
use adw::orchestrator::RunReport;
use adw::state::StateStore;
use anyhow::Result;
use console::style;

use super::{print_json, print_report};

pub fn cmd_status(config: &AdwConfig, run_id: &str, json: bool) -> Result<i32> {
    let store = StateStore::new(&config.runs_dir());
    let state = store.load(run_id)?;
    if json {
        print_json(&state)?;
        return Ok(0);
    }

    print_report(&RunReport::from_state(&state));
    if let Some(base) = &state.base_branch {
        println!("Base branch: {}", base);
    }
    if let Some(wt) = &state.worktree {
        println!(
            "Worktree:    {} on {} ({})",
            wt.path.display(),
            wt.branch,
            if wt.alive { "alive" } else { "removed" }
        );
    }
    if state.checkpoints.is_empty() {
        println!("No checkpoints yet.");
        println!();
        return Ok(0);
    }

    println!();
    println!("{:<5} {:<10} {:<8} {:<12} {:<10} Error", "Seq", "Phase", "Attempt", "Outcome", "Duration");
    println!("{:<5} {:<10} {:<8} {:<12} {:<10} -----", "---", "-----", "-------", "-------", "--------");
    for cp in &state.checkpoints {
        let outcome = if cp.outcome.is_success() {
            style(cp.outcome.as_str()).green()
        } else {
            style(cp.outcome.as_str()).red()
        };
        println!(
            "{:<5} {:<10} {:<8} {:<12} {:<10} {}",
            cp.seq,
            cp.phase.as_str(),
            cp.attempt,
            outcome,
            format!("{:.1}s", cp.duration_ms as f64 / 1000.0),
            cp.error.as_deref().unwrap_or("")
        );
    }
    println!();
    Ok(0)
}

pub fn cmd_list(config: &AdwConfig, active_only: bool, json: bool) -> Result<i32> {
    let store = StateStore::new(&config.runs_dir());
    let scan = store.scan()?;
    let runs: Vec<RunReport> = scan
        .runs
        .iter()
        .filter(|s| !active_only || !s.terminal)
        .map(RunReport::from_state)
        .collect();

    if json {
        let corrupt: Vec<&String> = scan.corrupt.iter().map(|(id, _)| id).collect();
        print_json(&serde_json::json!({ "runs": runs, "corrupt": corrupt }))?;
        return Ok(0);
    }

    println!();
    if runs.is_empty() {
        println!("No runs found.");
    } else {
        println!("{:<10} {:<12} {:<10} {:<6} Source", "Run", "Status", "Next", "Ckpts");
        println!("{:<10} {:<12} {:<10} {:<6} ------", "---", "------", "----", "-----");
        for run in &runs {
            println!(
                "{:<10} {:<12} {:<10} {:<6} {}",
                run.run_id,
                run.status.as_str(),
                run.next_phase.map(|p| p.as_str()).unwrap_or("-"),
                run.checkpoints,
                run.source_ref
            );
        }
    }
    for (run_id, err) in &scan.corrupt {
        println!("{} {}: {}", style("corrupt").red().bold(), run_id, err);
    }
    println!();
    Ok(0)
}
