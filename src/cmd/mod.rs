//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module        | Commands handled                         |
//! |---------------|------------------------------------------|
//! | `run`         | `Run`, `Resume`                          |
//! | `status`      | `Status`, `List`                         |
//! | `maintenance` | `Recover`, `Cleanup`, `Metrics`          |
//! | `queue`       | `Worker`, `Queue`                        |
//! | `doctor`      | `Doctor`                                 |
//!
//! Every command returns the process exit code: `0` completed, `1`
//! resumable failure, `2` fatal.

pub mod doctor;
pub mod maintenance;
pub mod queue;
pub mod run;
pub mod status;

pub use doctor::cmd_doctor;
pub use maintenance::{cmd_cleanup, cmd_metrics, cmd_recover};
pub use queue::{cmd_queue, cmd_worker};
pub use run::{cmd_resume, cmd_run};
pub use status::{cmd_list, cmd_status};

use std::path::{Path, PathBuf};

use adw::config::{AdwConfig, discover_root, load_env_files};
use adw::errors::{EXIT_FATAL, OrchestratorError, QueueError, StateError};
use adw::orchestrator::RunReport;
use adw::phase::Phase;
use anyhow::{Context, Result};
use console::style;
use tokio_util::sync::CancellationToken;

/// Resolve the checkout root, load its `.env` files, then the config.
pub fn load_config(root: Option<PathBuf>) -> Result<AdwConfig> {
    let root = match root.or_else(|| std::env::var_os("ADW_ROOT").map(PathBuf::from)) {
        Some(root) => root,
        None => discover_root(&std::env::current_dir().context("Failed to get current directory")?)?,
    };
    load_env_files(&root);
    AdwConfig::load(Some(root))
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", style("Interrupted, stopping at the next phase boundary...").yellow());
            token.cancel();
        }
    });
}

/// Exit code for an error that ended a command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<OrchestratorError>() {
        return e.exit_code();
    }
    if let Some(StateError::Locked { .. }) = err.downcast_ref::<StateError>() {
        return adw::errors::EXIT_RESUMABLE;
    }
    if let Some(QueueError::Database(_)) = err.downcast_ref::<QueueError>() {
        return adw::errors::EXIT_RESUMABLE;
    }
    EXIT_FATAL
}

pub fn parse_phases(names: &[String]) -> Result<Option<Vec<Phase>>> {
    if names.is_empty() {
        return Ok(None);
    }
    Phase::parse_pipeline(names).map(Some)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Human summary of a run, with the recovery hint when it is parked.
pub fn print_report(report: &RunReport) {
    let status = match report.exit_code() {
        0 => style(report.status.as_str()).green().bold(),
        1 => style(report.status.as_str()).yellow().bold(),
        _ => style(report.status.as_str()).red().bold(),
    };
    println!();
    println!("Run {} ({}): {}", style(&report.run_id).cyan(), report.source_ref, status);
    println!("  Checkpoints: {}", report.checkpoints);
    if let Some(phase) = report.last_phase {
        println!("  Last phase:  {}", phase);
    }
    if let Some(phase) = report.next_phase {
        println!("  Next phase:  {}", phase);
    }
    if let Some(path) = &report.worktree {
        println!("  Worktree:    {}", path.display());
    }
    if let Some(failure) = &report.failure {
        println!();
        println!("{} {}: {}", style("Failed:").red().bold(), failure.kind, failure.reason);
        if let Some(seq) = failure.last_checkpoint {
            println!("  Last checkpoint: #{}", seq);
        }
        println!("  {}", style(failure.kind.recovery_hint(&report.run_id)).dim());
    }
    println!();
}

pub fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
