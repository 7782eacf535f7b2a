use std::path::PathBuf;
use std::process::ExitCode;

use adw::logging::{self, LogConfig};
use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

mod cmd;

#[derive(Parser)]
#[command(name = "adw")]
#[command(version, about = "Autonomous development workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Orchestrator checkout root. Defaults to ADW_ROOT, then the enclosing git checkout.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a source reference (issue, ticket, spec) through the phase pipeline
    Run {
        source_ref: String,

        /// Phases to run, comma-separated (defaults to [orchestrator].phases)
        #[arg(long, value_delimiter = ',')]
        phases: Vec<String>,

        /// Queue the run's first phase instead of driving it here
        #[arg(long)]
        queue: bool,

        /// Task priority when queued (higher first)
        #[arg(long, default_value = "0")]
        priority: i64,

        /// Task tag when queued (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Keep the worktree after the run completes
        #[arg(long)]
        keep_worktree: bool,
    },
    /// Continue a parked or interrupted run from its last checkpoint
    Resume { run_id: String },
    /// Show the state of one run
    Status { run_id: String },
    /// List known runs
    List {
        /// Only runs that have not finished
        #[arg(long)]
        active: bool,
    },
    /// Find interrupted runs and flag those whose worktree disappeared
    Recover {
        /// Resume every recoverable run
        #[arg(long)]
        resume: bool,
    },
    /// Remove worktrees not owned by an active run
    Cleanup {
        /// Minimum age in days (defaults to [worktree].max_age_days)
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Only report what would be removed (the default)
        #[arg(long, overrides_with = "no_dry_run")]
        dry_run: bool,

        /// Remove the stale worktrees
        #[arg(long, overrides_with = "dry_run")]
        no_dry_run: bool,
    },
    /// Summarize run outcomes over a time window
    Metrics {
        /// Window length in hours (defaults to [metrics].window_hours)
        #[arg(long)]
        window_hours: Option<u64>,
    },
    /// Process queued phase tasks
    Worker {
        /// Only claim these phases, comma-separated
        #[arg(long = "phase", value_delimiter = ',')]
        phases: Vec<String>,

        /// Process at most one task, then exit
        #[arg(long)]
        once: bool,

        /// Worker identifier recorded on claimed tasks
        #[arg(long)]
        id: Option<String>,
    },
    /// Check the checkout, agent, credentials and state directory
    Doctor {
        /// Check groups to run: config, env, git, agent, github, state (default: all)
        checks: Vec<String>,

        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
    },
    /// Inspect and feed the task queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Create a run and queue its first phase
    Create {
        source_ref: String,
        #[arg(long, value_delimiter = ',')]
        phases: Vec<String>,
        #[arg(long, default_value = "0")]
        priority: i64,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Show one task
    Status { task_id: i64 },
    /// List tasks
    List {
        /// pending, claimed, in_progress, completed or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List dead-lettered tasks
    Dead,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::from(cmd::exit_code_for(&e) as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = cmd::load_config(cli.root.clone())?;
    let _log_guard = logging::init(&LogConfig::from_env(cli.verbose).with_file_dir(&config.log_dir()))?;
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }
    let json = cli.json;

    match cli.command {
        Commands::Run {
            source_ref,
            phases,
            queue,
            priority,
            tags,
            keep_worktree,
        } => {
            let opts = cmd::run::RunOptions {
                source_ref,
                phases,
                queue,
                priority,
                tags,
                keep_worktree,
            };
            cmd::cmd_run(&config, opts, json).await
        }
        Commands::Resume { run_id } => cmd::cmd_resume(&config, &run_id, json).await,
        Commands::Status { run_id } => cmd::cmd_status(&config, &run_id, json),
        Commands::List { active } => cmd::cmd_list(&config, active, json),
        Commands::Recover { resume } => cmd::cmd_recover(&config, resume, json).await,
        Commands::Cleanup {
            max_age_days,
            dry_run: _,
            no_dry_run,
        } => cmd::cmd_cleanup(&config, max_age_days, !no_dry_run, json),
        Commands::Metrics { window_hours } => cmd::cmd_metrics(&config, window_hours, json).await,
        Commands::Worker { phases, once, id } => {
            cmd::cmd_worker(&config, &phases, once, id, json).await
        }
        Commands::Doctor { checks, strict } => cmd::cmd_doctor(&config, &checks, strict, json),
        Commands::Queue { command } => cmd::cmd_queue(&config, command, json).await,
    }
}
