//! Task queue commands: `adw worker` and `adw queue ...`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use adw::config::AdwConfig;
use adw::orchestrator::PhaseOrchestrator;
use adw::phase::Phase;
use adw::queue::{self, Disposition, QueueWorker, Task, TaskFilter, TaskReport, TaskStatus};
use anyhow::{Result, anyhow};
use console::style;
use tokio_util::sync::CancellationToken;

use super::super::QueueCommands;
use super::{cancel_on_ctrl_c, parse_phases, print_json};

pub async fn cmd_worker(
    config: &AdwConfig,
    phases: &[String],
    once: bool,
    worker_id: Option<String>,
    json: bool,
) -> Result<i32> {
    let phases = parse_phases(phases)?.unwrap_or_default();
    let queue = queue::open(config)?;
    let orchestrator = Arc::new(PhaseOrchestrator::from_config(config)?);
    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let worker = QueueWorker::new(queue, orchestrator.clone(), &worker_id)
        .with_phases(phases)
        .with_poll_interval(Duration::from_millis(config.toml.queue.poll_interval_ms));

    if once {
        return match worker.run_once().await? {
            Some(report) => {
                print_task_report(&report, json)?;
                Ok(0)
            }
            None => {
                if !json {
                    println!("No claimable tasks.");
                }
                Ok(0)
            }
        };
    }

    // Ctrl-C stops claiming and cancels the run in flight.
    let stop = CancellationToken::new();
    cancel_on_ctrl_c(stop.clone());
    let watched = orchestrator.clone();
    let watcher = stop.clone();
    tokio::spawn(async move {
        watcher.cancelled().await;
        watched.shutdown().await;
    });

    if !json {
        println!("{} {} (Ctrl-C to stop)", style("Worker").bold(), worker_id);
    }
    let processed = worker.run(stop).await?;
    if json {
        print_json(&serde_json::json!({ "worker": worker_id, "processed": processed }))?;
    } else {
        println!("Processed {} task(s).", processed);
    }
    Ok(0)
}

fn print_task_report(report: &TaskReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    let action = match &report.disposition {
        Disposition::Completed { next_task: Some(id) } => {
            style(format!("completed, queued task {}", id)).green()
        }
        Disposition::Completed { next_task: None } => style("completed".to_string()).green(),
        Disposition::Skipped => style("skipped".to_string()).dim(),
        Disposition::Retrying { retry_task, available_at } => style(format!(
            "failed, retry task {} at {}",
            retry_task,
            available_at.format("%H:%M:%S")
        ))
        .yellow(),
        Disposition::DeadLettered => style("dead-lettered".to_string()).red().bold(),
    };
    println!(
        "Task {} ({} of run {}): {}",
        report.task_id, report.phase, report.run_id, action
    );
    Ok(())
}

pub async fn cmd_queue(config: &AdwConfig, command: QueueCommands, json: bool) -> Result<i32> {
    let handle = queue::open(config)?;
    match command {
        QueueCommands::Create {
            source_ref,
            phases,
            priority,
            tags,
        } => {
            let orchestrator = PhaseOrchestrator::from_config(config)?;
            let (run_id, task_id) = queue::submit(
                &handle,
                &orchestrator,
                &source_ref,
                parse_phases(&phases)?,
                priority,
                tags,
            )
            .await?;
            if json {
                print_json(&serde_json::json!({ "runId": run_id, "taskId": task_id }))?;
            } else {
                println!("Created task {} for run {}", task_id, style(&run_id).cyan());
            }
        }
        QueueCommands::Status { task_id } => {
            let task = handle.get(task_id).await?;
            if json {
                print_json(&task)?;
            } else {
                print_task(&task);
            }
        }
        QueueCommands::List {
            status,
            phase,
            tag,
            limit,
        } => {
            let filter = TaskFilter {
                status: status
                    .as_deref()
                    .map(TaskStatus::from_str)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                phase: phase.as_deref().map(Phase::from_str).transpose()?,
                tag,
                dead_letter: None,
                limit,
            };
            let tasks = handle.list(filter).await?;
            print_tasks(&tasks, json)?;
        }
        QueueCommands::Dead => {
            let tasks = handle.dead_letters().await?;
            print_tasks(&tasks, json)?;
        }
    }
    Ok(0)
}

fn print_task(task: &Task) {
    println!();
    println!("Task {} ({})", task.id, task.phase);
    println!("  Run:       {}", task.payload.run_id());
    println!("  Status:    {}", task.status);
    println!("  Priority:  {}", task.priority);
    println!("  Retries:   {}", task.retry_count);
    if let Some(parent) = task.parent_id {
        println!("  Retry of:  {}", parent);
    }
    if !task.tags.is_empty() {
        println!("  Tags:      {}", task.tags.join(", "));
    }
    if let Some(worker) = &task.claimed_by {
        println!("  Worker:    {}", worker);
    }
    if let Some(error) = &task.error {
        println!("  Error:     {}", style(error).red());
    }
    if task.dead_letter {
        println!("  {}", style("dead-lettered").red().bold());
    }
    println!();
}

fn print_tasks(tasks: &[Task], json: bool) -> Result<()> {
    if json {
        return print_json(&tasks);
    }
    println!();
    if tasks.is_empty() {
        println!("No tasks.");
        println!();
        return Ok(());
    }
    println!("{:<6} {:<10} {:<12} {:<10} {:<4} {:<6} Tags", "Id", "Phase", "Status", "Run", "Pri", "Retry");
    println!("{:<6} {:<10} {:<12} {:<10} {:<4} {:<6} ----", "--", "-----", "------", "---", "---", "-----");
    for task in tasks {
        let status = if task.dead_letter {
            style("dead".to_string()).red()
        } else {
            style(task.status.as_str().to_string()).white()
        };
        println!(
            "{:<6} {:<10} {:<12} {:<10} {:<4} {:<6} {}",
            task.id,
            task.phase.as_str(),
            status,
            task.payload.run_id(),
            task.priority,
            task.retry_count,
            task.tags.join(",")
        );
    }
    println!();
    Ok(())
}
