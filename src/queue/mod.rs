//! Durable phase-task queue.
//!
//! Each task carries one phase of one run. Workers claim tasks atomically,
//! execute them as a single orchestrator `step`, then queue the run's next
//! phase. Failed tasks are re-queued as linked retry tasks behind an
//! exponential backoff until the retry budget is spent, after which they
//! land in the dead-letter set.
//!
//! Storage is a SQLite file under `.adw/queue.db`, accessed through
//! `QueueHandle` so async callers never block the runtime.

pub mod db;
pub mod models;
pub mod worker;

pub use db::{QueueDb, QueueHandle, QueueSettings};
pub use models::{FailOutcome, NewTask, Task, TaskFilter, TaskPayload, TaskStatus};
pub use worker::{Disposition, QueueWorker, TaskReport, submit};

use std::path::Path;

use crate::config::AdwConfig;
use crate::errors::QueueError;

/// Open the configured queue database.
pub fn open(config: &AdwConfig) -> Result<QueueHandle, QueueError> {
    open_at(&config.queue_db(), QueueSettings::from(&config.toml.queue))
}

pub fn open_at(path: &Path, settings: QueueSettings) -> Result<QueueHandle, QueueError> {
    Ok(QueueHandle::new(QueueDb::open(path, settings)?))
}
