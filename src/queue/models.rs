use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Task lifecycle. Statuses only move forward:
/// `pending → claimed → in_progress → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Claimed => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    pub fn can_transition(&self, to: TaskStatus) -> bool {
        !self.is_terminal() && to.rank() > self.rank() && (to.is_terminal() || to.rank() == self.rank() + 1)
    }

    /// Statuses a task may be in to move to `to`.
    pub fn sources(to: TaskStatus) -> Vec<TaskStatus> {
        [Self::Pending, Self::Claimed, Self::InProgress]
            .into_iter()
            .filter(|from| from.can_transition(to))
            .collect()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPayload {
    pub run_id: String,
    pub source_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPayload {
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// Work item for one phase of a run, tagged by `phase` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TaskPayload {
    Plan(PlanPayload),
    Build(BuildPayload),
    Review(ReviewPayload),
    Test(TestPayload),
    Document(DocumentPayload),
}

impl TaskPayload {
    /// Payload for `phase` of `run_id`, carrying the artifacts that phase
    /// consumes.
    pub fn for_phase(
        phase: Phase,
        run_id: &str,
        source_ref: &str,
        artifacts: &BTreeMap<String, String>,
    ) -> Self {
        let run_id = run_id.to_string();
        let artifact = |key: &str| artifacts.get(key).cloned();
        match phase {
            Phase::Plan => Self::Plan(PlanPayload {
                run_id,
                source_ref: source_ref.to_string(),
            }),
            Phase::Build => Self::Build(BuildPayload {
                run_id,
                plan_file: artifact("plan_file"),
            }),
            Phase::Review => Self::Review(ReviewPayload {
                run_id,
                plan_file: artifact("plan_file"),
            }),
            Phase::Test => Self::Test(TestPayload { run_id }),
            Phase::Document => Self::Document(DocumentPayload {
                run_id,
                pr_url: artifact("pr_url"),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Plan(_) => Phase::Plan,
            Self::Build(_) => Phase::Build,
            Self::Review(_) => Phase::Review,
            Self::Test(_) => Phase::Test,
            Self::Document(_) => Phase::Document,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Plan(p) => &p.run_id,
            Self::Build(p) => &p.run_id,
            Self::Review(p) => &p.run_id,
            Self::Test(p) => &p.run_id,
            Self::Document(p) => &p.run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub phase: Phase,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub priority: i64,
    pub retry_count: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub available_at: DateTime<Utc>,
    pub dead_letter: bool,
    pub parent_id: Option<i64>,
    pub claimed_by: Option<String>,
    /// Deadline for the claiming worker to renew or finish the task
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub payload: TaskPayload,
    pub priority: i64,
    pub tags: Vec<String>,
}

impl NewTask {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Criteria for `list`; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub phase: Option<Phase>,
    pub tag: Option<String>,
    pub dead_letter: Option<bool>,
    pub limit: Option<usize>,
}

/// What `fail` did with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FailOutcome {
    /// A new pending task linked to the failed one was queued
    Retrying {
        retry_task: i64,
        available_at: DateTime<Utc>,
    },
    DeadLettered,
}
