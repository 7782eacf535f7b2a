//! Preflight checks run by `adw doctor`.
//!
//! Each check reports pass, warn or fail. A failing check means runs will
//! not get far (no checkout, no agent binary, missing credentials, an
//! unwritable state directory); warnings point at things a phase may trip
//! over later.

use std::path::Path;
use std::process::{Command, Stdio};

use git2::{BranchType, Repository, StatusOptions};
use serde::Serialize;

use crate::config::AdwConfig;
use crate::delegate::ENV_ALLOWLIST;
use crate::queue::{QueueDb, QueueSettings};

/// Tokens the pull-request step can authenticate `gh` with.
const GITHUB_TOKENS: &[&str] = &["GH_TOKEN", "GITHUB_TOKEN", "GITHUB_PAT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

/// Check groups selectable on the command line.
pub const CHECK_GROUPS: &[&str] = &["config", "env", "git", "agent", "github", "state"];

pub struct Doctor<'a> {
    config: &'a AdwConfig,
    lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
}

impl<'a> Doctor<'a> {
    pub fn new(config: &'a AdwConfig) -> Self {
        Self::with_lookup(config, |name| std::env::var(name).ok())
    }

    /// Doctor reading variables through `lookup` instead of the process env.
    pub fn with_lookup(config: &'a AdwConfig, lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        Self {
            config,
            lookup: Box::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    /// Run the named groups (all of them when `groups` is empty). With
    /// `strict`, warnings also make the report fail.
    pub fn run(&self, groups: &[String], strict: bool) -> anyhow::Result<DoctorReport> {
        if let Some(unknown) = groups.iter().find(|g| !CHECK_GROUPS.contains(&g.as_str())) {
            anyhow::bail!(
                "Unknown check '{}' (expected one of: {})",
                unknown,
                CHECK_GROUPS.join(", ")
            );
        }
        let selected = |group: &str| groups.is_empty() || groups.iter().any(|g| g == group);

        let mut checks = Vec::new();
        if selected("config") {
            checks.push(self.check_config());
        }
        if selected("env") {
            checks.push(self.check_required_env());
            checks.push(self.check_github_token());
        }
        if selected("git") {
            checks.extend(self.check_git());
        }
        if selected("agent") {
            checks.extend(self.check_agent());
        }
        if selected("github") {
            checks.push(self.check_gh());
        }
        if selected("state") {
            checks.push(self.check_state_dir());
            checks.push(self.check_queue_db());
        }

        let ok = checks.iter().all(|c| match c.status {
            CheckStatus::Pass => true,
            CheckStatus::Warn => !strict,
            CheckStatus::Fail => false,
        });
        for check in &checks {
            tracing::debug!(check = %check.name, status = check.status.as_str(), details = %check.details, "Preflight check");
        }
        Ok(DoctorReport { ok, checks })
    }

    fn check_config(&self) -> DoctorCheck {
        let warnings = self.config.toml.validate();
        if warnings.is_empty() {
            DoctorCheck::new("config", CheckStatus::Pass, "adw.toml is valid")
        } else {
            DoctorCheck::new("config", CheckStatus::Warn, warnings.join("; "))
        }
    }

    fn check_required_env(&self) -> DoctorCheck {
        let required = &self.config.toml.project.required_env;
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| self.var(name).is_none())
            .collect();
        if !missing.is_empty() {
            return DoctorCheck::new(
                "required_env",
                CheckStatus::Fail,
                format!("Missing required variables: {}", missing.join(", ")),
            );
        }
        // The agent starts from a cleared environment.
        let dropped: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| !ENV_ALLOWLIST.contains(name))
            .collect();
        if !dropped.is_empty() {
            return DoctorCheck::new(
                "required_env",
                CheckStatus::Warn,
                format!("Set but not passed to the agent: {}", dropped.join(", ")),
            );
        }
        let details = if required.is_empty() {
            "No variables required".to_string()
        } else {
            format!("Set: {}", required.join(", "))
        };
        DoctorCheck::new("required_env", CheckStatus::Pass, details)
    }

    fn check_github_token(&self) -> DoctorCheck {
        match GITHUB_TOKENS.iter().find(|name| self.var(name).is_some()) {
            Some(name) => DoctorCheck::new("github_token", CheckStatus::Pass, format!("Using {}", name)),
            None => DoctorCheck::new(
                "github_token",
                CheckStatus::Warn,
                format!(
                    "None of {} is set; gh must already be logged in",
                    GITHUB_TOKENS.join(", ")
                ),
            ),
        }
    }

    fn check_git(&self) -> Vec<DoctorCheck> {
        let repo = match Repository::open(&self.config.root) {
            Ok(repo) => repo,
            Err(e) => {
                return vec![DoctorCheck::new(
                    "git_repo",
                    CheckStatus::Fail,
                    format!("{} is not a git checkout: {}", self.config.root.display(), e.message()),
                )];
            }
        };

        let mut checks = Vec::new();
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        match repo.statuses(Some(&mut opts)) {
            Ok(statuses) if statuses.is_empty() => {
                checks.push(DoctorCheck::new("git_repo", CheckStatus::Pass, "Working tree is clean"));
            }
            Ok(statuses) => checks.push(DoctorCheck::new(
                "git_repo",
                CheckStatus::Warn,
                format!("Working tree has {} pending change(s)", statuses.len()),
            )),
            Err(e) => checks.push(DoctorCheck::new("git_repo", CheckStatus::Fail, e.message())),
        }

        let base = match &self.config.toml.project.base_branch {
            Some(branch) => Some(branch.clone()),
            None => repo.head().ok().and_then(|h| h.shorthand().map(str::to_string)),
        };
        checks.push(match base {
            Some(branch) if repo.find_branch(&branch, BranchType::Local).is_ok() => {
                DoctorCheck::new("base_branch", CheckStatus::Pass, format!("Worktrees branch from {}", branch))
            }
            Some(branch) => DoctorCheck::new(
                "base_branch",
                CheckStatus::Fail,
                format!("Base branch '{}' does not exist", branch),
            ),
            None => DoctorCheck::new("base_branch", CheckStatus::Fail, "HEAD has no branch to cut worktrees from"),
        });
        checks
    }

    fn check_agent(&self) -> Vec<DoctorCheck> {
        let command = self.config.agent_cmd();
        let path = match which::which(&command) {
            Ok(path) => path,
            Err(_) => {
                return vec![DoctorCheck::new(
                    "agent_path",
                    CheckStatus::Fail,
                    format!("Agent command '{}' not found in PATH", command),
                )];
            }
        };

        let version = match Command::new(&path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => DoctorCheck::new(
                "agent_version",
                CheckStatus::Pass,
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ),
            Ok(output) => DoctorCheck::new(
                "agent_version",
                CheckStatus::Warn,
                format!("'{} --version' exited with {}", command, output.status),
            ),
            Err(e) => DoctorCheck::new(
                "agent_version",
                CheckStatus::Fail,
                format!("Cannot execute {}: {}", path.display(), e),
            ),
        };
        vec![
            DoctorCheck::new("agent_path", CheckStatus::Pass, format!("Found {}", path.display())),
            version,
        ]
    }

    fn check_gh(&self) -> DoctorCheck {
        let Ok(gh) = which::which("gh") else {
            return DoctorCheck::new("gh_auth", CheckStatus::Warn, "GitHub CLI (gh) is not installed");
        };
        let mut cmd = Command::new(gh);
        cmd.args(["auth", "status"]).stdin(Stdio::null());
        if self.var("GH_TOKEN").is_none()
            && let Some(pat) = self.var("GITHUB_PAT")
        {
            cmd.env("GH_TOKEN", pat);
        }
        match cmd.output() {
            Ok(output) if output.status.success() => {
                DoctorCheck::new("gh_auth", CheckStatus::Pass, "gh is authenticated")
            }
            Ok(_) => DoctorCheck::new("gh_auth", CheckStatus::Warn, "gh is not authenticated"),
            Err(e) => DoctorCheck::new("gh_auth", CheckStatus::Warn, format!("Cannot run gh: {}", e)),
        }
    }

    fn check_state_dir(&self) -> DoctorCheck {
        let dir = &self.config.state_dir;
        match check_writable(dir) {
            Ok(()) => DoctorCheck::new("state_dir", CheckStatus::Pass, format!("{} is writable", dir.display())),
            Err(e) => DoctorCheck::new(
                "state_dir",
                CheckStatus::Fail,
                format!("Cannot write to {}: {}", dir.display(), e),
            ),
        }
    }

    fn check_queue_db(&self) -> DoctorCheck {
        let path = self.config.queue_db();
        if !path.exists() {
            return DoctorCheck::new("queue_db", CheckStatus::Pass, "No queue yet");
        }
        match QueueDb::open(&path, QueueSettings::from(&self.config.toml.queue)) {
            Ok(_) => DoctorCheck::new("queue_db", CheckStatus::Pass, format!("{} opens", path.display())),
            Err(e) => DoctorCheck::new("queue_db", CheckStatus::Fail, e.to_string()),
        }
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = dir.join(".doctor_write_test");
    std::fs::write(&marker, b"ok")?;
    std::fs::remove_file(&marker)
}
