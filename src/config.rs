//! Configuration for ADW, read from `.adw/adw.toml`.
//!
//! Settings are layered file → environment → CLI. Every section has
//! defaults, so a missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! base_branch = "main"
//! agent_cmd = "claude"
//! model = "sonnet"
//! required_env = ["ANTHROPIC_API_KEY"]
//!
//! [orchestrator]
//! phases = ["plan", "build", "review"]
//! timeout_secs = 1800
//! keep_worktree = false
//! sync_on_resume = false
//!
//! [retry]
//! max_retries = 3
//! backoff_secs = [60, 120, 180]
//!
//! [phases.overrides.build]
//! timeout_secs = 3600
//!
//! [worktree]
//! dir = ".adw/trees"
//! max_age_days = 7
//!
//! [metrics]
//! alert_threshold = 0.5
//! window_hours = 24
//! min_samples = 3
//!
//! [queue]
//! max_retries = 3
//! backoff_base_secs = 30
//! poll_interval_ms = 1000
//! lease_secs = 300
//! ```
//!
//! Environment overrides: `ADW_ROOT`, `ADW_STATE_DIR`, `ADW_AGENT_CMD`,
//! `ADW_TIMEOUT_SECS`, `ADW_MAX_RETRIES`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::phase::Phase;

pub const ADW_DIR: &str = ".adw";
pub const CONFIG_FILE: &str = "adw.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Branch new worktrees are cut from (default: the checkout's HEAD)
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub agent_cmd: Option<String>,
    /// Full argument list; replaces the default Claude flags when set
    #[serde(default)]
    pub agent_args: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Variables `adw doctor` requires before any run
    #[serde(default = "default_required_env")]
    pub required_env: Vec<String>,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_required_env() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".to_string()]
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            base_branch: None,
            agent_cmd: None,
            agent_args: None,
            model: None,
            skip_permissions: default_skip_permissions(),
            required_env: default_required_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Keep the worktree after a run completes
    #[serde(default)]
    pub keep_worktree: bool,
    /// Merge the base branch into the worktree before resuming
    #[serde(default)]
    pub sync_on_resume: bool,
}

fn default_phases() -> Vec<String> {
    Phase::default_pipeline()
        .iter()
        .map(|p| p.as_str().to_string())
        .collect()
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            phases: default_phases(),
            timeout_secs: default_timeout_secs(),
            keep_worktree: false,
            sync_on_resume: false,
        }
    }
}

/// Local retry policy for transient delegation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before retry N is `backoff_secs[N-1]`; the last entry repeats.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![60, 120, 180]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

/// Phase-specific overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default)]
    pub overrides: HashMap<String, PhaseOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSection {
    /// Directory holding run worktrees, relative to the checkout root
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_max_age_days() -> u64 {
    7
}

impl Default for WorktreeSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
    /// Terminal runs required in a window before alerting
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_alert_threshold() -> f64 {
    0.5
}

fn default_window_hours() -> u64 {
    24
}

fn default_min_samples() -> usize {
    3
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
            window_hours: default_window_hours(),
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A claim not renewed within this long is taken back from its worker
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    300
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// The complete adw.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdwToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub worktree: WorktreeSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub queue: QueueSection,
}

impl AdwToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse adw.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(adw_dir: &Path) -> Result<Self> {
        let path = adw_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Err(e) = Phase::parse_pipeline(&self.orchestrator.phases) {
            warnings.push(format!("Invalid [orchestrator].phases: {}", e));
        }
        if self.retry.backoff_secs.is_empty() && self.retry.max_retries > 0 {
            warnings.push("[retry].backoff_secs is empty; retries run without delay".into());
        }
        if !(0.0..=1.0).contains(&self.metrics.alert_threshold) {
            warnings.push(format!(
                "[metrics].alert_threshold {} is outside 0.0..=1.0",
                self.metrics.alert_threshold
            ));
        }
        if self.queue.lease_secs == 0 {
            warnings.push("[queue].lease_secs is 0; every claim expires immediately".into());
        }
        for name in self.phases.overrides.keys() {
            if name.parse::<Phase>().is_err() {
                warnings.push(format!("Override for unknown phase '{}'", name));
            }
        }
        warnings
    }
}

/// Values taken from the environment (or the CLI) that beat the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub agent_cmd: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build overrides from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            agent_cmd: lookup("ADW_AGENT_CMD").filter(|v| !v.is_empty()),
            timeout_secs: lookup("ADW_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            max_retries: lookup("ADW_MAX_RETRIES").and_then(|v| v.parse().ok()),
        }
    }
}

/// Resolved configuration: checkout root, state directory and settings.
#[derive(Debug, Clone)]
pub struct AdwConfig {
    /// Root of the orchestrator's own checkout
    pub root: PathBuf,
    /// Directory holding run state, logs and the queue database
    pub state_dir: PathBuf,
    pub toml: AdwToml,
    pub overrides: Overrides,
}

impl AdwConfig {
    /// Resolve the root (explicit → `ADW_ROOT` → enclosing git checkout of
    /// the current directory) and load its configuration.
    pub fn load(root: Option<PathBuf>) -> Result<Self> {
        let root = match root.or_else(|| std::env::var_os("ADW_ROOT").map(PathBuf::from)) {
            Some(root) => root,
            None => discover_root(&std::env::current_dir()?)?,
        };
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve root {}", root.display()))?;
        let state_dir = std::env::var_os("ADW_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(ADW_DIR));
        let toml = AdwToml::load_or_default(&state_dir)?;
        Ok(Self {
            root,
            state_dir,
            toml,
            overrides: Overrides::from_env(),
        })
    }

    /// Configuration rooted at `root` with no environment influence.
    pub fn for_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state_dir: root.join(ADW_DIR),
            toml: AdwToml::default(),
            overrides: Overrides::default(),
        }
    }

    pub fn with_toml(mut self, toml: AdwToml) -> Self {
        self.toml = toml;
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn agent_cmd(&self) -> String {
        self.overrides
            .agent_cmd
            .clone()
            .or_else(|| self.toml.project.agent_cmd.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Arguments passed to the agent command; the prompt goes to stdin.
    pub fn agent_args(&self) -> Vec<String> {
        if let Some(args) = &self.toml.project.agent_args {
            return args.clone();
        }
        let mut flags = Vec::new();
        if self.toml.project.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = &self.toml.project.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        flags
    }

    /// Timeout for one delegation of `phase` (CLI/env → override → default).
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let secs = self
            .overrides
            .timeout_secs
            .or_else(|| {
                self.toml
                    .phases
                    .overrides
                    .get(phase.as_str())
                    .and_then(|o| o.timeout_secs)
            })
            .unwrap_or(self.toml.orchestrator.timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn max_retries(&self) -> u32 {
        self.overrides
            .max_retries
            .unwrap_or(self.toml.retry.max_retries)
    }

    pub fn pipeline(&self) -> Result<Vec<Phase>> {
        Phase::parse_pipeline(&self.toml.orchestrator.phases)
    }

    pub fn worktree_dir(&self) -> PathBuf {
        match &self.toml.worktree.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.state_dir.join("trees"),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.state_dir.join("queue.db")
    }
}

/// Find the working directory of the git checkout enclosing `start`.
pub fn discover_root(start: &Path) -> Result<PathBuf> {
    let repo = git2::Repository::discover(start)
        .with_context(|| format!("No git checkout found at or above {}", start.display()))?;
    repo.workdir()
        .map(Path::to_path_buf)
        .context("Orchestrator checkout must not be a bare repository")
}

/// Load `.env` then `.adw/.env` from the checkout root. Missing files are fine.
pub fn load_env_files(root: &Path) {
    for path in [root.join(".env"), root.join(ADW_DIR).join(".env")] {
        if path.exists()
            && let Err(e) = dotenvy::from_path(&path)
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load env file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let toml = AdwToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.orchestrator.timeout_secs, 1800);
        assert_eq!(toml.retry.max_retries, 3);
        assert_eq!(toml.retry.backoff_secs, vec![60, 120, 180]);
        assert_eq!(toml.orchestrator.phases, vec!["plan", "build", "review"]);
        assert_eq!(toml.worktree.max_age_days, 7);
    }

    #[test]
    fn test_parse_partial_file() {
        let toml = AdwToml::parse(
            r#"
            [orchestrator]
            phases = ["plan", "build", "review", "test"]

            [retry]
            max_retries = 5

            [phases.overrides.build]
            timeout_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(toml.orchestrator.timeout_secs, 1800);
        assert_eq!(toml.retry.max_retries, 5);
        assert_eq!(toml.retry.backoff_secs, vec![60, 120, 180]);

        let config = AdwConfig::for_root(Path::new("/repo")).with_toml(toml);
        assert_eq!(config.timeout_for(Phase::Build), Duration::from_secs(3600));
        assert_eq!(config.timeout_for(Phase::Plan), Duration::from_secs(1800));
        assert_eq!(config.pipeline().unwrap().len(), 4);
    }

    #[test]
    fn test_overrides_beat_file() {
        let toml = AdwToml::parse("[project]\nagent_cmd = \"file-agent\"\n").unwrap();
        let overrides = Overrides::from_lookup(|name| match name {
            "ADW_AGENT_CMD" => Some("env-agent".into()),
            "ADW_TIMEOUT_SECS" => Some("5".into()),
            "ADW_MAX_RETRIES" => Some("not-a-number".into()),
            _ => None,
        });
        let config = AdwConfig::for_root(Path::new("/repo"))
            .with_toml(toml)
            .with_overrides(overrides);
        assert_eq!(config.agent_cmd(), "env-agent");
        assert_eq!(config.timeout_for(Phase::Review), Duration::from_secs(5));
        assert_eq!(config.max_retries(), 3);
    }

    #[test]
    fn test_agent_args_default_to_claude_flags() {
        let mut toml = AdwToml::default();
        toml.project.model = Some("opus".into());
        let config = AdwConfig::for_root(Path::new("/repo")).with_toml(toml);
        let args = config.agent_args();
        assert_eq!(args[0], "--dangerously-skip-permissions");
        assert!(args.contains(&"stream-json".to_string()));
        assert_eq!(&args[args.len() - 2..], &["--model".to_string(), "opus".to_string()]);
    }

    #[test]
    fn test_explicit_agent_args_replace_defaults() {
        let toml = AdwToml::parse("[project]\nagent_args = [\"run\"]\n").unwrap();
        let config = AdwConfig::for_root(Path::new("/repo")).with_toml(toml);
        assert_eq!(config.agent_args(), vec!["run".to_string()]);
    }

    #[test]
    fn test_paths() {
        let config = AdwConfig::for_root(Path::new("/repo"));
        assert_eq!(config.worktree_dir(), PathBuf::from("/repo/.adw/trees"));
        assert_eq!(config.runs_dir(), PathBuf::from("/repo/.adw/runs"));
        assert_eq!(config.queue_db(), PathBuf::from("/repo/.adw/queue.db"));

        let toml = AdwToml::parse("[worktree]\ndir = \"trees\"\n").unwrap();
        let config = AdwConfig::for_root(Path::new("/repo")).with_toml(toml);
        assert_eq!(config.worktree_dir(), PathBuf::from("/repo/trees"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let toml = AdwToml::parse(
            r#"
            [orchestrator]
            phases = ["build", "plan"]

            [metrics]
            alert_threshold = 1.5

            [phases.overrides.deploy]
            timeout_secs = 1
            "#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(AdwToml::default().validate().is_empty());
    }

    #[test]
    fn test_discover_root_finds_checkout() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let root = discover_root(&nested).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
