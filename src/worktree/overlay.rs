use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Variables that can redirect git at a different repository or index.
/// They are stripped from every subprocess run inside a worktree.
pub const REDIRECTING_GIT_VARS: &[&str] = &[
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_OBJECT_DIRECTORY",
    "GIT_ALTERNATE_OBJECT_DIRECTORIES",
    "GIT_COMMON_DIR",
    "GIT_NAMESPACE",
    "GIT_PREFIX",
    "GIT_CEILING_DIRECTORIES",
];

/// Process-environment overrides that pin a subprocess to one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    cwd: PathBuf,
    set: BTreeMap<String, String>,
    remove: Vec<String>,
}

impl EnvironmentOverlay {
    pub fn new(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            set: BTreeMap::new(),
            remove: REDIRECTING_GIT_VARS.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn with_var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.remove.retain(|k| k != key);
        self.set.insert(key.to_string(), value.into());
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.set.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.set.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn removed(&self) -> &[String] {
        &self.remove
    }

    /// Apply to an async subprocess.
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        for key in &self.remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.set).current_dir(&self.cwd);
    }

    /// Apply to a blocking subprocess.
    pub fn apply_std(&self, cmd: &mut std::process::Command) {
        for key in &self.remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.set).current_dir(&self.cwd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_var_overrides_removal() {
        let overlay = EnvironmentOverlay::new(Path::new("/tmp/wt"))
            .with_var("GIT_DIR", "/repo/.git/worktrees/wt")
            .with_var("ADW_RUN_ID", "abcd1234");
        assert_eq!(overlay.get("GIT_DIR"), Some("/repo/.git/worktrees/wt"));
        assert!(!overlay.removed().iter().any(|k| k == "GIT_DIR"));
        assert!(overlay.removed().iter().any(|k| k == "GIT_INDEX_FILE"));
        assert_eq!(overlay.vars().count(), 2);
    }

    #[test]
    fn test_apply_std_sets_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = EnvironmentOverlay::new(dir.path()).with_var("ADW_MARKER", "42");
        let mut cmd = std::process::Command::new("sh");
        cmd.args(["-c", "echo $ADW_MARKER; pwd"]);
        overlay.apply_std(&mut cmd);
        let out = cmd.output().unwrap();
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(stdout.starts_with("42"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.contains(canonical.to_str().unwrap()));
    }
}
