//! Per-run isolated worktrees.
//!
//! Each run gets its own git worktree on a dedicated branch under the managed
//! trees directory. Subprocesses started for a run receive an
//! [`EnvironmentOverlay`] that pins git to that worktree, so nothing a
//! delegated agent does can move the orchestrator's own checkout.
//!
//! Branch and worktree creation go through `git2`; merges and the isolation
//! check shell out to the `git` CLI, the same binary agents use.

mod overlay;

pub use overlay::{EnvironmentOverlay, REDIRECTING_GIT_VARS};

use chrono::{DateTime, Utc};
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use crate::errors::WorktreeError;

const BRANCH_PREFIX: &str = "adw/";
const MAX_SLUG_LEN: usize = 40;

/// An isolated filesystem + git context bound to one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
}

impl WorktreeHandle {
    /// Worktree name as registered with git (the directory name).
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A worktree found under the managed directory.
#[derive(Debug, Clone)]
pub struct ManagedWorktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub modified: Option<SystemTime>,
}

/// Which managed worktrees `cleanup_stale` may remove.
#[derive(Debug, Clone, Default)]
pub struct StalePolicy {
    pub max_age: Duration,
    /// Branches that are never removed
    pub keep: HashSet<String>,
    /// Last recorded activity of the run owning each branch; worktrees
    /// without an entry are aged by their directory's mtime
    pub last_active: HashMap<String, DateTime<Utc>>,
    /// Report candidates without removing them
    pub dry_run: bool,
}

/// A worktree selected by `cleanup_stale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleWorktree {
    pub name: String,
    pub branch: String,
    pub path: PathBuf,
    pub age_secs: u64,
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    root: PathBuf,
    trees_dir: PathBuf,
    base_branch: Option<String>,
}

impl WorktreeManager {
    pub fn new(root: &Path, trees_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            trees_dir: trees_dir.to_path_buf(),
            base_branch: None,
        }
    }

    pub fn with_base_branch(mut self, base_branch: Option<String>) -> Self {
        self.base_branch = base_branch;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self) -> Result<Repository, WorktreeError> {
        Ok(Repository::open(&self.root)?)
    }

    /// Branch currently checked out in the orchestrator's own checkout.
    pub fn current_branch(&self) -> Result<String, WorktreeError> {
        let repo = self.open()?;
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Branch new worktrees are cut from.
    pub fn base_branch(&self) -> Result<String, WorktreeError> {
        match &self.base_branch {
            Some(b) => Ok(b.clone()),
            None => self.current_branch(),
        }
    }

    /// Worktree name and branch for a run: `<slug>-<runId>` and `adw/<slug>-<runId>`.
    pub fn names_for(run_id: &str, source_ref: &str) -> (String, String) {
        let name = format!("{}-{}", slugify(source_ref), run_id);
        let branch = format!("{}{}", BRANCH_PREFIX, name);
        (name, branch)
    }

    /// Allocate a branch and working directory for `run_id`.
    ///
    /// Fails if the directory or branch already exists; a half-created branch
    /// is removed again when the worktree itself cannot be added.
    pub fn create(&self, run_id: &str, source_ref: &str) -> Result<WorktreeHandle, WorktreeError> {
        let (name, branch) = Self::names_for(run_id, source_ref);
        let path = self.trees_dir.join(&name);
        let creation = |reason: String| WorktreeError::Creation {
            path: path.clone(),
            reason,
        };

        if path.exists() {
            return Err(creation("path already exists".into()));
        }

        let repo = self.open().map_err(|e| creation(e.to_string()))?;
        if repo.find_branch(&branch, BranchType::Local).is_ok() {
            return Err(creation(format!("branch '{}' already exists", branch)));
        }
        if repo.find_worktree(&name).is_ok() {
            return Err(creation(format!("worktree '{}' is already registered", name)));
        }

        let base = self.base_branch().map_err(|e| creation(e.to_string()))?;
        let commit = repo
            .revparse_single(&base)
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|e| creation(format!("cannot resolve base '{}': {}", base, e)))?;

        std::fs::create_dir_all(&self.trees_dir).map_err(|e| creation(e.to_string()))?;

        let reference = repo
            .branch(&branch, &commit, false)
            .map_err(|e| creation(format!("branch creation failed: {}", e)))?
            .into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Err(e) = repo.worktree(&name, &path, Some(&opts)) {
            if let Ok(mut b) = repo.find_branch(&branch, BranchType::Local)
                && let Err(del) = b.delete()
            {
                tracing::warn!(branch = %branch, error = %del, "Failed to delete branch of aborted worktree");
            }
            return Err(creation(format!("git worktree add failed: {}", e)));
        }

        let path = path.canonicalize().unwrap_or(path);
        tracing::info!(run_id, branch = %branch, path = %path.display(), base = %base, "Created worktree");

        Ok(WorktreeHandle {
            path,
            branch,
            created_at: Utc::now(),
            alive: true,
        })
    }

    /// Remove the working directory, git metadata and branch. Idempotent.
    pub fn destroy(&self, handle: &WorktreeHandle) -> Result<(), WorktreeError> {
        let repo = self.open()?;
        let name = handle.name();

        if let Ok(wt) = repo.find_worktree(&name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            wt.prune(Some(&mut opts))?;
        }
        if handle.path.exists() {
            std::fs::remove_dir_all(&handle.path)?;
        }
        if let Ok(mut branch) = repo.find_branch(&handle.branch, BranchType::Local) {
            branch.delete()?;
        }

        tracing::info!(branch = %handle.branch, path = %handle.path.display(), "Destroyed worktree");
        Ok(())
    }

    /// The worktree directory and its git registration both exist.
    pub fn exists(&self, handle: &WorktreeHandle) -> bool {
        handle.path.is_dir()
            && self
                .open()
                .map(|repo| repo.find_worktree(&handle.name()).is_ok())
                .unwrap_or(false)
    }

    /// Environment overrides that confine git to the handle's worktree.
    pub fn isolate(&self, handle: &WorktreeHandle) -> Result<EnvironmentOverlay, WorktreeError> {
        let repo = Repository::open(&handle.path)?;
        let git_dir = repo.path().to_path_buf();

        Ok(EnvironmentOverlay::new(&handle.path)
            .with_var("GIT_DIR", git_dir.to_string_lossy())
            .with_var("GIT_WORK_TREE", handle.path.to_string_lossy())
            .with_var("ADW_WORKTREE", handle.path.to_string_lossy())
            .with_var("ADW_BRANCH", handle.branch.clone()))
    }

    /// Exercise the overlay with the git CLI: it must see the worktree branch,
    /// and the orchestrator's own branch must not move.
    pub fn verify_isolation(&self, handle: &WorktreeHandle) -> Result<(), WorktreeError> {
        let before = self.current_branch()?;
        let overlay = self.isolate(handle)?;

        let found = run_git(&overlay, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if found != handle.branch {
            return Err(WorktreeError::IsolationBreach {
                expected: handle.branch.clone(),
                found,
            });
        }

        let after = self.current_branch()?;
        if after != before {
            return Err(WorktreeError::IsolationBreach {
                expected: before,
                found: after,
            });
        }
        Ok(())
    }

    /// Merge `base` into the worktree. Conflicts abort the merge and are
    /// reported, never resolved.
    pub fn sync_with_base(&self, handle: &WorktreeHandle, base: &str) -> Result<(), WorktreeError> {
        let overlay = self.isolate(handle)?;
        let merge = git_command(&overlay, &["merge", "--no-edit", base]).output()?;
        if merge.status.success() {
            tracing::info!(branch = %handle.branch, base, "Synced worktree with base");
            return Ok(());
        }

        let conflicted = run_git(&overlay, &["diff", "--name-only", "--diff-filter=U"])?;
        let files: Vec<String> = conflicted
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        match git_command(&overlay, &["merge", "--abort"]).output() {
            Ok(abort) if !abort.status.success() => tracing::warn!(
                branch = %handle.branch,
                stderr = %String::from_utf8_lossy(&abort.stderr).trim(),
                "git merge --abort failed"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(branch = %handle.branch, error = %e, "git merge --abort failed"),
        }

        if files.is_empty() {
            return Err(WorktreeError::GitCommand {
                command: format!("git merge --no-edit {}", base),
                stderr: String::from_utf8_lossy(&merge.stderr).trim().to_string(),
            });
        }
        Err(WorktreeError::MergeConflict {
            branch: handle.branch.clone(),
            base: base.to_string(),
            files,
        })
    }

    /// Worktrees registered with git that live under the managed directory.
    pub fn list(&self) -> Result<Vec<ManagedWorktree>, WorktreeError> {
        let repo = self.open()?;
        let trees_dir = self
            .trees_dir
            .canonicalize()
            .unwrap_or_else(|_| self.trees_dir.clone());
        let mut managed = Vec::new();

        for name in repo.worktrees()?.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else {
                continue;
            };
            let path = wt.path().canonicalize().unwrap_or_else(|_| wt.path().to_path_buf());
            if !path.starts_with(&trees_dir) {
                continue;
            }
            let branch = Repository::open_from_worktree(&wt)
                .ok()
                .and_then(|r| r.head().ok().and_then(|h| h.shorthand().map(str::to_string)));
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            managed.push(ManagedWorktree {
                name: name.to_string(),
                path,
                branch,
                modified,
            });
        }
        Ok(managed)
    }

    /// Select managed worktrees idle for at least `policy.max_age` and not
    /// kept, and destroy them unless `policy.dry_run` is set.
    pub fn cleanup_stale(&self, policy: &StalePolicy) -> Result<Vec<StaleWorktree>, WorktreeError> {
        let now = Utc::now();
        let mut stale = Vec::new();

        for wt in self.list()? {
            let branch = wt.branch.clone().unwrap_or_default();
            if policy.keep.contains(&branch) {
                continue;
            }
            let last_active = policy
                .last_active
                .get(&branch)
                .copied()
                .or_else(|| wt.modified.map(DateTime::<Utc>::from));
            let age = last_active
                .and_then(|at| (now - at).to_std().ok())
                .unwrap_or_default();
            if age < policy.max_age {
                continue;
            }

            let mut removed = false;
            if !policy.dry_run {
                let handle = WorktreeHandle {
                    path: wt.path.clone(),
                    branch: branch.clone(),
                    created_at: now,
                    alive: true,
                };
                match self.destroy(&handle) {
                    Ok(()) => removed = true,
                    Err(e) => tracing::warn!(name = %wt.name, error = %e, "Failed to remove stale worktree"),
                }
            }
            stale.push(StaleWorktree {
                name: wt.name,
                branch,
                path: wt.path,
                age_secs: age.as_secs(),
                removed,
            });
        }
        Ok(stale)
    }
}

fn git_command(overlay: &EnvironmentOverlay, args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(["-c", "user.name=adw", "-c", "user.email=adw@localhost"])
        .args(args);
    overlay.apply_std(&mut cmd);
    cmd
}

fn run_git(overlay: &EnvironmentOverlay, args: &[&str]) -> Result<String, WorktreeError> {
    let output = git_command(overlay, args).output()?;
    if !output.status.success() {
        return Err(WorktreeError::GitCommand {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Lowercase alphanumerics separated by single dashes.
pub fn slugify(source_ref: &str) -> String {
    let mut slug = String::new();
    for ch in source_ref.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() { "run".to_string() } else { slug }
}
