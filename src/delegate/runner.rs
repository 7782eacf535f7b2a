use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::DelegationError;
use crate::worktree::EnvironmentOverlay;

/// How long the agent's process group gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Variables an agent process may inherit. Everything else is cleared so a
/// delegated agent starts from a fresh context.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_PATH",
    "GH_TOKEN",
    "GITHUB_TOKEN",
];

/// One process launch: the prompt plus where and how to run it.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Delegation label used in logs, e.g. `build`
    pub label: String,
    pub prompt: String,
    pub overlay: Option<EnvironmentOverlay>,
    /// Working directory when no overlay is given
    pub workdir: PathBuf,
    pub extra_env: Vec<(String, String)>,
}

/// What the agent process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl AgentOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Launches an agent for one delegation.
///
/// Implementations must return promptly with `DelegationError::Cancelled`
/// once `cancel` fires, and must not leave the agent running.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, DelegationError>;
}

/// Runs the configured agent CLI with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
        }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).env_clear();
        for key in ENV_ALLOWLIST {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if std::env::var_os("GH_TOKEN").is_none()
            && let Some(pat) = std::env::var_os("GITHUB_PAT")
        {
            cmd.env("GH_TOKEN", pat);
        }
        match &invocation.overlay {
            Some(overlay) => overlay.apply(&mut cmd),
            None => {
                cmd.current_dir(&invocation.workdir);
            }
        }
        cmd.envs(invocation.extra_env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches anything the agent forks.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, DelegationError> {
        let mut child =
            self.build_command(&invocation)
                .spawn()
                .map_err(|source| DelegationError::SpawnFailed {
                    command: self.command.clone(),
                    source,
                })?;
        tracing::debug!(label = %invocation.label, pid = child.id().unwrap_or(0), "Agent spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = invocation.prompt.clone();
            // The agent may exit without reading its prompt.
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| DelegationError::Other(e.into()))?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                tracing::info!(label = %invocation.label, "Agent killed");
                return Err(DelegationError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(AgentOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }
}

/// Stops the agent and every process in its group: SIGTERM, a grace period
/// for the leader to exit, then SIGKILL for whatever is left.
#[cfg(unix)]
async fn terminate(child: &mut tokio::process::Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM to agent process group failed");
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        tracing::warn!(pid, "Agent ignored SIGTERM");
    }
    // Grandchildren may outlive the leader; ESRCH here means the group is gone.
    let _ = killpg(pgid, Signal::SIGKILL);
    if let Err(e) = child.kill().await {
        tracing::debug!(pid, error = %e, "Agent already reaped");
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut tokio::process::Child) {
    let _ = tokio::time::timeout(TERM_GRACE, child.kill()).await;
}
