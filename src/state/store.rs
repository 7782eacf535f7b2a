use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

use super::lock::RunLock;
use super::model::{AppendOutcome, Checkpoint, ExecutionState};
use crate::errors::StateError;
use crate::phase::RunStatus;

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";
const EVENT_CAPACITY: usize = 256;

/// Change notifications for observers such as the metrics collector.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    CheckpointAppended {
        run_id: String,
        checkpoint: Checkpoint,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

/// Runs found on disk, split into readable and corrupt records.
#[derive(Debug, Default)]
pub struct Scan {
    pub runs: Vec<ExecutionState>,
    pub corrupt: Vec<(String, StateError)>,
}

/// Durable per-run state records under `<runs_dir>/<runId>/state.json`.
///
/// Every write goes to a temp file that is fsynced and renamed over the
/// record, so a crash leaves either the old or the new record intact.
#[derive(Debug, Clone)]
pub struct StateStore {
    runs_dir: PathBuf,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    pub fn new(runs_dir: &Path) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            runs_dir: runs_dir.to_path_buf(),
            events,
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    /// Directory for prompts and raw agent output of a run.
    pub fn log_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("logs")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn lock(&self, run_id: &str) -> Result<RunLock, StateError> {
        RunLock::acquire(&self.run_dir(run_id).join(LOCK_FILE), run_id)
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.state_path(run_id).exists()
    }

    /// Persist a brand-new run; fails if the run ID is taken.
    pub fn create(&self, state: &ExecutionState) -> Result<(), StateError> {
        if self.exists(&state.run_id) {
            return Err(StateError::AlreadyExists {
                run_id: state.run_id.clone(),
            });
        }
        self.write(state)
    }

    pub fn load(&self, run_id: &str) -> Result<ExecutionState, StateError> {
        let path = self.state_path(run_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };

        let state: ExecutionState =
            serde_json::from_str(&content).map_err(|e| StateError::Corruption {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if state.run_id != run_id {
            return Err(StateError::Corruption {
                path,
                reason: format!("record belongs to run {}", state.run_id),
            });
        }
        state
            .validate()
            .map_err(|reason| StateError::Corruption { path, reason })?;
        Ok(state)
    }

    /// Atomically replace the record. The persisted checkpoint log must be a
    /// prefix of `state.checkpoints`; anything else would rewrite history.
    pub fn save(&self, state: &ExecutionState) -> Result<(), StateError> {
        let previous = match self.load(&state.run_id) {
            Ok(previous) => Some(previous),
            Err(StateError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(prev) = &previous {
            let extends = prev.checkpoints.len() <= state.checkpoints.len()
                && prev
                    .checkpoints
                    .iter()
                    .zip(&state.checkpoints)
                    .all(|(a, b)| a.digest == b.digest && a.seq == b.seq);
            if !extends {
                return Err(StateError::CheckpointRewrite {
                    run_id: state.run_id.clone(),
                    persisted: prev.checkpoints.len(),
                    proposed: state.checkpoints.len(),
                });
            }
        }

        self.write(state)?;

        let was_terminal = previous.as_ref().is_some_and(|p| p.terminal);
        if state.terminal && !was_terminal {
            let _ = self.events.send(StoreEvent::RunFinished {
                run_id: state.run_id.clone(),
                status: state.phase,
                at: state.updated_at,
            });
        }
        Ok(())
    }

    /// Append one checkpoint to the persisted log. Replaying a checkpoint
    /// that is already logged is a no-op reported as `Duplicate`.
    pub fn append_checkpoint(
        &self,
        run_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<AppendOutcome, StateError> {
        let mut state = self.load(run_id)?;
        let outcome = state.push_checkpoint(checkpoint);
        if let AppendOutcome::Appended { seq } = outcome {
            self.write(&state)?;
            if let Some(stored) = state.checkpoints.iter().find(|c| c.seq == seq) {
                let _ = self.events.send(StoreEvent::CheckpointAppended {
                    run_id: run_id.to_string(),
                    checkpoint: stored.clone(),
                });
            }
            tracing::debug!(run_id, seq, "Checkpoint appended");
        } else {
            tracing::debug!(run_id, seq = outcome.seq(), "Checkpoint already logged");
        }
        Ok(outcome)
    }

    /// Every run directory, readable or not.
    pub fn scan(&self) -> Result<Scan, StateError> {
        let mut scan = Scan::default();
        let entries = match fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.runs_dir.clone(),
                    source,
                });
            }
        };

        for entry in entries.flatten() {
            let run_id = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().join(STATE_FILE).exists() {
                continue;
            }
            match self.load(&run_id) {
                Ok(state) => scan.runs.push(state),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable run record");
                    scan.corrupt.push((run_id, e));
                }
            }
        }
        scan.runs.sort_by_key(|s| s.created_at);
        Ok(scan)
    }

    pub fn list(&self) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self.scan()?.runs)
    }

    /// Non-terminal runs: candidates for the recovery sweep.
    pub fn list_active(&self) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| !s.terminal)
            .collect())
    }

    fn write(&self, state: &ExecutionState) -> Result<(), StateError> {
        let path = self.state_path(&state.run_id);
        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        write_atomic(&path, &json).map_err(|source| StateError::Io { path, source })
    }
}

/// Write `bytes` to `path` via a synced temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    fs::create_dir_all(dir)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = dir.join(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Outcome, Phase};
    use tempfile::tempdir;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(&dir.join("runs"))
    }

    fn new_state(run_id: &str) -> ExecutionState {
        ExecutionState::with_run_id(run_id, "issue-1", Phase::default_pipeline())
    }

    #[test]
    fn test_create_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = new_state("abcd1234");
        store.create(&state).unwrap();
        assert_eq!(store.load("abcd1234").unwrap(), state);

        let err = store.create(&state).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists { .. }));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = store(dir.path()).load("nope").unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    #[test]
    fn test_corrupt_record_is_never_repaired() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.state_path("abcd1234");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let err = store.load("abcd1234").unwrap_err();
        assert!(matches!(err, StateError::Corruption { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_crash_mid_write_leaves_previous_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&new_state("abcd1234")).unwrap();
        store
            .append_checkpoint("abcd1234", Checkpoint::new(Phase::Plan, 1, Outcome::Success))
            .unwrap();

        // A crash between writing the temp file and the rename.
        let tmp = store.run_dir("abcd1234").join("state.json.tmp");
        fs::write(&tmp, "{\"truncated\":").unwrap();

        let state = store.load("abcd1234").unwrap();
        assert_eq!(state.checkpoints.len(), 1);

        store
            .append_checkpoint("abcd1234", Checkpoint::new(Phase::Build, 1, Outcome::Success))
            .unwrap();
        assert_eq!(store.load("abcd1234").unwrap().checkpoints.len(), 2);
        assert!(!tmp.exists());
    }

    #[test]
    fn test_append_replay_after_crash_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&new_state("abcd1234")).unwrap();
        let cp = Checkpoint::new(Phase::Plan, 1, Outcome::Success)
            .with_artifacts([("plan_file".to_string(), "specs/plan.md".to_string())].into());

        let first = store.append_checkpoint("abcd1234", cp.clone()).unwrap();
        let replay = store.append_checkpoint("abcd1234", cp).unwrap();
        assert_eq!(first, AppendOutcome::Appended { seq: 1 });
        assert_eq!(replay, AppendOutcome::Duplicate { seq: 1 });
        assert_eq!(store.load("abcd1234").unwrap().checkpoints.len(), 1);
    }

    #[test]
    fn test_save_refuses_checkpoint_rewrite() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&new_state("abcd1234")).unwrap();
        store
            .append_checkpoint("abcd1234", Checkpoint::new(Phase::Plan, 1, Outcome::Success))
            .unwrap();

        let mut stale_copy = new_state("abcd1234");
        stale_copy.created_at = store.load("abcd1234").unwrap().created_at;
        let err = store.save(&stale_copy).unwrap_err();
        assert!(matches!(err, StateError::CheckpointRewrite { .. }));

        let mut current = store.load("abcd1234").unwrap();
        current.push_checkpoint(Checkpoint::new(Phase::Build, 1, Outcome::Success));
        store.save(&current).unwrap();
    }

    #[test]
    fn test_list_active_skips_terminal_and_corrupt() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create(&new_state("aaaa1111")).unwrap();
        let mut done = new_state("bbbb2222");
        done.phase = RunStatus::Completed;
        done.terminal = true;
        store.create(&done).unwrap();
        let bad = store.state_path("cccc3333");
        fs::create_dir_all(bad.parent().unwrap()).unwrap();
        fs::write(&bad, "[]").unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, "aaaa1111");

        let scan = store.scan().unwrap();
        assert_eq!(scan.runs.len(), 2);
        assert_eq!(scan.corrupt.len(), 1);
        assert_eq!(scan.corrupt[0].0, "cccc3333");
    }

    #[test]
    fn test_list_on_fresh_store_is_empty() {
        let dir = tempdir().unwrap();
        assert!(store(dir.path()).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut rx = store.subscribe();
        let mut state = new_state("abcd1234");
        store.create(&state).unwrap();
        store
            .append_checkpoint("abcd1234", Checkpoint::new(Phase::Plan, 1, Outcome::Success))
            .unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::CheckpointAppended { run_id, checkpoint } => {
                assert_eq!(run_id, "abcd1234");
                assert_eq!(checkpoint.seq, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }

        state = store.load("abcd1234").unwrap();
        state.park(crate::errors::FailureKind::PhaseFailure, "boom", None);
        store.save(&state).unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::RunFinished {
                status: RunStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_lock_is_exclusive_per_run() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let _held = store.lock("abcd1234").unwrap();
        assert!(matches!(
            store.lock("abcd1234").unwrap_err(),
            StateError::Locked { .. }
        ));
        assert!(store.lock("ffff0000").is_ok());
    }
}
