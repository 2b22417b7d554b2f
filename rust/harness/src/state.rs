//! Run state tracking and persistence.
//!
//! Records the phase and the last completed stage of an experiment in
//! `<dir>/state.json` so an interrupted run can be resumed and inspected.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Name of the state file inside the experiment directory.
pub const STATE_FILE: &str = "state.json";

/// Status of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run has not started yet.
    #[default]
    Pending,
    /// Run is currently executing.
    Running,
    /// Run finished every stage.
    Completed,
    /// Run stopped early at the requested exit stage.
    Exited,
    /// Run aborted on an error.
    Failed,
}

/// Where in its lifecycle the scheduler is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Init,
    Iterating,
    Combining,
    EstimatingPriors,
    CleaningUp,
    Done,
    Aborted,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Iterating => "iterating",
            Self::Combining => "combining",
            Self::EstimatingPriors => "estimating priors",
            Self::CleaningUp => "cleaning up",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Persistent state of one experiment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunState {
    pub status: RunStatus,
    pub phase: Phase,
    /// Iteration count, once the plan is known.
    pub num_iters: Option<usize>,
    /// Ordinal of the last stage that completed.
    pub last_stage: Option<i64>,
    /// Process ID when running (for crash detection).
    pub pid: Option<u32>,
    /// Number of times the run was started.
    #[serde(default)]
    pub attempts: u32,
    /// Error messages from failures.
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl RunState {
    /// Stage ordinal to resume from: the one after the last completed stage.
    #[must_use]
    pub fn resume_stage(&self) -> Option<i64> {
        self.last_stage.map(|stage| stage + 1)
    }
}

/// Manages state persistence with file locking.
pub struct StateManager {
    /// Path to the state file.
    pub path: PathBuf,
}

impl StateManager {
    /// Create a new state manager for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// State manager for the experiment in `dir`.
    #[must_use]
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE))
    }

    /// Load state from file, or create empty state if file doesn't exist.
    pub fn load(&self) -> Result<RunState, StateError> {
        if !self.path.exists() {
            return Ok(RunState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let reader = BufReader::new(&file);
        let state = serde_json::from_reader(reader)
            .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Save state to file with exclusive lock.
    pub fn save(&self, state: &RunState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = File::create(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(())
    }

    /// Update state atomically with a closure (holds lock for entire operation).
    pub fn update<F>(&self, f: F) -> Result<RunState, StateError>
    where
        F: FnOnce(&mut RunState),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let mut state: RunState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            let reader = BufReader::new(&file);
            serde_json::from_reader(reader)
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            RunState::default()
        };

        f(&mut state);

        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Mark the run as started by this process.
    pub fn mark_started(&self, pid: u32) -> Result<(), StateError> {
        self.update(|run| {
            run.status = RunStatus::Running;
            run.phase = Phase::Init;
            run.pid = Some(pid);
            run.attempts += 1;
            run.started_at = Some(now_timestamp());
            run.finished_at = None;
        })?;
        Ok(())
    }

    pub fn mark_phase(&self, phase: Phase) -> Result<(), StateError> {
        self.update(|run| run.phase = phase)?;
        Ok(())
    }

    pub fn set_num_iters(&self, num_iters: usize) -> Result<(), StateError> {
        self.update(|run| run.num_iters = Some(num_iters))?;
        Ok(())
    }

    /// Record that the stage with `ordinal` finished.
    pub fn mark_stage_completed(&self, ordinal: i64) -> Result<(), StateError> {
        self.update(|run| run.last_stage = Some(ordinal))?;
        Ok(())
    }

    pub fn mark_completed(&self) -> Result<(), StateError> {
        self.update(|run| {
            run.status = RunStatus::Completed;
            run.phase = Phase::Done;
            run.pid = None;
            run.finished_at = Some(now_timestamp());
        })?;
        Ok(())
    }

    /// Mark the run as stopped before iteration `iter`.
    pub fn mark_exited(&self, iter: usize) -> Result<(), StateError> {
        self.update(|run| {
            run.status = RunStatus::Exited;
            run.pid = None;
            run.errors.push(format!("Exited before iteration {iter}"));
            run.finished_at = Some(now_timestamp());
        })?;
        Ok(())
    }

    pub fn mark_failed(&self, error: &str) -> Result<(), StateError> {
        self.update(|run| {
            run.status = RunStatus::Failed;
            run.phase = Phase::Aborted;
            run.pid = None;
            run.errors.push(error.to_string());
            run.finished_at = Some(now_timestamp());
        })?;
        Ok(())
    }

    /// Reset the run to pending, forgetting progress.
    pub fn reset(&self) -> Result<(), StateError> {
        self.update(|run| *run = RunState::default())?;
        Ok(())
    }

    /// Detect a crashed run (status=Running but PID dead) and mark it failed.
    /// Returns whether a crash was recovered.
    pub fn recover_crashed(&self) -> Result<bool, StateError> {
        let mut crashed = false;

        self.update(|run| {
            if run.status == RunStatus::Running && !run.pid.is_some_and(is_process_alive) {
                run.status = RunStatus::Failed;
                run.phase = Phase::Aborted;
                run.pid = None;
                run.errors
                    .push("Process crashed or harness restarted".to_string());
                crashed = true;
            }
        })?;

        Ok(crashed)
    }
}

/// Check if a process is alive by PID.
fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // SAFETY: kill with signal 0 is safe and just checks process existence
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        panic!("Non-Unix platform not supported")
    }
}

/// Get current local time as a display timestamp.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with state management.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_file_is_pending() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());
        let state = manager.load().unwrap();
        assert_eq!(state.status, RunStatus::Pending);
        assert_eq!(state.resume_stage(), None);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());

        let state = RunState {
            num_iters: Some(13),
            last_stage: Some(4),
            ..RunState::default()
        };
        manager.save(&state).unwrap();

        assert_eq!(manager.load().unwrap(), state);
        assert!(dir.path().join(STATE_FILE).is_file());
    }

    #[test]
    fn test_stage_progress_and_resume() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());

        manager.mark_started(12345).unwrap();
        manager.set_num_iters(13).unwrap();
        manager.mark_phase(Phase::Iterating).unwrap();
        for ordinal in -4..=5 {
            manager.mark_stage_completed(ordinal).unwrap();
        }

        let state = manager.load().unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.phase, Phase::Iterating);
        assert_eq!(state.pid, Some(12345));
        assert_eq!(state.attempts, 1);
        assert_eq!(state.resume_stage(), Some(6));
    }

    #[test]
    fn test_failed_then_reset() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());

        manager.mark_started(1).unwrap();
        manager.mark_failed("train exited with code 1").unwrap();
        let state = manager.load().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.phase, Phase::Aborted);
        assert_eq!(state.errors, vec!["train exited with code 1".to_string()]);
        assert_eq!(state.pid, None);

        manager.reset().unwrap();
        assert_eq!(manager.load().unwrap(), RunState::default());
    }

    #[test]
    fn test_recover_crashed_run() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());

        // PIDs above the kernel limit can never be alive.
        manager.mark_started(i32::MAX as u32).unwrap();
        assert!(manager.recover_crashed().unwrap());
        let state = manager.load().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(!manager.recover_crashed().unwrap());
    }

    #[test]
    fn test_own_process_is_not_crashed() {
        let dir = tempdir().unwrap();
        let manager = StateManager::for_dir(dir.path());

        manager.mark_started(std::process::id()).unwrap();
        assert!(!manager.recover_crashed().unwrap());
        assert_eq!(manager.load().unwrap().status, RunStatus::Running);
    }
}
