//! Workflow State (component E): the durable record of one run.
//!
//! Persisted as a single pretty-printed JSON blob under
//! `<working_dir>/.cloudforge/state.json`. Owned exclusively by the
//! scheduler; every other component either produces inputs to its update
//! methods or reads it immutably.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StateError;
use crate::signals::{Status, StatusResult};

pub const ARTIFACT_DIR_NAME: &str = ".cloudforge";
pub const STATE_FILE_NAME: &str = "state.json";
const LAST_ERRORS_CAP: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub phase: String,
    pub result: StatusResult,
    pub summary: String,
    pub total_tokens: u64,
}

/// Parameters used only at creation time.
#[derive(Debug, Clone)]
pub struct NewStateOptions {
    pub iteration_cap: u32,
    pub max_phase_retries: u32,
    pub model: Option<String>,
    pub first_phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: Option<String>,
    pub task: String,
    pub current_phase: String,
    pub current_sub_task: u32,
    pub total_sub_tasks: u32,
    pub iteration: u32,
    pub iteration_cap: u32,
    pub max_phase_retries: u32,
    pub phase_retry_count: u32,
    pub model: Option<String>,
    pub total_tokens: TokenTotals,
    pub history: Vec<HistoryEntry>,
    pub completed_phases: Vec<String>,
    pub consecutive_retries: u32,
    pub last_errors: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WorkflowState {
    /// `create(task, opts)` — a fresh state at the workflow's first phase.
    pub fn create(task: impl Into<String>, opts: NewStateOptions) -> Self {
        let now = Utc::now();
        Self {
            session_id: None,
            task: task.into(),
            current_phase: opts.first_phase,
            current_sub_task: 0,
            total_sub_tasks: 0,
            iteration: 0,
            iteration_cap: opts.iteration_cap,
            max_phase_retries: opts.max_phase_retries,
            phase_retry_count: 0,
            model: opts.model,
            total_tokens: TokenTotals::default(),
            history: Vec::new(),
            completed_phases: Vec::new(),
            consecutive_retries: 0,
            last_errors: VecDeque::new(),
            started_at: now,
            last_activity: now,
        }
    }

    pub fn artifact_dir(working_dir: &Path) -> PathBuf {
        working_dir.join(ARTIFACT_DIR_NAME)
    }

    fn state_path(working_dir: &Path) -> PathBuf {
        Self::artifact_dir(working_dir).join(STATE_FILE_NAME)
    }

    /// Pretty-print to `<working_dir>/.cloudforge/state.json`, refreshing
    /// `last_activity` and creating the artifact directory if absent.
    pub fn save(&mut self, working_dir: &Path) -> Result<(), StateError> {
        self.last_activity = Utc::now();
        let dir = Self::artifact_dir(working_dir);
        std::fs::create_dir_all(&dir).map_err(|source| StateError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        let path = Self::state_path(working_dir);
        let json = serde_json::to_string_pretty(self).expect("state always serializes");
        std::fs::write(&path, json).map_err(|source| StateError::Write { path, source })
    }

    /// `load(dir) -> State | None`. Returns `Ok(None)` when the file simply
    /// does not exist; any I/O or parse error is returned as `Err` (callers
    /// that want the "never throws" contract of `tryLoadState` should use
    /// [`crate::recovery::try_load_state`] instead, which converts both
    /// cases to `None`).
    pub fn load(working_dir: &Path) -> Result<Option<Self>, StateError> {
        let path = Self::state_path(working_dir);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.clone(),
            source,
        })?;
        let state = serde_json::from_str(&text).map_err(StateError::Malformed)?;
        Ok(Some(state))
    }

    /// Increments `iteration`, appends a history entry, and adds token
    /// deltas to the running totals. A `None` status yields `"UNKNOWN"`.
    pub fn record_iteration(
        &mut self,
        phase: &str,
        status: Option<&Status>,
        tokens: Option<(u64, u64)>,
    ) {
        self.iteration += 1;
        let (input, output) = tokens.unwrap_or((0, 0));
        self.total_tokens.input += input;
        self.total_tokens.output += output;

        let (result, summary) = match status {
            Some(s) => (s.result, s.summary.clone()),
            None => (StatusResult::Unknown, String::new()),
        };

        self.history.push(HistoryEntry {
            iteration: self.iteration,
            phase: phase.to_string(),
            result,
            summary,
            total_tokens: input + output,
        });
    }

    /// If the most recent history entry was `NEEDS_RETRY`, increments
    /// `consecutive_retries`; otherwise resets it to 0. Appends `err_msg`
    /// to the bounded `last_errors` ring when present.
    pub fn track_retry(&mut self, err_msg: Option<String>) {
        let was_retry = self
            .history
            .last()
            .is_some_and(|h| h.result == StatusResult::NeedsRetry);

        if was_retry {
            self.consecutive_retries += 1;
        } else {
            self.consecutive_retries = 0;
        }

        if let Some(msg) = err_msg {
            self.last_errors.push_back(msg);
            while self.last_errors.len() > LAST_ERRORS_CAP {
                self.last_errors.pop_front();
            }
        }
    }

    /// Adds `phase` to `completed_phases` if not already present and resets
    /// `consecutive_retries`.
    pub fn mark_phase_completed(&mut self, phase: &str) {
        if !self.completed_phases.iter().any(|p| p == phase) {
            self.completed_phases.push(phase.to_string());
        }
        self.consecutive_retries = 0;
    }

    /// Clears all three phase-transition-scoped counters: `phase_retry_count`,
    /// `consecutive_retries`, `last_errors`. Called whenever the scheduler
    /// moves to a phase different from `current_phase`.
    pub fn reset_transition_counters(&mut self) {
        self.phase_retry_count = 0;
        self.consecutive_retries = 0;
        self.last_errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> NewStateOptions {
        NewStateOptions {
            iteration_cap: 25,
            max_phase_retries: 3,
            model: None,
            first_phase: "DISCOVER".to_string(),
        }
    }

    #[test]
    fn create_starts_at_iteration_zero_with_first_phase() {
        let state = WorkflowState::create("build a thing", opts());
        assert_eq!(state.iteration, 0);
        assert_eq!(state.current_phase, "DISCOVER");
        assert!(state.completed_phases.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let mut state = WorkflowState::create("round trip me", opts());
        state.record_iteration("DISCOVER", None, Some((10, 20)));
        state.save(dir.path()).unwrap();

        let loaded = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.task, "round trip me");
        assert_eq!(loaded.iteration, 1);
        assert_eq!(loaded.total_tokens, TokenTotals { input: 10, output: 20 });
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempdir().unwrap();
        assert!(WorkflowState::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn record_iteration_without_status_yields_unknown() {
        let mut state = WorkflowState::create("t", opts());
        state.record_iteration("DISCOVER", None, None);
        assert_eq!(state.history[0].result, StatusResult::Unknown);
    }

    #[test]
    fn record_iteration_increments_and_appends_history() {
        let mut state = WorkflowState::create("t", opts());
        let status = Status {
            phase: None,
            result: StatusResult::Done,
            tasks_remaining: None,
            summary: "ok".into(),
        };
        state.record_iteration("DISCOVER", Some(&status), Some((5, 5)));
        state.record_iteration("DISCOVER", Some(&status), Some((5, 5)));
        assert_eq!(state.iteration, 2);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.total_tokens.input, 10);
    }

    #[test]
    fn track_retry_increments_on_needs_retry_then_resets_on_done() {
        let mut state = WorkflowState::create("t", opts());
        let retry_status = Status {
            phase: None,
            result: StatusResult::NeedsRetry,
            tasks_remaining: None,
            summary: String::new(),
        };
        state.record_iteration("B", Some(&retry_status), None);
        state.track_retry(Some("boom".into()));
        state.record_iteration("B", Some(&retry_status), None);
        state.track_retry(Some("boom again".into()));
        assert_eq!(state.consecutive_retries, 2);
        assert_eq!(state.last_errors.len(), 2);

        let done_status = Status {
            phase: None,
            result: StatusResult::Done,
            tasks_remaining: None,
            summary: String::new(),
        };
        state.record_iteration("B", Some(&done_status), None);
        state.track_retry(None);
        assert_eq!(state.consecutive_retries, 0);
    }

    #[test]
    fn last_errors_caps_at_five() {
        let mut state = WorkflowState::create("t", opts());
        let retry_status = Status {
            phase: None,
            result: StatusResult::NeedsRetry,
            tasks_remaining: None,
            summary: String::new(),
        };
        for i in 0..8 {
            state.record_iteration("B", Some(&retry_status), None);
            state.track_retry(Some(format!("err {i}")));
        }
        assert_eq!(state.last_errors.len(), 5);
        assert_eq!(state.last_errors.front().unwrap(), "err 3");
    }

    #[test]
    fn mark_phase_completed_is_idempotent_and_resets_consecutive_retries() {
        let mut state = WorkflowState::create("t", opts());
        state.consecutive_retries = 2;
        state.mark_phase_completed("DISCOVER");
        state.mark_phase_completed("DISCOVER");
        assert_eq!(state.completed_phases, vec!["DISCOVER".to_string()]);
        assert_eq!(state.consecutive_retries, 0);
    }

    #[test]
    fn reset_transition_counters_clears_all_three() {
        let mut state = WorkflowState::create("t", opts());
        state.phase_retry_count = 2;
        state.consecutive_retries = 2;
        state.last_errors.push_back("x".into());
        state.reset_transition_counters();
        assert_eq!(state.phase_retry_count, 0);
        assert_eq!(state.consecutive_retries, 0);
        assert!(state.last_errors.is_empty());
    }
}
