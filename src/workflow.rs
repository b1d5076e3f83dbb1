//! Workflow definition: the textual graph describing phases, task-loop
//! phases, and labeled transitions.
//!
//! The workflow is loaded from a `workflow.dot` text file and exposed as an
//! immutable, insertion-ordered map from phase name to its transition
//! table. Everything downstream (the scheduler, recovery inference) treats
//! it as pure data. [`WorkflowDefinition::load_cached`] memoizes the parse
//! by path; [`WorkflowDefinition::clear_cache`] drops the memoized copies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, OnceLock};

use regex::Regex;
use thiserror::Error;

/// The reserved transition target meaning "the workflow terminates".
pub const END: &str = "END";

/// The four closed condition labels a transition line may use.
pub const CONDITION_LABELS: [&str; 4] = ["done", "retry", "retry_exhausted", "done_next_subtask"];

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition contains no phases")]
    Empty,
    #[error("failed to read workflow file at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One phase's transition table: condition label -> target phase name,
/// or `None` for the `END` sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseConfig {
    pub task_loop: bool,
    pub transitions: HashMap<String, Option<String>>,
}

impl PhaseConfig {
    pub fn target_for(&self, label: &str) -> Option<&Option<String>> {
        self.transitions.get(label)
    }
}

/// An immutable, insertion-ordered workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowDefinition {
    order: Vec<String>,
    phases: HashMap<String, PhaseConfig>,
}

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*?)([A-Za-z0-9_]+)\s*->\s*([A-Za-z0-9_]+)\s*\[([A-Za-z0-9_]+)\]$").unwrap()
});

/// Keyed by the path it was loaded from, the same ownership pattern as
/// `orchestrator::runner`'s `TRACKED_CHILDREN` registry.
static WORKFLOW_CACHE: OnceLock<Mutex<HashMap<PathBuf, WorkflowDefinition>>> = OnceLock::new();

fn workflow_cache() -> &'static Mutex<HashMap<PathBuf, WorkflowDefinition>> {
    WORKFLOW_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl WorkflowDefinition {
    /// Parse the `workflow.dot` grammar described in the workflow definition
    /// component: `^(\*?)(NAME)\s*->\s*(NAME|END)\s*\[(LABEL)\]$` per
    /// significant line, after stripping `#...` comments and trimming.
    pub fn parse(text: &str) -> Result<Self, WorkflowError> {
        let mut order = Vec::new();
        let mut phases: HashMap<String, PhaseConfig> = HashMap::new();

        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = LINE_RE.captures(line) else {
                continue;
            };
            let is_task_loop = !caps[1].is_empty();
            let source = caps[2].to_string();
            let target_raw = &caps[3];
            let label = caps[4].to_lowercase();
            if !CONDITION_LABELS.contains(&label.as_str()) {
                continue;
            }

            let target = if target_raw == END {
                None
            } else {
                Some(target_raw.to_string())
            };

            if !phases.contains_key(&source) {
                order.push(source.clone());
            }
            let entry = phases.entry(source.clone()).or_default();
            if is_task_loop {
                entry.task_loop = true;
            }
            // Ensure the transition's target phase is registered in
            // first-appearance order even though it is not yet a source.
            if let Some(ref t) = target
                && !phases.contains_key(t)
                && !order.contains(t)
            {
                order.push(t.clone());
            }
            entry.transitions.insert(label, target);
        }

        if order.is_empty() {
            return Err(WorkflowError::Empty);
        }

        // Phases that only ever appear as a transition target (never a
        // source line) still need an entry so lookups don't panic.
        for name in &order {
            phases.entry(name.clone()).or_default();
        }

        Ok(Self { order, phases })
    }

    /// Load from a file on disk, bypassing the cache. Prefer [`Self::load_cached`]
    /// unless a fresh re-read is specifically required.
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// `loadWorkflow()`: load from `path`, caching the parsed definition
    /// keyed by path so repeated calls for the same workflow file don't
    /// re-read and re-parse it. Use [`Self::clear_cache`] to force the next
    /// call to re-read from disk.
    pub fn load_cached(path: &Path) -> Result<Self, WorkflowError> {
        let key = path.to_path_buf();
        if let Some(cached) = workflow_cache().lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let parsed = Self::load(path)?;
        workflow_cache().lock().unwrap().insert(key, parsed.clone());
        Ok(parsed)
    }

    /// `clearCache()`: drops every cached workflow definition.
    pub fn clear_cache() {
        workflow_cache().lock().unwrap().clear();
    }

    pub fn first_phase(&self) -> &str {
        &self.order[0]
    }

    pub fn ordered_phase_names(&self) -> &[String] {
        &self.order
    }

    pub fn is_task_loop_phase(&self, name: &str) -> bool {
        self.phases.get(name).is_some_and(|p| p.task_loop)
    }

    pub fn phase_config(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.get(name)
    }

    pub fn contains_phase(&self, name: &str) -> bool {
        self.phases.contains_key(name)
    }

    /// Index of `name` in the canonical progression, or `None` if unknown.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|p| p == name)
    }

    /// The first phase marked `taskLoop`, if any.
    pub fn first_task_loop_phase(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|name| self.is_task_loop_phase(name))
            .map(|s| s.as_str())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}
