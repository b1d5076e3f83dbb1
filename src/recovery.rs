//! Recovery / Repair (component G): reconstruct or normalize durable state
//! from the artifact directory when the state file is missing or corrupt.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::RecoveryError;
use crate::orchestrator::state::{NewStateOptions, WorkflowState, ARTIFACT_DIR_NAME, STATE_FILE_NAME};
use crate::workflow::WorkflowDefinition;

/// Basename -> phase name, in the order a well-behaved workflow produces
/// them. Only used during artifact-based recovery inference.
const ARTIFACT_PHASE_MAP: &[(&str, &str)] = &[
    ("requirements.md", "REQUIREMENTS"),
    ("domain.md", "DOMAIN"),
    ("stories.md", "STORIES"),
    ("plan.md", "PLAN"),
    ("bdd-scenarios.md", "BDD"),
    ("quality-report.md", "QUALITY"),
    ("innovation-log.md", "INNOVATION"),
];

static TASK_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""task"\s*:\s*"((?:\\.|[^"\\])*)""#).unwrap());

static MARKDOWN_H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+?)\s*$").unwrap());

static SUB_TASK_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##\s+Sub-task\s+(\d+)").unwrap());

pub fn has_artifact_dir(working_dir: &Path) -> bool {
    let dir = working_dir.join(ARTIFACT_DIR_NAME);
    dir.is_dir()
}

/// The phase whose completion produces `basename`, per [`ARTIFACT_PHASE_MAP`].
pub fn phase_for_artifact(basename: &str) -> Option<&'static str> {
    ARTIFACT_PHASE_MAP
        .iter()
        .find(|(b, _)| *b == basename)
        .map(|(_, phase)| *phase)
}

/// Coerces per-field corruption in a decoded state JSON object before it is
/// handed to `serde_json::from_value`, so one malformed field (wrong type,
/// missing, or an unparseable timestamp) doesn't discard the whole file the
/// way a single failed `serde_json::from_str` would.
fn normalize_state_json(value: serde_json::Value) -> serde_json::Value {
    use serde_json::{json, Map, Value};

    let Value::Object(mut map) = value else {
        return json!({});
    };

    let ensure_array = |map: &mut Map<String, Value>, key: &str| {
        if !map.get(key).is_some_and(Value::is_array) {
            map.insert(key.to_string(), json!([]));
        }
    };
    ensure_array(&mut map, "history");
    ensure_array(&mut map, "completed_phases");
    ensure_array(&mut map, "last_errors");

    let ensure_u64 = |map: &mut Map<String, Value>, key: &str| {
        if !map.get(key).is_some_and(Value::is_u64) {
            map.insert(key.to_string(), json!(0));
        }
    };
    for key in [
        "current_sub_task",
        "total_sub_tasks",
        "consecutive_retries",
        "iteration",
        "iteration_cap",
        "max_phase_retries",
        "phase_retry_count",
    ] {
        ensure_u64(&mut map, key);
    }

    match map.get_mut("total_tokens").and_then(Value::as_object_mut) {
        Some(tokens) => {
            ensure_u64(tokens, "input");
            ensure_u64(tokens, "output");
        }
        None => {
            map.insert("total_tokens".to_string(), json!({"input": 0, "output": 0}));
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    for key in ["started_at", "last_activity"] {
        let valid = map
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok());
        if !valid {
            map.insert(key.to_string(), json!(now));
        }
    }

    if !map.get("current_phase").is_some_and(Value::is_string) {
        map.insert("current_phase".to_string(), json!(""));
    }
    if !map.get("task").is_some_and(Value::is_string) {
        map.insert("task".to_string(), json!(""));
    }
    for key in ["session_id", "model"] {
        let ok = map.get(key).is_some_and(|v| v.is_string() || v.is_null());
        if !ok {
            map.insert(key.to_string(), Value::Null);
        }
    }

    Value::Object(map)
}

/// Loads state the way [`WorkflowState::load`] does, but tolerates
/// per-field corruption (wrong types, missing fields, unparseable
/// timestamps) by coercing those fields to their repaired defaults instead
/// of discarding the whole file. Still `None` for a missing file, or one
/// that isn't even a JSON object.
pub fn load_state_lenient(working_dir: &Path) -> Option<WorkflowState> {
    let path = working_dir.join(ARTIFACT_DIR_NAME).join(STATE_FILE_NAME);
    let text = std::fs::read_to_string(&path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(normalize_state_json(value)).ok()
}

/// Never fails: any read or parse error, or a missing/empty `task` field,
/// is folded into `None`.
pub fn try_load_state(working_dir: &Path) -> Option<WorkflowState> {
    let state = load_state_lenient(working_dir)?;
    if state.task.trim().is_empty() {
        return None;
    }
    Some(state)
}

fn unescape_json_string(raw: &str) -> String {
    raw.replace("\\\"", "\"").replace("\\\\", "\\")
}

fn first_markdown_heading(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    MARKDOWN_H1_RE
        .captures(&text)
        .map(|caps| caps[1].trim().to_string())
}

/// Priority order: corrupt-state `"task"` field, then `requirements.md`,
/// `stories.md`, then the lexicographically first `*.md` under `prd/`.
pub fn infer_task_from_artifacts(working_dir: &Path) -> Option<String> {
    let dir = working_dir.join(ARTIFACT_DIR_NAME);

    let state_path = dir.join("state.json");
    if let Ok(raw) = std::fs::read_to_string(&state_path)
        && let Some(caps) = TASK_FIELD_RE.captures(&raw)
    {
        let task = unescape_json_string(&caps[1]);
        if !task.trim().is_empty() {
            return Some(task);
        }
    }

    if let Some(heading) = first_markdown_heading(&dir.join("requirements.md")) {
        return Some(heading);
    }
    if let Some(heading) = first_markdown_heading(&dir.join("stories.md")) {
        return Some(heading);
    }

    let prd_dir = dir.join("prd");
    if let Ok(mut entries) = std::fs::read_dir(&prd_dir) {
        let mut names: Vec<PathBuf> = entries
            .by_ref()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        names.sort();
        for path in names {
            if let Some(heading) = first_markdown_heading(&path) {
                return Some(heading);
            }
        }
    }

    None
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferredProgress {
    pub completed_phases: Vec<String>,
    pub latest_detected_phase: Option<String>,
}

/// Scans the artifact directory against [`ARTIFACT_PHASE_MAP`] and the
/// `prd/` directory convention, then derives which phases are fully
/// complete versus which one is merely the furthest detected (and should be
/// re-run).
pub fn infer_completed_phases(working_dir: &Path, ordered: &[String]) -> InferredProgress {
    let dir = working_dir.join(ARTIFACT_DIR_NAME);
    let mut detected_indices = Vec::new();

    for (basename, phase) in ARTIFACT_PHASE_MAP {
        let path = dir.join(basename);
        let non_empty = std::fs::metadata(&path).is_ok_and(|m| m.len() > 0);
        if non_empty && let Some(idx) = ordered.iter().position(|p| p == phase) {
            detected_indices.push(idx);
        }
    }

    let prd_dir = dir.join("prd");
    let prd_has_files = std::fs::read_dir(&prd_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if prd_has_files && !ordered.is_empty() {
        detected_indices.push(0);
    }

    let Some(&latest_index) = detected_indices.iter().max() else {
        return InferredProgress::default();
    };

    InferredProgress {
        completed_phases: ordered[..latest_index].to_vec(),
        latest_detected_phase: ordered.get(latest_index).cloned(),
    }
}

/// Resume at the latest detected (re-run) phase if any; else the phase
/// after the furthest completed one (wrapping to the first phase if every
/// phase is complete); else the first phase.
pub fn infer_resume_phase(progress: &InferredProgress, ordered: &[String]) -> String {
    if let Some(phase) = &progress.latest_detected_phase {
        return phase.clone();
    }
    if let Some(last_completed) = progress.completed_phases.last() {
        let idx = ordered.iter().position(|p| p == last_completed).unwrap_or(0);
        return ordered.get(idx + 1).cloned().unwrap_or_else(|| ordered[0].clone());
    }
    ordered[0].clone()
}

fn count_sub_task_headings(plan_path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(plan_path).ok()?;
    let count = SUB_TASK_HEADING_RE.find_iter(&text).count() as u32;
    if count == 0 { None } else { Some(count) }
}

/// Compose the inference steps into a fresh [`WorkflowState`]. Fails only
/// when no task description can be inferred from any artifact.
pub fn recover_state_from_artifacts(
    working_dir: &Path,
    workflow: &WorkflowDefinition,
    opts: NewStateOptions,
) -> Result<WorkflowState, RecoveryError> {
    let task = infer_task_from_artifacts(working_dir).ok_or(RecoveryError::NoTaskInferred)?;

    let ordered: Vec<String> = workflow.ordered_phase_names().to_vec();
    let progress = infer_completed_phases(working_dir, &ordered);
    let resume_phase = infer_resume_phase(&progress, &ordered);

    let mut opts = opts;
    opts.first_phase = resume_phase;
    let mut state = WorkflowState::create(task, opts);
    state.completed_phases = progress.completed_phases;

    let plan_path = working_dir.join(ARTIFACT_DIR_NAME).join("plan.md");
    if let Some(count) = count_sub_task_headings(&plan_path) {
        state.total_sub_tasks = count;
        state.current_sub_task = 0;
    }

    Ok(state)
}

/// Best-effort normalization applied to any loaded state before use. The
/// per-field type/format repairs (non-array collections, malformed numeric
/// counters, unparseable timestamps) already happened in
/// [`load_state_lenient`]'s JSON-level pass; this stage operates on the
/// typed [`WorkflowState`] and handles what only makes sense once it's
/// built: an unknown `current_phase`, a zeroed `iteration_cap`, stale
/// `completed_phases` entries, and transition-scoped counters. Idempotent:
/// applying it twice yields the same result as applying it once.
pub fn repair_state(mut state: WorkflowState, ordered: &[String]) -> WorkflowState {
    if !ordered.iter().any(|p| p == &state.current_phase) {
        state.current_phase = ordered.first().cloned().unwrap_or_default();
    }

    if state.iteration_cap == 0 {
        state.iteration_cap = 25;
    }

    state.completed_phases.retain(|p| ordered.contains(p));

    state.reset_transition_counters();

    state
}
