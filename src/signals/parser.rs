//! Extracts the `CLOUDFORGE_STATUS:` block from a child agent's output.
//!
//! Format: a literal sentinel line `CLOUDFORGE_STATUS:` followed by
//! indented `key: value` lines, terminated by a blank line or end of input.
//! Recognized keys (case-insensitive): `phase`, `result`,
//! `tasks_remaining` (also `tasksremaining`), `summary`.

use std::sync::LazyLock;

use regex::Regex;

use super::types::Status;

static SENTINEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*CLOUDFORGE_STATUS:\s*$").unwrap());

static KV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+([A-Za-z_]+)\s*:\s*(.*?)\s*$").unwrap());

/// Parse the status block out of the child's combined output, if present.
pub fn parse_status(output: &str) -> Option<Status> {
    let sentinel = SENTINEL_RE.find(output)?;
    let rest = &output[sentinel.end()..];

    let mut phase = None;
    let mut result = None;
    let mut tasks_remaining = None;
    let mut summary = None;

    for line in rest.lines() {
        if line.trim().is_empty() {
            break;
        }
        let Some(caps) = KV_RE.captures(line) else {
            break;
        };
        let key = caps[1].to_lowercase();
        let value = caps[2].to_string();
        match key.as_str() {
            "phase" => phase = Some(value),
            "result" => result = Some(value),
            "tasks_remaining" | "tasksremaining" => tasks_remaining = Some(value),
            "summary" => summary = Some(value),
            _ => {}
        }
    }

    Some(Status::from_fields(phase, result, tasks_remaining, summary))
}
