//! Status record types produced by the status parser.

use serde::{Deserialize, Serialize};

/// The closed set of outcomes a phase invocation may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusResult {
    Done,
    NeedsRetry,
    Blocked,
    /// Never produced by a well-formed `CLOUDFORGE_STATUS:` block; only by
    /// callers synthesizing a status when the sentinel value is missing or
    /// unrecognized.
    Unknown,
}

impl StatusResult {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "DONE" => StatusResult::Done,
            "NEEDS_RETRY" => StatusResult::NeedsRetry,
            "BLOCKED" => StatusResult::Blocked,
            _ => StatusResult::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusResult::Done => "DONE",
            StatusResult::NeedsRetry => "NEEDS_RETRY",
            StatusResult::Blocked => "BLOCKED",
            StatusResult::Unknown => "UNKNOWN",
        }
    }
}

/// A single iteration's structured status, either parsed from the child's
/// `CLOUDFORGE_STATUS:` block or synthesized by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub phase: Option<String>,
    pub result: StatusResult,
    pub tasks_remaining: Option<u32>,
    pub summary: String,
}

impl Status {
    pub fn synthesize(result: StatusResult, summary: impl Into<String>) -> Self {
        Self {
            phase: None,
            result,
            tasks_remaining: None,
            summary: summary.into(),
        }
    }

    pub(crate) fn from_fields(
        phase: Option<String>,
        result: Option<String>,
        tasks_remaining: Option<String>,
        summary: Option<String>,
    ) -> Self {
        let result = match result {
            Some(r) => StatusResult::parse(&r),
            None => StatusResult::Done,
        };
        let tasks_remaining = tasks_remaining.and_then(|v| v.trim().parse::<u32>().ok());
        Self {
            phase,
            result,
            tasks_remaining,
            summary: summary.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_result_parses_case_insensitively() {
        assert_eq!(StatusResult::parse("done"), StatusResult::Done);
        assert_eq!(StatusResult::parse("Needs_Retry"), StatusResult::NeedsRetry);
        assert_eq!(StatusResult::parse("BLOCKED"), StatusResult::Blocked);
        assert_eq!(StatusResult::parse("garbage"), StatusResult::Unknown);
    }

    #[test]
    fn missing_result_defaults_to_done() {
        let status = Status::from_fields(None, None, None, None);
        assert_eq!(status.result, StatusResult::Done);
    }

    #[test]
    fn non_numeric_tasks_remaining_becomes_none() {
        let status =
            Status::from_fields(None, Some("DONE".into()), Some("lots".into()), None);
        assert_eq!(status.tasks_remaining, None);
    }
}
