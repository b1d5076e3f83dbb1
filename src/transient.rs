//! Rate-limit and transient-error detection, and the backoff/countdown
//! primitive used to wait between retries.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use regex::Regex;
use tokio_util::sync::CancellationToken;

/// Fixed 30-second buffer added whenever a retry-after was parsed from
/// text, to make sure rate-limit tokens have actually replenished.
pub const RETRY_AFTER_BUFFER_SECS: u64 = 30;

static RATE_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rate.?limit",
        r"429",
        r"too many requests",
        r"overloaded",
        r"capacity",
        r"throttl",
        r"hit\s+(your|the)\s+limit",
        r"you've hit.*limit",
        r"limit.*resets?",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static DURATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)retry.?after\D*(\d+)",
        r"(?i)try again in\s*(\d+)",
        r"(?i)wait\s*(\d+)\s*second",
        r"(?i)(\d+)\s*seconds?\s*(?:before|until)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static ABSOLUTE_RESET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)resets?\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)").unwrap());

static TRANSIENT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\b500\b|internal server error", "HTTP 500 internal server error"),
        (r"(?i)\b502\b|bad gateway", "HTTP 502 bad gateway"),
        (r"(?i)\b503\b|service unavailable", "HTTP 503 service unavailable"),
        (r"(?i)econnreset", "connection reset (ECONNRESET)"),
        (r"(?i)etimedout", "connection timed out (ETIMEDOUT)"),
        (r"(?i)econnrefused", "connection refused (ECONNREFUSED)"),
    ]
    .iter()
    .map(|(p, reason)| (Regex::new(p).unwrap(), *reason))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitDetection {
    pub is_rate_limit: bool,
    pub retry_after_seconds: u64,
}

/// Scan a finished child invocation's output for rate-limit signatures.
pub fn detect_rate_limit(exit_code: i32, stderr: &str, stdout: &str) -> RateLimitDetection {
    let combined = format!("{stderr} {stdout}");
    let matched_combined = RATE_LIMIT_PATTERNS.iter().any(|re| re.is_match(&combined));
    let matched_stdout_only = RATE_LIMIT_PATTERNS.iter().any(|re| re.is_match(stdout));

    let is_rate_limit = (exit_code != 0 && matched_combined) || matched_stdout_only;
    if !is_rate_limit {
        return RateLimitDetection::default();
    }

    RateLimitDetection {
        is_rate_limit: true,
        retry_after_seconds: extract_retry_after(&combined),
    }
}

fn extract_retry_after(text: &str) -> u64 {
    for re in DURATION_PATTERNS.iter() {
        if let Some(caps) = re.captures(text)
            && let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return n;
        }
    }

    if let Some(caps) = ABSOLUTE_RESET_RE.captures(text) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
        let is_pm = caps[3].eq_ignore_ascii_case("pm");
        return seconds_until_next(hour, minute, is_pm).max(1);
    }

    0
}

fn seconds_until_next(hour12: u32, minute: u32, is_pm: bool) -> u64 {
    let hour24 = match (hour12 % 12, is_pm) {
        (0, false) => 0,
        (0, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(hour24, minute, 0).unwrap_or_default();
    let mut target = now.date_naive().and_time(target_time);
    if target <= now.naive_local() {
        target += chrono::Duration::days(1);
    }
    (target - now.naive_local()).num_seconds().max(1) as u64
}

/// `computeBackoff(attempt, maxWait) = min(60 * 2^attempt, maxWait)`, plus
/// the retry-after buffer when the wait came from parsed text.
pub fn compute_backoff(attempt: u32, max_wait_secs: u64, retry_after_from_text: bool) -> u64 {
    let exponential = 60u64.saturating_mul(1u64 << attempt.min(20));
    let base = exponential.min(max_wait_secs);
    if retry_after_from_text {
        base.saturating_add(RETRY_AFTER_BUFFER_SECS)
    } else {
        base
    }
}

/// Only evaluated when `exit_code != 0`. First match wins.
pub fn detect_transient(exit_code: i32, stderr: &str, stdout: &str) -> Option<&'static str> {
    if exit_code == 0 {
        return None;
    }
    let combined = format!("{stderr} {stdout}");
    TRANSIENT_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&combined))
        .map(|(_, reason)| *reason)
}

/// Sleep for `duration`, invoking `on_tick` roughly once per second, unless
/// `cancel` fires first (the global shutdown signal). Returns `true` if the
/// full wait elapsed, `false` if cancelled early.
pub async fn countdown(
    duration: Duration,
    cancel: &CancellationToken,
    mut on_tick: impl FnMut(Duration),
) -> bool {
    let mut remaining = duration;
    let tick = Duration::from_secs(1);
    while remaining > Duration::ZERO {
        let step = remaining.min(tick);
        tokio::select! {
            _ = tokio::time::sleep(step) => {
                remaining -= step;
                on_tick(remaining);
            }
            _ = cancel.cancelled() => return false,
        }
    }
    true
}
