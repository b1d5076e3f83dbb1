//! Circuit Breakers (component F): pure decision functions that tell the
//! scheduler whether to halt. No I/O; every check is a plain function over
//! a borrowed [`WorkflowState`], mirroring the pure-decision-function style
//! (`resolve_transition`, `passes_guardrails`) in `SIRHAMY-phase-golem`'s
//! `executor.rs`.

use crate::orchestrator::state::WorkflowState;

/// Consecutive identical retries at which the breaker trips.
pub const CONSECUTIVE_RETRY_THRESHOLD: u32 = 3;

/// How many trailing `lastErrors` entries must be identical to trip.
const IDENTICAL_ERROR_RUN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTrip {
    pub reason: String,
}

/// Runs the three checks in order; the first one that trips wins.
pub fn check(state: &WorkflowState) -> Option<BreakerTrip> {
    check_iteration_cap(state)
        .or_else(|| check_consecutive_retries(state))
        .or_else(|| check_repeated_identical_errors(state))
}

fn check_iteration_cap(state: &WorkflowState) -> Option<BreakerTrip> {
    if state.iteration >= state.iteration_cap {
        Some(BreakerTrip {
            reason: format!(
                "iteration cap reached ({} >= {})",
                state.iteration, state.iteration_cap
            ),
        })
    } else {
        None
    }
}

fn check_consecutive_retries(state: &WorkflowState) -> Option<BreakerTrip> {
    if state.consecutive_retries >= CONSECUTIVE_RETRY_THRESHOLD {
        Some(BreakerTrip {
            reason: format!(
                "{} consecutive retries (threshold {})",
                state.consecutive_retries, CONSECUTIVE_RETRY_THRESHOLD
            ),
        })
    } else {
        None
    }
}

fn check_repeated_identical_errors(state: &WorkflowState) -> Option<BreakerTrip> {
    if state.last_errors.len() < IDENTICAL_ERROR_RUN {
        return None;
    }
    let tail: Vec<&String> = state
        .last_errors
        .iter()
        .rev()
        .take(IDENTICAL_ERROR_RUN)
        .collect();
    let all_identical = tail.windows(2).all(|pair| pair[0] == pair[1]);
    if all_identical {
        Some(BreakerTrip {
            reason: format!(
                "last {IDENTICAL_ERROR_RUN} errors are identical: {:?}",
                tail[0]
            ),
        })
    } else {
        None
    }
}
