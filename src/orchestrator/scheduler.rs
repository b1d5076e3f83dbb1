//! Phase Scheduler / Main Loop (component H): the sole driver of the state
//! machine. Per iteration: circuit breakers gate, a prompt is rendered,
//! the stream runner is invoked (wrapped by the rate-limit/transient retry
//! loop), the status is parsed, state is updated and persisted, and the
//! next phase is computed from the workflow definition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::breaker;
use crate::orchestrator::runner::{RunRequest, RunResult, StreamRunner};
use crate::orchestrator::state::WorkflowState;
use crate::signals::{parse_status, Status, StatusResult};
use crate::transient;
use crate::workflow::{PhaseConfig, WorkflowDefinition};

/// Cap on rate-limit/transient retry attempts within a single phase
/// invocation, per the per-iteration sequence.
const MAX_WAIT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cli_path: String,
    pub model: Option<String>,
    pub max_turns: u32,
    pub working_dir: PathBuf,
    pub iteration_cap: u32,
    pub max_phase_retries: u32,
    pub rate_limit_wait_secs: u64,
    pub verbose: bool,
}

/// Renders the prompt text for a phase; the template loader and its
/// content live outside this crate's scope.
pub trait PromptProvider: Send + Sync {
    fn render(&self, phase: &str, task: &str, context: &PhaseContext) -> String;
}

#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub sub_task_number: u32,
    pub total_sub_tasks: u32,
    pub working_dir: PathBuf,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// A minimal default: looks up `prompts/<phase>.md` relative to the
/// working directory and substitutes `{{task}}`; falls back to a bare
/// instruction string when no template exists.
#[derive(Debug, Default)]
pub struct DefaultPromptProvider;

impl PromptProvider for DefaultPromptProvider {
    fn render(&self, phase: &str, task: &str, context: &PhaseContext) -> String {
        let template_path = context.working_dir.join("prompts").join(format!("{phase}.md"));
        let template = std::fs::read_to_string(&template_path)
            .unwrap_or_else(|_| format!("Phase {phase}: {{{{task}}}}"));
        template.replace("{{task}}", task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Completed,
    Halted { reason: String },
}

pub struct Scheduler {
    pub workflow: WorkflowDefinition,
    pub runner: Arc<dyn StreamRunner>,
    pub prompts: Arc<dyn PromptProvider>,
    pub config: SchedulerConfig,
    pub cancel: CancellationToken,
}

impl Scheduler {
    pub async fn run(&self, mut state: WorkflowState) -> ExitOutcome {
        loop {
            if let Some(trip) = breaker::check(&state) {
                let _ = state.save(&self.config.working_dir);
                tracing::warn!(reason = %trip.reason, "circuit breaker halted the run");
                return ExitOutcome::Halted { reason: trip.reason };
            }

            if crate::orchestrator::runner::is_shutdown_requested() {
                let _ = state.save(&self.config.working_dir);
                tracing::info!("shutdown requested, persisted state and exiting");
                return ExitOutcome::Halted {
                    reason: "interrupted by signal".to_string(),
                };
            }

            let Some(phase_config) = self.workflow.phase_config(&state.current_phase) else {
                let _ = state.save(&self.config.working_dir);
                return ExitOutcome::Halted {
                    reason: format!("unknown phase '{}'", state.current_phase),
                };
            };

            if self.workflow.first_task_loop_phase() == Some(state.current_phase.as_str())
                && state.phase_retry_count == 0
            {
                state.current_sub_task = (state.current_sub_task + 1).min(state.total_sub_tasks.max(1));
            }

            let context = PhaseContext {
                sub_task_number: state.current_sub_task,
                total_sub_tasks: state.total_sub_tasks,
                working_dir: self.config.working_dir.clone(),
                retry_count: state.phase_retry_count,
                max_retries: self.config.max_phase_retries,
            };

            tracing::info!(
                phase = %state.current_phase,
                iteration = state.iteration + 1,
                sub_task = state.current_sub_task,
                "starting phase"
            );

            let prompt = self.prompts.render(&state.current_phase, &state.task, &context);

            let (run_result, crashed) = self.invoke_with_retries(&state, &prompt).await;

            if crashed {
                let _ = state.save(&self.config.working_dir);
                return ExitOutcome::Halted {
                    reason: "agent crashed with no output".to_string(),
                };
            }
            let Some(run_result) = run_result else {
                let _ = state.save(&self.config.working_dir);
                return ExitOutcome::Halted {
                    reason: "wait budget exhausted waiting on rate limit".to_string(),
                };
            };

            if let Some(session_id) = run_result.session_id.clone() {
                state.session_id = Some(session_id);
            }

            // Status parsing looks only at stdout; the combined stdout+stderr
            // text is reserved for rate-limit/transient detection, which scans
            // both (see `invoke_with_retries`).
            let status = parse_status(&run_result.stdout).unwrap_or_else(|| {
                if run_result.success {
                    Status::synthesize(
                        StatusResult::NeedsRetry,
                        "phase completed without CLOUDFORGE_STATUS block",
                    )
                } else {
                    Status::synthesize(
                        StatusResult::NeedsRetry,
                        "phase crashed without CLOUDFORGE_STATUS block",
                    )
                }
            });

            state.record_iteration(
                &state.current_phase.clone(),
                Some(&status),
                Some((run_result.input_tokens, run_result.output_tokens)),
            );

            let just_finished_planning = status.result == StatusResult::Done
                && crate::recovery::phase_for_artifact("plan.md") == Some(state.current_phase.as_str());
            if just_finished_planning {
                self.maybe_seed_sub_tasks_from_plan(&mut state);
            }

            if status.result == StatusResult::NeedsRetry {
                state.phase_retry_count += 1;
                state.track_retry(Some(status.summary.clone()));
            } else {
                state.phase_retry_count = 0;
            }

            let transition = resolve_transition(
                phase_config,
                status.result,
                state.phase_retry_count,
                self.config.max_phase_retries,
                state.current_sub_task,
                state.total_sub_tasks,
            );

            // A phase only joins `completedPhases` once the run actually
            // moves past it; the phase that resolves straight to the
            // workflow's terminal transition is not recorded; the run
            // ending is the record of its completion.
            if status.result == StatusResult::Done && transition != Transition::Terminal {
                let phase = state.current_phase.clone();
                state.mark_phase_completed(&phase);
            }

            if let Err(err) = state.save(&self.config.working_dir) {
                tracing::warn!(%err, "failed to persist state");
            }

            match transition {
                Transition::Terminal => {
                    tracing::info!("workflow reached terminal phase");
                    return ExitOutcome::Completed;
                }
                Transition::UnknownPhase => {
                    let _ = state.save(&self.config.working_dir);
                    return ExitOutcome::Halted {
                        reason: "transition target is not a known phase".to_string(),
                    };
                }
                Transition::To(next) => {
                    if next != state.current_phase {
                        state.reset_transition_counters();
                    }
                    state.current_phase = next;
                }
            }
        }
    }

    /// Invokes the runner, applying the rate-limit/transient retry loop.
    /// `self.cancel` is threaded into both the countdown waits and the
    /// runner invocation itself, so a shutdown signal interrupts whichever
    /// of the two is in flight rather than only the ones between them.
    /// Returns `(None, false)` when the wait budget is exhausted, and
    /// `(_, true)` when the final attempt was a hard crash.
    async fn invoke_with_retries(
        &self,
        state: &WorkflowState,
        prompt: &str,
    ) -> (Option<RunResult>, bool) {
        let mut attempt = 0u32;
        loop {
            let request = RunRequest {
                cli_path: self.config.cli_path.clone(),
                prompt: prompt.to_string(),
                max_turns: self.config.max_turns,
                model: self.config.model.clone(),
                resume_session_id: state.session_id.clone(),
                working_dir: self.config.working_dir.clone(),
            };

            let result = self.runner.run(&request, &self.cancel).await;

            let rate_limit = transient::detect_rate_limit(
                result.exit_code,
                &result.stderr,
                &result.stdout,
            );
            if rate_limit.is_rate_limit {
                attempt += 1;
                if attempt > MAX_WAIT_ATTEMPTS {
                    return (None, false);
                }
                let wait = if rate_limit.retry_after_seconds > 0 {
                    rate_limit.retry_after_seconds + transient::RETRY_AFTER_BUFFER_SECS
                } else {
                    transient::compute_backoff(attempt, self.config.rate_limit_wait_secs, false)
                };
                tracing::warn!(seconds = wait, attempt, "rate limited, waiting");
                let finished = transient::countdown(
                    Duration::from_secs(wait.min(self.config.rate_limit_wait_secs)),
                    &self.cancel,
                    |_remaining| {},
                )
                .await;
                if !finished {
                    return (None, false);
                }
                continue;
            }

            if let Some(reason) = transient::detect_transient(
                result.exit_code,
                &result.stderr,
                &result.stdout,
            ) {
                attempt += 1;
                if attempt > MAX_WAIT_ATTEMPTS {
                    return (None, false);
                }
                let wait = transient::compute_backoff(attempt, self.config.rate_limit_wait_secs, false);
                tracing::warn!(%reason, seconds = wait, attempt, "transient failure, waiting");
                let finished = transient::countdown(Duration::from_secs(wait), &self.cancel, |_| {}).await;
                if !finished {
                    return (None, false);
                }
                continue;
            }

            let crashed = result.is_crash();
            return (Some(result), crashed);
        }
    }

    fn maybe_seed_sub_tasks_from_plan(&self, state: &mut WorkflowState) {
        let plan_path = self
            .config
            .working_dir
            .join(crate::orchestrator::state::ARTIFACT_DIR_NAME)
            .join("plan.md");
        let Ok(text) = std::fs::read_to_string(&plan_path) else {
            return;
        };
        static SUB_TASK_RE: std::sync::LazyLock<regex::Regex> =
            std::sync::LazyLock::new(|| regex::Regex::new(r"(?m)^##\s+Sub-task\s+(\d+)").unwrap());
        let count = SUB_TASK_RE.find_iter(&text).count() as u32;
        if count > 0 {
            state.total_sub_tasks = count;
            state.current_sub_task = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    To(String),
    Terminal,
    UnknownPhase,
}

/// Pure transition function implementing the §4.8 state-machine table.
fn resolve_transition(
    phase: &PhaseConfig,
    result: StatusResult,
    phase_retry_count: u32,
    max_phase_retries: u32,
    current_sub_task: u32,
    total_sub_tasks: u32,
) -> Transition {
    let done_next_subtask_available =
        phase.transitions.contains_key("done_next_subtask") && current_sub_task < total_sub_tasks;

    let label = match result {
        StatusResult::Done | StatusResult::Blocked => {
            if done_next_subtask_available {
                "done_next_subtask"
            } else {
                "done"
            }
        }
        StatusResult::NeedsRetry => {
            if phase.transitions.contains_key("retry_exhausted")
                && phase_retry_count >= max_phase_retries
            {
                "retry_exhausted"
            } else if phase.transitions.contains_key("done_next_subtask") {
                // Same branch the DONE/BLOCKED arm takes: presence of the key
                // alone routes here, re-deriving whether subtasks remain.
                if done_next_subtask_available {
                    "done_next_subtask"
                } else {
                    "done"
                }
            } else {
                "retry"
            }
        }
        StatusResult::Unknown => "retry",
    };

    match phase.target_for(label) {
        Some(Some(next)) => Transition::To(next.clone()),
        Some(None) => Transition::Terminal,
        None => Transition::UnknownPhase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowDefinition;

    fn linear_workflow() -> WorkflowDefinition {
        WorkflowDefinition::parse(
            "A -> B [done]\n\
             B -> C [done]\n\
             *C -> C [done_next_subtask]\n\
             C -> D [done]\n\
             D -> END [done]\n",
        )
        .unwrap()
    }

    #[test]
    fn done_advances_to_done_target_without_subtasks() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("A").unwrap();
        let t = resolve_transition(phase, StatusResult::Done, 0, 3, 0, 0);
        assert_eq!(t, Transition::To("B".to_string()));
    }

    #[test]
    fn blocked_is_treated_like_done() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("A").unwrap();
        let t = resolve_transition(phase, StatusResult::Blocked, 0, 3, 0, 0);
        assert_eq!(t, Transition::To("B".to_string()));
    }

    #[test]
    fn task_loop_phase_prefers_done_next_subtask_while_tasks_remain() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("C").unwrap();
        let t = resolve_transition(phase, StatusResult::Done, 0, 3, 1, 3);
        assert_eq!(t, Transition::To("C".to_string()));
    }

    #[test]
    fn task_loop_phase_falls_through_to_done_when_subtasks_exhausted() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("C").unwrap();
        let t = resolve_transition(phase, StatusResult::Done, 0, 3, 3, 3);
        assert_eq!(t, Transition::To("D".to_string()));
    }

    #[test]
    fn needs_retry_task_loop_phase_prefers_done_next_subtask_while_tasks_remain() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("C").unwrap();
        let t = resolve_transition(phase, StatusResult::NeedsRetry, 0, 3, 1, 3);
        assert_eq!(t, Transition::To("C".to_string()));
    }

    #[test]
    fn needs_retry_task_loop_phase_falls_through_to_done_when_subtasks_exhausted() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("C").unwrap();
        let t = resolve_transition(phase, StatusResult::NeedsRetry, 0, 3, 3, 3);
        assert_eq!(t, Transition::To("D".to_string()));
    }

    #[test]
    fn needs_retry_below_cap_goes_to_retry_target() {
        let workflow = WorkflowDefinition::parse(
            "B -> C [done]\nB -> B [retry]\nB -> FAIL [retry_exhausted]\nFAIL -> END [done]\nC -> END [done]\n",
        )
        .unwrap();
        let phase = workflow.phase_config("B").unwrap();
        let t = resolve_transition(phase, StatusResult::NeedsRetry, 1, 3, 0, 0);
        assert_eq!(t, Transition::To("B".to_string()));
    }

    #[test]
    fn needs_retry_at_cap_goes_to_retry_exhausted_target() {
        let workflow = WorkflowDefinition::parse(
            "B -> C [done]\nB -> B [retry]\nB -> FAIL [retry_exhausted]\nFAIL -> END [done]\nC -> END [done]\n",
        )
        .unwrap();
        let phase = workflow.phase_config("B").unwrap();
        let t = resolve_transition(phase, StatusResult::NeedsRetry, 3, 3, 0, 0);
        assert_eq!(t, Transition::To("FAIL".to_string()));
    }

    #[test]
    fn terminal_transition_to_end_halts_cleanly() {
        let workflow = linear_workflow();
        let phase = workflow.phase_config("D").unwrap();
        let t = resolve_transition(phase, StatusResult::Done, 0, 3, 0, 0);
        assert_eq!(t, Transition::Terminal);
    }

    #[test]
    fn unknown_result_behaves_like_needs_retry_without_cap_check() {
        let workflow = WorkflowDefinition::parse("B -> B [retry]\nB -> END [done]\n").unwrap();
        let phase = workflow.phase_config("B").unwrap();
        let t = resolve_transition(phase, StatusResult::Unknown, 0, 3, 0, 0);
        assert_eq!(t, Transition::To("B".to_string()));
    }

    #[test]
    fn missing_label_in_transition_table_halts() {
        let workflow = WorkflowDefinition::parse("B -> END [done]\n").unwrap();
        let phase = workflow.phase_config("B").unwrap();
        let t = resolve_transition(phase, StatusResult::NeedsRetry, 0, 3, 0, 0);
        assert_eq!(t, Transition::UnknownPhase);
    }
}

/// End-to-end scheduler scenarios, run against a fake [`StreamRunner`] so
/// no real child process is spawned. Mirrors the `AgentRunner`/
/// `MockAgentRunner` split in `SIRHAMY-phase-golem`'s `agent.rs`.
#[cfg(test)]
mod end_to_end_tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;
    use crate::orchestrator::state::NewStateOptions;
    use crate::workflow::WorkflowDefinition;

    struct MockStreamRunner {
        responses: Mutex<VecDeque<RunResult>>,
    }

    impl MockStreamRunner {
        fn new(responses: Vec<RunResult>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamRunner for MockStreamRunner {
        async fn run(&self, _req: &RunRequest, _cancel: &CancellationToken) -> RunResult {
            self.responses.lock().unwrap().pop_front().unwrap_or_default()
        }
    }

    struct StaticPromptProvider;

    impl PromptProvider for StaticPromptProvider {
        fn render(&self, _phase: &str, _task: &str, _context: &PhaseContext) -> String {
            "do the thing".to_string()
        }
    }

    fn done(summary: &str) -> RunResult {
        RunResult {
            success: true,
            exit_code: 0,
            stdout: format!("CLOUDFORGE_STATUS:\n  result: done\n  summary: {summary}\n"),
            ..Default::default()
        }
    }

    fn needs_retry(summary: &str) -> RunResult {
        RunResult {
            success: true,
            exit_code: 0,
            stdout: format!("CLOUDFORGE_STATUS:\n  result: needs_retry\n  summary: {summary}\n"),
            ..Default::default()
        }
    }

    fn rate_limited_short_wait() -> RunResult {
        RunResult {
            success: false,
            exit_code: 1,
            stderr: "429 too many requests, retry-after 1".to_string(),
            ..Default::default()
        }
    }

    fn crash_no_output() -> RunResult {
        RunResult {
            success: false,
            exit_code: 1,
            ..Default::default()
        }
    }

    fn test_scheduler(workflow: WorkflowDefinition, runner: MockStreamRunner, working_dir: &std::path::Path) -> Scheduler {
        Scheduler {
            workflow,
            runner: Arc::new(runner),
            prompts: Arc::new(StaticPromptProvider),
            config: SchedulerConfig {
                cli_path: "unused".to_string(),
                model: None,
                max_turns: 10,
                working_dir: working_dir.to_path_buf(),
                iteration_cap: 25,
                max_phase_retries: 3,
                rate_limit_wait_secs: 600,
                verbose: false,
            },
            cancel: CancellationToken::new(),
        }
    }

    fn fresh_state(first_phase: &str) -> WorkflowState {
        WorkflowState::create(
            "do the task",
            NewStateOptions {
                iteration_cap: 25,
                max_phase_retries: 3,
                model: None,
                first_phase: first_phase.to_string(),
            },
        )
    }

    fn five_phase_workflow() -> WorkflowDefinition {
        WorkflowDefinition::parse(
            "A -> B [done]\n\
             B -> C [done]\n\
             *C -> C [done_next_subtask]\n\
             C -> D [done]\n\
             D -> E [done]\n\
             E -> END [done]\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn scenario_1_happy_path_single_sub_task() {
        let dir = tempdir().unwrap();
        let runner = MockStreamRunner::new(vec![
            done("a"),
            done("b"),
            done("c"),
            done("d"),
            done("e"),
        ]);
        let scheduler = test_scheduler(five_phase_workflow(), runner, dir.path());
        let outcome = scheduler.run(fresh_state("A")).await;
        assert_eq!(outcome, ExitOutcome::Completed);

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.iteration, 5);
        assert_eq!(
            state.completed_phases,
            vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()]
        );
    }

    #[tokio::test]
    async fn scenario_2_retry_then_succeed() {
        let dir = tempdir().unwrap();
        let workflow =
            WorkflowDefinition::parse("B -> C [done]\nB -> B [retry]\nC -> END [done]\n").unwrap();
        let runner = MockStreamRunner::new(vec![
            needs_retry("not ready"),
            needs_retry("still not ready"),
            done("ready"),
            done("c done"),
        ]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("B")).await;
        assert_eq!(outcome, ExitOutcome::Completed);

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        // 2 retries + 1 success in B, plus 1 invocation of C before it
        // resolves to the terminal transition.
        assert_eq!(state.iteration, 4);
        assert!(state.completed_phases.contains(&"B".to_string()));
    }

    #[tokio::test]
    async fn scenario_3_circuit_breaker_consecutive_retries_halts() {
        let dir = tempdir().unwrap();
        let workflow = WorkflowDefinition::parse("B -> B [retry]\nB -> END [done]\n").unwrap();
        let runner = MockStreamRunner::new(vec![
            needs_retry("same error"),
            needs_retry("same error"),
            needs_retry("same error"),
            needs_retry("same error"),
        ]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("B")).await;

        match outcome {
            ExitOutcome::Halted { reason } => assert!(reason.contains("consecutive retries")),
            ExitOutcome::Completed => panic!("expected the breaker to halt the run"),
        }

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert!(state.consecutive_retries >= breaker::CONSECUTIVE_RETRY_THRESHOLD);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_4_rate_limit_waits_then_succeeds_without_counting_the_wait() {
        // Uses a numeric `retry-after` rather than the absolute-reset-time
        // text; paused tokio time auto-advances through the countdown, so
        // the 30s buffer doesn't make this test slow. The absolute-reset-time
        // -> seconds conversion itself is covered by
        // `transient::absolute_reset_time_is_in_valid_range`.
        let dir = tempdir().unwrap();
        let workflow = WorkflowDefinition::parse("B -> END [done]\n").unwrap();
        let runner = MockStreamRunner::new(vec![rate_limited_short_wait(), done("ok")]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("B")).await;
        assert_eq!(outcome, ExitOutcome::Completed);

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.iteration, 1);
    }

    #[tokio::test]
    async fn scenario_6_missing_status_block_synthesizes_needs_retry() {
        let dir = tempdir().unwrap();
        let workflow =
            WorkflowDefinition::parse("B -> C [done]\nB -> B [retry]\nC -> END [done]\n").unwrap();
        let runner = MockStreamRunner::new(vec![
            RunResult {
                success: true,
                exit_code: 0,
                stdout: "did some work, forgot the status block".to_string(),
                ..Default::default()
            },
            done("ok"),
            done("c done"),
        ]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("B")).await;
        assert_eq!(outcome, ExitOutcome::Completed);

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.history[0].result, StatusResult::NeedsRetry);
        assert!(state.history[0].summary.contains("without CLOUDFORGE_STATUS"));
    }

    #[tokio::test]
    async fn plan_seeding_only_fires_on_the_planning_phase_not_every_done_phase() {
        // Regression: re-reading plan.md on every DONE result (rather than
        // only the phase that produced it) would reset `current_sub_task` to
        // 0 on each pass through the task loop, so it could never exhaust.
        let dir = tempdir().unwrap();
        let cf = dir.path().join(".cloudforge");
        std::fs::create_dir_all(&cf).unwrap();
        std::fs::write(cf.join("plan.md"), "## Sub-task 1: x\n## Sub-task 2: y\n").unwrap();

        let workflow = WorkflowDefinition::parse(
            "PLAN -> C [done]\n\
             *C -> C [done_next_subtask]\n\
             C -> END [done]\n",
        )
        .unwrap();
        let runner = MockStreamRunner::new(vec![done("planned"), done("c1"), done("c2")]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("PLAN")).await;
        assert_eq!(outcome, ExitOutcome::Completed);

        let state = WorkflowState::load(dir.path()).unwrap().unwrap();
        assert_eq!(state.iteration, 3);
    }

    #[tokio::test]
    async fn crash_with_no_output_halts_the_run() {
        let dir = tempdir().unwrap();
        let workflow = WorkflowDefinition::parse("B -> END [done]\n").unwrap();
        let runner = MockStreamRunner::new(vec![crash_no_output()]);
        let scheduler = test_scheduler(workflow, runner, dir.path());
        let outcome = scheduler.run(fresh_state("B")).await;

        match outcome {
            ExitOutcome::Halted { reason } => assert!(reason.contains("crashed")),
            ExitOutcome::Completed => panic!("expected a crash halt"),
        }
    }
}
