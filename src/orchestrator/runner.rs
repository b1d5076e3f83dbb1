//! Stream Runner (component D): spawns the child agent, drains its stdout
//! and stderr concurrently, and returns a summary result once both streams
//! have reached EOF and the process has exited.
//!
//! The child is placed in its own process group (`process_group(0)`) so a
//! `SIGTERM` sent to it cannot escape to the parent's group, and so it can
//! be delivered to the whole group in one call if the child itself forked
//! further children. This, along with the shutdown-flag/registry pair
//! below, generalizes the ownership pattern in `SIRHAMY-phase-golem`'s
//! `agent.rs`, which the teacher codebase does not have an equivalent of.

use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::stream::{Emission, process_line};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static TRACKED_CHILDREN: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();

fn tracked_children() -> &'static Mutex<HashSet<i32>> {
    TRACKED_CHILDREN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Set by the signal handler installed in `main`. Checked by the scheduler
/// to decide whether to persist-and-exit between iterations.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Send `SIGTERM` to every process group this runner has spawned. Called on
/// the first `SIGINT`/`SIGTERM`, as part of graceful shutdown, and again
/// from `main` after a halt in case a child outlived its invocation.
pub fn terminate_tracked_children() {
    let pids = tracked_children().lock().unwrap();
    for &pid in pids.iter() {
        let _ = signal::killpg(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

/// Parameters for one child invocation, per the invocation contract.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub cli_path: String,
    pub prompt: String,
    pub max_turns: u32,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub working_dir: std::path::PathBuf,
}

impl RunRequest {
    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(session_id) = &self.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args.push(self.prompt.clone());
        args
    }
}

/// The immutable outcome of one child invocation.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub final_result: Option<String>,
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunResult {
    /// A process that exits non-zero after producing zero output lines.
    pub fn is_crash(&self) -> bool {
        !self.success && self.stdout.is_empty()
    }

    fn spawn_failure(message: String) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stderr: message,
            ..Default::default()
        }
    }
}

/// Seam that lets the scheduler run against a real child process or a
/// fake, matching the `AgentRunner`/`MockAgentRunner` split in
/// `SIRHAMY-phase-golem`'s `agent.rs`.
#[async_trait::async_trait]
pub trait StreamRunner: Send + Sync {
    async fn run(&self, req: &RunRequest, cancel: &CancellationToken) -> RunResult;
}

/// Spawns the real child agent process.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealStreamRunner;

#[async_trait::async_trait]
impl StreamRunner for RealStreamRunner {
    async fn run(&self, req: &RunRequest, cancel: &CancellationToken) -> RunResult {
        run(req, cancel).await
    }
}

/// Spawn the child, drain its streams concurrently, and return once it has
/// exited and both readers have drained EOF. Never propagates its own
/// error to the caller: spawn failures are folded into the result. If
/// `cancel` fires while the child is running, `SIGTERM` is forwarded to its
/// process group immediately rather than waiting for the invocation to
/// finish on its own — this is the suspension point the scheduler's
/// rate-limit/transient countdown doesn't cover.
pub async fn run(req: &RunRequest, cancel: &CancellationToken) -> RunResult {
    if cancel.is_cancelled() {
        return RunResult::spawn_failure("cancelled before spawn".to_string());
    }

    let mut command = Command::new(&req.cli_path);
    command
        .args(req.build_args())
        .current_dir(&req.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return RunResult::spawn_failure(format!("failed to spawn child: {err}")),
    };

    if let Some(pid) = child.id() {
        tracked_children().lock().unwrap().insert(pid as i32);
    }

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut full = String::new();
        let mut emissions = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            full.push_str(&line);
            full.push('\n');
            emissions.extend(process_line(&line));
        }
        (full, emissions)
    });

    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut full = String::new();
        let _ = reader.read_to_string(&mut full).await;
        full
    });

    let drain = async { tokio::join!(stdout_task, stderr_task, child.wait()) };
    tokio::pin!(drain);

    let (stdout_result, stderr_result, exit_status) = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            if let Some(pid) = child.id() {
                let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            drain.await
        }
        result = &mut drain => result,
    };

    if let Some(pid) = child.id() {
        tracked_children().lock().unwrap().remove(&(pid as i32));
    }

    let (stdout, emissions) = stdout_result.unwrap_or_default();
    let stderr = stderr_result.unwrap_or_default();
    let exit_code = match exit_status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };

    let mut result = RunResult {
        success: exit_code == 0,
        exit_code,
        stdout,
        stderr,
        ..Default::default()
    };

    for emission in emissions {
        match emission {
            Emission::FinalResult(text) => result.final_result = Some(text),
            Emission::Text(text) => {
                tracing::trace!(%text, "assistant text");
            }
            Emission::ToolUse(summary) => {
                tracing::debug!(%summary, "tool use");
            }
            Emission::SessionId(id) => result.session_id = Some(id),
            Emission::Tokens { input, output } => {
                result.input_tokens += input;
                result.output_tokens += output;
            }
        }
    }

    result
}

/// Spawn a SIGINT/SIGTERM handler implementing the "first/second SIGINT"
/// rule. On the first signal: set the shutdown flag, forward `SIGTERM` to
/// every tracked child process group, and cancel `cancel` so any in-flight
/// rate-limit/transient wait or child invocation unblocks immediately
/// instead of running to its own completion. A second `SIGINT` received
/// after shutdown was already requested force-exits immediately. Call once
/// from `main`, passing the same `CancellationToken` the scheduler holds.
///
/// Uses a dedicated OS thread blocked on `signal_hook::iterator::Signals`,
/// matching the pattern in `SIRHAMY-phase-golem`'s
/// `agent.rs::install_signal_handlers` (a plain `AtomicBool` flag can't
/// distinguish a second occurrence from a first one still being observed,
/// so this needs the blocking iterator rather than `signal_hook::flag::register`).
pub fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == signal_hook::consts::SIGINT && is_shutdown_requested() {
                terminate_tracked_children();
                std::process::exit(130);
            }
            request_shutdown();
            terminate_tracked_children();
            cancel.cancel();
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_matches_invocation_contract() {
        let req = RunRequest {
            cli_path: "claude".into(),
            prompt: "do the thing".into(),
            max_turns: 50,
            model: Some("sonnet".into()),
            resume_session_id: Some("sess-1".into()),
            working_dir: std::path::PathBuf::from("."),
        };
        let args = req.build_args();
        assert_eq!(
            args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
                "--max-turns",
                "50",
                "--model",
                "sonnet",
                "--resume",
                "sess-1",
                "do the thing",
            ]
        );
    }

    #[test]
    fn build_args_omits_optional_flags() {
        let req = RunRequest {
            cli_path: "claude".into(),
            prompt: "hi".into(),
            max_turns: 10,
            model: None,
            resume_session_id: None,
            working_dir: std::path::PathBuf::from("."),
        };
        let args = req.build_args();
        assert!(!args.iter().any(|a| a == "--model"));
        assert!(!args.iter().any(|a| a == "--resume"));
        assert_eq!(args.last().unwrap(), "hi");
    }

    #[test]
    fn spawn_failure_produces_result_with_exit_code_minus_one() {
        let result = RunResult::spawn_failure("boom".into());
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stderr, "boom");
    }

    #[test]
    fn crash_detection_requires_empty_stdout() {
        let mut result = RunResult::default();
        result.success = false;
        assert!(result.is_crash());
        result.stdout = "some output".into();
        assert!(!result.is_crash());
    }

    #[tokio::test]
    async fn spawning_a_nonexistent_binary_yields_a_result_not_a_panic() {
        let req = RunRequest {
            cli_path: "/no/such/binary-cloudforge-test".into(),
            prompt: "x".into(),
            max_turns: 1,
            model: None,
            resume_session_id: None,
            working_dir: std::path::PathBuf::from("."),
        };
        let result = run(&req, &CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn an_already_cancelled_token_short_circuits_before_spawn() {
        let req = RunRequest {
            cli_path: "/no/such/binary-cloudforge-test".into(),
            prompt: "x".into(),
            max_turns: 1,
            model: None,
            resume_session_id: None,
            working_dir: std::path::PathBuf::from("."),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run(&req, &cancel).await;
        assert!(!result.success);
        assert_eq!(result.stderr, "cancelled before spawn");
    }
}
