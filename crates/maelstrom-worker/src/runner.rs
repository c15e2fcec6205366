//! Supervised runner (C4).
//!
//! Executes a child process, draining stdout/stderr without blocking either stream on the
//! other, touching the broker reservation roughly every [`HEARTBEAT_INTERVAL`], and escalating
//! from a graceful termination signal to a forced kill if the child overruns its timeout.

use crate::broker::BrokerHandle;
use anyhow::{Context as _, Result};
use slog::{info, o, warn, Logger};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt as _, BufReader},
    process::{Child, Command},
    time::Instant,
};

/// How often, at most, the child's stdout/stderr pipes are polled when neither has signaled
/// readiness. This bounds both heartbeat latency and timeout-enforcement latency.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Minimum wall-clock interval between `touch` calls on the broker handle.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Grace period between a graceful termination signal and a forced kill.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// The outcome of running a single child process to completion.
pub struct RunOutcome {
    pub result_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Execute `command` to completion, under `handle`'s heartbeat obligation and `timeout` (zero
/// means no timeout). Always waits for the child to be reaped before returning.
pub async fn run(
    log: &Logger,
    command: Command,
    handle: &dyn BrokerHandle,
    timeout: Duration,
) -> Result<RunOutcome> {
    run_with_grace_period(log, command, handle, timeout, KILL_GRACE_PERIOD).await
}

/// Like [`run`], but with an overridable grace period between graceful termination and a
/// forced kill. Exposed so tests can exercise the escalation path without paying the
/// production [`KILL_GRACE_PERIOD`] in wall-clock time.
pub async fn run_with_grace_period(
    log: &Logger,
    mut command: Command,
    handle: &dyn BrokerHandle,
    timeout: Duration,
    grace_period: Duration,
) -> Result<RunOutcome> {
    let log = log.new(o!("component" => "runner"));
    command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let mut child: Child = command.spawn().context("spawning child process")?;

    let mut stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
    let mut stderr = BufReader::new(child.stderr.take().expect("stderr was piped"));

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let start = Instant::now();
    let mut last_touch = start;
    let kill_term_deadline = (timeout > Duration::ZERO).then(|| start + timeout);
    let mut kill_kill_deadline = None;
    let mut terminated = false;

    let mut read_chunk = vec![0u8; READ_CHUNK_SIZE];

    let exit_status = loop {
        if let Some(status) = child.try_wait().context("polling child status")? {
            break status;
        }

        if !stdout_open && !stderr_open {
            // Both pipes hit EOF but the child hasn't reported exit yet; a short wait avoids a
            // tight poll loop while we wait for `try_wait` to observe the exit.
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        tokio::select! {
            biased;

            result = stdout.read(&mut read_chunk), if stdout_open => {
                match result {
                    Ok(0) => stdout_open = false,
                    Ok(n) => stdout_buf.extend_from_slice(&read_chunk[..n]),
                    Err(e) => {
                        warn!(log, "error reading child stdout"; "error" => %e);
                        stdout_open = false;
                    }
                }
            }
            result = stderr.read(&mut read_chunk), if stderr_open => {
                match result {
                    Ok(0) => stderr_open = false,
                    Ok(n) => stderr_buf.extend_from_slice(&read_chunk[..n]),
                    Err(e) => {
                        warn!(log, "error reading child stderr"; "error" => %e);
                        stderr_open = false;
                    }
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let now = Instant::now();

        if now.duration_since(last_touch) > HEARTBEAT_INTERVAL {
            if let Err(e) = handle.touch().await {
                warn!(log, "failed to touch reservation, ignoring"; "error" => %e);
            }
            last_touch = now;
        }

        if let Some(deadline) = kill_term_deadline {
            if !terminated && now > deadline {
                info!(log, "task timed out, sending graceful termination");
                stderr_buf.extend_from_slice(
                    format!(
                        "\n------\nKilling task after {} seconds\n",
                        timeout.as_secs()
                    )
                    .as_bytes(),
                );
                send_graceful_termination(&child);
                terminated = true;
                kill_kill_deadline = Some(deadline + grace_period);
            }
            if let Some(kill_deadline) = kill_kill_deadline {
                if now > kill_deadline {
                    info!(log, "task did not exit after graceful termination, sending forced kill");
                    let _ = child.start_kill();
                }
            }
        }
    };

    // Drain whatever remains in the pipes after exit, non-blockingly; the child is gone so
    // there's nothing more to wait for.
    let _ = stdout.read_to_end(&mut stdout_buf).await;
    let _ = stderr.read_to_end(&mut stderr_buf).await;

    // Always reap: `try_wait` above already observed the exit, but `wait` ensures the
    // process table entry is released on platforms where the two aren't synonymous.
    let _ = child.wait().await;

    let result_code = exit_status.code().unwrap_or(-1);

    Ok(RunOutcome {
        result_code,
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}

#[cfg(unix)]
fn send_graceful_termination(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a valid, currently-live process id for this child; sending SIGTERM
        // to it is the standard graceful-termination request.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_graceful_termination(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeHandle;
    use std::sync::{atomic::AtomicBool, atomic::AtomicU32, Arc};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn fake_handle() -> (FakeHandle, Arc<AtomicU32>) {
        let touch_count = Arc::new(AtomicU32::new(0));
        (
            FakeHandle {
                released: Arc::new(AtomicBool::new(false)),
                deleted: Arc::new(AtomicBool::new(false)),
                touch_count: touch_count.clone(),
            },
            touch_count,
        )
    }

    #[tokio::test]
    async fn happy_path_captures_output_and_exit_code() {
        let (handle, _) = fake_handle();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let outcome = run(&test_logger(), cmd, &handle, Duration::ZERO).await.unwrap();
        assert_eq!(outcome.result_code, 3);
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&outcome.stderr).trim(), "err");
    }

    #[tokio::test]
    async fn zero_timeout_never_kills() {
        let (handle, _) = fake_handle();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 0.2; exit 0"]);
        let outcome = run(&test_logger(), cmd, &handle, Duration::ZERO).await.unwrap();
        assert_eq!(outcome.result_code, 0);
    }

    #[tokio::test]
    async fn timeout_escalates_to_graceful_termination() {
        let (handle, _) = fake_handle();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap 'exit 7' TERM; sleep 30"]);
        let outcome = run(&test_logger(), cmd, &handle, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(outcome.result_code, 7);
        assert!(String::from_utf8_lossy(&outcome.stderr).contains("Killing task after"));
    }

    #[tokio::test]
    async fn child_ignoring_term_gets_forced_kill() {
        let (handle, _) = fake_handle();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap '' TERM; sleep 30"]);
        let outcome = run_with_grace_period(
            &test_logger(),
            cmd,
            &handle,
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        // Killed by SIGKILL: no exit code, `code()` returns None -> -1 in our mapping.
        assert_eq!(outcome.result_code, -1);
    }

    #[tokio::test]
    async fn child_exiting_within_grace_period_is_not_force_killed() {
        let (handle, _) = fake_handle();
        let mut cmd = Command::new("sh");
        // Catches TERM and exits cleanly well within the grace period.
        cmd.args(["-c", "trap 'exit 0' TERM; sleep 30"]);
        let outcome = run_with_grace_period(
            &test_logger(),
            cmd,
            &handle,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.result_code, 0);
    }
}
