//! Task executor (C6).
//!
//! Orchestrates one task end to end: mark it running, fetch its payload, build and run its
//! command, archive its artifacts, report the outcome, and apply retry/cancellation policy on
//! failure.

use crate::{
    archiver, fetcher,
    fetcher::FetcherConfig,
    manifest::IsolatedManifest,
    master_api::{self, MasterApi},
    results_store::ResultsStore,
    retry_cache::RetryCache,
    runner,
    task::{MarkRunning, ReservedTask, Task, TaskOutcome, RESULT_CODE_DOWNLOAD_FAILED},
};
use anyhow::{Context as _, Result};
use slog::{info, o, Logger};
use std::{path::Path, time::Duration};
use tokio::process::Command;

/// Once a job has this many failed tasks, we fast-fail the whole job rather than keep retrying
/// individual tasks into it.
pub const JOB_FAILURE_THRESHOLD: u64 = 100;

pub struct ExecutorDeps<'a> {
    pub log: &'a Logger,
    pub fetcher_config: &'a FetcherConfig,
    pub results_store: &'a dyn ResultsStore,
    pub master_api: &'a dyn MasterApi,
    pub container_runner: &'a str,
    pub current_uid: u32,
}

/// Outcome visible to the caller: did we actually run the task, or did the results store
/// reject the start (e.g. because the job was already canceled)?
pub enum ExecutionResult {
    Ran(TaskOutcome),
    Canceled,
}

/// A failure from [`run_task_body`]. Distinguishes "payload fetch failed" (reported to the
/// results store as `result_code = -2`, per spec) from any other failure, which is genuinely
/// unexpected and should propagate out of [`execute`] so the caller releases the reservation for
/// redelivery rather than reporting a terminal result.
#[derive(thiserror::Error, Debug)]
enum TaskBodyError {
    #[error("payload fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run `reserved.task` to completion. The caller retains ownership of `reserved.handle` and is
/// responsible for `release`/`delete`-ing it; this function only ever calls `touch` on it, via
/// the supervised runner's heartbeat.
pub async fn execute(
    deps: &ExecutorDeps<'_>,
    reserved: &ReservedTask,
    cache_dir: &Path,
    retry_cache: &mut RetryCache,
) -> Result<ExecutionResult> {
    let task = &reserved.task;
    let log = deps.log.new(o!("task_id" => task.task_id.clone()));

    match deps.results_store.mark_running(task).await? {
        MarkRunning::Canceled => {
            info!(log, "task canceled by master before starting");
            return Ok(ExecutionResult::Canceled);
        }
        MarkRunning::Accepted => {}
    }

    let work_dir = tempfile::Builder::new()
        .prefix("dist-test-task-")
        .tempdir_in(cache_dir)
        .context("creating work directory")?;

    let start = std::time::Instant::now();
    let body_result = run_task_body(deps, &log, reserved, work_dir.path()).await;
    let duration_secs = start.elapsed().as_secs_f64();

    let mut outcome = match body_result {
        Ok(outcome) => outcome,
        Err(TaskBodyError::Fetch(message)) => TaskOutcome {
            result_code: RESULT_CODE_DOWNLOAD_FAILED,
            stdout: Vec::new(),
            stderr: message.into_bytes(),
            artifact_archive: None,
            duration_secs: 0.0,
        },
        Err(TaskBodyError::Other(e)) => return Err(e).context("running task"),
    };
    outcome.duration_secs = duration_secs;

    // Don't upload logs from successful runs: a size optimization, and the invariant the
    // results store relies on (§8.3).
    if outcome.result_code == 0 {
        outcome.stdout.clear();
        outcome.stderr.clear();
    }

    deps.results_store
        .mark_finished(task, &outcome)
        .await
        .context("reporting task outcome")?;

    apply_post_failure_policy(deps, &log, task, &outcome, retry_cache).await;

    Ok(ExecutionResult::Ran(outcome))
    // `work_dir` is dropped here, deleting the directory. Any archive buffer lives in
    // `outcome.artifact_archive` independent of the directory and is released when `outcome`
    // (or its caller's copy) is dropped.
}

/// The download-then-run portion of a task. A [`TaskBodyError::Fetch`] here means the payload
/// download itself failed (after retries) and is translated by the caller into
/// `result_code = -2`, per spec step 3; any other error is unexpected and propagates to the
/// caller as-is.
async fn run_task_body(
    deps: &ExecutorDeps<'_>,
    log: &Logger,
    reserved: &ReservedTask,
    work_dir: &Path,
) -> Result<TaskOutcome, TaskBodyError> {
    let task = &reserved.task;

    let manifest = fetcher::fetch_with_retries(
        log,
        deps.fetcher_config,
        reserved.handle.as_ref(),
        &task.bundle_hash,
        work_dir,
    )
    .await
    .map_err(|e| TaskBodyError::Fetch(format!("{e:#}")))?;

    let (command, cwd) = build_command(deps, task, &manifest, work_dir)?;

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    if let Some(cwd) = &cwd {
        cmd.current_dir(cwd);
    }

    let timeout = Duration::from_secs(task.timeout_secs);
    let run_outcome = runner::run(log, cmd, reserved.handle.as_ref(), timeout)
        .await
        .context("running task command")?;

    let artifact_archive =
        archiver::build_archive(log, work_dir, &task.artifact_globs).context("building artifact archive")?;

    Ok(TaskOutcome {
        result_code: run_outcome.result_code,
        stdout: run_outcome.stdout,
        stderr: run_outcome.stderr,
        artifact_archive,
        duration_secs: 0.0,
    })
}

/// Build the argv and working directory for the task, per §4.6 step 4: a bare command when
/// there's no container image, or a `container-runner run ...` wrapper when there is one. In
/// both cases, argv[0] is rewritten to an absolute path if it isn't one already, since
/// downloaded executables aren't on `PATH` and `.` typically isn't either.
fn build_command(
    deps: &ExecutorDeps<'_>,
    task: &Task,
    manifest: &IsolatedManifest,
    work_dir: &Path,
) -> Result<(Vec<String>, Option<std::path::PathBuf>)> {
    let relative_cwd = if manifest.relative_cwd.is_empty() {
        work_dir.to_path_buf()
    } else {
        work_dir.join(&manifest.relative_cwd)
    };

    match &task.container_image {
        None => {
            let mut command = manifest.command.clone();
            ensure_absolute_argv0(&mut command, &relative_cwd);
            Ok((command, Some(relative_cwd)))
        }
        Some(image) => {
            let mut command = manifest.command.clone();
            ensure_absolute_argv0(&mut command, &relative_cwd);

            let container_relcwd = if manifest.relative_cwd.is_empty() {
                "/isolate-dir".to_string()
            } else {
                format!("/isolate-dir/{}", manifest.relative_cwd)
            };

            let mut argv = vec![
                deps.container_runner.to_string(),
                "run".to_string(),
                "--volume".to_string(),
                format!("{}:/isolate-dir", work_dir.display()),
                "--workdir".to_string(),
                container_relcwd,
                "--user".to_string(),
                deps.current_uid.to_string(),
                image.clone(),
            ];
            argv.extend(command);
            Ok((argv, None))
        }
    }
}

fn ensure_absolute_argv0(command: &mut [String], cwd: &Path) {
    if let Some(first) = command.first_mut() {
        if !Path::new(first.as_str()).is_absolute() {
            *first = cwd.join(first.as_str()).display().to_string();
        }
    }
}

/// §4.6 step 10: on a non-zero result, either fast-fail the whole job, or submit a retry.
async fn apply_post_failure_policy(
    deps: &ExecutorDeps<'_>,
    log: &Logger,
    task: &Task,
    outcome: &TaskOutcome,
    retry_cache: &mut RetryCache,
) {
    if outcome.result_code == 0 {
        return;
    }

    let failed_count = match deps.results_store.count_failed_in_job(&task.job_id).await {
        Ok(n) => n,
        Err(e) => {
            slog::warn!(log, "failed to query failed task count, skipping fail-fast check"; "error" => %e);
            0
        }
    };

    if failed_count > JOB_FAILURE_THRESHOLD {
        info!(
            log,
            "job has too many failed tasks, cancelling";
            "job_id" => &task.job_id,
            "failed_count" => failed_count,
        );
        master_api::best_effort(
            log,
            "cancel_job",
            deps.master_api.cancel_job(&task.job_id).await,
        )
        .await;
        return;
    }

    if task.attempt < task.max_retries {
        master_api::best_effort(
            log,
            "retry_task",
            deps.master_api.retry_task(task).await,
        )
        .await;
        retry_cache.put(task.retry_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::fake::FakeHandle,
        master_api::fake::FakeMasterApi,
        results_store::fake::FakeResultsStore,
    };
    use assert_matches::assert_matches;
    use maplit::hashmap;
    use std::sync::{atomic::AtomicBool, atomic::AtomicU32, Arc};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn make_task(overrides: impl FnOnce(&mut Task)) -> Task {
        let mut task = Task {
            task_id: "t1".to_string(),
            job_id: "j1".to_string(),
            retry_id: "r1".to_string(),
            description: "test task".to_string(),
            bundle_hash: "deadbeef".to_string(),
            timeout_secs: 30,
            container_image: None,
            max_retries: 2,
            attempt: 0,
            artifact_globs: vec![],
        };
        overrides(&mut task);
        task
    }

    fn fake_handle() -> FakeHandle {
        FakeHandle {
            released: Arc::new(AtomicBool::new(false)),
            deleted: Arc::new(AtomicBool::new(false)),
            touch_count: Arc::new(AtomicU32::new(0)),
        }
    }

    #[test]
    fn no_container_uses_manifest_command_and_work_dir_cwd() {
        let deps_uid = 1000;
        let task = make_task(|_| {});
        let manifest = IsolatedManifest {
            command: vec!["run.sh".to_string()],
            relative_cwd: "work".to_string(),
        };
        let work_dir = Path::new("/tmp/example");
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: "isolateserver.py".to_string(),
                bundle_server_url: "https://example".to_string(),
                cache_dir: "/tmp".into(),
            },
            results_store: &FakeResultsStore::default(),
            master_api: &FakeMasterApi::default(),
            container_runner: "docker",
            current_uid: deps_uid,
        };
        let (command, cwd) = build_command(&deps, &task, &manifest, work_dir).unwrap();
        assert_eq!(command, vec!["/tmp/example/work/run.sh".to_string()]);
        assert_eq!(cwd, Some(work_dir.join("work")));
    }

    #[test]
    fn container_image_wraps_command() {
        let task = make_task(|t| t.container_image = Some("my-image".to_string()));
        let manifest = IsolatedManifest {
            command: vec!["run.sh".to_string(), "--flag".to_string()],
            relative_cwd: "".to_string(),
        };
        let work_dir = Path::new("/tmp/example");
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: "isolateserver.py".to_string(),
                bundle_server_url: "https://example".to_string(),
                cache_dir: "/tmp".into(),
            },
            results_store: &FakeResultsStore::default(),
            master_api: &FakeMasterApi::default(),
            container_runner: "docker",
            current_uid: 1000,
        };
        let (command, cwd) = build_command(&deps, &task, &manifest, work_dir).unwrap();
        assert!(cwd.is_none());
        assert_eq!(
            command,
            vec![
                "docker".to_string(),
                "run".to_string(),
                "--volume".to_string(),
                "/tmp/example:/isolate-dir".to_string(),
                "--workdir".to_string(),
                "/isolate-dir".to_string(),
                "--user".to_string(),
                "1000".to_string(),
                "my-image".to_string(),
                "/tmp/example/run.sh".to_string(),
                "--flag".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn max_retries_zero_never_submits_retry() {
        let task = make_task(|t| {
            t.max_retries = 0;
            t.attempt = 0;
        });
        let master_api = FakeMasterApi::default();
        let mut results_store = FakeResultsStore::default();
        results_store.failed_counts = hashmap! { task.job_id.clone() => 1 };
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: String::new(),
                bundle_server_url: String::new(),
                cache_dir: "/tmp".into(),
            },
            results_store: &results_store,
            master_api: &master_api,
            container_runner: "docker",
            current_uid: 0,
        };
        let outcome = TaskOutcome {
            result_code: 1,
            stdout: vec![],
            stderr: vec![],
            artifact_archive: None,
            duration_secs: 0.0,
        };
        let mut retry_cache = RetryCache::default();
        apply_post_failure_policy(&deps, &test_logger(), &task, &outcome, &mut retry_cache).await;
        assert!(master_api.retried_tasks.lock().unwrap().is_empty());
        assert!(retry_cache.is_empty());
    }

    #[tokio::test]
    async fn failure_below_threshold_submits_retry_and_updates_anti_affinity() {
        let task = make_task(|_| {});
        let master_api = FakeMasterApi::default();
        let results_store = FakeResultsStore::default();
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: String::new(),
                bundle_server_url: String::new(),
                cache_dir: "/tmp".into(),
            },
            results_store: &results_store,
            master_api: &master_api,
            container_runner: "docker",
            current_uid: 0,
        };
        let outcome = TaskOutcome {
            result_code: 1,
            stdout: vec![],
            stderr: vec![],
            artifact_archive: None,
            duration_secs: 0.0,
        };
        let mut retry_cache = RetryCache::default();
        apply_post_failure_policy(&deps, &test_logger(), &task, &outcome, &mut retry_cache).await;
        assert_eq!(master_api.retried_tasks.lock().unwrap().len(), 1);
        assert!(retry_cache.get(&task.retry_id));
    }

    #[tokio::test]
    async fn job_over_failure_threshold_cancels_instead_of_retrying() {
        let task = make_task(|_| {});
        let master_api = FakeMasterApi::default();
        let mut results_store = FakeResultsStore::default();
        results_store
            .failed_counts
            .insert(task.job_id.clone(), JOB_FAILURE_THRESHOLD + 1);
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: String::new(),
                bundle_server_url: String::new(),
                cache_dir: "/tmp".into(),
            },
            results_store: &results_store,
            master_api: &master_api,
            container_runner: "docker",
            current_uid: 0,
        };
        let outcome = TaskOutcome {
            result_code: 1,
            stdout: vec![],
            stderr: vec![],
            artifact_archive: None,
            duration_secs: 0.0,
        };
        let mut retry_cache = RetryCache::default();
        apply_post_failure_policy(&deps, &test_logger(), &task, &outcome, &mut retry_cache).await;
        assert_eq!(master_api.canceled_jobs.lock().unwrap().as_slice(), [task.job_id.clone()]);
        assert!(master_api.retried_tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_running_canceled_skips_execution() {
        let task = make_task(|_| {});
        let mut results_store = FakeResultsStore::default();
        results_store.canceled_tasks.insert(task.task_id.clone());
        let master_api = FakeMasterApi::default();
        let deps = ExecutorDeps {
            log: &test_logger(),
            fetcher_config: &FetcherConfig {
                download_tool: String::new(),
                bundle_server_url: String::new(),
                cache_dir: "/tmp".into(),
            },
            results_store: &results_store,
            master_api: &master_api,
            container_runner: "docker",
            current_uid: 0,
        };
        let tmp = tempfile::tempdir().unwrap();
        let reserved = ReservedTask {
            task,
            handle: Arc::new(fake_handle()),
        };
        let mut retry_cache = RetryCache::default();
        let result = execute(&deps, &reserved, tmp.path(), &mut retry_cache).await.unwrap();
        assert_matches!(result, ExecutionResult::Canceled);
        assert!(results_store.finished.lock().unwrap().is_empty());
    }
}
