//! Main loop and signal handler (C7).
//!
//! Perpetually reserves a task from the broker, bounces self-originated retries back to the
//! queue, and otherwise hands the task to the executor. On `SIGTERM`, releases whatever
//! reservation is currently held and exits immediately.

use crate::{
    broker::{Broker, BrokerHandle},
    executor::{execute, ExecutionResult, ExecutorDeps},
    retry_cache::RetryCache,
    task::ReservedTask,
};
use slog::{info, warn, Logger};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Sleep issued after a transient reservation failure before trying again.
const RESERVE_RETRY_SLEEP: Duration = Duration::from_secs(1);
/// Sleep issued after bouncing a self-originated retry, giving another worker a chance to pick
/// it up first.
const ANTI_AFFINITY_BOUNCE_SLEEP: Duration = Duration::from_secs(5);

/// Holds the currently-reserved task's handle so the termination-signal handler can release it.
/// `None` between tasks. The handle is an `Arc`, so both this loop and the signal handler can
/// hold a reference to the same underlying reservation; `release`/`delete` being idempotent
/// (see [`crate::broker::BrokerHandle`]) means it's harmless if both end up calling it.
pub type CurrentHandle = Arc<Mutex<Option<Arc<dyn BrokerHandle>>>>;

/// Runs the reserve -> dispatch -> delete loop forever (until the process is asked to exit via
/// the termination handler installed by [`spawn_termination_handler`], which calls
/// `std::process::exit` directly and so never returns control here).
pub async fn run(
    log: &Logger,
    broker: &dyn Broker,
    deps: &ExecutorDeps<'_>,
    cache_dir: &Path,
    current_handle: &CurrentHandle,
) -> anyhow::Result<()> {
    let mut retry_cache = RetryCache::default();

    loop {
        info!(log, "waiting for next task");
        let reserved = match broker.reserve().await {
            Ok(reserved) => reserved,
            Err(e) => {
                warn!(log, "failed to reserve task, retrying"; "error" => %e);
                tokio::time::sleep(RESERVE_RETRY_SLEEP).await;
                continue;
            }
        };

        if retry_cache.get(&reserved.task.retry_id) {
            info!(
                log,
                "got a retry task submitted by this worker, releasing and sleeping";
                "retry_id" => &reserved.task.retry_id,
                "sleep_secs" => ANTI_AFFINITY_BOUNCE_SLEEP.as_secs(),
            );
            reserved.handle.release().await.ok();
            tokio::time::sleep(ANTI_AFFINITY_BOUNCE_SLEEP).await;
            continue;
        }

        info!(log, "got task"; "task_id" => &reserved.task.task_id, "description" => &reserved.task.description);

        let ReservedTask { task, handle } = reserved;
        *current_handle.lock().unwrap() = Some(handle.clone());
        let reserved = ReservedTask { task, handle };

        let result = execute(deps, &reserved, cache_dir, &mut retry_cache).await;

        // Clear before the final delete/release: once cleared, a concurrent SIGTERM sees no
        // handle to release and simply exits, since by this point we're about to finalize the
        // reservation ourselves.
        *current_handle.lock().unwrap() = None;

        match result {
            Ok(ExecutionResult::Ran(_)) | Ok(ExecutionResult::Canceled) => {
                if let Err(e) = reserved.handle.delete().await {
                    warn!(log, "failed to delete broker reservation"; "error" => %e);
                }
            }
            Err(e) => {
                warn!(log, "task execution failed unexpectedly, releasing reservation"; "error" => %e);
                reserved.handle.release().await.ok();
            }
        }
    }
}

/// Install the `SIGTERM` handler. Runs as a normal async task on the runtime (not a raw signal
/// context), so it's safe to do full async work here: release the in-flight reservation if one
/// is held, then exit the process immediately without running further cleanup — the work
/// directory is disposable and the broker will redeliver after its own timeout.
pub fn spawn_termination_handler(log: Logger, current_handle: CurrentHandle) -> anyhow::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        term.recv().await;
        warn!(log, "caught SIGTERM, shutting down");
        let held = current_handle.lock().unwrap().clone();
        if let Some(handle) = held {
            warn!(log, "releasing held reservation");
            let _ = handle.release().await;
        }
        std::process::exit(0);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::fake::FakeBroker, task::Task};
    use slog::o;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn make_task(retry_id: &str) -> Task {
        Task {
            task_id: format!("t-{retry_id}"),
            job_id: "j1".to_string(),
            retry_id: retry_id.to_string(),
            description: "test".to_string(),
            bundle_hash: "hash".to_string(),
            timeout_secs: 5,
            container_image: None,
            max_retries: 0,
            attempt: 0,
            artifact_globs: vec![],
        }
    }

    #[tokio::test]
    async fn anti_affinity_bounce_releases_without_marking_running() {
        let mut retry_cache = RetryCache::default();
        retry_cache.put("bounced-retry");

        let task = make_task("bounced-retry");
        let (broker, _tx) = FakeBroker::new(vec![task]);
        let reserved = broker.reserve().await.unwrap();

        assert!(retry_cache.get(&reserved.task.retry_id));
        // The real main loop would now release and sleep; we only assert the cache signal here,
        // since `run()`'s loop is infinite and exercised at a higher level by the executor
        // tests. Releasing is exercised directly:
        reserved.handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn current_handle_cleared_after_successful_delete() {
        let task = make_task("r1");
        let (broker, _tx) = FakeBroker::new(vec![task]);
        let reserved = broker.reserve().await.unwrap();

        let current_handle: CurrentHandle = Arc::new(Mutex::new(None));
        *current_handle.lock().unwrap() = Some(reserved.handle.clone());
        assert!(current_handle.lock().unwrap().is_some());

        reserved.handle.delete().await.unwrap();
        *current_handle.lock().unwrap() = None;
        assert!(current_handle.lock().unwrap().is_none());
        let _ = test_logger();
    }
}
