//! The core data model: [`Task`], its reservation handle, and the outcome of running it.

use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// One unit of work, as delivered by the broker. Immutable for the duration of a single
/// attempt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub job_id: String,
    /// Shared across every attempt of the same logical task. Used for retry anti-affinity.
    pub retry_id: String,
    pub description: String,
    pub bundle_hash: String,
    pub timeout_secs: u64,
    pub container_image: Option<String>,
    pub max_retries: u32,
    pub attempt: u32,
    pub artifact_globs: Vec<String>,
}

/// Whether the results store accepted a `mark_running` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkRunning {
    Accepted,
    Canceled,
}

/// The result of running a task to completion, ready to hand to the results store.
#[derive(Clone)]
pub struct TaskOutcome {
    pub result_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub artifact_archive: Option<Vec<u8>>,
    pub duration_secs: f64,
}

impl fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOutcome")
            .field("result_code", &self.result_code)
            .field("stdout_len", &self.stdout.len())
            .field("stderr_len", &self.stderr.len())
            .field("artifact_archive_len", &self.artifact_archive.as_ref().map(Vec::len))
            .field("duration_secs", &self.duration_secs)
            .finish()
    }
}

/// Sentinel `result_code` for "payload download failed after all retries". Any non-negative
/// value is a genuine child process exit status.
pub const RESULT_CODE_DOWNLOAD_FAILED: i32 = -2;

/// A [`Task`] paired with a broker handle. Exactly one of `release` or `delete` should be called
/// on the handle before the task is considered done; both are idempotent, so the handle is an
/// `Arc` shared with the termination-signal handler rather than a uniquely-owned box — a race
/// between the main loop's own cleanup and a concurrent `SIGTERM` is resolved by that
/// idempotency instead of by exclusive ownership.
pub struct ReservedTask {
    pub task: Task,
    pub handle: Arc<dyn crate::broker::BrokerHandle>,
}

impl fmt::Debug for ReservedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedTask").field("task", &self.task).finish()
    }
}
