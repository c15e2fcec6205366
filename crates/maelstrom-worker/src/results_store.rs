//! The results store client. Out of scope for this crate beyond the small API it exposes:
//! `mark_running`, `mark_finished`, `count_failed_in_job`.

use crate::task::{MarkRunning, Task, TaskOutcome};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait ResultsStore: Send + Sync {
    async fn mark_running(&self, task: &Task) -> Result<MarkRunning>;
    async fn mark_finished(&self, task: &Task, outcome: &TaskOutcome) -> Result<()>;
    async fn count_failed_in_job(&self, job_id: &str) -> Result<u64>;
}

/// HTTP-backed results store, speaking a small JSON API over `reqwest`.
pub struct HttpResultsStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpResultsStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct MarkRunningRequest<'a> {
    task_id: &'a str,
}

#[derive(Deserialize)]
struct MarkRunningResponse {
    accepted: bool,
}

#[derive(Serialize)]
struct MarkFinishedRequest<'a> {
    task_id: &'a str,
    result_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<&'a [u8]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<&'a [u8]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_archive: Option<&'a [u8]>,
    duration_secs: f64,
}

#[derive(Deserialize)]
struct CountFailedResponse {
    count: u64,
}

#[async_trait]
impl ResultsStore for HttpResultsStore {
    async fn mark_running(&self, task: &Task) -> Result<MarkRunning> {
        let resp: MarkRunningResponse = self
            .client
            .post(format!("{}/mark_running", self.base_url))
            .json(&MarkRunningRequest {
                task_id: &task.task_id,
            })
            .send()
            .await
            .context("sending mark_running")?
            .error_for_status()
            .context("mark_running returned an error status")?
            .json()
            .await
            .context("parsing mark_running response")?;
        Ok(if resp.accepted {
            MarkRunning::Accepted
        } else {
            MarkRunning::Canceled
        })
    }

    async fn mark_finished(&self, task: &Task, outcome: &TaskOutcome) -> Result<()> {
        // On success, stdout/stderr are discarded before reporting, to save storage. The
        // executor already enforces this (invariant: result_code == 0 implies empty captures),
        // but we defend here too since this is the last point before the network call.
        let (stdout, stderr) = if outcome.result_code == 0 {
            (None, None)
        } else {
            (Some(outcome.stdout.as_slice()), Some(outcome.stderr.as_slice()))
        };
        self.client
            .post(format!("{}/mark_finished", self.base_url))
            .json(&MarkFinishedRequest {
                task_id: &task.task_id,
                result_code: outcome.result_code,
                stdout,
                stderr,
                artifact_archive: outcome.artifact_archive.as_deref(),
                duration_secs: outcome.duration_secs,
            })
            .send()
            .await
            .context("sending mark_finished")?
            .error_for_status()
            .context("mark_finished returned an error status")?;
        Ok(())
    }

    async fn count_failed_in_job(&self, job_id: &str) -> Result<u64> {
        let resp: CountFailedResponse = self
            .client
            .get(format!("{}/count_failed", self.base_url))
            .query(&[("job_id", job_id)])
            .send()
            .await
            .context("sending count_failed_in_job")?
            .error_for_status()
            .context("count_failed_in_job returned an error status")?
            .json()
            .await
            .context("parsing count_failed_in_job response")?;
        Ok(resp.count)
    }
}
