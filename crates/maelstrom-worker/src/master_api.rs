//! Thin client for the master's HTTP endpoints used for job-cancellation and retry submission.

use crate::task::Task;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use slog::{warn, Logger};

#[async_trait]
pub trait MasterApi: Send + Sync {
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
    async fn retry_task(&self, task: &Task) -> Result<()>;
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

pub struct HttpMasterApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMasterApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MasterApi for HttpMasterApi {
    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/cancel_job", self.base_url);
        let resp: StatusResponse = self
            .client
            .get(&url)
            .query(&[("job_id", job_id)])
            .send()
            .await
            .context("sending cancel_job")?
            .json()
            .await
            .context("parsing cancel_job response")?;
        anyhow::ensure!(resp.status == "SUCCESS", "cancel_job returned status {}", resp.status);
        Ok(())
    }

    async fn retry_task(&self, task: &Task) -> Result<()> {
        let task_json = serde_json::to_string(task).context("serializing task for retry")?;
        let url = format!("{}/retry_task", self.base_url);
        let body = serde_urlencoded::to_string([("task_json", task_json)])
            .context("encoding retry_task form body")?;
        let resp: StatusResponse = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .context("sending retry_task")?
            .json()
            .await
            .context("parsing retry_task response")?;
        anyhow::ensure!(resp.status == "SUCCESS", "retry_task returned status {}", resp.status);
        Ok(())
    }
}

/// Calls `f` and logs (but does not propagate) any error — master HTTP submissions are
/// best-effort per §7: a failure here is reported to the log and the task loop continues.
pub async fn best_effort(log: &Logger, what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(log, "master HTTP submission failed, continuing"; "what" => what, "error" => %e);
    }
}
