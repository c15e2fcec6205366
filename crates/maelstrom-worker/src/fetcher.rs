//! Payload fetcher (C5).
//!
//! Invokes the external bundle-download tool twice per attempt — once to populate the work
//! directory, once to materialize the manifest file itself — retrying the whole sequence up to
//! [`MAX_ATTEMPTS`] times on failure.

use crate::{broker::BrokerHandle, manifest::IsolatedManifest, runner};
use anyhow::{bail, Context as _, Result};
use slog::{info, o, warn, Logger};
use std::{path::Path, time::Duration};
use tokio::process::Command;

/// Number of attempts to download a task's payload before giving up.
pub const MAX_ATTEMPTS: u32 = 3;
/// Timeout applied to each individual download invocation.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
/// Sleep between failed attempts, giving the bundle server a moment before retrying.
pub const RETRY_SLEEP: Duration = Duration::from_secs(5);

const MANIFEST_FILE_NAME: &str = "task.isolated";

/// Configuration needed to invoke the external download tool.
pub struct FetcherConfig {
    pub download_tool: String,
    pub bundle_server_url: String,
    pub cache_dir: std::path::PathBuf,
}

async fn run_download(
    log: &Logger,
    config: &FetcherConfig,
    handle: &dyn BrokerHandle,
    extra_args: &[String],
) -> Result<()> {
    let mut command = Command::new(&config.download_tool);
    command
        .arg("download")
        .arg(format!("--isolate-server={}", config.bundle_server_url))
        .arg(format!("--cache={}", config.cache_dir.display()))
        .arg("--verbose")
        .args(extra_args)
        // Forces isolateserver.py into non-interactive "bot" mode, bypassing any oauth prompt.
        .env("SWARMING_HEADLESS", "1");

    let outcome = runner::run(log, command, handle, DOWNLOAD_TIMEOUT).await?;
    if outcome.result_code != 0 {
        bail!(
            "download tool exited with code {}: {}",
            outcome.result_code,
            String::from_utf8_lossy(&outcome.stderr)
        );
    }
    Ok(())
}

/// Restore write permission to every file under `dir`. Downloaded files are read-only by
/// default, which would prevent the task from writing adjacent outputs.
fn make_tree_writable(dir: &Path) -> Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("reading directory {}", current.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            let mut perms = metadata.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt as _;
                let mode = perms.mode();
                perms.set_mode(mode | 0o200);
            }
            #[cfg(not(unix))]
            {
                perms.set_readonly(false);
            }
            std::fs::set_permissions(&path, perms)?;
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(())
}

async fn fetch_once(
    log: &Logger,
    config: &FetcherConfig,
    handle: &dyn BrokerHandle,
    bundle_hash: &str,
    work_dir: &Path,
) -> Result<IsolatedManifest> {
    info!(log, "downloading files from bundle server");
    run_download(
        log,
        config,
        handle,
        &[
            "-i".to_string(),
            bundle_hash.to_string(),
            "--target".to_string(),
            work_dir.display().to_string(),
        ],
    )
    .await
    .context("failed to download task files")?;

    info!(log, "downloading manifest file from bundle server");
    let manifest_path = work_dir.join(MANIFEST_FILE_NAME);
    run_download(
        log,
        config,
        handle,
        &[
            "-f".to_string(),
            bundle_hash.to_string(),
            manifest_path.display().to_string(),
        ],
    )
    .await
    .context("failed to download task files")?;

    make_tree_writable(work_dir).context("restoring writability of downloaded files")?;

    let contents = std::fs::read(&manifest_path)
        .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
    IsolatedManifest::parse(&contents)
}

/// Fetch `bundle_hash`'s payload into `work_dir`, retrying the whole download+manifest sequence
/// up to [`MAX_ATTEMPTS`] times. Between attempts, `work_dir` is deleted and recreated to purge
/// partial state.
pub async fn fetch_with_retries(
    log: &Logger,
    config: &FetcherConfig,
    handle: &dyn BrokerHandle,
    bundle_hash: &str,
    work_dir: &Path,
) -> Result<IsolatedManifest> {
    let log = log.new(o!("component" => "fetcher"));
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match fetch_once(&log, config, handle, bundle_hash, work_dir).await {
            Ok(manifest) => return Ok(manifest),
            Err(e) => {
                let remaining = MAX_ATTEMPTS - attempt - 1;
                warn!(
                    log,
                    "failed to download task files";
                    "remaining_attempts" => remaining,
                    "error" => %e,
                );
                last_err = Some(e);
                if remaining == 0 {
                    break;
                }
                std::fs::remove_dir_all(work_dir).ok();
                std::fs::create_dir_all(work_dir).context("recreating work dir for retry")?;
                tokio::time::sleep(RETRY_SLEEP).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed with no recorded error")))
}
