//! Worker configuration, loaded from the command line (with environment variable fallback),
//! in the same `clap`-derive style `maelstrom-run` uses for its own `Config`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "maelstrom-worker")]
pub struct Config {
    /// Address of the queue broker, `host:port`.
    #[arg(long, env = "MAELSTROM_WORKER_BROKER")]
    pub broker: String,

    /// Base URL of the content-addressed bundle server.
    #[arg(long, env = "MAELSTROM_WORKER_BUNDLE_SERVER")]
    pub bundle_server: String,

    /// Path to the external bundle-download tool.
    #[arg(long, env = "MAELSTROM_WORKER_DOWNLOAD_TOOL", default_value = "isolateserver.py")]
    pub download_tool: String,

    /// Path to the container runner used when a task specifies a container image.
    #[arg(long, env = "MAELSTROM_WORKER_CONTAINER_RUNNER", default_value = "docker")]
    pub container_runner: String,

    /// Base URL of the results store.
    #[arg(long, env = "MAELSTROM_WORKER_RESULTS_STORE")]
    pub results_store: String,

    /// Base URL of the master's HTTP API (retry submission, job cancellation).
    #[arg(long, env = "MAELSTROM_WORKER_MASTER")]
    pub master: String,

    /// Base path for this worker's exclusive cache directories; candidates are
    /// `<cache_base>.0`, `<cache_base>.1`, ....
    #[arg(long, env = "MAELSTROM_WORKER_CACHE_BASE")]
    pub cache_base: PathBuf,

    /// Number of candidate cache directories to probe at startup.
    #[arg(long, env = "MAELSTROM_WORKER_CACHE_DIR_COUNT", default_value_t = crate::cache_dir::DEFAULT_CANDIDATE_COUNT)]
    pub cache_dir_count: usize,

    /// Minimum log level to output.
    #[arg(long, env = "MAELSTROM_WORKER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_args() {
        let config = Config::parse_from([
            "maelstrom-worker",
            "--broker=broker.example:11300",
            "--bundle-server=https://bundles.example",
            "--results-store=https://results.example",
            "--master=https://master.example",
            "--cache-base=/var/cache/maelstrom-worker",
        ]);
        assert_eq!(config.cache_dir_count, crate::cache_dir::DEFAULT_CANDIDATE_COUNT);
        assert_eq!(config.download_tool, "isolateserver.py");
    }
}
