//! Worker process entry point: parse configuration, acquire an exclusive cache directory,
//! connect to the broker, install the termination-signal handler, and run the main loop.

use anyhow::Context as _;
use clap::Parser;
use maelstrom_worker::{
    broker::beanstalk::BeanstalkBroker,
    cache_dir::CacheDir,
    config::Config,
    executor::ExecutorDeps,
    fetcher::FetcherConfig,
    logging,
    main_loop::{self, CurrentHandle},
    master_api::HttpMasterApi,
    results_store::HttpResultsStore,
};
use slog::{info, o};
use std::sync::{Arc, Mutex};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let level = logging::parse_level(&config.log_level)?;
    let log = logging::build_logger(level);

    info!(log, "starting"; "broker" => &config.broker, "cache_base" => %config.cache_base.display());

    let cache_dir = CacheDir::acquire(&config.cache_base, config.cache_dir_count)
        .context("acquiring exclusive cache directory")?;
    info!(log, "acquired cache directory"; "path" => %cache_dir.path().display());

    let broker = BeanstalkBroker::connect(&config.broker, "dist-test-tasks")
        .await
        .context("connecting to broker")?;
    let results_store = HttpResultsStore::new(config.results_store.clone());
    let master_api = HttpMasterApi::new(config.master.clone());
    let fetcher_config = FetcherConfig {
        download_tool: config.download_tool.clone(),
        bundle_server_url: config.bundle_server.clone(),
        cache_dir: cache_dir.path().to_path_buf(),
    };

    let current_uid = unsafe { libc::getuid() };
    let deps = ExecutorDeps {
        log: &log,
        fetcher_config: &fetcher_config,
        results_store: &results_store,
        master_api: &master_api,
        container_runner: &config.container_runner,
        current_uid,
    };

    let current_handle: CurrentHandle = Arc::new(Mutex::new(None));
    main_loop::spawn_termination_handler(log.new(o!()), current_handle.clone())
        .context("installing SIGTERM handler")?;

    main_loop::run(&log, &broker, &deps, cache_dir.path(), &current_handle).await
}
