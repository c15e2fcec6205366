//! Logger construction, mirroring `maelstrom_util::log::run_with_logger`'s use of
//! `slog` + `slog-term` + `slog-async`: one logger built once at startup and threaded
//! explicitly through every component, never reassigned.

use slog::{o, Drain};

pub fn build_logger(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, o!())
}

pub fn parse_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse::<slog::Level>()
        .map_err(|_| anyhow::anyhow!("invalid log level {s:?}"))
}
