//! Diagnostic output setup.
//!
//! The library only emits `tracing` events; binaries and test harnesses that
//! want them on stderr call [`init_from_env`].

use tracing::level_filters::LevelFilter;

/// Environment variable holding the verbosity level (0-5).
pub const VERBOSITY_ENV: &str = "ESSRMGR_DEBUG";

/// Map a numeric verbosity to a level filter.
///
/// 0 = off, 1 = error, 2 = warn, 3 = info, 4 = debug, 5 and above = trace.
pub fn level_for_verbosity(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Verbosity from [`VERBOSITY_ENV`], defaulting to warnings.
pub fn verbosity_from_env() -> LevelFilter {
    std::env::var(VERBOSITY_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .map(level_for_verbosity)
        .unwrap_or(LevelFilter::WARN)
}

/// Install a stderr `fmt` subscriber at the env-selected level.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_from_env() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(verbosity_from_env())
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}
