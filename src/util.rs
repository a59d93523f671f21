use anyhow::Result;
use log::LevelFilter;

/// Initialize logging for binaries and examples. Tests use
/// `env_logger::try_init` directly so repeated calls stay harmless.
pub fn setup_logging(level: LevelFilter) -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()?;

    log::info!(
        "Logging initialized at level {} ({} v{})",
        level,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

/// Current wall-clock time in Unix milliseconds, the canonical timestamp
/// representation across the engine.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
