use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;
const DEFAULT_LOG_FORMAT: LogFormat = LogFormat::Json;

/// Installs the global subscriber. Logs go to stderr so CLI output on stdout stays parseable.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_log_level(config, cli_level_override)?;

    let installed = match resolve_log_format(config) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty()
            .try_init(),
    };
    installed.map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let Some(raw_level) = cli_level_override.or_else(|| {
        config
            .logging
            .as_ref()
            .and_then(|logging| logging.level.as_deref())
    }) else {
        return Ok(DEFAULT_LOG_LEVEL);
    };

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(DEFAULT_LOG_FORMAT)
}
