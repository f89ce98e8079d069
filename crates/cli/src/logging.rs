//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Directive used when `RUST_LOG` is unset: the `--log-level` flag, else
/// `error` under `--quiet`, else the configured level.
pub(crate) fn default_directive(cli_level: Option<&str>, quiet: bool, config: &LogConfig) -> String {
    if let Some(level) = cli_level.map(str::trim).filter(|level| !level.is_empty()) {
        return level.to_string();
    }
    if quiet {
        return "error".to_string();
    }
    config.level.clone()
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub(crate) fn init(cli_level: Option<&str>, quiet: bool, config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(cli_level, quiet, config)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
