//! Process-wide tracing subscriber.
//!
//! `RUST_LOG` wins when set; otherwise `info,knockly=debug`. Records from
//! the `log` facade used by the protocol crates are bridged in.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,knockly=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per line. Needs the `logs-json` feature.
    Json,
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    let installed = match format {
        #[cfg(feature = "logs-json")]
        LogFormat::Json => builder.json().try_init(),
        #[cfg(not(feature = "logs-json"))]
        LogFormat::Json => {
            eprintln!("knockly: built without `logs-json`, using compact log format");
            builder.compact().try_init()
        }
        LogFormat::Compact => builder.compact().try_init(),
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
