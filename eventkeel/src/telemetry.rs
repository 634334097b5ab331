//! Tracing bootstrap for binaries embedding the library.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `eventkeel=debug,info`.
pub const LOG_ENV_VAR: &str = "EVENTKEEL_LOG";

/// Environment variable selecting the output format: `json` or `text`.
pub const LOG_FORMAT_ENV_VAR: &str = "EVENTKEEL_LOG_FORMAT";

/// Installs the global tracing subscriber.
///
/// The filter is read from `EVENTKEEL_LOG` and defaults to `info`.
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV_VAR).is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}
