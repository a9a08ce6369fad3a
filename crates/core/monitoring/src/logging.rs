//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing::field::DebugValue;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static REALIZATION_LOG_ENV_VAR: &str = "REALIZATION_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        // A subscriber may already be installed by the embedding process.
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
            .is_ok();

        if installed {
            tracing::info!("log level: {}", log_level);
        }
    });
}

/// List of crates in the workspace.
const WORKSPACE_CRATES: &[&str] = &[
    "metadata_store",
    "monitoring",
    "realization",
    "realization_config",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG, ignoring malformed ones
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    let log_level =
        std::env::var(REALIZATION_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in WORKSPACE_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(_) => {
                // Unknown level names fall back to `info`
                if let Ok(directive) = format!("{crate_name}=info").parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }
    }

    (env_filter, log_level)
}

/// Collects the `source()` chain of an error for structured logging.
///
/// The top-level error is expected to be logged separately (`error = %err`); this only records
/// the causes below it, outermost first.
pub fn error_source(err: &dyn Error) -> DebugValue<Vec<String>> {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    tracing::field::debug(chain)
}
