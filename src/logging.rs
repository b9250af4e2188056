//! # Structured Logging
//!
//! Environment-aware tracing bootstrap. Uses `try_init` so embedding hosts
//! that already installed a subscriber don't panic.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Level comes from `RUST_LOG` when set, otherwise from the deployment
/// environment (`TASKMANAGER_ENV`): debug in development/test, info in
/// production. Set `TASKMANAGER_LOG_JSON=1` for JSON output.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let default_level = default_level(&environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let json_output = std::env::var("TASKMANAGER_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        let init_result = if json_output {
            registry
                .with(fmt::layer().with_target(true).json())
                .try_init()
        } else {
            registry.with(fmt::layer().with_target(true)).try_init()
        };

        if init_result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(environment = %environment, "Logging initialized");
    });
}

fn get_environment() -> String {
    std::env::var("TASKMANAGER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}
