//! Logging for the kommandant binary
//!
//! Events go to stderr so `--json` output on stdout stays machine readable.
//! Work done on behalf of a room runs inside [`room_span`], which tags every
//! line with the orchestrator id and room number.

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::OrchestratorConfig;

/// Filter used when `RUST_LOG` is not set
///
/// sqlx logs every statement at info, so it is held at warn unless the
/// requested level is quieter still.
pub fn default_directives(log_level: &str) -> String {
    let sqlx = match log_level {
        "error" => "error",
        _ => "warn",
    };
    format!(
        "{level},kommandant_engine={level},sdk={level},sqlx={sqlx}",
        level = log_level,
        sqlx = sqlx
    )
}

/// Install the process-wide subscriber
///
/// `RUST_LOG` overrides `log_level`. Debug builds print pretty lines, release
/// builds print JSON with the current span attached. Returns false when a
/// subscriber was already installed.
pub fn init_telemetry_with_level(log_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    #[cfg(debug_assertions)]
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .pretty()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();

    #[cfg(not(debug_assertions))]
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr),
        )
        .try_init();

    installed.is_ok()
}

/// Install the subscriber at `info` when no level is configured
pub fn init_telemetry() -> bool {
    init_telemetry_with_level("info")
}

/// Root span for everything one orchestrator does
pub fn room_span(settings: &OrchestratorConfig) -> Span {
    tracing::info_span!(
        "room",
        orchestrator = %settings.orchestrator_id(),
        room = settings.room_id,
    )
}
