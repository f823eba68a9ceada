//! Structured logging initialization.
//!
//! Compact by default; `--verbose` switches to a format that includes
//! target/span fields useful when debugging a stuck run.

use std::io::IsTerminal;
use tracing::{Level, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

fn use_color() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Initialize the global tracing subscriber.
///
/// Returns an error rather than panicking so callers (tests, repeated CLI
/// invocations in-process) can tolerate `try_init` failing when a subscriber
/// is already installed.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("forgechain=debug,info")
            } else {
                EnvFilter::try_new("forgechain=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(use_color())
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_ansi(use_color()).compact())
            .try_init()?;
    }

    Ok(())
}

/// Span covering one pipeline stage (A1, A2, A3, B1, …) within one run.
pub fn stage_span(run_id: &str, stage: &str, mode: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "stage_execution",
        run_id = %run_id,
        stage = %stage,
        mode = %mode,
    )
}
