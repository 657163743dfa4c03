use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing.
///
/// - Stdout: compact, human-readable by default; JSON lines when `LOG_FORMAT=json`
/// - Default level: INFO with debug for this crate, override via RUST_LOG env
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,provider_sync=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(json, "Tracing initialized");
    }
}

/// Shorten a fingerprint for log fields. Full fingerprints stay out of logs.
pub fn short_fp(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
