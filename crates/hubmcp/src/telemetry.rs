use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Selects JSON log lines instead of the human-readable format
pub const LOG_FORMAT_VAR: &str = "HUBMCP_LOG_FORMAT";

/// Install the global subscriber. Filter comes from `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are ignored, which keeps tests that
/// each initialise logging from panicking.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_file(true).with_line_number(true))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
}
