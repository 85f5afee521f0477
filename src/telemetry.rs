use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "easyexpense_auth=debug,sqlx=warn";

/// `RUST_LOG` when set, otherwise the crate default.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
    }
}
