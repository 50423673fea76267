use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DRIVEMIRROR_LOG";
const DEFAULT_FILTER: &str = "info";

/// Picks the first usable directive string: `DRIVEMIRROR_LOG`, then `RUST_LOG`.
fn build_filter(own: Option<String>, rust_log: Option<String>) -> EnvFilter {
    [own, rust_log]
        .into_iter()
        .flatten()
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the stderr subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = build_filter(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
