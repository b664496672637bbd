use tracing_subscriber::EnvFilter;

/// Environment variable the acquisition agents use for their log level.
const LEVEL_VAR: &str = "LOGLEVEL";

/// `RUST_LOG`, then `LOGLEVEL`, then `info`.
fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LEVEL_VAR))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr so that command output on stdout stays machine-readable.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr).init();
}
