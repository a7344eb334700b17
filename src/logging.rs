use tracing_subscriber::EnvFilter;

/// Install the process-wide fmt subscriber. `RUST_LOG` overrides `default`.
pub fn init(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second call (tests, or a binary that already installed one) is ignored.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
