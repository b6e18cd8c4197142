use tracing_subscriber::EnvFilter;

/// Initialize tracing with `RUST_LOG`-style filtering, defaulting to info.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
