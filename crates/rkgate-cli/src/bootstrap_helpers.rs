use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `--log-level`. Output goes to stderr so the stdio
/// transport keeps stdout to itself.
pub(crate) fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
