use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global fmt subscriber, filtered by `RUST_LOG` and defaulting to `debug`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .finish();

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logging: {}", error);
    }
}
