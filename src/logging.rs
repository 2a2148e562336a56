use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Filter used when `RUST_LOG` is unset: our own events at info, sqlx chatter muted.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Installs the global fmt subscriber with an env filter.
///
/// `RUST_LOG` wins when present; otherwise `default_filter` applies. Calling it
/// twice returns an error instead of panicking.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
