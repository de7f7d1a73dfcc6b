use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directives: quiet dependencies, informative crate
const DEFAULT_FILTER: &str = "warn,dgx_manager=info";

/// Initialize logging; `RUST_LOG` overrides the default filter
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

/// Initialize logging at `level` for this crate, warnings for the rest
pub fn init_with_level(level: &str) {
    install(EnvFilter::new(format!("warn,dgx_manager={}", level)));
    tracing::debug!("Logging initialized with level: {}", level);
}

// stdout is reserved for command output
fn install(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}
