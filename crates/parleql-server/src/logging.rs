//! Tracing initialization.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins; the default keeps the gateway's own crates at INFO
/// and everything else at WARN.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,parleql_core=info,parleql_server=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
