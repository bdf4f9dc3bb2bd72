//! ParleQL server binary.
//!
//! Wires the composition root with the configured collaborators and
//! serves the HTTP/SSE surface. Without an LLM provider configured the
//! server still answers conversational and metadata questions; data
//! queries fail with `llm_unavailable` until a provider is wired in
//! deployment.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use parleql_core::Core;
use parleql_server::{logging, router, AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "parleql-server", about = "Natural-language-to-SQL gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "PARLEQL_CONFIG")]
    config: Option<String>,

    /// Bind address override.
    #[arg(long, env = "PARLEQL_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => {
            warn!("no config file given; using defaults with dev mode enabled");
            let mut config = ServerConfig::default();
            config.core.dev_mode = true;
            config
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let core = Core::builder(config.core.clone()).build();
    let state = AppState::new(Arc::new(core));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, version = parleql_core::VERSION, "parleql-server started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
