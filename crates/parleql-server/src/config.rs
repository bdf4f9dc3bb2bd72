//! Server configuration: listen address plus the embedded core config.

use serde::Deserialize;

use parleql_core::error::{ParleQLError, Result};
use parleql_core::CoreConfig;

/// Top-level TOML file shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address.
    pub listen: String,
    /// Core pipeline configuration.
    pub core: CoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8088".to_string(),
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, applying core env overrides.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ParleQLError::internal(format!("cannot read config file {path}: {e}"))
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|e| {
            ParleQLError::internal(format!("invalid config file {path}: {e}"))
        })?;
        config.core = config.core.with_env_overrides().validated()?;
        Ok(config)
    }
}
