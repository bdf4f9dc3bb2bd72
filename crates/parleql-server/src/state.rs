//! Shared application state.

use std::sync::Arc;

use parleql_core::Core;

/// One composition root per process, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// The assembled pipeline core.
    pub core: Arc<Core>,
}

impl AppState {
    /// Wrap a core.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }
}
